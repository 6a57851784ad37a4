//! Drives a [`Visualizer`] from one thread.
//!
//! Two re-armed timers feed a single `select!` loop: the redraw check runs at
//! display-refresh cadence and only renders once the redraw interval has
//! elapsed; the poll check runs at the poll interval and dispatches a fetch
//! to the [`PollWorker`]. Poll outcomes, debounced resizes and stop requests
//! arrive on the same loop, so no two actions ever overlap.

use crate::config::{Config, ConfigHandle, ConfigPatch};
use crate::feed::{FeedError, FeedTransport, PollOutcome, PollWorker};
use crate::surface::RenderSurface;
use crate::visualizer::Visualizer;
use crossbeam_channel::{after, never, select, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// ─── Gates ──────────────────────────────────────────────────────────────────

/// Elapsed-time gate. The first check always fires.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gate {
    last: Option<Instant>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True (and re-arms) when at least `interval` has passed since the last
    /// time this returned true.
    pub fn due(&mut self, now: Instant, interval: Duration) -> bool {
        let ready = match self.last {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= interval,
        };
        if ready {
            self.last = Some(now);
        }
        ready
    }
}

/// Collapses a burst of resize requests into the last one.
#[derive(Debug, Default)]
pub struct ResizeDebouncer {
    pending: Option<(usize, usize)>,
    requested_at: Option<Instant>,
}

impl ResizeDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&mut self, width: usize, height: usize, now: Instant) {
        self.pending = Some((width, height));
        self.requested_at = Some(now);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The latest size, once `debounce` has passed with no newer request.
    pub fn take_due(&mut self, now: Instant, debounce: Duration) -> Option<(usize, usize)> {
        let at = self.requested_at?;
        if now.saturating_duration_since(at) < debounce {
            return None;
        }
        self.requested_at = None;
        self.pending.take()
    }

    /// Time left until the pending request settles.
    pub fn remaining(&self, now: Instant, debounce: Duration) -> Option<Duration> {
        self.requested_at
            .map(|at| debounce.saturating_sub(now.saturating_duration_since(at)))
    }
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

enum HostEvent {
    Resize(usize, usize),
    Stop,
}

pub struct Scheduler {
    viz: Visualizer,
    worker: Option<PollWorker>,
    host_rx: Receiver<HostEvent>,
    frame_txs: Vec<Sender<Arc<RenderSurface>>>,
    redraw_gate: Gate,
    poll_gate: Gate,
    debouncer: ResizeDebouncer,
    redraws: u64,
}

impl Scheduler {
    /// Move `viz` onto a new scheduler thread. With no transport the feed is
    /// never polled. Composed frames go to every `frame_txs` consumer that
    /// keeps up; a lagging consumer misses frames.
    pub fn spawn(
        viz: Visualizer,
        transport: Option<Box<dyn FeedTransport>>,
        frame_txs: Vec<Sender<Arc<RenderSurface>>>,
    ) -> std::io::Result<SchedulerHandle> {
        let config = viz.config_handle().clone();
        let (host_tx, host_rx) = unbounded();
        let handle = thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || {
                let scheduler = Scheduler {
                    viz,
                    worker: transport.map(PollWorker::spawn),
                    host_rx,
                    frame_txs,
                    redraw_gate: Gate::new(),
                    poll_gate: Gate::new(),
                    debouncer: ResizeDebouncer::new(),
                    redraws: 0,
                };
                scheduler.run()
            })?;
        Ok(SchedulerHandle {
            host_tx,
            config,
            handle: Some(handle),
        })
    }

    fn run(mut self) -> Visualizer {
        let cfg = self.viz.config();
        info!(
            "Scheduler running: redraw {} ms (checked every {} ms), poll {}",
            cfg.redraw_interval_ms,
            cfg.display_refresh_ms,
            if self.worker.is_some() {
                format!("{} ms", cfg.poll_interval_ms)
            } else {
                "off".to_string()
            }
        );

        let mut redraw_timer = after(cfg.display_refresh());
        let mut poll_timer = if self.worker.is_some() {
            after(Duration::ZERO)
        } else {
            never()
        };
        let mut outcomes: Receiver<PollOutcome> = match &self.worker {
            Some(w) => w.outcomes().clone(),
            None => never(),
        };
        let mut resize_timer: Receiver<Instant> = never();
        let host_rx = self.host_rx.clone();

        loop {
            select! {
                recv(host_rx) -> msg => match msg {
                    Ok(HostEvent::Resize(w, h)) => {
                        let cfg = self.viz.config();
                        self.debouncer.request(w, h, Instant::now());
                        resize_timer = after(cfg.resize_debounce());
                    }
                    Ok(HostEvent::Stop) | Err(_) => break,
                },
                recv(redraw_timer) -> _ => {
                    let cfg = self.viz.config();
                    self.redraw(&cfg);
                    redraw_timer = after(cfg.display_refresh());
                },
                recv(poll_timer) -> _ => {
                    let cfg = self.viz.config();
                    self.poll(&cfg);
                    poll_timer = after(cfg.poll_interval());
                },
                recv(outcomes) -> msg => match msg {
                    Ok(outcome) => {
                        if let Some(w) = self.worker.as_mut() {
                            w.complete();
                        }
                        self.viz.apply_poll(outcome, Instant::now());
                    }
                    Err(_) => {
                        warn!("{}; polling disabled", FeedError::WorkerGone);
                        outcomes = never();
                        poll_timer = never();
                    }
                },
                recv(resize_timer) -> _ => {
                    let cfg = self.viz.config();
                    let now = Instant::now();
                    if let Some((w, h)) = self.debouncer.take_due(now, cfg.resize_debounce()) {
                        self.viz.resize(w, h);
                    }
                    resize_timer = match self.debouncer.remaining(now, cfg.resize_debounce()) {
                        Some(left) => after(left),
                        None => never(),
                    };
                },
            }
        }

        info!("Scheduler stopped after {} redraws", self.redraws);
        // Dropping the worker detaches any fetch still running; its outcome
        // is never applied.
        self.worker.take();
        self.viz
    }

    fn redraw(&mut self, cfg: &Config) {
        let now = Instant::now();
        if !self.redraw_gate.due(now, cfg.redraw_interval()) {
            return;
        }
        let frame = self.viz.render_tick(now);
        if !self.frame_txs.is_empty() {
            let shared = Arc::new(frame.clone());
            for tx in &self.frame_txs {
                let _ = tx.try_send(shared.clone());
            }
        }
        self.redraws += 1;
        if self.redraws % 600 == 0 {
            debug!(
                "Scheduler: {} redraws, {} labels live",
                self.redraws,
                self.viz.overlay().len()
            );
        }
    }

    fn poll(&mut self, cfg: &Config) {
        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        if worker.in_flight() {
            debug!("Poll skipped: previous request still in flight");
            return;
        }
        if self.poll_gate.due(Instant::now(), cfg.poll_interval()) {
            worker.request(self.viz.cursor());
        }
    }
}

/// Host-side control of a running scheduler.
pub struct SchedulerHandle {
    host_tx: Sender<HostEvent>,
    config: ConfigHandle,
    handle: Option<JoinHandle<Visualizer>>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Request a new viewport size. Bursts collapse into one re-layout.
    pub fn resize(&self, width: usize, height: usize) {
        if self.handle.is_some() {
            let _ = self.host_tx.send(HostEvent::Resize(width, height));
        }
    }

    /// Merge `patch` into the live configuration. Returns the new snapshot,
    /// or `None` once stopped.
    pub fn update_config(&self, patch: &ConfigPatch) -> Option<Arc<Config>> {
        if self.handle.is_none() {
            warn!("Configuration update after stop ignored");
            return None;
        }
        Some(self.config.update(patch))
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load()
    }

    /// Cancel both timers and join the scheduler thread. The visualizer is
    /// handed back on the first call; later calls return `None`.
    pub fn stop(&mut self) -> Option<Visualizer> {
        let handle = self.handle.take()?;
        let _ = self.host_tx.send(HostEvent::Stop);
        match handle.join() {
            Ok(viz) => Some(viz),
            Err(_) => {
                warn!("Scheduler thread panicked");
                None
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_gate_cadence_100ms_over_16ms_ticks() {
        let t0 = Instant::now();
        let mut gate = Gate::new();
        let mut fires = Vec::new();
        let mut t = 0u64;
        while t < 1000 {
            let now = t0 + Duration::from_millis(t);
            if gate.due(now, Duration::from_millis(100)) {
                fires.push(t);
            }
            t += 16;
        }
        assert!((9..=10).contains(&fires.len()), "fires: {:?}", fires);
        for pair in fires.windows(2) {
            assert!(pair[1] - pair[0] >= 100, "fired too soon: {:?}", pair);
        }
    }

    #[test]
    fn test_gate_first_check_fires() {
        let mut gate = Gate::new();
        let now = Instant::now();
        assert!(gate.due(now, Duration::from_secs(60)));
        assert!(!gate.due(now, Duration::from_secs(60)));
    }

    #[test]
    fn test_debouncer_keeps_last_of_burst() {
        let t0 = Instant::now();
        let d = Duration::from_millis(250);
        let mut deb = ResizeDebouncer::new();
        deb.request(100, 100, t0);
        deb.request(200, 150, t0 + Duration::from_millis(100));
        assert_eq!(deb.take_due(t0 + Duration::from_millis(300), d), None);
        assert_eq!(
            deb.remaining(t0 + Duration::from_millis(300), d),
            Some(Duration::from_millis(50))
        );
        assert_eq!(deb.take_due(t0 + Duration::from_millis(350), d), Some((200, 150)));
        assert!(!deb.is_pending());
        assert_eq!(deb.take_due(t0 + Duration::from_secs(5), d), None);
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl FeedTransport for Counting {
        fn fetch(&mut self, _cursor: Option<&str>) -> Result<String, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(r#"{"file_name":"a.json","delay":0,
                "detections":[{"common_name":"Owl","confidence":0.9,"start":0}]}"#
                .to_string())
        }
    }

    fn fast_config() -> ConfigHandle {
        ConfigHandle::new(Config {
            redraw_interval_ms: 20,
            poll_interval_ms: 30,
            display_refresh_ms: 5,
            resize_debounce_ms: 40,
            ..Config::default()
        })
    }

    #[test]
    fn test_polls_and_renders_until_stopped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let viz = Visualizer::new(fast_config(), 64, 240);
        let (frame_tx, frame_rx) = bounded(64);
        let mut handle = Scheduler::spawn(
            viz,
            Some(Box::new(Counting { calls: calls.clone() })),
            vec![frame_tx],
        )
        .unwrap();
        thread::sleep(Duration::from_millis(300));
        let viz = handle.stop().expect("first stop returns the visualizer");
        assert!(handle.stop().is_none(), "stop is idempotent");
        assert!(!handle.is_running());

        assert!(calls.load(Ordering::SeqCst) >= 2);
        // The same file every time: one label, not one per poll
        assert_eq!(viz.overlay().len(), 1);
        assert_eq!(viz.cursor(), Some("a.json"));
        assert!(viz.renderer().rows_painted() >= 3);
        assert!(frame_rx.try_iter().count() >= 3);
    }

    #[test]
    fn test_no_mutation_after_stop() {
        let viz = Visualizer::new(fast_config(), 32, 32);
        let mut handle = Scheduler::spawn(viz, None, Vec::new()).unwrap();
        thread::sleep(Duration::from_millis(50));
        let viz = handle.stop().unwrap();
        let painted = viz.renderer().rows_painted();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(viz.renderer().rows_painted(), painted);
        assert!(handle
            .update_config(&ConfigPatch {
                gain: Some(0.5),
                ..ConfigPatch::default()
            })
            .is_none());
    }

    #[test]
    fn test_resize_burst_applies_last_size() {
        let viz = Visualizer::new(fast_config(), 32, 32);
        let mut handle = Scheduler::spawn(viz, None, Vec::new()).unwrap();
        handle.resize(40, 40);
        handle.resize(50, 50);
        handle.resize(60, 30);
        thread::sleep(Duration::from_millis(200));
        let viz = handle.stop().unwrap();
        assert_eq!(viz.frame().width(), 60);
        assert_eq!(viz.frame().height(), 30);
    }

    #[test]
    fn test_config_update_changes_scheme() {
        let viz = Visualizer::new(fast_config(), 16, 16);
        let mut handle = Scheduler::spawn(viz, None, Vec::new()).unwrap();
        let cfg = handle
            .update_config(&ConfigPatch {
                color_scheme: Some(crate::color::ColorScheme::GreenWhite),
                ..ConfigPatch::default()
            })
            .unwrap();
        assert_eq!(cfg.color_scheme, crate::color::ColorScheme::GreenWhite);
        thread::sleep(Duration::from_millis(100));
        let viz = handle.stop().unwrap();
        assert_eq!(viz.renderer().scheme(), crate::color::ColorScheme::GreenWhite);
    }
}
