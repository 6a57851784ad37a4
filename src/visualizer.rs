//! One spectrogram instance: audio graph, scroll renderer, detection overlay
//! and feed cursor, driven by a single owner thread.

use crate::audio_graph::{AudioGraph, GraphError};
use crate::config::{Config, ConfigHandle, ConfigPatch};
use crate::feed::{parse_feed_body, FeedError, PollCursor, PollOutcome};
use crate::media_source::{AudioSink, MediaSource};
use crate::overlay::DetectionOverlay;
use crate::renderer::ScrollRenderer;
use crate::surface::RenderSurface;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;

/// Largest accepted viewport edge, in pixels.
pub const MAX_VIEWPORT_EDGE: usize = 8192;

pub struct Visualizer {
    config: ConfigHandle,
    /// Snapshot last pushed into the audio graph.
    applied: Arc<Config>,
    graph: AudioGraph,
    renderer: ScrollRenderer,
    overlay: DetectionOverlay,
    cursor: PollCursor,
}

impl Visualizer {
    /// Oversized dimensions are clamped to [`MAX_VIEWPORT_EDGE`].
    pub fn new(config: ConfigHandle, width: usize, height: usize) -> Self {
        let applied = config.load();
        let (width, height) = (width.min(MAX_VIEWPORT_EDGE), height.min(MAX_VIEWPORT_EDGE));
        info!(
            "Visualizer {}x{}: redraw {} ms, poll {} ms, scheme {}",
            width, height, applied.redraw_interval_ms, applied.poll_interval_ms, applied.color_scheme
        );
        Self {
            renderer: ScrollRenderer::new(width, height, applied.color_scheme)
                .with_background(applied.background_color),
            config,
            applied,
            graph: AudioGraph::new(),
            overlay: DetectionOverlay::new(),
            cursor: PollCursor::new(),
        }
    }

    /// Wire the audio graph to `source`. Safe to call again; later calls
    /// only warn.
    pub fn initialize(
        &mut self,
        source: &mut dyn MediaSource,
        sink: Box<dyn AudioSink>,
    ) -> Result<(), GraphError> {
        let cfg = self.config.load();
        self.graph.initialize(source, sink, &cfg)?;
        self.applied = cfg;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.graph.is_initialized()
    }

    /// Scroll one row, paint the current spectrum and compose labels.
    /// Returns the frame to present.
    pub fn render_tick(&mut self, now: Instant) -> &RenderSurface {
        let cfg = self.sync_config();
        if self.renderer.scheme() != cfg.color_scheme {
            self.renderer.set_scheme(cfg.color_scheme);
        }
        self.renderer.set_background(cfg.background_color);
        self.overlay
            .evict_expired(now, cfg.ingest_policy().timeout);
        let spectrum = self.graph.snapshot();
        self.renderer
            .tick(spectrum, &self.overlay, &cfg.label_style());
        self.renderer.frame()
    }

    /// Handle a finished poll. Failures are logged and leave state untouched.
    /// Returns the number of labels admitted.
    pub fn apply_poll(&mut self, outcome: PollOutcome, now: Instant) -> usize {
        let result = outcome.and_then(|body| self.apply_feed_body(&body, now));
        match result {
            Ok(n) => n,
            Err(FeedError::BackendBusy) => {
                debug!("Feed backend busy, retrying next poll");
                0
            }
            Err(e) => {
                warn!("Feed poll failed: {}", e);
                0
            }
        }
    }

    /// Interpret one response body against the cursor and ingest any new
    /// detections.
    pub fn apply_feed_body(&mut self, body: &str, now: Instant) -> Result<usize, FeedError> {
        let Some(resp) = parse_feed_body(body)? else {
            return Ok(0);
        };
        if !self.cursor.advance(&resp.file_name) {
            debug!("Feed: no new file (cursor {:?})", self.cursor.token());
            return Ok(0);
        }
        let cfg = self.config.load();
        let admitted = self.overlay.ingest(
            &resp.detections,
            resp.delay,
            &cfg.ingest_policy(),
            self.renderer.height(),
            now,
        );
        info!(
            "Feed: {} → {} detection(s), {} labelled",
            resp.file_name,
            resp.detections.len(),
            admitted
        );
        Ok(admitted)
    }

    /// Re-layout for a new viewport. History and labels are dropped.
    /// Returns false, changing nothing, for a size beyond
    /// [`MAX_VIEWPORT_EDGE`].
    pub fn resize(&mut self, width: usize, height: usize) -> bool {
        if width > MAX_VIEWPORT_EDGE || height > MAX_VIEWPORT_EDGE {
            warn!(
                "Rejecting resize to {}x{}: edges are limited to {} px",
                width, height, MAX_VIEWPORT_EDGE
            );
            return false;
        }
        if width == self.renderer.width() && height == self.renderer.height() {
            return true;
        }
        info!("Resize {}x{} → {}x{}", self.renderer.width(), self.renderer.height(), width, height);
        self.renderer.resize(width, height);
        self.overlay.clear();
        true
    }

    pub fn update_config(&mut self, patch: &ConfigPatch) -> Arc<Config> {
        self.config.update(patch);
        self.sync_config()
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.update_config(&ConfigPatch {
            gain: Some(gain),
            ..ConfigPatch::default()
        });
    }

    pub fn set_filter_enabled(&mut self, enabled: bool) {
        self.update_config(&ConfigPatch {
            highpass_enabled: Some(enabled),
            ..ConfigPatch::default()
        });
    }

    pub fn set_filter_frequency(&mut self, hz: f32) {
        self.update_config(&ConfigPatch {
            highpass_cutoff_hz: Some(hz),
            ..ConfigPatch::default()
        });
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load()
    }

    pub fn config_handle(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn frame(&self) -> &RenderSurface {
        self.renderer.frame()
    }

    pub fn renderer(&self) -> &ScrollRenderer {
        &self.renderer
    }

    pub fn overlay(&self) -> &DetectionOverlay {
        &self.overlay
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.token()
    }

    pub fn graph(&self) -> &AudioGraph {
        &self.graph
    }

    /// Stop the audio pump. Rendering still works and paints background.
    pub fn shutdown(&mut self) {
        self.graph.shutdown();
    }

    /// Push the live snapshot into the audio graph if it changed since the
    /// last tick. Changes made through any clone of the handle land here.
    fn sync_config(&mut self) -> Arc<Config> {
        let cfg = self.config.load();
        if !Arc::ptr_eq(&cfg, &self.applied) {
            self.graph.apply(&cfg);
            self.applied = cfg.clone();
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorScheme;
    use crate::dsp::test_helpers::sine_wave;
    use crate::media_source::{ChannelSource, NullSink};
    use crate::types::{AudioChunk, Rgb};
    use crossbeam_channel::bounded;
    use std::thread;
    use std::time::Duration;

    fn viz(w: usize, h: usize) -> Visualizer {
        Visualizer::new(ConfigHandle::new(Config::default()), w, h)
    }

    const OWL: &str = r#"{"file_name":"a.json","delay":0,
        "detections":[{"common_name":"Owl","confidence":0.9,"start":0}]}"#;

    #[test]
    fn test_duplicate_file_ingested_once() {
        let mut v = viz(200, 300);
        let now = Instant::now();
        assert_eq!(v.apply_feed_body(OWL, now).unwrap(), 1);
        assert_eq!(v.apply_feed_body(OWL, now).unwrap(), 0);
        assert_eq!(v.overlay().len(), 1);
        assert_eq!(v.cursor(), Some("a.json"));
    }

    #[test]
    fn test_backend_string_delay_is_ingested() {
        let mut v = viz(200, 300);
        let body = r#"{"file_name":"a.wav.json","delay":"12",
            "detections":[{"common_name":"Owl","confidence":0.9,"start":0}]}"#;
        assert_eq!(v.apply_feed_body(body, Instant::now()).unwrap(), 1);
        assert_eq!(v.overlay().len(), 1);
        assert_eq!(v.overlay().events().next().unwrap().delay_secs, 12.0);
    }

    #[test]
    fn test_failed_poll_leaves_state() {
        let mut v = viz(200, 300);
        let now = Instant::now();
        v.apply_feed_body(OWL, now).unwrap();
        assert_eq!(v.apply_poll(Ok("Database locked".into()), now), 0);
        assert_eq!(v.apply_poll(Ok("{oops".into()), now), 0);
        assert_eq!(v.apply_poll(Err(FeedError::Status(500)), now), 0);
        assert_eq!(v.overlay().len(), 1);
        assert_eq!(v.cursor(), Some("a.json"));
    }

    #[test]
    fn test_missing_file_name_is_no_data() {
        let mut v = viz(200, 300);
        let body = r#"{"detections":[{"common_name":"Owl","confidence":0.9}]}"#;
        assert_eq!(v.apply_feed_body(body, Instant::now()).unwrap(), 0);
        assert!(v.overlay().is_empty());
        assert_eq!(v.cursor(), None);
    }

    #[test]
    fn test_render_tick_evicts_without_ingestion() {
        let mut v = viz(200, 300);
        v.update_config(&ConfigPatch {
            label_timeout_ms: Some(1000),
            ..ConfigPatch::default()
        });
        let t0 = Instant::now();
        v.apply_feed_body(OWL, t0).unwrap();
        v.render_tick(t0 + Duration::from_millis(500));
        assert_eq!(v.overlay().len(), 1);
        v.render_tick(t0 + Duration::from_millis(1500));
        assert!(v.overlay().is_empty());
    }

    #[test]
    fn test_resize_clears_labels_and_history() {
        let mut v = viz(200, 300);
        let now = Instant::now();
        v.apply_feed_body(OWL, now).unwrap();
        v.render_tick(now);
        v.resize(100, 150);
        assert!(v.overlay().is_empty());
        assert_eq!(v.frame().width(), 100);
        assert_eq!(v.frame().height(), 150);
        assert_eq!(v.renderer().rows_painted(), 0);
    }

    #[test]
    fn test_oversized_resize_is_rejected() {
        let mut v = viz(200, 300);
        let now = Instant::now();
        v.apply_feed_body(OWL, now).unwrap();
        assert!(!v.resize(usize::MAX, usize::MAX));
        assert!(!v.resize(100, MAX_VIEWPORT_EDGE + 1));
        assert_eq!((v.frame().width(), v.frame().height()), (200, 300));
        assert_eq!(v.overlay().len(), 1, "rejected resize keeps labels");
        assert!(v.resize(MAX_VIEWPORT_EDGE, 2));
        assert_eq!(v.frame().width(), MAX_VIEWPORT_EDGE);

        let v = viz(usize::MAX, 4);
        assert_eq!(v.frame().width(), MAX_VIEWPORT_EDGE);
    }

    #[test]
    fn test_background_patch_shows_on_next_tick() {
        let mut v = viz(8, 4);
        let old = ColorScheme::Purple.background();
        v.render_tick(Instant::now());
        let teal = Rgb::new(0, 128, 128);
        v.update_config(&ConfigPatch {
            background_color: Some(Some(teal)),
            ..ConfigPatch::default()
        });
        // Nothing is repainted until the next tick
        assert!(v.frame().row(3).iter().all(|&p| p == old));
        let frame = v.render_tick(Instant::now());
        assert!(frame.row(3).iter().all(|&p| p == teal));
        assert!(frame.row(2).iter().all(|&p| p == old), "painted rows keep their color");
        assert_eq!(v.renderer().background(), teal);
    }

    #[test]
    fn test_configured_background_used_from_start() {
        let teal = Rgb::new(0, 128, 128);
        let handle = ConfigHandle::new(Config {
            background_color: Some(teal),
            ..Config::default()
        });
        let v = Visualizer::new(handle, 4, 4);
        assert!(v.frame().row(0).iter().all(|&p| p == teal));
    }

    #[test]
    fn test_scheme_change_applies_on_next_tick() {
        let mut v = viz(8, 4);
        v.update_config(&ConfigPatch {
            color_scheme: Some(ColorScheme::Lava),
            ..ConfigPatch::default()
        });
        v.render_tick(Instant::now());
        assert_eq!(v.renderer().scheme(), ColorScheme::Lava);
    }

    #[test]
    fn test_uninitialized_render_paints_background() {
        let mut v = viz(8, 4);
        let frame = v.render_tick(Instant::now());
        let bg = ColorScheme::Purple.background();
        assert!(frame.row(3).iter().all(|&p| p == bg));
    }

    #[test]
    fn test_config_changes_reach_graph() {
        let (tx, rx) = bounded(4);
        let mut src = ChannelSource::new(rx, 48000);
        let mut v = viz(64, 16);
        v.initialize(&mut src, Box::new(NullSink)).unwrap();
        // Second call only warns
        v.initialize(&mut src, Box::new(NullSink)).unwrap();
        v.update_config(&ConfigPatch {
            fft_size: Some(512),
            ..ConfigPatch::default()
        });
        assert_eq!(v.graph().fft_size(), Some(512));

        v.set_gain(0.0);
        assert_eq!(v.config().gain, 0.0);
        tx.send(AudioChunk {
            timestamp_us: 0,
            samples: sine_wave(1500.0, 0.5, 48000, 50),
            sample_rate: 48000,
        })
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while v.graph().transforms() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        let frame = v.render_tick(Instant::now());
        let bg = ColorScheme::Purple.color_for_magnitude(0);
        assert!(frame.row(15).iter().all(|&p| p == bg));
    }
}
