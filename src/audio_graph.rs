use crate::analyser::{is_valid_fft_size, AnalyserSettings, SpectralAnalyser};
use crate::config::{Config, MAX_GAIN};
use crate::dsp::{compute_rms, HighPass};
use crate::media_source::{AudioSink, MediaSource};
use crate::types::AudioChunk;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, info, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("media source is not ready to decode")]
    SourceNotReady,
    #[error("no audio device available: {0}")]
    NoDevice(String),
    #[error("audio stream error: {0}")]
    Stream(String),
    #[error("cannot open media: {0}")]
    Media(String),
    #[error("cannot start audio thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// source → high-pass → gain → analyser → sink
///
/// Parameter setters assign in place; nothing is ever rewired.
struct SignalChain {
    filter: HighPass,
    gain: f32,
    analyser: SpectralAnalyser,
    sink: Box<dyn AudioSink>,
    scratch: Vec<f32>,
    chunks: u64,
}

impl SignalChain {
    fn process(&mut self, chunk: &AudioChunk) {
        self.scratch.clear();
        self.scratch.extend_from_slice(&chunk.samples);
        self.filter.set_sample_rate(chunk.sample_rate);
        self.filter.process(&mut self.scratch);
        let g = self.gain;
        for s in self.scratch.iter_mut() {
            *s *= g;
        }
        self.analyser.push(&self.scratch);
        self.sink.write(&self.scratch, chunk.sample_rate);

        self.chunks += 1;
        if self.chunks % 500 == 0 {
            debug!(
                "Audio graph: {} chunks, rms={:.4}",
                self.chunks,
                compute_rms(&self.scratch)
            );
        }
    }
}

struct Wiring {
    chain: Arc<Mutex<SignalChain>>,
    shutdown_tx: Option<Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

/// Audio processing chain for one visualizer.
///
/// Analysis runs on a pump thread as chunks arrive; [`AudioGraph::snapshot`]
/// only copies out whatever spectrum was computed last.
pub struct AudioGraph {
    wiring: Option<Wiring>,
    spectrum: Vec<u8>,
}

fn lock(chain: &Mutex<SignalChain>) -> MutexGuard<'_, SignalChain> {
    chain.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AudioGraph {
    pub fn new() -> Self {
        Self {
            wiring: None,
            spectrum: Vec::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.wiring.is_some()
    }

    /// Build and start the chain. A second call is a no-op with a warning.
    /// On error nothing is left running.
    pub fn initialize(
        &mut self,
        source: &mut dyn MediaSource,
        sink: Box<dyn AudioSink>,
        config: &Config,
    ) -> Result<(), GraphError> {
        if self.wiring.is_some() {
            warn!("Audio graph already initialized");
            return Ok(());
        }
        if !source.is_ready() {
            return Err(GraphError::SourceNotReady);
        }
        let sample_rate = source.sample_rate();
        let stream = source.open()?;

        let settings = config.analyser_settings();
        let chain = SignalChain {
            filter: HighPass::new(sample_rate, config.highpass_cutoff_hz, config.highpass_enabled),
            gain: config.gain.clamp(0.0, MAX_GAIN),
            analyser: SpectralAnalyser::new(settings),
            sink,
            scratch: Vec::with_capacity(4096),
            chunks: 0,
        };
        let chain = Arc::new(Mutex::new(chain));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let pump_chain = chain.clone();
        let pump = thread::Builder::new()
            .name("audio-graph".into())
            .spawn(move || pump_loop(stream, shutdown_rx, pump_chain))?;

        info!(
            "Audio graph wired: {} Hz, fft_size={}, gain={:.2}, high-pass {} @ {:.0} Hz",
            sample_rate,
            settings.fft_size,
            config.gain,
            if config.highpass_enabled { "on" } else { "off" },
            config.highpass_cutoff_hz
        );
        self.spectrum = vec![0; settings.fft_size / 2];
        self.wiring = Some(Wiring {
            chain,
            shutdown_tx: Some(shutdown_tx),
            pump: Some(pump),
        });
        Ok(())
    }

    /// Latest byte spectrum, `fft_size / 2` bins. Empty before initialization.
    pub fn snapshot(&mut self) -> &[u8] {
        if let Some(w) = &self.wiring {
            let chain = lock(&w.chain);
            let bytes = chain.analyser.bytes();
            self.spectrum.clear();
            self.spectrum.extend_from_slice(bytes);
        }
        &self.spectrum
    }

    pub fn fft_size(&self) -> Option<usize> {
        self.wiring.as_ref().map(|w| lock(&w.chain).analyser.fft_size())
    }

    /// Number of transforms computed so far.
    pub fn transforms(&self) -> u64 {
        self.wiring
            .as_ref()
            .map_or(0, |w| lock(&w.chain).analyser.transforms())
    }

    pub fn set_gain(&self, gain: f32) {
        let g = clamp_gain(gain);
        self.with_chain(|c| c.gain = g);
    }

    pub fn set_filter_enabled(&self, enabled: bool) {
        self.with_chain(|c| c.filter.set_enabled(enabled));
    }

    /// Cutoff in Hz, clamped to 0–2000.
    pub fn set_filter_frequency(&self, hz: f32) {
        self.with_chain(|c| c.filter.set_cutoff(hz));
    }

    /// Reallocate the analyser. Returns false (and changes nothing) for an
    /// invalid size.
    pub fn set_fft_size(&mut self, fft_size: usize) -> bool {
        if !is_valid_fft_size(fft_size) {
            warn!("Ignoring fft_size {}", fft_size);
            return false;
        }
        let Some(w) = &self.wiring else {
            return false;
        };
        let mut chain = lock(&w.chain);
        if chain.analyser.fft_size() != fft_size {
            let settings = AnalyserSettings {
                fft_size,
                ..chain.analyser.settings()
            };
            chain.analyser = SpectralAnalyser::new(settings);
            self.spectrum = vec![0; fft_size / 2];
            info!("Analyser reallocated: fft_size={}", fft_size);
        }
        true
    }

    /// Bring live parameters in line with a configuration snapshot. Every
    /// parameter changes under one lock, so the pump never processes a chunk
    /// with half of an update applied.
    pub fn apply(&mut self, config: &Config) {
        let settings = config.analyser_settings();
        let mut reallocated = None;
        self.with_chain(|c| {
            c.gain = clamp_gain(config.gain);
            c.filter.set_enabled(config.highpass_enabled);
            c.filter.set_cutoff(config.highpass_cutoff_hz);
            if c.analyser.fft_size() != settings.fft_size && is_valid_fft_size(settings.fft_size) {
                c.analyser = SpectralAnalyser::new(settings);
                reallocated = Some(settings.fft_size);
            } else {
                c.analyser.set_smoothing(settings.smoothing);
                c.analyser
                    .set_decibel_range(settings.min_decibels, settings.max_decibels);
            }
            debug!(
                "Graph params: gain {:.2}, high-pass tuned to {:.0} Hz",
                c.gain,
                c.filter.effective_cutoff_hz()
            );
        });
        if let Some(n) = reallocated {
            self.spectrum = vec![0; n / 2];
            info!("Analyser reallocated: fft_size={}", n);
        }
    }

    /// Stop the pump thread and release the source.
    pub fn shutdown(&mut self) {
        if let Some(mut w) = self.wiring.take() {
            w.shutdown_tx.take();
            if let Some(h) = w.pump.take() {
                let _ = h.join();
            }
            info!("Audio graph shut down");
        }
    }

    fn with_chain(&self, f: impl FnOnce(&mut SignalChain)) {
        if let Some(w) = &self.wiring {
            f(&mut lock(&w.chain));
        }
    }
}

fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        1.0
    } else {
        gain.clamp(0.0, MAX_GAIN)
    }
}

impl Default for AudioGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioGraph {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pump_loop(stream: Receiver<AudioChunk>, shutdown: Receiver<()>, chain: Arc<Mutex<SignalChain>>) {
    loop {
        select! {
            recv(stream) -> msg => match msg {
                Ok(chunk) => {
                    trace!("chunk t={}µs n={}", chunk.timestamp_us, chunk.samples.len());
                    lock(&chain).process(&chunk);
                }
                Err(_) => {
                    info!("Media source ended");
                    break;
                }
            },
            recv(shutdown) -> _ => break,
        }
    }
}
