//! Runtime configuration.
//!
//! The live configuration is an immutable [`Config`] snapshot behind an
//! [`ArcSwap`]. Updates merge a [`ConfigPatch`] into the current snapshot
//! and publish the result in one store, so a reader never sees half of an
//! update.

use crate::analyser::{is_valid_fft_size, AnalyserSettings};
use crate::color::ColorScheme;
use crate::dsp::MAX_CUTOFF_HZ;
use crate::overlay::{IngestPolicy, LabelFont, LabelStyle};
use crate::types::{Rgb, Rgba};
use arc_swap::ArcSwap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const MAX_GAIN: f32 = 2.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Cadence
    pub redraw_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// How often the redraw gate is checked (display refresh).
    pub display_refresh_ms: u64,
    pub resize_debounce_ms: u64,

    // Detections
    pub min_confidence: f32,
    pub max_labels: usize,
    pub label_timeout_ms: u64,
    pub label_bottom_offset: i32,
    pub label_padding: u32,
    pub label_margin: u32,
    pub label_spacing: u32,
    pub label_font: LabelFont,
    pub label_color: Rgba,
    pub label_background: Rgba,

    // Spectrum
    pub fft_size: usize,
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
    pub color_scheme: ColorScheme,
    /// Raster clear color. `None` uses the scheme's own background.
    pub background_color: Option<Rgb>,

    // Audio graph
    pub gain: f32,
    pub highpass_enabled: bool,
    pub highpass_cutoff_hz: f32,

    // Feed, read once when the transport is built
    pub feed_url: String,
    pub feed_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redraw_interval_ms: 100,
            poll_interval_ms: 1000,
            display_refresh_ms: 16,
            resize_debounce_ms: 250,
            min_confidence: 0.7,
            max_labels: 10,
            label_timeout_ms: 30_000,
            label_bottom_offset: 50,
            label_padding: 4,
            label_margin: 10,
            label_spacing: 5,
            label_font: LabelFont::Medium,
            label_color: Rgba::new(255, 255, 255, 0.9),
            label_background: Rgba::new(0, 0, 0, 0.6),
            fft_size: 2048,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
            color_scheme: ColorScheme::Purple,
            background_color: None,
            gain: 1.0,
            highpass_enabled: false,
            highpass_cutoff_hz: 150.0,
            feed_url: "http://localhost/spectrogram.php".to_string(),
            feed_timeout_ms: 5_000,
        }
    }
}

impl Config {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        info!("Loaded config: {}", path.display());
        Ok(cfg.sanitized())
    }

    /// Clamp every field into its valid range.
    pub fn sanitized(mut self) -> Self {
        let defaults = Config::default();
        self.redraw_interval_ms = self.redraw_interval_ms.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        self.display_refresh_ms = self.display_refresh_ms.max(1);
        self.min_confidence = clamp_or(self.min_confidence, 0.0, 1.0, defaults.min_confidence);
        self.smoothing = clamp_or(self.smoothing, 0.0, 1.0, defaults.smoothing);
        self.gain = clamp_or(self.gain, 0.0, MAX_GAIN, defaults.gain);
        self.highpass_cutoff_hz = clamp_or(self.highpass_cutoff_hz, 0.0, MAX_CUTOFF_HZ, 0.0);
        self.label_color.a = clamp_or(self.label_color.a, 0.0, 1.0, 1.0);
        self.label_background.a = clamp_or(self.label_background.a, 0.0, 1.0, 1.0);
        if !is_valid_fft_size(self.fft_size) {
            warn!(
                "fft_size {} is not a power of two in range; using {}",
                self.fft_size, defaults.fft_size
            );
            self.fft_size = defaults.fft_size;
        }
        if !(self.min_decibels < self.max_decibels) {
            warn!("decibel range is empty; using defaults");
            self.min_decibels = defaults.min_decibels;
            self.max_decibels = defaults.max_decibels;
        }
        self
    }

    /// Merge a patch. Invalid values are clamped; an invalid FFT size is
    /// ignored and the current one kept.
    pub fn merged(&self, patch: &ConfigPatch) -> Config {
        let mut next = self.clone();
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = &patch.$field { next.$field = v.clone(); })*
            };
        }
        take!(
            redraw_interval_ms,
            poll_interval_ms,
            display_refresh_ms,
            resize_debounce_ms,
            min_confidence,
            max_labels,
            label_timeout_ms,
            label_bottom_offset,
            label_padding,
            label_margin,
            label_spacing,
            label_font,
            label_color,
            label_background,
            smoothing,
            min_decibels,
            max_decibels,
            color_scheme,
            gain,
            highpass_enabled,
            highpass_cutoff_hz,
        );
        if let Some(bg) = patch.background_color {
            next.background_color = bg;
        }
        if let Some(n) = patch.fft_size {
            if is_valid_fft_size(n) {
                next.fft_size = n;
            } else {
                warn!("Ignoring fft_size {}: not a power of two in range", n);
            }
        }
        next.sanitized()
    }

    pub fn redraw_interval(&self) -> Duration {
        Duration::from_millis(self.redraw_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn display_refresh(&self) -> Duration {
        Duration::from_millis(self.display_refresh_ms)
    }

    pub fn resize_debounce(&self) -> Duration {
        Duration::from_millis(self.resize_debounce_ms)
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_timeout_ms)
    }

    /// Color the raster is cleared to.
    pub fn background(&self) -> Rgb {
        self.background_color
            .unwrap_or_else(|| self.color_scheme.background())
    }

    pub fn ingest_policy(&self) -> IngestPolicy {
        IngestPolicy {
            min_confidence: self.min_confidence,
            max_labels: self.max_labels,
            timeout: Duration::from_millis(self.label_timeout_ms),
            bottom_offset: self.label_bottom_offset,
        }
    }

    pub fn label_style(&self) -> LabelStyle {
        LabelStyle {
            font: self.label_font,
            text_color: self.label_color,
            background: self.label_background,
            padding: self.label_padding,
            margin: self.label_margin,
            spacing: self.label_spacing,
        }
    }

    pub fn analyser_settings(&self) -> AnalyserSettings {
        AnalyserSettings {
            fft_size: self.fft_size,
            smoothing: self.smoothing,
            min_decibels: self.min_decibels,
            max_decibels: self.max_decibels,
        }
    }
}

fn clamp_or(v: f32, lo: f32, hi: f32, fallback: f32) -> f32 {
    if v.is_nan() {
        fallback
    } else {
        v.clamp(lo, hi)
    }
}

/// Partial update; `None` fields are left unchanged. The feed endpoint is
/// not patchable: the transport is built once at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigPatch {
    pub redraw_interval_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub display_refresh_ms: Option<u64>,
    pub resize_debounce_ms: Option<u64>,
    pub min_confidence: Option<f32>,
    pub max_labels: Option<usize>,
    pub label_timeout_ms: Option<u64>,
    pub label_bottom_offset: Option<i32>,
    pub label_padding: Option<u32>,
    pub label_margin: Option<u32>,
    pub label_spacing: Option<u32>,
    pub label_font: Option<LabelFont>,
    pub label_color: Option<Rgba>,
    pub label_background: Option<Rgba>,
    pub fft_size: Option<usize>,
    pub smoothing: Option<f32>,
    pub min_decibels: Option<f32>,
    pub max_decibels: Option<f32>,
    pub color_scheme: Option<ColorScheme>,
    /// `Some(None)` returns to the scheme background.
    pub background_color: Option<Option<Rgb>>,
    pub gain: Option<f32>,
    pub highpass_enabled: Option<bool>,
    pub highpass_cutoff_hz: Option<f32>,
}

/// Shared, atomically swapped configuration.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<Config>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config.sanitized())),
        }
    }

    /// Current snapshot. Hold it for the duration of one tick.
    pub fn load(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    /// Merge `patch` and publish the result; returns the new snapshot.
    pub fn update(&self, patch: &ConfigPatch) -> Arc<Config> {
        self.inner.rcu(|current| Arc::new(current.merged(patch)));
        self.inner.load_full()
    }
}
