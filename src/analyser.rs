//! Spectral analyser node: time-domain ring buffer → windowed FFT →
//! smoothed dB magnitudes → byte spectrum.

use crate::dsp::blackman_window;
use log::debug;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

pub const MIN_FFT_SIZE: usize = 32;
pub const MAX_FFT_SIZE: usize = 32768;

/// True for powers of two within the supported transform range.
pub fn is_valid_fft_size(n: usize) -> bool {
    n.is_power_of_two() && (MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&n)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyserSettings {
    pub fft_size: usize,
    /// Temporal smoothing between successive transforms, 0.0–1.0.
    pub smoothing: f32,
    /// dB value mapped to byte 0.
    pub min_decibels: f32,
    /// dB value mapped to byte 255.
    pub max_decibels: f32,
}

impl Default for AnalyserSettings {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

pub struct SpectralAnalyser {
    fft: Arc<dyn Fft<f32>>,
    settings: AnalyserSettings,
    window: Vec<f32>,
    /// Last `fft_size` samples, oldest first once `filled`.
    ring: Vec<f32>,
    write_pos: usize,
    filled: bool,
    fft_buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    bytes: Vec<u8>,
    transforms: u64,
}

impl SpectralAnalyser {
    /// `settings.fft_size` must satisfy [`is_valid_fft_size`]; callers
    /// validate before constructing.
    pub fn new(settings: AnalyserSettings) -> Self {
        let n = settings.fft_size;
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n);
        let scratch_len = fft.get_inplace_scratch_len();
        debug!(
            "Analyser allocated: fft_size={} bins={} smoothing={}",
            n,
            n / 2,
            settings.smoothing
        );
        Self {
            fft,
            settings,
            window: blackman_window(n),
            ring: vec![0.0; n],
            write_pos: 0,
            filled: false,
            fft_buffer: vec![Complex::new(0.0, 0.0); n],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            smoothed: vec![0.0; n / 2],
            bytes: vec![0; n / 2],
            transforms: 0,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.settings.fft_size
    }

    pub fn settings(&self) -> AnalyserSettings {
        self.settings
    }

    pub fn set_smoothing(&mut self, smoothing: f32) {
        self.settings.smoothing = if smoothing.is_nan() { 0.0 } else { smoothing.clamp(0.0, 1.0) };
    }

    pub fn set_decibel_range(&mut self, min_db: f32, max_db: f32) {
        if min_db < max_db {
            self.settings.min_decibels = min_db;
            self.settings.max_decibels = max_db;
        }
    }

    /// Append samples to the ring and recompute the spectrum.
    pub fn push(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let n = self.ring.len();
        for &s in samples {
            self.ring[self.write_pos] = if s.is_finite() { s } else { 0.0 };
            self.write_pos += 1;
            if self.write_pos == n {
                self.write_pos = 0;
                self.filled = true;
            }
        }
        self.transform();
    }

    /// Latest byte spectrum, `fft_size / 2` bins.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn transforms(&self) -> u64 {
        self.transforms
    }

    fn transform(&mut self) {
        let n = self.ring.len();
        // Unwrap the ring oldest→newest; unfilled slots stay zero.
        let start = if self.filled { self.write_pos } else { 0 };
        for i in 0..n {
            let s = self.ring[(start + i) % n];
            self.fft_buffer[i] = Complex::new(s * self.window[i], 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.fft_buffer, &mut self.scratch);

        let tau = self.settings.smoothing;
        let min_db = self.settings.min_decibels;
        let range = self.settings.max_decibels - min_db;
        let scale = 1.0 / n as f32;
        for (k, out) in self.bytes.iter_mut().enumerate() {
            let mag = self.fft_buffer[k].norm() * scale;
            let prev = self.smoothed[k];
            let mut v = tau * prev + (1.0 - tau) * mag;
            if !v.is_finite() || v < 0.0 {
                v = 0.0;
            }
            self.smoothed[k] = v;
            *out = magnitude_to_byte(v, min_db, range);
        }
        self.transforms += 1;
    }
}

fn magnitude_to_byte(mag: f32, min_db: f32, range: f32) -> u8 {
    if mag <= 0.0 {
        return 0;
    }
    let db = 20.0 * mag.log10();
    let scaled = 255.0 * (db - min_db) / range;
    if scaled.is_nan() {
        0
    } else {
        scaled.clamp(0.0, 255.0) as u8
    }
}
