//! Shared DSP primitives: biquad high-pass, analysis windows, RMS, and test signal generators.

use std::f64::consts::PI;

/// Cutoff used when the high-pass is "off": low enough to be inaudible,
/// so the node stays wired and only its coefficients change.
pub const TRANSPARENT_CUTOFF_HZ: f32 = 1.0;

/// Highest cutoff the filter accepts.
pub const MAX_CUTOFF_HZ: f32 = 2000.0;

/// Second-order high-pass (RBJ cookbook, Butterworth Q).
///
/// Coefficients are recomputed in place on parameter changes while the
/// delay-line state is preserved, so retuning never clicks.
#[derive(Debug, Clone)]
pub struct HighPass {
    sample_rate: f32,
    cutoff_hz: f32,
    enabled: bool,
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl HighPass {
    const Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

    pub fn new(sample_rate: u32, cutoff_hz: f32, enabled: bool) -> Self {
        let mut f = Self {
            sample_rate: sample_rate.max(1) as f32,
            cutoff_hz: clamp_cutoff(cutoff_hz),
            enabled,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        };
        f.recompute();
        f
    }

    pub fn cutoff_hz(&self) -> f32 {
        self.cutoff_hz
    }

    /// Frequency the biquad is actually tuned to right now.
    pub fn effective_cutoff_hz(&self) -> f32 {
        if self.enabled {
            self.cutoff_hz.max(TRANSPARENT_CUTOFF_HZ)
        } else {
            TRANSPARENT_CUTOFF_HZ
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.recompute();
        }
    }

    /// Set the cutoff, clamped to 0–2000 Hz.
    pub fn set_cutoff(&mut self, hz: f32) {
        let hz = clamp_cutoff(hz);
        if hz != self.cutoff_hz {
            self.cutoff_hz = hz;
            self.recompute();
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        let sr = sample_rate.max(1) as f32;
        if sr != self.sample_rate {
            self.sample_rate = sr;
            self.recompute();
        }
    }

    fn recompute(&mut self) {
        let sr = self.sample_rate as f64;
        // Keep below Nyquist so the coefficients stay stable.
        let fc = (self.effective_cutoff_hz() as f64).min(sr * 0.49);
        let w0 = 2.0 * PI * fc / sr;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * Self::Q);
        let a0 = 1.0 + alpha;
        self.b0 = (1.0 + cos) / 2.0 / a0;
        self.b1 = -(1.0 + cos) / a0;
        self.b2 = (1.0 + cos) / 2.0 / a0;
        self.a1 = -2.0 * cos / a0;
        self.a2 = (1.0 - alpha) / a0;
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            let x0 = *s as f64;
            let y0 = self.b0 * x0 + self.b1 * self.x1 + self.b2 * self.x2
                - self.a1 * self.y1
                - self.a2 * self.y2;
            self.x2 = self.x1;
            self.x1 = x0;
            self.y2 = self.y1;
            self.y1 = y0;
            *s = y0 as f32;
        }
    }
}

fn clamp_cutoff(hz: f32) -> f32 {
    if hz.is_nan() {
        return 0.0;
    }
    hz.clamp(0.0, MAX_CUTOFF_HZ)
}

/// Blackman window coefficients (alpha = 0.16).
pub fn blackman_window(n: usize) -> Vec<f32> {
    const ALPHA: f64 = 0.16;
    let a0 = 0.5 * (1.0 - ALPHA);
    let a1 = 0.5;
    let a2 = 0.5 * ALPHA;
    (0..n)
        .map(|i| {
            let x = i as f64 / n as f64;
            (a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()) as f32
        })
        .collect()
}

/// Root mean square of an audio buffer.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
