//! Intensity → color mapping for spectrogram bars.
//!
//! Every scheme is a pure function of a normalized intensity in 0.0–1.0 plus
//! a background color used when the raster is cleared.

use crate::types::Rgb;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hue of the purple scheme at zero intensity, in degrees.
const PURPLE_MIN_HUE: f32 = 280.0;
/// Degrees of hue rotation across the full intensity range.
const PURPLE_HUE_RANGE: f32 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorScheme {
    #[default]
    Purple,
    Grayscale,
    Lava,
    GreenWhite,
}

impl ColorScheme {
    pub const ALL: [ColorScheme; 4] = [
        ColorScheme::Purple,
        ColorScheme::Grayscale,
        ColorScheme::Lava,
        ColorScheme::GreenWhite,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ColorScheme::Purple => "purple",
            ColorScheme::Grayscale => "grayscale",
            ColorScheme::Lava => "lava",
            ColorScheme::GreenWhite => "green-white",
        }
    }

    /// Color the raster is cleared to.
    pub fn background(&self) -> Rgb {
        match self {
            ColorScheme::Purple => hsl_to_rgb(PURPLE_MIN_HUE, 1.0, 0.10),
            ColorScheme::Grayscale | ColorScheme::Lava | ColorScheme::GreenWhite => Rgb::BLACK,
        }
    }

    /// Map a normalized intensity to a color. Out-of-range and NaN inputs are
    /// clamped first.
    pub fn color(&self, intensity: f32) -> Rgb {
        let i = clamp_unit(intensity);
        match self {
            ColorScheme::Purple => {
                let hue = (i * PURPLE_HUE_RANGE + PURPLE_MIN_HUE).round() % 360.0;
                hsl_to_rgb(hue, 1.0, 0.10 + 0.70 * i)
            }
            ColorScheme::Grayscale => {
                let v = to_channel(i);
                Rgb::new(v, v, v)
            }
            ColorScheme::Lava => lava(i),
            ColorScheme::GreenWhite => {
                let g = to_channel(i);
                let rb = to_channel(i * i);
                Rgb::new(rb, g, rb)
            }
        }
    }

    /// Color for a raw analyser byte (0–255).
    pub fn color_for_magnitude(&self, magnitude: u8) -> Rgb {
        self.color(magnitude as f32 / 255.0)
    }
}

impl fmt::Display for ColorScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ColorScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "purple" => Ok(ColorScheme::Purple),
            "grayscale" | "greyscale" | "gray" | "grey" => Ok(ColorScheme::Grayscale),
            "lava" => Ok(ColorScheme::Lava),
            "green-white" | "greenwhite" | "green" => Ok(ColorScheme::GreenWhite),
            other => Err(format!("unknown color scheme: {}", other)),
        }
    }
}

/// Black → red → orange → white in three equal segments.
fn lava(i: f32) -> Rgb {
    const ORANGE_G: f32 = 165.0;
    if i < 1.0 / 3.0 {
        let t = i * 3.0;
        Rgb::new(to_channel(t), 0, 0)
    } else if i < 2.0 / 3.0 {
        let t = (i - 1.0 / 3.0) * 3.0;
        Rgb::new(255, (ORANGE_G * t).round() as u8, 0)
    } else {
        let t = ((i - 2.0 / 3.0) * 3.0).min(1.0);
        let g = ORANGE_G + (255.0 - ORANGE_G) * t;
        Rgb::new(255, g.round() as u8, to_channel(t))
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

fn to_channel(v: f32) -> u8 {
    (clamp_unit(v) * 255.0).round() as u8
}

/// HSL → RGB. `h` in degrees, `s` and `l` in 0.0–1.0.
pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> Rgb {
    let h = h.rem_euclid(360.0) / 360.0;
    let s = clamp_unit(s);
    let l = clamp_unit(l);
    if s == 0.0 {
        let v = to_channel(l);
        return Rgb::new(v, v, v);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    let channel = |mut t: f32| {
        if t < 0.0 {
            t += 1.0;
        }
        if t > 1.0 {
            t -= 1.0;
        }
        let v = if t < 1.0 / 6.0 {
            p + (q - p) * 6.0 * t
        } else if t < 0.5 {
            q
        } else if t < 2.0 / 3.0 {
            p + (q - p) * (2.0 / 3.0 - t) * 6.0
        } else {
            p
        };
        to_channel(v)
    };
    Rgb::new(channel(h + 1.0 / 3.0), channel(h), channel(h - 1.0 / 3.0))
}
