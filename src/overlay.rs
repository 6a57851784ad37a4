//! Detection overlay: a bounded, time-decaying list of classification
//! events drawn as rotated labels along the right edge of the frame.
//!
//! Events are kept most-recent-first. Both the count cap and the age limit
//! are enforced after every ingestion, and the age limit again on every
//! render tick via [`DetectionOverlay::evict_expired`].

use crate::feed::DetectionRecord;
use crate::surface::{RenderSurface, RotatedCanvas};
use crate::types::Rgba;
use embedded_graphics::mono_font::{ascii, MonoFont, MonoTextStyle};
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use embedded_graphics::text::{Baseline, Text};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ─── Events ─────────────────────────────────────────────────────────────────

/// One detection that cleared the confidence threshold. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub label: String,
    /// 0.0–1.0
    pub confidence: f32,
    pub observed_at: Instant,
    /// Surface row near the bottom edge at enqueue time. Informational only;
    /// layout is always top-down from the margin.
    pub vertical_anchor: i32,
    /// Offset of the detection within its source recording, seconds.
    pub start_secs: f64,
    /// Transport delay reported by the feed, seconds.
    pub delay_secs: f64,
}

impl DetectionEvent {
    pub fn text(&self) -> String {
        format!("{} ({}%)", self.label, (self.confidence * 100.0).round() as u32)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.observed_at)
    }
}

/// Admission and retention rules, taken from the live configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngestPolicy {
    pub min_confidence: f32,
    pub max_labels: usize,
    pub timeout: Duration,
    pub bottom_offset: i32,
}

// ─── Label style ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelFont {
    Small,
    #[default]
    Medium,
    Large,
}

impl LabelFont {
    pub fn mono_font(&self) -> &'static MonoFont<'static> {
        match self {
            LabelFont::Small => &ascii::FONT_6X10,
            LabelFont::Medium => &ascii::FONT_7X13,
            LabelFont::Large => &ascii::FONT_9X15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelStyle {
    pub font: LabelFont,
    pub text_color: Rgba,
    pub background: Rgba,
    pub padding: u32,
    pub margin: u32,
    /// Gap between stacked labels.
    pub spacing: u32,
}

impl Default for LabelStyle {
    fn default() -> Self {
        Self {
            font: LabelFont::Medium,
            text_color: Rgba::new(255, 255, 255, 0.9),
            background: Rgba::new(0, 0, 0, 0.6),
            padding: 4,
            margin: 10,
            spacing: 5,
        }
    }
}

impl LabelStyle {
    /// Unrotated text extent: (length along the reading direction, glyph height).
    pub fn measure(&self, text: &str) -> (u32, u32) {
        let font = self.font.mono_font();
        let n = text.chars().count() as u32;
        if n == 0 {
            return (0, font.character_size.height);
        }
        let advance = font.character_size.width + font.character_spacing;
        (n * advance - font.character_spacing, font.character_size.height)
    }
}

/// Where a label's background plate lands on the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPlacement {
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    text_len: u32,
    text_height: u32,
}

// ─── Overlay ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct DetectionOverlay {
    events: VecDeque<DetectionEvent>,
}

impl DetectionOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Live events, most recent first.
    pub fn events(&self) -> impl Iterator<Item = &DetectionEvent> {
        self.events.iter()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Admit records at or above the threshold, prepend them, then enforce
    /// the cap and the age limit. Returns how many records were admitted.
    pub fn ingest(
        &mut self,
        records: &[DetectionRecord],
        delay_secs: f64,
        policy: &IngestPolicy,
        surface_height: usize,
        now: Instant,
    ) -> usize {
        let anchor = surface_height as i32 - policy.bottom_offset;
        let fresh: Vec<DetectionEvent> = records
            .iter()
            .filter(|r| r.confidence >= policy.min_confidence as f64)
            .map(|r| DetectionEvent {
                label: r.common_name.clone(),
                confidence: r.confidence.clamp(0.0, 1.0) as f32,
                observed_at: now,
                vertical_anchor: anchor,
                start_secs: r.start,
                delay_secs,
            })
            .collect();
        let admitted = fresh.len();
        for ev in fresh.into_iter().rev() {
            self.events.push_front(ev);
        }
        self.events.truncate(policy.max_labels);
        self.evict_expired(now, policy.timeout);
        if admitted > 0 {
            debug!(
                "Overlay: +{} of {} records (threshold {:.2}), {} live",
                admitted,
                records.len(),
                policy.min_confidence,
                self.events.len()
            );
        }
        admitted
    }

    /// Drop events older than `timeout`.
    pub fn evict_expired(&mut self, now: Instant, timeout: Duration) {
        self.events.retain(|e| e.age(now) <= timeout);
    }

    /// Stack labels top-down from the margin. The first label that would
    /// cross the bottom margin ends the layout.
    pub fn layout(&self, width: usize, height: usize, style: &LabelStyle) -> Vec<LabelPlacement> {
        let mut placements = Vec::new();
        let bottom_limit = height as i64 - style.margin as i64;
        let mut top = style.margin as i64;
        for ev in &self.events {
            let text = ev.text();
            let (text_len, text_height) = style.measure(&text);
            let plate_w = text_height + 2 * style.padding;
            let plate_h = text_len + 2 * style.padding;
            if top + plate_h as i64 > bottom_limit {
                break;
            }
            let x = width as i64 - style.margin as i64 - plate_w as i64;
            placements.push(LabelPlacement {
                text,
                x: x as i32,
                y: top as i32,
                width: plate_w,
                height: plate_h,
                text_len,
                text_height,
            });
            top += plate_h as i64 + style.spacing as i64;
        }
        placements
    }

    /// Paint the current labels onto `surface`.
    pub fn render(&self, surface: &mut RenderSurface, style: &LabelStyle) {
        if self.events.is_empty() {
            return;
        }
        let placements = self.layout(surface.width(), surface.height(), style);
        let font = style.font.mono_font();
        let tc = style.text_color;
        let text_style = MonoTextStyle::new(font, Rgb888::new(tc.r, tc.g, tc.b));
        for p in placements {
            surface.blend_rect(p.x, p.y, p.width, p.height, style.background);
            let pad = style.padding as i32;
            // Reading direction runs bottom → top, so the first glyph sits
            // at the bottom of the plate.
            let origin = (p.x + pad, p.y + pad + p.text_len as i32 - 1);
            let size = Size::new(p.text_len, p.text_height);
            let mut canvas = RotatedCanvas::new(surface, origin, size, tc.a);
            let _ = Text::with_baseline(&p.text, Point::zero(), text_style, Baseline::Top)
                .draw(&mut canvas);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rgb;

    fn record(name: &str, confidence: f64) -> DetectionRecord {
        DetectionRecord {
            common_name: name.to_string(),
            confidence,
            start: 0.0,
        }
    }

    fn policy() -> IngestPolicy {
        IngestPolicy {
            min_confidence: 0.7,
            max_labels: 10,
            timeout: Duration::from_secs(30),
            bottom_offset: 50,
        }
    }

    #[test]
    fn test_below_threshold_is_rejected() {
        let mut ov = DetectionOverlay::new();
        let now = Instant::now();
        let n = ov.ingest(&[record("Wren", 0.69), record("Jay", f64::NAN)], 0.0, &policy(), 480, now);
        assert_eq!(n, 0);
        assert!(ov.is_empty());
        let n = ov.ingest(&[record("Robin", 0.7)], 0.0, &policy(), 480, now);
        assert_eq!(n, 1, "threshold is inclusive");
    }

    #[test]
    fn test_newest_first_and_anchor() {
        let mut ov = DetectionOverlay::new();
        let now = Instant::now();
        ov.ingest(&[record("Owl", 0.9)], 1.5, &policy(), 480, now);
        ov.ingest(&[record("Crow", 0.8), record("Hawk", 0.95)], 0.0, &policy(), 480, now);
        let names: Vec<&str> = ov.events().map(|e| e.label.as_str()).collect();
        assert_eq!(names, ["Crow", "Hawk", "Owl"]);
        let owl = ov.events().last().unwrap();
        assert_eq!(owl.vertical_anchor, 430);
        assert_eq!(owl.delay_secs, 1.5);
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let mut ov = DetectionOverlay::new();
        let now = Instant::now();
        for i in 0..50 {
            ov.ingest(&[record(&format!("bird{}", i), 0.9)], 0.0, &policy(), 480, now);
        }
        assert_eq!(ov.len(), 10);
        let names: Vec<String> = ov.events().map(|e| e.label.clone()).collect();
        let expected: Vec<String> = (40..50).rev().map(|i| format!("bird{}", i)).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_cap_applies_to_single_burst() {
        let mut ov = DetectionOverlay::new();
        let burst: Vec<DetectionRecord> = (0..50).map(|i| record(&format!("b{}", i), 0.9)).collect();
        ov.ingest(&burst, 0.0, &policy(), 480, Instant::now());
        assert_eq!(ov.len(), 10);
    }

    #[test]
    fn test_expired_events_are_dropped_on_ingest() {
        let mut ov = DetectionOverlay::new();
        let t0 = Instant::now();
        ov.ingest(&[record("Owl", 0.9)], 0.0, &policy(), 480, t0);
        let later = t0 + Duration::from_secs(31);
        ov.ingest(&[record("Crow", 0.9)], 0.0, &policy(), 480, later);
        let names: Vec<&str> = ov.events().map(|e| e.label.as_str()).collect();
        assert_eq!(names, ["Crow"]);
    }

    #[test]
    fn test_evict_expired_without_ingest() {
        let mut ov = DetectionOverlay::new();
        let t0 = Instant::now();
        ov.ingest(&[record("Owl", 0.9)], 0.0, &policy(), 480, t0);
        ov.evict_expired(t0 + Duration::from_secs(29), Duration::from_secs(30));
        assert_eq!(ov.len(), 1);
        ov.evict_expired(t0 + Duration::from_secs(31), Duration::from_secs(30));
        assert!(ov.is_empty());
    }

    #[test]
    fn test_label_text() {
        let ev = DetectionEvent {
            label: "Barn Owl".into(),
            confidence: 0.876,
            observed_at: Instant::now(),
            vertical_anchor: 0,
            start_secs: 0.0,
            delay_secs: 0.0,
        };
        assert_eq!(ev.text(), "Barn Owl (88%)");
    }

    #[test]
    fn test_measure_uses_font_metrics() {
        let style = LabelStyle {
            font: LabelFont::Small,
            ..LabelStyle::default()
        };
        assert_eq!(style.measure("abc"), (18, 10));
        assert_eq!(style.measure(""), (0, 10));
    }

    #[test]
    fn test_layout_stacks_top_down_at_right_edge() {
        let mut ov = DetectionOverlay::new();
        let now = Instant::now();
        ov.ingest(&[record("Owl", 0.9), record("Wren", 0.9)], 0.0, &policy(), 480, now);
        let style = LabelStyle {
            font: LabelFont::Small,
            ..LabelStyle::default()
        };
        let p = ov.layout(200, 480, &style);
        assert_eq!(p.len(), 2);
        // "Owl (90%)" = 9 chars × 6 px = 54, plate = 54 + 8 tall, 10 + 8 wide
        assert_eq!(p[0].text, "Owl (90%)");
        assert_eq!((p[0].x, p[0].y, p[0].width, p[0].height), (200 - 10 - 18, 10, 18, 62));
        assert_eq!(p[1].y, 10 + 62 + 5);
    }

    #[test]
    fn test_layout_stops_at_first_label_that_does_not_fit() {
        let mut ov = DetectionOverlay::new();
        let now = Instant::now();
        // Newest first: long, then a short one that would fit on its own.
        ov.ingest(
            &[record("A Very Long Bird Name Indeed", 0.9), record("Jay", 0.9)],
            0.0,
            &policy(),
            480,
            now,
        );
        let style = LabelStyle {
            font: LabelFont::Small,
            ..LabelStyle::default()
        };
        // Long label needs (28+6)*6+8 = 212 px; only 100 - 20 = 80 available
        let p = ov.layout(200, 100, &style);
        assert!(p.is_empty(), "no reflow of shorter labels: {:?}", p);
    }

    #[test]
    fn test_render_paints_plate_on_right_edge() {
        let mut ov = DetectionOverlay::new();
        ov.ingest(&[record("Owl", 0.9)], 0.0, &policy(), 120, Instant::now());
        let mut s = RenderSurface::new(100, 120, Rgb::WHITE);
        let style = LabelStyle::default();
        ov.render(&mut s, &style);
        // Left half untouched
        assert_eq!(s.pixel(5, 60), Some(Rgb::WHITE));
        // Plate corner darkened by the translucent background
        let corner = s.pixel(100 - 10 - 1, 10).unwrap();
        assert!(corner.r < 255, "plate should darken the corner, got {}", corner);
    }
}
