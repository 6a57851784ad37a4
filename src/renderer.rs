//! Scroll-buffer renderer: time flows bottom-to-top, one raster row per tick.
//!
//! Two surfaces are kept. The raster holds scrolled spectrogram history and
//! is the only thing that scrolls. The frame is what gets presented: a copy
//! of the raster with the detection labels painted on top, rebuilt every
//! tick, so labels never leak into the scroll history.

use crate::color::ColorScheme;
use crate::overlay::{DetectionOverlay, LabelStyle};
use crate::surface::RenderSurface;
use crate::types::Rgb;
use log::debug;

pub struct ScrollRenderer {
    raster: RenderSurface,
    frame: RenderSurface,
    scheme: ColorScheme,
    /// Overrides the scheme background when set.
    background: Option<Rgb>,
    rows_painted: u64,
}

impl ScrollRenderer {
    pub fn new(width: usize, height: usize, scheme: ColorScheme) -> Self {
        let raster = RenderSurface::new(width, height, scheme.background());
        Self {
            frame: raster.clone(),
            raster,
            scheme,
            background: None,
            rows_painted: 0,
        }
    }

    /// Start with an explicit background instead of the scheme's.
    pub fn with_background(mut self, background: Option<Rgb>) -> Self {
        self.background = background;
        let (w, h) = (self.width(), self.height());
        self.resize(w, h);
        self
    }

    pub fn width(&self) -> usize {
        self.raster.width()
    }

    pub fn height(&self) -> usize {
        self.raster.height()
    }

    /// Scroll history only, without labels.
    pub fn raster(&self) -> &RenderSurface {
        &self.raster
    }

    /// Last composed frame: raster plus overlay.
    pub fn frame(&self) -> &RenderSurface {
        &self.frame
    }

    pub fn scheme(&self) -> ColorScheme {
        self.scheme
    }

    /// Swap the active scheme. Already-painted rows keep their colors; the
    /// new background applies from the next clear.
    pub fn set_scheme(&mut self, scheme: ColorScheme) {
        if scheme != self.scheme {
            debug!("Color scheme {} → {}", self.scheme, scheme);
            self.scheme = scheme;
        }
    }

    /// Color used when the raster is cleared.
    pub fn background(&self) -> Rgb {
        self.background.unwrap_or_else(|| self.scheme.background())
    }

    /// Like a scheme swap, the new background applies from the next clear.
    pub fn set_background(&mut self, background: Option<Rgb>) {
        if background != self.background {
            debug!("Background {:?} → {:?}", self.background, background);
            self.background = background;
        }
    }

    pub fn rows_painted(&self) -> u64 {
        self.rows_painted
    }

    /// Drop all history and start over at the new size.
    pub fn resize(&mut self, width: usize, height: usize) {
        self.raster = RenderSurface::new(width, height, self.background());
        self.frame = self.raster.clone();
        self.rows_painted = 0;
    }

    /// One render tick: scroll, paint the newest spectral row, compose labels.
    pub fn tick(&mut self, spectrum: &[u8], overlay: &DetectionOverlay, style: &LabelStyle) {
        if self.raster.is_empty() {
            return;
        }
        self.scroll_up();
        self.paint_bottom_row(spectrum);
        self.rows_painted += 1;
        self.frame.copy_from(&self.raster);
        overlay.render(&mut self.frame, style);
    }

    fn scroll_up(&mut self) {
        let shifted = self.raster.snapshot_below_top();
        self.raster.clear(self.background());
        self.raster.put_rows_from_top(&shifted);
    }

    fn paint_bottom_row(&mut self, spectrum: &[u8]) {
        let bins = spectrum.len();
        if bins == 0 {
            return;
        }
        let width = self.raster.width();
        let y = self.raster.height() as i32 - 1;
        let bar_width = width.div_ceil(bins).max(1) as u32;
        for (i, &m) in spectrum.iter().enumerate() {
            let x = (i * width / bins) as i32;
            let color = self.scheme.color_for_magnitude(m);
            self.raster.fill_rect(x, y, bar_width, 1, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_overlay() -> (DetectionOverlay, LabelStyle) {
        (DetectionOverlay::new(), LabelStyle::default())
    }

    #[test]
    fn test_new_row_lands_at_bottom() {
        let (ov, st) = empty_overlay();
        let mut r = ScrollRenderer::new(4, 3, ColorScheme::Grayscale);
        r.tick(&[255, 255, 255, 255], &ov, &st);
        assert!(r.raster().row(2).iter().all(|&p| p == Rgb::WHITE));
        assert!(r.raster().row(1).iter().all(|&p| p == Rgb::BLACK));
    }

    #[test]
    fn test_rows_move_up_one_per_tick() {
        let (ov, st) = empty_overlay();
        let mut r = ScrollRenderer::new(2, 3, ColorScheme::Grayscale);
        r.tick(&[10, 10], &ov, &st);
        r.tick(&[20, 20], &ov, &st);
        r.tick(&[30, 30], &ov, &st);
        r.tick(&[40, 40], &ov, &st);
        // Oldest row (10) has scrolled off the top
        assert_eq!(r.raster().row(0)[0], Rgb::new(20, 20, 20));
        assert_eq!(r.raster().row(1)[0], Rgb::new(30, 30, 30));
        assert_eq!(r.raster().row(2)[0], Rgb::new(40, 40, 40));
    }

    #[test]
    fn test_bars_cover_width_without_gaps() {
        let (ov, st) = empty_overlay();
        // 10 px across 3 bins: bar width rounds up to 4
        let mut r = ScrollRenderer::new(10, 1, ColorScheme::Grayscale);
        r.tick(&[255, 255, 255], &ov, &st);
        assert!(r.raster().row(0).iter().all(|&p| p == Rgb::WHITE));
    }

    #[test]
    fn test_more_bins_than_pixels() {
        let (ov, st) = empty_overlay();
        let mut r = ScrollRenderer::new(3, 2, ColorScheme::Grayscale);
        let spectrum: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
        r.tick(&spectrum, &ov, &st);
        assert_eq!(r.raster().row(1).len(), 3);
    }

    #[test]
    fn test_scheme_swap_is_not_retroactive() {
        let (ov, st) = empty_overlay();
        let mut r = ScrollRenderer::new(2, 2, ColorScheme::Grayscale);
        r.tick(&[255, 255], &ov, &st);
        r.set_scheme(ColorScheme::Lava);
        r.tick(&[0, 0], &ov, &st);
        assert_eq!(r.raster().row(0)[0], Rgb::WHITE);
        assert_eq!(r.raster().row(1)[0], ColorScheme::Lava.color(0.0));
    }

    #[test]
    fn test_background_change_is_not_retroactive() {
        let (ov, st) = empty_overlay();
        let blue = Rgb::new(0, 0, 200);
        let mut r = ScrollRenderer::new(2, 3, ColorScheme::Grayscale);
        r.tick(&[255, 255], &ov, &st);
        r.set_background(Some(blue));
        assert_eq!(r.background(), blue);
        // No spectrum yet: the vacated bottom row stays cleared
        r.tick(&[], &ov, &st);
        assert_eq!(r.raster().row(2)[0], blue);
        assert_eq!(r.raster().row(1)[0], Rgb::WHITE);
        assert_eq!(r.raster().row(0)[0], Rgb::BLACK, "old rows keep their color");
        r.set_background(None);
        assert_eq!(r.background(), Rgb::BLACK);
    }

    #[test]
    fn test_initial_background_override() {
        let bg = Rgb::new(7, 8, 9);
        let r = ScrollRenderer::new(3, 2, ColorScheme::Purple).with_background(Some(bg));
        assert!(r.raster().row(0).iter().all(|&p| p == bg));
        assert!(r.frame().row(1).iter().all(|&p| p == bg));
    }

    #[test]
    fn test_resize_clears_history() {
        let (ov, st) = empty_overlay();
        let mut r = ScrollRenderer::new(2, 2, ColorScheme::Grayscale);
        r.tick(&[255, 255], &ov, &st);
        r.resize(5, 4);
        assert_eq!(r.width(), 5);
        assert_eq!(r.height(), 4);
        assert_eq!(r.rows_painted(), 0);
        assert!(r.raster().row(3).iter().all(|&p| p == Rgb::BLACK));
    }

    #[test]
    fn test_zero_sized_surface_is_a_noop() {
        let (ov, st) = empty_overlay();
        let mut r = ScrollRenderer::new(0, 0, ColorScheme::Purple);
        r.tick(&[1, 2, 3], &ov, &st);
        assert_eq!(r.rows_painted(), 0);
    }
}
