use crate::types::{Rgb, Rgba};
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use std::convert::Infallible;

/// Fixed-size RGB raster, row-major, row 0 at the top.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSurface {
    width: usize,
    height: usize,
    pixels: Vec<Rgb>,
}

impl RenderSurface {
    pub fn new(width: usize, height: usize, fill: Rgb) -> Self {
        Self {
            width,
            height,
            pixels: vec![fill; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<Rgb> {
        if x < self.width && y < self.height {
            Some(self.pixels[y * self.width + x])
        } else {
            None
        }
    }

    pub fn row(&self, y: usize) -> &[Rgb] {
        if y >= self.height {
            return &[];
        }
        &self.pixels[y * self.width..(y + 1) * self.width]
    }

    pub fn set_pixel(&mut self, x: i32, y: i32, color: Rgb) {
        if x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height {
            self.pixels[y as usize * self.width + x as usize] = color;
        }
    }

    pub fn blend_pixel(&mut self, x: i32, y: i32, color: Rgba) {
        if x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height {
            let idx = y as usize * self.width + x as usize;
            self.pixels[idx] = color.over(self.pixels[idx]);
        }
    }

    pub fn clear(&mut self, color: Rgb) {
        self.pixels.fill(color);
    }

    /// Fill a rectangle, clipped to the surface.
    pub fn fill_rect(&mut self, x: i32, y: i32, w: u32, h: u32, color: Rgb) {
        let Some((x0, y0, x1, y1)) = self.clip(x, y, w, h) else {
            return;
        };
        for row in y0..y1 {
            let start = row * self.width;
            self.pixels[start + x0..start + x1].fill(color);
        }
    }

    /// Composite a translucent rectangle, clipped to the surface.
    pub fn blend_rect(&mut self, x: i32, y: i32, w: u32, h: u32, color: Rgba) {
        let Some((x0, y0, x1, y1)) = self.clip(x, y, w, h) else {
            return;
        };
        for row in y0..y1 {
            let start = row * self.width;
            for px in &mut self.pixels[start + x0..start + x1] {
                *px = color.over(*px);
            }
        }
    }

    /// Copy of rows `1..height`, i.e. everything except the topmost row.
    pub fn snapshot_below_top(&self) -> Vec<Rgb> {
        if self.height == 0 {
            return Vec::new();
        }
        self.pixels[self.width..].to_vec()
    }

    /// Write `rows` (a whole number of rows) starting at row 0.
    pub fn put_rows_from_top(&mut self, rows: &[Rgb]) {
        let n = rows.len().min(self.pixels.len());
        self.pixels[..n].copy_from_slice(&rows[..n]);
    }

    pub fn copy_from(&mut self, other: &RenderSurface) {
        if self.width == other.width && self.height == other.height {
            self.pixels.copy_from_slice(&other.pixels);
        } else {
            *self = other.clone();
        }
    }

    fn clip(&self, x: i32, y: i32, w: u32, h: u32) -> Option<(usize, usize, usize, usize)> {
        let x0 = x.max(0) as i64;
        let y0 = y.max(0) as i64;
        let x1 = (x as i64 + w as i64).min(self.width as i64);
        let y1 = (y as i64 + h as i64).min(self.height as i64);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0 as usize, y0 as usize, x1 as usize, y1 as usize))
    }
}

/// Draw target that renders into a surface rotated 90° counter-clockwise
/// around `origin`: local +x runs up the screen, local +y runs right.
/// Pixels are alpha-composited with `alpha`.
pub struct RotatedCanvas<'a> {
    surface: &'a mut RenderSurface,
    origin: (i32, i32),
    size: Size,
    alpha: f32,
}

impl<'a> RotatedCanvas<'a> {
    /// `size` is the extent in local (unrotated) coordinates.
    pub fn new(surface: &'a mut RenderSurface, origin: (i32, i32), size: Size, alpha: f32) -> Self {
        Self {
            surface,
            origin,
            size,
            alpha,
        }
    }

    fn to_surface(&self, p: Point) -> (i32, i32) {
        (self.origin.0 + p.y, self.origin.1 - p.x)
    }
}

impl OriginDimensions for RotatedCanvas<'_> {
    fn size(&self) -> Size {
        self.size
    }
}

impl DrawTarget for RotatedCanvas<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if point.x < 0
                || point.y < 0
                || point.x as u32 >= self.size.width
                || point.y as u32 >= self.size.height
            {
                continue;
            }
            let (sx, sy) = self.to_surface(point);
            let c = Rgba::new(color.r(), color.g(), color.b(), self.alpha);
            self.surface.blend_pixel(sx, sy, c);
        }
        Ok(())
    }
}
