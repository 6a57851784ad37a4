use crate::surface::RenderSurface;
use crate::types::Rgb;
use crossbeam_channel::Receiver;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shows composed frames in an ANSI truecolor terminal.
///
/// Each character cell carries two pixel rows: the upper half block takes
/// the top pixel as foreground and the bottom pixel as background.
pub struct ConsoleDisplay {
    rx: Receiver<Arc<RenderSurface>>,
    update_hz: u32,
}

impl ConsoleDisplay {
    pub fn new(rx: Receiver<Arc<RenderSurface>>, update_hz: u32) -> Self {
        Self { rx, update_hz }
    }

    /// Draw frames until the scheduler drops its sender.
    pub fn run(&self) {
        let min_gap = if self.update_hz == 0 {
            Duration::from_millis(100)
        } else {
            Duration::from_millis((1000 / self.update_hz).max(1) as u64)
        };
        let mut last_draw: Option<Instant> = None;
        let mut stdout = io::stdout();

        // Hide cursor
        print!("\x1b[?25l");

        for frame in self.rx.iter() {
            let now = Instant::now();
            if last_draw.is_some_and(|t| now.duration_since(t) < min_gap) {
                continue;
            }
            last_draw = Some(now);

            // Cursor home, no clear: every cell is overwritten
            let _ = write!(stdout, "\x1b[H{}", render_ansi(&frame));
            let _ = stdout.flush();
        }

        print!("\x1b[0m\x1b[?25h");
        let _ = stdout.flush();
    }
}

/// One frame as ANSI text, `ceil(height / 2)` lines of `width` cells.
pub fn render_ansi(surface: &RenderSurface) -> String {
    let mut out = String::with_capacity(surface.width() * surface.height() * 20);
    let mut y = 0;
    while y < surface.height() {
        let top = surface.row(y);
        let bottom = if y + 1 < surface.height() {
            Some(surface.row(y + 1))
        } else {
            None
        };
        for x in 0..surface.width() {
            let fg = top[x];
            let bg = bottom.map_or(Rgb::BLACK, |row| row[x]);
            let _ = write!(
                out,
                "\x1b[38;2;{};{};{}m\x1b[48;2;{};{};{}m▀",
                fg.r, fg.g, fg.b, bg.r, bg.g, bg.b
            );
        }
        out.push_str("\x1b[0m\n");
        y += 2;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_rows_per_line() {
        let mut s = RenderSurface::new(3, 4, Rgb::BLACK);
        s.set_pixel(0, 0, Rgb::WHITE);
        let text = render_ansi(&s);
        assert_eq!(text.lines().count(), 2);
        assert_eq!(text.lines().next().unwrap().matches('▀').count(), 3);
        assert!(text.starts_with("\x1b[38;2;255;255;255m\x1b[48;2;0;0;0m▀"));
    }

    #[test]
    fn test_odd_height_pads_with_black() {
        let s = RenderSurface::new(1, 3, Rgb::new(10, 20, 30));
        let text = render_ansi(&s);
        let last = text.lines().last().unwrap();
        assert!(last.contains("\x1b[38;2;10;20;30m\x1b[48;2;0;0;0m▀"));
    }

    #[test]
    fn test_empty_surface_renders_nothing() {
        let s = RenderSurface::new(0, 0, Rgb::BLACK);
        assert!(render_ansi(&s).is_empty());
    }
}
