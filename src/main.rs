use live_spectrogram::color::ColorScheme;
use live_spectrogram::config::{Config, ConfigHandle, ConfigPatch};
use live_spectrogram::console_display;
use live_spectrogram::feed::{FeedTransport, HttpTransport};
use live_spectrogram::media_source::{AudioSink, MediaSource, NullSink};
use live_spectrogram::scheduler::{Scheduler, SchedulerHandle};
use live_spectrogram::surface::RenderSurface;
use live_spectrogram::types::{Rgb, SessionClock};
use live_spectrogram::visualizer::Visualizer;
use live_spectrogram::wav_player::WavSource;
#[cfg(feature = "audio")]
use live_spectrogram::audio_input::{CpalSink, LiveInput};

use clap::Parser;
use crossbeam_channel::{bounded, Sender};
use log::{error, info, warn};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "live-spectrogram")]
#[command(about = "Live scrolling spectrogram with detection labels")]
struct Cli {
    /// Stream a WAV file as the audio source
    #[arg(long, conflicts_with = "live")]
    wav: Option<PathBuf>,

    /// Loop the WAV file
    #[arg(long, requires = "wav")]
    loop_wav: bool,

    /// Capture from the default input device (requires the 'audio' feature)
    #[arg(long)]
    live: bool,

    /// Play the processed signal on the default output device
    /// (requires the 'audio' feature)
    #[arg(long)]
    play: bool,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Detection feed URL
    #[arg(long)]
    feed_url: Option<String>,

    /// Do not poll the detection feed
    #[arg(long)]
    no_feed: bool,

    /// Viewport width in pixels
    #[arg(long, default_value_t = 120)]
    width: usize,

    /// Viewport height in pixels
    #[arg(long, default_value_t = 60)]
    height: usize,

    /// Redraw interval (ms)
    #[arg(long)]
    redraw_ms: Option<u64>,

    /// Feed poll interval (ms)
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Color scheme: purple, grayscale, lava, green-white
    #[arg(long)]
    scheme: Option<ColorScheme>,

    /// Draw frames in the terminal
    #[arg(long)]
    console: bool,

    /// Console display refresh rate (Hz)
    #[arg(long, default_value_t = 10)]
    display_hz: u32,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let cli = Cli::parse();
    let clock = SessionClock::new();

    // ─── Configuration ──────────────────────────────────────────────
    let mut base = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(url) = &cli.feed_url {
        base.feed_url = url.clone();
    }
    let overrides = ConfigPatch {
        redraw_interval_ms: cli.redraw_ms,
        poll_interval_ms: cli.poll_ms,
        color_scheme: cli.scheme,
        ..ConfigPatch::default()
    };
    let config = ConfigHandle::new(base);
    let cfg = config.update(&overrides);

    info!("═══════════════════════════════════════════════");
    info!("  LIVE SPECTROGRAM v{}", env!("CARGO_PKG_VERSION"));
    info!("  Viewport: {}x{}  scheme: {}", cli.width, cli.height, cfg.color_scheme);
    info!(
        "  Source: {}",
        match (&cli.wav, cli.live) {
            (Some(p), _) => format!("WAV {}", p.display()),
            (None, true) => "live input".to_string(),
            (None, false) => "none".to_string(),
        }
    );
    if cli.no_feed {
        info!("  Feed: off");
    } else {
        info!("  Feed: {} every {} ms", cfg.feed_url, cfg.poll_interval_ms);
    }
    if cli.console { info!("  UI: Console"); }
    info!("═══════════════════════════════════════════════");

    let mut viz = Visualizer::new(config.clone(), cli.width, cli.height);

    // ─── Audio source ───────────────────────────────────────────────
    // Held here for the whole run: a live capture stream stops when dropped.
    let mut source: Option<Box<dyn MediaSource>> = match open_source(&cli, &clock) {
        Ok(s) => s,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    if let Some(src) = source.as_deref_mut() {
        let sink = match open_sink(&cli, src.sample_rate()) {
            Ok(s) => s,
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        };
        if let Err(e) = viz.initialize(src, sink) {
            error!("Audio graph construction failed: {}", e);
            process::exit(1);
        }
    } else {
        warn!("No audio source; the spectrogram will stay blank");
    }

    // ─── Feed transport ─────────────────────────────────────────────
    let transport: Option<Box<dyn FeedTransport>> = if cli.no_feed {
        None
    } else {
        match HttpTransport::new(cfg.feed_url.clone(), cfg.feed_timeout()) {
            Ok(t) => Some(Box::new(t)),
            Err(e) => {
                warn!("Feed disabled: {}", e);
                None
            }
        }
    };

    // ─── Console display ────────────────────────────────────────────
    let mut frame_txs: Vec<Sender<Arc<RenderSurface>>> = Vec::new();
    let mut handles = Vec::new();
    if cli.console {
        let (tx, rx) = bounded::<Arc<RenderSurface>>(4);
        frame_txs.push(tx);
        let hz = cli.display_hz;
        match thread::Builder::new().name("display".into()).spawn(move || {
            console_display::ConsoleDisplay::new(rx, hz).run();
        }) {
            Ok(h) => handles.push(h),
            Err(e) => warn!("Console display unavailable: {}", e),
        }
    }

    // ─── Scheduler ──────────────────────────────────────────────────
    let mut scheduler = match Scheduler::spawn(viz, transport, frame_txs) {
        Ok(h) => h,
        Err(e) => {
            error!("Cannot start scheduler: {}", e);
            process::exit(1);
        }
    };

    info!("Running. Type 'help' for commands, 'quit' to stop.");
    command_loop(&scheduler);

    if let Some(mut viz) = scheduler.stop() {
        viz.shutdown();
    }
    drop(source);
    for h in handles {
        let _ = h.join();
    }
    info!("Bye");
}

fn open_source(
    cli: &Cli,
    clock: &SessionClock,
) -> Result<Option<Box<dyn MediaSource>>, live_spectrogram::audio_graph::GraphError> {
    if let Some(path) = &cli.wav {
        let src = WavSource::open_file(path, cli.loop_wav, clock.clone())?;
        return Ok(Some(Box::new(src)));
    }
    if cli.live {
        #[cfg(feature = "audio")]
        {
            return Ok(Some(Box::new(LiveInput::probe(clock.clone())?)));
        }
        #[cfg(not(feature = "audio"))]
        {
            error!("Live input requires the 'audio' feature");
        }
    }
    Ok(None)
}

fn open_sink(
    cli: &Cli,
    sample_rate: u32,
) -> Result<Box<dyn AudioSink>, live_spectrogram::audio_graph::GraphError> {
    if cli.play {
        #[cfg(feature = "audio")]
        {
            return Ok(Box::new(CpalSink::start(sample_rate)?));
        }
        #[cfg(not(feature = "audio"))]
        {
            warn!(
                "Playback at {} Hz requires the 'audio' feature; output muted",
                sample_rate
            );
        }
    }
    Ok(Box::new(NullSink))
}

// ─── Commands ───────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Command {
    Patch(ConfigPatch),
    Resize(usize, usize),
    Help,
    Quit,
}

const HELP: &str = "\
commands:
  gain <0-2>            amplification before analysis
  filter on|off         high-pass filter
  cutoff <hz>           high-pass cutoff (0-2000)
  scheme <name>         purple | grayscale | lava | green-white
  background <r g b>    raster background, or 'default' for the scheme's
  redraw <ms>           redraw interval
  poll <ms>             feed poll interval
  threshold <0-1>       minimum detection confidence
  fft <size>            analyser size, power of two
  resize <w> <h>        viewport size
  quit";

fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Err("empty command".into());
    };
    let args: Vec<&str> = words.collect();
    let arg = |i: usize| {
        args.get(i)
            .copied()
            .ok_or_else(|| format!("'{}' needs an argument", cmd))
    };
    fn num<T: std::str::FromStr>(s: &str) -> Result<T, String> {
        s.parse().map_err(|_| format!("not a number: {}", s))
    }
    let mut p = ConfigPatch::default();
    match cmd.to_ascii_lowercase().as_str() {
        "gain" => p.gain = Some(num(arg(0)?)?),
        "filter" => {
            p.highpass_enabled = Some(match arg(0)? {
                "on" | "true" | "1" => true,
                "off" | "false" | "0" => false,
                other => return Err(format!("filter on|off, got {}", other)),
            })
        }
        "cutoff" => p.highpass_cutoff_hz = Some(num(arg(0)?)?),
        "scheme" => p.color_scheme = Some(arg(0)?.parse()?),
        "background" | "bg" => {
            p.background_color = Some(match arg(0)? {
                "default" | "scheme" => None,
                r => Some(Rgb::new(num(r)?, num(arg(1)?)?, num(arg(2)?)?)),
            })
        }
        "redraw" => p.redraw_interval_ms = Some(num(arg(0)?)?),
        "poll" => p.poll_interval_ms = Some(num(arg(0)?)?),
        "threshold" => p.min_confidence = Some(num(arg(0)?)?),
        "fft" => p.fft_size = Some(num(arg(0)?)?),
        "resize" => return Ok(Command::Resize(num(arg(0)?)?, num(arg(1)?)?)),
        "help" | "?" => return Ok(Command::Help),
        "quit" | "exit" | "q" => return Ok(Command::Quit),
        other => return Err(format!("unknown command: {}", other)),
    }
    Ok(Command::Patch(p))
}

/// Read commands from stdin until `quit`. If stdin closes, keep running
/// until the process is interrupted.
fn command_loop(scheduler: &SchedulerHandle) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(Command::Patch(p)) => {
                if let Some(cfg) = scheduler.update_config(&p) {
                    info!(
                        "gain {:.2}  high-pass {} @ {:.0} Hz  scheme {}  redraw {} ms  poll {} ms  threshold {:.2}  fft {}",
                        cfg.gain,
                        if cfg.highpass_enabled { "on" } else { "off" },
                        cfg.highpass_cutoff_hz,
                        cfg.color_scheme,
                        cfg.redraw_interval_ms,
                        cfg.poll_interval_ms,
                        cfg.min_confidence,
                        cfg.fft_size
                    );
                }
            }
            Ok(Command::Resize(w, h)) => scheduler.resize(w, h),
            Ok(Command::Help) => println!("{}", HELP),
            Ok(Command::Quit) => return,
            Err(e) => warn!("{}", e),
        }
    }
    info!("stdin closed; running until interrupted (Ctrl+C)");
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
