pub mod analyser;
pub mod audio_graph;
pub mod color;
pub mod config;
pub mod console_display;
pub mod dsp;
pub mod feed;
pub mod media_source;
pub mod overlay;
pub mod renderer;
pub mod scheduler;
pub mod surface;
pub mod types;
pub mod visualizer;
pub mod wav_player;

#[cfg(feature = "audio")]
pub mod audio_input;
