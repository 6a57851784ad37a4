use crate::audio_graph::GraphError;
use crate::media_source::MediaSource;
use crate::types::*;
use crossbeam_channel::{bounded, Receiver};
use hound::{SampleFormat, WavReader};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Samples sent per AudioChunk. ~21ms at 48kHz.
const CHUNK_SIZE: usize = 1024;

/// Streams a PCM WAV file as if it were a live source, at real-time pace.
///
/// The file is read and mixed to mono up front, so readiness is known at
/// construction. With `looped` set the file repeats until the graph drops
/// the stream.
pub struct WavSource {
    path: PathBuf,
    mono: Option<Vec<f32>>,
    sample_rate: u32,
    looped: bool,
    clock: SessionClock,
}

impl WavSource {
    pub fn open_file(path: &Path, looped: bool, clock: SessionClock) -> Result<Self, GraphError> {
        let reader = WavReader::open(path)
            .map_err(|e| GraphError::Media(format!("{}: {}", path.display(), e)))?;

        let spec = reader.spec();
        let sample_rate = spec.sample_rate;
        let channels = spec.channels.max(1) as usize;

        info!(
            "WAV: {:?}  {} Hz  {} ch  {:?}  {} bit",
            path.file_name().unwrap_or_default(),
            sample_rate,
            channels,
            spec.sample_format,
            spec.bits_per_sample,
        );

        // Read all samples as f32
        let samples_f32: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .filter_map(|s| s.ok())
                .collect(),
            SampleFormat::Int => {
                let max = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .filter_map(|s| s.ok())
                    .map(|s| s as f32 / max)
                    .collect()
            }
        };

        // Mix down to mono
        let mono: Vec<f32> = if channels == 1 {
            samples_f32
        } else {
            samples_f32
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };

        if mono.is_empty() {
            warn!("WAV {} contains no samples", path.display());
        }

        Ok(Self {
            path: path.to_path_buf(),
            mono: Some(mono),
            sample_rate,
            looped,
            clock,
        })
    }
}

impl MediaSource for WavSource {
    fn is_ready(&self) -> bool {
        self.mono.as_ref().is_some_and(|m| !m.is_empty())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn open(&mut self) -> Result<Receiver<AudioChunk>, GraphError> {
        let mono = self.mono.take().ok_or(GraphError::SourceNotReady)?;
        let (tx, rx) = bounded::<AudioChunk>(16);
        let sample_rate = self.sample_rate;
        let looped = self.looped;
        let clock = self.clock.clone();
        let name = self.path.display().to_string();

        let duration_secs = mono.len() as f64 / sample_rate as f64;
        info!(
            "WAV: {:.2}s, {} samples → streaming at real-time pace{}",
            duration_secs,
            mono.len(),
            if looped { " (looped)" } else { "" }
        );

        thread::Builder::new()
            .name("wav-source".into())
            .spawn(move || {
                let chunk_dur = Duration::from_secs_f64(CHUNK_SIZE as f64 / sample_rate as f64);
                loop {
                    let start = Instant::now();
                    for (i, chunk) in mono.chunks(CHUNK_SIZE).enumerate() {
                        // Pace to real time: wait until this chunk's expected send time
                        let target = chunk_dur * i as u32;
                        let elapsed = start.elapsed();
                        if elapsed < target {
                            thread::sleep(target - elapsed);
                        }

                        let event = AudioChunk {
                            timestamp_us: clock.now_us(),
                            samples: chunk.to_vec(),
                            sample_rate,
                        };

                        if tx.send(event).is_err() {
                            // Graph shut down
                            return;
                        }
                    }
                    if !looped {
                        break;
                    }
                }
                info!("WAV playback complete: {}", name);
            })?;

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &Path, channels: u16, frames: usize) {
        let spec = WavSpec {
            channels,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut w = WavWriter::create(path, spec).unwrap();
        for i in 0..frames * channels as usize {
            let v = if i % 2 == 0 { 16384 } else { -16384 };
            w.write_sample(v as i16).unwrap();
        }
        w.finalize().unwrap();
    }

    #[test]
    fn test_missing_file_is_media_error() {
        let err = WavSource::open_file(Path::new("/nonexistent.wav"), false, SessionClock::new())
            .err()
            .unwrap();
        assert!(matches!(err, GraphError::Media(_)));
    }

    #[test]
    fn test_stereo_file_streams_mono_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 2, 2048);
        let mut src = WavSource::open_file(&path, false, SessionClock::new()).unwrap();
        assert!(src.is_ready());
        assert_eq!(src.sample_rate(), 48000);
        let rx = src.open().unwrap();
        assert!(!src.is_ready(), "a source is opened once");
        let chunks: Vec<AudioChunk> = rx.iter().collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].samples.len(), CHUNK_SIZE);
        // L = +0.5, R = -0.5 → mono 0
        assert!(chunks[0].samples.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn test_empty_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        write_wav(&path, 1, 0);
        let src = WavSource::open_file(&path, false, SessionClock::new()).unwrap();
        assert!(!src.is_ready());
    }
}
