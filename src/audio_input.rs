use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::audio_graph::GraphError;
use crate::media_source::{AudioSink, MediaSource};
use crate::types::{AudioChunk, SessionClock};

const CHUNK_SIZE: usize = 1024;

/// Upper bound on audio queued for playback, in samples (~1 s at 48kHz).
const MAX_PLAYBACK_BACKLOG: usize = 48_000;

/// Live capture from the default input device.
///
/// Ready once a device and stream configuration have been found. The cpal
/// `Stream` is created by [`MediaSource::open`] and lives as long as this
/// value; drop it to stop capture.
pub struct LiveInput {
    device: Device,
    config: StreamConfig,
    format: SampleFormat,
    sample_rate: u32,
    clock: SessionClock,
    stream: Option<Stream>,
}

impl LiveInput {
    /// Probe the default input device. Prefers 48kHz when the device offers it.
    pub fn probe(clock: SessionClock) -> Result<Self, GraphError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| GraphError::NoDevice("no default audio input device".into()))?;

        info!(
            "Audio input: {}",
            device.name().unwrap_or_else(|_| "unknown".into())
        );

        let supported = device
            .default_input_config()
            .map_err(|e| GraphError::NoDevice(format!("no supported input config: {e}")))?;

        // Same channel count as the default, any range that covers 48kHz.
        let preferred = cpal::SampleRate(48000);
        let config_48k = device.supported_input_configs().ok().and_then(|configs| {
            configs
                .filter(|c| {
                    c.channels() == supported.channels()
                        && c.min_sample_rate() <= preferred
                        && c.max_sample_rate() >= preferred
                })
                .max_by_key(|c| c.max_sample_rate())
                .map(|c| c.with_sample_rate(preferred))
        });

        let (config, sample_rate, format): (StreamConfig, u32, SampleFormat) =
            if let Some(cfg) = config_48k {
                let sr = cfg.sample_rate().0;
                let fmt = cfg.sample_format();
                (cfg.into(), sr, fmt)
            } else {
                let sr = supported.sample_rate().0;
                let fmt = supported.sample_format();
                (supported.into(), sr, fmt)
            };

        info!(
            "Capture config: {}Hz  {} ch  {:?}",
            sample_rate, config.channels, format
        );

        Ok(Self {
            device,
            config,
            format,
            sample_rate,
            clock,
            stream: None,
        })
    }
}

impl MediaSource for LiveInput {
    fn is_ready(&self) -> bool {
        self.stream.is_none()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn open(&mut self) -> Result<Receiver<AudioChunk>, GraphError> {
        if self.stream.is_some() {
            return Err(GraphError::SourceNotReady);
        }
        let channels = self.config.channels as usize;

        // Realtime callback → accumulator thread. try_send keeps the
        // callback from ever blocking.
        let (raw_tx, raw_rx) = bounded::<Vec<f32>>(64);
        let err_fn = |e: cpal::StreamError| error!("Audio stream error: {e}");

        let stream = match self.format {
            SampleFormat::F32 => self.device.build_input_stream(
                &self.config,
                move |data: &[f32], _| {
                    let _ = raw_tx.try_send(mix_mono_f32(data, channels));
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => self.device.build_input_stream(
                &self.config,
                move |data: &[i16], _| {
                    let _ = raw_tx.try_send(mix_mono_i16(data, channels));
                },
                err_fn,
                None,
            ),
            SampleFormat::U16 => self.device.build_input_stream(
                &self.config,
                move |data: &[u16], _| {
                    let _ = raw_tx.try_send(mix_mono_u16(data, channels));
                },
                err_fn,
                None,
            ),
            fmt => {
                return Err(GraphError::Stream(format!(
                    "unsupported sample format {fmt:?}; use an F32 or I16 device"
                )))
            }
        }
        .map_err(|e| GraphError::Stream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| GraphError::Stream(e.to_string()))?;

        let (tx, rx) = bounded::<AudioChunk>(64);
        let sample_rate = self.sample_rate;
        let clock = self.clock.clone();
        thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let mut accum: Vec<f32> = Vec::with_capacity(CHUNK_SIZE * 4);
                for chunk in raw_rx {
                    accum.extend_from_slice(&chunk);
                    while accum.len() >= CHUNK_SIZE {
                        let samples: Vec<f32> = accum.drain(..CHUNK_SIZE).collect();
                        let event = AudioChunk {
                            timestamp_us: clock.now_us(),
                            samples,
                            sample_rate,
                        };
                        if tx.send(event).is_err() {
                            return; // Graph shut down
                        }
                    }
                }
            })?;

        self.stream = Some(stream);
        Ok(rx)
    }
}

// ─── Playback ───────────────────────────────────────────────────────────────

/// Plays the processed signal on the default output device.
///
/// The cpal output stream is not `Send`, so it is built and held on its own
/// thread; `write` only queues samples. No resampling is done: a device
/// running at a different rate plays at the wrong pitch, which is logged.
pub struct CpalSink {
    queue: Arc<Mutex<VecDeque<f32>>>,
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CpalSink {
    pub fn start(sample_rate: u32) -> Result<Self, GraphError> {
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(MAX_PLAYBACK_BACKLOG)));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (ready_tx, ready_rx) = bounded::<Result<(), GraphError>>(1);

        let cb_queue = queue.clone();
        let handle = thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                let stream = match build_output(sample_rate, cb_queue) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Park until the sink is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                shutdown_tx: Some(shutdown_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GraphError::Stream("audio output thread exited".into())),
        }
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, samples: &[f32], _sample_rate: u32) {
        let mut q = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        q.extend(samples.iter().copied());
        let excess = q.len().saturating_sub(MAX_PLAYBACK_BACKLOG);
        if excess > 0 {
            q.drain(..excess);
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shutdown_tx.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn build_output(sample_rate: u32, queue: Arc<Mutex<VecDeque<f32>>>) -> Result<Stream, GraphError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| GraphError::NoDevice("no default audio output device".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| GraphError::NoDevice(format!("no supported output config: {e}")))?;

    let format = supported.sample_format();
    let mut config: StreamConfig = supported.into();
    let wanted = cpal::SampleRate(sample_rate);
    let rate_ok = device
        .supported_output_configs()
        .map(|mut cs| {
            cs.any(|c| {
                c.channels() == config.channels
                    && c.min_sample_rate() <= wanted
                    && c.max_sample_rate() >= wanted
            })
        })
        .unwrap_or(false);
    if rate_ok {
        config.sample_rate = wanted;
    } else {
        warn!(
            "Output device cannot run at {} Hz; playing at {} Hz",
            sample_rate, config.sample_rate.0
        );
    }
    let channels = config.channels as usize;
    info!(
        "Audio output: {}  {}Hz  {} ch  {:?}",
        device.name().unwrap_or_else(|_| "unknown".into()),
        config.sample_rate.0,
        channels,
        format
    );

    let err_fn = |e: cpal::StreamError| error!("Audio output error: {e}");
    let stream = match format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                let mut q = queue.lock().unwrap_or_else(PoisonError::into_inner);
                for frame in data.chunks_mut(channels) {
                    let s = q.pop_front().unwrap_or(0.0);
                    frame.fill(s);
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _| {
                let mut q = queue.lock().unwrap_or_else(PoisonError::into_inner);
                for frame in data.chunks_mut(channels) {
                    let s = q.pop_front().unwrap_or(0.0).clamp(-1.0, 1.0);
                    frame.fill((s * i16::MAX as f32) as i16);
                }
            },
            err_fn,
            None,
        ),
        fmt => {
            return Err(GraphError::Stream(format!(
                "unsupported output sample format {fmt:?}"
            )))
        }
    }
    .map_err(|e| GraphError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| GraphError::Stream(e.to_string()))?;
    Ok(stream)
}

// ─── Per-format mono mixdown helpers ─────────────────────────────────────────

fn mix_mono_f32(data: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn mix_mono_i16(data: &[i16], channels: usize) -> Vec<f32> {
    const SCALE: f32 = i16::MAX as f32;
    if channels == 1 {
        return data.iter().map(|&s| s as f32 / SCALE).collect();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            sum as f32 / (channels as f32 * SCALE)
        })
        .collect()
}

fn mix_mono_u16(data: &[u16], channels: usize) -> Vec<f32> {
    // U16: 0 = -1.0, 32768 = 0.0, 65535 = +1.0
    const MID: f32 = 32768.0;
    const SCALE: f32 = 32768.0;
    if channels == 1 {
        return data.iter().map(|&s| (s as f32 - MID) / SCALE).collect();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| (s as f32 - MID) / SCALE).sum();
            sum / channels as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mix_stereo_f32() {
        let mono = mix_mono_f32(&[0.5, -0.5, 1.0, 0.0], 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn test_mix_i16_scales_to_unit() {
        let mono = mix_mono_i16(&[i16::MAX, i16::MAX], 2);
        assert_relative_eq!(mono[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_mix_u16_midpoint_is_silence() {
        let mono = mix_mono_u16(&[32768, 32768, 0], 1);
        assert_eq!(mono[0], 0.0);
        assert_relative_eq!(mono[2], -1.0);
    }
}
