//! Interrupt/callback-driven backend over cpal.
//!
//! The OS owns the high-priority audio thread and invokes the stream
//! callbacks; this backend's only job inside them is to be fast and
//! non-blocking: produce captured samples into the capture ring, drain the
//! playback ring and zero-fill any shortfall. Scratch buffers are
//! closure-owned and sized at open time from the negotiated buffer-size
//! bound, so the callbacks themselves never allocate.

use std::sync::{Arc, Mutex};

use cpal::SampleFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{DeviceClaim, Direction, PlatformAudioUnit};
use crate::config::EngineConfig;
use crate::error::AudioError;
use crate::ring::RingBuffer;

pub(crate) struct CpalUnit {
    stream: cpal::Stream,
    rate: u32,
    running: bool,
    _claim: DeviceClaim,
}

impl CpalUnit {
    pub(crate) fn open(
        dir: Direction,
        _config: &EngineConfig,
        ring: Arc<Mutex<RingBuffer>>,
        claim: DeviceClaim,
    ) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let (stream, rate) = match dir {
            Direction::Capture => {
                let device = host
                    .default_input_device()
                    .ok_or_else(|| AudioError::device("no default input device", -1))?;
                let supported = device.default_input_config().map_err(|e| {
                    AudioError::device(format!("failed to query input config: {e}"), -1)
                })?;
                let rate = supported.sample_rate().0;
                let channels = supported.channels() as usize;
                let scratch = scratch_frames(supported.buffer_size());
                let stream_config: cpal::StreamConfig = supported.config();
                let stream = match supported.sample_format() {
                    SampleFormat::I16 => {
                        build_capture_i16(&device, &stream_config, ring, channels, scratch)?
                    }
                    SampleFormat::F32 => {
                        build_capture_f32(&device, &stream_config, ring, channels, scratch)?
                    }
                    other => {
                        return Err(AudioError::Format(format!(
                            "unsupported input sample format {other:?}"
                        )));
                    }
                };
                log::info!("cpal capture: rate={rate}, channels={channels}");
                (stream, rate)
            }
            Direction::Playback => {
                let device = host
                    .default_output_device()
                    .ok_or_else(|| AudioError::device("no default output device", -1))?;
                let supported = device.default_output_config().map_err(|e| {
                    AudioError::device(format!("failed to query output config: {e}"), -1)
                })?;
                let rate = supported.sample_rate().0;
                let channels = supported.channels() as usize;
                let scratch = scratch_frames(supported.buffer_size());
                let stream_config: cpal::StreamConfig = supported.config();
                let stream = match supported.sample_format() {
                    SampleFormat::I16 => {
                        build_render_i16(&device, &stream_config, ring, channels, scratch)?
                    }
                    SampleFormat::F32 => {
                        build_render_f32(&device, &stream_config, ring, channels, scratch)?
                    }
                    other => {
                        return Err(AudioError::Format(format!(
                            "unsupported output sample format {other:?}"
                        )));
                    }
                };
                log::info!("cpal playback: rate={rate}, channels={channels}");
                (stream, rate)
            }
        };
        // Streams may autostart on build; hold them until Start.
        stream
            .pause()
            .map_err(|e| AudioError::device(format!("failed to hold new stream: {e}"), -1))?;
        Ok(Self {
            stream,
            rate,
            running: false,
            _claim: claim,
        })
    }
}

fn build_err(e: cpal::BuildStreamError) -> AudioError {
    AudioError::device(format!("failed to build stream: {e}"), -1)
}

/// Scratch size in frames for the callback-owned mono buffer, from the
/// negotiated buffer-size bound. Hosts reporting no bound (or an absurd
/// one) get a generous fixed size; the callbacks keep a resize guard for
/// the pathological case of a delivery larger than this.
fn scratch_frames(size: &cpal::SupportedBufferSize) -> usize {
    const FALLBACK: usize = 8192;
    const CEILING: usize = 1 << 15;
    match *size {
        cpal::SupportedBufferSize::Range { max, .. } => (max as usize).clamp(1, CEILING),
        cpal::SupportedBufferSize::Unknown => FALLBACK,
    }
}

fn build_capture_i16(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: Arc<Mutex<RingBuffer>>,
    channels: usize,
    scratch: usize,
) -> Result<cpal::Stream, AudioError> {
    let mut mono = vec![0i16; scratch];
    device
        .build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let frames = data.len() / channels;
                if mono.len() < frames {
                    mono.resize(frames, 0);
                }
                for i in 0..frames {
                    mono[i] = data[i * channels];
                }
                ring.lock().unwrap().produce(&mono[..frames]);
            },
            |err| log::warn!("input stream error: {err}"),
            None,
        )
        .map_err(build_err)
}

fn build_capture_f32(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: Arc<Mutex<RingBuffer>>,
    channels: usize,
    scratch: usize,
) -> Result<cpal::Stream, AudioError> {
    let mut mono = vec![0i16; scratch];
    device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let frames = data.len() / channels;
                if mono.len() < frames {
                    mono.resize(frames, 0);
                }
                for i in 0..frames {
                    let clamped = data[i * channels].clamp(-1.0, 1.0);
                    mono[i] = (clamped * i16::MAX as f32) as i16;
                }
                ring.lock().unwrap().produce(&mono[..frames]);
            },
            |err| log::warn!("input stream error: {err}"),
            None,
        )
        .map_err(build_err)
}

fn build_render_i16(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: Arc<Mutex<RingBuffer>>,
    channels: usize,
    scratch: usize,
) -> Result<cpal::Stream, AudioError> {
    let mut mono = vec![0i16; scratch];
    device
        .build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                if mono.len() < frames {
                    mono.resize(frames, 0);
                }
                let n = ring.lock().unwrap().fill(&mut mono[..frames]);
                mono[n..frames].fill(0);
                for i in 0..frames {
                    let s = mono[i];
                    for c in 0..channels {
                        data[i * channels + c] = s;
                    }
                }
            },
            |err| log::warn!("output stream error: {err}"),
            None,
        )
        .map_err(build_err)
}

fn build_render_f32(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: Arc<Mutex<RingBuffer>>,
    channels: usize,
    scratch: usize,
) -> Result<cpal::Stream, AudioError> {
    let mut mono = vec![0i16; scratch];
    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                if mono.len() < frames {
                    mono.resize(frames, 0);
                }
                let n = ring.lock().unwrap().fill(&mut mono[..frames]);
                mono[n..frames].fill(0);
                for i in 0..frames {
                    let s = mono[i] as f32 / i16::MAX as f32;
                    for c in 0..channels {
                        data[i * channels + c] = s;
                    }
                }
            },
            |err| log::warn!("output stream error: {err}"),
            None,
        )
        .map_err(build_err)
}

impl PlatformAudioUnit for CpalUnit {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running {
            return Ok(());
        }
        self.stream
            .play()
            .map_err(|e| AudioError::device(format!("failed to start stream: {e}"), -1))?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if !self.running {
            return Ok(());
        }
        self.stream
            .pause()
            .map_err(|e| AudioError::device(format!("failed to stop stream: {e}"), -1))?;
        self.running = false;
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }
}
