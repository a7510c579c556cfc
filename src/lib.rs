//! duplex-audio - full-duplex audio capture and playback engine.
//!
//! Opens the platform default input and output devices, moves audio between
//! the real-time audio context and the control thread through fixed-capacity
//! ring buffers, resamples between the hardware rate and the configured
//! target rate, and runs acoustic echo cancellation (SpeexDSP) over the
//! captured signal using the playback signal as the far-end reference.
//!
//! Audio I/O uses a dedicated-thread ALSA backend on Linux and OS-owned
//! cpal callbacks elsewhere; the backend is selected at build time.

mod backend;
mod config;
mod dsp;
mod engine;
mod error;
mod ring;

pub use backend::{Direction, PlatformAudioUnit};
pub use config::EngineConfig;
pub use engine::DuplexEngine;
pub use error::AudioError;
pub use ring::RingBuffer;
