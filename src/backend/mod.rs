//! Platform audio backends.
//!
//! Exactly one concrete unit implementation is compiled per target: a
//! dedicated-thread ALSA poller on Linux, an OS-callback cpal unit
//! elsewhere. Both satisfy the same contract: open negotiates 16-bit PCM
//! against the system default device and records the actual rate, start and
//! stop are idempotent, and the real-time side only ever touches its ring
//! buffer under a lock held for the duration of a copy.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::EngineConfig;
use crate::error::AudioError;
use crate::ring::RingBuffer;

#[cfg(target_os = "linux")]
mod alsa;
#[cfg(not(target_os = "linux"))]
mod cpal;

/// Stream direction relative to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Capture,
    Playback,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Capture => "capture",
            Direction::Playback => "playback",
        }
    }
}

/// Contract every platform backend satisfies. Open is the constructor
/// (see [`open_unit`]); close is drop. Units are owned exclusively by the
/// engine and never copied.
pub trait PlatformAudioUnit {
    /// Begin hardware I/O. No-op when already running.
    fn start(&mut self) -> Result<(), AudioError>;
    /// Halt hardware I/O. No-op when already stopped. After this returns,
    /// no further real-time iteration touches the ring until `start`.
    fn stop(&mut self) -> Result<(), AudioError>;
    /// Sample rate the device actually negotiated at open time, which may
    /// differ from the requested target rate.
    fn sample_rate(&self) -> u32;
}

// One live handle per direction per process: the default device is global
// native state, so acquisition is claimed on open and released on close.
static CAPTURE_CLAIMED: AtomicBool = AtomicBool::new(false);
static PLAYBACK_CLAIMED: AtomicBool = AtomicBool::new(false);

pub(crate) struct DeviceClaim {
    dir: Direction,
}

impl DeviceClaim {
    pub(crate) fn acquire(dir: Direction) -> Result<Self, AudioError> {
        let slot = match dir {
            Direction::Capture => &CAPTURE_CLAIMED,
            Direction::Playback => &PLAYBACK_CLAIMED,
        };
        if slot
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AudioError::device(
                format!("{} device already claimed by another engine", dir.label()),
                -1,
            ));
        }
        Ok(Self { dir })
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        let slot = match self.dir {
            Direction::Capture => &CAPTURE_CLAIMED,
            Direction::Playback => &PLAYBACK_CLAIMED,
        };
        slot.store(false, Ordering::SeqCst);
    }
}

/// Open the platform unit for `dir` against the system default device,
/// wired to `ring` (capture units produce into it, playback units drain it).
pub(crate) fn open_unit(
    dir: Direction,
    config: &EngineConfig,
    ring: Arc<Mutex<RingBuffer>>,
) -> Result<Box<dyn PlatformAudioUnit>, AudioError> {
    let claim = DeviceClaim::acquire(dir)?;
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(alsa::AlsaUnit::open(dir, config, ring, claim)?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(Box::new(cpal::CpalUnit::open(dir, config, ring, claim)?))
    }
}
