//! Engine configuration, negotiated once at construction time.

use crate::error::AudioError;

/// Construction-time configuration for [`crate::DuplexEngine`].
///
/// The target rate is what the control thread sees; the hardware may
/// negotiate a different rate, and the engine resamples to reconcile the
/// difference. All fields are immutable once the engine is built.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Target sample rate in Hz (8000-48000).
    pub target_rate: u32,
    /// Processing frame size in samples; the echo canceller operates on
    /// exactly this many samples per frame.
    pub frame_size: usize,
    /// ALSA capture device name (e.g. "default", "plughw:0,0").
    pub capture_device: String,
    /// ALSA playback device name.
    pub playback_device: String,
    /// Ring buffer capacity in samples. Power of two, sized at construction,
    /// never resized.
    pub ring_capacity: usize,
    /// Echo filter tail length, in processing frames.
    pub echo_tail_frames: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let target_rate = 16_000;
        Self {
            target_rate,
            // 20 ms frames.
            frame_size: (target_rate / 50) as usize,
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            ring_capacity: 1 << 15,
            echo_tail_frames: 10,
        }
    }
}

impl EngineConfig {
    pub(crate) fn validate(&self) -> Result<(), AudioError> {
        if self.frame_size == 0 {
            return Err(AudioError::Config("frame size must be non-zero".into()));
        }
        if !(8_000..=48_000).contains(&self.target_rate) {
            return Err(AudioError::Config(format!(
                "target rate {} Hz outside supported range 8000-48000",
                self.target_rate
            )));
        }
        if !self.ring_capacity.is_power_of_two() {
            return Err(AudioError::Config(format!(
                "ring capacity {} is not a power of two",
                self.ring_capacity
            )));
        }
        if self.ring_capacity < self.frame_size {
            return Err(AudioError::Config(format!(
                "ring capacity {} smaller than frame size {}",
                self.ring_capacity, self.frame_size
            )));
        }
        if self.echo_tail_frames == 0 {
            return Err(AudioError::Config("echo tail must be non-zero".into()));
        }
        Ok(())
    }
}
