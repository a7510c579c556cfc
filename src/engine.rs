//! The duplex engine: one capture unit, one render unit, two rings, and the
//! processing between them.
//!
//! Everything here runs on the control thread. The only state shared with
//! the real-time audio context is the pair of ring buffers; all other
//! fields (resamplers, canceller, far-end queue) are control-thread-owned.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::backend::{self, Direction, PlatformAudioUnit};
use crate::config::EngineConfig;
use crate::dsp::level;
use crate::dsp::speex::{EchoCanceller, Resampler};
use crate::error::AudioError;
use crate::ring::RingBuffer;

/// How many processing frames of far-end reference to retain before the
/// oldest are discarded.
const FAR_QUEUE_FRAMES: usize = 16;

pub struct DuplexEngine {
    config: EngineConfig,
    capture_ring: Arc<Mutex<RingBuffer>>,
    playback_ring: Arc<Mutex<RingBuffer>>,
    input: Option<Box<dyn PlatformAudioUnit>>,
    output: Option<Box<dyn PlatformAudioUnit>>,
    running: bool,
    gain: f32,
    canceller: EchoCanceller,
    echo_enabled: bool,
    /// Post-gain playback samples at the target rate, consumed one frame per
    /// processed near-end frame, strictly in enqueue order.
    far_queue: VecDeque<i16>,
    /// Resampled capture awaiting a complete frame for the canceller.
    pending: Vec<i16>,
    /// Raw tail of the most recent capture drain, for RMS metering.
    last_frame: Vec<i16>,
    capture_resampler: Option<Resampler>,
    playback_resampler: Option<Resampler>,
}

impl DuplexEngine {
    /// Build an engine for `config`. No device is touched until
    /// [`DuplexEngine::start`].
    pub fn new(config: EngineConfig) -> Result<Self, AudioError> {
        config.validate()?;
        let canceller = EchoCanceller::new(
            config.frame_size,
            config.frame_size * config.echo_tail_frames,
            config.target_rate,
        )?;
        let capture_ring = Arc::new(Mutex::new(RingBuffer::with_capacity(config.ring_capacity)));
        let playback_ring = Arc::new(Mutex::new(RingBuffer::with_capacity(config.ring_capacity)));
        Ok(Self {
            config,
            capture_ring,
            playback_ring,
            input: None,
            output: None,
            running: false,
            gain: 1.0,
            canceller,
            echo_enabled: true,
            far_queue: VecDeque::new(),
            pending: Vec::new(),
            last_frame: Vec::new(),
            capture_resampler: None,
            playback_resampler: None,
        })
    }

    /// Open (on first use) and start both direction streams. All-or-nothing:
    /// if either stream fails to open or start, anything already opened is
    /// closed again. Idempotent while running.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.running {
            return Ok(());
        }
        if let (Some(input), Some(output)) = (self.input.as_mut(), self.output.as_mut()) {
            input.start()?;
            if let Err(e) = output.start() {
                let _ = input.stop();
                return Err(e);
            }
            self.running = true;
            return Ok(());
        }

        // First activation: open both units; an early return drops (closes)
        // whatever was already open and releases its device claim.
        let mut input = backend::open_unit(
            Direction::Capture,
            &self.config,
            self.capture_ring.clone(),
        )?;
        let mut output = backend::open_unit(
            Direction::Playback,
            &self.config,
            self.playback_ring.clone(),
        )?;

        let input_rate = input.sample_rate();
        let output_rate = output.sample_rate();
        self.capture_resampler = if input_rate != self.config.target_rate {
            log::info!(
                "capture resampling {} -> {} Hz",
                input_rate,
                self.config.target_rate
            );
            Some(Resampler::new(input_rate, self.config.target_rate)?)
        } else {
            None
        };
        self.playback_resampler = if output_rate != self.config.target_rate {
            log::info!(
                "playback resampling {} -> {} Hz",
                self.config.target_rate,
                output_rate
            );
            Some(Resampler::new(self.config.target_rate, output_rate)?)
        } else {
            None
        };

        input.start()?;
        if let Err(e) = output.start() {
            let _ = input.stop();
            return Err(e);
        }
        self.input = Some(input);
        self.output = Some(output);
        self.running = true;
        Ok(())
    }

    /// Stop both streams. Always succeeds logically, even when a stream was
    /// already stopped; device-side stop failures are logged, not surfaced.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        if let Some(unit) = self.input.as_mut() {
            if let Err(e) = unit.stop() {
                log::warn!("input stop: {e}");
            }
        }
        if let Some(unit) = self.output.as_mut() {
            if let Err(e) = unit.stop() {
                log::warn!("output stop: {e}");
            }
        }
        self.running = false;
        Ok(())
    }

    /// Queue PCM samples for playback. Applies the current gain, records the
    /// post-gain signal as the far-end echo reference, resamples to the
    /// device rate when needed, and writes into the playback ring. Never
    /// blocks; on overflow the oldest buffered audio is dropped.
    pub fn enqueue(&mut self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        let mut frame = samples.to_vec();
        level::apply_gain(&mut frame, self.gain);

        // The reference must be what actually goes to the speaker.
        self.far_queue.extend(frame.iter().copied());
        let max = self.config.frame_size * FAR_QUEUE_FRAMES;
        if self.far_queue.len() > max {
            let excess = self.far_queue.len() - max;
            self.far_queue.drain(..excess);
        }

        let out = match self.playback_resampler.as_mut() {
            Some(r) => r.resample(&frame),
            None => frame,
        };
        self.playback_ring.lock().unwrap().produce(&out);
    }

    /// Drain the capture ring, resample from the device rate to the target
    /// rate, and run echo cancellation frame by frame. Returns whatever is
    /// ready, possibly empty; never fails.
    pub fn read(&mut self) -> Vec<i16> {
        // Size the buffer outside the lock; the ring mutex is only ever
        // held for the copy itself. Only this thread drains the ring, so
        // the count cannot shrink between the two critical sections, and
        // fill truncates safely regardless.
        let n = self.capture_ring.lock().unwrap().available_to_read();
        let raw = if n == 0 {
            Vec::new()
        } else {
            let mut buf = vec![0i16; n];
            let got = self.capture_ring.lock().unwrap().fill(&mut buf);
            buf.truncate(got);
            buf
        };
        if !raw.is_empty() {
            // The meter sees the raw device signal, before resampling or
            // cancellation.
            let tail = raw.len().min(self.config.frame_size);
            self.last_frame.clear();
            self.last_frame.extend_from_slice(&raw[raw.len() - tail..]);
        }

        let resampled = match self.capture_resampler.as_mut() {
            Some(r) => r.resample(&raw),
            None => raw,
        };

        if !self.echo_enabled {
            if self.pending.is_empty() {
                return resampled;
            }
            let mut out = std::mem::take(&mut self.pending);
            out.extend_from_slice(&resampled);
            return out;
        }

        self.pending.extend_from_slice(&resampled);
        let frame = self.config.frame_size;
        let mut out = Vec::with_capacity(self.pending.len());
        let mut far = vec![0i16; frame];
        let mut clean = vec![0i16; frame];
        let mut offset = 0;
        while self.pending.len() - offset >= frame {
            let near = &self.pending[offset..offset + frame];
            // One far-end frame per near-end frame, in enqueue order; an
            // empty queue contributes silence, never a skipped frame.
            for slot in far.iter_mut() {
                *slot = self.far_queue.pop_front().unwrap_or(0);
            }
            match self.canceller.process(near, &far, &mut clean) {
                Ok(()) => out.extend_from_slice(&clean),
                Err(e) => {
                    // Degraded cancellation is silent, not fatal.
                    log::warn!("echo cancellation skipped: {e}");
                    out.extend_from_slice(near);
                }
            }
            offset += frame;
        }
        self.pending.drain(..offset);
        out
    }

    /// Scale subsequent output by a linear factor. Non-positive or
    /// non-finite factors are rejected.
    pub fn apply_gain(&mut self, factor: f32) -> Result<(), AudioError> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(AudioError::Config(format!(
                "gain factor must be finite and positive, got {factor}"
            )));
        }
        self.gain = factor;
        Ok(())
    }

    /// RMS level of the most recently captured frame, unresampled and
    /// unfiltered. Used for voice-activity/level metering.
    pub fn get_rms(&self) -> f32 {
        level::rms(&self.last_frame)
    }

    /// Reset the echo canceller's adaptive state and discard the far-end
    /// reference backlog.
    pub fn cancel_echo(&mut self) {
        self.canceller.reset();
        self.far_queue.clear();
        self.pending.clear();
    }

    /// Enable or bypass echo cancellation. While bypassed, `read` passes
    /// captured audio through untouched.
    pub fn set_echo_cancellation(&mut self, enabled: bool) {
        self.echo_enabled = enabled;
    }

    #[cfg(test)]
    fn install_test_units(
        &mut self,
        input: Box<dyn PlatformAudioUnit>,
        output: Box<dyn PlatformAudioUnit>,
    ) {
        self.input = Some(input);
        self.output = Some(output);
    }
}

impl Drop for DuplexEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Stand-in unit counting state transitions, playing the role of the
    /// hardware side of the contract.
    struct MockUnit {
        running: Rc<Cell<bool>>,
        starts: Rc<Cell<u32>>,
        fail_start: bool,
        rate: u32,
    }

    impl MockUnit {
        fn new(rate: u32) -> (Box<Self>, Rc<Cell<bool>>, Rc<Cell<u32>>) {
            let running = Rc::new(Cell::new(false));
            let starts = Rc::new(Cell::new(0));
            (
                Box::new(Self {
                    running: running.clone(),
                    starts: starts.clone(),
                    fail_start: false,
                    rate,
                }),
                running,
                starts,
            )
        }
    }

    impl PlatformAudioUnit for MockUnit {
        fn start(&mut self) -> Result<(), AudioError> {
            if self.fail_start {
                return Err(AudioError::device("mock start failure", -1));
            }
            if !self.running.get() {
                self.running.set(true);
                self.starts.set(self.starts.get() + 1);
            }
            Ok(())
        }

        fn stop(&mut self) -> Result<(), AudioError> {
            self.running.set(false);
            Ok(())
        }

        fn sample_rate(&self) -> u32 {
            self.rate
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            target_rate: 16_000,
            frame_size: 160,
            ring_capacity: 1 << 12,
            ..Default::default()
        }
    }

    fn engine_with_mocks() -> (DuplexEngine, Rc<Cell<bool>>, Rc<Cell<u32>>) {
        let mut engine = DuplexEngine::new(test_config()).unwrap();
        let (input, in_running, in_starts) = MockUnit::new(16_000);
        let (output, _, _) = MockUnit::new(16_000);
        engine.install_test_units(input, output);
        (engine, in_running, in_starts)
    }

    /// Push captured samples the way a backend input callback would.
    fn simulate_capture(engine: &DuplexEngine, samples: &[i16]) {
        engine.capture_ring.lock().unwrap().produce(samples);
    }

    /// Drain the playback ring the way a backend output callback would,
    /// zero-filling the shortfall.
    fn simulate_render(engine: &DuplexEngine, frames: usize) -> Vec<i16> {
        let mut buf = vec![0i16; frames];
        let n = engine.playback_ring.lock().unwrap().fill(&mut buf);
        buf[n..].fill(0);
        buf
    }

    #[test]
    fn double_start_is_idempotent() {
        let (mut engine, running, starts) = engine_with_mocks();
        engine.start().unwrap();
        engine.start().unwrap();
        assert!(running.get());
        assert_eq!(starts.get(), 1);
        engine.stop().unwrap();
        engine.stop().unwrap();
        assert!(!running.get());
    }

    #[test]
    fn stop_then_start_resumes() {
        let (mut engine, running, _) = engine_with_mocks();
        engine.start().unwrap();
        engine.stop().unwrap();
        assert!(!running.get());
        engine.start().unwrap();
        assert!(running.get());
    }

    #[test]
    fn failed_output_start_stops_input_again() {
        let mut engine = DuplexEngine::new(test_config()).unwrap();
        let (input, in_running, _) = MockUnit::new(16_000);
        let (mut output, _, _) = MockUnit::new(16_000);
        output.fail_start = true;
        engine.install_test_units(input, output);
        assert!(engine.start().is_err());
        assert!(!engine.running);
        assert!(!in_running.get());
    }

    #[test]
    fn silence_round_trip_with_canceller_bypassed() {
        let (mut engine, _, _) = engine_with_mocks();
        engine.set_echo_cancellation(false);
        engine.start().unwrap();

        engine.enqueue(&[0i16; 160]);
        let played = simulate_render(&engine, 160);
        assert!(played.iter().all(|&s| s == 0));

        simulate_capture(&engine, &played);
        let captured = engine.read();
        assert_eq!(captured.len(), 160);
        assert!(captured.iter().all(|&s| s == 0));
    }

    #[test]
    fn render_shortfall_is_silence_not_garbage() {
        let (mut engine, _, _) = engine_with_mocks();
        engine.enqueue(&[500i16; 40]);
        let played = simulate_render(&engine, 160);
        assert!(played[..40].iter().all(|&s| s == 500));
        assert!(played[40..].iter().all(|&s| s == 0));
    }

    #[test]
    fn read_with_nothing_available_is_empty_not_error() {
        let (mut engine, _, _) = engine_with_mocks();
        assert!(engine.read().is_empty());
    }

    #[test]
    fn read_loses_nothing_against_a_concurrent_producer() {
        let (mut engine, _, _) = engine_with_mocks();
        engine.set_echo_cancellation(false);
        let ring = engine.capture_ring.clone();
        let producer = std::thread::spawn(move || {
            for _ in 0..50 {
                ring.lock().unwrap().produce(&[7i16; 32]);
                std::thread::sleep(std::time::Duration::from_micros(200));
            }
        });
        // Interleave reads with the producer; samples landing between the
        // size query and the copy stay queued for the next read.
        let mut total = 0;
        while total < 50 * 32 {
            total += engine.read().len();
            std::thread::yield_now();
        }
        producer.join().unwrap();
        assert_eq!(total, 50 * 32);
        assert!(engine.read().is_empty());
    }

    #[test]
    fn far_frames_are_consumed_in_enqueue_order() {
        let (mut engine, _, _) = engine_with_mocks();
        engine.enqueue(&[100i16; 160]);
        engine.enqueue(&[200i16; 160]);
        assert_eq!(engine.far_queue.len(), 320);

        // One near-end frame consumes exactly the oldest far-end frame.
        simulate_capture(&engine, &[0i16; 160]);
        let _ = engine.read();
        assert_eq!(engine.far_queue.len(), 160);
        assert!(engine.far_queue.iter().all(|&s| s == 200));

        // The next frame consumes the next reference, never skipping.
        simulate_capture(&engine, &[0i16; 160]);
        let _ = engine.read();
        assert!(engine.far_queue.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_completion_when_cancelling() {
        let (mut engine, _, _) = engine_with_mocks();
        simulate_capture(&engine, &[0i16; 100]);
        assert!(engine.read().is_empty());
        assert_eq!(engine.pending.len(), 100);
        simulate_capture(&engine, &[0i16; 60]);
        assert_eq!(engine.read().len(), 160);
        assert!(engine.pending.is_empty());
    }

    #[test]
    fn gain_scales_enqueued_audio_with_saturation() {
        let (mut engine, _, _) = engine_with_mocks();
        engine.apply_gain(2.0).unwrap();
        engine.enqueue(&[1000i16, -1000, 30_000, -30_000]);
        let played = simulate_render(&engine, 4);
        assert_eq!(played, vec![2000, -2000, i16::MAX, i16::MIN]);
    }

    #[test]
    fn invalid_gain_factors_rejected() {
        let (mut engine, _, _) = engine_with_mocks();
        assert!(engine.apply_gain(0.0).is_err());
        assert!(engine.apply_gain(-1.5).is_err());
        assert!(engine.apply_gain(f32::NAN).is_err());
        assert!(engine.apply_gain(f32::INFINITY).is_err());
        assert!(engine.apply_gain(0.5).is_ok());
    }

    #[test]
    fn rms_meters_raw_capture() {
        let (mut engine, _, _) = engine_with_mocks();
        assert_eq!(engine.get_rms(), 0.0);
        simulate_capture(&engine, &[1000i16; 160]);
        let _ = engine.read();
        assert!((engine.get_rms() - 1000.0).abs() < 1.0);
    }

    #[test]
    fn cancel_echo_discards_reference_backlog() {
        let (mut engine, _, _) = engine_with_mocks();
        engine.enqueue(&[100i16; 320]);
        simulate_capture(&engine, &[0i16; 100]);
        let _ = engine.read();
        engine.cancel_echo();
        assert!(engine.far_queue.is_empty());
        assert!(engine.pending.is_empty());
    }

    #[test]
    fn scenario_tone_enqueued_capture_stays_silent() {
        // 16 kHz target, 160-sample frames, one simulated callback period.
        let (mut engine, _, _) = engine_with_mocks();
        engine.start().unwrap();

        let tone: Vec<i16> = (0..160)
            .map(|i| {
                let phase = i as f32 / 16_000.0 * 1_000.0 * std::f32::consts::TAU;
                (8_000.0 * phase.sin()) as i16
            })
            .collect();
        engine.enqueue(&tone);

        let played = simulate_render(&engine, 160);
        assert_eq!(played, tone);

        // No physical loopback: the mic hears silence.
        simulate_capture(&engine, &[0i16; 160]);
        let captured = engine.read();
        assert!(captured.len() <= 160);
        assert!(engine.get_rms() < 1.0);

        engine.stop().unwrap();
        engine.start().unwrap();
    }

    #[test]
    fn invalid_config_rejected_at_construction() {
        let cfg = EngineConfig {
            frame_size: 0,
            ..test_config()
        };
        assert!(matches!(
            DuplexEngine::new(cfg),
            Err(AudioError::Config(_))
        ));
    }
}
