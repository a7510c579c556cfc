//! Dedicated-thread polling backend over ALSA.
//!
//! One background thread per direction. Between Stop and Start the thread
//! parks on a condvar; Stop blocks until the thread acknowledges parking,
//! so once Stop returns no further iteration touches the rings. While
//! running the thread polls the device with a bounded (2 ms) wait, then
//! synchronously reads one period into the capture ring
//! or writes one period drained from the playback ring. The device is
//! multi-channel interleaved on the wire and mono internally: capture takes
//! channel 0, playback replicates the mono signal across all channels.
//!
//! XRUNs and other driver-signaled recoverable errors are absorbed by
//! `snd_pcm_prepare` and a retry; errors recovery cannot fix stop the
//! stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use alsa::ValueOr;
use alsa::pcm::{Access, Format, Frames, HwParams, PCM};

use super::{DeviceClaim, Direction, PlatformAudioUnit};
use crate::config::EngineConfig;
use crate::error::AudioError;
use crate::ring::RingBuffer;

pub(crate) struct AlsaUnit {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    rate: u32,
    _claim: DeviceClaim,
}

struct Shared {
    running: AtomicBool,
    shutdown: AtomicBool,
    /// True while the worker is parked (or has exited). Cleared by the
    /// worker itself as it leaves the park, under the park mutex.
    idle: AtomicBool,
    park: Mutex<()>,
    cond: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            idle: AtomicBool::new(true),
            park: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn start(&self) {
        let _guard = self.park.lock().unwrap();
        self.running.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Stop and wait for the worker to acknowledge parking. On return no
    /// further worker iteration touches the rings until `start`.
    fn stop(&self) {
        let mut guard = self.park.lock().unwrap();
        self.running.store(false, Ordering::SeqCst);
        while !self.idle.load(Ordering::SeqCst) {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Worker-side stop: just drop the running flag. The worker cannot wait
    /// on its own park acknowledgement, so fatal error paths use this and
    /// then fall through to `wait_for_start`, which publishes idle.
    fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Mark the worker permanently parked. Used on early worker exits so a
    /// later `stop` cannot wait forever on an acknowledgement.
    fn retire(&self) {
        let _guard = self.park.lock().unwrap();
        self.running.store(false, Ordering::SeqCst);
        self.idle.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    fn request_shutdown(&self) {
        let _guard = self.park.lock().unwrap();
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.shutdown.load(Ordering::SeqCst)
    }

    /// Park until Start or shutdown, publishing the idle acknowledgement a
    /// blocked `stop` is waiting for. Returns false on shutdown.
    fn wait_for_start(&self) -> bool {
        let mut guard = self.park.lock().unwrap();
        self.idle.store(true, Ordering::SeqCst);
        self.cond.notify_all();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            if self.running.load(Ordering::SeqCst) {
                self.idle.store(false, Ordering::SeqCst);
                return true;
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

fn dev_err(msg: &str, e: alsa::Error) -> AudioError {
    AudioError::device(format!("{msg}: {e}"), e.errno())
}

impl AlsaUnit {
    pub(crate) fn open(
        dir: Direction,
        config: &EngineConfig,
        ring: Arc<Mutex<RingBuffer>>,
        claim: DeviceClaim,
    ) -> Result<Self, AudioError> {
        let (device, alsa_dir) = match dir {
            Direction::Capture => (config.capture_device.as_str(), alsa::Direction::Capture),
            Direction::Playback => (config.playback_device.as_str(), alsa::Direction::Playback),
        };
        let pcm = PCM::new(device, alsa_dir, false).map_err(|e| {
            AudioError::device(
                format!("failed to open '{}' for {}: {}", device, dir.label(), e),
                e.errno(),
            )
        })?;

        let (rate, channels, period) = negotiate(&pcm, config.target_rate)?;
        log::info!(
            "ALSA {}: device={}, rate={}, channels={}, period={}",
            dir.label(),
            device,
            rate,
            channels,
            period,
        );

        let shared = Arc::new(Shared::new());
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("audio-{}", dir.label()))
            .spawn(move || match dir {
                Direction::Capture => {
                    capture_loop(pcm, thread_shared, ring, channels as usize, period)
                }
                Direction::Playback => {
                    playback_loop(pcm, thread_shared, ring, channels as usize, period)
                }
            })
            .map_err(|e| {
                AudioError::device(format!("failed to spawn {} thread: {e}", dir.label()), -1)
            })?;

        Ok(Self {
            shared,
            handle: Some(handle),
            rate,
            _claim: claim,
        })
    }
}

/// Negotiate S16LE at the fewest channels the device supports and the
/// nearest available rate, then read back what the hardware actually took.
fn negotiate(pcm: &PCM, target_rate: u32) -> Result<(u32, u32, usize), AudioError> {
    {
        let hwp = HwParams::any(pcm).map_err(|e| dev_err("failed to initialize hw params", e))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| dev_err("failed to set interleaved access", e))?;
        hwp.set_format(Format::S16LE)
            .map_err(|e| AudioError::Format(format!("device rejected 16-bit PCM: {e}")))?;
        hwp.set_channels_near(1)
            .map_err(|e| dev_err("failed to set channel count", e))?;
        hwp.set_rate_near(target_rate, ValueOr::Nearest)
            .map_err(|e| {
                AudioError::Format(format!("no supported rate near {target_rate} Hz: {e}"))
            })?;
        // 10 ms hardware period, 4 periods of device buffer.
        let period = (target_rate / 100) as Frames;
        hwp.set_period_size_near(period, ValueOr::Nearest)
            .map_err(|e| dev_err("failed to set period size", e))?;
        hwp.set_buffer_size_near(period * 4)
            .map_err(|e| dev_err("failed to set buffer size", e))?;
        pcm.hw_params(&hwp)
            .map_err(|e| dev_err("failed to apply hw params", e))?;
    }
    let hwp = pcm
        .hw_params_current()
        .map_err(|e| dev_err("failed to read back hw params", e))?;
    let rate = hwp.get_rate().map_err(|e| dev_err("failed to read rate", e))?;
    let channels = hwp
        .get_channels()
        .map_err(|e| dev_err("failed to read channels", e))?;
    let period = hwp
        .get_period_size()
        .map_err(|e| dev_err("failed to read period size", e))? as usize;
    pcm.prepare()
        .map_err(|e| dev_err("failed to prepare device", e))?;
    Ok((rate, channels, period))
}

fn capture_loop(
    pcm: PCM,
    shared: Arc<Shared>,
    ring: Arc<Mutex<RingBuffer>>,
    channels: usize,
    period: usize,
) {
    let io = match pcm.io_i16() {
        Ok(io) => io,
        Err(e) => {
            log::error!("capture: failed to acquire PCM I/O: {e}");
            shared.retire();
            return;
        }
    };
    let mut interleaved = vec![0i16; period * channels];
    let mut mono = vec![0i16; period];

    while shared.wait_for_start() {
        // The device may have landed in an xrun while stopped.
        let _ = pcm.prepare();
        while shared.is_running() {
            match pcm.avail_update() {
                Ok(0) => {
                    let _ = pcm.wait(Some(2));
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("ALSA capture poll error: {e}, recovering...");
                    if let Err(e2) = pcm.prepare() {
                        log::error!("failed to recover PCM capture: {e2}");
                        shared.halt();
                    }
                    continue;
                }
            }
            match io.readi(&mut interleaved) {
                Ok(frames) => {
                    // Extract channel 0 from the interleaved stream.
                    for i in 0..frames {
                        mono[i] = interleaved[i * channels];
                    }
                    // Lock held only for the copy into the ring.
                    ring.lock().unwrap().produce(&mono[..frames]);
                }
                Err(e) => {
                    log::warn!("ALSA capture error: {e}, recovering...");
                    if let Err(e2) = pcm.prepare() {
                        log::error!("failed to recover PCM capture: {e2}");
                        shared.halt();
                    }
                }
            }
        }
    }
    log::debug!("capture thread exiting");
}

fn playback_loop(
    pcm: PCM,
    shared: Arc<Shared>,
    ring: Arc<Mutex<RingBuffer>>,
    channels: usize,
    period: usize,
) {
    let io = match pcm.io_i16() {
        Ok(io) => io,
        Err(e) => {
            log::error!("playback: failed to acquire PCM I/O: {e}");
            shared.retire();
            return;
        }
    };
    let mut mono = vec![0i16; period];
    let mut interleaved = vec![0i16; period * channels];

    'parked: while shared.wait_for_start() {
        let _ = pcm.prepare();
        while shared.is_running() {
            match pcm.avail_update() {
                Ok(0) => {
                    let _ = pcm.wait(Some(2));
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("ALSA playback poll error: {e}, recovering...");
                    if let Err(e2) = pcm.prepare() {
                        log::error!("failed to recover PCM playback: {e2}");
                        shared.halt();
                    }
                    continue;
                }
            }
            // Drain one period; shortfall plays as silence, never stale data.
            let n = ring.lock().unwrap().fill(&mut mono);
            mono[n..].fill(0);
            // Mono -> interleaved multi-channel.
            for i in 0..period {
                let s = mono[i];
                for c in 0..channels {
                    interleaved[i * channels + c] = s;
                }
            }
            let mut written = 0usize;
            while written < period && shared.is_running() {
                match io.writei(&interleaved[written * channels..]) {
                    Ok(frames) => written += frames,
                    Err(e) => {
                        log::warn!("ALSA playback error: {e}, recovering...");
                        if let Err(e2) = pcm.prepare() {
                            log::error!("failed to recover PCM playback: {e2}");
                            shared.halt();
                            continue 'parked;
                        }
                    }
                }
            }
        }
    }
    log::debug!("playback thread exiting");
}

impl PlatformAudioUnit for AlsaUnit {
    fn start(&mut self) -> Result<(), AudioError> {
        self.shared.start();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.shared.stop();
        Ok(())
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }
}

impl Drop for AlsaUnit {
    fn drop(&mut self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
