//! Safe wrappers around SpeexDSP's resampler and acoustic echo canceller.

use std::ffi::{c_int, c_void};

use crate::error::AudioError;

// ======================== FFI declarations ========================

/// Opaque type for SpeexResamplerState
#[repr(C)]
pub struct SpeexResamplerState {
    _private: [u8; 0],
}

/// Opaque type for SpeexEchoState
#[repr(C)]
pub struct SpeexEchoState {
    _private: [u8; 0],
}

const SPEEX_RESAMPLER_QUALITY_DEFAULT: c_int = 4;
const RESAMPLER_ERR_SUCCESS: c_int = 0;

const SPEEX_ECHO_SET_SAMPLING_RATE: c_int = 24;

unsafe extern "C" {
    fn speex_resampler_init(
        nb_channels: u32,
        in_rate: u32,
        out_rate: u32,
        quality: c_int,
        err: *mut c_int,
    ) -> *mut SpeexResamplerState;
    fn speex_resampler_destroy(st: *mut SpeexResamplerState);
    fn speex_resampler_process_int(
        st: *mut SpeexResamplerState,
        channel_index: u32,
        in_: *const i16,
        in_len: *mut u32,
        out: *mut i16,
        out_len: *mut u32,
    ) -> c_int;

    fn speex_echo_state_init(frame_size: c_int, filter_length: c_int) -> *mut SpeexEchoState;
    fn speex_echo_state_destroy(st: *mut SpeexEchoState);
    fn speex_echo_state_reset(st: *mut SpeexEchoState);
    fn speex_echo_cancellation(
        st: *mut SpeexEchoState,
        rec: *const i16,
        play: *const i16,
        out: *mut i16,
    );
    fn speex_echo_ctl(st: *mut SpeexEchoState, request: c_int, ptr: *mut c_void) -> c_int;
}

// ======================== Resampler ========================

/// Mono 16-bit rate converter between the hardware rate and the engine's
/// target rate.
pub struct Resampler {
    state: *mut SpeexResamplerState,
    in_rate: u32,
    out_rate: u32,
}

// The state is only ever touched from the control thread.
unsafe impl Send for Resampler {}

impl Resampler {
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self, AudioError> {
        let mut err: c_int = 0;
        let state = unsafe {
            speex_resampler_init(1, in_rate, out_rate, SPEEX_RESAMPLER_QUALITY_DEFAULT, &mut err)
        };
        if err != RESAMPLER_ERR_SUCCESS || state.is_null() {
            return Err(AudioError::device(
                format!("failed to initialize resampler {in_rate} -> {out_rate} Hz"),
                err,
            ));
        }
        Ok(Self {
            state,
            in_rate,
            out_rate,
        })
    }

    /// One resampling pass. Returns `(input_consumed, output_produced)`.
    pub fn process_int(
        &mut self,
        input: &[i16],
        output: &mut [i16],
    ) -> Result<(u32, u32), AudioError> {
        let mut in_len = input.len() as u32;
        let mut out_len = output.len() as u32;
        let err = unsafe {
            speex_resampler_process_int(
                self.state,
                0,
                input.as_ptr(),
                &mut in_len,
                output.as_mut_ptr(),
                &mut out_len,
            )
        };
        if err != RESAMPLER_ERR_SUCCESS {
            return Err(AudioError::device("resampler processing failed", err));
        }
        Ok((in_len, out_len))
    }

    /// Resample an arbitrary-length buffer, looping until the input is
    /// consumed. Failures are logged and truncate the output rather than
    /// erroring: the streaming paths that call this degrade, never fail.
    pub fn resample(&mut self, input: &[i16]) -> Vec<i16> {
        if input.is_empty() {
            return Vec::new();
        }
        let estimate = |n: usize| -> usize {
            (n as u64 * self.out_rate as u64).div_ceil(self.in_rate as u64) as usize + 16
        };
        let mut out = Vec::with_capacity(estimate(input.len()));
        let mut chunk = vec![0i16; estimate(input.len())];
        let mut consumed_total = 0usize;
        while consumed_total < input.len() {
            let remaining = &input[consumed_total..];
            match self.process_int(remaining, &mut chunk) {
                Ok((consumed, produced)) => {
                    out.extend_from_slice(&chunk[..produced as usize]);
                    if consumed == 0 {
                        break;
                    }
                    consumed_total += consumed as usize;
                }
                Err(e) => {
                    log::error!("resampler failure: {e}");
                    break;
                }
            }
        }
        out
    }
}

impl Drop for Resampler {
    fn drop(&mut self) {
        unsafe {
            speex_resampler_destroy(self.state);
        }
    }
}

// ======================== Echo canceller ========================

/// Stateful acoustic echo canceller over fixed-size frames.
///
/// The far-end reference passed to [`EchoCanceller::process`] must be the
/// frame most recently sent to the output device, in round-trip order; the
/// adaptive filter absorbs the acoustic delay through its own delay model,
/// so no frame realignment happens here.
pub struct EchoCanceller {
    state: *mut SpeexEchoState,
    frame_size: usize,
}

// The state is only ever touched from the control thread.
unsafe impl Send for EchoCanceller {}

impl EchoCanceller {
    /// Create a canceller for `frame_size`-sample frames with a filter tail
    /// of `filter_length` samples, adapted at `sample_rate` Hz.
    pub fn new(frame_size: usize, filter_length: usize, sample_rate: u32) -> Result<Self, AudioError> {
        if frame_size == 0 || filter_length == 0 {
            return Err(AudioError::Config(
                "echo canceller frame and filter lengths must be non-zero".into(),
            ));
        }
        let state =
            unsafe { speex_echo_state_init(frame_size as c_int, filter_length as c_int) };
        if state.is_null() {
            return Err(AudioError::device("failed to initialize echo canceller", -1));
        }
        let mut rate = sample_rate as c_int;
        unsafe {
            speex_echo_ctl(
                state,
                SPEEX_ECHO_SET_SAMPLING_RATE,
                &mut rate as *mut c_int as *mut c_void,
            );
        }
        Ok(Self { state, frame_size })
    }

    /// Cancel the `far` reference out of the `near` capture frame. All three
    /// buffers must be exactly one frame long.
    pub fn process(
        &mut self,
        near: &[i16],
        far: &[i16],
        out: &mut [i16],
    ) -> Result<(), AudioError> {
        if near.len() != self.frame_size
            || far.len() != self.frame_size
            || out.len() != self.frame_size
        {
            return Err(AudioError::Config(format!(
                "echo cancellation needs exactly {} samples per frame",
                self.frame_size
            )));
        }
        unsafe {
            speex_echo_cancellation(self.state, near.as_ptr(), far.as_ptr(), out.as_mut_ptr());
        }
        Ok(())
    }

    /// Reset the adaptive filter to its initial state.
    pub fn reset(&mut self) {
        unsafe {
            speex_echo_state_reset(self.state);
        }
    }
}

impl Drop for EchoCanceller {
    fn drop(&mut self) {
        unsafe {
            speex_echo_state_destroy(self.state);
        }
    }
}
