//! Signal processing: SpeexDSP wrappers and level utilities.

pub mod level;
pub mod speex;
