//! Fixed-capacity single-producer/single-consumer sample queue.
//!
//! Bridges the real-time audio context and the control thread. Each
//! direction has exactly one writer role and one reader role (capture ring:
//! audio thread writes, control thread reads; playback ring: the reverse).
//! The two ends share a mutex at the call sites, held only for the duration
//! of a copy; nothing here blocks, allocates after construction, or fails.
//!
//! Overrun policy: the oldest unread samples are overwritten. Stale audio is
//! worse than a small gap, so recency wins over completeness. Underrun
//! policy: the reader gets whatever is available and must zero-fill the
//! remainder itself. Both events are counted for diagnostics but are not
//! errors.

pub struct RingBuffer {
    buf: Box<[i16]>,
    mask: u64,
    read: u64,
    write: u64,
    overruns: u64,
    underruns: u64,
}

impl RingBuffer {
    /// Create a ring holding `capacity` samples. Capacity must be a power of
    /// two so cursor wraparound is a mask, as in the PortAudio-style ring
    /// the engine's producer/consumer arithmetic is modeled on.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "ring capacity must be a non-zero power of two"
        );
        Self {
            buf: vec![0i16; capacity].into_boxed_slice(),
            mask: (capacity - 1) as u64,
            read: 0,
            write: 0,
            overruns: 0,
            underruns: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Unread samples available to the consumer.
    pub fn available_to_read(&self) -> usize {
        (self.write - self.read) as usize
    }

    /// Free space available to the producer without overwriting.
    pub fn available_to_write(&self) -> usize {
        self.capacity() - self.available_to_read()
    }

    /// Append `samples`, overwriting the oldest unread data when free space
    /// runs out. Writing more than the whole capacity keeps only the newest
    /// `capacity` samples.
    pub fn produce(&mut self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        let cap = self.capacity();
        let src = if samples.len() > cap {
            &samples[samples.len() - cap..]
        } else {
            samples
        };
        let free = self.available_to_write();
        if samples.len() > free {
            self.overruns += 1;
            // Advance the reader past everything about to be overwritten.
            let lost = src.len() - free.min(src.len());
            self.read += lost as u64;
        }
        let start = (self.write & self.mask) as usize;
        let first = src.len().min(cap - start);
        self.buf[start..start + first].copy_from_slice(&src[..first]);
        self.buf[..src.len() - first].copy_from_slice(&src[first..]);
        self.write += src.len() as u64;
    }

    /// Copy up to `out.len()` unread samples into `out`, returning how many
    /// were written. On underrun the caller must zero-fill the remainder
    /// before handing the buffer to the hardware.
    pub fn fill(&mut self, out: &mut [i16]) -> usize {
        let n = out.len().min(self.available_to_read());
        if n < out.len() {
            self.underruns += 1;
        }
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let start = (self.read & self.mask) as usize;
        let first = n.min(cap - start);
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        self.read += n as u64;
        n
    }

    /// Overrun events observed so far.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Underrun events observed so far.
    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_plus_write_space_equals_capacity() {
        let mut ring = RingBuffer::with_capacity(64);
        let mut out = [0i16; 16];
        assert_eq!(ring.available_to_read() + ring.available_to_write(), 64);
        for step in 0..50 {
            ring.produce(&vec![step as i16; (step % 23) + 1]);
            assert_eq!(ring.available_to_read() + ring.available_to_write(), 64);
            ring.fill(&mut out[..(step % 16) + 1]);
            assert_eq!(ring.available_to_read() + ring.available_to_write(), 64);
        }
    }

    #[test]
    fn fill_returns_exactly_what_is_available() {
        let mut ring = RingBuffer::with_capacity(32);
        ring.produce(&[1, 2, 3]);
        let mut out = [9i16; 8];
        let n = ring.fill(&mut out);
        assert_eq!(n, 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
        // The remainder is the caller's to silence; verify the backend
        // contract explicitly.
        out[n..].fill(0);
        assert_eq!(&out[3..], &[0; 5]);
        assert_eq!(ring.underruns(), 1);
    }

    #[test]
    fn overrun_overwrites_oldest_keeps_newest() {
        let mut ring = RingBuffer::with_capacity(8);
        let data: Vec<i16> = (1..=12).collect();
        ring.produce(&data);
        assert_eq!(ring.available_to_read(), 8);
        assert_eq!(ring.overruns(), 1);
        let mut out = [0i16; 8];
        assert_eq!(ring.fill(&mut out), 8);
        // The newest `capacity` samples are always readable.
        assert_eq!(&out, &[5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn overrun_with_partial_free_space() {
        let mut ring = RingBuffer::with_capacity(8);
        ring.produce(&[1, 2, 3, 4, 5, 6]);
        ring.produce(&[7, 8, 9, 10]); // two free, two overwritten
        let mut out = [0i16; 8];
        assert_eq!(ring.fill(&mut out), 8);
        assert_eq!(&out, &[3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn wraparound_preserves_order() {
        let mut ring = RingBuffer::with_capacity(8);
        let mut out = [0i16; 8];
        ring.produce(&[1, 2, 3, 4, 5]);
        assert_eq!(ring.fill(&mut out[..5]), 5);
        ring.produce(&[6, 7, 8, 9, 10, 11]);
        assert_eq!(ring.fill(&mut out[..6]), 6);
        assert_eq!(&out[..6], &[6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn empty_ring_fills_nothing() {
        let mut ring = RingBuffer::with_capacity(16);
        let mut out = [5i16; 4];
        assert_eq!(ring.fill(&mut out), 0);
        assert_eq!(ring.available_to_read(), 0);
    }
}
