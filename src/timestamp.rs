//! Decode timestamp derivation for reordered output.

use crate::{EncodeError, TIMESTAMP_RING_CAPACITY};

/// Fixed-size ring of input timestamps indexed by input order.
#[derive(Debug, Clone)]
pub struct TimestampRing {
    slots: [i64; TIMESTAMP_RING_CAPACITY],
    len: usize,
}

impl TimestampRing {
    pub fn new(len: usize) -> Result<Self, EncodeError> {
        if len == 0 || len > TIMESTAMP_RING_CAPACITY {
            return Err(EncodeError::UnsupportedConfig(format!(
                "timestamp ring length must be in 1..={TIMESTAMP_RING_CAPACITY}, got {len}"
            )));
        }
        Ok(Self {
            slots: [0; TIMESTAMP_RING_CAPACITY],
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn slot(&self, index: i64) -> usize {
        index.rem_euclid(self.len as i64) as usize
    }

    pub fn set(&mut self, index: i64, pts: i64) {
        let slot = self.slot(index);
        self.slots[slot] = pts;
    }

    pub fn get(&self, index: i64) -> i64 {
        self.slots[self.slot(index)]
    }
}

/// Tracks what is needed to give every packet a DTS that never decreases and
/// never exceeds its PTS.
#[derive(Debug, Clone)]
pub struct DtsEstimator {
    ring: TimestampRing,
    output_delay: usize,
    decode_delay: i64,
    no_delay: bool,
    first_pts: i64,
    dts_pts_diff: i64,
    last_pts: Option<i64>,
}

impl DtsEstimator {
    pub fn new(
        output_delay: usize,
        decode_delay: usize,
        async_depth: usize,
        no_delay: bool,
    ) -> Result<Self, EncodeError> {
        Ok(Self {
            ring: TimestampRing::new(3 * output_delay + async_depth)?,
            output_delay,
            decode_delay: decode_delay as i64,
            no_delay,
            first_pts: 0,
            dts_pts_diff: 0,
            last_pts: None,
        })
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    pub fn record_input(&mut self, input_order: i64, pts: i64) {
        if input_order == 0 {
            self.first_pts = pts;
        }
        if input_order == self.decode_delay {
            self.dts_pts_diff = pts - self.first_pts;
        }
        if self.output_delay > 0 {
            self.ring.set(input_order, pts);
        }
        self.last_pts = Some(pts);
    }

    /// Short streams end before the decode delay is reached; use the span they cover.
    pub fn finish_input(&mut self, input_count: i64) {
        if input_count < self.decode_delay {
            if let Some(last_pts) = self.last_pts {
                self.dts_pts_diff = last_pts - self.first_pts;
            }
        }
    }

    pub fn dts(&self, encode_order: i64, pts: i64) -> i64 {
        if self.no_delay || self.output_delay == 0 {
            pts
        } else if encode_order < self.decode_delay {
            self.ring.get(encode_order).saturating_sub(self.dts_pts_diff)
        } else {
            self.ring.get(encode_order - self.decode_delay)
        }
    }
}
