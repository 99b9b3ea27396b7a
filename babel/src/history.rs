//! Hello history vector and the k-out-of-j link quality estimate
//! (RFC 8966, appendix A.1 and A.2.1).

use babel_proto::{seqno_abs_distance, seqno_distance, SequenceNumber};

/// Tracks which of the 16 most recently expected Hellos from a neighbour
/// actually arrived. Bit `1 << 0` is the oldest slot, the high bit the
/// newest. One instance exists per Hello direction (unicast and multicast
/// are independent).
#[derive(Debug, Default, Clone)]
pub struct HelloHistory {
    expected_seqno: SequenceNumber,
    vector: u16,
}

fn shl(v: u16, n: u16) -> u16 {
    if n >= 16 {
        0
    } else {
        v << n
    }
}

fn shr(v: u16, n: u16) -> u16 {
    if n >= 16 {
        0
    } else {
        v >> n
    }
}

impl HelloHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the vector.
    pub fn reset(&mut self) {
        self.vector = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.vector == 0
    }

    /// Records a received Hello with the given seqno. Returns whether the
    /// history had to be reset because the seqno was too far from the
    /// expected one.
    pub fn update(&mut self, seqno: SequenceNumber) -> bool {
        let reset = seqno_abs_distance(seqno, self.expected_seqno) > 16;
        if reset {
            self.vector = 0;
        } else {
            let d = seqno_distance(self.expected_seqno, seqno);
            if d < 0 {
                // A retransmitted or reordered Hello: rewind, re-counting a
                // Hello we already saw.
                self.vector = shr(self.vector, d.unsigned_abs());
            } else {
                // The zeros shifted in stand for the missed Hellos.
                self.vector = shl(self.vector, d as u16);
            }
        }

        self.vector = (self.vector << 1) | 1;
        self.expected_seqno = seqno.wrapping_add(1);
        reset
    }

    /// Records that an expected Hello did not arrive in time. Returns true
    /// when the vector drained to zero: the neighbour is dead.
    pub fn missed(&mut self) -> bool {
        self.vector <<= 1;
        self.expected_seqno = self.expected_seqno.wrapping_add(1);
        self.vector == 0
    }

    /// Whether at least `k` of the `j` most recent slots are set.
    pub fn out_of(&self, k: u32, j: u16) -> bool {
        shl(self.vector, 16 - j.min(16)).count_ones() >= k
    }
}
