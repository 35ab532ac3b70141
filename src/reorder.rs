// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sequence-number reordering for RTP received over UDP.
//!
//! TCP-interleaved delivery preserves order, so this is used only on the
//! UDP receive paths. One reorderer per SSRC.

use std::collections::VecDeque;

use smallvec::SmallVec;

/// Default number of pending slots.
pub const DEFAULT_WINDOW: usize = 64;

/// Reorders packets within a fixed window and accounts for what can't be
/// recovered.
///
/// `process` returns the packets that became deliverable, in sequence
/// order, plus the number of sequence numbers now known to be lost.
/// Late duplicates are silently dropped and counted in
/// [`Reorderer::dropped_duplicates`].
#[derive(Debug)]
pub struct Reorderer<T> {
    window: usize,
    next: Option<u16>,
    /// Slot `i` holds the packet with sequence number `next + 1 + i`.
    buf: VecDeque<Option<T>>,
    pub dropped_duplicates: u64,
}

impl<T> Reorderer<T> {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        assert!(window >= 2);
        let mut buf = VecDeque::with_capacity(window - 1);
        buf.resize_with(window - 1, || None);
        Reorderer {
            window,
            next: None,
            buf,
            dropped_duplicates: 0,
        }
    }

    pub fn process(&mut self, seq: u16, pkt: T) -> (SmallVec<[T; 2]>, usize) {
        let next = match self.next {
            None => {
                // First packet fixes the reference point.
                self.next = Some(seq.wrapping_add(1));
                return (smallvec::smallvec![pkt], 0);
            }
            Some(n) => n,
        };
        let d = seq.wrapping_sub(next) as i16;
        if d < 0 {
            self.dropped_duplicates += 1;
            return (SmallVec::new(), 0);
        }
        let d = d as usize;
        if d == 0 {
            let mut out = smallvec::smallvec![pkt];
            self.next = Some(next.wrapping_add(1));
            self.drain_contiguous(&mut out);
            return (out, 0);
        }
        if d < self.window {
            match &mut self.buf[d - 1] {
                Some(_) => self.dropped_duplicates += 1,
                slot @ None => *slot = Some(pkt),
            }
            return (SmallVec::new(), 0);
        }
        // Too far ahead to wait for the gap: give up on everything between,
        // buffered or not, and restart from this packet.
        for slot in self.buf.iter_mut() {
            *slot = None;
        }
        self.next = Some(seq.wrapping_add(1));
        (smallvec::smallvec![pkt], d)
    }

    fn drain_contiguous(&mut self, out: &mut SmallVec<[T; 2]>) {
        loop {
            // Front slot is the one for the new `next`.
            match self.buf.pop_front().expect("window >= 2") {
                Some(p) => {
                    self.buf.push_back(None);
                    self.next = Some(self.next.unwrap().wrapping_add(1));
                    out.push(p);
                }
                None => {
                    self.buf.push_back(None);
                    return;
                }
            }
        }
    }
}

impl<T> Default for Reorderer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(r: &mut Reorderer<u16>, seq: u16) -> (Vec<u16>, usize) {
        let (pkts, missing) = r.process(seq, seq);
        (pkts.to_vec(), missing)
    }

    #[test]
    fn in_order() {
        let mut r = Reorderer::new();
        assert_eq!(run(&mut r, 1000), (vec![1000], 0));
        assert_eq!(run(&mut r, 1001), (vec![1001], 0));
        assert_eq!(run(&mut r, 1002), (vec![1002], 0));
    }

    #[test]
    fn simple_swap() {
        let mut r = Reorderer::new();
        assert_eq!(run(&mut r, 10), (vec![10], 0));
        assert_eq!(run(&mut r, 12), (vec![], 0));
        assert_eq!(run(&mut r, 11), (vec![11, 12], 0));
    }

    #[test]
    fn window_permutation_emits_in_order() {
        // Any permutation within the window comes out sorted.
        let mut r = Reorderer::new();
        assert_eq!(run(&mut r, 0), (vec![0], 0));
        let mut out = Vec::new();
        for &seq in &[5u16, 3, 1, 4, 2, 6] {
            let (pkts, missing) = r.process(seq, seq);
            assert_eq!(missing, 0);
            out.extend(pkts);
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn wraparound() {
        let mut r = Reorderer::new();
        assert_eq!(run(&mut r, 65534), (vec![65534], 0));
        assert_eq!(run(&mut r, 0), (vec![], 0));
        assert_eq!(run(&mut r, 65535), (vec![65535, 0], 0));
        assert_eq!(run(&mut r, 1), (vec![1], 0));
    }

    #[test]
    fn duplicate_dropped() {
        let mut r = Reorderer::new();
        assert_eq!(run(&mut r, 7), (vec![7], 0));
        assert_eq!(run(&mut r, 7), (vec![], 0));
        assert_eq!(r.dropped_duplicates, 1);
        // A duplicate of a buffered packet too.
        assert_eq!(run(&mut r, 9), (vec![], 0));
        assert_eq!(run(&mut r, 9), (vec![], 0));
        assert_eq!(r.dropped_duplicates, 2);
    }

    #[test]
    fn big_jump_reports_loss_and_drops_stale() {
        // The literal reorder-window scenario: 1,2,4,3,5,70,6.
        let mut r = Reorderer::new();
        let mut out = Vec::new();
        let mut lost = 0;
        for &seq in &[1u16, 2, 4, 3, 5, 70, 6] {
            let (pkts, missing) = r.process(seq, seq);
            out.extend(pkts);
            lost += missing;
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5, 70]);
        // 70 arrived while expecting 6: sequence numbers 6..=69 are gone.
        assert_eq!(lost, 64);
        // 6 then arrived late and was dropped.
        assert_eq!(r.dropped_duplicates, 1);
    }

    #[test]
    fn buffered_entries_discarded_on_jump() {
        let mut r = Reorderer::with_window(8);
        assert_eq!(run(&mut r, 0), (vec![0], 0));
        assert_eq!(run(&mut r, 3), (vec![], 0));
        let (pkts, missing) = r.process(100, 100);
        assert_eq!(pkts.to_vec(), vec![100]);
        assert_eq!(missing, 99);
        // The buffered 3 is gone; delivery restarts after 100.
        assert_eq!(run(&mut r, 101), (vec![101], 0));
    }
}
