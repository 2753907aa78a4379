//! Sliding window of received packet acks.
//!
//! Every packet carries the sender's view of what it has received from us:
//! the newest ack it has seen plus a 32-bit field describing the acks just
//! before it. Bit `n` set means `last - n` arrived, so bit 0 is `last` itself
//! and a zero field means nothing has arrived yet.
//!
//! ```text
//!  last = 50, bits = 0b...0001_0011
//!                            |  |+- 50 received
//!                            |  +-- 49 received
//!                            +----- 46 received
//! ```

use std::fmt;

use crate::sequence::distance;

/// Number of acks a window can describe.
pub const ACK_WINDOW: u32 = u32::BITS;

/// Received-ack bookkeeping for one direction of a connection.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AckWindow {
    /// Newest ack received.
    pub last: u16,
    /// Which of the [`ACK_WINDOW`] acks ending at `last` were received.
    pub bits: u32,
}

/// What [`AckWindow::record`] made of an incoming ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRecord {
    /// First time this ack was seen.
    New,
    /// Already marked as received.
    Duplicate,
    /// Older than the window can describe.
    TooOld,
}

fn shl(n: u32, by: u32) -> u32 {
    n.checked_shl(by).unwrap_or(0)
}

impl AckWindow {
    /// Whether any ack has been recorded.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Mark `ack` as received, sliding the window forward if it is newer than
    /// [`last`](Self::last).
    pub fn record(&mut self, ack: u16) -> AckRecord {
        if self.is_empty() {
            self.last = ack;
            self.bits = 1;
            return AckRecord::New;
        }

        let dist = distance(ack, self.last);
        if dist >= 0 {
            let dist = dist as u32;
            if dist >= ACK_WINDOW {
                return AckRecord::TooOld;
            }
            let mask = 1 << dist;
            if self.bits & mask != 0 {
                return AckRecord::Duplicate;
            }
            self.bits |= mask;
        } else {
            self.bits = shl(self.bits, u32::from(dist.unsigned_abs())) | 1;
            self.last = ack;
        }
        AckRecord::New
    }

    /// Whether `ack` is marked as received.
    pub fn contains(&self, ack: u16) -> bool {
        let dist = distance(ack, self.last);
        dist >= 0 && (dist as u32) < ACK_WINDOW && self.bits & (1 << dist) != 0
    }

    /// Every ack this window marks as received, newest first.
    pub fn acks(self) -> impl Iterator<Item = u16> {
        (0..ACK_WINDOW).filter_map(move |bit| {
            (self.bits & (1 << bit) != 0).then(|| self.last.wrapping_sub(bit as u16))
        })
    }
}

impl fmt::Debug for AckWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckWindow")
            .field("last", &self.last)
            .field("bits", &format_args!("{:032b}", self.bits))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_ack_sets_bit_zero() {
        let mut window = AckWindow::default();
        assert!(window.is_empty());
        assert_eq!(window.record(7), AckRecord::New);
        assert_eq!(window.last, 7);
        assert_eq!(window.bits, 1);
        assert!(window.contains(7));
        assert!(!window.contains(6));
    }

    #[test]
    fn test_newer_ack_shifts_window() {
        let mut window = AckWindow::default();
        window.record(3);
        window.record(8);
        assert_eq!(window.last, 8);
        assert_eq!(window.bits, 0b10_0001);
        assert!(window.contains(3));
        assert!(window.contains(8));
        assert!(!window.contains(5));
    }

    #[test]
    fn test_late_ack_fills_gap() {
        let mut window = AckWindow::default();
        window.record(10);
        window.record(12);
        assert!(!window.contains(11));
        assert_eq!(window.record(11), AckRecord::New);
        assert!(window.contains(11));
        assert_eq!(window.last, 12);
    }

    #[test]
    fn test_duplicate_and_stale_acks_are_reported() {
        let mut window = AckWindow::default();
        window.record(100);
        assert_eq!(window.record(100), AckRecord::Duplicate);
        assert_eq!(window.record(60), AckRecord::TooOld);
        assert_eq!(window.bits, 1);
    }

    #[test]
    fn test_jump_beyond_window_clears_history() {
        let mut window = AckWindow::default();
        window.record(1);
        window.record(2);
        window.record(200);
        assert_eq!(window.bits, 1);
        assert!(!window.contains(2));
    }

    #[test]
    fn test_window_wraps_around_u16() {
        let mut window = AckWindow::default();
        window.record(u16::MAX - 1);
        window.record(u16::MAX);
        window.record(1);
        assert_eq!(window.last, 1);
        assert!(window.contains(u16::MAX));
        assert!(window.contains(u16::MAX - 1));
        assert!(!window.contains(0));
    }

    #[test]
    fn test_acks_lists_every_set_bit() {
        let window = AckWindow {
            last: 50,
            bits: 0b1_0011,
        };
        let acks: Vec<u16> = window.acks().collect();
        assert_eq!(acks, vec![50, 49, 46]);
    }

    #[test]
    fn test_empty_window_yields_no_acks() {
        assert_eq!(AckWindow::default().acks().count(), 0);
    }
}
