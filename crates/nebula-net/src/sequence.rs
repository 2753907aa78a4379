//! Wrap-around aware comparison of 16-bit sequence numbers.
//!
//! Packet acks, reliable ids and in-order sequence ids are all `u16` values
//! that wrap. Two values are compared by the shortest distance around the
//! circle, so `0` is "after" `65535`:
//!
//! ```text
//!     65534  65535    0      1      2
//! ... --|------|------|------|------|-- ...
//! ```
//!
//! Comparisons are only meaningful while the real distance stays below
//! `u16::MAX / 2`, which every window in this crate guarantees.

use std::cmp::Ordering;

/// Signed number of steps from `from` forward to `to`.
///
/// ```
/// # use nebula_net::sequence::distance;
/// assert_eq!(distance(3, 5), 2);
/// assert_eq!(distance(5, 3), -2);
/// assert_eq!(distance(65535, 1), 2);
/// ```
pub const fn distance(from: u16, to: u16) -> i16 {
    to.wrapping_sub(from) as i16
}

/// Whether `a` comes strictly after `b`.
pub const fn is_newer(a: u16, b: u16) -> bool {
    distance(b, a) > 0
}

/// Ordering of `a` relative to `b` in sequence space.
pub fn compare(a: u16, b: u16) -> Ordering {
    distance(b, a).cmp(&0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_without_wrap() {
        assert!(is_newer(1, 0));
        assert!(!is_newer(0, 1));
        assert!(!is_newer(7, 7));
    }

    #[test]
    fn test_newer_across_wrap() {
        assert!(is_newer(0, u16::MAX));
        assert!(is_newer(3, u16::MAX - 3));
        assert!(!is_newer(u16::MAX, 0));
    }

    #[test]
    fn test_compare_matches_distance() {
        assert_eq!(compare(10, 5), Ordering::Greater);
        assert_eq!(compare(5, 10), Ordering::Less);
        assert_eq!(compare(2, 2), Ordering::Equal);
        assert_eq!(compare(1, u16::MAX), Ordering::Greater);
    }
}
