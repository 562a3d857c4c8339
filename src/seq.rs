//! Sequence-number arithmetic over the 32-bit wrap-around space.
//!
//! All comparisons go through signed deltas: `a` is before `b` iff the
//! wrapping difference, reinterpreted as i32, is negative. This is valid as
//! long as compared numbers are within half the sequence space of each other,
//! which the window bounds guarantee.

pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// True if `p` lies in `[beg, beg + size)`, accounting for the region
/// wrapping past the top of the sequence space.
pub fn in_window(beg: u32, size: u32, p: u32) -> bool {
    let end = beg.wrapping_add(size);
    if end > beg {
        p >= beg && p < end
    } else if end < beg {
        !(p < beg && p >= end)
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple(1, 2, true)]
    #[case::equal(7, 7, false)]
    #[case::reverse(2, 1, false)]
    #[case::wrap(0xfffffff0, 4, true)]
    #[case::wrap_reverse(4, 0xfffffff0, false)]
    fn test_seq_lt(#[case] a: u32, #[case] b: u32, #[case] expected: bool) {
        assert_eq!(seq_lt(a, b), expected);
    }

    #[rstest]
    #[case::equal(9, 9, true)]
    #[case::less(8, 9, true)]
    #[case::greater(10, 9, false)]
    fn test_seq_le(#[case] a: u32, #[case] b: u32, #[case] expected: bool) {
        assert_eq!(seq_le(a, b), expected);
    }

    #[rstest]
    #[case::at_start(100, 10, 100, true)]
    #[case::inside(100, 10, 105, true)]
    #[case::at_end(100, 10, 110, false)]
    #[case::before(100, 10, 99, false)]
    #[case::wrap_inside_low(0xfffffffc, 8, 2, true)]
    #[case::wrap_inside_high(0xfffffffc, 8, 0xfffffffd, true)]
    #[case::wrap_at_end(0xfffffffc, 8, 4, false)]
    #[case::wrap_before(0xfffffffc, 8, 0xfffffffb, false)]
    #[case::empty(5, 0, 5, false)]
    fn test_in_window(#[case] beg: u32, #[case] size: u32, #[case] p: u32, #[case] expected: bool) {
        assert_eq!(in_window(beg, size, p), expected);
    }
}
