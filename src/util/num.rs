/// Round up `n` to the nearest `to`, or `None` if that does not fit in a
/// `usize`.
pub const fn round_up(n: usize, to: usize) -> Option<usize> {
    match n.checked_add(to - 1) {
        Some(m) => Some(to * (m / to)),
        None => None,
    }
}

/// Bytes needed to hold `bits` bits in whole 64-bit words.
pub const fn words_in_bytes(bits: u64) -> Option<u64> {
    match bits.checked_add(63) {
        Some(b) => Some((b >> 6) << 3),
        None => None,
    }
}

/// Bytes actually reserved for a vector of `bits` bits. This is one word more
/// than [`words_in_bytes()`] when `bits` is a multiple of 64, so that a rank
/// query at `bits` may read the word at index `bits / 64`.
pub const fn padded_bytes(bits: u64) -> Option<u64> {
    match bits.checked_add(64) {
        Some(b) => Some((b >> 6) << 3),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn round_up_computes_correctly() {
        assert_eq!(round_up(1, 8), Some(8));
        assert_eq!(round_up(8, 8), Some(8));
        assert_eq!(round_up(9, 8), Some(16));
        assert_eq!(round_up(0, 4096), Some(0));
        assert_eq!(round_up(4097, 4096), Some(8192));
        assert_eq!(round_up(usize::MAX, 4096), None);
        assert_eq!(round_up(usize::MAX, 1), Some(usize::MAX));
    }

    #[test]
    pub fn padding_adds_a_word_on_exact_multiples() {
        assert_eq!(words_in_bytes(0), Some(0));
        assert_eq!(padded_bytes(0), Some(8));
        assert_eq!(words_in_bytes(64), Some(8));
        assert_eq!(padded_bytes(64), Some(16));
        assert_eq!(words_in_bytes(65), Some(16));
        assert_eq!(padded_bytes(65), Some(16));
        assert_eq!(words_in_bytes(127), Some(16));
        assert_eq!(padded_bytes(127), Some(16));
    }

    #[test]
    pub fn huge_bit_counts_do_not_wrap() {
        assert_eq!(words_in_bytes(u64::MAX), None);
        assert_eq!(padded_bytes(u64::MAX), None);
        assert_eq!(words_in_bytes(u64::MAX - 63), Some((1 << 61) - 8));
        assert_eq!(padded_bytes(u64::MAX - 63), None);
    }
}
