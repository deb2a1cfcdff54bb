//! Bit-slice access into capture words
//!
//! A capture sample is a little-endian array of 32-bit bus words: bit `n` of
//! the sample is bit `n % 32` of word `n / 32`. Every bit offset in a
//! [`crate::map::SignalLayout`] is relative to that numbering, and these two
//! functions are the only place that arithmetic lives.

/// Read `width` bits (at most 128) starting at bit `offset`.
///
/// Bits past the end of `words` read as zero.
pub fn extract(words: &[u32], offset: u32, width: u32) -> u128 {
    let mut value = 0u128;
    let mut done = 0u32;
    while done < width {
        let bit = offset + done;
        let shift = bit % 32;
        let take = (32 - shift).min(width - done);
        let word = words.get((bit / 32) as usize).copied().unwrap_or(0) >> shift;
        value |= ((word & field(take)) as u128) << done;
        done += take;
    }
    value
}

/// Overwrite `width` bits starting at bit `offset` with the low bits of `value`.
///
/// Bits that fall past the end of `words` are dropped.
pub fn insert(words: &mut [u32], offset: u32, width: u32, value: u128) {
    let mut done = 0u32;
    while done < width {
        let bit = offset + done;
        let shift = bit % 32;
        let take = (32 - shift).min(width - done);
        let mask = field(take);
        let part = (value >> done) as u32 & mask;
        if let Some(word) = words.get_mut((bit / 32) as usize) {
            *word = (*word & !(mask << shift)) | (part << shift);
        }
        done += take;
    }
}

#[inline]
fn field(bits: u32) -> u32 {
    if bits >= 32 { u32::MAX } else { (1 << bits) - 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_bits() {
        let words = [0b1000_1001u32];
        assert_eq!(extract(&words, 0, 1), 1);
        assert_eq!(extract(&words, 1, 1), 0);
        assert_eq!(extract(&words, 3, 1), 1);
        assert_eq!(extract(&words, 7, 1), 1);
    }

    #[test]
    fn test_spanning_word_boundary() {
        let words = [0xc000_0000u32, 0x0000_0029];
        assert_eq!(extract(&words, 30, 8), 0xa7);

        let mut out = [0u32; 2];
        insert(&mut out, 30, 8, 0xa7);
        assert_eq!(out, words);
    }

    #[test]
    fn test_full_words_and_wide_values() {
        let words = [0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444];
        assert_eq!(extract(&words, 32, 32), 0x2222_2222);
        assert_eq!(
            extract(&words, 0, 128),
            0x4444_4444_3333_3333_2222_2222_1111_1111
        );
    }

    #[test]
    fn test_insert_preserves_neighbours() {
        let mut words = [u32::MAX];
        insert(&mut words, 4, 4, 0);
        assert_eq!(words[0], 0xffff_ff0f);
        insert(&mut words, 4, 4, 0x1f);
        assert_eq!(words[0], u32::MAX);
    }

    #[test]
    fn test_out_of_range_bits() {
        assert_eq!(extract(&[u32::MAX], 30, 4), 0b11);
        let mut words = [0u32];
        insert(&mut words, 30, 4, 0xf);
        assert_eq!(words[0], 0xc000_0000);
    }
}
