/// Set bit `bit` of `x` on if `toggle` is true, otherwise off.
pub fn bit(bit: u64, x: u64, toggle: bool) -> u64 {
    if toggle {
        x | (1 << bit)
    } else {
        x & !(1 << bit)
    }
}

/// Test whether bit `bit` of `x` is set.
pub fn test_bit(bit: u64, x: u64) -> bool {
    (x >> bit) & 1 == 1
}

/// Set bit `n` of a bitmap stored as consecutive 32-bit words, word 0 holding bits 0..32.
/// The bitmap grows as needed.
pub fn set_word_bit(words: &mut Vec<u32>, n: usize) {
    let index = n / 32;
    if words.len() <= index {
        words.resize(index + 1, 0);
    }
    words[index] = bit((n % 32) as u64, words[index] as u64, true) as u32;
}

/// Test bit `n` of a word bitmap. Bits past the end are unset.
pub fn test_word_bit(words: &[u32], n: usize) -> bool {
    match words.get(n / 32) {
        Some(&w) => test_bit((n % 32) as u64, w as u64),
        None => false,
    }
}

/// Iterate the indices of every set bit of a word bitmap, lowest first.
pub fn word_bits(words: &[u32]) -> impl Iterator<Item = usize> + '_ {
    (0..words.len() * 32).filter(move |&n| test_word_bit(words, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_single_bits() {
        assert_eq!(bit(3, 0, true), 8);
        assert_eq!(bit(3, 0xff, false), 0xf7);
        assert!(test_bit(7, 0x80));
        assert!(!test_bit(6, 0x80));
    }

    #[test]
    fn word_bitmap_grows_and_reads_back() {
        let mut words = vec![];
        set_word_bit(&mut words, 1);
        set_word_bit(&mut words, 4);
        set_word_bit(&mut words, 33);
        assert_eq!(words, vec![0b10010, 0b10]);
        assert!(test_word_bit(&words, 33));
        assert!(!test_word_bit(&words, 200));
        assert_eq!(word_bits(&words).collect::<Vec<_>>(), vec![1, 4, 33]);
    }
}
