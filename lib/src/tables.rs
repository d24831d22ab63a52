/*! Byte-level character tables.

The compiler and the matcher classify subject bytes through two fixed
256-entry tables: a case-fold table mapping each byte to its other-case
partner, and a flags table recording character-type membership (digit,
whitespace, word, and so on). Both are built in const context and follow
the C locale: only ASCII letters have case partners and only ASCII
characters belong to the shorthand classes, which is also what `\d`, `\s`
and `\w` match in UTF mode.
*/

pub const CTYPE_DIGIT: u8 = 0x01;
pub const CTYPE_LETTER: u8 = 0x02;
pub const CTYPE_SPACE: u8 = 0x04;
pub const CTYPE_WORD: u8 = 0x08;
pub const CTYPE_XDIGIT: u8 = 0x10;
pub const CTYPE_HSPACE: u8 = 0x20;
pub const CTYPE_VSPACE: u8 = 0x40;

const fn build_flags() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        let b = i as u8;
        let mut flags = 0u8;
        if b >= b'0' && b <= b'9' {
            flags |= CTYPE_DIGIT | CTYPE_WORD | CTYPE_XDIGIT;
        }
        if (b >= b'a' && b <= b'z') || (b >= b'A' && b <= b'Z') {
            flags |= CTYPE_LETTER | CTYPE_WORD;
        }
        if (b >= b'a' && b <= b'f') || (b >= b'A' && b <= b'F') {
            flags |= CTYPE_XDIGIT;
        }
        if b == b'_' {
            flags |= CTYPE_WORD;
        }
        if b == b' ' || b == b'\t' || b == b'\n' || b == 0x0B || b == 0x0C
            || b == b'\r'
        {
            flags |= CTYPE_SPACE;
        }
        if b == b' ' || b == b'\t' || b == 0xA0 {
            flags |= CTYPE_HSPACE;
        }
        if b == b'\n' || b == 0x0B || b == 0x0C || b == b'\r' || b == 0x85 {
            flags |= CTYPE_VSPACE;
        }
        table[i] = flags;
        i += 1;
    }
    table
}

const fn build_fold() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        let b = i as u8;
        table[i] = if b >= b'A' && b <= b'Z' {
            b + 32
        } else if b >= b'a' && b <= b'z' {
            b - 32
        } else {
            b
        };
        i += 1;
    }
    table
}

const FLAGS: [u8; 256] = build_flags();
const FOLD: [u8; 256] = build_fold();

/// Returns the character-type flags for a byte.
#[inline]
pub fn classify(byte: u8) -> u8 {
    FLAGS[byte as usize]
}

#[inline]
pub fn is_digit(byte: u8) -> bool {
    FLAGS[byte as usize] & CTYPE_DIGIT != 0
}

#[inline]
pub fn is_space(byte: u8) -> bool {
    FLAGS[byte as usize] & CTYPE_SPACE != 0
}

#[inline]
pub fn is_word(byte: u8) -> bool {
    FLAGS[byte as usize] & CTYPE_WORD != 0
}

#[inline]
pub fn is_xdigit(byte: u8) -> bool {
    FLAGS[byte as usize] & CTYPE_XDIGIT != 0
}

#[inline]
pub fn is_hspace(byte: u8) -> bool {
    FLAGS[byte as usize] & CTYPE_HSPACE != 0
}

#[inline]
pub fn is_vspace(byte: u8) -> bool {
    FLAGS[byte as usize] & CTYPE_VSPACE != 0
}

/// Returns the other-case partner of a byte, or the byte itself when it
/// has no case.
#[inline]
pub fn fold(byte: u8) -> u8 {
    FOLD[byte as usize]
}

/// Lowercases an ASCII letter, leaving every other byte untouched.
#[inline]
pub fn to_lower(byte: u8) -> u8 {
    if byte.is_ascii_uppercase() {
        byte + 32
    } else {
        byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        assert!(is_digit(b'7'));
        assert!(!is_digit(b'a'));
        assert!(is_word(b'_'));
        assert!(is_word(b'Q'));
        assert!(!is_word(b'-'));
        assert!(is_space(b'\t'));
        assert!(is_hspace(b' '));
        assert!(is_hspace(0xA0));
        assert!(!is_hspace(b'\n'));
        assert!(is_vspace(b'\x0C'));
        assert!(is_vspace(0x85));
        assert!(!is_vspace(b' '));
        assert!(is_xdigit(b'F'));
        assert!(!is_xdigit(b'g'));
    }

    #[test]
    fn case_fold() {
        assert_eq!(fold(b'a'), b'A');
        assert_eq!(fold(b'Z'), b'z');
        assert_eq!(fold(b'3'), b'3');
        assert_eq!(to_lower(b'A'), b'a');
        assert_eq!(to_lower(b'a'), b'a');
    }
}
