/*! Opaque Unicode property and case lookup service.

The engine does not carry hand-verified Unicode data tables. Property
queries (`\p{..}`, `\P{..}`) and case folding above the byte range are
answered through `char` classification methods, plus a handful of range
checks for the categories the standard library does not expose directly.
The granularity is the set of general categories accepted by
[`Category::parse`]; scripts and finer subtypes are not supported.
*/

/// General categories understood by `\p{..}` and `\P{..}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Category {
    /// Matches any character. `\p{Any}`.
    Any = 0,
    /// Letter.
    L = 1,
    /// Uppercase letter.
    Lu = 2,
    /// Lowercase letter.
    Ll = 3,
    /// Titlecase letter, approximated as uppercase-but-not-lowercase.
    Lt = 4,
    /// Mark (combining).
    M = 5,
    /// Number.
    N = 6,
    /// Decimal number.
    Nd = 7,
    /// Punctuation.
    P = 8,
    /// Symbol.
    S = 9,
    /// Separator.
    Z = 10,
    /// Space separator.
    Zs = 11,
    /// Other (control, format, unassigned, private use).
    C = 12,
    /// Word character: letter, number or underscore. `\p{Word}`.
    Word = 13,
}

impl Category {
    /// Parses a property name as it appears between the braces of
    /// `\p{..}`. One-letter major categories and the two-letter
    /// subcategories listed above are accepted.
    pub fn parse(name: &str) -> Option<Category> {
        Some(match name {
            "Any" => Category::Any,
            "L" => Category::L,
            "Lu" => Category::Lu,
            "Ll" => Category::Ll,
            "Lt" => Category::Lt,
            "M" => Category::M,
            "N" => Category::N,
            "Nd" => Category::Nd,
            "P" => Category::P,
            "S" => Category::S,
            "Z" => Category::Z,
            "Zs" => Category::Zs,
            "C" => Category::C,
            "Word" | "word" => Category::Word,
            _ => return None,
        })
    }

    pub(crate) fn from_code(code: u8) -> Option<Category> {
        Some(match code {
            0 => Category::Any,
            1 => Category::L,
            2 => Category::Lu,
            3 => Category::Ll,
            4 => Category::Lt,
            5 => Category::M,
            6 => Category::N,
            7 => Category::Nd,
            8 => Category::P,
            9 => Category::S,
            10 => Category::Z,
            11 => Category::Zs,
            12 => Category::C,
            13 => Category::Word,
            _ => return None,
        })
    }

    /// Returns true if `c` belongs to the category.
    pub fn contains(self, c: char) -> bool {
        match self {
            Category::Any => true,
            Category::L => c.is_alphabetic(),
            Category::Lu => c.is_uppercase(),
            Category::Ll => c.is_lowercase(),
            Category::Lt => c.is_uppercase() && !c.is_lowercase(),
            Category::M => is_mark(c),
            Category::N => c.is_numeric(),
            Category::Nd => c.to_digit(10).is_some() || c.is_ascii_digit(),
            Category::P => c.is_ascii_punctuation() || is_punctuation(c),
            Category::S => is_symbol(c),
            Category::Z => is_separator(c),
            Category::Zs => is_space_separator(c),
            Category::C => c.is_control() || is_format(c),
            Category::Word => c.is_alphanumeric() || c == '_',
        }
    }
}

fn is_mark(c: char) -> bool {
    matches!(u32::from(c),
        0x0300..=0x036F
        | 0x0483..=0x0489
        | 0x0591..=0x05BD
        | 0x0610..=0x061A
        | 0x064B..=0x065F
        | 0x0E31..=0x0E3A
        | 0x0F71..=0x0F84
        | 0x1AB0..=0x1AFF
        | 0x1DC0..=0x1DFF
        | 0x20D0..=0x20FF
        | 0xFE20..=0xFE2F)
}

fn is_punctuation(c: char) -> bool {
    matches!(u32::from(c),
        0x00A1 | 0x00A7 | 0x00AB | 0x00B6 | 0x00B7 | 0x00BB | 0x00BF
        | 0x2010..=0x2027
        | 0x2030..=0x205E
        | 0x3001..=0x3003
        | 0x300C..=0x3011)
}

fn is_symbol(c: char) -> bool {
    matches!(c, '$' | '+' | '<' | '=' | '>' | '^' | '`' | '|' | '~')
        || matches!(u32::from(c),
            0x00A2..=0x00A6
            | 0x00A9 | 0x00AE | 0x00B0 | 0x00B1
            | 0x20A0..=0x20BF
            | 0x2190..=0x2BFF)
}

fn is_separator(c: char) -> bool {
    is_space_separator(c) || matches!(u32::from(c), 0x2028 | 0x2029)
}

fn is_space_separator(c: char) -> bool {
    matches!(u32::from(c),
        0x0020 | 0x00A0 | 0x1680 | 0x2000..=0x200A | 0x202F | 0x205F
        | 0x3000)
}

fn is_format(c: char) -> bool {
    matches!(u32::from(c),
        0x00AD | 0x200B..=0x200F | 0x202A..=0x202E | 0x2060..=0x2064
        | 0xFEFF)
}

/// Simple case fold for a character: the lowercase form when the character
/// has a single-character lowercase mapping, otherwise the character
/// itself.
#[inline]
pub fn fold_char(c: char) -> char {
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(l), None) => l,
        _ => c,
    }
}

/// Returns true if two characters are equal under simple case folding.
#[inline]
pub fn chars_eq_folded(a: char, b: char) -> bool {
    a == b || fold_char(a) == fold_char(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert!(Category::L.contains('ß'));
        assert!(Category::Lu.contains('Á'));
        assert!(!Category::Lu.contains('á'));
        assert!(Category::Nd.contains('7'));
        assert!(Category::Zs.contains('\u{2003}'));
        assert!(Category::Any.contains('\u{0}'));
        assert!(Category::Word.contains('_'));
    }

    #[test]
    fn parse_names() {
        assert_eq!(Category::parse("Lu"), Some(Category::Lu));
        assert_eq!(Category::parse("Nd"), Some(Category::Nd));
        assert_eq!(Category::parse("Xx"), None);
    }

    #[test]
    fn folding() {
        assert!(chars_eq_folded('A', 'a'));
        assert!(chars_eq_folded('Á', 'á'));
        assert!(!chars_eq_folded('a', 'b'));
    }
}
