/*!
Static analysis over compiled code.

Everything here walks instruction streams without executing them: the
fixed-length scanner that sizes lookbehind branches, the anchoredness
tests, and the match-time hints (first byte, required byte, starting-byte
bitmap) that let the executor skip hopeless starting positions.
*/

use crate::instr::{
    branch_starts, bracket_ket, decode, CodeFmt, Instr, OP_KET,
};

#[cfg(feature = "study")]
use crate::program::StartBits;
#[cfg(feature = "study")]
use crate::tables;
#[cfg(feature = "study")]
use crate::unicode::fold_char;

/// Branch body ranges of the bracket at `at`, each excluding the
/// trailing ALT/KET instruction.
fn branch_ranges(code: &[u8], at: usize, fmt: CodeFmt) -> Vec<(usize, usize)> {
    let lb = fmt.link_bytes();
    let starts = branch_starts(code, at, fmt);
    let ket = bracket_ket(code, at, fmt);
    let mut ranges = Vec::with_capacity(starts.len());
    for (i, &s) in starts.iter().enumerate() {
        let e = match starts.get(i + 1) {
            Some(&next) => next - (1 + lb), // the ALT before the next branch
            None => ket,
        };
        ranges.push((s, e));
    }
    ranges
}

/// First byte of the UTF-8 encoding of `c`, or the character itself in
/// byte mode.
fn leading_byte(c: char, utf: bool) -> u8 {
    if !utf || (c as u32) < 0x80 {
        c as u8
    } else {
        let mut buf = [0u8; 4];
        c.encode_utf8(&mut buf);
        buf[0]
    }
}

// ----- fixed length ---------------------------------------------------

/// Number of characters matched by a branch, when that number is the
/// same on every path through it. `None` when the branch is variable
/// length. `code` is a single branch body with no terminator.
pub(super) fn fixed_length(code: &[u8], fmt: CodeFmt) -> Option<usize> {
    fixed_range(code, 0, code.len(), fmt)
}

fn fixed_range(
    code: &[u8],
    from: usize,
    to: usize,
    fmt: CodeFmt,
) -> Option<usize> {
    let lb = fmt.link_bytes();
    let mut pos = from;
    let mut chars = 0usize;
    while pos < to {
        let (instr, len) = decode(code, pos, fmt);
        match instr {
            Instr::Char(_)
            | Instr::CharI(_)
            | Instr::NotChar(_)
            | Instr::NotCharI(_)
            | Instr::Any
            | Instr::AllAny
            | Instr::HSpace
            | Instr::NotHSpace
            | Instr::VSpace
            | Instr::NotVSpace
            | Instr::Digit
            | Instr::NotDigit
            | Instr::Whitespace
            | Instr::NotWhitespace
            | Instr::Wordchar
            | Instr::NotWordchar
            | Instr::Prop(_)
            | Instr::NotProp(_)
            | Instr::Class(_)
            | Instr::NClass(_)
            | Instr::XClass(_) => {
                chars += 1;
                pos += len;
            }
            // A single byte is a whole character only outside UTF mode.
            Instr::AnyByte if !fmt.utf => {
                chars += 1;
                pos += len;
            }
            Instr::Exact(n) => {
                let item_at = pos + len;
                let (item, item_len) = decode(code, item_at, fmt);
                match item {
                    Instr::AnyNl | Instr::AnyByte if fmt.utf => return None,
                    Instr::AnyNl => return None,
                    _ => {}
                }
                chars += n as usize;
                pos = item_at + item_len;
            }
            Instr::Bra(_) | Instr::CBra(_, _) | Instr::Once(_) => {
                let ket = bracket_ket(code, pos, fmt);
                if code[ket] != OP_KET {
                    return None; // an unbounded repeat
                }
                let mut group_len = None;
                for (s, e) in branch_ranges(code, pos, fmt) {
                    let branch = fixed_range(code, s, e, fmt)?;
                    match group_len {
                        None => group_len = Some(branch),
                        Some(prev) if prev == branch => {}
                        Some(_) => return None,
                    }
                }
                chars += group_len.unwrap_or(0);
                pos = ket + 1 + lb;
            }
            Instr::Assert(_)
            | Instr::AssertNot(_)
            | Instr::AssertBack(_)
            | Instr::AssertBackNot(_) => {
                pos = bracket_ket(code, pos, fmt) + 1 + lb;
            }
            Instr::SkipZero => {
                pos += len;
                pos = bracket_ket(code, pos, fmt) + 1 + lb;
            }
            Instr::Circ
            | Instr::CircM
            | Instr::Doll
            | Instr::DollM
            | Instr::Sod
            | Instr::Som
            | Instr::Eodn
            | Instr::Eod
            | Instr::WordBoundary
            | Instr::NotWordBoundary
            | Instr::Reverse(_) => pos += len,
            Instr::End => break,
            _ => return None,
        }
    }
    Some(chars)
}

// ----- anchoredness ---------------------------------------------------

/// True when every alternative of the pattern starts with a start-of-
/// subject assertion, so a failed attempt never needs a bump-along.
pub(super) fn is_anchored(code: &[u8], fmt: CodeFmt) -> bool {
    bracket_branches_head(code, 0, fmt, &|code, at, fmt| {
        matches!(
            decode(code, at, fmt).0,
            Instr::Circ | Instr::Sod | Instr::Som
        )
    })
}

/// True when every alternative starts with a multiline `^`, so attempts
/// are only useful at the start of a line.
pub(super) fn starts_line(code: &[u8], fmt: CodeFmt) -> bool {
    bracket_branches_head(code, 0, fmt, &|code, at, fmt| {
        matches!(decode(code, at, fmt).0, Instr::CircM)
    })
}

/// Applies `pred` to the first instruction of every branch of the
/// bracket at `at`, descending into leading groups and lookaheads.
fn bracket_branches_head(
    code: &[u8],
    at: usize,
    fmt: CodeFmt,
    pred: &dyn Fn(&[u8], usize, CodeFmt) -> bool,
) -> bool {
    for (s, _) in branch_ranges(code, at, fmt) {
        let head = match decode(code, s, fmt).0 {
            Instr::Bra(_)
            | Instr::CBra(_, _)
            | Instr::Once(_)
            | Instr::Assert(_) => {
                bracket_branches_head(code, s, fmt, pred)
            }
            _ => pred(code, s, fmt),
        };
        if !head {
            return false;
        }
    }
    true
}

// ----- first byte -----------------------------------------------------

/// The single byte every match must start with, when there is one.
/// The flag reports a caseless comparison.
pub(super) fn first_byte(code: &[u8], fmt: CodeFmt) -> Option<(u8, bool)> {
    bracket_first(code, 0, fmt)
}

fn bracket_first(
    code: &[u8],
    at: usize,
    fmt: CodeFmt,
) -> Option<(u8, bool)> {
    let mut common = None;
    for (s, _) in branch_ranges(code, at, fmt) {
        let first = branch_first(code, s, fmt)?;
        match common {
            None => common = Some(first),
            Some(prev) if prev == first => {}
            Some(_) => return None,
        }
    }
    common
}

fn branch_first(code: &[u8], at: usize, fmt: CodeFmt) -> Option<(u8, bool)> {
    let (instr, len) = decode(code, at, fmt);
    match instr {
        Instr::Char(c) => Some((leading_byte(c, fmt.utf), false)),
        Instr::CharI(c) if (c as u32) < 0x80 => Some((c as u8, true)),
        // The first repetition of a mandatory repeat is the first byte.
        Instr::Plus | Instr::MinPlus | Instr::PosPlus | Instr::Exact(_) => {
            branch_first(code, at + len, fmt)
        }
        Instr::Bra(_)
        | Instr::CBra(_, _)
        | Instr::Once(_)
        | Instr::Assert(_) => bracket_first(code, at, fmt),
        _ => None,
    }
}

// ----- required byte --------------------------------------------------

/// The last byte a match must contain, regardless of where it starts.
/// Only single-alternative patterns are scanned; the executor uses this
/// to reject subjects in which the byte never appears.
pub(super) fn req_byte(code: &[u8], fmt: CodeFmt) -> Option<(u8, bool)> {
    let ranges = branch_ranges(code, 0, fmt);
    match ranges.as_slice() {
        [range] => scan_req(code, *range, fmt).unwrap_or(None),
        _ => None,
    }
}

fn literal_byte(instr: &Instr, utf: bool) -> Option<(u8, bool)> {
    match instr {
        Instr::Char(c) => Some((leading_byte(*c, utf), false)),
        Instr::CharI(c) if (*c as u32) < 0x80 => Some((*c as u8, true)),
        _ => None,
    }
}

/// `Err` means the scan hit something that invalidates the hint
/// entirely (an early ACCEPT or a subroutine call).
fn scan_req(
    code: &[u8],
    (from, to): (usize, usize),
    fmt: CodeFmt,
) -> Result<Option<(u8, bool)>, ()> {
    let lb = fmt.link_bytes();
    let mut last = None;
    let mut pos = from;
    while pos < to {
        let (instr, len) = decode(code, pos, fmt);
        match instr {
            Instr::Char(_) | Instr::CharI(_) => {
                if let Some(b) = literal_byte(&instr, fmt.utf) {
                    last = Some(b);
                }
                pos += len;
            }
            // mandatory repeats keep their item mandatory
            Instr::Plus | Instr::MinPlus | Instr::PosPlus
            | Instr::Exact(_) => {
                let (item, item_len) = decode(code, pos + len, fmt);
                if let Some(b) = literal_byte(&item, fmt.utf) {
                    last = Some(b);
                }
                pos += len + item_len;
            }
            // optional repeats skip their item
            Instr::Star
            | Instr::MinStar
            | Instr::PosStar
            | Instr::Query
            | Instr::MinQuery
            | Instr::PosQuery
            | Instr::Upto(_)
            | Instr::MinUpto(_)
            | Instr::PosUpto(_) => {
                let (_, item_len) = decode(code, pos + len, fmt);
                pos += len + item_len;
            }
            Instr::Bra(_) | Instr::CBra(_, _) | Instr::Once(_) => {
                let ranges = branch_ranges(code, pos, fmt);
                if let [range] = ranges.as_slice() {
                    if let Some(b) = scan_req(code, *range, fmt)? {
                        last = Some(b);
                    }
                }
                pos = bracket_ket(code, pos, fmt) + 1 + lb;
            }
            Instr::SBra(_) | Instr::SCBra(_, _) => {
                pos = bracket_ket(code, pos, fmt) + 1 + lb;
            }
            Instr::BraZero | Instr::BraMinZero | Instr::SkipZero => {
                pos += len;
                pos = bracket_ket(code, pos, fmt) + 1 + lb;
            }
            Instr::Assert(_)
            | Instr::AssertNot(_)
            | Instr::AssertBack(_)
            | Instr::AssertBackNot(_)
            | Instr::Cond(_) => {
                pos = bracket_ket(code, pos, fmt) + 1 + lb;
            }
            Instr::Recurse(_) | Instr::Accept | Instr::Fail => {
                return Err(());
            }
            Instr::End => break,
            _ => pos += len,
        }
    }
    Ok(last)
}

// ----- starting-byte bitmap -------------------------------------------

#[cfg(feature = "study")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ssb {
    /// An item can match some byte not representable in the bitmap.
    Fail,
    /// The first mandatory item has contributed its bytes.
    Done,
    /// Everything so far can match empty; keep scanning.
    Continue,
}

/// Builds the 256-bit set of bytes a match can possibly start with.
/// `None` when the set cannot be established (or would be every byte).
#[cfg(feature = "study")]
pub(super) fn start_bits(
    code: &[u8],
    fmt: CodeFmt,
) -> Option<Box<StartBits>> {
    let mut bits = Box::new(StartBits::ZERO);
    let mut agg = Ssb::Done;
    for (s, e) in branch_ranges(code, 0, fmt) {
        match ssb_range(code, s, e, fmt, &mut bits) {
            Ssb::Fail => return None,
            Ssb::Continue => agg = Ssb::Continue,
            Ssb::Done => {}
        }
    }
    match agg {
        Ssb::Done => Some(bits),
        _ => None,
    }
}

#[cfg(feature = "study")]
fn set_byte(bits: &mut StartBits, b: u8) {
    bits.set(b as usize, true);
}

#[cfg(feature = "study")]
fn set_char_start(bits: &mut StartBits, c: char, caseless: bool, utf: bool) {
    set_byte(bits, leading_byte(c, utf));
    if caseless {
        if (c as u32) < 0x100 {
            set_byte(bits, leading_byte(tables::fold(c as u8) as char, utf));
        }
        let folded = fold_char(c);
        if folded != c {
            set_byte(bits, leading_byte(folded, utf));
        }
    }
}

#[cfg(feature = "study")]
fn set_table_bytes(bits: &mut StartBits, test: fn(u8) -> bool) {
    for b in 0..=255u8 {
        if test(b) {
            set_byte(bits, b);
        }
    }
}

/// Sets the lead bytes of every multibyte UTF-8 sequence.
#[cfg(feature = "study")]
fn set_wide_leads(bits: &mut StartBits) {
    for b in 0xC2..=0xF4u8 {
        set_byte(bits, b);
    }
}

#[cfg(feature = "study")]
fn set_class_bytes(bits: &mut StartBits, map: &[u8], utf: bool) {
    if !utf {
        let raw = bits.as_raw_mut_slice();
        for (dst, src) in raw.iter_mut().zip(map.iter()) {
            *dst |= *src;
        }
        return;
    }
    // In UTF mode the bitmap is indexed by codepoint: the ASCII half
    // maps to itself, the upper half to two-byte sequences with lead
    // bytes 0xC2 and 0xC3.
    let raw = bits.as_raw_mut_slice();
    for (dst, src) in raw.iter_mut().take(16).zip(map.iter()) {
        *dst |= *src;
    }
    if map[16..32].iter().any(|b| *b != 0) {
        set_byte(bits, 0xC2);
        set_byte(bits, 0xC3);
    }
}

#[cfg(feature = "study")]
fn ssb_range(
    code: &[u8],
    from: usize,
    to: usize,
    fmt: CodeFmt,
    bits: &mut StartBits,
) -> Ssb {
    let lb = fmt.link_bytes();
    let mut pos = from;
    while pos < to {
        let (instr, len) = decode(code, pos, fmt);
        match instr {
            Instr::Char(c) => {
                set_char_start(bits, c, false, fmt.utf);
                return Ssb::Done;
            }
            Instr::CharI(c) => {
                set_char_start(bits, c, true, fmt.utf);
                return Ssb::Done;
            }
            Instr::Digit => {
                set_table_bytes(bits, tables::is_digit);
                return Ssb::Done;
            }
            Instr::Whitespace => {
                set_table_bytes(bits, tables::is_space);
                if fmt.utf {
                    set_wide_leads(bits);
                }
                return Ssb::Done;
            }
            Instr::Wordchar => {
                set_table_bytes(bits, tables::is_word);
                return Ssb::Done;
            }
            Instr::HSpace => {
                set_table_bytes(bits, tables::is_hspace);
                if fmt.utf {
                    set_wide_leads(bits);
                }
                return Ssb::Done;
            }
            Instr::VSpace | Instr::AnyNl => {
                set_table_bytes(bits, tables::is_vspace);
                if fmt.utf {
                    set_wide_leads(bits);
                }
                return Ssb::Done;
            }
            Instr::Class(map) => {
                set_class_bytes(bits, map, fmt.utf);
                return Ssb::Done;
            }
            Instr::NClass(map) => {
                set_class_bytes(bits, map, fmt.utf);
                if fmt.utf {
                    set_wide_leads(bits);
                }
                return Ssb::Done;
            }
            // optional single-item repeats: absorb the item's bytes and
            // keep scanning
            Instr::Star
            | Instr::MinStar
            | Instr::PosStar
            | Instr::Query
            | Instr::MinQuery
            | Instr::PosQuery
            | Instr::Upto(_)
            | Instr::MinUpto(_)
            | Instr::PosUpto(_) => {
                let item_at = pos + len;
                let (_, item_len) = decode(code, item_at, fmt);
                match ssb_range(code, item_at, item_at + item_len, fmt, bits)
                {
                    Ssb::Fail => return Ssb::Fail,
                    _ => pos = item_at + item_len,
                }
            }
            Instr::Plus | Instr::MinPlus | Instr::PosPlus
            | Instr::Exact(_) => {
                let item_at = pos + len;
                let (_, item_len) = decode(code, item_at, fmt);
                return ssb_range(
                    code,
                    item_at,
                    item_at + item_len,
                    fmt,
                    bits,
                );
            }
            Instr::Bra(_)
            | Instr::CBra(_, _)
            | Instr::SBra(_)
            | Instr::SCBra(_, _)
            | Instr::Once(_) => {
                let ket = bracket_ket(code, pos, fmt);
                let mut agg = Ssb::Done;
                for (s, e) in branch_ranges(code, pos, fmt) {
                    match ssb_range(code, s, e, fmt, bits) {
                        Ssb::Fail => return Ssb::Fail,
                        Ssb::Continue => agg = Ssb::Continue,
                        Ssb::Done => {}
                    }
                }
                if agg == Ssb::Done {
                    return Ssb::Done;
                }
                pos = ket + 1 + lb;
            }
            Instr::BraZero | Instr::BraMinZero => {
                let bra = pos + len;
                let ket = bracket_ket(code, bra, fmt);
                for (s, e) in branch_ranges(code, bra, fmt) {
                    if ssb_range(code, s, e, fmt, bits) == Ssb::Fail {
                        return Ssb::Fail;
                    }
                }
                pos = ket + 1 + lb;
            }
            Instr::SkipZero => {
                let bra = pos + len;
                pos = bracket_ket(code, bra, fmt) + 1 + lb;
            }
            Instr::Assert(_)
            | Instr::AssertNot(_)
            | Instr::AssertBack(_)
            | Instr::AssertBackNot(_) => {
                pos = bracket_ket(code, pos, fmt) + 1 + lb;
            }
            Instr::Circ
            | Instr::CircM
            | Instr::Doll
            | Instr::DollM
            | Instr::Sod
            | Instr::Som
            | Instr::Eodn
            | Instr::Eod
            | Instr::WordBoundary
            | Instr::NotWordBoundary
            | Instr::Commit
            | Instr::Prune
            | Instr::Skip
            | Instr::Then
            | Instr::Reverse(_)
            | Instr::CRef(_)
            | Instr::RRef(_)
            | Instr::Def => pos += len,
            // A branch that always fails contributes no bytes.
            Instr::Fail => return Ssb::Done,
            Instr::Accept | Instr::End => break,
            _ => return Ssb::Fail,
        }
    }
    Ssb::Continue
}
