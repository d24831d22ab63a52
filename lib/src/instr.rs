/*!
This module defines the instructions executed by the backtracking VM, and
the encoding/decoding helpers shared by the compiler and the matcher.

Instruction encoding format
---------------------------

A compiled program is a flat byte sequence of variable-length instructions.
Every instruction starts with a one-byte opcode, followed by zero or more
operand bytes. There are four operand shapes:

- a character, stored as a single byte, or UTF-8 encoded when the program
  was compiled in UTF mode (the length is recoverable from the leading
  byte);
- a 16-bit little-endian number (group numbers, repeat counts);
- a link: an unsigned offset whose width is 2, 3 or 4 bytes, fixed per
  program by [`LinkSize`]. Links connect the pieces of a bracket group:
  the link in `BRA`/`CBRA`/`ALT` is the forward distance to the next
  alternative (or to the closing `KET`); the link in the `KET` family is
  the backward distance to the bracket start; the link in `RECURSE` is the
  absolute offset of the called group; the link in `XCLASS` is the total
  instruction length, so a scanner can skip the class without
  interpreting it;
- a 256-bit class bitmap (32 bytes).

The whole pattern is wrapped in an outermost `BRA`..`KET` pair and the
stream is terminated by `END`. Every opcode has a length computable from
the bytes alone (given the UTF flag and the link width), which is what
allows the compiler's bracket matching and the matcher's skipping to walk
code they do not interpret.

A repeat opcode (`STAR` .. `EXACT`) qualifies the single-item instruction
that immediately follows it; the pair is still two separately skippable
instructions.
*/

use std::fmt::{Display, Formatter};

use bitvec::order::Lsb0;
use bitvec::slice::BitSlice;

use crate::options::LinkSize;
use crate::unicode::Category;

pub(crate) const OP_END: u8 = 0x00;

pub(crate) const OP_CHAR: u8 = 0x01;
pub(crate) const OP_CHARI: u8 = 0x02;
pub(crate) const OP_NOT: u8 = 0x03;
pub(crate) const OP_NOTI: u8 = 0x04;

pub(crate) const OP_ANY: u8 = 0x05;
pub(crate) const OP_ALLANY: u8 = 0x06;
pub(crate) const OP_ANYBYTE: u8 = 0x07;
pub(crate) const OP_ANYNL: u8 = 0x08;
pub(crate) const OP_HSPACE: u8 = 0x09;
pub(crate) const OP_NOT_HSPACE: u8 = 0x0A;
pub(crate) const OP_VSPACE: u8 = 0x0B;
pub(crate) const OP_NOT_VSPACE: u8 = 0x0C;
pub(crate) const OP_DIGIT: u8 = 0x0D;
pub(crate) const OP_NOT_DIGIT: u8 = 0x0E;
pub(crate) const OP_WHITESPACE: u8 = 0x0F;
pub(crate) const OP_NOT_WHITESPACE: u8 = 0x10;
pub(crate) const OP_WORDCHAR: u8 = 0x11;
pub(crate) const OP_NOT_WORDCHAR: u8 = 0x12;
pub(crate) const OP_PROP: u8 = 0x13;
pub(crate) const OP_NOTPROP: u8 = 0x14;

pub(crate) const OP_CLASS: u8 = 0x15;
pub(crate) const OP_NCLASS: u8 = 0x16;
pub(crate) const OP_XCLASS: u8 = 0x17;

pub(crate) const OP_CIRC: u8 = 0x18;
pub(crate) const OP_CIRCM: u8 = 0x19;
pub(crate) const OP_DOLL: u8 = 0x1A;
pub(crate) const OP_DOLLM: u8 = 0x1B;
pub(crate) const OP_SOD: u8 = 0x1C;
pub(crate) const OP_SOM: u8 = 0x1D;
pub(crate) const OP_EODN: u8 = 0x1E;
pub(crate) const OP_EOD: u8 = 0x1F;
pub(crate) const OP_WORD_BOUNDARY: u8 = 0x20;
pub(crate) const OP_NOT_WORD_BOUNDARY: u8 = 0x21;

pub(crate) const OP_STAR: u8 = 0x22;
pub(crate) const OP_MINSTAR: u8 = 0x23;
pub(crate) const OP_POSSTAR: u8 = 0x24;
pub(crate) const OP_PLUS: u8 = 0x25;
pub(crate) const OP_MINPLUS: u8 = 0x26;
pub(crate) const OP_POSPLUS: u8 = 0x27;
pub(crate) const OP_QUERY: u8 = 0x28;
pub(crate) const OP_MINQUERY: u8 = 0x29;
pub(crate) const OP_POSQUERY: u8 = 0x2A;
pub(crate) const OP_UPTO: u8 = 0x2B;
pub(crate) const OP_MINUPTO: u8 = 0x2C;
pub(crate) const OP_POSUPTO: u8 = 0x2D;
pub(crate) const OP_EXACT: u8 = 0x2E;

pub(crate) const OP_REF: u8 = 0x2F;
pub(crate) const OP_REFI: u8 = 0x30;

pub(crate) const OP_BRA: u8 = 0x31;
pub(crate) const OP_CBRA: u8 = 0x32;
pub(crate) const OP_ALT: u8 = 0x33;
pub(crate) const OP_KET: u8 = 0x34;
pub(crate) const OP_KETRMAX: u8 = 0x35;
pub(crate) const OP_KETRMIN: u8 = 0x36;
pub(crate) const OP_BRAZERO: u8 = 0x37;
pub(crate) const OP_BRAMINZERO: u8 = 0x38;
pub(crate) const OP_SKIPZERO: u8 = 0x39;

pub(crate) const OP_ASSERT: u8 = 0x3A;
pub(crate) const OP_ASSERT_NOT: u8 = 0x3B;
pub(crate) const OP_ASSERTBACK: u8 = 0x3C;
pub(crate) const OP_ASSERTBACK_NOT: u8 = 0x3D;
pub(crate) const OP_REVERSE: u8 = 0x3E;
pub(crate) const OP_ONCE: u8 = 0x3F;

pub(crate) const OP_COND: u8 = 0x40;
pub(crate) const OP_CREF: u8 = 0x41;
pub(crate) const OP_RREF: u8 = 0x42;
pub(crate) const OP_DEF: u8 = 0x43;

pub(crate) const OP_RECURSE: u8 = 0x44;

pub(crate) const OP_FAIL: u8 = 0x45;
pub(crate) const OP_ACCEPT: u8 = 0x46;
pub(crate) const OP_COMMIT: u8 = 0x47;
pub(crate) const OP_PRUNE: u8 = 0x48;
pub(crate) const OP_SKIP: u8 = 0x49;
pub(crate) const OP_THEN: u8 = 0x4A;

// Variants of BRA/CBRA used for groups that can match the empty string
// and are repeated without an upper bound. Their KETRMAX/KETRMIN apply
// the empty-match loop guard.
pub(crate) const OP_SBRA: u8 = 0x4B;
pub(crate) const OP_SCBRA: u8 = 0x4C;

/// `RREF` operand meaning "any recursion", for the `(?(R)` condition.
pub(crate) const RREF_ANY: u16 = 0xFFFF;

/// XCLASS flag: the class is negated.
pub(crate) const XCL_NOT: u8 = 0x01;
/// XCLASS flag: membership is tested under simple case folding.
pub(crate) const XCL_CASELESS: u8 = 0x02;

/// Decoding context for a particular program: whether characters are
/// UTF-8 encoded and how wide link fields are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CodeFmt {
    pub utf: bool,
    pub link_size: LinkSize,
}

impl CodeFmt {
    #[inline]
    pub fn link_bytes(&self) -> usize {
        self.link_size.bytes()
    }
}

/// Reads a link field.
#[inline]
pub(crate) fn read_link(code: &[u8], at: usize, link_size: LinkSize) -> usize {
    match link_size {
        LinkSize::Two => {
            u16::from_le_bytes([code[at], code[at + 1]]) as usize
        }
        LinkSize::Three => {
            u32::from_le_bytes([code[at], code[at + 1], code[at + 2], 0])
                as usize
        }
        LinkSize::Four => u32::from_le_bytes([
            code[at],
            code[at + 1],
            code[at + 2],
            code[at + 3],
        ]) as usize,
    }
}

/// Writes a link field in place. The value must fit the link width; the
/// compiler guarantees this by enforcing the maximum program size.
#[inline]
pub(crate) fn write_link(
    code: &mut [u8],
    at: usize,
    value: usize,
    link_size: LinkSize,
) {
    let bytes = (value as u32).to_le_bytes();
    code[at..at + link_size.bytes()]
        .copy_from_slice(&bytes[..link_size.bytes()]);
}

#[inline]
pub(crate) fn read_u16(code: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([code[at], code[at + 1]])
}

/// Decodes the character operand at `at`, returning the character and the
/// number of bytes it occupies.
#[inline]
pub(crate) fn read_char_operand(
    code: &[u8],
    at: usize,
    utf: bool,
) -> (char, usize) {
    let b = code[at];
    if !utf || b < 0x80 {
        return (b as char, 1);
    }
    let len = utf8_len(b);
    let mut value = u32::from(b & (0x7F >> len));
    for i in 1..len {
        value = (value << 6) | u32::from(code[at + i] & 0x3F);
    }
    (char::from_u32(value).unwrap_or('\u{FFFD}'), len)
}

/// Length of a UTF-8 sequence given its leading byte.
#[inline]
pub(crate) fn utf8_len(b: u8) -> usize {
    if b < 0x80 {
        1
    } else if b < 0xE0 {
        2
    } else if b < 0xF0 {
        3
    } else {
        4
    }
}

/// An extended character class: explicit codepoint ranges plus property
/// tests, used in UTF mode when the class cannot be represented as a
/// 256-bit bitmap.
///
/// Layout after the opcode: link (total instruction length), one flags
/// byte, one property-count byte, `2 * nprops` property bytes (sense,
/// category), a 16-bit range count and `8 * nranges` bytes of
/// little-endian `(lo, hi)` codepoint pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct XClass<'a> {
    data: &'a [u8],
    link_bytes: usize,
}

impl<'a> XClass<'a> {
    /// `data` starts at the XCLASS opcode.
    pub fn new(data: &'a [u8], link_bytes: usize) -> Self {
        Self { data, link_bytes }
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.data[1 + self.link_bytes]
    }

    fn nprops(&self) -> usize {
        self.data[2 + self.link_bytes] as usize
    }

    fn props(&self) -> &'a [u8] {
        let start = 3 + self.link_bytes;
        &self.data[start..start + 2 * self.nprops()]
    }

    fn ranges(&self) -> impl Iterator<Item = (u32, u32)> + 'a {
        let start = 3 + self.link_bytes + 2 * self.nprops();
        let n = read_u16(self.data, start) as usize;
        let ranges = &self.data[start + 2..start + 2 + 8 * n];
        ranges.chunks_exact(8).map(|c| {
            (
                u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                u32::from_le_bytes([c[4], c[5], c[6], c[7]]),
            )
        })
    }

    fn contains_raw(&self, c: char) -> bool {
        let v = u32::from(c);
        for (lo, hi) in self.ranges() {
            if (lo..=hi).contains(&v) {
                return true;
            }
        }
        for p in self.props().chunks_exact(2) {
            if let Some(cat) = Category::from_code(p[1]) {
                if cat.contains(c) != (p[0] != 0) {
                    continue;
                }
                return true;
            }
        }
        false
    }

    /// Returns true if the class matches the character, honoring the
    /// negation and caseless flags.
    pub fn contains(&self, c: char) -> bool {
        let flags = self.flags();
        let mut found = self.contains_raw(c);
        if !found && flags & XCL_CASELESS != 0 {
            let folded = crate::unicode::fold_char(c);
            if folded != c {
                found = self.contains_raw(folded);
            }
            if !found {
                let mut upper = c.to_uppercase();
                if let (Some(u), None) = (upper.next(), upper.next()) {
                    if u != c {
                        found = self.contains_raw(u);
                    }
                }
            }
        }
        found != (flags & XCL_NOT != 0)
    }
}

/// A decoded instruction. Borrow-only views are used for class data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Instr<'a> {
    End,
    Char(char),
    CharI(char),
    NotChar(char),
    NotCharI(char),
    Any,
    AllAny,
    AnyByte,
    AnyNl,
    HSpace,
    NotHSpace,
    VSpace,
    NotVSpace,
    Digit,
    NotDigit,
    Whitespace,
    NotWhitespace,
    Wordchar,
    NotWordchar,
    Prop(u8),
    NotProp(u8),
    Class(&'a [u8]),
    NClass(&'a [u8]),
    XClass(XClass<'a>),
    Circ,
    CircM,
    Doll,
    DollM,
    Sod,
    Som,
    Eodn,
    Eod,
    WordBoundary,
    NotWordBoundary,
    Star,
    MinStar,
    PosStar,
    Plus,
    MinPlus,
    PosPlus,
    Query,
    MinQuery,
    PosQuery,
    Upto(u16),
    MinUpto(u16),
    PosUpto(u16),
    Exact(u16),
    Ref(u16),
    RefI(u16),
    Bra(usize),
    CBra(usize, u16),
    SBra(usize),
    SCBra(usize, u16),
    Alt(usize),
    Ket(usize),
    KetRMax(usize),
    KetRMin(usize),
    BraZero,
    BraMinZero,
    SkipZero,
    Assert(usize),
    AssertNot(usize),
    AssertBack(usize),
    AssertBackNot(usize),
    Reverse(usize),
    Once(usize),
    Cond(usize),
    CRef(u16),
    RRef(u16),
    Def,
    Recurse(usize),
    Fail,
    Accept,
    Commit,
    Prune,
    Skip,
    Then,
}

/// Decodes the instruction at `at`, returning it along with its total
/// length in bytes.
pub(crate) fn decode(code: &[u8], at: usize, fmt: CodeFmt) -> (Instr, usize) {
    let lb = fmt.link_bytes();
    let op = code[at];
    match op {
        OP_END => (Instr::End, 1),
        OP_CHAR | OP_CHARI | OP_NOT | OP_NOTI => {
            let (c, clen) = read_char_operand(code, at + 1, fmt.utf);
            let instr = match op {
                OP_CHAR => Instr::Char(c),
                OP_CHARI => Instr::CharI(c),
                OP_NOT => Instr::NotChar(c),
                _ => Instr::NotCharI(c),
            };
            (instr, 1 + clen)
        }
        OP_ANY => (Instr::Any, 1),
        OP_ALLANY => (Instr::AllAny, 1),
        OP_ANYBYTE => (Instr::AnyByte, 1),
        OP_ANYNL => (Instr::AnyNl, 1),
        OP_HSPACE => (Instr::HSpace, 1),
        OP_NOT_HSPACE => (Instr::NotHSpace, 1),
        OP_VSPACE => (Instr::VSpace, 1),
        OP_NOT_VSPACE => (Instr::NotVSpace, 1),
        OP_DIGIT => (Instr::Digit, 1),
        OP_NOT_DIGIT => (Instr::NotDigit, 1),
        OP_WHITESPACE => (Instr::Whitespace, 1),
        OP_NOT_WHITESPACE => (Instr::NotWhitespace, 1),
        OP_WORDCHAR => (Instr::Wordchar, 1),
        OP_NOT_WORDCHAR => (Instr::NotWordchar, 1),
        OP_PROP => (Instr::Prop(code[at + 1]), 2),
        OP_NOTPROP => (Instr::NotProp(code[at + 1]), 2),
        OP_CLASS => (Instr::Class(&code[at + 1..at + 33]), 33),
        OP_NCLASS => (Instr::NClass(&code[at + 1..at + 33]), 33),
        OP_XCLASS => {
            let len = read_link(code, at + 1, fmt.link_size);
            (Instr::XClass(XClass::new(&code[at..at + len], lb)), len)
        }
        OP_CIRC => (Instr::Circ, 1),
        OP_CIRCM => (Instr::CircM, 1),
        OP_DOLL => (Instr::Doll, 1),
        OP_DOLLM => (Instr::DollM, 1),
        OP_SOD => (Instr::Sod, 1),
        OP_SOM => (Instr::Som, 1),
        OP_EODN => (Instr::Eodn, 1),
        OP_EOD => (Instr::Eod, 1),
        OP_WORD_BOUNDARY => (Instr::WordBoundary, 1),
        OP_NOT_WORD_BOUNDARY => (Instr::NotWordBoundary, 1),
        OP_STAR => (Instr::Star, 1),
        OP_MINSTAR => (Instr::MinStar, 1),
        OP_POSSTAR => (Instr::PosStar, 1),
        OP_PLUS => (Instr::Plus, 1),
        OP_MINPLUS => (Instr::MinPlus, 1),
        OP_POSPLUS => (Instr::PosPlus, 1),
        OP_QUERY => (Instr::Query, 1),
        OP_MINQUERY => (Instr::MinQuery, 1),
        OP_POSQUERY => (Instr::PosQuery, 1),
        OP_UPTO => (Instr::Upto(read_u16(code, at + 1)), 3),
        OP_MINUPTO => (Instr::MinUpto(read_u16(code, at + 1)), 3),
        OP_POSUPTO => (Instr::PosUpto(read_u16(code, at + 1)), 3),
        OP_EXACT => (Instr::Exact(read_u16(code, at + 1)), 3),
        OP_REF => (Instr::Ref(read_u16(code, at + 1)), 3),
        OP_REFI => (Instr::RefI(read_u16(code, at + 1)), 3),
        OP_BRA => (Instr::Bra(read_link(code, at + 1, fmt.link_size)), 1 + lb),
        OP_SBRA => {
            (Instr::SBra(read_link(code, at + 1, fmt.link_size)), 1 + lb)
        }
        OP_CBRA => (
            Instr::CBra(
                read_link(code, at + 1, fmt.link_size),
                read_u16(code, at + 1 + lb),
            ),
            1 + lb + 2,
        ),
        OP_SCBRA => (
            Instr::SCBra(
                read_link(code, at + 1, fmt.link_size),
                read_u16(code, at + 1 + lb),
            ),
            1 + lb + 2,
        ),
        OP_ALT => (Instr::Alt(read_link(code, at + 1, fmt.link_size)), 1 + lb),
        OP_KET => (Instr::Ket(read_link(code, at + 1, fmt.link_size)), 1 + lb),
        OP_KETRMAX => {
            (Instr::KetRMax(read_link(code, at + 1, fmt.link_size)), 1 + lb)
        }
        OP_KETRMIN => {
            (Instr::KetRMin(read_link(code, at + 1, fmt.link_size)), 1 + lb)
        }
        OP_BRAZERO => (Instr::BraZero, 1),
        OP_BRAMINZERO => (Instr::BraMinZero, 1),
        OP_SKIPZERO => (Instr::SkipZero, 1),
        OP_ASSERT => {
            (Instr::Assert(read_link(code, at + 1, fmt.link_size)), 1 + lb)
        }
        OP_ASSERT_NOT => {
            (Instr::AssertNot(read_link(code, at + 1, fmt.link_size)), 1 + lb)
        }
        OP_ASSERTBACK => {
            (Instr::AssertBack(read_link(code, at + 1, fmt.link_size)), 1 + lb)
        }
        OP_ASSERTBACK_NOT => (
            Instr::AssertBackNot(read_link(code, at + 1, fmt.link_size)),
            1 + lb,
        ),
        OP_REVERSE => {
            (Instr::Reverse(read_link(code, at + 1, fmt.link_size)), 1 + lb)
        }
        OP_ONCE => {
            (Instr::Once(read_link(code, at + 1, fmt.link_size)), 1 + lb)
        }
        OP_COND => {
            (Instr::Cond(read_link(code, at + 1, fmt.link_size)), 1 + lb)
        }
        OP_CREF => (Instr::CRef(read_u16(code, at + 1)), 3),
        OP_RREF => (Instr::RRef(read_u16(code, at + 1)), 3),
        OP_DEF => (Instr::Def, 1),
        OP_RECURSE => {
            (Instr::Recurse(read_link(code, at + 1, fmt.link_size)), 1 + lb)
        }
        OP_FAIL => (Instr::Fail, 1),
        OP_ACCEPT => (Instr::Accept, 1),
        OP_COMMIT => (Instr::Commit, 1),
        OP_PRUNE => (Instr::Prune, 1),
        OP_SKIP => (Instr::Skip, 1),
        OP_THEN => (Instr::Then, 1),
        _ => (Instr::End, 1),
    }
}

/// Length in bytes of the instruction at `at`.
#[inline]
pub(crate) fn instr_len(code: &[u8], at: usize, fmt: CodeFmt) -> usize {
    decode(code, at, fmt).1
}

/// Returns true for opcodes that open a bracket group (anything closed by
/// a `KET`).
#[inline]
pub(crate) fn is_bracket_open(op: u8) -> bool {
    matches!(
        op,
        OP_BRA
            | OP_CBRA
            | OP_SBRA
            | OP_SCBRA
            | OP_ASSERT
            | OP_ASSERT_NOT
            | OP_ASSERTBACK
            | OP_ASSERTBACK_NOT
            | OP_ONCE
            | OP_COND
    )
}

/// Given the offset of a bracket-opening instruction, follows the `ALT`
/// chain and returns the offset of the closing `KET` instruction.
pub(crate) fn bracket_ket(code: &[u8], at: usize, fmt: CodeFmt) -> usize {
    let mut pos = at;
    loop {
        let link = read_link(code, pos + 1, fmt.link_size);
        pos += link;
        if code[pos] != OP_ALT {
            return pos;
        }
    }
}

/// Offsets of the branch bodies of the bracket group at `at`, in order.
pub(crate) fn branch_starts(
    code: &[u8],
    at: usize,
    fmt: CodeFmt,
) -> Vec<usize> {
    let lb = fmt.link_bytes();
    let hdr = match code[at] {
        OP_CBRA | OP_SCBRA => 1 + lb + 2,
        _ => 1 + lb,
    };
    let mut starts = vec![at + hdr];
    let mut pos = at;
    loop {
        let link = read_link(code, pos + 1, fmt.link_size);
        pos += link;
        if code[pos] != OP_ALT {
            return starts;
        }
        starts.push(pos + 1 + lb);
    }
}

/// Checks membership of a byte in a 32-byte class bitmap.
#[inline]
pub(crate) fn class_contains(bitmap: &[u8], byte: u8) -> bool {
    let bits: &BitSlice<u8, Lsb0> = BitSlice::from_slice(bitmap);
    bits[byte as usize]
}

/// A cursor over a code slice that yields `(offset, instruction)` pairs.
/// Used by the study pass, the fixed-length scanner and the byte-flip
/// procedure, all of which walk code without executing it.
pub(crate) struct InstrParser<'a> {
    code: &'a [u8],
    fmt: CodeFmt,
    addr: usize,
}

impl<'a> InstrParser<'a> {
    pub fn new(code: &'a [u8], fmt: CodeFmt) -> Self {
        Self { code, fmt, addr: 0 }
    }
}

impl<'a> Iterator for InstrParser<'a> {
    type Item = (usize, Instr<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.addr >= self.code.len() {
            return None;
        }
        let (instr, size) = decode(self.code, self.addr, self.fmt);
        let addr = self.addr;
        self.addr += size;
        if matches!(instr, Instr::End) {
            self.addr = self.code.len();
        }
        Some((addr, instr))
    }
}

/// Disassembles a program for tests and diagnostics.
pub(crate) struct Disasm<'a> {
    pub code: &'a [u8],
    pub fmt: CodeFmt,
}

impl Display for Disasm<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        for (addr, instr) in InstrParser::new(self.code, self.fmt) {
            match instr {
                Instr::End => writeln!(f, "{:05x}: END", addr)?,
                Instr::Char(c) => {
                    writeln!(f, "{:05x}: CHAR {:?}", addr, c)?
                }
                Instr::CharI(c) => {
                    writeln!(f, "{:05x}: CHARI {:?}", addr, c)?
                }
                Instr::NotChar(c) => {
                    writeln!(f, "{:05x}: NOT {:?}", addr, c)?
                }
                Instr::NotCharI(c) => {
                    writeln!(f, "{:05x}: NOTI {:?}", addr, c)?
                }
                Instr::Any => writeln!(f, "{:05x}: ANY", addr)?,
                Instr::AllAny => writeln!(f, "{:05x}: ALLANY", addr)?,
                Instr::AnyByte => writeln!(f, "{:05x}: ANYBYTE", addr)?,
                Instr::AnyNl => writeln!(f, "{:05x}: ANYNL", addr)?,
                Instr::HSpace => writeln!(f, "{:05x}: HSPACE", addr)?,
                Instr::NotHSpace => writeln!(f, "{:05x}: NOT_HSPACE", addr)?,
                Instr::VSpace => writeln!(f, "{:05x}: VSPACE", addr)?,
                Instr::NotVSpace => writeln!(f, "{:05x}: NOT_VSPACE", addr)?,
                Instr::Digit => writeln!(f, "{:05x}: DIGIT", addr)?,
                Instr::NotDigit => writeln!(f, "{:05x}: NOT_DIGIT", addr)?,
                Instr::Whitespace => writeln!(f, "{:05x}: WHITESPACE", addr)?,
                Instr::NotWhitespace => {
                    writeln!(f, "{:05x}: NOT_WHITESPACE", addr)?
                }
                Instr::Wordchar => writeln!(f, "{:05x}: WORDCHAR", addr)?,
                Instr::NotWordchar => {
                    writeln!(f, "{:05x}: NOT_WORDCHAR", addr)?
                }
                Instr::Prop(p) => writeln!(f, "{:05x}: PROP {}", addr, p)?,
                Instr::NotProp(p) => {
                    writeln!(f, "{:05x}: NOTPROP {}", addr, p)?
                }
                Instr::Class(_) => writeln!(f, "{:05x}: CLASS", addr)?,
                Instr::NClass(_) => writeln!(f, "{:05x}: NCLASS", addr)?,
                Instr::XClass(_) => writeln!(f, "{:05x}: XCLASS", addr)?,
                Instr::Circ => writeln!(f, "{:05x}: CIRC", addr)?,
                Instr::CircM => writeln!(f, "{:05x}: CIRCM", addr)?,
                Instr::Doll => writeln!(f, "{:05x}: DOLL", addr)?,
                Instr::DollM => writeln!(f, "{:05x}: DOLLM", addr)?,
                Instr::Sod => writeln!(f, "{:05x}: SOD", addr)?,
                Instr::Som => writeln!(f, "{:05x}: SOM", addr)?,
                Instr::Eodn => writeln!(f, "{:05x}: EODN", addr)?,
                Instr::Eod => writeln!(f, "{:05x}: EOD", addr)?,
                Instr::WordBoundary => writeln!(f, "{:05x}: WB", addr)?,
                Instr::NotWordBoundary => {
                    writeln!(f, "{:05x}: NOT_WB", addr)?
                }
                Instr::Star => writeln!(f, "{:05x}: STAR", addr)?,
                Instr::MinStar => writeln!(f, "{:05x}: MINSTAR", addr)?,
                Instr::PosStar => writeln!(f, "{:05x}: POSSTAR", addr)?,
                Instr::Plus => writeln!(f, "{:05x}: PLUS", addr)?,
                Instr::MinPlus => writeln!(f, "{:05x}: MINPLUS", addr)?,
                Instr::PosPlus => writeln!(f, "{:05x}: POSPLUS", addr)?,
                Instr::Query => writeln!(f, "{:05x}: QUERY", addr)?,
                Instr::MinQuery => writeln!(f, "{:05x}: MINQUERY", addr)?,
                Instr::PosQuery => writeln!(f, "{:05x}: POSQUERY", addr)?,
                Instr::Upto(n) => writeln!(f, "{:05x}: UPTO {}", addr, n)?,
                Instr::MinUpto(n) => {
                    writeln!(f, "{:05x}: MINUPTO {}", addr, n)?
                }
                Instr::PosUpto(n) => {
                    writeln!(f, "{:05x}: POSUPTO {}", addr, n)?
                }
                Instr::Exact(n) => writeln!(f, "{:05x}: EXACT {}", addr, n)?,
                Instr::Ref(n) => writeln!(f, "{:05x}: REF {}", addr, n)?,
                Instr::RefI(n) => writeln!(f, "{:05x}: REFI {}", addr, n)?,
                Instr::Bra(link) => {
                    writeln!(f, "{:05x}: BRA {:05x}", addr, addr + link)?
                }
                Instr::SBra(link) => {
                    writeln!(f, "{:05x}: SBRA {:05x}", addr, addr + link)?
                }
                Instr::CBra(link, n) => writeln!(
                    f,
                    "{:05x}: CBRA {} {:05x}",
                    addr,
                    n,
                    addr + link
                )?,
                Instr::SCBra(link, n) => writeln!(
                    f,
                    "{:05x}: SCBRA {} {:05x}",
                    addr,
                    n,
                    addr + link
                )?,
                Instr::Alt(link) => {
                    writeln!(f, "{:05x}: ALT {:05x}", addr, addr + link)?
                }
                Instr::Ket(link) => {
                    writeln!(f, "{:05x}: KET {:05x}", addr, addr - link)?
                }
                Instr::KetRMax(link) => {
                    writeln!(f, "{:05x}: KETRMAX {:05x}", addr, addr - link)?
                }
                Instr::KetRMin(link) => {
                    writeln!(f, "{:05x}: KETRMIN {:05x}", addr, addr - link)?
                }
                Instr::BraZero => writeln!(f, "{:05x}: BRAZERO", addr)?,
                Instr::BraMinZero => {
                    writeln!(f, "{:05x}: BRAMINZERO", addr)?
                }
                Instr::SkipZero => writeln!(f, "{:05x}: SKIPZERO", addr)?,
                Instr::Assert(link) => {
                    writeln!(f, "{:05x}: ASSERT {:05x}", addr, addr + link)?
                }
                Instr::AssertNot(link) => writeln!(
                    f,
                    "{:05x}: ASSERT_NOT {:05x}",
                    addr,
                    addr + link
                )?,
                Instr::AssertBack(link) => writeln!(
                    f,
                    "{:05x}: ASSERTBACK {:05x}",
                    addr,
                    addr + link
                )?,
                Instr::AssertBackNot(link) => writeln!(
                    f,
                    "{:05x}: ASSERTBACK_NOT {:05x}",
                    addr,
                    addr + link
                )?,
                Instr::Reverse(n) => {
                    writeln!(f, "{:05x}: REVERSE {}", addr, n)?
                }
                Instr::Once(link) => {
                    writeln!(f, "{:05x}: ONCE {:05x}", addr, addr + link)?
                }
                Instr::Cond(link) => {
                    writeln!(f, "{:05x}: COND {:05x}", addr, addr + link)?
                }
                Instr::CRef(n) => writeln!(f, "{:05x}: CREF {}", addr, n)?,
                Instr::RRef(n) => writeln!(f, "{:05x}: RREF {}", addr, n)?,
                Instr::Def => writeln!(f, "{:05x}: DEF", addr)?,
                Instr::Recurse(target) => {
                    writeln!(f, "{:05x}: RECURSE {:05x}", addr, target)?
                }
                Instr::Fail => writeln!(f, "{:05x}: FAIL", addr)?,
                Instr::Accept => writeln!(f, "{:05x}: ACCEPT", addr)?,
                Instr::Commit => writeln!(f, "{:05x}: COMMIT", addr)?,
                Instr::Prune => writeln!(f, "{:05x}: PRUNE", addr)?,
                Instr::Skip => writeln!(f, "{:05x}: SKIP", addr)?,
                Instr::Then => writeln!(f, "{:05x}: THEN", addr)?,
            }
        }
        Ok(())
    }
}
