/*!
The compiled form of a pattern, and its serialized representation.

A [`Program`] bundles the instruction stream with everything the matcher
needs to run it: the compile-time options, the capturing-group and name
tables, and the hints computed by the study pass (first byte, required
byte, starting-byte bitmap).

Serialized layout
-----------------

`to_bytes` produces a little-endian image with a 36-byte header:

```text
offset  size  field
0       4     magic ("RTRC")
4       4     total image size in bytes
8       4     compile options
12      2     program flags
14      1     link width in bytes (2, 3 or 4)
15      1     reserved, zero
16      2     capturing group count
18      2     highest backreferenced group
20      2     name table entry count
22      2     name table entry stride
24      2     first byte hint
26      2     required byte hint
28      2     maximum lookbehind, in characters
30      2     minimum subject length
32      4     offset of the instruction stream
```

followed by a 32-byte starting-byte bitmap when [`PF_STARTBITS`] is set,
then the name table (fixed-stride entries, each a group number followed by
a NUL-terminated name), then the instruction stream, terminated by the END
opcode.

`from_bytes` also accepts an image whose magic number reads back
byte-reversed, i.e. one produced by an opposite-endian build of this
engine. In that case every multi-byte field is byte-swapped in place
before decoding, including the link and count operands inside the
instruction stream, which can be walked without being interpreted because
every opcode has a length computable from the opcode byte alone.
*/

use bitvec::array::BitArray;
use bitvec::order::Lsb0;
use indexmap::IndexMap;

use crate::errors::{CompileError, CompileErrorKind};
use crate::instr::{
    self, CodeFmt, OP_ALT, OP_ASSERT, OP_ASSERTBACK, OP_ASSERTBACK_NOT,
    OP_ASSERT_NOT, OP_BRA, OP_CBRA, OP_CHAR, OP_CHARI, OP_CLASS, OP_COND,
    OP_CREF, OP_END, OP_EXACT, OP_KET, OP_KETRMAX, OP_KETRMIN, OP_MINUPTO,
    OP_NCLASS, OP_NOT, OP_NOTI, OP_NOTPROP, OP_ONCE, OP_POSUPTO, OP_PROP,
    OP_RECURSE, OP_REF, OP_REFI, OP_REVERSE, OP_RREF, OP_SBRA, OP_SCBRA,
    OP_UPTO, OP_XCLASS,
};
use crate::options::{Bsr, CompileOptions, LinkSize, Newline};

const MAGIC: u32 = u32::from_le_bytes(*b"RTRC");
const HEADER_SIZE: usize = 36;

/// No value stored in a byte-hint header field.
const HINT_NONE: u16 = 0xFFFF;
/// Set in a byte-hint field when the hint matches both letter cases.
const HINT_CASELESS: u16 = 0x0100;

/// The pattern can only match at the starting offset.
pub(crate) const PF_ANCHORED: u16 = 0x0001;
/// An unanchored match can only start at the beginning of a line.
pub(crate) const PF_STARTLINE: u16 = 0x0002;
/// The first-byte hint is valid.
pub(crate) const PF_FIRSTSET: u16 = 0x0004;
/// The required-byte hint is valid.
pub(crate) const PF_REQSET: u16 = 0x0008;
/// A starting-byte bitmap follows the header.
pub(crate) const PF_STARTBITS: u16 = 0x0010;
/// The pattern can match the empty string.
pub(crate) const PF_MATCH_EMPTY: u16 = 0x0020;
/// Partial matching is not supported for this pattern (it contains a
/// backreference, whose match cannot be confirmed viable at the end of a
/// truncated subject).
pub(crate) const PF_NO_PARTIAL: u16 = 0x0040;

const OPT_CASELESS: u32 = 0x0001;
const OPT_MULTILINE: u32 = 0x0002;
const OPT_DOTALL: u32 = 0x0004;
const OPT_EXTENDED: u32 = 0x0008;
const OPT_UNGREEDY: u32 = 0x0010;
const OPT_NO_AUTO_CAPTURE: u32 = 0x0020;
const OPT_DUP_NAMES: u32 = 0x0040;
const OPT_UTF: u32 = 0x0080;
const OPT_NO_UTF_CHECK: u32 = 0x0100;
const OPT_ANCHORED: u32 = 0x0200;
const OPT_FIRSTLINE: u32 = 0x0400;
const OPT_DOLLAR_ENDONLY: u32 = 0x0800;
const OPT_JS_COMPAT: u32 = 0x1000;
const OPT_NEWLINE_SHIFT: u32 = 16;
const OPT_NEWLINE_MASK: u32 = 0x7 << OPT_NEWLINE_SHIFT;
const OPT_BSR_ANYCRLF: u32 = 0x0010_0000;

/// Bitmap of bytes at which an unanchored match can start.
pub(crate) type StartBits = BitArray<[u8; 32], Lsb0>;

/// A compiled pattern, ready to be matched against subjects with
/// [`Program::exec`].
#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) code: Vec<u8>,
    pub(crate) options: CompileOptions,
    pub(crate) flags: u16,
    /// Number of capturing groups, not counting the implicit group 0.
    pub(crate) capture_count: u16,
    /// Highest group number referenced by a backreference or recursion.
    pub(crate) top_backref: u16,
    /// Group names in declaration order. With `dup_names` a name can map
    /// to several group numbers.
    pub(crate) names: IndexMap<String, Vec<u16>>,
    pub(crate) first_byte: Option<(u8, bool)>,
    pub(crate) req_byte: Option<(u8, bool)>,
    pub(crate) start_bits: Option<Box<StartBits>>,
    /// Length in characters of the longest lookbehind assertion.
    pub(crate) max_lookbehind: u16,
    /// Lower bound on the subject length required for any match.
    pub(crate) min_length: u16,
}

impl Program {
    #[inline]
    pub(crate) fn fmt(&self) -> CodeFmt {
        CodeFmt { utf: self.options.utf, link_size: self.options.link_size }
    }

    /// Number of capturing groups in the pattern, not counting the whole
    /// match.
    pub fn capture_count(&self) -> usize {
        self.capture_count as usize
    }

    /// Iterates over the named groups in declaration order. A name maps
    /// to more than one group only when the pattern was compiled with
    /// `dup_names`.
    pub fn group_names(&self) -> impl Iterator<Item = (&str, &[u16])> {
        self.names.iter().map(|(name, groups)| {
            (name.as_str(), groups.as_slice())
        })
    }

    /// The group number for a name. With `dup_names` this is the first
    /// group declared with that name.
    pub fn group_number(&self, name: &str) -> Option<u16> {
        self.names.get(name).and_then(|groups| groups.first().copied())
    }

    /// All group numbers declared with a name, in declaration order.
    pub fn group_numbers(&self, name: &str) -> &[u16] {
        self.names.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Serializes the program into a self-contained byte image that
    /// [`Program::from_bytes`] can reload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let name_stride = self.name_stride();
        let name_count: usize =
            self.names.values().map(|groups| groups.len()).sum();
        let bitmap_len = if self.start_bits.is_some() { 32 } else { 0 };
        let code_offset = HEADER_SIZE + bitmap_len + name_count * name_stride;
        let size = code_offset + self.code.len();

        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&(size as u32).to_le_bytes());
        buf.extend_from_slice(&options_to_bits(&self.options).to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.push(self.options.link_size.bytes() as u8);
        buf.push(0);
        buf.extend_from_slice(&self.capture_count.to_le_bytes());
        buf.extend_from_slice(&self.top_backref.to_le_bytes());
        buf.extend_from_slice(&(name_count as u16).to_le_bytes());
        buf.extend_from_slice(&(name_stride as u16).to_le_bytes());
        buf.extend_from_slice(&hint_to_bits(self.first_byte).to_le_bytes());
        buf.extend_from_slice(&hint_to_bits(self.req_byte).to_le_bytes());
        buf.extend_from_slice(&self.max_lookbehind.to_le_bytes());
        buf.extend_from_slice(&self.min_length.to_le_bytes());
        buf.extend_from_slice(&(code_offset as u32).to_le_bytes());

        if let Some(bits) = &self.start_bits {
            buf.extend_from_slice(bits.as_raw_slice());
        }

        for (name, groups) in &self.names {
            for group in groups {
                let entry_start = buf.len();
                buf.extend_from_slice(&group.to_le_bytes());
                buf.extend_from_slice(name.as_bytes());
                buf.resize(entry_start + name_stride, 0);
            }
        }

        buf.extend_from_slice(&self.code);
        buf
    }

    /// Reloads a program serialized by [`Program::to_bytes`], including
    /// images produced by an opposite-endian build.
    pub fn from_bytes(data: &[u8]) -> Result<Program, CompileError> {
        let bad = || CompileError::new(
            CompileErrorKind::BadSerializedProgram,
            0,
        );

        if data.len() < HEADER_SIZE {
            return Err(bad());
        }

        let mut image = data.to_vec();
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic == MAGIC.swap_bytes() {
            flip_image(&mut image)?;
        } else if magic != MAGIC {
            return Err(bad());
        }
        let data = image.as_slice();

        let size = read_u32(data, 4) as usize;
        if size != data.len() {
            return Err(bad());
        }
        let options_bits = read_u32(data, 8);
        let flags = instr::read_u16(data, 12);
        let link_size = match data[14] {
            2 => LinkSize::Two,
            3 => LinkSize::Three,
            4 => LinkSize::Four,
            _ => return Err(bad()),
        };
        let options = options_from_bits(options_bits, link_size);
        let capture_count = instr::read_u16(data, 16);
        let top_backref = instr::read_u16(data, 18);
        let name_count = instr::read_u16(data, 20) as usize;
        let name_stride = instr::read_u16(data, 22) as usize;
        let first_byte = hint_from_bits(instr::read_u16(data, 24));
        let req_byte = hint_from_bits(instr::read_u16(data, 26));
        let max_lookbehind = instr::read_u16(data, 28);
        let min_length = instr::read_u16(data, 30);
        let code_offset = read_u32(data, 32) as usize;

        let mut pos = HEADER_SIZE;
        let start_bits = if flags & PF_STARTBITS != 0 {
            if data.len() < pos + 32 {
                return Err(bad());
            }
            let mut raw = [0u8; 32];
            raw.copy_from_slice(&data[pos..pos + 32]);
            pos += 32;
            Some(Box::new(StartBits::new(raw)))
        } else {
            None
        };

        if name_count != 0 && name_stride < 3 {
            return Err(bad());
        }
        if data.len() < pos + name_count * name_stride
            || code_offset != pos + name_count * name_stride
            || code_offset > data.len()
        {
            return Err(bad());
        }
        let mut names: IndexMap<String, Vec<u16>> = IndexMap::new();
        for _ in 0..name_count {
            let group = instr::read_u16(data, pos);
            let name_bytes = &data[pos + 2..pos + name_stride];
            let end = name_bytes
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(name_bytes.len());
            let name = std::str::from_utf8(&name_bytes[..end])
                .map_err(|_| bad())?;
            names.entry(name.to_string()).or_default().push(group);
            pos += name_stride;
        }

        let code = data[code_offset..].to_vec();
        if code.last() != Some(&OP_END) {
            return Err(bad());
        }

        Ok(Program {
            code,
            options,
            flags,
            capture_count,
            top_backref,
            names,
            first_byte,
            req_byte,
            start_bits,
            max_lookbehind,
            min_length,
        })
    }

    fn name_stride(&self) -> usize {
        let max_name =
            self.names.keys().map(|name| name.len()).max().unwrap_or(0);
        if max_name == 0 {
            0
        } else {
            // group number + name + NUL terminator
            2 + max_name + 1
        }
    }
}

fn options_to_bits(options: &CompileOptions) -> u32 {
    let mut bits = 0;
    let mut set = |flag: u32, on: bool| {
        if on {
            bits |= flag;
        }
    };
    set(OPT_CASELESS, options.case_insensitive);
    set(OPT_MULTILINE, options.multiline);
    set(OPT_DOTALL, options.dot_all);
    set(OPT_EXTENDED, options.extended);
    set(OPT_UNGREEDY, options.ungreedy);
    set(OPT_NO_AUTO_CAPTURE, options.no_auto_capture);
    set(OPT_DUP_NAMES, options.dup_names);
    set(OPT_UTF, options.utf);
    set(OPT_NO_UTF_CHECK, options.no_utf_check);
    set(OPT_ANCHORED, options.anchored);
    set(OPT_FIRSTLINE, options.firstline);
    set(OPT_DOLLAR_ENDONLY, options.dollar_endonly);
    set(OPT_JS_COMPAT, options.js_compat);
    set(OPT_BSR_ANYCRLF, options.bsr == Bsr::AnyCrLf);
    let newline = match options.newline {
        Newline::Cr => 0,
        Newline::Lf => 1,
        Newline::CrLf => 2,
        Newline::AnyCrLf => 3,
        Newline::Any => 4,
    };
    bits | (newline << OPT_NEWLINE_SHIFT)
}

fn options_from_bits(bits: u32, link_size: LinkSize) -> CompileOptions {
    CompileOptions {
        case_insensitive: bits & OPT_CASELESS != 0,
        multiline: bits & OPT_MULTILINE != 0,
        dot_all: bits & OPT_DOTALL != 0,
        extended: bits & OPT_EXTENDED != 0,
        ungreedy: bits & OPT_UNGREEDY != 0,
        no_auto_capture: bits & OPT_NO_AUTO_CAPTURE != 0,
        dup_names: bits & OPT_DUP_NAMES != 0,
        utf: bits & OPT_UTF != 0,
        no_utf_check: bits & OPT_NO_UTF_CHECK != 0,
        anchored: bits & OPT_ANCHORED != 0,
        firstline: bits & OPT_FIRSTLINE != 0,
        dollar_endonly: bits & OPT_DOLLAR_ENDONLY != 0,
        js_compat: bits & OPT_JS_COMPAT != 0,
        newline: match (bits & OPT_NEWLINE_MASK) >> OPT_NEWLINE_SHIFT {
            0 => Newline::Cr,
            2 => Newline::CrLf,
            3 => Newline::AnyCrLf,
            4 => Newline::Any,
            _ => Newline::Lf,
        },
        bsr: if bits & OPT_BSR_ANYCRLF != 0 {
            Bsr::AnyCrLf
        } else {
            Bsr::Unicode
        },
        link_size,
    }
}

fn hint_to_bits(hint: Option<(u8, bool)>) -> u16 {
    match hint {
        None => HINT_NONE,
        Some((byte, caseless)) => {
            u16::from(byte) | if caseless { HINT_CASELESS } else { 0 }
        }
    }
}

fn hint_from_bits(bits: u16) -> Option<(u8, bool)> {
    if bits == HINT_NONE {
        None
    } else {
        Some((bits as u8, bits & HINT_CASELESS != 0))
    }
}

#[inline]
fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[inline]
fn swap_range(data: &mut [u8], at: usize, len: usize) {
    data[at..at + len].reverse();
}

/// Byte-swaps every multi-byte field of an opposite-endian image in
/// place, turning it into a native little-endian one.
fn flip_image(image: &mut Vec<u8>) -> Result<(), CompileError> {
    let bad =
        || CompileError::new(CompileErrorKind::BadSerializedProgram, 0);

    if image.len() < HEADER_SIZE {
        return Err(bad());
    }
    swap_range(image, 0, 4); // magic
    swap_range(image, 4, 4); // size
    swap_range(image, 8, 4); // options
    swap_range(image, 12, 2); // flags
    for off in (16..32).step_by(2) {
        swap_range(image, off, 2);
    }
    swap_range(image, 32, 4); // code offset

    let flags = instr::read_u16(image, 12);
    let link_size = match image[14] {
        2 => LinkSize::Two,
        3 => LinkSize::Three,
        4 => LinkSize::Four,
        _ => return Err(bad()),
    };
    let name_count = instr::read_u16(image, 20) as usize;
    let name_stride = instr::read_u16(image, 22) as usize;
    let code_offset = read_u32(image, 32) as usize;

    let mut pos = HEADER_SIZE;
    if flags & PF_STARTBITS != 0 {
        // The bitmap is a byte array; nothing to swap.
        pos += 32;
    }
    if name_count != 0 && name_stride < 3 {
        return Err(bad());
    }
    if image.len() < pos + name_count * name_stride
        || code_offset > image.len()
    {
        return Err(bad());
    }
    for _ in 0..name_count {
        swap_range(image, pos, 2);
        pos += name_stride;
    }

    let utf = read_u32(image, 8) & OPT_UTF != 0;
    flip_code(&mut image[code_offset..], utf, link_size)?;
    Ok(())
}

/// Byte-swaps the link and count operands of every instruction in a code
/// stream. Character operands and class bitmaps are byte sequences and
/// are left alone.
fn flip_code(
    code: &mut [u8],
    utf: bool,
    link_size: LinkSize,
) -> Result<(), CompileError> {
    let bad =
        || CompileError::new(CompileErrorKind::BadSerializedProgram, 0);

    let lb = link_size.bytes();
    let mut i = 0;
    while i < code.len() {
        match code[i] {
            OP_END => return Ok(()),
            OP_CHAR | OP_CHARI | OP_NOT | OP_NOTI => {
                if i + 1 >= code.len() {
                    return Err(bad());
                }
                let clen =
                    if utf { instr::utf8_len(code[i + 1]) } else { 1 };
                i += 1 + clen;
            }
            OP_PROP | OP_NOTPROP => i += 2,
            OP_CLASS | OP_NCLASS => i += 33,
            OP_XCLASS => {
                if i + 1 + lb > code.len() {
                    return Err(bad());
                }
                swap_range(code, i + 1, lb);
                let len = instr::read_link(code, i + 1, link_size);
                if len < 3 + lb || i + len > code.len() {
                    return Err(bad());
                }
                // flags and the property entries are single bytes
                let nprops = code[i + 2 + lb] as usize;
                let mut pos = i + 3 + lb + 2 * nprops;
                if pos + 2 > i + len {
                    return Err(bad());
                }
                swap_range(code, pos, 2);
                let nranges = instr::read_u16(code, pos) as usize;
                pos += 2;
                if pos + 8 * nranges > i + len {
                    return Err(bad());
                }
                for _ in 0..nranges {
                    swap_range(code, pos, 4);
                    swap_range(code, pos + 4, 4);
                    pos += 8;
                }
                i += len;
            }
            OP_UPTO | OP_MINUPTO | OP_POSUPTO | OP_EXACT | OP_REF
            | OP_REFI | OP_CREF | OP_RREF => {
                if i + 3 > code.len() {
                    return Err(bad());
                }
                swap_range(code, i + 1, 2);
                i += 3;
            }
            OP_BRA | OP_SBRA | OP_ALT | OP_KET | OP_KETRMAX | OP_KETRMIN
            | OP_ASSERT | OP_ASSERT_NOT | OP_ASSERTBACK
            | OP_ASSERTBACK_NOT | OP_REVERSE | OP_ONCE | OP_COND
            | OP_RECURSE => {
                if i + 1 + lb > code.len() {
                    return Err(bad());
                }
                swap_range(code, i + 1, lb);
                i += 1 + lb;
            }
            OP_CBRA | OP_SCBRA => {
                if i + 1 + lb + 2 > code.len() {
                    return Err(bad());
                }
                swap_range(code, i + 1, lb);
                swap_range(code, i + 1 + lb, 2);
                i += 1 + lb + 2;
            }
            _ => i += 1,
        }
    }
    // ran off the end without seeing END
    Err(bad())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::instr::{OP_BRA, OP_CBRA, OP_CHAR, OP_END, OP_KET};

    fn sample_program() -> Program {
        // BRA CBRA-1 CHAR 'a' KET KET END, with 2-byte links.
        let code = vec![
            OP_BRA, 12, 0, //
            OP_CBRA, 7, 0, 1, 0, //
            OP_CHAR, b'a', //
            OP_KET, 7, 0, //
            OP_KET, 12, 0, //
            OP_END,
        ];
        let mut names = IndexMap::new();
        names.insert("letter".to_string(), vec![1]);
        Program {
            code,
            options: CompileOptions::default(),
            flags: PF_FIRSTSET,
            capture_count: 1,
            top_backref: 0,
            names,
            first_byte: Some((b'a', false)),
            req_byte: None,
            start_bits: None,
            max_lookbehind: 0,
            min_length: 1,
        }
    }

    #[test]
    fn roundtrip() {
        let program = sample_program();
        let image = program.to_bytes();
        let reloaded = Program::from_bytes(&image).unwrap();
        assert_eq!(program.code, reloaded.code);
        assert_eq!(program.flags, reloaded.flags);
        assert_eq!(program.capture_count, reloaded.capture_count);
        assert_eq!(program.first_byte, reloaded.first_byte);
        assert_eq!(program.min_length, reloaded.min_length);
        assert_eq!(reloaded.group_number("letter"), Some(1));
    }

    #[test]
    fn reloads_byte_swapped_image() {
        let program = sample_program();
        let mut image = program.to_bytes();
        // Produce the image an opposite-endian build would have written.
        swap_range(&mut image, 0, 4);
        swap_range(&mut image, 4, 4);
        swap_range(&mut image, 8, 4);
        swap_range(&mut image, 12, 2);
        for off in (16..32).step_by(2) {
            swap_range(&mut image, off, 2);
        }
        swap_range(&mut image, 32, 4);
        let code_offset = {
            let mut tmp = [0u8; 4];
            tmp.copy_from_slice(&image[32..36]);
            u32::from_be_bytes(tmp) as usize
        };
        // name table entry
        swap_range(&mut image, HEADER_SIZE, 2);
        // BRA, CBRA and KET links plus the CBRA group number
        let code = &mut image[code_offset..];
        swap_range(code, 1, 2);
        swap_range(code, 4, 2);
        swap_range(code, 6, 2);
        swap_range(code, 11, 2);
        swap_range(code, 14, 2);

        let reloaded = Program::from_bytes(&image).unwrap();
        assert_eq!(reloaded.code, sample_program().code);
        assert_eq!(reloaded.group_number("letter"), Some(1));
    }

    #[test]
    fn rejects_truncated_image() {
        let image = sample_program().to_bytes();
        assert_eq!(
            Program::from_bytes(&image[..image.len() - 1])
                .unwrap_err()
                .kind,
            CompileErrorKind::BadSerializedProgram,
        );
        assert_eq!(
            Program::from_bytes(&[0u8; 8]).unwrap_err().kind,
            CompileErrorKind::BadSerializedProgram,
        );
    }
}
