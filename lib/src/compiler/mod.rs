/*!
Compiles pattern text into a [`Program`].

Compilation makes two passes over the pattern, both through the same
recursive-descent parser in [`parser`]:

- Pass 1 (sizing) parses the whole pattern with a code sink that only
  accumulates lengths. It produces the exact size of the instruction
  stream, the capturing-group count and the complete name table, and
  detects most syntax errors. No generated code is retained.
- Pass 2 re-parses the identical text, emitting into a buffer
  pre-allocated from pass 1's total. References to groups that are
  defined later in the pattern (forward backreferences, forward
  subroutine calls) are recorded as an explicit list of patch sites and
  resolved here once every group's final position is known.

After pass 2 the driver computes the match-time metadata: whether the
pattern is anchored, the first-byte and required-byte hints, the
starting-byte bitmap (behind the `study` feature) and the minimum
subject length. The analysis walkers live in [`study`].
*/

use log::{debug, trace};

use crate::errors::{CompileError, CompileErrorKind};
use crate::instr::OP_END;
use crate::options::CompileOptions;
use crate::program::{
    Program, PF_ANCHORED, PF_FIRSTSET, PF_MATCH_EMPTY, PF_NO_PARTIAL,
    PF_REQSET, PF_STARTBITS, PF_STARTLINE,
};

mod parser;
mod study;

#[cfg(test)]
mod tests;

pub(crate) use emitter::Frag;

/// Upper bound on the number of pending forward-reference patch sites.
const MAX_PATCH_SITES: usize = 10_000;

pub(crate) fn compile(
    pattern: &[u8],
    options: &CompileOptions,
) -> Result<Program, CompileError> {
    if options.utf && !options.no_utf_check {
        if let Err(err) = std::str::from_utf8(pattern) {
            return Err(CompileError::new(
                CompileErrorKind::BadUtf8,
                err.valid_up_to(),
            ));
        }
    }

    trace!("compile pass 1 (sizing), pattern length {}", pattern.len());
    let pass1 = parser::parse(pattern, options, true, None)?;

    // All group numbers and names are known after pass 1; validate every
    // reference before spending time on the real compile.
    for (group, offset) in &pass1.refs {
        if *group > pass1.group_count {
            return Err(CompileError::new(
                CompileErrorKind::BadReference,
                *offset,
            ));
        }
    }
    for (name, offset) in &pass1.named_refs {
        if !pass1.names.contains_key(name) {
            return Err(CompileError::new(
                CompileErrorKind::BadReference,
                *offset,
            ));
        }
    }

    let size = pass1.frag.pos() + 1; // plus the END terminator
    if size > options.link_size.max_value() {
        return Err(CompileError::new(
            CompileErrorKind::PatternTooLarge,
            pattern.len(),
        ));
    }

    trace!("compile pass 2 (emit), code size {}", size);
    let info = parser::Pass1Info {
        group_count: pass1.group_count,
        names: pass1.names,
    };
    let result = parser::parse(pattern, options, false, Some(&info))?;

    let frag = result.frag;
    if frag.recurses.len() > MAX_PATCH_SITES {
        return Err(CompileError::new(
            CompileErrorKind::WorkspaceOverflow,
            pattern.len(),
        ));
    }

    // Group start offsets, for resolving subroutine-call patch sites.
    // Group 0 is the implicit outermost bracket at offset zero. When a
    // group was replicated by a bounded repeat, the first copy is the
    // call target.
    let mut group_starts: Vec<Option<usize>> =
        vec![None; info.group_count as usize + 1];
    group_starts[0] = Some(0);
    for (at, group) in &frag.cbras {
        let slot = &mut group_starts[*group as usize];
        if slot.is_none() {
            *slot = Some(*at);
        }
    }

    let mut code = frag.code;
    code.push(OP_END);
    debug_assert_eq!(code.len(), size);

    let fmt = crate::instr::CodeFmt {
        utf: options.utf,
        link_size: options.link_size,
    };
    for site in &frag.recurses {
        match group_starts[site.group as usize] {
            Some(target) => {
                crate::instr::write_link(
                    &mut code,
                    site.patch_at,
                    target,
                    options.link_size,
                );
            }
            // Pass 1 validated every referenced group.
            None => {
                return Err(CompileError::new(
                    CompileErrorKind::Internal,
                    site.pattern_offset,
                ));
            }
        }
    }

    let anchored = options.anchored || study::is_anchored(&code, fmt);
    let startline = !anchored && study::starts_line(&code, fmt);
    let first_byte = if anchored || startline {
        None
    } else {
        study::first_byte(&code, fmt)
    };
    let req_byte = study::req_byte(&code, fmt);

    #[cfg(feature = "study")]
    let start_bits = if !anchored && !startline && first_byte.is_none() {
        study::start_bits(&code, fmt)
    } else {
        None
    };
    #[cfg(not(feature = "study"))]
    let start_bits: Option<Box<crate::program::StartBits>> = None;

    let mut flags = 0u16;
    if anchored {
        flags |= PF_ANCHORED;
    }
    if startline {
        flags |= PF_STARTLINE;
    }
    if first_byte.is_some() {
        flags |= PF_FIRSTSET;
    }
    if req_byte.is_some() {
        flags |= PF_REQSET;
    }
    if start_bits.is_some() {
        flags |= PF_STARTBITS;
    }
    if result.min_len == 0 {
        flags |= PF_MATCH_EMPTY;
    }
    if result.has_backref {
        flags |= PF_NO_PARTIAL;
    }

    debug!(
        "compiled: {} bytes, {} groups, anchored={}, first_byte={:?}, \
         req_byte={:?}, min_len={}",
        code.len(),
        info.group_count,
        anchored,
        first_byte,
        req_byte,
        result.min_len,
    );

    Ok(Program {
        code,
        options: options.clone(),
        flags,
        capture_count: info.group_count,
        top_backref: result.top_backref,
        names: info.names,
        first_byte,
        req_byte,
        start_bits,
        max_lookbehind: result.max_lookbehind.min(u16::MAX as usize) as u16,
        min_length: result.min_len.min(u16::MAX as usize) as u16,
    })
}

mod emitter {
    //! The code sink shared by both compile passes. In sizing mode only
    //! the length accumulates; in emit mode bytes are written and patch
    //! sites can be filled in later.

    use crate::instr::{write_link, CodeFmt};

    /// A subroutine-call operand awaiting its target group's final
    /// offset.
    #[derive(Debug, Clone)]
    pub(crate) struct RecurseSite {
        /// Offset of the link operand to patch.
        pub patch_at: usize,
        /// The called group. Zero is the whole pattern.
        pub group: u16,
        /// Where the call appears in the pattern, for diagnostics.
        pub pattern_offset: usize,
    }

    /// A fragment of compiled code. Branches and groups are compiled
    /// into fragments bottom-up; a quantifier then decides how to lay
    /// the item's fragment out in its parent (once, replicated, or
    /// wrapped in zero-width skip markers) before the parent absorbs it.
    #[derive(Debug, Clone)]
    pub(crate) struct Frag {
        fmt: CodeFmt,
        sizing: bool,
        len: usize,
        pub(crate) code: Vec<u8>,
        /// Offsets of CBRA/SCBRA instructions, with their group number.
        pub(crate) cbras: Vec<(usize, u16)>,
        pub(crate) recurses: Vec<RecurseSite>,
    }

    impl Frag {
        pub fn new(fmt: CodeFmt, sizing: bool) -> Self {
            Self {
                fmt,
                sizing,
                len: 0,
                code: Vec::new(),
                cbras: Vec::new(),
                recurses: Vec::new(),
            }
        }

        /// Current length, which is also the offset of the next
        /// instruction.
        #[inline]
        pub fn pos(&self) -> usize {
            self.len
        }

        #[inline]
        pub fn sizing(&self) -> bool {
            self.sizing
        }

        pub fn op(&mut self, opcode: u8) {
            if !self.sizing {
                self.code.push(opcode);
            }
            self.len += 1;
        }

        pub fn bytes(&mut self, bytes: &[u8]) {
            if !self.sizing {
                self.code.extend_from_slice(bytes);
            }
            self.len += bytes.len();
        }

        pub fn u16(&mut self, value: u16) {
            self.bytes(&value.to_le_bytes());
        }

        pub fn link(&mut self, value: usize) {
            let bytes = (value as u32).to_le_bytes();
            self.bytes(&bytes[..self.fmt.link_bytes()]);
        }

        /// Emits a zero link and returns its offset for later patching.
        pub fn link_placeholder(&mut self) -> usize {
            let at = self.len;
            self.link(0);
            at
        }

        pub fn patch_link(&mut self, at: usize, value: usize) {
            if !self.sizing {
                write_link(&mut self.code, at, value, self.fmt.link_size);
            }
        }

        pub fn set_op(&mut self, at: usize, opcode: u8) {
            if !self.sizing {
                self.code[at] = opcode;
            }
        }

        /// Emits a character operand: UTF-8 encoded in UTF mode, a
        /// single byte otherwise.
        pub fn chr(&mut self, c: char) {
            if self.fmt.utf {
                let mut buf = [0u8; 4];
                let encoded = c.encode_utf8(&mut buf);
                self.bytes(encoded.as_bytes());
            } else {
                self.bytes(&[c as u8]);
            }
        }

        pub fn mark_cbra(&mut self, at: usize, group: u16) {
            self.cbras.push((at, group));
        }

        pub fn add_recurse(
            &mut self,
            patch_at: usize,
            group: u16,
            pattern_offset: usize,
        ) {
            self.recurses.push(RecurseSite {
                patch_at,
                group,
                pattern_offset,
            });
        }

        /// Appends another fragment, relocating its patch-site metadata.
        pub fn append(&mut self, other: Frag) {
            let base = self.len;
            if !self.sizing {
                self.code.extend_from_slice(&other.code);
            }
            self.len += other.len;
            self.cbras.extend(
                other.cbras.iter().map(|(at, group)| (at + base, *group)),
            );
            self.recurses.extend(other.recurses.iter().map(|site| {
                RecurseSite {
                    patch_at: site.patch_at + base,
                    ..site.clone()
                }
            }));
        }

        /// Appends a copy of another fragment, for bounded group
        /// replication. The copy's patch-site metadata is duplicated at
        /// the displaced offsets.
        pub fn append_clone(&mut self, other: &Frag) {
            self.append(other.clone());
        }
    }
}
