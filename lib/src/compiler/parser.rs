/*!
The recursive-descent parser shared by both compile passes.

The parser walks the pattern text once per pass, building code fragments
bottom-up: every quantifiable item (a literal, a class, a whole group) is
compiled into its own [`Frag`]; a following quantifier then decides how
the item's fragment is laid out in the parent fragment (emitted once,
preceded by a repeat opcode, replicated, or wrapped in BRAZERO/ONCE
markers). In sizing mode fragments carry no bytes and only lengths
accumulate, so both passes run exactly the same logic.
*/

use bitvec::array::BitArray;
use bitvec::order::Lsb0;
use indexmap::IndexMap;

use super::study;
use super::Frag;
use crate::errors::{CompileError, CompileErrorKind};
use crate::instr::*;
use crate::options::CompileOptions;
use crate::tables;
use crate::unicode::Category;

/// Longest accepted group name, as in the reference implementation.
const MAX_NAME_LEN: usize = 32;

/// Largest value accepted in a `{m,n}` quantifier bound.
const MAX_REPEAT: u32 = 65535;

type Bits = BitArray<[u8; 32], Lsb0>;

/// What pass 1 learned, made available to pass 2.
pub(super) struct Pass1Info {
    pub group_count: u16,
    pub names: IndexMap<String, Vec<u16>>,
}

pub(super) struct ParseResult {
    pub frag: Frag,
    pub group_count: u16,
    pub names: IndexMap<String, Vec<u16>>,
    /// Numeric group references to validate once the total group count
    /// is known: (group, pattern offset).
    pub refs: Vec<(u16, usize)>,
    /// Name references to validate against the complete name table.
    pub named_refs: Vec<(String, usize)>,
    pub top_backref: u16,
    pub has_backref: bool,
    pub max_lookbehind: usize,
    pub min_len: usize,
}

pub(super) fn parse(
    pattern: &[u8],
    options: &CompileOptions,
    sizing: bool,
    pass1: Option<&Pass1Info>,
) -> Result<ParseResult, CompileError> {
    let mut parser = Parser {
        pattern,
        pos: 0,
        options,
        fmt: CodeFmt { utf: options.utf, link_size: options.link_size },
        sizing,
        pass1,
        group_count: 0,
        names: IndexMap::new(),
        refs: Vec::new(),
        named_refs: Vec::new(),
        top_backref: 0,
        has_backref: false,
        max_lookbehind: 0,
        open: vec![OpenGroup { number: Some(0), accum: 0 }],
        opts: OptState {
            caseless: options.case_insensitive,
            multiline: options.multiline,
            dotall: options.dot_all,
            extended: options.extended,
            ungreedy: options.ungreedy,
            dup_names: options.dup_names,
        },
        quoted: false,
    };

    let group = parser.parse_alternation(GroupParams {
        open_op: OP_BRA,
        capturing: None,
        cond: None,
        behind: false,
        branch_limit: None,
        top: true,
    })?;

    if !parser.at_end() {
        return Err(parser.err(CompileErrorKind::UnmatchedClosingParen));
    }

    Ok(ParseResult {
        frag: group.frag,
        group_count: parser.group_count,
        names: parser.names,
        refs: parser.refs,
        named_refs: parser.named_refs,
        top_backref: parser.top_backref,
        has_backref: parser.has_backref,
        max_lookbehind: parser.max_lookbehind,
        min_len: group.min,
    })
}

/// Inline-modifiable option state. `(?i)` and friends mutate this; the
/// change is scoped to the enclosing group.
#[derive(Debug, Clone, Copy)]
struct OptState {
    caseless: bool,
    multiline: bool,
    dotall: bool,
    extended: bool,
    ungreedy: bool,
    dup_names: bool,
}

/// One entry per currently-open group, tracking the minimum number of
/// characters consumed so far in the group's current branch. Used for
/// the static left-recursion check.
struct OpenGroup {
    /// The capturing group number; `Some(0)` for the whole pattern,
    /// `None` for non-capturing brackets.
    number: Option<u16>,
    accum: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Greed {
    Greedy,
    Lazy,
    Possessive,
}

#[derive(Debug, Clone, Copy)]
struct Quant {
    min: u32,
    /// `None` means unbounded.
    max: Option<u32>,
    greed: Greed,
}

/// A compiled group, with the positions a quantifier needs to rewrite.
struct GroupFrag {
    frag: Frag,
    /// Offset of the closing KET opcode.
    ket_at: usize,
    min: usize,
}

struct GroupParams {
    open_op: u8,
    capturing: Option<u16>,
    /// Condition payload emitted between the bracket header and the
    /// first branch (CREF/RREF/DEF or a compiled assertion).
    cond: Option<Frag>,
    behind: bool,
    /// Maximum number of branches; 2 for conditionals, 1 for DEFINE.
    branch_limit: Option<u8>,
    top: bool,
}

/// A single quantifiable item, compiled but not yet placed.
enum Item {
    /// One consuming instruction; a repeat opcode can govern it
    /// directly. `min` is 1, or 0 for backreferences.
    Single { frag: Frag, desc: SingleDesc, min: usize },
    Group(GroupFrag),
    /// A subroutine call; quantification wraps it in a plain bracket.
    Recurse(Frag),
    /// Anchors and boundaries.
    ZeroWidth(Frag),
    /// A complete lookaround bracket.
    Assertion(Frag),
    /// Verbs, comments, inline option settings.
    NotQuantifiable(Frag),
}

impl Item {
    fn quantifiable(&self) -> bool {
        !matches!(self, Item::NotQuantifiable(_))
    }
}

/// Description of a single-instruction item, for the auto-possessify
/// disjointness test.
enum SingleDesc {
    Char(char, bool),
    NotChar(char, bool),
    Type(u8),
    /// Final byte-membership bitmap of a bitmap class.
    Class(Option<Box<Bits>>),
    Other,
}

enum Esc {
    Char(char),
    Type(u8),
    Prop { negated: bool, category: Category },
    Anchor(u8),
    Backref(u16),
    NamedRef(String),
    Recurse(RecTarget),
    Bsr,
    AnyByte,
    Nothing,
}

enum RecTarget {
    Number(u16),
    Name(String),
}

struct Parser<'a> {
    pattern: &'a [u8],
    pos: usize,
    options: &'a CompileOptions,
    fmt: CodeFmt,
    sizing: bool,
    pass1: Option<&'a Pass1Info>,
    group_count: u16,
    names: IndexMap<String, Vec<u16>>,
    refs: Vec<(u16, usize)>,
    named_refs: Vec<(String, usize)>,
    top_backref: u16,
    has_backref: bool,
    max_lookbehind: usize,
    open: Vec<OpenGroup>,
    opts: OptState,
    quoted: bool,
}

impl<'a> Parser<'a> {
    fn new_frag(&self) -> Frag {
        Frag::new(self.fmt, self.sizing)
    }

    fn err(&self, kind: CompileErrorKind) -> CompileError {
        CompileError::new(kind, self.pos)
    }

    fn err_at(&self, kind: CompileErrorKind, at: usize) -> CompileError {
        CompileError::new(kind, at)
    }

    #[inline]
    fn at_end(&self) -> bool {
        self.pos >= self.pattern.len()
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.pattern.get(self.pos).copied()
    }

    #[inline]
    fn peek_at(&self, n: usize) -> Option<u8> {
        self.pattern.get(self.pos + n).copied()
    }

    #[inline]
    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    /// Reads the next pattern character: one byte, or one decoded UTF-8
    /// character in UTF mode.
    fn next_char(&mut self) -> Result<char, CompileError> {
        match self.peek() {
            None => Err(self.err(CompileErrorKind::Internal)),
            Some(b) if !self.fmt.utf || b < 0x80 => {
                self.pos += 1;
                Ok(b as char)
            }
            Some(b) => {
                let len = utf8_len(b);
                let end = (self.pos + len).min(self.pattern.len());
                let (c, read) =
                    read_char_operand(self.pattern, self.pos, true);
                if self.pos + read > end {
                    return Err(self.err(CompileErrorKind::BadUtf8));
                }
                self.pos += read;
                Ok(c)
            }
        }
    }

    /// Free-spacing mode: skips whitespace and `#` comments.
    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C' => {
                    self.pos += 1;
                }
                b'#' => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn lookup_name(&self, name: &str) -> Option<u16> {
        let table = match self.pass1 {
            Some(info) => &info.names,
            None => &self.names,
        };
        table.get(name).and_then(|groups| groups.first().copied())
    }

    fn new_group_number(&mut self) -> Result<u16, CompileError> {
        if self.group_count == u16::MAX {
            return Err(self.err(CompileErrorKind::TooManyGroups));
        }
        self.group_count += 1;
        Ok(self.group_count)
    }

    fn register_name(
        &mut self,
        name: &str,
        number: u16,
        at: usize,
    ) -> Result<(), CompileError> {
        // The table was fully built by pass 1.
        if self.pass1.is_some() {
            return Ok(());
        }
        if let Some(groups) = self.names.get(name) {
            if !self.opts.dup_names && !groups.is_empty() {
                return Err(self.err_at(
                    CompileErrorKind::DuplicateGroupName,
                    at,
                ));
            }
        }
        self.names.entry(name.to_string()).or_default().push(number);
        Ok(())
    }

    // ----- groups and branches ---------------------------------------

    fn parse_alternation(
        &mut self,
        params: GroupParams,
    ) -> Result<GroupFrag, CompileError> {
        let mut frag = self.new_frag();
        frag.op(params.open_op);
        frag.link_placeholder();
        if let Some(n) = params.capturing {
            frag.u16(n);
            frag.mark_cbra(0, n);
        }
        if let Some(cond) = params.cond {
            frag.append(cond);
        }

        // The start of the instruction owning the pending branch link
        // (the bracket itself, then each ALT in turn). Its link field is
        // at offset +1 and is patched as soon as the next ALT or the KET
        // position is known.
        let mut last_marker = 0usize;
        let mut branch_mins: Vec<usize> = Vec::new();

        loop {
            if let Some(g) = self.open.last_mut() {
                g.accum = 0;
            }

            let rev_at = if params.behind {
                frag.op(OP_REVERSE);
                Some(frag.link_placeholder())
            } else {
                None
            };

            let branch_at = self.pos;
            let (bfrag, bmin) = self.parse_branch()?;

            if let Some(rev_at) = rev_at {
                if !self.sizing {
                    let chars = study::fixed_length(&bfrag.code, self.fmt)
                        .ok_or_else(|| {
                            self.err_at(
                                CompileErrorKind::VariableLengthLookbehind,
                                branch_at,
                            )
                        })?;
                    frag.patch_link(rev_at, chars);
                    self.max_lookbehind = self.max_lookbehind.max(chars);
                }
            }
            frag.append(bfrag);
            branch_mins.push(bmin);

            match self.peek() {
                Some(b'|') => {
                    if let Some(limit) = params.branch_limit {
                        if branch_mins.len() >= limit as usize {
                            let kind = if limit == 1 {
                                CompileErrorKind::BadCondition
                            } else {
                                CompileErrorKind::TooManyConditionBranches
                            };
                            return Err(self.err(kind));
                        }
                    }
                    self.pos += 1;
                    let alt_at = frag.pos();
                    frag.patch_link(last_marker + 1, alt_at - last_marker);
                    frag.op(OP_ALT);
                    frag.link_placeholder();
                    last_marker = alt_at;
                }
                Some(b')') if !params.top => {
                    self.pos += 1;
                    break;
                }
                Some(b')') => break, // the caller reports the error
                None if params.top => break,
                None => {
                    return Err(
                        self.err(CompileErrorKind::MissingClosingParen)
                    );
                }
                Some(_) => {
                    return Err(self.err(CompileErrorKind::Internal));
                }
            }
        }

        let ket_at = frag.pos();
        frag.patch_link(last_marker + 1, ket_at - last_marker);
        frag.op(OP_KET);
        frag.link(ket_at);

        // A conditional with a single branch can always take the empty
        // "condition false" path; DEFINE bodies are never executed.
        let min = if params.open_op == OP_COND && branch_mins.len() < 2 {
            0
        } else {
            branch_mins.into_iter().min().unwrap_or(0)
        };

        Ok(GroupFrag { frag, ket_at, min })
    }

    fn parse_branch(&mut self) -> Result<(Frag, usize), CompileError> {
        let mut frag = self.new_frag();
        let mut min = 0usize;
        let mut pending: Option<Item> = None;

        loop {
            if self.quoted {
                if self.at_end() {
                    break;
                }
                if self.peek() == Some(b'\\') && self.peek_at(1) == Some(b'E')
                {
                    self.pos += 2;
                    self.quoted = false;
                    continue;
                }
                if let Some(item) = pending.take() {
                    self.flush(&mut frag, &mut min, item);
                }
                let c = self.next_char()?;
                pending = Some(self.literal_item(c));
                continue;
            }

            if self.opts.extended {
                self.skip_ws();
            }

            let Some(b) = self.peek() else { break };
            if b == b'|' || b == b')' {
                break;
            }

            // \Q enters quoted mode and \E outside a quote is ignored;
            // neither is an item, so the pending one stays quantifiable.
            if b == b'\\' {
                match self.peek_at(1) {
                    Some(b'Q') => {
                        self.pos += 2;
                        self.quoted = true;
                        continue;
                    }
                    Some(b'E') => {
                        self.pos += 2;
                        continue;
                    }
                    _ => {}
                }
            }

            if matches!(b, b'*' | b'+' | b'?' | b'{') {
                let quant_at = self.pos;
                if let Some(quant) = self.try_quantifier()? {
                    let Some(item) = pending.take() else {
                        return Err(self.err_at(
                            CompileErrorKind::NothingToRepeat,
                            quant_at,
                        ));
                    };
                    if !item.quantifiable() {
                        return Err(self.err_at(
                            CompileErrorKind::NothingToRepeat,
                            quant_at,
                        ));
                    }
                    self.emit_repeat(&mut frag, &mut min, item, quant)?;
                    continue;
                }
                // a '{' that does not open a well-formed bound is a
                // literal
            }

            if let Some(item) = pending.take() {
                self.flush(&mut frag, &mut min, item);
            }
            pending = Some(self.parse_item()?);
        }

        if let Some(item) = pending.take() {
            self.flush(&mut frag, &mut min, item);
        }
        Ok((frag, min))
    }

    fn flush(&mut self, frag: &mut Frag, min: &mut usize, item: Item) {
        let contribution = match &item {
            Item::Single { min, .. } => *min,
            Item::Group(g) => g.min,
            _ => 0,
        };
        match item {
            Item::Single { frag: f, .. }
            | Item::Recurse(f)
            | Item::ZeroWidth(f)
            | Item::Assertion(f)
            | Item::NotQuantifiable(f) => frag.append(f),
            Item::Group(g) => frag.append(g.frag),
        }
        *min += contribution;
        if let Some(g) = self.open.last_mut() {
            g.accum += contribution;
        }
    }

    // ----- items ------------------------------------------------------

    fn literal_item(&self, c: char) -> Item {
        let mut frag = self.new_frag();
        frag.op(if self.opts.caseless { OP_CHARI } else { OP_CHAR });
        frag.chr(c);
        Item::Single {
            frag,
            desc: SingleDesc::Char(c, self.opts.caseless),
            min: 1,
        }
    }

    fn type_item(&self, op: u8) -> Item {
        let mut frag = self.new_frag();
        frag.op(op);
        Item::Single { frag, desc: SingleDesc::Type(op), min: 1 }
    }

    fn zero_width(&self, op: u8) -> Item {
        let mut frag = self.new_frag();
        frag.op(op);
        Item::ZeroWidth(frag)
    }

    fn backref_item(&mut self, group: u16, at: usize) -> Item {
        let mut frag = self.new_frag();
        frag.op(if self.opts.caseless { OP_REFI } else { OP_REF });
        frag.u16(group);
        self.refs.push((group, at));
        self.has_backref = true;
        self.top_backref = self.top_backref.max(group);
        Item::Single { frag, desc: SingleDesc::Other, min: 0 }
    }

    fn parse_item(&mut self) -> Result<Item, CompileError> {
        let b = self.peek().ok_or_else(|| {
            self.err(CompileErrorKind::Internal)
        })?;
        match b {
            b'.' => {
                self.pos += 1;
                Ok(self.type_item(if self.opts.dotall {
                    OP_ALLANY
                } else {
                    OP_ANY
                }))
            }
            b'[' => {
                self.pos += 1;
                let class = self.scan_class()?;
                Ok(self.class_item(class))
            }
            b'(' => {
                self.pos += 1;
                self.parse_paren()
            }
            b'^' => {
                self.pos += 1;
                Ok(self.zero_width(if self.opts.multiline {
                    OP_CIRCM
                } else {
                    OP_CIRC
                }))
            }
            b'$' => {
                self.pos += 1;
                Ok(self.zero_width(if self.opts.multiline {
                    OP_DOLLM
                } else if self.options.dollar_endonly {
                    OP_EOD
                } else {
                    OP_DOLL
                }))
            }
            b'\\' => {
                let at = self.pos;
                self.pos += 1;
                let esc = self.parse_escape(false)?;
                self.escape_item(esc, at)
            }
            _ => {
                let c = self.next_char()?;
                Ok(self.literal_item(c))
            }
        }
    }

    fn escape_item(
        &mut self,
        esc: Esc,
        at: usize,
    ) -> Result<Item, CompileError> {
        Ok(match esc {
            Esc::Char(c) => self.literal_item(c),
            Esc::Type(op) => self.type_item(op),
            Esc::Prop { negated, category } => {
                let mut frag = self.new_frag();
                frag.op(if negated { OP_NOTPROP } else { OP_PROP });
                frag.bytes(&[category as u8]);
                Item::Single { frag, desc: SingleDesc::Other, min: 1 }
            }
            Esc::Anchor(op) => self.zero_width(op),
            Esc::Backref(n) => self.backref_item(n, at),
            Esc::NamedRef(name) => {
                self.named_refs.push((name.clone(), at));
                match self.lookup_name(&name) {
                    Some(n) => self.backref_item(n, at),
                    // Unknown in pass 1: a forward reference, validated
                    // later. In pass 2 the table is complete.
                    None if self.pass1.is_none() => {
                        let mut frag = self.new_frag();
                        frag.op(if self.opts.caseless {
                            OP_REFI
                        } else {
                            OP_REF
                        });
                        frag.u16(0);
                        self.has_backref = true;
                        Item::Single {
                            frag,
                            desc: SingleDesc::Other,
                            min: 0,
                        }
                    }
                    None => {
                        return Err(self.err_at(
                            CompileErrorKind::BadReference,
                            at,
                        ));
                    }
                }
            }
            Esc::Recurse(target) => self.recurse_item(target, at)?,
            Esc::Bsr => {
                let mut frag = self.new_frag();
                frag.op(OP_ANYNL);
                Item::Single { frag, desc: SingleDesc::Other, min: 1 }
            }
            Esc::AnyByte => {
                let mut frag = self.new_frag();
                frag.op(OP_ANYBYTE);
                Item::Single { frag, desc: SingleDesc::Other, min: 1 }
            }
            Esc::Nothing => Item::NotQuantifiable(self.new_frag()),
        })
    }

    fn recurse_item(
        &mut self,
        target: RecTarget,
        at: usize,
    ) -> Result<Item, CompileError> {
        let group = match target {
            RecTarget::Number(n) => {
                if n > 0 {
                    self.refs.push((n, at));
                }
                Some(n)
            }
            RecTarget::Name(name) => {
                self.named_refs.push((name.clone(), at));
                match self.lookup_name(&name) {
                    Some(n) => Some(n),
                    None if self.pass1.is_none() => None,
                    None => {
                        return Err(self.err_at(
                            CompileErrorKind::BadReference,
                            at,
                        ));
                    }
                }
            }
        };

        // Static left-recursion check: a call to a group that is still
        // open, reachable with zero characters consumed since that
        // group's start, could recurse forever on an empty match.
        if let Some(n) = group {
            if let Some(idx) = self
                .open
                .iter()
                .rposition(|g| g.number == Some(n))
            {
                let consumed: usize =
                    self.open[idx..].iter().map(|g| g.accum).sum();
                if consumed == 0 {
                    return Err(self.err_at(
                        CompileErrorKind::RecursiveInfiniteLoop,
                        at,
                    ));
                }
            }
        }

        let mut frag = self.new_frag();
        frag.op(OP_RECURSE);
        let patch_at = frag.link_placeholder();
        frag.add_recurse(patch_at, group.unwrap_or(0), at);
        Ok(Item::Recurse(frag))
    }

    // ----- parenthesized constructs ----------------------------------

    fn parse_paren(&mut self) -> Result<Item, CompileError> {
        let at = self.pos - 1;
        match self.peek() {
            Some(b'?') => {
                self.pos += 1;
                self.parse_paren_question(at)
            }
            Some(b'*') => {
                self.pos += 1;
                self.parse_verb()
            }
            _ => {
                if self.options.no_auto_capture {
                    self.group_item(OP_BRA, None)
                } else {
                    let n = self.new_group_number()?;
                    self.group_item(OP_CBRA, Some(n))
                }
            }
        }
    }

    fn parse_paren_question(
        &mut self,
        at: usize,
    ) -> Result<Item, CompileError> {
        match self.peek() {
            Some(b':') => {
                self.pos += 1;
                self.group_item(OP_BRA, None)
            }
            Some(b'>') => {
                self.pos += 1;
                self.group_item(OP_ONCE, None)
            }
            Some(b'=') => {
                self.pos += 1;
                Ok(Item::Assertion(self.parse_assert(false, false)?))
            }
            Some(b'!') => {
                self.pos += 1;
                Ok(Item::Assertion(self.parse_assert(false, true)?))
            }
            Some(b'<') => match self.peek_at(1) {
                Some(b'=') => {
                    self.pos += 2;
                    Ok(Item::Assertion(self.parse_assert(true, false)?))
                }
                Some(b'!') => {
                    self.pos += 2;
                    Ok(Item::Assertion(self.parse_assert(true, true)?))
                }
                _ => {
                    self.pos += 1;
                    let name = self.parse_name(b'>')?;
                    self.named_group(&name, at)
                }
            },
            Some(b'\'') => {
                self.pos += 1;
                let name = self.parse_name(b'\'')?;
                self.named_group(&name, at)
            }
            Some(b'P') => {
                self.pos += 1;
                match self.bump() {
                    Some(b'<') => {
                        let name = self.parse_name(b'>')?;
                        self.named_group(&name, at)
                    }
                    Some(b'=') => {
                        let name = self.parse_name(b')')?;
                        self.named_refs.push((name.clone(), at));
                        match self.lookup_name(&name) {
                            Some(n) => Ok(self.backref_item(n, at)),
                            None if self.pass1.is_none() => {
                                self.has_backref = true;
                                let mut frag = self.new_frag();
                                frag.op(OP_REF);
                                frag.u16(0);
                                Ok(Item::Single {
                                    frag,
                                    desc: SingleDesc::Other,
                                    min: 0,
                                })
                            }
                            None => Err(self.err_at(
                                CompileErrorKind::BadReference,
                                at,
                            )),
                        }
                    }
                    Some(b'>') => {
                        let name = self.parse_name(b')')?;
                        self.recurse_item(RecTarget::Name(name), at)
                    }
                    _ => Err(self.err(CompileErrorKind::BadGroupSyntax)),
                }
            }
            Some(b'#') => {
                loop {
                    match self.bump() {
                        Some(b')') => break,
                        Some(_) => {}
                        None => {
                            return Err(self.err(
                                CompileErrorKind::MissingClosingParen,
                            ));
                        }
                    }
                }
                Ok(Item::NotQuantifiable(self.new_frag()))
            }
            Some(b'R') => {
                self.pos += 1;
                self.expect(b')')?;
                self.recurse_item(RecTarget::Number(0), at)
            }
            Some(b'0'..=b'9') => {
                let n = self.parse_number()?;
                self.expect(b')')?;
                self.recurse_item(RecTarget::Number(n), at)
            }
            Some(b'&') => {
                self.pos += 1;
                let name = self.parse_name(b')')?;
                self.recurse_item(RecTarget::Name(name), at)
            }
            Some(b'(') => {
                self.pos += 1;
                self.parse_cond(at)
            }
            Some(b'i' | b'm' | b's' | b'x' | b'U' | b'J' | b'-') => {
                self.parse_options()
            }
            _ => Err(self.err(CompileErrorKind::BadGroupSyntax)),
        }
    }

    fn named_group(
        &mut self,
        name: &str,
        at: usize,
    ) -> Result<Item, CompileError> {
        let n = self.new_group_number()?;
        self.register_name(name, n, at)?;
        self.group_item(OP_CBRA, Some(n))
    }

    fn group_item(
        &mut self,
        open_op: u8,
        capturing: Option<u16>,
    ) -> Result<Item, CompileError> {
        let saved = self.opts;
        self.open.push(OpenGroup { number: capturing, accum: 0 });
        let result = self.parse_alternation(GroupParams {
            open_op,
            capturing,
            cond: None,
            behind: false,
            branch_limit: None,
            top: false,
        });
        self.open.pop();
        self.opts = saved;
        Ok(Item::Group(result?))
    }

    fn parse_assert(
        &mut self,
        behind: bool,
        negative: bool,
    ) -> Result<Frag, CompileError> {
        let open_op = match (behind, negative) {
            (false, false) => OP_ASSERT,
            (false, true) => OP_ASSERT_NOT,
            (true, false) => OP_ASSERTBACK,
            (true, true) => OP_ASSERTBACK_NOT,
        };
        let saved = self.opts;
        self.open.push(OpenGroup { number: None, accum: 0 });
        let result = self.parse_alternation(GroupParams {
            open_op,
            capturing: None,
            cond: None,
            behind,
            branch_limit: None,
            top: false,
        });
        self.open.pop();
        self.opts = saved;
        Ok(result?.frag)
    }

    fn parse_cond(&mut self, at: usize) -> Result<Item, CompileError> {
        let mut define = false;
        let cond = match self.peek() {
            Some(b'?') => {
                // The condition is a lookaround whose opening paren is
                // the one already consumed.
                self.pos += 1;
                let (behind, negative) = match (self.peek(), self.peek_at(1))
                {
                    (Some(b'='), _) => {
                        self.pos += 1;
                        (false, false)
                    }
                    (Some(b'!'), _) => {
                        self.pos += 1;
                        (false, true)
                    }
                    (Some(b'<'), Some(b'=')) => {
                        self.pos += 2;
                        (true, false)
                    }
                    (Some(b'<'), Some(b'!')) => {
                        self.pos += 2;
                        (true, true)
                    }
                    _ => {
                        return Err(
                            self.err(CompileErrorKind::BadCondition)
                        );
                    }
                };
                self.parse_assert(behind, negative)?
            }
            Some(b'R') => {
                self.pos += 1;
                let mut frag = self.new_frag();
                frag.op(OP_RREF);
                match self.peek() {
                    Some(b')') => frag.u16(RREF_ANY),
                    Some(b'&') => {
                        self.pos += 1;
                        let name = self.parse_name(b')')?;
                        self.named_refs.push((name.clone(), at));
                        frag.u16(self.lookup_name(&name).unwrap_or(0));
                        self.pos -= 1; // parse_name consumed ')'
                    }
                    Some(b'0'..=b'9') => {
                        let n = self.parse_number()?;
                        self.refs.push((n, at));
                        frag.u16(n);
                    }
                    _ => {
                        return Err(
                            self.err(CompileErrorKind::BadCondition)
                        );
                    }
                }
                self.expect(b')')?;
                frag
            }
            Some(b'0'..=b'9') => {
                let n = self.parse_number()?;
                if n == 0 {
                    return Err(self.err(CompileErrorKind::BadCondition));
                }
                self.refs.push((n, at));
                self.expect(b')')?;
                let mut frag = self.new_frag();
                frag.op(OP_CREF);
                frag.u16(n);
                frag
            }
            Some(b'<') => {
                self.pos += 1;
                let name = self.parse_name(b'>')?;
                self.expect(b')')?;
                self.cref_by_name(&name, at)?
            }
            Some(b'\'') => {
                self.pos += 1;
                let name = self.parse_name(b'\'')?;
                self.expect(b')')?;
                self.cref_by_name(&name, at)?
            }
            Some(b'A'..=b'Z' | b'a'..=b'z' | b'_') => {
                let name = self.parse_name(b')')?;
                if name == "DEFINE" {
                    define = true;
                    let mut frag = self.new_frag();
                    frag.op(OP_DEF);
                    frag
                } else {
                    self.cref_by_name(&name, at)?
                }
            }
            _ => return Err(self.err(CompileErrorKind::BadCondition)),
        };

        let saved = self.opts;
        self.open.push(OpenGroup { number: None, accum: 0 });
        let result = self.parse_alternation(GroupParams {
            open_op: OP_COND,
            capturing: None,
            cond: Some(cond),
            behind: false,
            branch_limit: Some(if define { 1 } else { 2 }),
            top: false,
        });
        self.open.pop();
        self.opts = saved;
        Ok(Item::Group(result?))
    }

    fn cref_by_name(
        &mut self,
        name: &str,
        at: usize,
    ) -> Result<Frag, CompileError> {
        self.named_refs.push((name.to_string(), at));
        let n = match self.lookup_name(name) {
            Some(n) => n,
            None if self.pass1.is_none() => 0,
            None => {
                return Err(
                    self.err_at(CompileErrorKind::BadReference, at)
                );
            }
        };
        let mut frag = self.new_frag();
        frag.op(OP_CREF);
        frag.u16(n);
        Ok(frag)
    }

    fn parse_verb(&mut self) -> Result<Item, CompileError> {
        let at = self.pos;
        let mut name = Vec::new();
        loop {
            match self.bump() {
                Some(b')') => break,
                Some(b) => name.push(b),
                None => {
                    return Err(
                        self.err(CompileErrorKind::MissingClosingParen)
                    );
                }
            }
        }
        let op = match name.as_slice() {
            b"FAIL" | b"F" => OP_FAIL,
            b"ACCEPT" => OP_ACCEPT,
            b"COMMIT" => OP_COMMIT,
            b"PRUNE" => OP_PRUNE,
            b"SKIP" => OP_SKIP,
            b"THEN" => OP_THEN,
            _ => return Err(self.err_at(CompileErrorKind::BadVerb, at)),
        };
        let mut frag = self.new_frag();
        frag.op(op);
        Ok(Item::NotQuantifiable(frag))
    }

    fn parse_options(&mut self) -> Result<Item, CompileError> {
        let mut opts = self.opts;
        let mut negate = false;
        loop {
            match self.bump() {
                Some(b'i') => opts.caseless = !negate,
                Some(b'm') => opts.multiline = !negate,
                Some(b's') => opts.dotall = !negate,
                Some(b'x') => opts.extended = !negate,
                Some(b'U') => opts.ungreedy = !negate,
                Some(b'J') => opts.dup_names = !negate,
                Some(b'-') if !negate => negate = true,
                Some(b')') => {
                    self.opts = opts;
                    return Ok(Item::NotQuantifiable(self.new_frag()));
                }
                Some(b':') => {
                    let saved = self.opts;
                    self.opts = opts;
                    let result = self.group_item(OP_BRA, None);
                    self.opts = saved;
                    return result;
                }
                _ => return Err(self.err(CompileErrorKind::BadGroupSyntax)),
            }
        }
    }

    // ----- names and numbers -----------------------------------------

    fn parse_name(&mut self, term: u8) -> Result<String, CompileError> {
        let at = self.pos;
        let mut name = String::new();
        loop {
            match self.bump() {
                Some(b) if b == term => break,
                Some(b @ (b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_')) => {
                    name.push(b as char);
                }
                _ => {
                    return Err(
                        self.err_at(CompileErrorKind::BadGroupName, at)
                    );
                }
            }
        }
        if name.is_empty()
            || name.len() > MAX_NAME_LEN
            || name.as_bytes()[0].is_ascii_digit()
        {
            return Err(self.err_at(CompileErrorKind::BadGroupName, at));
        }
        Ok(name)
    }

    fn parse_number(&mut self) -> Result<u16, CompileError> {
        let at = self.pos;
        let mut value: u32 = 0;
        let mut any = false;
        while let Some(b @ b'0'..=b'9') = self.peek() {
            self.pos += 1;
            any = true;
            value = value * 10 + u32::from(b - b'0');
            if value > u32::from(u16::MAX) {
                return Err(
                    self.err_at(CompileErrorKind::BadReference, at)
                );
            }
        }
        if !any {
            return Err(self.err_at(CompileErrorKind::BadReference, at));
        }
        Ok(value as u16)
    }

    fn expect(&mut self, b: u8) -> Result<(), CompileError> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else if b == b')' {
            Err(self.err(CompileErrorKind::MissingClosingParen))
        } else {
            Err(self.err(CompileErrorKind::BadGroupSyntax))
        }
    }

    // ----- escapes ----------------------------------------------------

    /// Parses the escape whose backslash has already been consumed.
    fn parse_escape(
        &mut self,
        in_class: bool,
    ) -> Result<Esc, CompileError> {
        let at = self.pos - 1;
        let b = self
            .bump()
            .ok_or_else(|| self.err_at(CompileErrorKind::BadEscape, at))?;
        Ok(match b {
            b'a' => Esc::Char('\x07'),
            b'e' => Esc::Char('\x1B'),
            b'f' => Esc::Char('\x0C'),
            b'n' => Esc::Char('\n'),
            b'r' => Esc::Char('\r'),
            b't' => Esc::Char('\t'),
            b'c' => {
                let c = self.bump().ok_or_else(|| {
                    self.err_at(CompileErrorKind::BadEscape, at)
                })?;
                if !c.is_ascii() {
                    return Err(
                        self.err_at(CompileErrorKind::BadEscape, at)
                    );
                }
                Esc::Char((c.to_ascii_uppercase() ^ 0x40) as char)
            }
            b'x' => self.parse_hex_escape(at)?,
            b'0'..=b'9' => self.parse_digit_escape(b, at, in_class)?,
            b'd' => Esc::Type(OP_DIGIT),
            b'D' => Esc::Type(OP_NOT_DIGIT),
            b's' => Esc::Type(OP_WHITESPACE),
            b'S' => Esc::Type(OP_NOT_WHITESPACE),
            b'w' => Esc::Type(OP_WORDCHAR),
            b'W' => Esc::Type(OP_NOT_WORDCHAR),
            b'h' => Esc::Type(OP_HSPACE),
            b'H' => Esc::Type(OP_NOT_HSPACE),
            b'v' => Esc::Type(OP_VSPACE),
            b'V' => Esc::Type(OP_NOT_VSPACE),
            // Inside a class \R loses its meaning and matches the
            // letter itself.
            b'R' if in_class => Esc::Char('R'),
            b'R' => Esc::Bsr,
            b'C' if in_class => {
                return Err(self.err_at(CompileErrorKind::BadEscape, at));
            }
            b'C' => Esc::AnyByte,
            b'p' | b'P' => self.parse_prop_escape(b == b'P', at)?,
            b'b' if in_class => Esc::Char('\x08'),
            b'b' => Esc::Anchor(OP_WORD_BOUNDARY),
            b'B' if in_class => {
                return Err(self.err_at(CompileErrorKind::BadEscape, at));
            }
            b'B' => Esc::Anchor(OP_NOT_WORD_BOUNDARY),
            b'A' => Esc::Anchor(OP_SOD),
            b'Z' => Esc::Anchor(OP_EODN),
            b'z' => Esc::Anchor(OP_EOD),
            b'G' => Esc::Anchor(OP_SOM),
            b'k' if !in_class => {
                let term = match self.bump() {
                    Some(b'<') => b'>',
                    Some(b'\'') => b'\'',
                    Some(b'{') => b'}',
                    _ => {
                        return Err(
                            self.err_at(CompileErrorKind::BadEscape, at)
                        );
                    }
                };
                Esc::NamedRef(self.parse_name(term)?)
            }
            b'g' if !in_class => self.parse_g_escape(at)?,
            b'E' => Esc::Nothing,
            b if !b.is_ascii_alphanumeric() => {
                // an escaped metacharacter or punctuation
                if self.fmt.utf && b >= 0x80 {
                    self.pos -= 1;
                    Esc::Char(self.next_char()?)
                } else {
                    Esc::Char(b as char)
                }
            }
            _ => return Err(self.err_at(CompileErrorKind::BadEscape, at)),
        })
    }

    fn parse_hex_escape(&mut self, at: usize) -> Result<Esc, CompileError> {
        if self.peek() == Some(b'{') {
            self.pos += 1;
            let mut value: u32 = 0;
            let mut any = false;
            loop {
                match self.bump() {
                    Some(b'}') => break,
                    Some(b) if b.is_ascii_hexdigit() => {
                        any = true;
                        value = value * 16
                            + (b as char).to_digit(16).unwrap_or(0);
                        if value > 0x10FFFF {
                            return Err(self.err_at(
                                CompileErrorKind::BadEscape,
                                at,
                            ));
                        }
                    }
                    _ => {
                        return Err(
                            self.err_at(CompileErrorKind::BadEscape, at)
                        );
                    }
                }
            }
            if !any || (!self.fmt.utf && value > 0xFF) {
                return Err(self.err_at(CompileErrorKind::BadEscape, at));
            }
            char::from_u32(value)
                .map(Esc::Char)
                .ok_or_else(|| self.err_at(CompileErrorKind::BadEscape, at))
        } else {
            let mut value: u32 = 0;
            for _ in 0..2 {
                match self.peek() {
                    Some(b) if b.is_ascii_hexdigit() => {
                        self.pos += 1;
                        value = value * 16
                            + (b as char).to_digit(16).unwrap_or(0);
                    }
                    _ => break,
                }
            }
            Ok(Esc::Char(char::from_u32(value).unwrap_or('\0')))
        }
    }

    fn parse_digit_escape(
        &mut self,
        first: u8,
        at: usize,
        in_class: bool,
    ) -> Result<Esc, CompileError> {
        if in_class {
            // Inside a class, digits are octal; \8 and \9 are the
            // literal digits.
            if first >= b'8' {
                return Ok(Esc::Char(first as char));
            }
            self.pos -= 1;
            return Ok(Esc::Char(self.parse_octal()));
        }
        if first == b'0' {
            // \0 with up to two more octal digits
            let mut value: u32 = 0;
            for _ in 0..2 {
                match self.peek() {
                    Some(b @ b'0'..=b'7') => {
                        self.pos += 1;
                        value = value * 8 + u32::from(b - b'0');
                    }
                    _ => break,
                }
            }
            return Ok(Esc::Char(
                char::from_u32(value).unwrap_or('\0'),
            ));
        }
        // Read all the digits, then decide: a single digit, or a number
        // no larger than the count of groups opened so far, is a
        // backreference; otherwise the digits are re-read as octal.
        let start = self.pos - 1;
        let mut value: u32 = 0;
        let mut end = start;
        while end < self.pattern.len()
            && self.pattern[end].is_ascii_digit()
            && value <= u32::from(u16::MAX)
        {
            value = value * 10 + u32::from(self.pattern[end] - b'0');
            end += 1;
        }
        if value <= u32::from(u16::MAX)
            && (value < 10 || value <= u32::from(self.group_count))
        {
            self.pos = end;
            return Ok(Esc::Backref(value as u16));
        }
        if first > b'7' {
            return Err(self.err_at(CompileErrorKind::BadReference, at));
        }
        self.pos = start;
        Ok(Esc::Char(self.parse_octal()))
    }

    /// Reads up to three octal digits at the current position.
    fn parse_octal(&mut self) -> char {
        let mut value: u32 = 0;
        for _ in 0..3 {
            match self.peek() {
                Some(b @ b'0'..=b'7') => {
                    self.pos += 1;
                    value = value * 8 + u32::from(b - b'0');
                }
                _ => break,
            }
        }
        char::from_u32(value & 0xFF).unwrap_or('\0')
    }

    fn parse_g_escape(&mut self, at: usize) -> Result<Esc, CompileError> {
        match self.peek() {
            Some(b'0'..=b'9') => {
                let n = self.parse_number()?;
                if n == 0 {
                    return Err(
                        self.err_at(CompileErrorKind::BadReference, at)
                    );
                }
                Ok(Esc::Backref(n))
            }
            Some(b'{') => {
                self.pos += 1;
                match self.peek() {
                    Some(b'-') => {
                        self.pos += 1;
                        let d = self.parse_number()?;
                        self.expect(b'}').map_err(|_| {
                            self.err_at(CompileErrorKind::BadEscape, at)
                        })?;
                        let n = u32::from(self.group_count)
                            .checked_sub(u32::from(d) - 1)
                            .filter(|n| *n > 0)
                            .ok_or_else(|| {
                                self.err_at(
                                    CompileErrorKind::BadReference,
                                    at,
                                )
                            })?;
                        Ok(Esc::Backref(n as u16))
                    }
                    Some(b'0'..=b'9') => {
                        let n = self.parse_number()?;
                        self.expect(b'}').map_err(|_| {
                            self.err_at(CompileErrorKind::BadEscape, at)
                        })?;
                        if n == 0 {
                            return Err(self.err_at(
                                CompileErrorKind::BadReference,
                                at,
                            ));
                        }
                        Ok(Esc::Backref(n))
                    }
                    _ => Ok(Esc::NamedRef(self.parse_name(b'}')?)),
                }
            }
            Some(b'<') => {
                self.pos += 1;
                Ok(Esc::Recurse(RecTarget::Name(self.parse_name(b'>')?)))
            }
            Some(b'\'') => {
                self.pos += 1;
                Ok(Esc::Recurse(RecTarget::Name(
                    self.parse_name(b'\'')?,
                )))
            }
            _ => Err(self.err_at(CompileErrorKind::BadEscape, at)),
        }
    }

    fn parse_prop_escape(
        &mut self,
        negated: bool,
        at: usize,
    ) -> Result<Esc, CompileError> {
        let name = match self.bump() {
            Some(b'{') => {
                let mut name = String::new();
                loop {
                    match self.bump() {
                        Some(b'}') => break,
                        Some(b) if b.is_ascii_alphanumeric() || b == b'_' => {
                            name.push(b as char);
                        }
                        _ => {
                            return Err(self.err_at(
                                CompileErrorKind::BadProperty,
                                at,
                            ));
                        }
                    }
                }
                name
            }
            Some(b) if b.is_ascii_alphabetic() => (b as char).to_string(),
            _ => {
                return Err(
                    self.err_at(CompileErrorKind::BadProperty, at)
                );
            }
        };
        let category = Category::parse(&name).ok_or_else(|| {
            self.err_at(CompileErrorKind::BadProperty, at)
        })?;
        Ok(Esc::Prop { negated, category })
    }

    // ----- quantifiers ------------------------------------------------

    fn try_quantifier(&mut self) -> Result<Option<Quant>, CompileError> {
        let at = self.pos;
        let (min, max) = match self.peek() {
            Some(b'*') => {
                self.pos += 1;
                (0, None)
            }
            Some(b'+') => {
                self.pos += 1;
                (1, None)
            }
            Some(b'?') => {
                self.pos += 1;
                (0, Some(1))
            }
            Some(b'{') => match self.scan_braced_bound()? {
                Some(bounds) => bounds,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };

        if self.opts.extended {
            self.skip_ws();
        }
        let mut greed = match self.peek() {
            Some(b'?') => {
                self.pos += 1;
                Greed::Lazy
            }
            Some(b'+') => {
                self.pos += 1;
                Greed::Possessive
            }
            _ => Greed::Greedy,
        };
        if self.opts.ungreedy {
            greed = match greed {
                Greed::Greedy => Greed::Lazy,
                Greed::Lazy => Greed::Greedy,
                Greed::Possessive => Greed::Possessive,
            };
        }

        if let Some(max) = max {
            if min > max {
                return Err(self.err_at(
                    CompileErrorKind::QuantifierOutOfOrder,
                    at,
                ));
            }
        }
        Ok(Some(Quant { min, max, greed }))
    }

    /// Scans `{m}`, `{m,}` or `{m,n}` at the current `{`. Returns `None`
    /// without consuming anything when the braces are not a well-formed
    /// bound, in which case the brace is a literal.
    fn scan_braced_bound(
        &mut self,
    ) -> Result<Option<(u32, Option<u32>)>, CompileError> {
        let save = self.pos;
        self.pos += 1; // '{'
        let mut read_number = |p: &mut Self| -> Option<u32> {
            let mut value: u32 = 0;
            let mut any = false;
            while let Some(b @ b'0'..=b'9') = p.peek() {
                p.pos += 1;
                any = true;
                value = value.saturating_mul(10) + u32::from(b - b'0');
            }
            if any {
                Some(value)
            } else {
                None
            }
        };
        let Some(min) = read_number(self) else {
            self.pos = save;
            return Ok(None);
        };
        let max = match self.peek() {
            Some(b'}') => {
                self.pos += 1;
                Some(min)
            }
            Some(b',') => {
                self.pos += 1;
                let max = read_number(self);
                if self.peek() != Some(b'}') {
                    self.pos = save;
                    return Ok(None);
                }
                self.pos += 1;
                max
            }
            _ => {
                self.pos = save;
                return Ok(None);
            }
        };
        if min > MAX_REPEAT || max.is_some_and(|m| m > MAX_REPEAT) {
            return Err(
                self.err_at(CompileErrorKind::QuantifierTooBig, save)
            );
        }
        Ok(Some((min, max)))
    }

    // ----- repeat emission --------------------------------------------

    fn emit_repeat(
        &mut self,
        frag: &mut Frag,
        min: &mut usize,
        item: Item,
        quant: Quant,
    ) -> Result<(), CompileError> {
        let contribution;
        match item {
            Item::Single { frag: ifrag, desc, min: imin } => {
                contribution = imin * quant.min as usize;
                self.emit_single_repeat(frag, ifrag, &desc, quant);
            }
            Item::Group(group) => {
                contribution = group.min * quant.min as usize;
                self.emit_group_repeat(frag, group, quant);
            }
            Item::Recurse(rfrag) => {
                contribution = 0;
                if quant.min == 1 && quant.max == Some(1) {
                    frag.append(rfrag);
                } else {
                    let group = self.wrap_bracket(OP_BRA, rfrag);
                    self.emit_group_repeat(frag, group, quant);
                }
            }
            Item::Assertion(afrag) => {
                // An assertion cannot usefully repeat; one copy when
                // mandatory, an optional bracket otherwise.
                contribution = 0;
                if quant.min >= 1 {
                    frag.append(afrag);
                } else if quant.max != Some(0) {
                    frag.op(if quant.greed == Greed::Lazy {
                        OP_BRAMINZERO
                    } else {
                        OP_BRAZERO
                    });
                    frag.append(afrag);
                }
            }
            Item::ZeroWidth(zfrag) => {
                contribution = 0;
                if quant.min >= 1 {
                    frag.append(zfrag);
                } else if quant.max != Some(0) {
                    frag.op(if quant.greed == Greed::Lazy {
                        OP_BRAMINZERO
                    } else {
                        OP_BRAZERO
                    });
                    let wrapped = self.wrap_bracket(OP_BRA, zfrag);
                    frag.append(wrapped.frag);
                }
            }
            Item::NotQuantifiable(_) => {
                contribution = 0;
                debug_assert!(false, "checked by the caller");
            }
        }
        *min += contribution;
        if let Some(g) = self.open.last_mut() {
            g.accum += contribution;
        }
        Ok(())
    }

    fn emit_single_repeat(
        &mut self,
        frag: &mut Frag,
        ifrag: Frag,
        desc: &SingleDesc,
        quant: Quant,
    ) {
        let mut greed = quant.greed;
        // Auto-possessify an unbounded greedy repeat whose item cannot
        // possibly match the same character as the following one.
        if greed == Greed::Greedy && quant.max.is_none() {
            if self.repeat_and_next_disjoint(desc) {
                greed = Greed::Possessive;
            }
        }
        let star = match greed {
            Greed::Greedy => OP_STAR,
            Greed::Lazy => OP_MINSTAR,
            Greed::Possessive => OP_POSSTAR,
        };
        let plus = star + (OP_PLUS - OP_STAR);
        let query = star + (OP_QUERY - OP_STAR);
        let upto = match greed {
            Greed::Greedy => OP_UPTO,
            Greed::Lazy => OP_MINUPTO,
            Greed::Possessive => OP_POSUPTO,
        };

        match (quant.min, quant.max) {
            (0, Some(0)) => {} // the item vanishes
            (1, Some(1)) => frag.append(ifrag),
            (0, None) => {
                frag.op(star);
                frag.append(ifrag);
            }
            (1, None) => {
                frag.op(plus);
                frag.append(ifrag);
            }
            (m, None) => {
                frag.op(OP_EXACT);
                frag.u16(m as u16);
                frag.append_clone(&ifrag);
                frag.op(star);
                frag.append(ifrag);
            }
            (0, Some(1)) => {
                frag.op(query);
                frag.append(ifrag);
            }
            (0, Some(n)) => {
                frag.op(upto);
                frag.u16(n as u16);
                frag.append(ifrag);
            }
            (m, Some(n)) if m == n => {
                frag.op(OP_EXACT);
                frag.u16(m as u16);
                frag.append(ifrag);
            }
            (m, Some(n)) => {
                frag.op(OP_EXACT);
                frag.u16(m as u16);
                frag.append_clone(&ifrag);
                frag.op(upto);
                frag.u16((n - m) as u16);
                frag.append(ifrag);
            }
        }
    }

    fn emit_group_repeat(
        &mut self,
        frag: &mut Frag,
        group: GroupFrag,
        quant: Quant,
    ) {
        if quant.greed == Greed::Possessive {
            let mut inner = self.new_frag();
            self.emit_group_repeat_core(&mut inner, group, quant, false);
            let wrapped = self.wrap_bracket(OP_ONCE, inner);
            frag.append(wrapped.frag);
        } else {
            let lazy = quant.greed == Greed::Lazy;
            self.emit_group_repeat_core(frag, group, quant, lazy);
        }
    }

    fn emit_group_repeat_core(
        &mut self,
        frag: &mut Frag,
        mut group: GroupFrag,
        quant: Quant,
        lazy: bool,
    ) {
        let zero_op = if lazy { OP_BRAMINZERO } else { OP_BRAZERO };
        match (quant.min, quant.max) {
            // {0}: the group is skipped entirely, but stays in the code
            // so that references to it remain valid.
            (0, Some(0)) => {
                frag.op(OP_SKIPZERO);
                frag.append(group.frag);
            }
            (1, Some(1)) => frag.append(group.frag),
            (0, Some(1)) => {
                frag.op(zero_op);
                frag.append(group.frag);
            }
            (m, None) => {
                for _ in 1..m {
                    frag.append_clone(&group.frag);
                }
                self.make_repeating(&mut group, lazy);
                if m == 0 {
                    frag.op(zero_op);
                }
                frag.append(group.frag);
            }
            (m, Some(n)) if m == n => {
                for _ in 1..m {
                    frag.append_clone(&group.frag);
                }
                frag.append(group.frag);
            }
            (m, Some(n)) => {
                for _ in 0..m {
                    frag.append_clone(&group.frag);
                }
                // The optional tail is nested, so that once copy k fails
                // to match, copies k+1.. are not attempted.
                let k = n - m;
                let mut tail = self.new_frag();
                tail.op(zero_op);
                tail.append_clone(&group.frag);
                for _ in 1..k {
                    let mut inner = self.new_frag();
                    inner.append_clone(&group.frag);
                    inner.append(tail);
                    let wrapped = self.wrap_bracket(OP_BRA, inner);
                    tail = self.new_frag();
                    tail.op(zero_op);
                    tail.append(wrapped.frag);
                }
                frag.append(tail);
            }
        }
    }

    /// Turns a group fragment into an unbounded-repeat one: the closing
    /// KET becomes KETRMAX/KETRMIN, and a group that can match the empty
    /// string gets the guard variant of its opening bracket.
    fn make_repeating(&mut self, group: &mut GroupFrag, lazy: bool) {
        group.frag.set_op(
            group.ket_at,
            if lazy { OP_KETRMIN } else { OP_KETRMAX },
        );
        if group.min == 0 && !group.frag.sizing() {
            let open = group.frag.code[0];
            if open == OP_BRA {
                group.frag.set_op(0, OP_SBRA);
            } else if open == OP_CBRA {
                group.frag.set_op(0, OP_SCBRA);
            }
        }
    }

    /// Wraps a fragment in `op .. KET`, producing a single-branch group.
    fn wrap_bracket(&self, op: u8, inner: Frag) -> GroupFrag {
        let mut frag = self.new_frag();
        frag.op(op);
        frag.link_placeholder();
        frag.append(inner);
        let ket_at = frag.pos();
        frag.patch_link(1, ket_at);
        frag.op(OP_KET);
        frag.link(ket_at);
        GroupFrag { frag, ket_at, min: 0 }
    }

    // ----- auto-possessification --------------------------------------

    /// Returns true when the repeated item's character set is provably
    /// disjoint from the next item in the pattern.
    fn repeat_and_next_disjoint(&mut self, desc: &SingleDesc) -> bool {
        let Some((repeat_bits, _)) = self.desc_bits(desc) else {
            return false;
        };
        let save_pos = self.pos;
        let save_opts = self.opts;
        let save_quoted = self.quoted;
        let next = self.probe_next_bits();
        self.pos = save_pos;
        self.opts = save_opts;
        self.quoted = save_quoted;

        match next {
            Some((next_bits, exact)) if exact => {
                let a = repeat_bits.as_raw_slice();
                let b = next_bits.as_raw_slice();
                a.iter().zip(b.iter()).all(|(x, y)| x & y == 0)
            }
            _ => false,
        }
    }

    /// Byte-membership set of a single item. The second value reports
    /// whether the set is exact: a set that under-approximates (UTF
    /// items that can also match characters above U+00FF) is usable as
    /// the repeated side of the disjointness test but not as the next
    /// item.
    fn desc_bits(&self, desc: &SingleDesc) -> Option<(Bits, bool)> {
        let mut bits = Bits::ZERO;
        match desc {
            SingleDesc::Char(c, caseless) => {
                let v = *c as u32;
                if v > 0xFF || (self.fmt.utf && v > 0x7F) {
                    return None;
                }
                bits.set(v as usize, true);
                if *caseless {
                    bits.set(tables::fold(v as u8) as usize, true);
                }
                Some((bits, true))
            }
            SingleDesc::NotChar(c, caseless) => {
                let v = *c as u32;
                if v > 0xFF || (self.fmt.utf && v > 0x7F) {
                    return None;
                }
                for i in 0..=255usize {
                    bits.set(i, true);
                }
                bits.set(v as usize, false);
                if *caseless {
                    bits.set(tables::fold(v as u8) as usize, false);
                }
                // In UTF mode a negated char also matches everything
                // above the byte range.
                Some((bits, !self.fmt.utf))
            }
            SingleDesc::Type(op) => {
                let (test, negated): (fn(u8) -> bool, bool) = match *op {
                    OP_DIGIT => (tables::is_digit, false),
                    OP_NOT_DIGIT => (tables::is_digit, true),
                    OP_WHITESPACE => (tables::is_space, false),
                    OP_NOT_WHITESPACE => (tables::is_space, true),
                    OP_WORDCHAR => (tables::is_word, false),
                    OP_NOT_WORDCHAR => (tables::is_word, true),
                    OP_HSPACE => (tables::is_hspace, false),
                    OP_NOT_HSPACE => (tables::is_hspace, true),
                    OP_VSPACE => (tables::is_vspace, false),
                    OP_NOT_VSPACE => (tables::is_vspace, true),
                    _ => return None,
                };
                for i in 0..=255u8 {
                    bits.set(i as usize, test(i) != negated);
                }
                // Negated types (and the space families in UTF mode)
                // also match above the byte range.
                let exact = !self.fmt.utf
                    || (!negated
                        && matches!(*op, OP_DIGIT | OP_WORDCHAR));
                Some((bits, exact))
            }
            SingleDesc::Class(Some(class_bits)) => {
                Some((**class_bits, true))
            }
            _ => None,
        }
    }

    /// Looks ahead for the next literal, type escape or class and builds
    /// its byte set. The parser state is restored by the caller.
    fn probe_next_bits(&mut self) -> Option<(Bits, bool)> {
        if self.opts.extended {
            self.skip_ws();
        }
        let b = self.peek()?;
        let desc = match b {
            b'[' => {
                self.pos += 1;
                let class = self.scan_class().ok()?;
                if class.needs_xclass() {
                    return None;
                }
                SingleDesc::Class(Some(Box::new(class.final_bits())))
            }
            b'\\' => {
                self.pos += 1;
                match self.parse_escape(false).ok()? {
                    Esc::Char(c) => SingleDesc::Char(c, self.opts.caseless),
                    Esc::Type(op) => SingleDesc::Type(op),
                    _ => return None,
                }
            }
            b'.' | b'(' | b')' | b'|' | b'^' | b'$' | b'*' | b'+'
            | b'?' => return None,
            _ => {
                let c = self.next_char().ok()?;
                SingleDesc::Char(c, self.opts.caseless)
            }
        };
        // If the next item is itself optionally quantified it may be
        // absent, and whatever follows it could still collide with the
        // repeat, so the disjointness test proves nothing.
        if self.opts.extended {
            self.skip_ws();
        }
        if matches!(self.peek(), Some(b'*' | b'+' | b'?' | b'{')) {
            match self.try_quantifier() {
                Ok(Some(q)) if q.min == 0 => return None,
                Err(_) => return None,
                _ => {}
            }
        }
        self.desc_bits(&desc)
    }

    // ----- character classes ------------------------------------------

    fn scan_class(&mut self) -> Result<ClassData, CompileError> {
        let mut class = ClassData::default();
        if self.peek() == Some(b'^') {
            self.pos += 1;
            class.negated = true;
        }
        let mut first = true;
        loop {
            let Some(b) = self.peek() else {
                return Err(
                    self.err(CompileErrorKind::MissingClosingBracket)
                );
            };
            if b == b']' && !first && !self.quoted {
                self.pos += 1;
                break;
            }
            first = false;

            if b == b'['
                && self.peek_at(1) == Some(b':')
                && !self.quoted
            {
                self.parse_posix_class(&mut class)?;
                continue;
            }

            let start = self.class_atom(&mut class)?;
            let Some(start) = start else { continue };

            // a possible range
            if !self.quoted
                && self.peek() == Some(b'-')
                && self.peek_at(1).is_some()
                && self.peek_at(1) != Some(b']')
            {
                let at = self.pos;
                self.pos += 1;
                let end = self.class_atom(&mut class)?;
                let Some(end) = end else {
                    return Err(self.err_at(
                        CompileErrorKind::ClassRangeOutOfOrder,
                        at,
                    ));
                };
                if (end as u32) < (start as u32) {
                    return Err(self.err_at(
                        CompileErrorKind::ClassRangeOutOfOrder,
                        at,
                    ));
                }
                self.add_class_range(&mut class, start, end);
            } else {
                self.add_class_range(&mut class, start, start);
            }
        }
        Ok(class)
    }

    /// Parses one class member. Types, properties and quoted sequences
    /// are folded into the class directly and yield `None`; a character
    /// (which may open a range) is returned.
    fn class_atom(
        &mut self,
        class: &mut ClassData,
    ) -> Result<Option<char>, CompileError> {
        let b = self.peek().ok_or_else(|| {
            self.err(CompileErrorKind::MissingClosingBracket)
        })?;
        if b == b'\\' {
            self.pos += 1;
            match self.peek() {
                Some(b'Q') => {
                    self.pos += 1;
                    self.quoted = true;
                    return Ok(None);
                }
                Some(b'E') => {
                    self.pos += 1;
                    self.quoted = false;
                    return Ok(None);
                }
                _ => {}
            }
            if self.quoted {
                // inside \Q..\E the backslash is literal
                return Ok(Some('\\'));
            }
            return match self.parse_escape(true)? {
                Esc::Char(c) => Ok(Some(c)),
                Esc::Type(op) => {
                    self.add_type_to_class(class, op);
                    Ok(None)
                }
                Esc::Prop { negated, category } => {
                    self.add_prop_to_class(class, negated, category);
                    Ok(None)
                }
                Esc::Nothing => Ok(None),
                _ => Err(self.err(CompileErrorKind::BadEscape)),
            };
        }
        let c = self.next_char()?;
        Ok(Some(c))
    }

    fn add_class_range(
        &mut self,
        class: &mut ClassData,
        start: char,
        end: char,
    ) {
        let lo = start as u32;
        let hi = end as u32;
        class.atoms += if lo == hi { 1 } else { 2 };
        if lo == hi {
            class.last_char = Some(start);
        }
        let byte_hi = hi.min(0xFF);
        if lo <= byte_hi {
            for v in lo..=byte_hi {
                class.bits.set(v as usize, true);
                if self.opts.caseless {
                    class.bits.set(tables::fold(v as u8) as usize, true);
                }
            }
        }
        if hi > 0xFF {
            class.wide_ranges.push((lo.max(0x100), hi));
            if self.opts.caseless {
                class.caseless_wide = true;
            }
        }
    }

    fn add_type_to_class(&self, class: &mut ClassData, op: u8) {
        class.atoms += 2;
        let (test, negated): (fn(u8) -> bool, bool) = match op {
            OP_DIGIT => (tables::is_digit, false),
            OP_NOT_DIGIT => (tables::is_digit, true),
            OP_WHITESPACE => (tables::is_space, false),
            OP_NOT_WHITESPACE => (tables::is_space, true),
            OP_WORDCHAR => (tables::is_word, false),
            OP_NOT_WORDCHAR => (tables::is_word, true),
            OP_HSPACE => (tables::is_hspace, false),
            OP_NOT_HSPACE => (tables::is_hspace, true),
            OP_VSPACE => (tables::is_vspace, false),
            OP_NOT_VSPACE => (tables::is_vspace, true),
            _ => return,
        };
        for i in 0..=255u8 {
            if test(i) != negated {
                class.bits.set(i as usize, true);
            }
        }
        // A negated type matches every character above the byte range.
        if negated && self.fmt.utf {
            class.wide_ranges.push((0x100, 0x10FFFF));
        }
    }

    fn add_prop_to_class(
        &self,
        class: &mut ClassData,
        negated: bool,
        category: Category,
    ) {
        class.atoms += 2;
        if self.fmt.utf {
            class.props.push((negated, category as u8));
        } else {
            // Byte mode: materialize the property over the byte range.
            for i in 0..=255u8 {
                if category.contains(i as char) != negated {
                    class.bits.set(i as usize, true);
                }
            }
        }
    }

    fn parse_posix_class(
        &mut self,
        class: &mut ClassData,
    ) -> Result<(), CompileError> {
        let at = self.pos;
        self.pos += 2; // "[:"
        let negated = if self.peek() == Some(b'^') {
            self.pos += 1;
            true
        } else {
            false
        };
        class.atoms += 2;
        let mut name = String::new();
        loop {
            match self.bump() {
                Some(b':') if self.peek() == Some(b']') => {
                    self.pos += 1;
                    break;
                }
                Some(b @ b'a'..=b'z') => name.push(b as char),
                _ => {
                    return Err(
                        self.err_at(CompileErrorKind::BadPosixClass, at)
                    );
                }
            }
        }
        let test: fn(u8) -> bool = match name.as_str() {
            "alpha" => |b| b.is_ascii_alphabetic(),
            "alnum" => |b| b.is_ascii_alphanumeric(),
            "ascii" => |b| b < 0x80,
            "blank" => |b| b == b' ' || b == b'\t',
            "cntrl" => |b| b.is_ascii_control(),
            "digit" => |b| b.is_ascii_digit(),
            "graph" => |b| b.is_ascii_graphic(),
            "lower" => |b| b.is_ascii_lowercase(),
            "print" => |b| b == b' ' || b.is_ascii_graphic(),
            "punct" => |b| b.is_ascii_punctuation(),
            "space" => tables::is_space,
            "upper" => |b| b.is_ascii_uppercase(),
            "word" => tables::is_word,
            "xdigit" => |b| b.is_ascii_hexdigit(),
            _ => {
                return Err(
                    self.err_at(CompileErrorKind::BadPosixClass, at)
                );
            }
        };
        for i in 0..=255u8 {
            if test(i) != negated {
                class.bits.set(i as usize, true);
            }
        }
        Ok(())
    }

    fn class_item(&mut self, class: ClassData) -> Item {
        let mut frag = self.new_frag();

        // A negated class holding a single character compiles to the
        // dedicated NOT instruction.
        if class.negated && class.atoms == 1 && !class.needs_xclass() {
            if let Some(c) = class.last_char {
                let caseless = self.opts.caseless;
                frag.op(if caseless { OP_NOTI } else { OP_NOT });
                frag.chr(c);
                return Item::Single {
                    frag,
                    desc: SingleDesc::NotChar(c, caseless),
                    min: 1,
                };
            }
        }

        if !class.needs_xclass() {
            let bits = class.final_bits();
            frag.op(if class.negated { OP_NCLASS } else { OP_CLASS });
            frag.bytes(bits.as_raw_slice());
            let desc = SingleDesc::Class(Some(Box::new(bits)));
            return Item::Single { frag, desc, min: 1 };
        }

        // Extended class: the byte-range content becomes explicit
        // codepoint ranges alongside the wide ones.
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        let mut run: Option<(u32, u32)> = None;
        for v in 0..=255u32 {
            if class.bits[v as usize] {
                match run {
                    Some((lo, hi)) if hi + 1 == v => run = Some((lo, v)),
                    Some(r) => {
                        ranges.push(r);
                        run = Some((v, v));
                    }
                    None => run = Some((v, v)),
                }
            }
        }
        if let Some(r) = run {
            ranges.push(r);
        }
        ranges.extend_from_slice(&class.wide_ranges);

        let lb = self.fmt.link_bytes();
        let total = 1
            + lb
            + 1
            + 1
            + 2 * class.props.len()
            + 2
            + 8 * ranges.len();
        frag.op(OP_XCLASS);
        frag.link(total);
        let mut flags = 0u8;
        if class.negated {
            flags |= XCL_NOT;
        }
        if self.opts.caseless || class.caseless_wide {
            flags |= XCL_CASELESS;
        }
        frag.bytes(&[flags, class.props.len() as u8]);
        for (negated, cat) in &class.props {
            frag.bytes(&[u8::from(!*negated), *cat]);
        }
        frag.u16(ranges.len() as u16);
        for (lo, hi) in &ranges {
            frag.bytes(&lo.to_le_bytes());
            frag.bytes(&hi.to_le_bytes());
        }
        Item::Single { frag, desc: SingleDesc::Other, min: 1 }
    }
}

/// Accumulated contents of a bracketed class, shared by both the bitmap
/// and the extended encodings.
#[derive(Default)]
struct ClassData {
    negated: bool,
    /// Membership of characters 0..=255, case-folded at insertion.
    bits: Bits,
    /// Explicit ranges above the byte range (UTF mode only).
    wide_ranges: Vec<(u32, u32)>,
    /// Property tests: (negated, category code).
    props: Vec<(bool, u8)>,
    caseless_wide: bool,
    /// Number of members added; a lone character member enables the
    /// single-character encodings.
    atoms: u32,
    last_char: Option<char>,
}

impl ClassData {
    fn needs_xclass(&self) -> bool {
        !self.wide_ranges.is_empty() || !self.props.is_empty()
    }

    /// The final byte-membership bitmap, negation applied.
    fn final_bits(&self) -> Bits {
        let mut bits = self.bits;
        if self.negated {
            for byte in bits.as_raw_mut_slice() {
                *byte = !*byte;
            }
        }
        bits
    }
}
