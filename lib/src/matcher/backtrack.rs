/*!
The backtracking interpreter.

One match attempt is a recursive walk over the instruction stream:
[`MatchContext::attempt`] enters the outermost bracket and each point
where the matcher has a choice (an alternation branch, a repeat
iteration, an optional group) recurses into one continuation and falls
back to the next on failure. Sequential instructions advance within a
single `rmatch` frame, so recursion depth is proportional to the number
of open choice points, not to the subject length.

Group brackets keep a runtime frame recording where the group started in
the subject; closing KETs commit the capture from that frame. Capture
slots are guarded by a high-water mark (`offset_top`, passed
by value through the recursion) so that captures committed inside an
abandoned branch are dead on arrival instead of needing to be undone.

Lookarounds, atomic groups and subroutine calls run their bodies as
local matches: the closing KET of such a bracket returns success to the
handler that started it instead of continuing into the enclosing code.
The control verbs propagate outward as distinct [`Verdict`]s, converting
the failure of their continuation into a signal the bracket handlers and
the bump-along loop interpret.
*/

use smallvec::SmallVec;

use crate::errors::MatchError;
use crate::instr::{
    bracket_ket, branch_starts, decode, read_char_operand, read_u16,
    CodeFmt, Instr, OP_ASSERT, OP_ASSERTBACK, OP_ASSERTBACK_NOT,
    OP_ASSERT_NOT, OP_CBRA, OP_KET, OP_KETRMAX, OP_KETRMIN, OP_ONCE,
    OP_SCBRA, RREF_ANY,
};
use crate::options::{Bsr, ExecOptions, Newline};
use crate::program::Program;
use crate::tables;
use crate::unicode::{chars_eq_folded, Category};

/// An unset capture slot.
pub(crate) const UNSET: usize = usize::MAX;

/// Outcome of one `rmatch` call. Everything except `Match` and
/// `NoMatch` is a control verb travelling outward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Match,
    NoMatch,
    /// `(*PRUNE)`: abandon this attempt, allow a bump-along.
    Prune,
    /// `(*THEN)`: abandon the current alternative.
    Then,
    /// `(*SKIP)`: abandon this attempt and resume at the given offset.
    Skip(usize),
    /// `(*COMMIT)`: abandon the whole match, no bump-along.
    Commit,
}

/// A currently-open group.
#[derive(Debug, Clone, Copy)]
struct GroupFrame {
    /// Code offset of the opening bracket.
    bracket_at: usize,
    /// Subject position at group entry.
    subject_start: usize,
    /// Capturing group number, if any.
    group: Option<u16>,
}

/// An active subroutine call.
#[derive(Debug, Clone, Copy)]
struct Recursion {
    /// Code offset of the called bracket.
    target: usize,
    group: u16,
}

pub(crate) struct MatchContext<'a> {
    code: &'a [u8],
    subject: &'a [u8],
    fmt: CodeFmt,
    prog: &'a Program,
    opts: &'a ExecOptions,
    /// Where this exec call started; the target of `\G`.
    start_offset: usize,
    steps: u32,
    /// Capture slots, two per group. Slot validity is additionally
    /// bounded by the `offset_top` high-water mark.
    pub(crate) caps: Vec<usize>,
    group_stack: Vec<GroupFrame>,
    recursion: Vec<Recursion>,
    /// Subject end of the innermost completed local match, and the
    /// capture high-water mark it reached.
    local_end: usize,
    local_top: usize,
    /// Set by `(*ACCEPT)` so atomic groups pass the success outward
    /// instead of resuming after their bracket.
    accepted: bool,
    /// The subject was exhausted while the matcher wanted more input.
    pub(crate) hit_end: bool,
    /// Final match end and capture high-water mark, valid after a
    /// successful attempt.
    pub(crate) end: usize,
    pub(crate) final_top: usize,
}

impl<'a> MatchContext<'a> {
    pub fn new(
        prog: &'a Program,
        subject: &'a [u8],
        opts: &'a ExecOptions,
        start_offset: usize,
    ) -> Self {
        let nslots = 2 * (prog.capture_count as usize + 1);
        Self {
            code: &prog.code,
            subject,
            fmt: prog.fmt(),
            prog,
            opts,
            start_offset,
            steps: 0,
            caps: vec![UNSET; nslots],
            group_stack: Vec::new(),
            recursion: Vec::new(),
            local_end: 0,
            local_top: 2,
            accepted: false,
            hit_end: false,
            end: 0,
            final_top: 2,
        }
    }

    /// Runs one match attempt with the subject anchored at `start`.
    pub fn attempt(&mut self, start: usize) -> Result<Verdict, MatchError> {
        self.caps.fill(UNSET);
        self.group_stack.clear();
        self.recursion.clear();
        self.accepted = false;
        let verdict = self.rmatch(0, start, 2, 0)?;
        if verdict == Verdict::Match {
            self.accepted = false;
            self.end = self.local_end;
            self.final_top = self.local_top;
        }
        Ok(verdict)
    }

    // ----- the interpreter -------------------------------------------

    /// Matches code starting at `at` against the subject at `pos`,
    /// running through to the end of the pattern. `offset_top` is the
    /// capture high-water mark for this continuation.
    fn rmatch(
        &mut self,
        mut at: usize,
        mut pos: usize,
        mut offset_top: usize,
        depth: u32,
    ) -> Result<Verdict, MatchError> {
        self.steps += 1;
        if self.steps > self.opts.match_limit {
            return Err(MatchError::MatchLimit);
        }
        if depth > self.opts.recursion_limit {
            return Err(MatchError::RecursionLimit);
        }
        let lb = self.fmt.link_bytes();

        loop {
            let (instr, len) = decode(self.code, at, self.fmt);
            match instr {
                Instr::End => {
                    self.local_end = pos;
                    self.local_top = offset_top;
                    return Ok(Verdict::Match);
                }

                // ----- consuming items -------------------------------
                Instr::Char(_)
                | Instr::CharI(_)
                | Instr::NotChar(_)
                | Instr::NotCharI(_)
                | Instr::Any
                | Instr::AllAny
                | Instr::AnyByte
                | Instr::AnyNl
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
                | Instr::XClass(_)
                | Instr::Ref(_)
                | Instr::RefI(_) => {
                    match self.match_item(&instr, pos, offset_top) {
                        Some(next) => {
                            pos = next;
                            at += len;
                        }
                        None => return Ok(Verdict::NoMatch),
                    }
                }

                // ----- repeats ---------------------------------------
                Instr::Exact(n) => {
                    let item_at = at + len;
                    let (item, item_len) = decode(self.code, item_at, self.fmt);
                    for _ in 0..n {
                        match self.match_item(&item, pos, offset_top) {
                            Some(next) => pos = next,
                            None => return Ok(Verdict::NoMatch),
                        }
                    }
                    at = item_at + item_len;
                }
                Instr::Star | Instr::Plus => {
                    return self.max_repeat(
                        at, len, pos, offset_top, depth,
                        matches!(instr, Instr::Plus),
                        None,
                    );
                }
                Instr::Upto(n) => {
                    return self.max_repeat(
                        at, len, pos, offset_top, depth, false,
                        Some(n as usize),
                    );
                }
                Instr::MinStar | Instr::MinPlus => {
                    return self.min_repeat(
                        at, len, pos, offset_top, depth,
                        matches!(instr, Instr::MinPlus),
                        None,
                    );
                }
                Instr::MinUpto(n) => {
                    return self.min_repeat(
                        at, len, pos, offset_top, depth, false,
                        Some(n as usize),
                    );
                }
                Instr::PosStar | Instr::PosPlus | Instr::PosUpto(_) => {
                    let item_at = at + len;
                    let (item, item_len) = decode(self.code, item_at, self.fmt);
                    let min = matches!(instr, Instr::PosPlus);
                    let max = match instr {
                        Instr::PosUpto(n) => Some(n as usize),
                        _ => None,
                    };
                    let mut count = 0usize;
                    while max.map_or(true, |m| count < m) {
                        match self.match_item(&item, pos, offset_top) {
                            Some(next) if next != pos => {
                                pos = next;
                                count += 1;
                            }
                            _ => break,
                        }
                    }
                    if min && count == 0 {
                        return Ok(Verdict::NoMatch);
                    }
                    at = item_at + item_len;
                }
                Instr::Query | Instr::MinQuery | Instr::PosQuery => {
                    let item_at = at + len;
                    let (item, item_len) = decode(self.code, item_at, self.fmt);
                    let after = item_at + item_len;
                    match instr {
                        Instr::Query => {
                            if let Some(next) =
                                self.match_item(&item, pos, offset_top)
                            {
                                let r = self.rmatch(
                                    after, next, offset_top, depth + 1,
                                )?;
                                if r != Verdict::NoMatch {
                                    return Ok(r);
                                }
                            }
                            at = after;
                        }
                        Instr::MinQuery => {
                            let r = self
                                .rmatch(after, pos, offset_top, depth + 1)?;
                            if r != Verdict::NoMatch {
                                return Ok(r);
                            }
                            match self.match_item(&item, pos, offset_top) {
                                Some(next) => {
                                    pos = next;
                                    at = after;
                                }
                                None => return Ok(Verdict::NoMatch),
                            }
                        }
                        _ => {
                            if let Some(next) =
                                self.match_item(&item, pos, offset_top)
                            {
                                pos = next;
                            }
                            at = after;
                        }
                    }
                }

                // ----- anchors and boundaries ------------------------
                Instr::Circ => {
                    if pos != 0 || self.opts.not_bol {
                        return Ok(Verdict::NoMatch);
                    }
                    at += len;
                }
                Instr::CircM => {
                    let ok = (pos == 0 && !self.opts.not_bol)
                        || (pos > 0
                            && pos < self.subject.len()
                            && self.after_newline(pos));
                    if !ok {
                        return Ok(Verdict::NoMatch);
                    }
                    at += len;
                }
                Instr::Doll => {
                    if self.opts.not_eol || !self.at_subject_end(pos) {
                        return Ok(Verdict::NoMatch);
                    }
                    at += len;
                }
                Instr::DollM => {
                    let ok = (pos == self.subject.len()
                        && !self.opts.not_eol)
                        || self.newline_len_at(pos).is_some();
                    if !ok {
                        return Ok(Verdict::NoMatch);
                    }
                    at += len;
                }
                Instr::Sod => {
                    if pos != 0 {
                        return Ok(Verdict::NoMatch);
                    }
                    at += len;
                }
                Instr::Som => {
                    if pos != self.start_offset {
                        return Ok(Verdict::NoMatch);
                    }
                    at += len;
                }
                Instr::Eodn => {
                    if !self.at_subject_end(pos) {
                        return Ok(Verdict::NoMatch);
                    }
                    at += len;
                }
                Instr::Eod => {
                    if pos != self.subject.len() {
                        return Ok(Verdict::NoMatch);
                    }
                    at += len;
                }
                Instr::WordBoundary | Instr::NotWordBoundary => {
                    let before =
                        pos > 0 && tables::is_word(self.subject[pos - 1]);
                    let after = pos < self.subject.len()
                        && tables::is_word(self.subject[pos]);
                    let boundary = before != after;
                    if boundary
                        != matches!(instr, Instr::WordBoundary)
                    {
                        return Ok(Verdict::NoMatch);
                    }
                    at += len;
                }

                // ----- brackets --------------------------------------
                Instr::Bra(_)
                | Instr::SBra(_)
                | Instr::CBra(_, _)
                | Instr::SCBra(_, _) => {
                    return self.match_bracket(at, pos, offset_top, depth);
                }
                Instr::Cond(_) => {
                    return self.match_cond(at, pos, offset_top, depth);
                }
                Instr::Once(_) => {
                    let ket = bracket_ket(self.code, at, self.fmt);
                    match self.code[ket] {
                        OP_KET => {
                            match self
                                .match_once_body(at, pos, offset_top, depth)?
                            {
                                Verdict::Match if self.accepted => {
                                    return Ok(Verdict::Match);
                                }
                                Verdict::Match => {}
                                other => return Ok(other),
                            }
                            // atomic: resume after the group, keeping
                            // whatever the body consumed and captured
                            pos = self.local_end;
                            offset_top = offset_top.max(self.local_top);
                            at = ket + 1 + lb;
                        }
                        _ => {
                            return self.repeat_once(
                                at, ket, pos, offset_top, depth,
                            );
                        }
                    }
                }

                Instr::Alt(link) => {
                    // end of a matched branch body: skip to the KET
                    at += link;
                }

                Instr::Ket(link) => {
                    let bracket_at = at - link;
                    if let Some(v) = self.close_local(bracket_at, pos, offset_top) {
                        return Ok(v);
                    }
                    offset_top =
                        self.commit_group(pos, offset_top);
                    self.group_stack.pop();
                    at += len;
                }
                Instr::KetRMax(link) => {
                    let bracket_at = at - link;
                    if let Some(v) = self.close_local(bracket_at, pos, offset_top) {
                        return Ok(v);
                    }
                    offset_top = self.commit_group(pos, offset_top);
                    let frame_start = self
                        .group_stack
                        .last()
                        .map(|f| f.subject_start);
                    self.group_stack.pop();
                    // a group that consumed nothing must not iterate
                    if frame_start != Some(pos) {
                        let r = self.rmatch(
                            bracket_at, pos, offset_top, depth + 1,
                        )?;
                        if r != Verdict::NoMatch {
                            return Ok(r);
                        }
                    }
                    at += len;
                }
                Instr::KetRMin(link) => {
                    let bracket_at = at - link;
                    if let Some(v) = self.close_local(bracket_at, pos, offset_top) {
                        return Ok(v);
                    }
                    offset_top = self.commit_group(pos, offset_top);
                    let frame_start = self
                        .group_stack
                        .last()
                        .map(|f| f.subject_start);
                    self.group_stack.pop();
                    let r =
                        self.rmatch(at + len, pos, offset_top, depth + 1)?;
                    if r != Verdict::NoMatch {
                        return Ok(r);
                    }
                    if frame_start == Some(pos) {
                        return Ok(Verdict::NoMatch);
                    }
                    at = bracket_at;
                }

                Instr::BraZero => {
                    let r =
                        self.rmatch(at + 1, pos, offset_top, depth + 1)?;
                    if r != Verdict::NoMatch {
                        return Ok(r);
                    }
                    at = bracket_ket(self.code, at + 1, self.fmt) + 1 + lb;
                }
                Instr::BraMinZero => {
                    let after =
                        bracket_ket(self.code, at + 1, self.fmt) + 1 + lb;
                    let r =
                        self.rmatch(after, pos, offset_top, depth + 1)?;
                    if r != Verdict::NoMatch {
                        return Ok(r);
                    }
                    at += 1;
                }
                Instr::SkipZero => {
                    at = bracket_ket(self.code, at + 1, self.fmt) + 1 + lb;
                }

                // ----- lookaround ------------------------------------
                Instr::Assert(_) | Instr::AssertBack(_) => {
                    let (matched, top) =
                        self.match_assert(at, pos, offset_top, depth)?;
                    if !matched {
                        return Ok(Verdict::NoMatch);
                    }
                    // captures from a successful lookaround persist
                    offset_top = offset_top.max(top);
                    at = bracket_ket(self.code, at, self.fmt) + 1 + lb;
                }
                Instr::AssertNot(_) | Instr::AssertBackNot(_) => {
                    let (matched, _) =
                        self.match_assert(at, pos, offset_top, depth)?;
                    if matched {
                        return Ok(Verdict::NoMatch);
                    }
                    at = bracket_ket(self.code, at, self.fmt) + 1 + lb;
                }
                Instr::Reverse(n) => {
                    match self.step_back(pos, n) {
                        Some(p) => pos = p,
                        None => return Ok(Verdict::NoMatch),
                    }
                    at += len;
                }

                // ----- subroutine calls ------------------------------
                Instr::Recurse(target) => {
                    return self.match_recurse(
                        at, target, pos, offset_top, depth,
                    );
                }

                // ----- verbs -----------------------------------------
                Instr::Fail => return Ok(Verdict::NoMatch),
                Instr::Accept => {
                    // close every open group as if its KET were here
                    for i in 0..self.group_stack.len() {
                        let frame = self.group_stack[i];
                        if let Some(n) = frame.group {
                            let slot = 2 * n as usize;
                            self.caps[slot] = frame.subject_start;
                            self.caps[slot + 1] = pos;
                            offset_top = offset_top.max(slot + 2);
                        }
                    }
                    self.local_end = pos;
                    self.local_top = offset_top;
                    self.accepted = true;
                    return Ok(Verdict::Match);
                }
                Instr::Commit | Instr::Prune | Instr::Skip
                | Instr::Then => {
                    let r =
                        self.rmatch(at + len, pos, offset_top, depth + 1)?;
                    if r != Verdict::NoMatch {
                        return Ok(r);
                    }
                    return Ok(match instr {
                        Instr::Commit => Verdict::Commit,
                        Instr::Prune => Verdict::Prune,
                        Instr::Skip => Verdict::Skip(pos),
                        _ => Verdict::Then,
                    });
                }

                // condition payloads are inspected by the COND handler,
                // never executed
                Instr::CRef(_) | Instr::RRef(_) | Instr::Def => at += len,

                _ => return Err(MatchError::Internal),
            }
        }
    }

    /// Greedy unbounded or bounded repeat of a single item: consume as
    /// many as possible, then give repetitions back one at a time.
    fn max_repeat(
        &mut self,
        at: usize,
        oplen: usize,
        pos: usize,
        offset_top: usize,
        depth: u32,
        min_one: bool,
        max: Option<usize>,
    ) -> Result<Verdict, MatchError> {
        let item_at = at + oplen;
        let (item, item_len) = decode(self.code, item_at, self.fmt);
        let after = item_at + item_len;

        let mut ends: SmallVec<[usize; 16]> = SmallVec::new();
        ends.push(pos);
        let mut p = pos;
        while max.map_or(true, |m| ends.len() <= m) {
            match self.match_item(&item, p, offset_top) {
                Some(next) if next != p => {
                    ends.push(next);
                    p = next;
                }
                _ => break,
            }
        }
        if min_one && ends.len() < 2 {
            return Ok(Verdict::NoMatch);
        }
        let floor = usize::from(min_one);
        for (i, &end) in ends.iter().enumerate().rev() {
            if i < floor {
                break;
            }
            let r = self.rmatch(after, end, offset_top, depth + 1)?;
            if r != Verdict::NoMatch {
                return Ok(r);
            }
        }
        Ok(Verdict::NoMatch)
    }

    /// Lazy repeat: try the continuation before each additional
    /// repetition.
    fn min_repeat(
        &mut self,
        at: usize,
        oplen: usize,
        mut pos: usize,
        offset_top: usize,
        depth: u32,
        min_one: bool,
        max: Option<usize>,
    ) -> Result<Verdict, MatchError> {
        let item_at = at + oplen;
        let (item, item_len) = decode(self.code, item_at, self.fmt);
        let after = item_at + item_len;

        let mut count = 0usize;
        if min_one {
            match self.match_item(&item, pos, offset_top) {
                Some(next) => {
                    pos = next;
                    count = 1;
                }
                None => return Ok(Verdict::NoMatch),
            }
        }
        loop {
            let r = self.rmatch(after, pos, offset_top, depth + 1)?;
            if r != Verdict::NoMatch {
                return Ok(r);
            }
            if max.is_some_and(|m| count >= m) {
                return Ok(Verdict::NoMatch);
            }
            match self.match_item(&item, pos, offset_top) {
                Some(next) if next != pos => {
                    pos = next;
                    count += 1;
                }
                _ => return Ok(Verdict::NoMatch),
            }
        }
    }

    /// Runs the body of an atomic group as a local match. On `Match`
    /// the end position and capture mark are in `local_end` and
    /// `local_top`.
    fn match_once_body(
        &mut self,
        at: usize,
        pos: usize,
        offset_top: usize,
        depth: u32,
    ) -> Result<Verdict, MatchError> {
        for s in branch_starts(self.code, at, self.fmt) {
            let saved = self.group_stack.len();
            let r = self.rmatch(s, pos, offset_top, depth + 1)?;
            self.group_stack.truncate(saved);
            match r {
                Verdict::Match => return Ok(Verdict::Match),
                Verdict::NoMatch | Verdict::Then => {}
                other => return Ok(other),
            }
        }
        Ok(Verdict::NoMatch)
    }

    /// A quantified atomic group: each iteration is atomic, but the
    /// iteration count itself backtracks.
    fn repeat_once(
        &mut self,
        at: usize,
        ket: usize,
        pos: usize,
        offset_top: usize,
        depth: u32,
    ) -> Result<Verdict, MatchError> {
        let lb = self.fmt.link_bytes();
        let after = ket + 1 + lb;
        match self.match_once_body(at, pos, offset_top, depth)? {
            Verdict::Match if self.accepted => return Ok(Verdict::Match),
            Verdict::Match => {}
            other => return Ok(other),
        }
        if self.code[ket] == OP_KETRMIN {
            let (mut p, mut t) = (self.local_end, self.local_top);
            loop {
                let r =
                    self.rmatch(after, p, offset_top.max(t), depth + 1)?;
                if r != Verdict::NoMatch {
                    return Ok(r);
                }
                let prev = p;
                match self
                    .match_once_body(at, p, offset_top.max(t), depth)?
                {
                    Verdict::Match if self.accepted => {
                        return Ok(Verdict::Match);
                    }
                    Verdict::Match if self.local_end != prev => {
                        p = self.local_end;
                        t = self.local_top;
                    }
                    Verdict::Match | Verdict::NoMatch => {
                        return Ok(Verdict::NoMatch);
                    }
                    other => return Ok(other),
                }
            }
        }
        let mut ends: SmallVec<[(usize, usize); 16]> = SmallVec::new();
        ends.push((self.local_end, self.local_top));
        loop {
            let (p, t) = match ends.last() {
                Some(&e) => e,
                None => break,
            };
            match self.match_once_body(at, p, offset_top.max(t), depth)? {
                Verdict::Match if self.accepted => {
                    return Ok(Verdict::Match);
                }
                Verdict::Match if self.local_end != p => {
                    ends.push((self.local_end, self.local_top));
                }
                Verdict::Match | Verdict::NoMatch => break,
                other => return Ok(other),
            }
        }
        for &(p, t) in ends.iter().rev() {
            let r = self.rmatch(after, p, offset_top.max(t), depth + 1)?;
            if r != Verdict::NoMatch {
                return Ok(r);
            }
        }
        Ok(Verdict::NoMatch)
    }

    /// Tries the branches of an ordinary (possibly capturing) bracket.
    fn match_bracket(
        &mut self,
        at: usize,
        pos: usize,
        offset_top: usize,
        depth: u32,
    ) -> Result<Verdict, MatchError> {
        let lb = self.fmt.link_bytes();
        let group = match self.code[at] {
            OP_CBRA | OP_SCBRA => {
                Some(read_u16(self.code, at + 1 + lb))
            }
            _ => None,
        };
        let saved_caps = group.map(|n| {
            let slot = 2 * n as usize;
            (self.caps[slot], self.caps[slot + 1])
        });
        let saved_len = self.group_stack.len();

        let mut last_then = false;
        for s in branch_starts(self.code, at, self.fmt) {
            self.group_stack.truncate(saved_len);
            self.group_stack.push(GroupFrame {
                bracket_at: at,
                subject_start: pos,
                group,
            });
            let r = self.rmatch(s, pos, offset_top, depth + 1)?;
            match r {
                Verdict::Match => return Ok(Verdict::Match),
                // a THEN is consumed by moving to the next branch
                Verdict::NoMatch => last_then = false,
                Verdict::Then => last_then = true,
                other => {
                    self.group_stack.truncate(saved_len);
                    return Ok(other);
                }
            }
            if let (Some(n), Some((a, b))) = (group, saved_caps) {
                let slot = 2 * n as usize;
                self.caps[slot] = a;
                self.caps[slot + 1] = b;
            }
        }
        self.group_stack.truncate(saved_len);
        // a THEN in the last branch still has outer alternatives to skip
        Ok(if last_then {
            Verdict::Then
        } else {
            Verdict::NoMatch
        })
    }

    /// Conditional group: evaluate the condition, then commit to the
    /// yes or no branch with no backtracking between them.
    fn match_cond(
        &mut self,
        at: usize,
        pos: usize,
        offset_top: usize,
        depth: u32,
    ) -> Result<Verdict, MatchError> {
        let lb = self.fmt.link_bytes();
        let payload_at = at + 1 + lb;
        let (payload, payload_len) = decode(self.code, payload_at, self.fmt);
        let (cond, yes_start) = match payload {
            Instr::CRef(n) => (
                self.group_is_set(n, offset_top),
                payload_at + payload_len,
            ),
            Instr::RRef(n) => {
                let active = if n == RREF_ANY {
                    !self.recursion.is_empty()
                } else {
                    self.recursion
                        .last()
                        .is_some_and(|r| r.group == n)
                };
                (active, payload_at + payload_len)
            }
            Instr::Def => (false, payload_at + payload_len),
            Instr::Assert(_)
            | Instr::AssertNot(_)
            | Instr::AssertBack(_)
            | Instr::AssertBackNot(_) => {
                let (matched, top) = self
                    .match_assert(payload_at, pos, offset_top, depth)?;
                let negated = matches!(
                    self.code[payload_at],
                    OP_ASSERT_NOT | OP_ASSERTBACK_NOT
                );
                let cond = matched != negated;
                let after =
                    bracket_ket(self.code, payload_at, self.fmt) + 1 + lb;
                if cond && !negated {
                    return self.run_cond_branch(
                        at,
                        after,
                        pos,
                        offset_top.max(top),
                        depth,
                        true,
                    );
                }
                (cond, after)
            }
            _ => return Err(MatchError::Internal),
        };
        self.run_cond_branch(at, yes_start, pos, offset_top, depth, cond)
    }

    fn run_cond_branch(
        &mut self,
        at: usize,
        yes_start: usize,
        pos: usize,
        offset_top: usize,
        depth: u32,
        cond: bool,
    ) -> Result<Verdict, MatchError> {
        let lb = self.fmt.link_bytes();
        let starts = branch_starts(self.code, at, self.fmt);
        let branch = if cond {
            Some(yes_start)
        } else {
            starts.get(1).copied()
        };
        match branch {
            Some(s) => {
                let saved = self.group_stack.len();
                self.group_stack.push(GroupFrame {
                    bracket_at: at,
                    subject_start: pos,
                    group: None,
                });
                let r = self.rmatch(s, pos, offset_top, depth + 1)?;
                if r != Verdict::Match {
                    self.group_stack.truncate(saved);
                }
                Ok(r)
            }
            // no branch for a false condition: continue past the KET
            None => {
                let ket = bracket_ket(self.code, at, self.fmt);
                self.rmatch(ket + 1 + lb, pos, offset_top, depth + 1)
            }
        }
    }

    /// Runs a lookaround's branches as a local match. Returns whether it
    /// matched and the capture high-water mark it reached.
    fn match_assert(
        &mut self,
        at: usize,
        pos: usize,
        offset_top: usize,
        depth: u32,
    ) -> Result<(bool, usize), MatchError> {
        let saved_accept = self.accepted;
        self.accepted = false;
        let mut result = (false, offset_top);
        for s in branch_starts(self.code, at, self.fmt) {
            let saved = self.group_stack.len();
            let r = self.rmatch(s, pos, offset_top, depth + 1)?;
            self.group_stack.truncate(saved);
            match r {
                Verdict::Match => {
                    result = (true, self.local_top);
                    break;
                }
                Verdict::NoMatch | Verdict::Then => {}
                // verbs do not escape an assertion
                Verdict::Prune | Verdict::Commit | Verdict::Skip(_) => {
                    break;
                }
            }
        }
        self.accepted = saved_accept;
        Ok(result)
    }

    /// A subroutine call: run the target group as an atomic local
    /// match, then continue after the call. Captures committed by a
    /// successful call remain set; a failed call restores the saved
    /// vector.
    fn match_recurse(
        &mut self,
        at: usize,
        target: usize,
        pos: usize,
        offset_top: usize,
        depth: u32,
    ) -> Result<Verdict, MatchError> {
        let lb = self.fmt.link_bytes();
        let group = match self.code[target] {
            OP_CBRA | OP_SCBRA => read_u16(self.code, target + 1 + lb),
            _ => 0,
        };
        let saved_caps: SmallVec<[usize; 32]> =
            SmallVec::from_slice(&self.caps);
        let saved_accept = self.accepted;
        let saved_frames = self.group_stack.len();
        self.accepted = false;
        self.recursion.push(Recursion { target, group });
        let r = self.rmatch(target, pos, offset_top, depth + 1)?;
        self.recursion.pop();
        self.group_stack.truncate(saved_frames);
        self.accepted = saved_accept;
        match r {
            Verdict::Match => {
                // Captures committed inside the call stay visible after
                // it returns; everything else backtracks normally.
                let end = self.local_end;
                let top = offset_top.max(self.local_top);
                let r = self.rmatch(at + 1 + lb, end, top, depth + 1)?;
                if r != Verdict::Match {
                    self.caps.copy_from_slice(&saved_caps);
                }
                Ok(r)
            }
            other => {
                self.caps.copy_from_slice(&saved_caps);
                Ok(other)
            }
        }
    }

    /// Local-termination check for a closing KET: the body of a
    /// lookaround, an atomic group, or the innermost active subroutine
    /// call ends here rather than continuing into the enclosing code.
    fn close_local(
        &mut self,
        bracket_at: usize,
        pos: usize,
        offset_top: usize,
    ) -> Option<Verdict> {
        let local = match self.code[bracket_at] {
            OP_ASSERT | OP_ASSERT_NOT | OP_ASSERTBACK
            | OP_ASSERTBACK_NOT | OP_ONCE => true,
            _ => self
                .recursion
                .last()
                .is_some_and(|r| r.target == bracket_at),
        };
        if local {
            let mut top = offset_top;
            if matches!(self.code[bracket_at], OP_CBRA | OP_SCBRA) {
                top = self.commit_group(pos, offset_top);
            }
            self.local_end = pos;
            self.local_top = top;
            Some(Verdict::Match)
        } else {
            None
        }
    }

    /// Commits the capture of the group on top of the frame stack.
    /// Returns the updated high-water mark. Non-capturing frames are
    /// left for the caller to pop.
    fn commit_group(&mut self, pos: usize, offset_top: usize) -> usize {
        match self.group_stack.last() {
            Some(frame) => {
                if let Some(n) = frame.group {
                    let slot = 2 * n as usize;
                    self.caps[slot] = frame.subject_start;
                    self.caps[slot + 1] = pos;
                    return offset_top.max(slot + 2);
                }
                offset_top
            }
            None => offset_top,
        }
    }

    fn group_is_set(&self, n: u16, offset_top: usize) -> bool {
        let slot = 2 * n as usize;
        slot + 1 < offset_top && self.caps[slot] != UNSET
    }

    // ----- single items ----------------------------------------------

    /// Matches one consuming instruction at `pos`, returning the new
    /// position. Sets `hit_end` when the item failed only because the
    /// subject ran out.
    fn match_item(
        &mut self,
        item: &Instr,
        pos: usize,
        offset_top: usize,
    ) -> Option<usize> {
        let subject = self.subject;
        let len = subject.len();
        match *item {
            Instr::Ref(n) => self.match_ref(n, pos, offset_top, false),
            Instr::RefI(n) => self.match_ref(n, pos, offset_top, true),
            _ if pos >= len => {
                self.hit_end = true;
                None
            }
            Instr::Char(c) => {
                let mut buf = [0u8; 4];
                let bytes: &[u8] = if self.fmt.utf {
                    c.encode_utf8(&mut buf).as_bytes()
                } else {
                    buf[0] = c as u8;
                    &buf[..1]
                };
                let avail = len - pos;
                if avail < bytes.len() {
                    if subject[pos..] == bytes[..avail] {
                        self.hit_end = true;
                    }
                    return None;
                }
                if &subject[pos..pos + bytes.len()] == bytes {
                    Some(pos + bytes.len())
                } else {
                    None
                }
            }
            Instr::CharI(c) => {
                let (sc, clen) = self.subject_char(pos);
                if self.chars_eq_ci(c, sc) {
                    Some(pos + clen)
                } else {
                    None
                }
            }
            Instr::NotChar(c) => {
                let (sc, clen) = self.subject_char(pos);
                if sc != c {
                    Some(pos + clen)
                } else {
                    None
                }
            }
            Instr::NotCharI(c) => {
                let (sc, clen) = self.subject_char(pos);
                if !self.chars_eq_ci(c, sc) {
                    Some(pos + clen)
                } else {
                    None
                }
            }
            Instr::Any => {
                if self.newline_len_at(pos).is_some() {
                    return None;
                }
                let (_, clen) = self.subject_char(pos);
                Some(pos + clen)
            }
            Instr::AllAny => {
                let (_, clen) = self.subject_char(pos);
                Some(pos + clen)
            }
            Instr::AnyByte => Some(pos + 1),
            Instr::AnyNl => self.match_anynl(pos),
            Instr::HSpace | Instr::NotHSpace => {
                let (sc, clen) = self.subject_char(pos);
                let is = is_hspace_char(sc);
                if is == matches!(*item, Instr::HSpace) {
                    Some(pos + clen)
                } else {
                    None
                }
            }
            Instr::VSpace | Instr::NotVSpace => {
                let (sc, clen) = self.subject_char(pos);
                let is = is_vspace_char(sc);
                if is == matches!(*item, Instr::VSpace) {
                    Some(pos + clen)
                } else {
                    None
                }
            }
            Instr::Digit | Instr::NotDigit => {
                let (sc, clen) = self.subject_char(pos);
                let is = (sc as u32) < 0x100
                    && tables::is_digit(sc as u8);
                if is == matches!(*item, Instr::Digit) {
                    Some(pos + clen)
                } else {
                    None
                }
            }
            Instr::Whitespace | Instr::NotWhitespace => {
                let (sc, clen) = self.subject_char(pos);
                let is = (sc as u32) < 0x100
                    && tables::is_space(sc as u8);
                if is == matches!(*item, Instr::Whitespace) {
                    Some(pos + clen)
                } else {
                    None
                }
            }
            Instr::Wordchar | Instr::NotWordchar => {
                let (sc, clen) = self.subject_char(pos);
                let is = (sc as u32) < 0x100
                    && tables::is_word(sc as u8);
                if is == matches!(*item, Instr::Wordchar) {
                    Some(pos + clen)
                } else {
                    None
                }
            }
            Instr::Prop(cat) | Instr::NotProp(cat) => {
                let (sc, clen) = self.subject_char(pos);
                let is = Category::from_code(cat)
                    .map_or(false, |c| c.contains(sc));
                if is == matches!(*item, Instr::Prop(_)) {
                    Some(pos + clen)
                } else {
                    None
                }
            }
            Instr::Class(map) | Instr::NClass(map) => {
                let (sc, clen) = self.subject_char(pos);
                let v = sc as u32;
                let matched = if v < 0x100 {
                    crate::instr::class_contains(map, v as u8)
                } else {
                    // wide characters match only a negated class
                    matches!(*item, Instr::NClass(_))
                };
                if matched {
                    Some(pos + clen)
                } else {
                    None
                }
            }
            Instr::XClass(xcl) => {
                let (sc, clen) = self.subject_char(pos);
                if xcl.contains(sc) {
                    Some(pos + clen)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn match_ref(
        &mut self,
        n: u16,
        pos: usize,
        offset_top: usize,
        caseless: bool,
    ) -> Option<usize> {
        if !self.group_is_set(n, offset_top) {
            // an unset group: fail, or match empty in JavaScript mode
            return if self.prog.options.js_compat {
                Some(pos)
            } else {
                None
            };
        }
        let slot = 2 * n as usize;
        let (from, to) = (self.caps[slot], self.caps[slot + 1]);
        let needed = to - from;
        let avail = self.subject.len() - pos;
        let compare = needed.min(avail);
        let matches = if caseless {
            self.eq_folded_range(from, pos, compare)
        } else {
            self.subject[from..from + compare]
                == self.subject[pos..pos + compare]
        };
        if !matches {
            return None;
        }
        if avail < needed {
            self.hit_end = true;
            return None;
        }
        Some(pos + needed)
    }

    /// Case-insensitive character comparison: Unicode folding in UTF
    /// mode, the folding table otherwise.
    #[inline]
    fn chars_eq_ci(&self, a: char, b: char) -> bool {
        if self.fmt.utf {
            chars_eq_folded(a, b)
        } else {
            tables::fold(a as u8) == tables::fold(b as u8)
        }
    }

    fn eq_folded_range(&self, mut a: usize, mut b: usize, len: usize) -> bool {
        let end = a + len;
        while a < end {
            if self.fmt.utf {
                let (ca, la) = read_char_operand(self.subject, a, true);
                let (cb, lbn) = read_char_operand(self.subject, b, true);
                if !chars_eq_folded(ca, cb) {
                    return false;
                }
                a += la;
                b += lbn;
            } else {
                if tables::fold(self.subject[a])
                    != tables::fold(self.subject[b])
                {
                    return false;
                }
                a += 1;
                b += 1;
            }
        }
        true
    }

    fn match_anynl(&mut self, pos: usize) -> Option<usize> {
        let subject = self.subject;
        match subject[pos] {
            b'\r' => {
                if pos + 1 < subject.len() && subject[pos + 1] == b'\n' {
                    Some(pos + 2)
                } else {
                    if pos + 1 == subject.len() {
                        // a CRLF could still complete
                        self.hit_end = true;
                    }
                    Some(pos + 1)
                }
            }
            b'\n' => Some(pos + 1),
            b'\x0B' | b'\x0C'
                if self.prog.options.bsr == Bsr::Unicode && !self.fmt.utf =>
            {
                Some(pos + 1)
            }
            0x85 if self.prog.options.bsr == Bsr::Unicode
                && !self.fmt.utf =>
            {
                Some(pos + 1)
            }
            _ if self.prog.options.bsr == Bsr::Unicode && self.fmt.utf => {
                let (c, clen) = self.subject_char(pos);
                match c {
                    '\x0B' | '\x0C' | '\u{85}' | '\u{2028}'
                    | '\u{2029}' => Some(pos + clen),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Decodes the subject character at `pos`, which must be in range.
    #[inline]
    fn subject_char(&self, pos: usize) -> (char, usize) {
        read_char_operand(self.subject, pos, self.fmt.utf)
    }

    /// Steps back `n` characters for a lookbehind, `None` when the
    /// subject start is in the way.
    fn step_back(&self, mut pos: usize, n: usize) -> Option<usize> {
        if !self.fmt.utf {
            return pos.checked_sub(n);
        }
        for _ in 0..n {
            pos = pos.checked_sub(1)?;
            while pos > 0 && self.subject[pos] & 0xC0 == 0x80 {
                pos -= 1;
            }
        }
        Some(pos)
    }

    // ----- newline conventions ---------------------------------------

    /// Length of the newline sequence starting at `pos`, if any.
    pub(crate) fn newline_len_at(&self, pos: usize) -> Option<usize> {
        let subject = self.subject;
        if pos >= subject.len() {
            return None;
        }
        let b = subject[pos];
        let crlf = pos + 1 < subject.len()
            && b == b'\r'
            && subject[pos + 1] == b'\n';
        match self.prog.options.newline {
            Newline::Cr => (b == b'\r').then_some(1),
            Newline::Lf => (b == b'\n').then_some(1),
            Newline::CrLf => crlf.then_some(2),
            Newline::AnyCrLf => {
                if crlf {
                    Some(2)
                } else {
                    (b == b'\r' || b == b'\n').then_some(1)
                }
            }
            Newline::Any => {
                if crlf {
                    return Some(2);
                }
                match b {
                    b'\r' | b'\n' | 0x0B | 0x0C => Some(1),
                    0x85 if !self.fmt.utf => Some(1),
                    _ if self.fmt.utf => {
                        let (c, clen) = self.subject_char(pos);
                        matches!(c, '\u{85}' | '\u{2028}' | '\u{2029}')
                            .then_some(clen)
                    }
                    _ => None,
                }
            }
        }
    }

    /// True when `pos` immediately follows a newline.
    fn after_newline(&self, pos: usize) -> bool {
        let subject = self.subject;
        if pos == 0 {
            return false;
        }
        let prev = subject[pos - 1];
        match self.prog.options.newline {
            Newline::Cr => prev == b'\r',
            Newline::Lf => prev == b'\n',
            Newline::CrLf => {
                pos >= 2 && prev == b'\n' && subject[pos - 2] == b'\r'
            }
            Newline::AnyCrLf => prev == b'\r' || prev == b'\n',
            Newline::Any => match prev {
                b'\r' | b'\n' | 0x0B | 0x0C => true,
                0x85 if !self.fmt.utf => true,
                _ if self.fmt.utf => {
                    (pos >= 2
                        && subject[pos - 2] == 0xC2
                        && prev == 0x85)
                        || (pos >= 3
                            && subject[pos - 3] == 0xE2
                            && subject[pos - 2] == 0x80
                            && (prev == 0xA8 || prev == 0xA9))
                }
                _ => false,
            },
        }
    }

    /// True at the subject end, or just before one trailing newline.
    fn at_subject_end(&self, pos: usize) -> bool {
        let len = self.subject.len();
        if pos == len {
            return true;
        }
        match self.newline_len_at(pos) {
            Some(nl) => pos + nl == len,
            None => false,
        }
    }
}

/// Horizontal whitespace, including the Unicode set above the byte
/// range.
fn is_hspace_char(c: char) -> bool {
    if (c as u32) < 0x100 {
        return tables::is_hspace(c as u8);
    }
    matches!(
        c,
        '\u{1680}'
            | '\u{180E}'
            | '\u{2000}'..='\u{200A}'
            | '\u{202F}'
            | '\u{205F}'
            | '\u{3000}'
    )
}

/// Vertical whitespace.
fn is_vspace_char(c: char) -> bool {
    if (c as u32) < 0x100 {
        return tables::is_vspace(c as u8);
    }
    matches!(c, '\u{2028}' | '\u{2029}')
}
