/*!
Running compiled patterns against subjects.

[`Program::exec`] validates the subject and start offset, then drives
the bump-along loop: a match attempt is made at each candidate start
position, moving the start one character forward after each failure
until the subject is exhausted or an attempt succeeds. A handful of
facts recorded at compile time prune candidate positions before any
attempt is made: a known first byte is located with `memchr`, a pattern
that can only match at a line start jumps between newlines, a required
byte that is absent from the remaining subject abandons the search, and
a minimum match length bounds how close to the end an attempt is still
worth making.

The attempt itself is the backtracking interpreter in [`backtrack`].
*/

use std::ops::Range;

use memchr::{memchr, memchr2};

use crate::errors::MatchError;
use crate::instr::utf8_len;
use crate::options::ExecOptions;
use crate::program::{
    Program, PF_ANCHORED, PF_NO_PARTIAL, PF_STARTLINE,
};

mod backtrack;
#[cfg(test)]
mod tests;

use backtrack::{MatchContext, Verdict, UNSET};

/// The result of running a pattern against a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A match was found; its captures are recorded here.
    Match(Captures),
    NoMatch,
    /// No complete match, but a match was still in progress when the
    /// subject ran out. The offset is where the partial match starts.
    /// Only reported when [`ExecOptions::partial`] is set.
    Partial(usize),
}

impl Outcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Outcome::Match(_))
    }
}

/// Capture offsets from a successful match. Group 0 is the whole
/// match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captures {
    ovec: Vec<usize>,
    top: usize,
}

impl Captures {
    /// The span captured by group `n`, or `None` if the group did not
    /// participate in the match.
    pub fn get(&self, n: usize) -> Option<Range<usize>> {
        let slot = 2 * n;
        if slot + 1 >= self.top || self.ovec.get(slot).copied()? == UNSET
        {
            return None;
        }
        Some(self.ovec[slot]..self.ovec[slot + 1])
    }

    /// The span captured by the named group. With duplicate names
    /// allowed, the first participating group of that name wins.
    pub fn name(&self, prog: &Program, name: &str) -> Option<Range<usize>> {
        prog.group_numbers(name)
            .iter()
            .find_map(|&n| self.get(n as usize))
    }

    /// Number of capturing groups, including group 0.
    pub fn len(&self) -> usize {
        self.ovec.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Program {
    /// Runs the pattern against `subject`, looking for a match at or
    /// after `start`.
    pub fn exec(
        &self,
        subject: &[u8],
        start: usize,
        options: &ExecOptions,
    ) -> Result<Outcome, MatchError> {
        if options.partial && self.flags & PF_NO_PARTIAL != 0 {
            return Err(MatchError::BadOption);
        }
        let utf = self.options.utf;
        if utf && !self.options.no_utf_check && !options.no_utf_check {
            if let Err(e) = std::str::from_utf8(subject) {
                return Err(MatchError::BadSubjectUtf8(e.valid_up_to()));
            }
        }
        if start > subject.len()
            || (utf
                && start < subject.len()
                && subject[start] & 0xC0 == 0x80)
        {
            return Err(MatchError::BadStartOffset);
        }

        let anchored = options.anchored || self.flags & PF_ANCHORED != 0;
        // a partial match may be shorter than any complete one, so the
        // pruning shortcuts are unsound for it
        let prune = !options.partial && !anchored;

        let mut ctx = MatchContext::new(self, subject, options, start);
        let mut start_pos = start;
        let mut partial_at: Option<usize> = None;
        let mut req_found: Option<usize> = None;
        let firstline_limit = if self.options.firstline {
            Some(self.line_end(&ctx, subject, start))
        } else {
            None
        };

        loop {
            if prune {
                match self.prune_start(
                    &ctx, subject, start_pos, &mut req_found,
                ) {
                    Some(p) => start_pos = p,
                    None => break,
                }
            }
            if firstline_limit.is_some_and(|lim| start_pos > lim) {
                break;
            }
            if start_pos > subject.len() {
                break;
            }

            ctx.hit_end = false;
            let verdict = ctx.attempt(start_pos)?;
            let mut skip_to = None;
            match verdict {
                Verdict::Match
                    if !(options.not_empty && ctx.end == start_pos) =>
                {
                    let mut ovec = ctx.caps.clone();
                    ovec[0] = start_pos;
                    ovec[1] = ctx.end;
                    return Ok(Outcome::Match(Captures {
                        ovec,
                        top: ctx.final_top,
                    }));
                }
                // an empty match with NOTEMPTY set counts as a failure
                Verdict::Match => {}
                Verdict::NoMatch | Verdict::Prune | Verdict::Then => {}
                Verdict::Skip(p) => skip_to = Some(p),
                Verdict::Commit => {
                    if ctx.hit_end && partial_at.is_none() {
                        partial_at = Some(start_pos);
                    }
                    break;
                }
            }
            if ctx.hit_end && partial_at.is_none() {
                partial_at = Some(start_pos);
            }
            if anchored || start_pos >= subject.len() {
                break;
            }
            let bumped = self.bump(&ctx, subject, start_pos);
            start_pos = match skip_to {
                Some(p) if p > bumped => p,
                _ => bumped,
            };
        }

        match partial_at {
            Some(p) if options.partial => Ok(Outcome::Partial(p)),
            _ => Ok(Outcome::NoMatch),
        }
    }

    /// Advances the attempt start past positions that cannot begin a
    /// match, or reports that no position remains.
    fn prune_start(
        &self,
        ctx: &MatchContext,
        subject: &[u8],
        mut pos: usize,
        req_found: &mut Option<usize>,
    ) -> Option<usize> {
        if self.flags & PF_STARTLINE != 0 && pos > 0 {
            // a newline sequence of any width may end exactly at `pos`
            let at_line_start = (1..=3).any(|k| {
                pos >= k && ctx.newline_len_at(pos - k) == Some(k)
            });
            if !at_line_start {
                pos = self.next_line_start(ctx, subject, pos)?;
            }
        } else if let Some((b, caseless)) = self.first_byte {
            let haystack = subject.get(pos..)?;
            let off = if caseless {
                memchr2(
                    b.to_ascii_lowercase(),
                    b.to_ascii_uppercase(),
                    haystack,
                )
            } else {
                memchr(b, haystack)
            }?;
            pos += off;
        } else if let Some(bits) = self.start_bits.as_deref() {
            while pos < subject.len() && !bits[subject[pos] as usize] {
                pos += 1;
            }
            if pos >= subject.len() && self.min_length > 0 {
                return None;
            }
        }
        if subject.len() - pos < self.min_length as usize {
            return None;
        }
        if let Some((b, caseless)) = self.req_byte {
            // a byte every match must contain somewhere: remember where
            // it was last seen so failed attempts don't rescan
            if req_found.map_or(true, |p| p < pos) {
                let haystack = &subject[pos..];
                let off = if caseless {
                    memchr2(
                        b.to_ascii_lowercase(),
                        b.to_ascii_uppercase(),
                        haystack,
                    )
                } else {
                    memchr(b, haystack)
                }?;
                *req_found = Some(pos + off);
            }
        }
        Some(pos)
    }

    /// One bump-along step: a whole character, and never into the
    /// middle of a CRLF pair when the newline convention contains it.
    fn bump(
        &self,
        ctx: &MatchContext,
        subject: &[u8],
        pos: usize,
    ) -> usize {
        if ctx.newline_len_at(pos) == Some(2) {
            return pos + 2;
        }
        if self.options.utf {
            pos + utf8_len(subject[pos])
        } else {
            pos + 1
        }
    }

    /// The position just past the newline that follows `from`, i.e. the
    /// start of the next line.
    fn next_line_start(
        &self,
        ctx: &MatchContext,
        subject: &[u8],
        from: usize,
    ) -> Option<usize> {
        let mut p = from;
        loop {
            if p >= subject.len() {
                return None;
            }
            if let Some(nl) = ctx.newline_len_at(p) {
                return Some(p + nl);
            }
            p = self.bump(ctx, subject, p);
        }
    }

    /// End of the line containing `from`; a match restricted to the
    /// first line must start at or before this.
    fn line_end(
        &self,
        ctx: &MatchContext,
        subject: &[u8],
        from: usize,
    ) -> usize {
        let mut p = from;
        while p < subject.len() {
            if ctx.newline_len_at(p).is_some() {
                return p;
            }
            p = self.bump(ctx, subject, p);
        }
        p
    }
}
