/*! Compile-time and match-time options.

Options are split in two groups, mirroring the two entry points of the
engine: [`CompileOptions`] are resolved once, when the pattern is compiled,
and become part of the compiled [`Program`](crate::Program);
[`ExecOptions`] are provided on every call to
[`Program::exec`](crate::Program::exec) and overlay the compile-time ones
for that call only.
*/

/// Newline conventions recognized by the engine.
///
/// The convention affects the behavior of `.`, `^` and `$` (in multiline
/// mode), and the bumpalong loop, which never retries a match between the
/// CR and the LF of a CRLF pair when the convention treats CRLF as a single
/// newline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Newline {
    /// Only CR (`\r`) is a newline.
    Cr,
    /// Only LF (`\n`) is a newline. This is the default.
    #[default]
    Lf,
    /// Only the CRLF sequence is a newline.
    CrLf,
    /// CR, LF and CRLF are newlines.
    AnyCrLf,
    /// Any Unicode newline sequence: CR, LF, CRLF, VT, FF, NEL, LS, PS.
    Any,
}

/// Conventions for what `\R` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bsr {
    /// `\R` matches CR, LF or CRLF.
    AnyCrLf,
    /// `\R` matches any Unicode newline sequence. This is the default.
    #[default]
    Unicode,
}

/// Width of the link fields used by jump/bracket offsets in the compiled
/// instruction stream.
///
/// The link width bounds the maximum size of a compiled program: 64KB with
/// 2-byte links, 16MB with 3-byte links and 1GB with 4-byte links. Every
/// link field in a program uses the same width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkSize {
    #[default]
    Two,
    Three,
    Four,
}

impl LinkSize {
    /// Number of bytes occupied by one link field.
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            LinkSize::Two => 2,
            LinkSize::Three => 3,
            LinkSize::Four => 4,
        }
    }

    /// Largest value representable in a link field, which is also the
    /// maximum size of a compiled program using this link width.
    #[inline]
    pub fn max_value(self) -> usize {
        match self {
            LinkSize::Two => 0xFFFF,
            LinkSize::Three => 0xFF_FFFF,
            LinkSize::Four => 0x3FFF_FFFF,
        }
    }
}

/// Options for [`compile`](crate::compile).
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Letters match both their cases.
    pub case_insensitive: bool,
    /// `^` and `$` match at internal newlines too.
    pub multiline: bool,
    /// `.` matches newline characters.
    pub dot_all: bool,
    /// Free-spacing mode: unescaped whitespace in the pattern is ignored
    /// and `#` starts a comment that runs to the end of the line.
    pub extended: bool,
    /// Inverts the greediness of quantifiers: `*` becomes lazy and `*?`
    /// becomes greedy. Possessive quantifiers are not affected.
    pub ungreedy: bool,
    /// Plain parentheses do not capture; only named groups do.
    pub no_auto_capture: bool,
    /// Allows two named groups to share a name.
    pub dup_names: bool,
    /// The pattern and subjects are UTF-8; all cursor movement is
    /// character-wise.
    pub utf: bool,
    /// Skips the UTF-8 validity check of the pattern.
    pub no_utf_check: bool,
    /// The match is constrained to start where matching starts.
    pub anchored: bool,
    /// An unanchored match must start before or at the first newline.
    pub firstline: bool,
    /// `$` matches only at the very end of the subject, never before a
    /// final newline.
    pub dollar_endonly: bool,
    /// A backreference to a group that never matched matches the empty
    /// string, as in JavaScript, instead of failing.
    pub js_compat: bool,
    /// Newline convention.
    pub newline: Newline,
    /// What `\R` matches.
    pub bsr: Bsr,
    /// Width of link fields in the compiled program.
    pub link_size: LinkSize,
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self
    }

    pub fn multiline(mut self, yes: bool) -> Self {
        self.multiline = yes;
        self
    }

    pub fn dot_all(mut self, yes: bool) -> Self {
        self.dot_all = yes;
        self
    }

    pub fn extended(mut self, yes: bool) -> Self {
        self.extended = yes;
        self
    }

    pub fn utf(mut self, yes: bool) -> Self {
        self.utf = yes;
        self
    }

    pub fn js_compat(mut self, yes: bool) -> Self {
        self.js_compat = yes;
        self
    }

    pub fn newline(mut self, newline: Newline) -> Self {
        self.newline = newline;
        self
    }

    pub fn link_size(mut self, link_size: LinkSize) -> Self {
        self.link_size = link_size;
        self
    }
}

/// Default limit for the number of interpreter steps in one `exec` call.
pub const DEFAULT_MATCH_LIMIT: u32 = 1_000_000;

/// Default limit for the backtracking recursion depth in one `exec` call.
pub const DEFAULT_RECURSION_LIMIT: u32 = 10_000;

/// Options for [`Program::exec`](crate::Program::exec).
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// The match must start exactly at the starting offset.
    pub anchored: bool,
    /// The starting offset is not the beginning of a line: `^` does not
    /// match there.
    pub not_bol: bool,
    /// The end of the subject is not the end of a line: `$` does not match
    /// there.
    pub not_eol: bool,
    /// An empty match is not a valid match.
    pub not_empty: bool,
    /// Report a partial match when the subject ends while a match is still
    /// viable.
    pub partial: bool,
    /// Skips the UTF-8 validity check of the subject.
    pub no_utf_check: bool,
    /// Budget of interpreter steps; exceeding it aborts the call with
    /// [`MatchError::MatchLimit`](crate::MatchError::MatchLimit).
    pub match_limit: u32,
    /// Budget of nested backtracking calls; exceeding it aborts the call
    /// with [`MatchError::RecursionLimit`](crate::MatchError::RecursionLimit).
    pub recursion_limit: u32,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            anchored: false,
            not_bol: false,
            not_eol: false,
            not_empty: false,
            partial: false,
            no_utf_check: false,
            match_limit: DEFAULT_MATCH_LIMIT,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anchored(mut self, yes: bool) -> Self {
        self.anchored = yes;
        self
    }

    pub fn partial(mut self, yes: bool) -> Self {
        self.partial = yes;
        self
    }

    pub fn match_limit(mut self, limit: u32) -> Self {
        self.match_limit = limit;
        self
    }

    pub fn recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }
}
