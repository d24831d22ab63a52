use std::fmt::{Display, Formatter};

use thiserror::Error;

/// Kinds of errors that can occur while compiling a pattern.
///
/// Syntax errors carry enough detail to point at the offending construct;
/// the byte offset into the pattern is carried by [`CompileError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileErrorKind {
    #[error("missing closing parenthesis")]
    MissingClosingParen,

    #[error("unmatched closing parenthesis")]
    UnmatchedClosingParen,

    #[error("missing terminating ] for character class")]
    MissingClosingBracket,

    #[error("quantifier does not follow a repeatable item")]
    NothingToRepeat,

    #[error("numbers out of order in {{}} quantifier")]
    QuantifierOutOfOrder,

    #[error("number too big in {{}} quantifier")]
    QuantifierTooBig,

    #[error("range out of order in character class")]
    ClassRangeOutOfOrder,

    #[error("invalid escape sequence")]
    BadEscape,

    #[error("unrecognized character after (?")]
    BadGroupSyntax,

    #[error("syntax error in group name")]
    BadGroupName,

    #[error("two named groups have the same name")]
    DuplicateGroupName,

    #[error("reference to non-existent subpattern")]
    BadReference,

    #[error("unknown POSIX class name")]
    BadPosixClass,

    #[error("unknown property name after \\p or \\P")]
    BadProperty,

    #[error("lookbehind assertion is not fixed length")]
    VariableLengthLookbehind,

    #[error("conditional group contains more than two branches")]
    TooManyConditionBranches,

    #[error("malformed condition")]
    BadCondition,

    #[error("recursive call could loop indefinitely")]
    RecursiveInfiniteLoop,

    #[error("unknown backtracking control verb")]
    BadVerb,

    #[error("pattern is too large")]
    PatternTooLarge,

    #[error("too many capturing groups")]
    TooManyGroups,

    #[error("forward-reference workspace overflow")]
    WorkspaceOverflow,

    #[error("pattern is not valid UTF-8")]
    BadUtf8,

    #[error("serialized program is malformed")]
    BadSerializedProgram,

    #[error("internal compiler error")]
    Internal,
}

/// An error produced while compiling a pattern.
///
/// Carries the byte offset into the pattern text where the problem was
/// detected. Compilation is all-or-nothing: an error discards all partial
/// state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    /// Byte offset into the pattern where the error was detected.
    pub offset: usize,
}

impl CompileError {
    pub(crate) fn new(kind: CompileErrorKind, offset: usize) -> Self {
        Self { kind, offset }
    }
}

impl Display for CompileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at pattern offset {}", self.kind, self.offset)
    }
}

/// Errors that can abort a match attempt.
///
/// A failure to match is not an error; it is reported as
/// [`Outcome::NoMatch`](crate::Outcome::NoMatch). The variants here
/// terminate the whole `exec` call immediately and are never retried by
/// the bumpalong loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// The interpreter step budget was exhausted.
    #[error("match limit exceeded")]
    MatchLimit,

    /// The backtracking recursion depth budget was exhausted.
    #[error("recursion limit exceeded")]
    RecursionLimit,

    /// The subject is not valid UTF-8 while the program was compiled in
    /// UTF mode. The payload is the offset of the first invalid byte.
    #[error("invalid UTF-8 in subject at offset {0}")]
    BadSubjectUtf8(usize),

    /// The starting offset points outside the subject, or into the middle
    /// of a UTF-8 character.
    #[error("bad starting offset")]
    BadStartOffset,

    /// Mutually exclusive or unsupported per-call options, e.g. requesting
    /// a partial match for a program compiled from a pattern that does not
    /// support partial matching.
    #[error("bad option for this program")]
    BadOption,

    /// An instruction stream invariant was violated. This indicates a bug
    /// in the compiler or the matcher, not a problem with the input.
    #[error("internal matcher error")]
    Internal,
}
