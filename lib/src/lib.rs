/*! A Perl-compatible regular expression engine.

Patterns are compiled into a compact bytecode [`Program`] which is then
run against subject byte strings by a backtracking interpreter. The
supported syntax covers the classic Perl repertoire plus lookaround,
atomic groups, possessive quantifiers, named groups, backreferences,
subroutine calls and recursion, conditional groups and the backtracking
control verbs.

# Example

```rust
use retrace::{compile, CompileOptions, ExecOptions, Outcome};

let options = CompileOptions::new();
let program = compile(b"(?<year>\\d{4})-(?<month>\\d{2})", &options)?;

let outcome = program.exec(b"2024-03-17", 0, &ExecOptions::new())?;
let captures = match outcome {
    Outcome::Match(captures) => captures,
    _ => panic!("no match"),
};

assert_eq!(captures.get(0), Some(0..7));
assert_eq!(captures.name(&program, "year"), Some(0..4));
# Ok::<(), Box<dyn std::error::Error>>(())
```

Compiled programs are immutable and can be shared freely between
threads; every mutable state of a match lives in the `exec` call.
Programs can also be serialized with [`Program::to_bytes`] and loaded
back with [`Program::from_bytes`], including across machines of
different endianness.
*/

pub use errors::CompileError;
pub use errors::CompileErrorKind;
pub use errors::MatchError;

pub use matcher::Captures;
pub use matcher::Outcome;

pub use options::Bsr;
pub use options::CompileOptions;
pub use options::ExecOptions;
pub use options::LinkSize;
pub use options::Newline;
pub use options::DEFAULT_MATCH_LIMIT;
pub use options::DEFAULT_RECURSION_LIMIT;

pub use program::Program;

mod compiler;
mod errors;
mod instr;
mod matcher;
mod options;
mod program;
mod tables;
mod unicode;

/// Compiles a pattern into a [`Program`] ready for matching.
pub fn compile(
    pattern: &[u8],
    options: &CompileOptions,
) -> Result<Program, CompileError> {
    compiler::compile(pattern, options)
}
