use std::ops::Range;

use pretty_assertions::assert_eq;

use crate::compiler::compile;
use crate::errors::MatchError;
use crate::matcher::{Captures, Outcome};
use crate::options::{Bsr, CompileOptions, ExecOptions, Newline};
use crate::program::Program;

fn program(pattern: &str, options: &CompileOptions) -> Program {
    match compile(pattern.as_bytes(), options) {
        Ok(program) => program,
        Err(err) => panic!("compile failed for {:?}: {}", pattern, err),
    }
}

fn run(
    pattern: &str,
    subject: &[u8],
    copts: &CompileOptions,
    eopts: &ExecOptions,
) -> Outcome {
    program(pattern, copts).exec(subject, 0, eopts).unwrap()
}

/// Runs `pattern` against `subject` with default options and returns the
/// span of the whole match.
fn find(pattern: &str, subject: &[u8]) -> Option<Range<usize>> {
    match run(
        pattern,
        subject,
        &CompileOptions::new(),
        &ExecOptions::new(),
    ) {
        Outcome::Match(caps) => caps.get(0),
        _ => None,
    }
}

fn find_with(
    pattern: &str,
    subject: &[u8],
    copts: &CompileOptions,
) -> Option<Range<usize>> {
    match run(pattern, subject, copts, &ExecOptions::new()) {
        Outcome::Match(caps) => caps.get(0),
        _ => None,
    }
}

fn captures(pattern: &str, subject: &[u8]) -> Captures {
    match run(
        pattern,
        subject,
        &CompileOptions::new(),
        &ExecOptions::new(),
    ) {
        Outcome::Match(caps) => caps,
        other => panic!("expected a match, got {:?}", other),
    }
}

#[test]
fn literal_matching() {
    assert_eq!(find("abc", b"xabcy"), Some(1..4));
    assert_eq!(find("abc", b"ab"), None);
    assert_eq!(find("", b"abc"), Some(0..0));
}

#[test]
fn greedy_lazy_possessive() {
    assert_eq!(find("a+", b"aaa"), Some(0..3));
    assert_eq!(find("a+?", b"aaa"), Some(0..1));
    assert_eq!(find(r"<.*>", b"<a><b>"), Some(0..6));
    assert_eq!(find(r"<.*?>", b"<a><b>"), Some(0..3));
    // a possessive repeat gives nothing back
    assert_eq!(find(r".*+b", b"ab"), None);
    assert_eq!(find(r"a++b", b"aab"), Some(0..3));
    // the greedy repeat must back off when its disjoint follower is
    // optional
    assert_eq!(find(r"a+b*a", b"aa"), Some(0..2));
    assert_eq!(find(r"a+b?a", b"aa"), Some(0..2));
    assert_eq!(find(r"a+b*a", b"aba"), Some(0..3));
}

#[test]
fn ungreedy_option() {
    let mut opts = CompileOptions::new();
    opts.ungreedy = true;
    assert_eq!(find_with("a+", b"aaa", &opts), Some(0..1));
    assert_eq!(find_with("a+?", b"aaa", &opts), Some(0..3));
}

#[test]
fn captures_and_names() {
    let caps = captures(r"(?<year>\d{4})-(?<month>\d{2})", b"on 2024-03-17");
    assert_eq!(caps.get(0), Some(3..10));
    assert_eq!(caps.get(1), Some(3..7));
    assert_eq!(caps.get(2), Some(8..10));

    let prog = program(
        r"(?<year>\d{4})-(?<month>\d{2})",
        &CompileOptions::new(),
    );
    let caps = match prog.exec(b"2024-03", 0, &ExecOptions::new()).unwrap()
    {
        Outcome::Match(caps) => caps,
        other => panic!("expected a match, got {:?}", other),
    };
    assert_eq!(caps.name(&prog, "year"), Some(0..4));
    assert_eq!(caps.name(&prog, "month"), Some(5..7));
    assert_eq!(caps.name(&prog, "day"), None);
}

#[test]
fn abandoned_branch_captures_are_dead() {
    // group 1 participates only in the branch that is backtracked away
    let caps = captures(r"(?:(a)x|a)y", b"ay");
    assert_eq!(caps.get(0), Some(0..2));
    assert_eq!(caps.get(1), None);
}

#[test]
fn repeated_group_keeps_last_capture() {
    let caps = captures(r"(a|b)+", b"abba");
    assert_eq!(caps.get(0), Some(0..4));
    assert_eq!(caps.get(1), Some(3..4));
}

#[test]
fn backreferences() {
    assert_eq!(find(r"(ab)\1+", b"abababx"), Some(0..6));
    assert_eq!(find(r"(a)\1", b"ab"), None);
    assert_eq!(
        find_with(
            r"(a)\1",
            b"aA",
            &CompileOptions::new().case_insensitive(true)
        ),
        Some(0..2)
    );
}

#[test]
fn unset_backreference_policy() {
    // an unset group fails the reference, unless JavaScript semantics
    // make it match the empty string
    let pattern = r"(?:(a)|b)\1c";
    assert_eq!(find(pattern, b"bc"), None);
    assert_eq!(
        find_with(pattern, b"bc", &CompileOptions::new().js_compat(true)),
        Some(0..2)
    );
}

#[test]
fn anchors() {
    assert_eq!(find("^a", b"ab"), Some(0..1));
    assert_eq!(find("^b", b"ab"), None);
    assert_eq!(find("b$", b"ab"), Some(1..2));
    assert_eq!(find("a$", b"a\n"), Some(0..1));
    assert_eq!(find(r"a\z", b"a\n"), None);
    assert_eq!(find(r"a\Z", b"a\n"), Some(0..1));

    let mut opts = CompileOptions::new();
    opts.dollar_endonly = true;
    assert_eq!(find_with("a$", b"a\n", &opts), None);
    assert_eq!(find_with("a$", b"a", &opts), Some(0..1));
}

#[test]
fn multiline_anchors() {
    let opts = CompileOptions::new().multiline(true);
    assert_eq!(find_with("^b", b"a\nb", &opts), Some(2..3));
    assert_eq!(find_with("a$", b"a\nb", &opts), Some(0..1));
}

#[test]
fn word_boundaries() {
    assert_eq!(find(r"\bcat\b", b"the cat sat"), Some(4..7));
    assert_eq!(find(r"\bcat\b", b"concatenate"), None);
}

#[test]
fn match_start_anchor() {
    let prog = program(r"\Ga", &CompileOptions::new());
    let opts = ExecOptions::new();
    match prog.exec(b"xaa", 1, &opts).unwrap() {
        Outcome::Match(caps) => assert_eq!(caps.get(0), Some(1..2)),
        other => panic!("expected a match, got {:?}", other),
    }
    // \G pins the match to the starting offset, bump-along cannot help
    assert_eq!(prog.exec(b"xxa", 1, &opts).unwrap(), Outcome::NoMatch);
}

#[test]
fn lookahead() {
    assert_eq!(find(r"a(?=b)", b"ac ab"), Some(3..4));
    assert_eq!(find(r"a(?!b)", b"ab ac"), Some(3..4));
}

#[test]
fn lookbehind() {
    assert_eq!(find(r"(?<=USD)\d+", b"USD100"), Some(3..6));
    assert_eq!(find(r"(?<=USD)\d+", b"EUR100"), None);
    assert_eq!(find(r"(?<!\d)42", b"142 42"), Some(4..6));
}

#[test]
fn atomic_groups() {
    assert_eq!(find(r"(?>a+)a", b"aaa"), None);
    assert_eq!(find(r"(?>a|ab)c", b"abc"), None);
    assert_eq!(find(r"(?>ab|a)c", b"abc"), Some(0..3));
    // the iteration count of a quantified atomic group still backtracks
    assert_eq!(find(r"(?>ab)+ab", b"ababab"), Some(0..6));
}

#[test]
fn conditional_groups() {
    let pattern = r"(a)?(?(1)b|c)";
    assert_eq!(find(pattern, b"ab"), Some(0..2));
    assert_eq!(find(pattern, b"c"), Some(0..1));
    assert_eq!(find(pattern, b"b"), None);

    assert_eq!(
        find(r"(?(DEFINE)(?<d>\d))(?&d)(?&d)", b"42x"),
        Some(0..2)
    );
    assert_eq!(find(r"(?(R)b|a(?R)?)", b"ab"), Some(0..2));
}

#[test]
fn recursion() {
    let balanced = r"^(\((?:[^()]|(?1))*\))$";
    assert_eq!(find(balanced, b"(a(b)c)"), Some(0..7));
    assert_eq!(find(balanced, b"(a(b)"), None);
    assert_eq!(find(balanced, b"()"), Some(0..2));
}

#[test]
fn recursion_captures_propagate() {
    // the inner call's capture of group 1 survives the return
    let caps = captures(r"(a)(?1)", b"aa");
    assert_eq!(caps.get(0), Some(0..2));
    assert_eq!(caps.get(1), Some(1..2));

    // but a failed call leaves the earlier capture untouched
    let caps = captures(r"(ab)(?:(?1)|c)", b"abc");
    assert_eq!(caps.get(0), Some(0..3));
    assert_eq!(caps.get(1), Some(0..2));
}

#[test]
fn control_verbs() {
    // THEN abandons the current alternative, PRUNE the whole position
    assert_eq!(find(r"(a(*THEN)z|a)", b"a"), Some(0..1));
    assert_eq!(find(r"(a(*PRUNE)z|a)", b"a"), None);

    // SKIP forbids retrying anywhere the failed attempt consumed
    assert_eq!(find(r"aab", b"aaab"), Some(1..4));
    assert_eq!(find(r"aa(*SKIP)b", b"aaab"), None);

    // COMMIT turns any later failure into overall failure
    assert_eq!(find(r"ac", b"aac"), Some(1..3));
    assert_eq!(find(r"a(*COMMIT)c", b"aac"), None);

    assert_eq!(find(r"a(*FAIL)|b", b"ab"), Some(1..2));

    let caps = captures(r"a(b(*ACCEPT)|c)d", b"ab");
    assert_eq!(caps.get(0), Some(0..2));
    assert_eq!(caps.get(1), Some(1..2));
}

#[test]
fn newline_conventions() {
    let ml = CompileOptions::new().multiline(true);
    assert_eq!(find_with("^b", b"a\rb", &ml), None);
    assert_eq!(
        find_with("^b", b"a\rb", &ml.clone().newline(Newline::Cr)),
        Some(2..3)
    );
    assert_eq!(
        find_with("a$", b"a\r\nb", &ml.clone().newline(Newline::CrLf)),
        Some(0..1)
    );
    // bump-along never lands between CR and LF
    assert_eq!(
        find_with(".", b"\r\n", &CompileOptions::new().newline(Newline::CrLf)),
        None
    );
    assert_eq!(
        find_with(
            "^b",
            b"a\x0cb",
            &ml.clone().newline(Newline::Any)
        ),
        Some(2..3)
    );
}

#[test]
fn bsr_convention() {
    assert_eq!(find(r"a\Rb", b"a\r\nb"), Some(0..4));
    assert_eq!(find(r"a\Rb", b"a\x0bb"), Some(0..3));
    let mut opts = CompileOptions::new();
    opts.bsr = Bsr::AnyCrLf;
    assert_eq!(find_with(r"a\Rb", b"a\x0bb", &opts), None);
    assert_eq!(find_with(r"a\Rb", b"a\nb", &opts), Some(0..3));
}

#[test]
fn option_scoping() {
    assert_eq!(find(r"(?i:ab)c", b"ABc"), Some(0..3));
    assert_eq!(find(r"(?i:ab)c", b"ABC"), None);
    assert_eq!(find(r"(?i)a(?-i)b", b"Ab"), Some(0..2));
    assert_eq!(find(r"(?i)a(?-i)b", b"AB"), None);
}

#[test]
fn utf_matching() {
    let opts = CompileOptions::new().utf(true);
    assert_eq!(find_with("é+", "ééx".as_bytes(), &opts), Some(0..4));
    assert_eq!(find_with(".", "é".as_bytes(), &opts), Some(0..2));
    assert_eq!(find_with("[α-ω]+", "αβγ".as_bytes(), &opts), Some(0..6));
    assert_eq!(
        find_with(
            "é",
            "xÉ".as_bytes(),
            &opts.clone().case_insensitive(true)
        ),
        Some(1..3)
    );
    assert_eq!(find_with(r"\p{N}+", "x42".as_bytes(), &opts), Some(1..3));
}

#[test]
fn invalid_utf_subject_is_rejected() {
    let prog = program("a", &CompileOptions::new().utf(true));
    assert_eq!(
        prog.exec(b"a\xff", 0, &ExecOptions::new()),
        Err(MatchError::BadSubjectUtf8(1))
    );
}

#[test]
fn bad_start_offset() {
    let prog = program("a", &CompileOptions::new());
    assert_eq!(
        prog.exec(b"a", 5, &ExecOptions::new()),
        Err(MatchError::BadStartOffset)
    );
    let prog = program("a", &CompileOptions::new().utf(true));
    // offset 1 is inside the two-byte é
    assert_eq!(
        prog.exec("éa".as_bytes(), 1, &ExecOptions::new()),
        Err(MatchError::BadStartOffset)
    );
}

#[test]
fn anchored_exec() {
    let prog = program("b", &CompileOptions::new());
    let opts = ExecOptions::new().anchored(true);
    assert_eq!(prog.exec(b"ab", 0, &opts).unwrap(), Outcome::NoMatch);
    match prog.exec(b"ab", 1, &opts).unwrap() {
        Outcome::Match(caps) => assert_eq!(caps.get(0), Some(1..2)),
        other => panic!("expected a match, got {:?}", other),
    }
}

#[test]
fn not_empty() {
    assert_eq!(find("a*", b"bbb"), Some(0..0));
    let prog = program("a*", &CompileOptions::new());
    let mut opts = ExecOptions::new();
    opts.not_empty = true;
    assert_eq!(prog.exec(b"bbb", 0, &opts).unwrap(), Outcome::NoMatch);
    match prog.exec(b"bab", 0, &opts).unwrap() {
        Outcome::Match(caps) => assert_eq!(caps.get(0), Some(1..2)),
        other => panic!("expected a match, got {:?}", other),
    }
}

#[test]
fn not_bol_not_eol() {
    let prog = program("^a", &CompileOptions::new());
    let mut opts = ExecOptions::new();
    opts.not_bol = true;
    assert_eq!(prog.exec(b"abc", 0, &opts).unwrap(), Outcome::NoMatch);

    let prog = program("c$", &CompileOptions::new());
    let mut opts = ExecOptions::new();
    opts.not_eol = true;
    assert_eq!(prog.exec(b"abc", 0, &opts).unwrap(), Outcome::NoMatch);
}

#[test]
fn firstline() {
    let mut opts = CompileOptions::new();
    opts.firstline = true;
    assert_eq!(find_with("b", b"a\nb", &opts), None);
    assert_eq!(find_with("b", b"ab\n", &opts), Some(1..2));
}

#[test]
fn partial_matching() {
    let prog = program(r"\d{4}", &CompileOptions::new());
    let opts = ExecOptions::new().partial(true);
    assert_eq!(
        prog.exec(b"123", 0, &opts).unwrap(),
        Outcome::Partial(0)
    );
    match prog.exec(b"1234", 0, &opts).unwrap() {
        Outcome::Match(caps) => assert_eq!(caps.get(0), Some(0..4)),
        other => panic!("expected a match, got {:?}", other),
    }
    assert_eq!(prog.exec(b"abc", 0, &opts).unwrap(), Outcome::NoMatch);

    // a pattern with backreferences cannot report meaningful partial
    // matches
    let prog = program(r"(a)\1", &CompileOptions::new());
    assert_eq!(
        prog.exec(b"a", 0, &opts),
        Err(MatchError::BadOption)
    );
}

#[test]
fn match_limit() {
    // catastrophic backtracking runs into the step budget instead of
    // hanging; the alternation keeps the required-byte scan from
    // rejecting the subject before an attempt is made
    let prog = program(r"(a+)+b|x", &CompileOptions::new());
    let subject = [b'a'; 28];
    assert_eq!(
        prog.exec(&subject, 0, &ExecOptions::new()),
        Err(MatchError::MatchLimit)
    );
}

#[test]
fn recursion_limit() {
    let prog = program("((((((a))))))", &CompileOptions::new());
    let opts = ExecOptions::new().recursion_limit(4);
    assert_eq!(
        prog.exec(b"a", 0, &opts),
        Err(MatchError::RecursionLimit)
    );
}

#[test]
fn serialized_program_matches_identically() {
    let prog = program(r"(?<n>a)+b", &CompileOptions::new());
    let reloaded = Program::from_bytes(&prog.to_bytes()).unwrap();
    let opts = ExecOptions::new();
    let a = prog.exec(b"xaaab", 0, &opts).unwrap();
    let b = reloaded.exec(b"xaaab", 0, &opts).unwrap();
    assert_eq!(a, b);
    match a {
        Outcome::Match(caps) => {
            assert_eq!(caps.get(0), Some(1..5));
            assert_eq!(caps.name(&reloaded, "n"), Some(3..4));
        }
        other => panic!("expected a match, got {:?}", other),
    }
}

#[test]
fn class_matching() {
    assert_eq!(find("[0-9a-f]+", b"zzcafe99zz"), Some(2..8));
    assert_eq!(find("[^0-9]+", b"abc123"), Some(0..3));
    assert_eq!(find(r"[[:alpha:]]+", b"12ab34"), Some(2..4));
}

#[test]
fn type_escapes() {
    assert_eq!(find(r"\h+", b"a \t b"), Some(1..4));
    assert_eq!(find(r"\v", b"a\x0bb"), Some(1..2));
    assert_eq!(find(r"\w+", b"!hello!"), Some(1..6));
    assert_eq!(find(r"\S+", b"  abc  "), Some(2..5));
    // NBSP is horizontal, NEL is vertical
    assert_eq!(find(r"\h", b"a\xa0b"), Some(1..2));
    assert_eq!(find(r"\v", b"a\x85b"), Some(1..2));
    assert_eq!(find(r"\H+", b"\xa0ab\xa0"), Some(1..3));
}

#[test]
fn quantified_groups() {
    assert_eq!(find(r"(?:ab){2,3}", b"abababab"), Some(0..6));
    assert_eq!(find(r"(?:ab){2,3}", b"ab"), None);
    assert_eq!(find(r"(?:a|b){3}c", b"xbaac"), Some(1..5));
    // an iteration matching the empty string ends the repeat
    assert_eq!(find(r"(?:a?)*b", b"aab"), Some(0..3));
    assert_eq!(find(r"(a*)*$", b"aa"), Some(0..2));
}
