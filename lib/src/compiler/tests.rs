use pretty_assertions::assert_eq;

use crate::compiler::compile;
use crate::errors::CompileErrorKind;
use crate::instr::Disasm;
use crate::options::CompileOptions;

/// Compiles `pattern` and returns one string per instruction: the
/// mnemonic plus any numeric operands, with code addresses stripped.
fn ops(pattern: &str, options: &CompileOptions) -> Vec<String> {
    let program = match compile(pattern.as_bytes(), options) {
        Ok(program) => program,
        Err(err) => panic!("compile failed for {:?}: {}", pattern, err),
    };
    let listing =
        Disasm { code: &program.code, fmt: program.fmt() }.to_string();
    listing
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let body = line.split_once(": ").map(|(_, b)| b).unwrap();
            body.split_whitespace()
                .filter(|tok| {
                    tok.len() != 5
                        || !tok.chars().all(|c| c.is_ascii_hexdigit())
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

fn shape(pattern: &str) -> Vec<String> {
    ops(pattern, &CompileOptions::new())
}

fn err_kind(pattern: &str) -> CompileErrorKind {
    match compile(pattern.as_bytes(), &CompileOptions::new()) {
        Ok(_) => panic!("expected {:?} to fail", pattern),
        Err(err) => err.kind,
    }
}

#[test]
fn literals() {
    assert_eq!(
        shape("abc"),
        ["BRA", "CHAR 'a'", "CHAR 'b'", "CHAR 'c'", "KET", "END"]
    );
    assert_eq!(
        ops("ab", &CompileOptions::new().case_insensitive(true)),
        ["BRA", "CHARI 'a'", "CHARI 'b'", "KET", "END"]
    );
}

#[test]
fn quantifiers() {
    assert_eq!(
        shape("a*?b"),
        ["BRA", "MINSTAR", "CHAR 'a'", "CHAR 'b'", "KET", "END"]
    );
    assert_eq!(
        shape("a+a"),
        ["BRA", "PLUS", "CHAR 'a'", "CHAR 'a'", "KET", "END"]
    );
    assert_eq!(
        shape("a{3}"),
        ["BRA", "EXACT 3", "CHAR 'a'", "KET", "END"]
    );
    assert_eq!(
        shape("a{2,4}"),
        [
            "BRA", "EXACT 2", "CHAR 'a'", "UPTO 2", "CHAR 'a'", "KET",
            "END"
        ]
    );
}

#[test]
fn auto_possessification() {
    // a repeated item provably disjoint from what follows never has to
    // give anything back
    assert_eq!(
        shape("a+b"),
        ["BRA", "POSPLUS", "CHAR 'a'", "CHAR 'b'", "KET", "END"]
    );
    // the explicit possessive form compiles to the same code
    let opts = CompileOptions::new();
    let implicit = compile(br"\d+\D", &opts).map(|p| p.code);
    let explicit = compile(br"\d++\D", &opts).map(|p| p.code);
    assert_eq!(implicit, explicit);
    // an optionally quantified follower may be absent, so the repeat
    // must stay backtrackable
    // the b* itself still qualifies: its follower is mandatory
    assert_eq!(
        shape("a+b*a"),
        [
            "BRA", "PLUS", "CHAR 'a'", "POSSTAR", "CHAR 'b'",
            "CHAR 'a'", "KET", "END"
        ]
    );
    assert_eq!(
        shape("a+b?a"),
        [
            "BRA", "PLUS", "CHAR 'a'", "QUERY", "CHAR 'b'",
            "CHAR 'a'", "KET", "END"
        ]
    );
    // a follower that must appear at least once still qualifies
    assert_eq!(
        shape("a+b{2,}"),
        [
            "BRA", "POSPLUS", "CHAR 'a'", "EXACT 2", "CHAR 'b'",
            "STAR", "CHAR 'b'", "KET", "END"
        ]
    );
}

#[test]
fn alternation_and_groups() {
    assert_eq!(
        shape("a|b"),
        ["BRA", "CHAR 'a'", "ALT", "CHAR 'b'", "KET", "END"]
    );
    assert_eq!(
        shape("(a|b)c"),
        [
            "BRA", "CBRA 1", "CHAR 'a'", "ALT", "CHAR 'b'", "KET",
            "CHAR 'c'", "KET", "END"
        ]
    );
}

#[test]
fn group_repeats() {
    assert_eq!(
        shape("(?:ab)*"),
        [
            "BRA", "BRAZERO", "BRA", "CHAR 'a'", "CHAR 'b'", "KETRMAX",
            "KET", "END"
        ]
    );
    // a group that can match empty gets the empty-guard bracket form
    assert_eq!(
        shape("(a*)*"),
        [
            "BRA", "BRAZERO", "SCBRA 1", "STAR", "CHAR 'a'", "KETRMAX",
            "KET", "END"
        ]
    );
    // possessive repetition of a group wraps the repeat in an atomic
    // bracket
    assert_eq!(
        shape("(?:ab)++"),
        [
            "BRA", "ONCE", "BRA", "CHAR 'a'", "CHAR 'b'", "KETRMAX",
            "KET", "KET", "END"
        ]
    );
}

#[test]
fn lookaround() {
    assert_eq!(
        shape("(?=ab)c"),
        [
            "BRA", "ASSERT", "CHAR 'a'", "CHAR 'b'", "KET", "CHAR 'c'",
            "KET", "END"
        ]
    );
    assert_eq!(
        shape("(?<=ab)c"),
        [
            "BRA", "ASSERTBACK", "REVERSE 2", "CHAR 'a'", "CHAR 'b'",
            "KET", "CHAR 'c'", "KET", "END"
        ]
    );
    assert_eq!(
        shape("(?>a)b"),
        ["BRA", "ONCE", "CHAR 'a'", "KET", "CHAR 'b'", "KET", "END"]
    );
}

#[test]
fn character_classes() {
    assert_eq!(shape("[abc]"), ["BRA", "CLASS", "KET", "END"]);
    assert_eq!(shape("[^ab]"), ["BRA", "NCLASS", "KET", "END"]);
    // one negated character is a dedicated instruction, not a bitmap
    assert_eq!(shape("[^a]"), ["BRA", "NOT 'a'", "KET", "END"]);
    // characters above the bitmap range need the extended form
    assert_eq!(
        ops("[α-ω]", &CompileOptions::new().utf(true)),
        ["BRA", "XCLASS", "KET", "END"]
    );
}

#[test]
fn backreferences_and_recursion() {
    assert_eq!(
        shape(r"(a)\1"),
        ["BRA", "CBRA 1", "CHAR 'a'", "KET", "REF 1", "KET", "END"]
    );
    assert_eq!(
        ops(r"(a)\1", &CompileOptions::new().case_insensitive(true)),
        ["BRA", "CBRA 1", "CHARI 'a'", "KET", "REFI 1", "KET", "END"]
    );
    assert_eq!(
        shape("(a)(?1)"),
        ["BRA", "CBRA 1", "CHAR 'a'", "KET", "RECURSE", "KET", "END"]
    );
}

#[test]
fn conditional_groups() {
    assert_eq!(
        shape("(x)(?(1)a|b)"),
        [
            "BRA", "CBRA 1", "CHAR 'x'", "KET", "COND", "CREF 1",
            "CHAR 'a'", "ALT", "CHAR 'b'", "KET", "KET", "END"
        ]
    );
    assert_eq!(
        shape("(?(DEFINE)(?<d>a))"),
        [
            "BRA", "COND", "DEF", "CBRA 1", "CHAR 'a'", "KET", "KET",
            "KET", "END"
        ]
    );
}

#[test]
fn verbs() {
    assert_eq!(shape("(*FAIL)"), ["BRA", "FAIL", "KET", "END"]);
    assert_eq!(
        shape("a(*COMMIT)b"),
        ["BRA", "CHAR 'a'", "COMMIT", "CHAR 'b'", "KET", "END"]
    );
}

#[test]
fn anchors() {
    assert_eq!(
        shape("^a$"),
        ["BRA", "CIRC", "CHAR 'a'", "DOLL", "KET", "END"]
    );
    assert_eq!(
        ops("^a$", &CompileOptions::new().multiline(true)),
        ["BRA", "CIRCM", "CHAR 'a'", "DOLLM", "KET", "END"]
    );
}

#[test]
fn syntax_errors() {
    assert_eq!(err_kind("("), CompileErrorKind::MissingClosingParen);
    assert_eq!(err_kind("a)"), CompileErrorKind::UnmatchedClosingParen);
    assert_eq!(err_kind("[a"), CompileErrorKind::MissingClosingBracket);
    assert_eq!(err_kind("*a"), CompileErrorKind::NothingToRepeat);
    assert_eq!(err_kind("a**"), CompileErrorKind::NothingToRepeat);
    assert_eq!(
        err_kind("a{4,2}"),
        CompileErrorKind::QuantifierOutOfOrder
    );
    assert_eq!(err_kind("a{100000}"), CompileErrorKind::QuantifierTooBig);
    assert_eq!(err_kind("[b-a]"), CompileErrorKind::ClassRangeOutOfOrder);
    assert_eq!(err_kind(r"\j"), CompileErrorKind::BadEscape);
    assert_eq!(err_kind("(?~)"), CompileErrorKind::BadGroupSyntax);
}

#[test]
fn name_errors() {
    assert_eq!(err_kind("(?<9a>x)"), CompileErrorKind::BadGroupName);
    assert_eq!(
        err_kind("(?<n>a)(?<n>b)"),
        CompileErrorKind::DuplicateGroupName
    );
    assert_eq!(err_kind(r"(a)\5"), CompileErrorKind::BadReference);
    assert_eq!(err_kind(r"\k<missing>"), CompileErrorKind::BadReference);
    // group 0 can never be referenced while the match is in progress
    assert_eq!(err_kind(r"a\g{0}"), CompileErrorKind::BadReference);
    assert_eq!(err_kind(r"a\g0"), CompileErrorKind::BadReference);
}

#[test]
fn class_errors() {
    assert_eq!(
        err_kind("[[:wrong:]]"),
        CompileErrorKind::BadPosixClass
    );
    assert_eq!(err_kind(r"\p{Foo}"), CompileErrorKind::BadProperty);
}

#[test]
fn structure_errors() {
    assert_eq!(
        err_kind("(?<=a*)b"),
        CompileErrorKind::VariableLengthLookbehind
    );
    assert_eq!(
        err_kind("(x)(?(1)a|b|c)"),
        CompileErrorKind::TooManyConditionBranches
    );
    assert_eq!(err_kind("(?(DEFINE)a|b)"), CompileErrorKind::BadCondition);
    assert_eq!(
        err_kind("((?1))"),
        CompileErrorKind::RecursiveInfiniteLoop
    );
    assert_eq!(err_kind("(*WRONG)"), CompileErrorKind::BadVerb);
}

#[test]
fn study_metadata() {
    let opts = CompileOptions::new();
    let program = compile(b"abc", &opts).unwrap();
    assert_eq!(program.first_byte, Some((b'a', false)));
    assert_eq!(program.min_length, 3);

    let program = compile(b"^abc", &opts).unwrap();
    assert!(program.flags & crate::program::PF_ANCHORED != 0);

    let program =
        compile(b"^abc", &CompileOptions::new().multiline(true)).unwrap();
    assert!(program.flags & crate::program::PF_STARTLINE != 0);

    let program = compile(b"foo|bar", &opts).unwrap();
    assert_eq!(program.req_byte, None);
    #[cfg(feature = "study")]
    {
        let bits = program.start_bits.as_deref().unwrap();
        assert!(bits[b'f' as usize]);
        assert!(bits[b'b' as usize]);
        assert!(!bits[b'a' as usize]);
    }
}

#[test]
fn group_name_table() {
    let program = compile(
        b"(?<year>\\d{4})-(?<month>\\d{2})",
        &CompileOptions::new(),
    )
    .unwrap();
    assert_eq!(program.capture_count(), 2);
    assert_eq!(program.group_number("year"), Some(1));
    assert_eq!(program.group_number("month"), Some(2));
    assert_eq!(program.group_number("day"), None);
}
