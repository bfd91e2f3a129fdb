//! Static quality metrics.
//!
//! Line classification, McCabe complexity from decision points, Halstead
//! volume from a flat token stream, and the classic maintainability index
//! `171 - 5.2 ln V - 0.23 CC - 16.2 ln LOC`, rescaled to 0..100.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::language::Language;
use crate::response::QualityResults;

const LONG_LINE: usize = 120;
const COMPLEX_FUNCTION: f64 = 10.0;

static DECISION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:if|elif|for|while|case|catch|except|and|or)\b|&&|\|\||\?\s*[^:?.]")
        .expect("static regex")
});

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)
        (?P<str>"(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*')
        | (?P<num>\b\d+(?:\.\d+)?\b)
        | (?P<ident>[A-Za-z_]\w*)
        | (?P<op>==|!=|<=|>=|&&|\|\||<<|>>|->|=>|::|\+=|-=|\*=|/=|\*\*|[-+*/%=<>!&|^~.,:;()\[\]{}?])
        "#,
    )
    .expect("static regex")
});

const KEYWORDS: &[&str] = &[
    "if", "else", "elif", "for", "while", "return", "def", "class", "fn", "func", "function",
    "let", "const", "var", "import", "from", "try", "except", "catch", "finally", "switch",
    "case", "break", "continue", "new", "and", "or", "not", "in", "is", "match", "struct",
    "public", "private", "static", "void", "async", "await", "yield", "with", "lambda",
];

fn function_pattern(language: Language) -> &'static Regex {
    static PY: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^\s*(?:async\s+)?def\s+\w+").expect("static regex"));
    static JS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\bfunction\b\s*\w*\s*\(|\([^()]*\)\s*=>").expect("static regex")
    });
    static C_LIKE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?m)^\s*(?:[\w<>\[\],*&:]+\s+)+\*?(?P<name>\w+)\s*\([^;{}]*\)\s*(?:const\s*)?\{?\s*$",
        )
        .expect("static regex")
    });
    static GO: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^\s*func\b").expect("static regex"));
    static RS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+\w+").expect("static regex")
    });
    match language {
        Language::Python => &PY,
        Language::Javascript | Language::Typescript => &JS,
        Language::Java | Language::Cpp | Language::Csharp => &C_LIKE,
        Language::Go => &GO,
        Language::Rust => &RS,
    }
}

static TEST_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)\b(?:def|fn|func|function|void)\s+[Tt]est\w*|#\[test\]|@Test\b|\b(?:it|test|describe)\s*\(")
        .expect("static regex")
});

static ASSERTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bassert\w*\b|\bexpect\s*\(|\bAssert\.\w+").expect("static regex")
});

#[derive(Default)]
struct LineCounts {
    code: usize,
    comment: usize,
    blank: usize,
    max_len: usize,
    long_lines: usize,
}

fn classify_lines(code: &str, language: Language) -> LineCounts {
    let marker = language.line_comment();
    let mut counts = LineCounts::default();
    let mut in_block: Option<&'static str> = None;

    for raw in code.lines() {
        let len = raw.chars().count();
        counts.max_len = counts.max_len.max(len);
        if len > LONG_LINE {
            counts.long_lines += 1;
        }
        let line = raw.trim();
        if line.is_empty() {
            counts.blank += 1;
            continue;
        }
        if let Some(close) = in_block {
            counts.comment += 1;
            if line.contains(close) {
                in_block = None;
            }
            continue;
        }
        if line.starts_with(marker) {
            counts.comment += 1;
            continue;
        }
        let block_open = match language {
            Language::Python => ["\"\"\"", "'''"].into_iter().find(|q| line.starts_with(q)),
            _ => line.starts_with("/*").then_some("/*"),
        };
        if let Some(open) = block_open {
            counts.comment += 1;
            let close = if open == "/*" { "*/" } else { open };
            let rest = &line[open.len()..];
            if !rest.contains(close) {
                in_block = Some(close);
            }
            continue;
        }
        counts.code += 1;
    }
    counts
}

/// Halstead volume `N log2 n` over operators and operands.
fn halstead_volume(code: &str) -> f64 {
    let mut distinct: HashSet<&str> = HashSet::new();
    let mut total = 0usize;
    for token in TOKEN.find_iter(code) {
        distinct.insert(token.as_str());
        total += 1;
    }
    let vocabulary = distinct.len();
    if vocabulary < 2 {
        return 0.0;
    }
    total as f64 * (vocabulary as f64).log2()
}

/// Operator occurrences, keywords included.
fn operator_count(code: &str) -> usize {
    TOKEN
        .captures_iter(code)
        .filter(|c| {
            c.name("op").is_some()
                || c.name("ident")
                    .is_some_and(|m| KEYWORDS.contains(&m.as_str()))
        })
        .count()
}

/// Control-flow keywords that look like calls to the C-like pattern.
const CONTROL: &[&str] = &["if", "while", "for", "switch", "catch", "return", "sizeof"];

fn count_functions(code: &str, language: Language) -> usize {
    function_pattern(language)
        .captures_iter(code)
        .filter(|c| {
            c.name("name")
                .map_or(true, |name| !CONTROL.contains(&name.as_str()))
        })
        .count()
}

/// Compute quality metrics for `code`.
pub fn analyze(code: &str, language: Language) -> QualityResults {
    let lines = classify_lines(code, language);
    let function_count = count_functions(code, language);
    let cyclomatic = 1 + DECISION.find_iter(code).count();
    let volume = halstead_volume(code);

    let loc = lines.code.max(1) as f64;
    let raw_mi = 171.0 - 5.2 * volume.max(1.0).ln() - 0.23 * cyclomatic as f64 - 16.2 * loc.ln();
    let maintainability = (raw_mi * 100.0 / 171.0).clamp(0.0, 100.0);

    let documented = lines.comment + lines.code;
    let documentation_ratio = if documented == 0 {
        0.0
    } else {
        lines.comment as f64 / documented as f64
    };

    let test_functions = TEST_FUNCTION.find_iter(code).count();
    let assertions = ASSERTION.find_iter(code).count();
    let subject_functions = function_count.saturating_sub(test_functions).max(1);
    let test_coverage_estimate = if test_functions == 0 && assertions == 0 {
        0.0
    } else {
        ((test_functions.max(1) as f64 / subject_functions as f64) * 0.8
            + if assertions > 0 { 0.2 } else { 0.0 })
        .min(1.0)
    };

    let mut issues = Vec::new();
    if lines.long_lines > 0 {
        issues.push(format!(
            "{} line(s) longer than {LONG_LINE} characters",
            lines.long_lines
        ));
    }
    let per_function = cyclomatic as f64 / function_count.max(1) as f64;
    if per_function > COMPLEX_FUNCTION {
        issues.push(format!(
            "high cyclomatic complexity ({per_function:.1} per function)"
        ));
    }
    if lines.comment == 0 && lines.code > 10 {
        issues.push("no comments or documentation".to_string());
    }
    if operator_count(code) == 0 && lines.code > 0 {
        issues.push("no recognisable operators; analysis may be unreliable".to_string());
    }

    QualityResults {
        lines_of_code: lines.code,
        comment_lines: lines.comment,
        blank_lines: lines.blank,
        function_count,
        cyclomatic_complexity: cyclomatic,
        halstead_volume: volume,
        maintainability_index: maintainability,
        documentation_ratio,
        test_coverage_estimate,
        max_line_length: lines.max_len,
        issues,
    }
}

/// Overall 0-10 score.
///
/// Maintainability contributes up to 4, documentation up to 2, complexity
/// per function up to 2, test evidence up to 1, and style up to 1 (a
/// quarter point lost per issue).
pub fn score(results: &QualityResults) -> f64 {
    let maintainability = results.maintainability_index / 100.0 * 4.0;
    let documentation = (results.documentation_ratio / 0.2).min(1.0) * 2.0;
    let per_function =
        results.cyclomatic_complexity as f64 / results.function_count.max(1) as f64;
    let complexity = if per_function <= 5.0 {
        2.0
    } else if per_function <= COMPLEX_FUNCTION {
        1.0
    } else {
        0.0
    };
    let tests = results.test_coverage_estimate;
    let style = (1.0 - 0.25 * results.issues.len() as f64).max(0.0);
    let total = maintainability + documentation + complexity + tests + style;
    (total * 10.0).round() / 10.0
}
