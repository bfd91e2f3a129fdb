//! Static security analysis of submitted code.
//!
//! Two passes feed one violation list:
//!
//! 1. a per-language regex table covering file access, network access,
//!    system commands, code injection and resource exhaustion;
//! 2. the token-level [`syntax`](super::syntax) pass for languages it
//!    understands.
//!
//! Findings are deduplicated on `(type, line)` keeping the most severe, then
//! judged against the [`ScanPolicy`]. The scanner fails closed: anything it
//! cannot positively clear under the policy is blocked.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::language::Language;
use crate::request::SecurityRequirements;

use super::syntax;
use super::violation::{risk_score, CodeLocation, SecurityViolation, ThreatLevel, ViolationType};

/// Knobs that decide how findings are weighed and when to block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPolicy {
    /// Block when the number of violations exceeds this.
    pub max_violations: usize,
    /// Network findings are demoted to `low` when true.
    pub allow_network: bool,
    /// File findings are demoted to `low` when true.
    pub allow_file_access: bool,
    pub syntax_inspection: bool,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            max_violations: 5,
            allow_network: false,
            allow_file_access: true,
            syntax_inspection: true,
        }
    }
}

impl From<&SandboxConfig> for ScanPolicy {
    fn from(cfg: &SandboxConfig) -> Self {
        Self {
            max_violations: cfg.max_violations,
            allow_network: cfg.enable_network_access,
            allow_file_access: cfg.enable_file_system_access,
            syntax_inspection: true,
        }
    }
}

/// Outcome of a scan under policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub violations: Vec<SecurityViolation>,
    pub risk_score: f64,
    pub blocked: bool,
    /// Why the code was blocked; `None` when it passed.
    pub reason: Option<String>,
}

impl ScanReport {
    pub fn passed(&self) -> bool {
        !self.blocked
    }
}

struct PatternRule {
    id: &'static str,
    languages: &'static [Language],
    violation_type: ViolationType,
    threat_level: ThreatLevel,
    description: &'static str,
    /// Spin-loop patterns are escalated when the loop body has no exit
    /// statement.
    unbounded_loop: bool,
    /// The pattern consumes one character before the match proper.
    leading_boundary: bool,
    regex: Regex,
}

const BOUNDARY: &str = r"(?:^|[^.\w])";

const PY: &[Language] = &[Language::Python];
const JS: &[Language] = &[Language::Javascript, Language::Typescript];
const JAVA: &[Language] = &[Language::Java];
const CPP: &[Language] = &[Language::Cpp];
const CS: &[Language] = &[Language::Csharp];
const GO: &[Language] = &[Language::Go];
const RS: &[Language] = &[Language::Rust];
const C_LIKE: &[Language] = &[
    Language::Javascript,
    Language::Typescript,
    Language::Java,
    Language::Cpp,
    Language::Csharp,
];

type RuleRow = (
    &'static str,
    &'static [Language],
    ViolationType,
    ThreatLevel,
    &'static str,
    &'static str,
);

#[rustfmt::skip]
const RULE_TABLE: &[RuleRow] = {
    use ThreatLevel::*;
    use ViolationType::*;
    &[
        // Python
        ("py.os_system", PY, SystemCommand, Critical, r"\bos\s*\.\s*(system|popen|exec[lv]p?e?|spawn[lv]p?e?)\s*\(", "shell command via os module"),
        ("py.subprocess", PY, SystemCommand, Critical, r"\bsubprocess\s*\.\s*(run|call|Popen|check_output|check_call|getoutput|getstatusoutput)\s*\(", "process spawn via subprocess"),
        ("py.ctypes", PY, SystemCommand, High, r"\bctypes\s*\.\s*(CDLL|cdll|windll|pythonapi)\b", "foreign function call via ctypes"),
        ("py.open", PY, FileAccess, Medium, r"(?:^|[^.\w])open\s*\(", "file open"),
        ("py.fs_mutation", PY, FileAccess, High, r"\b(os\s*\.\s*(remove|unlink|rmdir|chmod|chown|rename)|shutil\s*\.\s*(rmtree|move|copy\w*))\s*\(", "filesystem mutation"),
        ("py.socket", PY, NetworkAccess, High, r"\bsocket\s*\.\s*(socket|create_connection)\s*\(", "raw socket"),
        ("py.http", PY, NetworkAccess, Medium, r"\b(urllib\s*\.\s*request|urlopen\s*\(|requests\s*\.\s*(get|post|put|delete|patch)\s*\(|http\s*\.\s*client)", "outbound HTTP"),
        ("py.eval", PY, CodeInjection, High, r"(?:^|[^.\w])(eval|exec)\s*\(", "dynamic code evaluation"),
        ("py.dunder_import", PY, CodeInjection, High, r"\b__import__\s*\(", "dynamic import"),
        ("py.compile", PY, CodeInjection, Medium, r"(?:^|[^.\w])compile\s*\(", "dynamic code compilation"),
        ("py.spin_loop", PY, ResourceExhaustion, Medium, r"\bwhile\s+\(?\s*(True|1)\s*\)?\s*:", "potentially infinite loop"),
        ("py.fork", PY, ResourceExhaustion, High, r"\bos\s*\.\s*fork\s*\(", "process fork"),
        ("py.memory_bomb", PY, ResourceExhaustion, High, r"(\[[^\]]*\]\s*\*\s*\d{8,}|\*\s*10\s*\*\*\s*(9|\d{2,})|\bbytearray\s*\(\s*\d{9,}\s*\))", "oversized allocation"),
        ("py.recursion_limit", PY, ResourceExhaustion, Medium, r"\bsys\s*\.\s*setrecursionlimit\s*\(", "recursion limit override"),

        // JavaScript / TypeScript
        ("js.child_process_exec", JS, SystemCommand, Critical, r"\b(execSync|spawnSync|execFileSync)\s*\(|\bchild_process['\x22]?\s*\)?\s*\.\s*(exec|spawn|execFile|fork)\s*\(", "shell command via child_process"),
        ("js.child_process", JS, SystemCommand, High, r"\bchild_process\b", "child_process module"),
        ("js.fs", JS, FileAccess, Medium, r"(require\s*\(\s*['\x22](node:)?fs(/promises)?['\x22]\s*\)|from\s+['\x22](node:)?fs(/promises)?['\x22])", "fs module"),
        ("js.fs_mutation", JS, FileAccess, High, r"\bfs\s*\.\s*(unlink|rm|rmdir|writeFile|appendFile|chmod|rename)\w*\s*\(", "filesystem mutation"),
        ("js.net", JS, NetworkAccess, Medium, r"(\b(fetch|XMLHttpRequest|WebSocket)\s*\(|require\s*\(\s*['\x22](node:)?(net|http|https|dgram)['\x22]\s*\))", "network access"),
        ("js.eval", JS, CodeInjection, High, r"(?:^|[^.\w])eval\s*\(|\bnew\s+Function\s*\(", "dynamic code evaluation"),
        ("js.vm", JS, CodeInjection, High, r"\bvm\s*\.\s*(runIn\w*|Script)\b", "vm module evaluation"),
        ("js.memory_bomb", JS, ResourceExhaustion, High, r"(\bnew\s+Array\s*\(\s*\d{8,}|\.repeat\s*\(\s*(\d{9,}|1e[89]))", "oversized allocation"),

        // Java
        ("java.runtime_exec", JAVA, SystemCommand, Critical, r"\bRuntime\s*\.\s*getRuntime\s*\(\s*\)", "Runtime handle able to exec processes"),
        ("java.process_builder", JAVA, SystemCommand, Critical, r"\bnew\s+ProcessBuilder\s*\(", "process spawn via ProcessBuilder"),
        ("java.file", JAVA, FileAccess, Medium, r"(\bnew\s+(File|FileInputStream|FileOutputStream|FileReader|FileWriter|RandomAccessFile)\s*\(|\bFiles\s*\.\s*(delete\w*|write\w*|read\w*|newBuffered\w*)\s*\()", "file access"),
        ("java.net", JAVA, NetworkAccess, High, r"(\bnew\s+(Socket|ServerSocket|URL|DatagramSocket)\s*\(|\bHttpClient\b)", "network access"),
        ("java.reflection", JAVA, CodeInjection, High, r"(\bClass\s*\.\s*forName\s*\(|\.getDeclaredMethod\s*\(|\.setAccessible\s*\(\s*true)", "reflective access"),

        // C++
        ("cpp.system", CPP, SystemCommand, Critical, r"(?:^|[^.\w])(std::)?(system|popen)\s*\(", "shell command"),
        ("cpp.exec", CPP, SystemCommand, Critical, r"\b(execl|execlp|execle|execv|execvp|execve)\s*\(", "process image replacement"),
        ("cpp.fork", CPP, ResourceExhaustion, High, r"\bfork\s*\(\s*\)", "process fork"),
        ("cpp.file", CPP, FileAccess, Medium, r"(\b(fopen|remove|unlink|rmdir)\s*\(|\b[io]?fstream\b)", "file access"),
        ("cpp.net", CPP, NetworkAccess, High, r"\b(socket|connect|gethostbyname|getaddrinfo)\s*\(", "socket access"),
        ("cpp.asm", CPP, SystemCommand, High, r"\b(asm|__asm__)\b", "inline assembly"),

        // C#
        ("cs.process", CS, SystemCommand, Critical, r"(\bProcess\s*\.\s*Start\s*\(|\bnew\s+(ProcessStartInfo|Process)\b)", "process spawn"),
        ("cs.file", CS, FileAccess, Medium, r"(\bFile\s*\.\s*(Delete|WriteAll\w*|ReadAll\w*|Open\w*|Copy|Move)\s*\(|\bDirectory\s*\.\s*Delete\s*\()", "file access"),
        ("cs.net", CS, NetworkAccess, High, r"\b(HttpClient|WebClient|TcpClient|UdpClient|Socket)\b", "network access"),
        ("cs.injection", CS, CodeInjection, High, r"(\bAssembly\s*\.\s*Load\w*\s*\(|\[\s*DllImport)", "dynamic assembly or native import"),

        // Go
        ("go.exec", GO, SystemCommand, Critical, r"(\bexec\s*\.\s*Command\s*\(|\bsyscall\s*\.\s*(Exec|ForkExec)\s*\()", "process spawn"),
        ("go.exec_import", GO, SystemCommand, Critical, r#""os/exec""#, "os/exec package import"),
        ("go.file", GO, FileAccess, Medium, r"(\bos\s*\.\s*(Remove|RemoveAll|Create|OpenFile|WriteFile|ReadFile|Chmod)\s*\(|\bioutil\s*\.)", "file access"),
        ("go.net", GO, NetworkAccess, High, r"(\bnet\s*\.\s*(Dial|Listen)\w*\s*\(|\bhttp\s*\.\s*(Get|Post|ListenAndServe)\s*\()", "network access"),
        ("go.unsafe", GO, CodeInjection, High, r#""unsafe""#, "unsafe package"),
        ("go.spin_loop", GO, ResourceExhaustion, Medium, r"\bfor\s*\{", "potentially infinite loop"),

        // Rust
        ("rs.command", RS, SystemCommand, Critical, r"\bCommand\s*::\s*new\s*\(", "process spawn"),
        ("rs.process_import", RS, SystemCommand, Critical, r"\bprocess\s*::\s*(Command\b|\*|\{[^}]*\bCommand\b)", "process::Command import"),
        ("rs.libc", RS, SystemCommand, Critical, r"\blibc\s*::\s*(system|fork|exec\w*)\s*\(", "libc process control"),
        ("rs.file", RS, FileAccess, Medium, r"(\bfs\s*::\s*(remove_\w+|write|read_to_string|read|create_dir\w*|OpenOptions)\b|\bFile\s*::\s*(open|create)\s*\()", "file access"),
        ("rs.net", RS, NetworkAccess, High, r"\b(TcpStream|TcpListener|UdpSocket)\s*::", "network access"),
        ("rs.unsafe", RS, CodeInjection, High, r"\bunsafe\s*\{", "unsafe block"),
        ("rs.spin_loop", RS, ResourceExhaustion, Medium, r"\bloop\s*\{", "potentially infinite loop"),

        // Shared C-family loops
        ("c.spin_loop", C_LIKE, ResourceExhaustion, Medium, r"(\bwhile\s*\(\s*(true|1)\s*\)|\bfor\s*\(\s*;\s*;\s*\))", "potentially infinite loop"),
    ]
};

static RULES: LazyLock<Vec<PatternRule>> = LazyLock::new(|| {
    RULE_TABLE
        .iter()
        .map(|&(id, languages, violation_type, threat_level, pattern, description)| PatternRule {
            id,
            languages,
            violation_type,
            threat_level,
            description,
            unbounded_loop: id.ends_with("spin_loop"),
            leading_boundary: pattern.starts_with(BOUNDARY),
            regex: Regex::new(&format!("(?m){pattern}")).expect("static scanner pattern"),
        })
        .collect()
});

static LOOP_EXIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(break|return|exit|_exit|quit|panic!|goto)\b").expect("static regex")
});

/// `ex "os/exec"`, alone or inside an import block.
static GO_EXEC_ALIAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*(?:import[ \t]+)?([A-Za-z_]\w*)[ \t]+"os/exec""#).expect("static regex")
});

const MAX_SNIPPET_CHARS: usize = 120;

/// Regex plus syntax scanner.
#[derive(Debug, Clone, Default)]
pub struct SecurityScanner {
    policy: ScanPolicy,
}

impl SecurityScanner {
    pub fn new(policy: ScanPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ScanPolicy {
        &self.policy
    }

    /// All findings for `code`, deduplicated and policy-adjusted.
    pub fn scan(&self, code: &str, language: Language) -> Vec<SecurityViolation> {
        let mut findings = Vec::new();

        for rule in RULES.iter().filter(|r| r.languages.contains(&language)) {
            for m in rule.regex.find_iter(code) {
                let start = match code[m.start()..].chars().next() {
                    Some(c) if rule.leading_boundary && !(c.is_alphanumeric() || c == '_') => {
                        m.start() + c.len_utf8()
                    }
                    _ => m.start(),
                };
                let location = CodeLocation::from_offset(code, start);

                let unbounded =
                    rule.unbounded_loop && !loop_has_exit(code, language, m.start(), m.end());
                let (level, description) = if unbounded {
                    (
                        ThreatLevel::Critical,
                        format!("{} with no exit statement", rule.description),
                    )
                } else {
                    (rule.threat_level, rule.description.to_string())
                };

                findings.push(
                    SecurityViolation::new(
                        rule.id,
                        rule.violation_type,
                        level,
                        description,
                        Some(location),
                    )
                    .with_snippet(line_snippet(code, location.line)),
                );
            }
        }

        if language == Language::Go {
            findings.extend(go_exec_alias_calls(code));
        }
        if self.policy.syntax_inspection {
            findings.extend(syntax::inspect(code, language));
        }

        let mut findings = dedupe(findings);
        for v in &mut findings {
            let demote = match v.violation_type {
                ViolationType::NetworkAccess => self.policy.allow_network,
                ViolationType::FileAccess => self.policy.allow_file_access,
                _ => false,
            };
            if demote {
                v.threat_level = ThreatLevel::Low;
            }
        }
        findings
    }

    /// Scan and judge against the policy.
    pub fn report(&self, code: &str, language: Language) -> ScanReport {
        self.report_with(code, language, None)
    }

    /// Scan and judge against the policy, tightened by caller requirements.
    pub fn report_with(
        &self,
        code: &str,
        language: Language,
        requirements: Option<&SecurityRequirements>,
    ) -> ScanReport {
        let violations = self.scan(code, language);
        let score = risk_score(&violations);

        let reason = if let Some(critical) = violations.iter().find(|v| v.is_critical()) {
            Some(format!(
                "critical {} violation: {}",
                critical.violation_type, critical.description
            ))
        } else if violations.len() > self.policy.max_violations {
            Some(format!(
                "{} violations exceed the limit of {}",
                violations.len(),
                self.policy.max_violations
            ))
        } else {
            requirements.and_then(|req| requirement_breach(req, violations.len(), score))
        };

        ScanReport {
            blocked: reason.is_some(),
            reason,
            risk_score: score,
            violations,
        }
    }
}

fn requirement_breach(req: &SecurityRequirements, count: usize, score: f64) -> Option<String> {
    if let Some(max) = req.max_risk_score {
        if score > max {
            return Some(format!("risk score {score:.1} exceeds requested maximum {max:.1}"));
        }
    }
    if let Some(max) = req.max_violations {
        if count > max {
            return Some(format!(
                "{count} violations exceed requested maximum {max}"
            ));
        }
    }
    None
}

/// Keep the most severe finding per `(type, line)`, in source order.
fn dedupe(findings: Vec<SecurityViolation>) -> Vec<SecurityViolation> {
    let mut best: HashMap<(ViolationType, usize), usize> = HashMap::new();
    let mut kept: Vec<SecurityViolation> = Vec::new();

    for v in findings {
        let line = v.location.map(|l| l.line).unwrap_or(0);
        match best.get(&(v.violation_type, line)) {
            Some(&idx) => {
                if v.threat_level > kept[idx].threat_level {
                    kept[idx] = v;
                }
            }
            None => {
                best.insert((v.violation_type, line), kept.len());
                kept.push(v);
            }
        }
    }

    kept.sort_by_key(|v| v.location.map(|l| (l.line, l.column)).unwrap_or((0, 0)));
    kept
}

/// Calls through a renamed `os/exec` import: `ex.Command(...)`.
fn go_exec_alias_calls(code: &str) -> Vec<SecurityViolation> {
    let mut findings = Vec::new();
    for caps in GO_EXEC_ALIAS.captures_iter(code) {
        let alias = &caps[1];
        if matches!(alias, "_" | "exec" | "import") {
            continue;
        }
        let pattern = format!(
            r"\b{}\s*\.\s*(Command|CommandContext)\s*\(",
            regex::escape(alias)
        );
        let Ok(call) = Regex::new(&pattern) else {
            continue;
        };
        for m in call.find_iter(code) {
            let location = CodeLocation::from_offset(code, m.start());
            findings.push(
                SecurityViolation::new(
                    "go.exec_alias",
                    ViolationType::SystemCommand,
                    ThreatLevel::Critical,
                    format!("process spawn through os/exec imported as {alias}"),
                    Some(location),
                )
                .with_snippet(line_snippet(code, location.line)),
            );
        }
    }
    findings
}

/// Whether the body of the loop whose header spans `start..end` contains an
/// exit statement.
fn loop_has_exit(code: &str, language: Language, start: usize, end: usize) -> bool {
    let body = if language == Language::Python {
        indented_block(code, start, end)
    } else {
        brace_block(code, start, end)
    };
    LOOP_EXIT.is_match(body)
}

/// The inline body after the header's `:` plus every following line indented
/// deeper than the header.
fn indented_block(code: &str, start: usize, end: usize) -> &str {
    let indent = |line: &str| line.len() - line.trim_start().len();
    let line_start = code[..start].rfind('\n').map_or(0, |i| i + 1);
    let header_indent = indent(&code[line_start..]);

    let mut block_end = code[end..].find('\n').map_or(code.len(), |i| end + i);
    let mut cursor = block_end;
    while cursor < code.len() {
        let next = cursor + 1;
        let line_end = code[next..].find('\n').map_or(code.len(), |i| next + i);
        let line = &code[next..line_end];
        if !line.trim().is_empty() {
            if indent(line) <= header_indent {
                break;
            }
            block_end = line_end;
        }
        cursor = line_end;
    }
    &code[end..block_end]
}

/// The brace block after a loop header, or the single statement up to `;`.
/// A header followed directly by `;` closes a `do { ... } while` loop, whose
/// body is the block before it.
fn brace_block(code: &str, start: usize, end: usize) -> &str {
    let open = if code[..end].ends_with('{') {
        end - 1
    } else {
        end + (code[end..].len() - code[end..].trim_start().len())
    };
    let rest = &code[open..];
    if rest.starts_with('{') {
        return matching_block(rest);
    }
    if rest.starts_with(';') && code[..start].trim_end().ends_with('}') {
        return preceding_block(code[..start].trim_end());
    }
    &rest[..rest.find(';').unwrap_or(rest.len())]
}

/// `{ ... }` at the head of `text`, through its matching brace.
fn matching_block(text: &str) -> &str {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '`' => quote = Some(c),
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &text[..=i];
                }
            }
            _ => {}
        }
    }
    text
}

/// `{ ... }` at the tail of `text`, from its matching brace.
fn preceding_block(text: &str) -> &str {
    let mut depth = 0usize;
    for (i, c) in text.char_indices().rev() {
        match c {
            '}' => depth += 1,
            '{' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &text[i..];
                }
            }
            _ => {}
        }
    }
    text
}

fn line_snippet(code: &str, line: usize) -> String {
    let text = code.lines().nth(line.saturating_sub(1)).unwrap_or("").trim();
    if text.chars().count() > MAX_SNIPPET_CHARS {
        let cut: String = text.chars().take(MAX_SNIPPET_CHARS).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> SecurityScanner {
        SecurityScanner::new(ScanPolicy::default())
    }

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(RULES.len(), RULE_TABLE.len());
    }

    #[test]
    fn test_clean_code_passes() {
        let report = scanner().report("print('hi')\n", Language::Python);
        assert!(report.passed());
        assert!(report.violations.is_empty());
        assert_eq!(report.risk_score, 0.0);
    }

    #[test]
    fn test_os_system_is_critical_and_blocked() {
        let report = scanner().report("import os\nos.system('rm -rf /')", Language::Python);
        assert!(report.blocked);
        let v = report
            .violations
            .iter()
            .find(|v| v.violation_type == ViolationType::SystemCommand)
            .unwrap();
        assert_eq!(v.threat_level, ThreatLevel::Critical);
        assert_eq!(v.location.unwrap().line, 2);
        assert_eq!(v.snippet.as_deref(), Some("os.system('rm -rf /')"));
    }

    #[test]
    fn test_critical_idiom_in_every_language() {
        let cases = [
            (Language::Javascript, "require('child_process').execSync('ls')"),
            (Language::Typescript, "import { execSync } from 'child_process';\nexecSync('ls');"),
            (Language::Java, "Runtime.getRuntime().exec(\"ls\");"),
            (Language::Cpp, "#include <cstdlib>\nint main(){ system(\"ls\"); }"),
            (Language::Csharp, "Process.Start(\"ls\");"),
            (Language::Go, "exec.Command(\"ls\").Run()"),
            (Language::Rust, "std::process::Command::new(\"ls\").status();"),
        ];
        for (lang, code) in cases {
            let report = scanner().report(code, lang);
            assert!(report.blocked, "{lang} should be blocked: {report:?}");
        }
    }

    #[test]
    fn test_spin_loop_without_exit_is_critical() {
        let report = scanner().report("while True: pass", Language::Python);
        assert!(report.blocked);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(
            report.violations[0].violation_type,
            ViolationType::ResourceExhaustion
        );
        assert!(report.violations[0].is_critical());
    }

    #[test]
    fn test_spin_loop_with_break_is_not_blocked() {
        let code = "n = 0\nwhile True:\n    n += 1\n    if n > 3:\n        break\n";
        let report = scanner().report(code, Language::Python);
        assert!(!report.blocked, "{report:?}");
        assert_eq!(report.violations[0].threat_level, ThreatLevel::Medium);
    }

    #[test]
    fn test_exit_outside_loop_body_does_not_clear_it() {
        let cases = [
            (Language::Python, "def f():\n    return 1\nwhile True: pass\n"),
            (Language::Python, "while True:\n    n = 1\nif n:\n    exit(0)\n"),
            (Language::Javascript, "function f() { return 1; }\nwhile (true) { f(); }"),
            (Language::Rust, "fn f() -> u8 { return 1 }\nfn main() { loop { f(); } }"),
            (Language::Go, "func f() int { return 1 }\nfunc main() {\n\tfor {\n\t\tf()\n\t}\n}"),
        ];
        for (lang, code) in cases {
            let report = scanner().report(code, lang);
            assert!(report.blocked, "{lang} should be blocked: {report:?}");
            assert!(report
                .violations
                .iter()
                .any(|v| v.violation_type == ViolationType::ResourceExhaustion && v.is_critical()));
        }
    }

    #[test]
    fn test_exit_inside_nested_block_clears_loop() {
        let cases = [
            (Language::Go, "func main() {\n\tfor {\n\t\tif done() {\n\t\t\tbreak\n\t\t}\n\t}\n}"),
            (Language::Cpp, "int main() { int x = 0; do { x++; if (x > 3) break; } while (true); }"),
            (Language::Java, "for (;;) { if (ready()) { return; } }"),
            (Language::Python, "while True: break"),
        ];
        for (lang, code) in cases {
            let report = scanner().report(code, lang);
            assert!(!report.blocked, "{lang} should pass: {report:?}");
            assert_eq!(report.violations[0].threat_level, ThreatLevel::Medium);
        }
    }

    #[test]
    fn test_aliased_process_spawn_is_blocked() {
        let cases = [
            (Language::Python, "from os import system\nsystem('id')"),
            (Language::Python, "from os import execvp as go\ngo('sh', ['sh'])"),
            (Language::Python, "import subprocess as sp\nsp.run(['ls'])"),
            (Language::Javascript, "const cp = require('child_process'); cp.exec('ls')"),
            (Language::Typescript, "import * as proc from 'child_process';\nproc.spawn('ls');"),
            (Language::Java, "Runtime r = Runtime.getRuntime();\nr.exec(\"ls\");"),
            (Language::Go, "package main\nimport ex \"os/exec\"\nfunc main() { ex.Command(\"ls\").Run() }"),
            (Language::Csharp, "var p = new Process();\np.Start();"),
            (Language::Rust, "use std::process::Command as Sh;\nfn main() { Sh::new(\"ls\").status(); }"),
        ];
        for (lang, code) in cases {
            let report = scanner().report(code, lang);
            assert!(report.blocked, "{lang} should be blocked: {code}");
            assert!(report.reason.unwrap().starts_with("critical"));
        }
    }

    #[test]
    fn test_go_alias_call_is_reported_at_call_site() {
        let code = "package main\n\nimport (\n\t\"fmt\"\n\tex \"os/exec\"\n)\n\nfunc main() {\n\tfmt.Println(ex.Command(\"ls\"))\n}\n";
        let found = scanner().scan(code, Language::Go);
        let lines: Vec<_> = found
            .iter()
            .filter(|v| v.violation_type == ViolationType::SystemCommand && v.is_critical())
            .map(|v| (v.id.split(':').next().unwrap_or_default().to_string(), v.location.unwrap().line))
            .collect();
        assert_eq!(
            lines,
            vec![("go.exec_import".to_string(), 5), ("go.exec_alias".to_string(), 9)]
        );
    }

    #[test]
    fn test_network_demoted_when_allowed() {
        let code = "import socket\ns = socket.socket()";
        let strict = scanner().scan(code, Language::Python);
        assert!(strict
            .iter()
            .any(|v| v.violation_type == ViolationType::NetworkAccess
                && v.threat_level == ThreatLevel::High));

        let relaxed = SecurityScanner::new(ScanPolicy {
            allow_network: true,
            ..ScanPolicy::default()
        })
        .scan(code, Language::Python);
        assert!(relaxed
            .iter()
            .filter(|v| v.violation_type == ViolationType::NetworkAccess)
            .all(|v| v.threat_level == ThreatLevel::Low));
    }

    #[test]
    fn test_dedupe_keeps_most_severe_per_line() {
        // Regex and syntax pass both report eval on line 1.
        let found = scanner().scan("x = eval('1')", Language::Python);
        let injections: Vec<_> = found
            .iter()
            .filter(|v| v.violation_type == ViolationType::CodeInjection)
            .collect();
        assert_eq!(injections.len(), 1);
    }

    #[test]
    fn test_violation_ceiling_blocks() {
        let code = (0..7)
            .map(|i| format!("f{i} = open('f{i}.txt')"))
            .collect::<Vec<_>>()
            .join("\n");
        let report = SecurityScanner::new(ScanPolicy {
            allow_file_access: false,
            ..ScanPolicy::default()
        })
        .report(&code, Language::Python);
        assert_eq!(report.violations.len(), 7);
        assert!(report.blocked);
        assert!(report.reason.unwrap().contains("exceed the limit"));
    }

    #[test]
    fn test_requirements_tighten_policy() {
        let code = "data = open('in.txt').read()";
        let lenient = scanner().report(code, Language::Python);
        assert!(!lenient.blocked);

        let req = SecurityRequirements {
            max_risk_score: Some(0.5),
            max_violations: None,
        };
        let strict = scanner().report_with(code, Language::Python, Some(&req));
        assert!(strict.blocked);
    }
}
