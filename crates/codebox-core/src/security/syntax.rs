//! Token-level syntax inspection for Python, JavaScript and TypeScript.
//!
//! A small lexer splits the source into identifiers, punctuation and string
//! literals while discarding comments. Rules then look at token sequences,
//! so text inside comments never matches and string contents are only
//! inspected where they are arguments (`require("child_process")`,
//! `getattr(obj, "system")`).
//!
//! Imports of process-spawning modules and functions are remembered under
//! the local name they bind, so `from os import system as s; s("id")` and
//! `const cp = require("child_process"); cp.exec(...)` are caught at the call.

use std::collections::HashMap;

use crate::language::Language;

use super::violation::{CodeLocation, SecurityViolation, ThreatLevel, ViolationType};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Punct(char),
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

impl Token {
    fn ident(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Ident(s) => Some(s),
            _ => None,
        }
    }

    fn string(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Str(s) => Some(s),
            _ => None,
        }
    }

    fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct(c)
    }
}

fn tokenize(code: &str, language: Language) -> Vec<Token> {
    let bytes = code.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    let python = language == Language::Python;

    while i < bytes.len() {
        let c = bytes[i];

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // Comments.
        if python && c == b'#' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if !python && c == b'/' && i + 1 < bytes.len() {
            if bytes[i + 1] == b'/' {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            if bytes[i + 1] == b'*' {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
                continue;
            }
        }

        // String literals.
        if c == b'"' || c == b'\'' || (!python && c == b'`') {
            let start = i;
            let triple = python
                && i + 2 < bytes.len()
                && bytes[i + 1] == c
                && bytes[i + 2] == c;
            let (open_len, content_start) = if triple { (3, i + 3) } else { (1, i + 1) };
            let mut j = content_start;
            let mut end = bytes.len();
            while j < bytes.len() {
                if bytes[j] == b'\\' {
                    j += 2;
                    continue;
                }
                if triple {
                    if j + 2 < bytes.len()
                        && bytes[j] == c
                        && bytes[j + 1] == c
                        && bytes[j + 2] == c
                    {
                        end = j;
                        break;
                    }
                } else if bytes[j] == c || (bytes[j] == b'\n' && c != b'`') {
                    end = j;
                    break;
                }
                j += 1;
            }
            let content_end = end.min(bytes.len());
            let content = code
                .get(content_start.min(content_end)..content_end)
                .unwrap_or_default()
                .to_string();
            tokens.push(Token {
                kind: TokenKind::Str(content),
                offset: start,
            });
            i = if end >= bytes.len() {
                bytes.len()
            } else {
                end + open_len
            };
            continue;
        }

        // Identifiers (ASCII plus any non-ASCII byte run).
        if c == b'_' || c == b'$' || c.is_ascii_alphabetic() || c >= 0x80 {
            let start = i;
            while i < bytes.len()
                && (bytes[i] == b'_'
                    || bytes[i] == b'$'
                    || bytes[i].is_ascii_alphanumeric()
                    || bytes[i] >= 0x80)
            {
                i += 1;
            }
            let text = code.get(start..i).unwrap_or_default().to_string();
            tokens.push(Token {
                kind: TokenKind::Ident(text),
                offset: start,
            });
            continue;
        }

        if c.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                i += 1;
            }
            continue;
        }

        tokens.push(Token {
            kind: TokenKind::Punct(c as char),
            offset: i,
        });
        i += 1;
    }

    tokens
}

const PY_INJECTION_CALLS: &[&str] = &["exec", "eval", "compile", "__import__"];
const JS_INJECTION_CALLS: &[&str] = &["eval", "Function"];
const PY_DANGEROUS_ATTRS: &[&str] = &["system", "popen", "fork", "execv", "execve", "spawnv"];
const JS_DANGEROUS_ATTRS: &[&str] = &["execSync", "spawnSync", "execFileSync", "system", "popen"];

/// `os` functions that start or replace processes.
const PY_PROCESS_FUNCS: &[&str] = &[
    "system", "popen", "fork", "forkpty", "execl", "execle", "execlp", "execlpe", "execv",
    "execve", "execvp", "execvpe", "spawnl", "spawnle", "spawnlp", "spawnlpe", "spawnv",
    "spawnve", "spawnvp", "spawnvpe", "posix_spawn", "posix_spawnp",
];
const PY_SUBPROCESS_FUNCS: &[&str] = &[
    "run", "call", "Popen", "check_output", "check_call", "getoutput", "getstatusoutput",
];

fn dangerous_module(language: Language, module: &str) -> Option<ThreatLevel> {
    let root = module.split('.').next().unwrap_or(module);
    match language {
        Language::Python => match root {
            "subprocess" | "pty" => Some(ThreatLevel::Critical),
            "ctypes" => Some(ThreatLevel::High),
            "socket" | "multiprocessing" | "shutil" => Some(ThreatLevel::Medium),
            "os" | "posix" => Some(ThreatLevel::Low),
            _ => None,
        },
        _ => match module.trim_start_matches("node:") {
            "child_process" => Some(ThreatLevel::Critical),
            "worker_threads" | "vm" => Some(ThreatLevel::High),
            "net" | "http" | "https" | "dgram" | "fs" | "cluster" => Some(ThreatLevel::Medium),
            _ => None,
        },
    }
}

/// What an imported name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    /// A module whose listed functions spawn processes (`os`).
    OsModule,
    /// A module whose every call spawns a process (`subprocess`, `child_process`).
    SpawnModule,
    /// A function that spawns a process.
    SpawnFunction,
}

/// Names bound by import statements, keyed by the local name.
#[derive(Debug, Default)]
struct Bindings {
    names: HashMap<String, (Bound, String)>,
}

impl Bindings {
    fn bind(&mut self, local: &str, bound: Bound, origin: String) {
        self.names.insert(local.to_string(), (bound, origin));
    }

    fn get(&self, local: &str) -> Option<&(Bound, String)> {
        self.names.get(local)
    }
}

/// One name brought in by an import: `from module import name as local`.
struct Imported {
    module: String,
    name: Option<String>,
    local: String,
}

fn dotted(tokens: &[Token], mut i: usize) -> (String, usize) {
    let mut path = String::new();
    while let Some(t) = tokens.get(i) {
        match &t.kind {
            TokenKind::Punct('.') => path.push('.'),
            TokenKind::Ident(s) if path.is_empty() || path.ends_with('.') => path.push_str(s),
            _ => break,
        }
        i += 1;
    }
    (path, i)
}

/// `as <ident>` at `i`, if present.
fn py_alias(tokens: &[Token], i: usize) -> (Option<String>, usize) {
    if tokens.get(i).and_then(Token::ident) == Some("as") {
        if let Some(alias) = tokens.get(i + 1).and_then(Token::ident) {
            return (Some(alias.to_string()), i + 2);
        }
    }
    (None, i)
}

/// Parse the import statement starting at `idx` (`import ...` or
/// `from ... import ...`), returning what it binds and the index past it.
fn python_import(tokens: &[Token], idx: usize) -> (Vec<Imported>, usize) {
    let mut out = Vec::new();
    let mut i = idx + 1;
    match tokens[idx].ident() {
        Some("import") => loop {
            let (module, next) = dotted(tokens, i);
            if module.is_empty() {
                break;
            }
            let (alias, next) = py_alias(tokens, next);
            let local = alias.unwrap_or_else(|| {
                module.split('.').next().unwrap_or_default().to_string()
            });
            out.push(Imported {
                module,
                name: None,
                local,
            });
            i = next;
            if !tokens.get(i).is_some_and(|t| t.is_punct(',')) {
                break;
            }
            i += 1;
        },
        Some("from") => {
            let (module, next) = dotted(tokens, i);
            i = next;
            if module.is_empty() || tokens.get(i).and_then(Token::ident) != Some("import") {
                return (out, i);
            }
            i += 1;
            if tokens.get(i).is_some_and(|t| t.is_punct('(')) {
                i += 1;
            }
            if tokens.get(i).is_some_and(|t| t.is_punct('*')) {
                out.push(Imported {
                    module,
                    name: Some("*".into()),
                    local: "*".into(),
                });
                return (out, i + 1);
            }
            while let Some(name) = tokens.get(i).and_then(Token::ident) {
                let (alias, next) = py_alias(tokens, i + 1);
                out.push(Imported {
                    module: module.clone(),
                    name: Some(name.to_string()),
                    local: alias.unwrap_or_else(|| name.to_string()),
                });
                i = next;
                if !tokens.get(i).is_some_and(|t| t.is_punct(',')) {
                    break;
                }
                i += 1;
            }
        }
        _ => {}
    }
    (out, i)
}

/// Binding pattern of a JS import: `X`, `* as X`, `{ a, b as c }`, or
/// `{ a, b: c }` on the left of `= require(...)`.
fn js_pattern(pattern: &[Token], module: &str) -> Vec<Imported> {
    let mut out = Vec::new();
    let mut in_braces = false;
    let mut i = 0;
    while i < pattern.len() {
        let tok = &pattern[i];
        if tok.is_punct('{') {
            in_braces = true;
        } else if tok.is_punct('}') {
            in_braces = false;
        } else if tok.is_punct('*') {
            if let Some(local) = pattern.get(i + 2).and_then(Token::ident) {
                out.push(Imported {
                    module: module.to_string(),
                    name: None,
                    local: local.to_string(),
                });
                i += 2;
            }
        } else if let Some(name) = tok.ident() {
            let renamed = pattern
                .get(i + 1)
                .is_some_and(|t| t.ident() == Some("as") || t.is_punct(':'));
            let local = if renamed {
                i += 2;
                pattern.get(i).and_then(Token::ident).unwrap_or(name)
            } else {
                name
            };
            if name != "type" {
                out.push(Imported {
                    module: module.to_string(),
                    name: in_braces.then(|| name.to_string()),
                    local: local.to_string(),
                });
            }
        }
        i += 1;
    }
    out
}

/// Module named by `require("m")`, `import("m")` or `from "m"` at `idx`.
fn js_module_at(tokens: &[Token], idx: usize) -> Option<&str> {
    let name = tokens[idx].ident()?;
    let next = tokens.get(idx + 1);
    match name {
        "require" => next
            .filter(|n| n.is_punct('('))
            .and_then(|_| tokens.get(idx + 2))
            .and_then(Token::string),
        "from" | "import" => next.and_then(Token::string).or_else(|| {
            next.filter(|n| n.is_punct('('))
                .and_then(|_| tokens.get(idx + 2))
                .and_then(Token::string)
        }),
        _ => None,
    }
}

/// Names a JS import statement binds, found by walking back from the
/// module reference at `idx` to its `import` or `const`/`let`/`var`.
fn js_import(tokens: &[Token], idx: usize, module: &str) -> Vec<Imported> {
    const LOOKBACK: usize = 32;
    let (keywords, end): (&[&str], usize) = match tokens[idx].ident() {
        Some("from") => (&["import"], idx),
        Some("require") if idx > 0 && tokens[idx - 1].is_punct('=') => {
            (&["const", "let", "var"], idx - 1)
        }
        _ => return Vec::new(),
    };
    (end.saturating_sub(LOOKBACK)..end)
        .rev()
        .find(|&i| tokens[i].ident().is_some_and(|k| keywords.contains(&k)))
        .map(|start| js_pattern(&tokens[start + 1..end], module))
        .unwrap_or_default()
}

/// Import findings plus the process-spawning names they bind.
fn inspect_imports(
    code: &str,
    tokens: &[Token],
    language: Language,
) -> (Vec<SecurityViolation>, Bindings) {
    let python = language == Language::Python;
    let mut bindings = Bindings::default();
    let mut findings = Vec::new();
    let mut resume = 0;

    for (idx, tok) in tokens.iter().enumerate() {
        if idx < resume {
            continue;
        }
        let after_dot = idx
            .checked_sub(1)
            .and_then(|p| tokens.get(p))
            .is_some_and(|p| p.is_punct('.'));
        if after_dot {
            continue;
        }

        let (mut module, imported) = if python {
            if !matches!(tok.ident(), Some("import" | "from")) {
                continue;
            }
            let (imported, end) = python_import(tokens, idx);
            resume = end;
            let Some(first) = imported.first() else {
                continue;
            };
            (first.module.clone(), imported)
        } else {
            let Some(module) = js_module_at(tokens, idx) else {
                continue;
            };
            (module.to_string(), js_import(tokens, idx, module))
        };

        let mut level = dangerous_module(language, &module);
        for item in &imported {
            let item_level = dangerous_module(language, &item.module);
            if item_level > level {
                module = item.module.clone();
                level = item_level;
            }
        }
        let mut description = format!("import of sensitive module {module}");
        for item in &imported {
            let root = item.module.split('.').next().unwrap_or_default();
            let spawner = if python {
                matches!(root, "subprocess" | "pty")
            } else {
                item.module.trim_start_matches("node:") == "child_process"
            };
            let os_like = python && matches!(root, "os" | "posix");
            let origin = match &item.name {
                Some(name) => format!("{}.{name}", item.module),
                None => item.module.clone(),
            };

            match item.name.as_deref() {
                Some("*") if os_like || spawner => {
                    let funcs = if spawner { PY_SUBPROCESS_FUNCS } else { PY_PROCESS_FUNCS };
                    for func in funcs {
                        let origin = format!("{}.{func}", item.module);
                        bindings.bind(func, Bound::SpawnFunction, origin);
                    }
                    level = Some(ThreatLevel::Critical);
                    description = format!("wildcard import of {}", item.module);
                }
                Some(name) if os_like && PY_PROCESS_FUNCS.contains(&name) => {
                    description = format!("import of process function {origin}");
                    bindings.bind(&item.local, Bound::SpawnFunction, origin);
                    level = Some(ThreatLevel::Critical);
                }
                Some(_) if spawner => bindings.bind(&item.local, Bound::SpawnFunction, origin),
                None if spawner => bindings.bind(&item.local, Bound::SpawnModule, origin),
                None if os_like => bindings.bind(&item.local, Bound::OsModule, origin),
                _ => {}
            }
        }

        if let Some(level) = level {
            findings.push(
                SecurityViolation::new(
                    "syntax.dangerous_import",
                    ViolationType::DangerousImport,
                    level,
                    description,
                    Some(CodeLocation::from_offset(code, tok.offset)),
                )
                .with_snippet(module),
            );
        }
    }
    (findings, bindings)
}

/// A call made through an imported name: `system(...)` after
/// `from os import system`, or `sp.run(...)` after `import subprocess as sp`.
fn bound_call(tokens: &[Token], idx: usize, bindings: &Bindings) -> Option<String> {
    let name = tokens[idx].ident()?;
    let (bound, origin) = bindings.get(name)?;
    let next = tokens.get(idx + 1)?;
    match bound {
        Bound::SpawnFunction => next.is_punct('(').then(|| origin.clone()),
        Bound::SpawnModule | Bound::OsModule => {
            if !next.is_punct('.') {
                return None;
            }
            let member = tokens.get(idx + 2)?.ident()?;
            let called = tokens.get(idx + 3).is_some_and(|t| t.is_punct('('));
            let spawns = *bound == Bound::SpawnModule || PY_PROCESS_FUNCS.contains(&member);
            (called && spawns).then(|| format!("{origin}.{member}"))
        }
    }
}

/// Run the token-level rules over `code`. Languages without a lexer here
/// yield nothing.
pub fn inspect(code: &str, language: Language) -> Vec<SecurityViolation> {
    if !language.supports_syntax_inspection() {
        return Vec::new();
    }

    let tokens = tokenize(code, language);
    let python = language == Language::Python;
    let (calls, attrs) = if python {
        (PY_INJECTION_CALLS, PY_DANGEROUS_ATTRS)
    } else {
        (JS_INJECTION_CALLS, JS_DANGEROUS_ATTRS)
    };

    let (mut findings, bindings) = inspect_imports(code, &tokens, language);
    let loc = |offset: usize| Some(CodeLocation::from_offset(code, offset));

    for (idx, tok) in tokens.iter().enumerate() {
        let prev = idx.checked_sub(1).and_then(|p| tokens.get(p));
        let next = tokens.get(idx + 1);
        let after_dot = prev.is_some_and(|p| p.is_punct('.'));

        let Some(name) = tok.ident() else {
            continue;
        };

        // Bare injection calls: eval(...), exec(...), new Function(...).
        if calls.contains(&name) && !after_dot && next.is_some_and(|n| n.is_punct('(')) {
            let level = if name == "compile" {
                ThreatLevel::Medium
            } else {
                ThreatLevel::High
            };
            findings.push(
                SecurityViolation::new(
                    "syntax.injection_call",
                    ViolationType::CodeInjection,
                    level,
                    format!("call to {name}() executes dynamically constructed code"),
                    loc(tok.offset),
                )
                .with_snippet(name),
            );
            continue;
        }

        // Calls through names bound to process-spawning imports.
        if !after_dot {
            if let Some(target) = bound_call(&tokens, idx, &bindings) {
                findings.push(
                    SecurityViolation::new(
                        "syntax.process_call",
                        ViolationType::SystemCommand,
                        ThreatLevel::Critical,
                        format!("call to {name} resolves to {target}"),
                        loc(tok.offset),
                    )
                    .with_snippet(name),
                );
                continue;
            }
        }

        // Dangerous attribute access: os.system, os.popen, cp.execSync.
        if after_dot && attrs.contains(&name) {
            findings.push(
                SecurityViolation::new(
                    "syntax.dangerous_attribute",
                    ViolationType::DangerousAttribute,
                    ThreatLevel::Critical,
                    format!("access to dangerous attribute .{name}"),
                    loc(tok.offset),
                )
                .with_snippet(format!(".{name}")),
            );
            continue;
        }

        // getattr(obj, "system")
        if python && name == "getattr" && next.is_some_and(|n| n.is_punct('(')) {
            let target = tokens[idx + 1..]
                .iter()
                .take(8)
                .take_while(|t| !t.is_punct(')'))
                .find_map(|t| t.string());
            if let Some(attr) = target {
                if attrs.contains(&attr) {
                    findings.push(SecurityViolation::new(
                        "syntax.getattr_dangerous",
                        ViolationType::DangerousAttribute,
                        ThreatLevel::Critical,
                        format!("getattr lookup of dangerous attribute {attr:?}"),
                        loc(tok.offset),
                    ));
                }
            }
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(code: &str, language: Language) -> Vec<(ViolationType, ThreatLevel)> {
        inspect(code, language)
            .into_iter()
            .map(|v| (v.violation_type, v.threat_level))
            .collect()
    }

    #[test]
    fn test_python_eval_and_exec_calls() {
        let found = types("x = eval(input())\nexec('print(1)')", Language::Python);
        assert_eq!(found.len(), 2);
        assert!(found
            .iter()
            .all(|(t, _)| *t == ViolationType::CodeInjection));
    }

    #[test]
    fn test_method_named_compile_is_not_flagged() {
        let found = types("import re\np = re.compile('a+')", Language::Python);
        assert!(found.is_empty(), "got {found:?}");
    }

    #[test]
    fn test_strings_and_comments_ignored() {
        let code = "# eval(x) here\nprint(\"call eval(x) later\")\ns = '''os.system('ls')'''";
        assert!(types(code, Language::Python).is_empty());
    }

    #[test]
    fn test_dangerous_attribute_is_critical() {
        let found = types("import os\nos.system('ls')", Language::Python);
        assert!(found.contains(&(ViolationType::DangerousAttribute, ThreatLevel::Critical)));
        assert!(found.contains(&(ViolationType::DangerousImport, ThreatLevel::Low)));
    }

    #[test]
    fn test_getattr_lookup() {
        let found = types("import os\ngetattr(os, 'system')('id')", Language::Python);
        assert!(found.contains(&(ViolationType::DangerousAttribute, ThreatLevel::Critical)));
    }

    #[test]
    fn test_python_from_import() {
        let found = types("from subprocess import run\n", Language::Python);
        assert_eq!(found, vec![(ViolationType::DangerousImport, ThreatLevel::Critical)]);
    }

    #[test]
    fn test_js_require_and_import() {
        let found = types(
            "const cp = require('child_process');\nimport net from \"node:net\";\n// require('vm')",
            Language::Javascript,
        );
        assert_eq!(
            found,
            vec![
                (ViolationType::DangerousImport, ThreatLevel::Critical),
                (ViolationType::DangerousImport, ThreatLevel::Medium),
            ]
        );
    }

    fn process_calls(code: &str, language: Language) -> Vec<String> {
        inspect(code, language)
            .into_iter()
            .filter(|v| v.id.starts_with("syntax.process_call"))
            .map(|v| v.description)
            .collect()
    }

    #[test]
    fn test_python_imported_names_are_tracked() {
        let found = types("from os import system as s, path
s('id')
", Language::Python);
        assert_eq!(
            found,
            vec![
                (ViolationType::DangerousImport, ThreatLevel::Critical),
                (ViolationType::SystemCommand, ThreatLevel::Critical),
            ]
        );
        assert_eq!(
            process_calls("from os import (\n    execvp,\n)\nexecvp('sh', ['sh'])", Language::Python),
            vec!["call to execvp resolves to os.execvp"]
        );
        assert_eq!(
            process_calls("import subprocess as sp\nsp.run(['ls'])", Language::Python),
            vec!["call to sp resolves to subprocess.run"]
        );
        assert_eq!(process_calls("import os as o\no.execl('/bin/sh', 'sh')", Language::Python).len(), 1);
        assert_eq!(process_calls("from os import *\nspawnlp(0, 'ls', 'ls')", Language::Python).len(), 1);
    }

    #[test]
    fn test_python_harmless_os_names_are_not_calls() {
        let code = "import os\nfrom os import path, getcwd\nprint(getcwd(), os.listdir('.'))";
        assert!(process_calls(code, Language::Python).is_empty());
        assert_eq!(
            types(code, Language::Python),
            vec![
                (ViolationType::DangerousImport, ThreatLevel::Low),
                (ViolationType::DangerousImport, ThreatLevel::Low),
            ]
        );
    }

    #[test]
    fn test_js_bindings_are_tracked() {
        let code = "const cp = require('child_process');\ncp.exec('ls');";
        assert_eq!(process_calls(code, Language::Javascript), vec!["call to cp resolves to child_process.exec"]);

        let code = "const { spawn: run, fork } = require(\"node:child_process\");\nrun('ls');\nfork('w.js');";
        assert_eq!(process_calls(code, Language::Javascript).len(), 2);

        let code = "import * as proc from 'child_process';\nproc.spawn('ls');";
        assert_eq!(process_calls(code, Language::Typescript).len(), 1);

        let code = "import { execFile as ef } from 'child_process';\nef('ls', () => {});";
        assert_eq!(
            process_calls(code, Language::Typescript),
            vec!["call to ef resolves to child_process.execFile"]
        );
    }

    #[test]
    fn test_js_new_function_and_exec_sync() {
        let found = types(
            "const f = new Function('return 1');\ncp.execSync('ls');",
            Language::Typescript,
        );
        assert!(found.contains(&(ViolationType::CodeInjection, ThreatLevel::High)));
        assert!(found.contains(&(ViolationType::DangerousAttribute, ThreatLevel::Critical)));
    }

    #[test]
    fn test_unsupported_language_is_empty() {
        assert!(inspect("system(\"ls\");", Language::Cpp).is_empty());
    }
}
