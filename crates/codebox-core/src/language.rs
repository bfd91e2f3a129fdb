//! Supported languages and their per-language behaviour.
//!
//! Each [`Language`] knows its source file name, how to build and launch a
//! program, which keywords the sanitizer warns about, and how comments look
//! (used by quality analysis).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// Languages accepted by the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Typescript,
    Java,
    Cpp,
    Csharp,
    Go,
    Rust,
}

/// One process invocation: program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }
}

/// How to turn a source file into a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Optional compile step, run in the working directory first.
    pub compile: Option<CommandSpec>,
    /// The program under test.
    pub run: CommandSpec,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Python,
        Language::Javascript,
        Language::Typescript,
        Language::Java,
        Language::Cpp,
        Language::Csharp,
        Language::Go,
        Language::Rust,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Csharp => "csharp",
            Language::Go => "go",
            Language::Rust => "rust",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::Javascript => "js",
            Language::Typescript => "ts",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Csharp => "cs",
            Language::Go => "go",
            Language::Rust => "rs",
        }
    }

    /// Name of the source file written into the sandbox directory.
    ///
    /// Java requires the file name to match the public class.
    pub fn source_file_name(&self) -> String {
        match self {
            Language::Java => "Main.java".to_string(),
            other => format!("main.{}", other.file_extension()),
        }
    }

    /// Build the command table entry for this language.
    pub fn build_command(&self) -> LaunchPlan {
        match self {
            Language::Python => LaunchPlan {
                compile: None,
                run: CommandSpec::new("python3", &["-I", "-B", "main.py"]),
            },
            Language::Javascript => LaunchPlan {
                compile: None,
                run: CommandSpec::new("node", &["main.js"]),
            },
            Language::Typescript => LaunchPlan {
                compile: None,
                run: CommandSpec::new("ts-node", &["--transpile-only", "main.ts"]),
            },
            Language::Java => LaunchPlan {
                compile: Some(CommandSpec::new("javac", &["Main.java"])),
                run: CommandSpec::new("java", &["-Xss8m", "-cp", ".", "Main"]),
            },
            Language::Cpp => LaunchPlan {
                compile: Some(CommandSpec::new(
                    "g++",
                    &["-O2", "-std=c++17", "-o", "main", "main.cpp"],
                )),
                run: CommandSpec::new("./main", &[]),
            },
            Language::Csharp => LaunchPlan {
                compile: Some(CommandSpec::new("mcs", &["-out:main.exe", "main.cs"])),
                run: CommandSpec::new("mono", &["main.exe"]),
            },
            Language::Go => LaunchPlan {
                compile: Some(CommandSpec::new("go", &["build", "-o", "main", "main.go"])),
                run: CommandSpec::new("./main", &[]),
            },
            Language::Rust => LaunchPlan {
                compile: Some(CommandSpec::new("rustc", &["-O", "-o", "main", "main.rs"])),
                run: CommandSpec::new("./main", &[]),
            },
        }
    }

    /// Keywords the sanitizer reports as non-blocking warnings.
    pub fn dangerous_keywords(&self) -> &'static [&'static str] {
        match self {
            Language::Python => &[
                "import os",
                "import subprocess",
                "import socket",
                "import shutil",
                "import ctypes",
                "__import__",
                "eval(",
                "exec(",
                "open(",
            ],
            Language::Javascript | Language::Typescript => &[
                "require('child_process')",
                "require(\"child_process\")",
                "require('fs')",
                "require(\"fs\")",
                "process.env",
                "eval(",
                "Function(",
            ],
            Language::Java => &[
                "Runtime.getRuntime",
                "ProcessBuilder",
                "java.io.File",
                "java.net",
                "System.exit",
                "Class.forName",
            ],
            Language::Cpp => &["system(", "popen(", "fork(", "exec", "fopen(", "<fstream>"],
            Language::Csharp => &[
                "Process.Start",
                "System.IO.File",
                "System.Net",
                "DllImport",
                "Assembly.Load",
            ],
            Language::Go => &["os/exec", "syscall", "unsafe", "net/http", "os.Remove"],
            Language::Rust => &[
                "std::process",
                "std::fs",
                "std::net",
                "unsafe",
                "libc::",
            ],
        }
    }

    /// Line-comment prefix, used by quality analysis.
    pub fn line_comment(&self) -> &'static str {
        match self {
            Language::Python => "#",
            _ => "//",
        }
    }

    /// Whether the token-level syntax pass understands this language.
    pub fn supports_syntax_inspection(&self) -> bool {
        matches!(
            self,
            Language::Python | Language::Javascript | Language::Typescript
        )
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" | "python3" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            "typescript" | "ts" => Ok(Language::Typescript),
            "java" => Ok(Language::Java),
            "cpp" | "c++" => Ok(Language::Cpp),
            "csharp" | "c#" | "cs" => Ok(Language::Csharp),
            "go" | "golang" => Ok(Language::Go),
            "rust" | "rs" => Ok(Language::Rust),
            other => Err(SandboxError::security(format!(
                "unsupported language: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("c++".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("C#".parse::<Language>().unwrap(), Language::Csharp);
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_display_roundtrips_through_parse() {
        for lang in Language::ALL {
            assert_eq!(lang.to_string().parse::<Language>().unwrap(), lang);
        }
    }

    #[test]
    fn test_compiled_languages_have_compile_step() {
        assert!(Language::Python.build_command().compile.is_none());
        assert!(Language::Cpp.build_command().compile.is_some());
        assert!(Language::Java.build_command().compile.is_some());
        assert_eq!(Language::Java.source_file_name(), "Main.java");
        assert_eq!(Language::Go.source_file_name(), "main.go");
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&Language::Typescript).unwrap();
        assert_eq!(json, "\"typescript\"");
    }
}
