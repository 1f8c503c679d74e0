use std::collections::BTreeMap;

use crate::engine::{error::EngineError, sandbox::CommandLine};

/// How one language is run inside an environment. The invocation is an
/// argument vector; the source filename is appended as its last argument.
/// Compiled languages go through `sh -c` and receive the filename as `$0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageProfile {
    pub id: &'static str,
    pub invocation: &'static [&'static str],
    pub file_extension: &'static str,
    pub runtime_selector: &'static str,
}

impl LanguageProfile {
    pub fn source_name(&self) -> String {
        format!("code.{}", self.file_extension)
    }

    pub fn command_for(&self, filename: &str) -> CommandLine {
        CommandLine::argv(
            self.invocation
                .iter()
                .copied()
                .chain(std::iter::once(filename)),
        )
    }

    pub fn serves_preview(&self) -> bool {
        matches!(self.id, "javascript" | "typescript")
    }
}

const PROFILES: [LanguageProfile; 11] = [
    LanguageProfile {
        id: "javascript",
        invocation: &["node"],
        file_extension: "js",
        runtime_selector: "node",
    },
    LanguageProfile {
        id: "typescript",
        invocation: &["npx", "--yes", "tsx"],
        file_extension: "ts",
        runtime_selector: "node",
    },
    LanguageProfile {
        id: "python",
        invocation: &["python3"],
        file_extension: "py",
        runtime_selector: "python",
    },
    LanguageProfile {
        id: "c",
        invocation: &["sh", "-c", "gcc \"$0\" -O2 -o /tmp/program && /tmp/program"],
        file_extension: "c",
        runtime_selector: "gcc",
    },
    LanguageProfile {
        id: "cpp",
        invocation: &["sh", "-c", "g++ \"$0\" -O2 -o /tmp/program && /tmp/program"],
        file_extension: "cpp",
        runtime_selector: "gcc",
    },
    LanguageProfile {
        id: "go",
        invocation: &["go", "run"],
        file_extension: "go",
        runtime_selector: "go",
    },
    LanguageProfile {
        id: "rust",
        invocation: &["sh", "-c", "rustc \"$0\" -O -o /tmp/program && /tmp/program"],
        file_extension: "rs",
        runtime_selector: "rust",
    },
    LanguageProfile {
        id: "java",
        invocation: &["java"],
        file_extension: "java",
        runtime_selector: "java",
    },
    LanguageProfile {
        id: "php",
        invocation: &["php"],
        file_extension: "php",
        runtime_selector: "php",
    },
    LanguageProfile {
        id: "ruby",
        invocation: &["ruby"],
        file_extension: "rb",
        runtime_selector: "ruby",
    },
    LanguageProfile {
        id: "shell",
        invocation: &["bash"],
        file_extension: "sh",
        runtime_selector: "base",
    },
];

/// Immutable table built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: BTreeMap<&'static str, LanguageProfile>,
}

impl LanguageRegistry {
    pub fn new() -> Self {
        Self {
            profiles: PROFILES.iter().map(|p| (p.id, *p)).collect(),
        }
    }

    pub fn resolve(&self, identifier: &str) -> Result<&LanguageProfile, EngineError> {
        let key = identifier.trim().to_lowercase();
        self.profiles
            .get(key.as_str())
            .ok_or_else(|| EngineError::UnsupportedLanguage {
                requested: identifier.to_string(),
                supported: self.supported(),
            })
    }

    /// Every known identifier, sorted.
    pub fn supported(&self) -> Vec<String> {
        self.profiles.keys().map(|k| k.to_string()).collect()
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
