//! Best-effort symbol extraction via per-language regex rule sets.
//!
//! This is deliberately not a parser: missed symbols are acceptable because
//! downstream policy only compares symbol sets for equality. False
//! negatives soften Major verdicts into Moderate ones, never the reverse
//! direction into silence.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Java,
    C,
    Unknown,
}

impl Language {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "py" | "pyi" => Language::Python,
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Language::JavaScript,
            "java" => Language::Java,
            "c" | "h" | "cc" | "cpp" | "cxx" | "hpp" | "hxx" => Language::C,
            _ => Language::Unknown,
        }
    }
}

static PYTHON_DEFS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:def|class)\s+([A-Za-z_]\w*)").unwrap());

static JS_FUNCTIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)\b(?:function|class)\s+([A-Za-z_$][\w$]*)").unwrap()
});

static JS_ARROW_BINDINGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)\b(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*=>|[A-Za-z_$][\w$]*\s*=>)").unwrap()
});

static JAVA_TYPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)\b(?:class|interface|enum|record)\s+([A-Za-z_]\w*)").unwrap()
});

static JAVA_METHODS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)\b(?:public|protected|private)\s+(?:static\s+|final\s+|abstract\s+|synchronized\s+)*[\w<>\[\],\s]+?\s([A-Za-z_]\w*)\s*\(").unwrap()
});

static C_TYPES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)\b(?:struct|class|enum|union)\s+([A-Za-z_]\w*)").unwrap());

static C_FUNCTIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[A-Za-z_][\w\s\*&:<>,~]*?\b([A-Za-z_]\w*)\s*\([^;{}]*\)\s*\{").unwrap()
});

/// Extract identifier names for the given language. Unrecognized languages
/// yield an empty set.
pub fn extract_symbols(language: Language, content: &str) -> BTreeSet<String> {
    let patterns: &[&Regex] = match language {
        Language::Python => &[&PYTHON_DEFS],
        Language::JavaScript => &[&JS_FUNCTIONS, &JS_ARROW_BINDINGS],
        Language::Java => &[&JAVA_TYPES, &JAVA_METHODS],
        Language::C => &[&C_TYPES, &C_FUNCTIONS],
        Language::Unknown => return BTreeSet::new(),
    };

    let mut symbols = BTreeSet::new();
    for pattern in patterns {
        for caps in pattern.captures_iter(content) {
            if let Some(name) = caps.get(1) {
                symbols.insert(name.as_str().to_string());
            }
        }
    }
    symbols
}
