//! Static security screen
//!
//! A cheap first gate in front of the container: each language has an ordered
//! table of dangerous-construct patterns, and a cross-language table of shell
//! signatures is applied to every submission whatever its declared language.
//! The first match rejects the submission. The container's own isolation is
//! what actually contains hostile code; this only turns away the obvious.
//!
//! The shell table works on raw text, so a string literal such as `"chmod"`
//! is rejected too.

use crate::{EngineError, Language, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What a dangerous pattern gives access to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerCategory {
    Filesystem,
    Process,
    Network,
    DynamicEval,
    Privileged,
    Shell,
}

impl fmt::Display for DangerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Filesystem => "filesystem",
            Self::Process => "process",
            Self::Network => "network",
            Self::DynamicEval => "dynamic_eval",
            Self::Privileged => "privileged",
            Self::Shell => "shell",
        };
        f.write_str(name)
    }
}

type PatternRow = (DangerCategory, &'static str, &'static str);

use DangerCategory::{DynamicEval, Filesystem, Network, Privileged, Process, Shell};

const JAVASCRIPT: &[PatternRow] = &[
    (
        Filesystem,
        r#"(\brequire\s*\(|\bfrom\s+|\bimport\s*\(?)\s*['"`](node:)?fs(/promises)?['"`]"#,
        "filesystem module import",
    ),
    (
        Process,
        r#"(\brequire\s*\(|\bfrom\s+|\bimport\s*\(?)\s*['"`](node:)?(child_process|cluster|worker_threads)['"`]"#,
        "process spawning module import",
    ),
    (
        Network,
        r#"(\brequire\s*\(|\bfrom\s+|\bimport\s*\(?)\s*['"`](node:)?(net|dgram|dns|http|https|http2|tls)['"`]"#,
        "network module import",
    ),
    (
        DynamicEval,
        r#"(\brequire\s*\(|\bfrom\s+|\bimport\s*\(?)\s*['"`](node:)?(vm|v8|inspector|module)['"`]"#,
        "VM or inspector module import",
    ),
    (DynamicEval, r#"\brequire\s*\(\s*[^'"`\s)]"#, "dynamic require()"),
    (DynamicEval, r"\beval\s*\(", "eval()"),
    (DynamicEval, r"\bnew\s+Function\s*\(", "Function constructor"),
    (
        DynamicEval,
        r#"\b(setTimeout|setInterval)\s*\(\s*['"`]"#,
        "string-evaluated timer",
    ),
    (
        Privileged,
        r"\bprocess\s*\.\s*(binding|_linkedBinding|dlopen|kill|exit|abort|chdir|setuid|setgid|env|mainModule)\b",
        "privileged process object access",
    ),
    (
        Network,
        r"\b(fetch|XMLHttpRequest|WebSocket|EventSource)\s*\(",
        "network request",
    ),
];

const TYPESCRIPT_EXTRA: &[PatternRow] = &[(
    Privileged,
    r"\bDeno\s*\.\s*(run|Command|exit|kill|env|readFile|readTextFile|readDir|writeFile|writeTextFile|remove|open|create|mkdir|connect|listen|dlopen|chmod|chown|symlink)\b",
    "Deno runtime API",
)];

const PYTHON: &[PatternRow] = &[
    (
        Process,
        r"(?m)^\s*(import|from)\s+(os|subprocess|pty|multiprocessing|signal)\b",
        "process or OS module import",
    ),
    (
        Filesystem,
        r"(?m)^\s*(import|from)\s+(shutil|pathlib|tempfile|glob|fileinput)\b",
        "filesystem module import",
    ),
    (
        Network,
        r"(?m)^\s*(import|from)\s+(socket|ssl|urllib|http|ftplib|smtplib|telnetlib|requests)\b",
        "network module import",
    ),
    (
        Privileged,
        r"(?m)^\s*(import|from)\s+(ctypes|cffi|importlib|builtins|gc|inspect)\b",
        "runtime internals import",
    ),
    (DynamicEval, r"\b__import__\s*\(", "__import__()"),
    (DynamicEval, r"\b(eval|exec|compile)\s*\(", "dynamic evaluation"),
    (Filesystem, r"\bopen\s*\(", "file open()"),
    (
        Privileged,
        r"\b__(builtins|subclasses|globals|code|mro|bases)__\b",
        "interpreter internals access",
    ),
    (
        DynamicEval,
        r"\b(getattr|setattr|delattr)\s*\(",
        "reflective attribute access",
    ),
];

const JAVA: &[PatternRow] = &[
    (Process, r"\bRuntime\s*\.\s*getRuntime\s*\(", "Runtime.getRuntime()"),
    (Process, r"\b(ProcessBuilder|ProcessHandle)\b", "process spawning"),
    (
        Filesystem,
        r"\bjava\s*\.\s*io\s*\.\s*(File|FileInputStream|FileOutputStream|FileReader|FileWriter|RandomAccessFile)\b|\bnew\s+(File|FileInputStream|FileOutputStream|FileReader|FileWriter|RandomAccessFile)\s*\(",
        "file access",
    ),
    (
        Filesystem,
        r"\bjava\s*\.\s*nio\s*\.\s*file\b|\bFiles\s*\.\s*\w+\s*\(|\bPaths\s*\.\s*get\s*\(",
        "NIO file access",
    ),
    (
        Network,
        r"\bjava\s*\.\s*net\b|\bnew\s+(Socket|ServerSocket|DatagramSocket|URL)\s*\(|\bHttpClient\b",
        "network access",
    ),
    (
        DynamicEval,
        r"\bjava\s*\.\s*lang\s*\.\s*reflect\b|\bClass\s*\.\s*forName\s*\(|\.\s*(getDeclaredMethod|getDeclaredField|getDeclaredConstructor|setAccessible)\s*\(",
        "reflection",
    ),
    (
        DynamicEval,
        r"\bjavax\s*\.\s*script\b|\bScriptEngineManager\b|\bClassLoader\b",
        "dynamic code loading",
    ),
    (
        Privileged,
        r"\bSystem\s*\.\s*(exit|setSecurityManager|load|loadLibrary|getenv)\s*\(",
        "privileged System call",
    ),
    (Privileged, r"\bsun\s*\.\s*misc\b|\bUnsafe\b", "sun.misc.Unsafe"),
];

const GO: &[PatternRow] = &[
    (Process, r#""os/exec""#, "os/exec import"),
    (
        Privileged,
        r#""syscall"|"golang\.org/x/sys/[\w/]*""#,
        "syscall import",
    ),
    (Network, r#""net(/[\w/]+)?""#, "net import"),
    (Privileged, r#""unsafe""#, "unsafe import"),
    (DynamicEval, r#""(plugin|reflect)""#, "plugin or reflect import"),
    (Filesystem, r#""io/ioutil""#, "io/ioutil import"),
    (
        Filesystem,
        r"\bos\s*\.\s*(Open|OpenFile|Create|CreateTemp|Remove|RemoveAll|Rename|Mkdir|MkdirAll|MkdirTemp|ReadFile|WriteFile|ReadDir|Chmod|Chown|Symlink|Link|Truncate)\s*\(",
        "os filesystem call",
    ),
    (
        Process,
        r"\bos\s*\.\s*(StartProcess|FindProcess|Exit|Setenv|Getenv|Environ|Chdir)\s*\(",
        "os process call",
    ),
];

const RUST: &[PatternRow] = &[
    (
        Process,
        r"\bstd\s*::\s*process\b|\bCommand\s*::\s*new\b",
        "process spawning",
    ),
    (
        Filesystem,
        r"\bstd\s*::\s*fs\b|\bFile\s*::\s*(open|create)\b",
        "filesystem access",
    ),
    (
        Network,
        r"\bstd\s*::\s*net\b|\b(TcpStream|TcpListener|UdpSocket)\b",
        "network access",
    ),
    (
        Privileged,
        r"\bstd\s*::\s*\{[^}]*\b(fs|process|net|os|env)\b",
        "restricted std module import",
    ),
    (Privileged, r"\bstd\s*::\s*(env|os)\b", "environment or OS access"),
    (Privileged, r"\bunsafe\b", "unsafe code"),
    (
        Privileged,
        r#"\bextern\s+(crate\b|"C")|#\s*\[\s*link\b|\blibc\s*::"#,
        "foreign function interface",
    ),
    (
        DynamicEval,
        r"\b(include|include_str|include_bytes|env|option_env)\s*!",
        "compile-time file or environment inclusion",
    ),
    (Privileged, r"\b(asm|global_asm)\s*!", "inline assembly"),
];

/// Applied to every submission regardless of declared language.
const SHELL: &[PatternRow] = &[
    (Shell, r"\brm\s+-[a-zA-Z]*[rRf]", "destructive file deletion"),
    (Shell, r"\bmkfs(\.\w+)?\b|\bdd\s+if=", "raw disk write"),
    (Shell, r"\bsudo\b|\bsu\s+(-|root\b)", "privilege escalation"),
    (Shell, r"\b(chmod|chown|chgrp)\b", "permission change"),
    (
        Shell,
        r"\b(curl|wget|netcat|ncat|telnet)\b|\bnc\s+-",
        "outbound network tooling",
    ),
    (
        Shell,
        r"/etc/(passwd|shadow|sudoers|group)\b|/proc/self/|/var/run/docker\.sock|\.ssh/",
        "sensitive file path",
    ),
    (
        Shell,
        r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "fork bomb",
    ),
];

fn rows_for(language: Language) -> Vec<&'static [PatternRow]> {
    match language {
        Language::JavaScript => vec![JAVASCRIPT],
        Language::TypeScript => vec![JAVASCRIPT, TYPESCRIPT_EXTRA],
        Language::Python => vec![PYTHON],
        Language::Java => vec![JAVA],
        Language::Go => vec![GO],
        Language::Rust => vec![RUST],
    }
}

/// One compiled dangerous-construct pattern
#[derive(Debug, Clone)]
pub struct DangerPattern {
    pub category: DangerCategory,
    pub description: String,
    regex: Regex,
}

impl DangerPattern {
    pub fn new(
        category: DangerCategory,
        pattern: &str,
        description: impl Into<String>,
    ) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| EngineError::Config(format!("invalid screen pattern {pattern:?}: {e}")))?;
        Ok(Self {
            category,
            description: description.into(),
            regex,
        })
    }

    #[must_use]
    pub fn is_match(&self, code: &str) -> bool {
        self.regex.is_match(code)
    }

    fn compile(rows: &[PatternRow]) -> Result<Vec<Self>> {
        rows.iter()
            .map(|(category, pattern, description)| Self::new(*category, pattern, *description))
            .collect()
    }
}

/// Compiled pattern tables, per language plus the shared shell table
#[derive(Debug, Clone)]
pub struct SecurityScreen {
    per_language: BTreeMap<Language, Vec<DangerPattern>>,
    shell: Vec<DangerPattern>,
}

impl SecurityScreen {
    /// Compile the built-in tables.
    pub fn standard() -> Result<Self> {
        let mut per_language = BTreeMap::new();
        for language in Language::ALL {
            let mut patterns = Vec::new();
            for rows in rows_for(language) {
                patterns.extend(DangerPattern::compile(rows)?);
            }
            per_language.insert(language, patterns);
        }

        Ok(Self {
            per_language,
            shell: DangerPattern::compile(SHELL)?,
        })
    }

    /// Append a pattern to a language's table.
    #[must_use]
    pub fn with_pattern(mut self, language: Language, pattern: DangerPattern) -> Self {
        self.per_language.entry(language).or_default().push(pattern);
        self
    }

    /// Append a pattern to the cross-language shell table.
    #[must_use]
    pub fn with_shell_pattern(mut self, pattern: DangerPattern) -> Self {
        self.shell.push(pattern);
        self
    }

    /// First pattern matching `code`, language table before shell table.
    #[must_use]
    pub fn find_match(&self, code: &str, language: Language) -> Option<&DangerPattern> {
        self.per_language
            .get(&language)
            .into_iter()
            .flatten()
            .chain(&self.shell)
            .find(|pattern| pattern.is_match(code))
    }

    /// Return `code` unchanged, or reject it on the first dangerous match.
    pub fn screen<'a>(&self, code: &'a str, language: Language) -> Result<&'a str> {
        match self.find_match(code, language) {
            None => Ok(code),
            Some(pattern) => {
                tracing::warn!(
                    %language,
                    category = %pattern.category,
                    pattern = %pattern.description,
                    "submission rejected by security screen"
                );
                Err(EngineError::security(format!(
                    "potentially dangerous code detected: {}",
                    pattern.description
                )))
            }
        }
    }
}
