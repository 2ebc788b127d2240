//! Supported source languages

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A language the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    TypeScript,
    Python,
    Java,
    Go,
    Rust,
}

impl Language {
    pub const ALL: [Self; 6] = [
        Self::JavaScript,
        Self::TypeScript,
        Self::Python,
        Self::Java,
        Self::Go,
        Self::Rust,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Python => "python",
            Self::Java => "java",
            Self::Go => "go",
            Self::Rust => "rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a language tag names nothing the engine supports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" | "node" => Ok(Self::JavaScript),
            "typescript" | "ts" => Ok(Self::TypeScript),
            "python" | "py" | "python3" => Ok(Self::Python),
            "java" => Ok(Self::Java),
            "go" | "golang" => Ok(Self::Go),
            "rust" | "rs" => Ok(Self::Rust),
            _ => Err(UnsupportedLanguage(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("JavaScript".parse::<Language>(), Ok(Language::JavaScript));
        assert_eq!("ts".parse::<Language>(), Ok(Language::TypeScript));
        assert_eq!(" py ".parse::<Language>(), Ok(Language::Python));
        assert_eq!("golang".parse::<Language>(), Ok(Language::Go));
        assert_eq!(
            "cobol".parse::<Language>(),
            Err(UnsupportedLanguage("cobol".into()))
        );
    }

    #[test]
    fn display_matches_wire_name() {
        for lang in Language::ALL {
            let json = serde_json::to_string(&lang).unwrap();
            assert_eq!(json, format!("\"{lang}\""));
            assert_eq!(lang.as_str().parse::<Language>(), Ok(lang));
        }
    }
}
