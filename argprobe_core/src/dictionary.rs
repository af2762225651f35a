use crate::error::DictionaryError;
use std::collections::HashSet;
use std::path::Path;

/// Candidate tokens to fuzz, in the order they will be tried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    tokens: Vec<String>,
}

impl Dictionary {
    /// Loads a newline-delimited dictionary file.
    pub fn load(path: &Path) -> Result<Self, DictionaryError> {
        let content = std::fs::read_to_string(path).map_err(|source| DictionaryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&content))
    }

    /// Trims every line, drops blank ones and keeps the first occurrence of duplicates.
    pub fn parse(content: &str) -> Self {
        let mut seen = HashSet::new();
        let tokens = content
            .lines()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .filter(|token| seen.insert(*token))
            .map(str::to_string)
            .collect();
        Self { tokens }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl From<Vec<String>> for Dictionary {
    fn from(tokens: Vec<String>) -> Self {
        Self { tokens }
    }
}
