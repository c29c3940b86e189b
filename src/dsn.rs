//! Key/value connection strings (`host=localhost port=5432 user=test`).

use std::{collections::BTreeMap, fmt, str::FromStr};

use thiserror::Error;

/// A connection string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DsnError {
    /// A word had no `=` separating key and value.
    #[error("connection string word {word:?} is not a key=value pair")]
    MissingValue {
        /// The offending word.
        word: String,
    },
}

/// A parsed connection string.
///
/// Later duplicates of a key replace earlier ones. Values cannot contain
/// whitespace; quoting is not supported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dsn(BTreeMap<String, String>);

impl Dsn {
    /// Splits `s` on whitespace and each word on its first `=`.
    ///
    /// # Errors
    ///
    /// Returns [`DsnError::MissingValue`] for a word without `=`.
    pub fn parse(s: &str) -> Result<Self, DsnError> {
        s.split_whitespace()
            .map(|word| {
                word.split_once('=')
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .ok_or_else(|| DsnError::MissingValue {
                        word: word.to_owned(),
                    })
            })
            .collect::<Result<_, _>>()
            .map(Self)
    }

    /// Sets `key`, replacing any previous value.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_owned(), value.into());
        self
    }

    /// Looks up `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> { self.0.get(key).map(String::as_str) }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    /// Returns `true` for an empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl FromStr for Dsn {
    type Err = DsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
