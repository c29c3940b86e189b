//! Database names and the idempotent "ensure it exists" step.

use std::{fmt, ops::Deref};

use thiserror::Error;

use crate::connection::{AdminConnection, ConnectionError};

/// A validated `PostgreSQL` database name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseName(String);

/// Validation error for [`DatabaseName::new`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatabaseNameError {
    /// Database name is empty or contains only whitespace.
    #[error("database name cannot be empty")]
    Empty,
    /// Database name exceeds `PostgreSQL`'s 63-character limit.
    #[error("database name cannot exceed 63 characters")]
    TooLong,
    /// Database name contains non-ASCII-alphanumeric characters (except underscores).
    #[error("database name contains invalid characters")]
    InvalidCharacters,
}

impl DatabaseName {
    /// Creates a new validated database name.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, exceeds 63 characters, or
    /// contains non-alphanumeric characters (except underscores).
    pub fn new(name: impl Into<String>) -> Result<Self, DatabaseNameError> {
        let raw = name.into();
        if raw.trim().is_empty() {
            return Err(DatabaseNameError::Empty);
        }
        if raw.len() > 63 {
            return Err(DatabaseNameError::TooLong);
        }
        if !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DatabaseNameError::InvalidCharacters);
        }
        Ok(Self(raw))
    }

    /// `template1`, the database every cluster is created with.
    #[must_use]
    pub fn template1() -> Self { Self("template1".to_owned()) }

    /// `test`, the database provisioned for test runs.
    #[must_use]
    pub fn test() -> Self { Self("test".to_owned()) }

    /// The name wrapped in double quotes for use as an SQL identifier.
    #[must_use]
    pub fn quoted(&self) -> String { format!("\"{}\"", self.0) }
}

impl Deref for DatabaseName {
    type Target = str;
    fn deref(&self) -> &Self::Target { &self.0 }
}

impl AsRef<str> for DatabaseName {
    fn as_ref(&self) -> &str { &self.0 }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

/// Creates `name` unless it already exists.
///
/// Returns `true` when this call created the database. A concurrent creator
/// winning the race counts as "already exists", so repeated or overlapping
/// calls converge without error.
///
/// # Errors
///
/// Propagates connection failures other than a duplicate-database report.
pub fn ensure_database<C>(conn: &mut C, name: &DatabaseName) -> Result<bool, ConnectionError>
where
    C: AdminConnection + ?Sized,
{
    if conn.database_exists(name)? {
        return Ok(false);
    }
    match conn.create_database(name) {
        Ok(()) => Ok(true),
        Err(e) if e.is_duplicate_database() => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("", DatabaseNameError::Empty)]
    #[case("   ", DatabaseNameError::Empty)]
    #[case("has-dash", DatabaseNameError::InvalidCharacters)]
    #[case("quote\"d", DatabaseNameError::InvalidCharacters)]
    fn rejects_bad_names(#[case] name: &str, #[case] expected: DatabaseNameError) {
        assert_eq!(DatabaseName::new(name), Err(expected));
    }

    #[rstest]
    fn rejects_long_names() {
        assert_eq!(DatabaseName::new("a".repeat(64)), Err(DatabaseNameError::TooLong));
        assert!(DatabaseName::new("a".repeat(63)).is_ok());
    }

    #[rstest]
    fn well_known_names_are_valid() {
        assert_eq!(DatabaseName::new("test"), Ok(DatabaseName::test()));
        assert_eq!(DatabaseName::new("template1"), Ok(DatabaseName::template1()));
        assert_eq!(DatabaseName::test().quoted(), "\"test\"");
    }

    /// Catalog double that also simulates a racing creator.
    #[derive(Default)]
    struct Catalog {
        databases: BTreeSet<String>,
        lose_race: bool,
        creates: usize,
    }

    impl AdminConnection for Catalog {
        fn database_exists(&mut self, name: &DatabaseName) -> Result<bool, ConnectionError> {
            Ok(self.databases.contains(name.as_ref()))
        }

        fn create_database(&mut self, name: &DatabaseName) -> Result<(), ConnectionError> {
            self.creates += 1;
            if self.lose_race || !self.databases.insert(name.to_string()) {
                return Err(ConnectionError::DuplicateDatabase(name.to_string()));
            }
            Ok(())
        }
    }

    #[rstest]
    fn second_ensure_is_a_no_op() {
        let mut catalog = Catalog::default();
        let name = DatabaseName::test();
        assert!(ensure_database(&mut catalog, &name).expect("first ensure"));
        assert!(!ensure_database(&mut catalog, &name).expect("second ensure"));
        assert_eq!(catalog.creates, 1);
        assert_eq!(catalog.databases.len(), 1);
    }

    #[rstest]
    fn losing_a_creation_race_is_not_an_error() {
        let mut catalog = Catalog {
            lose_race: true,
            ..Catalog::default()
        };
        assert!(!ensure_database(&mut catalog, &DatabaseName::test()).expect("race is tolerated"));
    }
}
