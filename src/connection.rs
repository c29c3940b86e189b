//! Connections to a test cluster.

use std::ops::{Deref, DerefMut};

use postgres::{Client, Config, NoTls, error::SqlState};
use thiserror::Error;

use crate::database::DatabaseName;

/// Failure talking to a running cluster.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Error reported by the `postgres` client.
    #[error(transparent)]
    Postgres(#[from] postgres::Error),
    /// The database already exists.
    #[error("database {0} already exists")]
    DuplicateDatabase(String),
    /// Error reported by a non-`postgres` backend.
    #[error("{0}")]
    Backend(String),
}

impl ConnectionError {
    /// Returns `true` when the server refused to create an existing database.
    #[must_use]
    pub fn is_duplicate_database(&self) -> bool {
        match self {
            Self::DuplicateDatabase(_) => true,
            Self::Postgres(e) => e.code() == Some(&SqlState::DUPLICATE_DATABASE),
            Self::Backend(_) => false,
        }
    }
}

/// The administrative queries bootstrap needs.
pub trait AdminConnection {
    /// Reports whether `name` is present in `pg_database`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn database_exists(&mut self, name: &DatabaseName) -> Result<bool, ConnectionError>;

    /// Runs `CREATE DATABASE`.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails, including when the database
    /// already exists.
    fn create_database(&mut self, name: &DatabaseName) -> Result<(), ConnectionError>;
}

/// A synchronous client connection, closed when dropped.
pub struct PgConnection {
    client: Client,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

impl PgConnection {
    /// Opens a connection described by `config`.
    ///
    /// # Errors
    ///
    /// Returns the client error when the server cannot be reached or rejects
    /// the login.
    pub fn open(config: &Config) -> Result<Self, ConnectionError> {
        Ok(Self {
            client: config.connect(NoTls)?,
        })
    }

    /// The underlying client.
    pub const fn client(&mut self) -> &mut Client { &mut self.client }

    /// Closes the connection, reporting any error from the terminate message.
    ///
    /// # Errors
    ///
    /// Returns the client error raised while closing.
    pub fn close(self) -> Result<(), ConnectionError> { Ok(self.client.close()?) }
}

impl Deref for PgConnection {
    type Target = Client;
    fn deref(&self) -> &Self::Target { &self.client }
}

impl DerefMut for PgConnection {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.client }
}

impl AdminConnection for PgConnection {
    fn database_exists(&mut self, name: &DatabaseName) -> Result<bool, ConnectionError> {
        let row = self.client.query_opt(
            "select true from pg_catalog.pg_database where datname = $1",
            &[&name.as_ref()],
        )?;
        Ok(row.is_some())
    }

    fn create_database(&mut self, name: &DatabaseName) -> Result<(), ConnectionError> {
        self.client
            .batch_execute(&format!("CREATE DATABASE {}", name.quoted()))?;
        Ok(())
    }
}
