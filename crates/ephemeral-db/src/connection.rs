//! Minimal synchronous SQL connection surface shared by engines.

use thiserror::Error;

/// Boxed driver error, preserving the driver's own diagnostics.
pub type DriverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Opening a connection failed.
    #[error("failed to connect to {target}: {source}")]
    Open {
        /// Human-readable connection target.
        target: String,
        /// Driver error.
        #[source]
        source: DriverError,
    },
    /// A liveness round trip failed.
    #[error("ping failed: {source}")]
    Ping {
        /// Driver error.
        #[source]
        source: DriverError,
    },
    /// A statement failed.
    #[error("failed to execute `{statement}`: {source}")]
    Execute {
        /// Statement text.
        statement: String,
        /// Driver error.
        #[source]
        source: DriverError,
    },
    /// The instance no longer holds a connection.
    #[error("no open connection; the instance has been stopped")]
    Closed,
    /// Closing the connection failed.
    #[error("failed to close connection: {source}")]
    Close {
        /// Driver error.
        #[source]
        source: DriverError,
    },
}

/// Operations the lifecycle needs from a database connection.
pub trait SqlConnection {
    /// Performs a round trip proving the server answers.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Ping`] when the round trip fails.
    fn ping(&mut self) -> Result<(), ConnectionError>;

    /// Executes a statement, discarding any result rows.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Execute`] when the server rejects it.
    fn execute(&mut self, statement: &str) -> Result<(), ConnectionError>;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Close`] when the driver reports a failure
    /// while terminating the session.
    fn close(self) -> Result<(), ConnectionError>
    where
        Self: Sized;
}

#[cfg(feature = "postgres")]
impl SqlConnection for postgres::Client {
    fn ping(&mut self) -> Result<(), ConnectionError> {
        self.simple_query("SELECT 1")
            .map(drop)
            .map_err(|error| ConnectionError::Ping {
                source: Box::new(error),
            })
    }

    fn execute(&mut self, statement: &str) -> Result<(), ConnectionError> {
        self.batch_execute(statement)
            .map_err(|error| ConnectionError::Execute {
                statement: statement.to_owned(),
                source: Box::new(error),
            })
    }

    fn close(self) -> Result<(), ConnectionError> {
        postgres::Client::close(self).map_err(|error| ConnectionError::Close {
            source: Box::new(error),
        })
    }
}

#[cfg(feature = "mysql")]
impl SqlConnection for mysql::Conn {
    fn ping(&mut self) -> Result<(), ConnectionError> {
        use mysql::prelude::Queryable;

        self.query_drop("SELECT 1")
            .map_err(|error| ConnectionError::Ping {
                source: Box::new(error),
            })
    }

    fn execute(&mut self, statement: &str) -> Result<(), ConnectionError> {
        use mysql::prelude::Queryable;

        self.query_drop(statement)
            .map_err(|error| ConnectionError::Execute {
                statement: statement.to_owned(),
                source: Box::new(error),
            })
    }

    fn close(self) -> Result<(), ConnectionError> {
        // The driver sends COM_QUIT on drop and reports nothing back.
        drop(self);
        Ok(())
    }
}
