// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the single broker connection of a Sender or Receiver. The connection is
//! created on first use; concurrent first callers share one in-progress attempt.
//! A failed attempt is reported to every waiting caller and the next call tries
//! again. A connection supplied by the caller is used as is and never closed here.

use crate::{
    client::{AmqpChannel, AmqpConnection, AmqpConnector},
    errors::AmqpError,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::OnceCell;
use tracing::{debug, error};

pub struct ConnectionManager {
    connector: Option<Arc<dyn AmqpConnector>>,
    connection: OnceCell<Arc<dyn AmqpConnection>>,
    owned: bool,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Creates a manager that opens, and later closes, its own connection.
    ///
    /// # Parameters
    /// * `connector` - Called once, on the first `connection()` or `channel()`
    ///
    /// # Returns
    /// A manager with no connection yet
    pub fn new(connector: Arc<dyn AmqpConnector>) -> Self {
        ConnectionManager {
            connector: Some(connector),
            connection: OnceCell::new(),
            owned: true,
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a manager around a connection the caller owns.
    ///
    /// # Parameters
    /// * `connection` - Used for every channel; never closed by the manager
    pub fn with_connection(connection: Arc<dyn AmqpConnection>) -> Self {
        ConnectionManager {
            connector: None,
            connection: OnceCell::new_with(Some(connection)),
            owned: false,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the shared connection, connecting on the first call.
    pub async fn connection(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError("connection manager closed".to_owned()));
        }

        let conn = self
            .connection
            .get_or_try_init(|| async {
                let Some(connector) = &self.connector else {
                    return Err(AmqpError::ConnectionError("no connector".to_owned()));
                };
                let conn = connector.connect().await?;
                debug!("broker connection established");
                Ok(conn)
            })
            .await?;

        if !conn.is_open() {
            return Err(AmqpError::ConnectionError("connection is closed".to_owned()));
        }

        Ok(conn.clone())
    }

    /// Opens a fresh channel on the shared connection.
    ///
    /// # Errors
    ///
    /// [`AmqpError::ConnectionError`] when the connection cannot be established or
    /// the broker refuses the channel, e.g. once channel-max is reached.
    pub async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let conn = self.connection().await?;

        conn.open_channel().await.map_err(|err| {
            error!(error = err.to_string(), "failure to open channel");
            match err {
                AmqpError::ConnectionError(_) => err,
                AmqpError::ChannelError(text) => AmqpError::ConnectionError(text),
                other => AmqpError::ConnectionError(other.to_string()),
            }
        })
    }

    /// True when close() also closes the broker connection.
    pub fn owns_connection(&self) -> bool {
        self.owned
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops handing out channels and closes the connection if this manager
    /// created it. Further calls are no-ops.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.connection.get() {
            Some(conn) if self.owned && conn.is_open() => {
                debug!("closing broker connection");
                conn.close().await
            }
            _ => Ok(()),
        }
    }
}
