//! Shared mailbox session
//!
//! One authenticated connection serves every tenant. Command pairs
//! (EXAMINE/SEARCH/FETCH) are serialized behind a single async mutex; the
//! connection is reopened on demand after it was lost or never established.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::connection::{self, ImapConnection};
use super::fetch;
use super::search::SearchQuery;
use crate::config::ImapConfig;
use crate::types::error::{RelayError, Result};
use crate::types::RawMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The mailbox as seen by the retrieval service
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Establish the session; returns immediately when already connected.
    async fn connect(&self) -> Result<()>;

    /// Release the session. Safe to call when not connected.
    async fn disconnect(&self);

    async fn state(&self) -> SessionState;

    /// Run `query` and return the full source of at most `limit` newest hits.
    async fn search_latest(&self, query: &SearchQuery, limit: usize) -> Result<Vec<RawMessage>>;
}

/// How the session opens, uses and closes a connection
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Send;

    async fn open(&self) -> Result<Self::Connection>;

    async fn search_latest(
        &self,
        conn: &mut Self::Connection,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<RawMessage>>;

    async fn close(&self, conn: Self::Connection);

    /// Label for log lines
    fn endpoint(&self) -> &str;
}

/// IMAP over implicit TLS
pub struct ImapTransport {
    config: ImapConfig,
}

impl ImapTransport {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for ImapTransport {
    type Connection = ImapConnection;

    async fn open(&self) -> Result<ImapConnection> {
        connection::connect(&self.config).await
    }

    async fn search_latest(
        &self,
        conn: &mut ImapConnection,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        fetch::search_latest(conn, &self.config.folder, query, limit).await
    }

    async fn close(&self, conn: ImapConnection) {
        conn.logout().await;
    }

    fn endpoint(&self) -> &str {
        &self.config.host
    }
}

pub struct MailboxSession<T: Transport = ImapTransport> {
    transport: T,
    slot: Mutex<Option<T::Connection>>,
    // Plain mutex: never held across an await, and writable from `Drop`.
    state: StdMutex<SessionState>,
}

impl MailboxSession<ImapTransport> {
    pub fn new(config: ImapConfig) -> Self {
        Self::with_transport(ImapTransport::new(config))
    }
}

impl<T: Transport> MailboxSession<T> {
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            slot: Mutex::new(None),
            state: StdMutex::new(SessionState::Disconnected),
        }
    }

    fn set_state(&self, state: SessionState) {
        set_state(&self.state, state);
    }

    /// Reconnect if the slot is empty. Must be called with the slot locked.
    async fn ensure_connected(&self, slot: &mut Option<T::Connection>) -> Result<()> {
        if slot.is_some() {
            return Ok(());
        }

        self.set_state(SessionState::Connecting);
        match self.transport.open().await {
            Ok(conn) => {
                *slot = Some(conn);
                self.set_state(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// One command pair on a checked-out connection.
    ///
    /// The connection is out of the slot while in use: if this future is
    /// dropped mid-command the half-used connection goes with it, the guard
    /// marks the session disconnected and the next call reconnects.
    async fn attempt(
        &self,
        slot: &mut Option<T::Connection>,
        query: &SearchQuery,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        self.ensure_connected(slot).await?;
        let Some(mut conn) = slot.take() else {
            return Err(RelayError::Connection("session not established".to_string()));
        };

        let mut checkout = Checkout {
            state: &self.state,
            returned: false,
        };

        let result = self.transport.search_latest(&mut conn, query, limit).await;

        if !matches!(result, Err(RelayError::Connection(_))) {
            *slot = Some(conn);
            checkout.returned = true;
        }

        result
    }
}

/// Marks the session disconnected unless the connection went back into the slot.
struct Checkout<'a> {
    state: &'a StdMutex<SessionState>,
    returned: bool,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if !self.returned {
            set_state(self.state, SessionState::Disconnected);
        }
    }
}

fn set_state(cell: &StdMutex<SessionState>, state: SessionState) {
    *cell.lock().unwrap_or_else(PoisonError::into_inner) = state;
}

#[async_trait]
impl<T: Transport> Mailbox for MailboxSession<T> {
    async fn connect(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        self.ensure_connected(&mut slot).await
    }

    async fn disconnect(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(conn) = slot.take() {
            self.transport.close(conn).await;
            info!(host = %self.transport.endpoint(), "IMAP connection closed");
        }
        self.set_state(SessionState::Disconnected);
    }

    async fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn search_latest(&self, query: &SearchQuery, limit: usize) -> Result<Vec<RawMessage>> {
        let mut slot = self.slot.lock().await;

        match self.attempt(&mut slot, query, limit).await {
            // A connection the server closed while idle only shows up on use;
            // reopen once under the same lock.
            Err(RelayError::Connection(reason)) => {
                warn!(host = %self.transport.endpoint(), "IMAP connection lost, reconnecting: {}", reason);
                self.attempt(&mut slot, query, limit).await
            }
            other => other,
        }
    }
}
