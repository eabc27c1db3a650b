use async_imap::types::Mailbox as SelectedFolder;
use async_imap::Session;
use async_native_tls::TlsStream;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

use crate::config::ImapConfig;
use crate::types::error::{RelayError, Result};

// An IMAP session is generic over the stream type; ours is TLS over TCP
// wrapped in a tokio compat layer.
pub type ImapSession = Session<TlsStream<Compat<TcpStream>>>;

pub struct ImapConnection {
    pub session: ImapSession,
}

impl ImapConnection {
    /// EXAMINE rather than SELECT: the relay never changes flags.
    pub async fn select_folder(&mut self, folder: &str) -> Result<SelectedFolder> {
        self.session
            .examine(folder)
            .await
            .map_err(|e| classify("EXAMINE", e))
    }

    pub async fn logout(mut self) {
        if let Err(e) = self.session.logout().await {
            debug!("LOGOUT failed, dropping connection anyway: {}", e);
        }
    }
}

pub async fn connect(config: &ImapConfig) -> Result<ImapConnection> {
    info!(host = %config.host, port = config.port, "Connecting to IMAP server");

    let tcp = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|e| RelayError::Connection(format!("TCP connection failed: {}", e)))?;

    let tcp = tcp.compat();
    let tls = async_native_tls::TlsConnector::new()
        .danger_accept_invalid_certs(config.accept_invalid_certs);
    let tls_stream = tls
        .connect(config.host.as_str(), tcp)
        .await
        .map_err(|e| RelayError::Connection(format!("TLS handshake failed: {}", e)))?;

    let client = async_imap::Client::new(tls_stream);

    let session = client
        .login(&config.user, &config.password)
        .await
        .map_err(|(e, _)| RelayError::Connection(format!("Login failed: {}", e)))?;

    info!(host = %config.host, user = %config.user, "IMAP session established");

    Ok(ImapConnection { session })
}

/// Split server rejections (NO/BAD) from transport failures.
///
/// Only transport failures invalidate the connection.
pub fn classify(command: &str, err: async_imap::error::Error) -> RelayError {
    use async_imap::error::Error;

    match err {
        Error::No(msg) | Error::Bad(msg) => {
            RelayError::Query(format!("{} rejected: {}", command, msg))
        }
        other => RelayError::Connection(format!("{} failed: {}", command, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_imap::error::Error;

    #[test]
    fn test_server_rejections_are_query_errors() {
        let no = classify("EXAMINE", Error::No("no such mailbox".to_string()));
        let bad = classify("SEARCH", Error::Bad("invalid search criteria".to_string()));

        assert_eq!(no, RelayError::Query("EXAMINE rejected: no such mailbox".to_string()));
        assert!(matches!(bad, RelayError::Query(_)));
        assert!(!bad.is_retryable());
    }

    #[test]
    fn test_transport_failures_are_connection_errors() {
        let lost = classify("FETCH", Error::ConnectionLost);
        let io = classify(
            "SEARCH",
            Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe")),
        );

        assert!(matches!(lost, RelayError::Connection(_)));
        assert!(matches!(io, RelayError::Connection(_)));
        assert!(io.is_retryable());
    }
}
