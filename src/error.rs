use std::net::SocketAddr;

/// Crate-wide error type.
///
/// Variants line up with the error kinds in the design: protocol
/// parsing errors are never fatal and are logged at the ingress
/// boundary; transaction/invite errors propagate to the caller as
/// ordinary values; crypto and resource errors are mostly localized.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed SIP message: {0}")]
    Protocol(String),

    #[error("transaction {0} timed out")]
    TransactionTimeout(String),

    #[error("invite failed: {0}")]
    Invite(String),

    #[error("gateway closed with non-resumable close code {0}")]
    CloseCodeFatal(u16),

    #[error("AEAD decryption failed")]
    Crypto,

    #[error("resource error: {0}")]
    Resource(String),

    #[error("no active transaction for id {0}")]
    NoSuchTransaction(String),

    #[error("no active dialog for id {0}")]
    NoSuchDialog(String),

    #[error("socket error on {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Rsip(#[from] rsip::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
