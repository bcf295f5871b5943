use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the engine can surface, split by the boundary that must act
/// on it: configuration and metadata errors are pre-flight, tracker errors
/// are fatal when no peer list is obtained, peer errors end one session,
/// hash mismatches end one piece attempt, persistence errors end the
/// download.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(String),

    #[error("torrent metadata: {0}")]
    Metadata(String),

    #[error("tracker unreachable: {0}")]
    TrackerUnreachable(#[source] reqwest::Error),

    #[error("tracker answered HTTP {0}")]
    TrackerStatus(u16),

    #[error("malformed tracker response: {0}")]
    TrackerResponse(String),

    #[error("tracker returned an empty peer list")]
    NoPeers,

    #[error("peer connect timed out")]
    PeerConnectTimeout,

    #[error("peer protocol violation: {0}")]
    PeerProtocol(String),

    #[error("peer i/o: {0}")]
    PeerIo(#[from] std::io::Error),

    #[error("piece {0} failed hash verification")]
    HashMismatch(usize),

    #[error("cannot persist {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("download incomplete, {} pieces still missing", .missing.len())]
    Incomplete { missing: Vec<usize> },
}

impl Error {
    /// True for failures that end one peer session without affecting the
    /// rest of the download.
    pub fn is_session_local(&self) -> bool {
        matches!(
            self,
            Error::PeerConnectTimeout | Error::PeerProtocol(_) | Error::PeerIo(_)
        )
    }
}
