use std::fmt::Display;

/// Failure kinds surfaced by the engine.
///
/// Per-peer protocol violations never reach the caller as values of this
/// type; they kill the offending peer and the swarm continues. What does
/// reach the caller is everything that affects a whole torrent or the
/// client itself.
#[derive(Debug)]
pub enum Error {
    /// Disk or resume file access failed.
    Io(std::io::Error),
    /// A peer sent a malformed or out-of-range wire message.
    Protocol(String),
    /// A completed piece did not match its metainfo digest.
    HashMismatch { piece: u32 },
    /// Mapping or allocation failure.
    Resource(String),
    /// Resume file or metadata inconsistency.
    Config(String),
    /// A torrent with the same info hash is already loaded.
    Duplicate,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Error::HashMismatch { piece } => {
                write!(f, "piece {piece} failed hash verification")
            }
            Error::Resource(msg) => write!(f, "resource error: {msg}"),
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::Duplicate => write!(f, "torrent is already loaded"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}
