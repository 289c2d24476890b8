/*!
 * Error types for Pulsar
 */

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (bad directive, missing listener, unparseable file)
    Config(String),

    /// Binding a listening socket failed
    Bind { addr: SocketAddr, source: io::Error },

    /// I/O error
    Io(io::Error),

    /// Pidfile could not be created or removed
    Pidfile { path: PathBuf, source: io::Error },

    /// Readiness engine initialization or control operation failed
    Engine(String),

    /// Worker initialization failed (privilege drop, channel registration)
    WorkerInit(String),

    /// Spawning a child process failed
    Spawn { name: &'static str, source: io::Error },

    /// Master/worker channel error
    Channel(String),

    /// Inherited-socket handoff error
    Inherited(String),

    /// The connection table is exhausted
    ConnectionsExhausted,

    /// Signal registration error
    Signal(String),

    /// Generic error with message
    Other(String),
}

impl ServerError {
    /// Check if this error is fatal at startup (master logs it and exits
    /// nonzero, no workers spawned)
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Config(_) => true,
            ServerError::Bind { .. } => true,
            ServerError::Pidfile { .. } => true,
            ServerError::Inherited(_) => true,
            ServerError::Signal(_) => true,

            // A failed spawn leaves the remaining fleet running
            ServerError::Spawn { .. } => false,

            // Worker-scoped: the worker exits code 2, the master respawns
            ServerError::Engine(_) => false,
            ServerError::WorkerInit(_) => false,

            ServerError::Io(_) => false,
            ServerError::Channel(_) => false,
            ServerError::ConnectionsExhausted => false,
            ServerError::Other(_) => false,
        }
    }

    /// Check if this error is transient (at worst one loop iteration yields
    /// no work)
    pub fn is_transient(&self) -> bool {
        match self {
            ServerError::Io(io_err) => Self::is_io_transient(io_err),
            ServerError::Channel(_) => true,
            ServerError::ConnectionsExhausted => true,
            _ => false,
        }
    }

    /// Check if an I/O error is transient
    fn is_io_transient(io_err: &io::Error) -> bool {
        use io::ErrorKind::*;
        matches!(
            io_err.kind(),
            Interrupted | WouldBlock | ConnectionReset | ConnectionAborted | BrokenPipe | TimedOut
        )
    }

    /// Exit code the process should report for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Engine(_) | ServerError::WorkerInit(_) => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Config(msg) => {
                write!(f, "configuration error: {}", msg)
            }
            ServerError::Bind { addr, source } => {
                write!(f, "bind() to {} failed: {}", addr, source)
            }
            ServerError::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
            ServerError::Pidfile { path, source } => {
                write!(f, "pidfile {}: {}", path.display(), source)
            }
            ServerError::Engine(msg) => {
                write!(f, "readiness engine error: {}", msg)
            }
            ServerError::WorkerInit(msg) => {
                write!(f, "worker init failed: {}", msg)
            }
            ServerError::Spawn { name, source } => {
                write!(f, "could not spawn {}: {}", name, source)
            }
            ServerError::Channel(msg) => {
                write!(f, "channel error: {}", msg)
            }
            ServerError::Inherited(msg) => {
                write!(f, "inherited sockets: {}", msg)
            }
            ServerError::ConnectionsExhausted => {
                write!(f, "worker_connections are not enough")
            }
            ServerError::Signal(msg) => {
                write!(f, "signal error: {}", msg)
            }
            ServerError::Other(msg) => {
                write!(f, "{}", msg)
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(err) => Some(err),
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Pidfile { source, .. } => Some(source),
            ServerError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        ServerError::Io(err)
    }
}
