/*!
 * Pulsar - prefork master/worker server core
 *
 * The supervision and I/O machinery of a high-concurrency server:
 * - Master process owning configuration and the worker fleet
 * - Per-worker epoll event loop with timer integration
 * - Cross-worker accept arbitration (thundering-herd avoidance)
 * - Live reconfiguration with listener reuse
 * - Hot binary upgrade over an inherited-socket handoff
 * - Cycle-scoped pool allocation
 *
 * Protocol state machines live above the connection layer and are out of
 * scope; a listener's connection handler is the attachment point.
 */

pub mod config;
pub mod conn;
pub mod core;
pub mod cycle;
pub mod daemon;
pub mod error;
pub mod event;
pub mod listener;
pub mod logging;
pub mod pidfile;
pub mod process;

// Re-export commonly used types for convenience
pub use config::{load_config, LogLevel, ServerConfig, DEFAULT_CONFIG_PATH};
pub use conn::{Connections, EventKind};
pub use crate::core::{Pool, TimerTree};
pub use cycle::Cycle;
pub use error::{Result, ServerError};
pub use event::accept::AcceptMutex;
pub use event::{EngineFlags, EventEngine, EventLoop, Readiness};
pub use listener::Listener;
pub use logging::LogOutput;
pub use process::{ProcessTable, Server};
