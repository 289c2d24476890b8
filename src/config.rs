/*!
 * Configuration structures and defaults for Pulsar
 */

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::{Result, ServerError};

/// Compile-time default configuration path (`-c` overrides it)
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pulsar/pulsar.toml";

/// Default listen backlog
pub const DEFAULT_BACKLOG: i32 = 511;

/// Errors local to configuration file loading
#[derive(Error, Debug)]
pub enum ConfigFileError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Log verbosity threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// One `[[listen]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Socket address, e.g. "127.0.0.1:8080"
    pub addr: String,

    /// listen(2) backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

/// Resolved server configuration, one per cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Run the master/worker model; false = single process
    pub master: bool,

    /// Detach from the controlling terminal at startup
    pub daemon: bool,

    /// Number of worker processes (0 = one per CPU)
    pub worker_processes: usize,

    /// Unprivileged user workers switch to (applied only when running as root)
    pub user: Option<String>,

    /// Group workers switch to (applied only when running as root)
    pub group: Option<String>,

    /// Pidfile location
    pub pid_path: PathBuf,

    /// Listening sockets
    pub listen: Vec<ListenConfig>,

    /// Size of the per-worker connection table
    pub worker_connections: usize,

    /// Readiness batch size handed to the kernel wait
    pub epoll_events: usize,

    /// Arbitrate accepts across workers with a shared lock
    pub accept_mutex: bool,

    /// Wait cap while another worker holds the accept lock
    pub accept_mutex_delay_ms: u64,

    /// Idle deadline for accepted connections
    pub client_timeout_ms: u64,

    /// Log verbosity
    pub log_level: LogLevel,

    /// Error log destination (None = stderr)
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            master: true,
            daemon: false,
            worker_processes: 1,
            user: None,
            group: None,
            pid_path: PathBuf::from("/run/pulsar.pid"),
            listen: Vec::new(),
            worker_connections: 512,
            epoll_events: 512,
            accept_mutex: true,
            accept_mutex_delay_ms: 100,
            client_timeout_ms: 60_000,
            log_level: LogLevel::Info,
            log_file: None,
        }
    }
}

impl ServerConfig {
    /// Effective worker count: 0 means one per CPU
    pub fn worker_count(&self) -> usize {
        if self.worker_processes == 0 {
            num_cpus::get()
        } else {
            self.worker_processes
        }
    }

    /// Parse the configured listen addresses
    pub fn listen_addrs(&self) -> Result<Vec<(SocketAddr, i32)>> {
        let mut out = Vec::with_capacity(self.listen.len());
        for l in &self.listen {
            let addr: SocketAddr = l.addr.parse().map_err(|_| {
                ServerError::Config(format!("invalid listen address \"{}\"", l.addr))
            })?;
            if l.backlog <= 0 {
                return Err(ServerError::Config(format!(
                    "invalid backlog {} for \"{}\"",
                    l.backlog, l.addr
                )));
            }
            out.push((addr, l.backlog));
        }
        Ok(out)
    }

    /// Validate the configuration as a whole; used by normal startup and by
    /// the `-t` config test
    pub fn validate(&self) -> Result<()> {
        if self.worker_connections == 0 {
            return Err(ServerError::Config(
                "worker_connections must be at least 1".to_string(),
            ));
        }
        if self.epoll_events == 0 {
            return Err(ServerError::Config(
                "epoll_events must be at least 1".to_string(),
            ));
        }
        if self.listen.is_empty() {
            return Err(ServerError::Config(
                "at least one [[listen]] block is required".to_string(),
            ));
        }
        self.listen_addrs()?;
        if self.pid_path.as_os_str().is_empty() {
            return Err(ServerError::Config("pid_path must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Configuration file structure (loaded from TOML)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub listen: Vec<ListenConfig>,

    #[serde(default)]
    pub events: EventsSection,

    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerSection {
    pub master: Option<bool>,
    pub daemon: Option<bool>,
    pub worker_processes: Option<usize>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub pid_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventsSection {
    pub worker_connections: Option<usize>,
    pub epoll_events: Option<usize>,
    pub accept_mutex: Option<bool>,
    pub accept_mutex_delay_ms: Option<u64>,
    pub client_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogSection {
    pub level: Option<LogLevel>,
    pub file: Option<PathBuf>,
}

impl ConfigFile {
    /// Load the configuration file from a TOML file
    pub fn load(path: &Path) -> std::result::Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Read {
            path: path.display().to_string(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigFileError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Apply this config file over the built-in defaults
    pub fn apply_to(&self, config: &mut ServerConfig) {
        if let Some(master) = self.server.master {
            config.master = master;
        }
        if let Some(daemon) = self.server.daemon {
            config.daemon = daemon;
        }
        if let Some(n) = self.server.worker_processes {
            config.worker_processes = n;
        }
        if let Some(ref user) = self.server.user {
            config.user = Some(user.clone());
        }
        if let Some(ref group) = self.server.group {
            config.group = Some(group.clone());
        }
        if let Some(ref pid) = self.server.pid_path {
            config.pid_path = pid.clone();
        }

        config.listen.extend(self.listen.iter().cloned());

        if let Some(n) = self.events.worker_connections {
            config.worker_connections = n;
        }
        if let Some(n) = self.events.epoll_events {
            config.epoll_events = n;
        }
        if let Some(b) = self.events.accept_mutex {
            config.accept_mutex = b;
        }
        if let Some(ms) = self.events.accept_mutex_delay_ms {
            config.accept_mutex_delay_ms = ms;
        }
        if let Some(ms) = self.events.client_timeout_ms {
            config.client_timeout_ms = ms;
        }

        if let Some(level) = self.log.level {
            config.log_level = level;
        }
        if let Some(ref file) = self.log.file {
            config.log_file = Some(file.clone());
        }
    }
}

/// Load and merge the configuration from `path`
pub fn load_config(path: &Path) -> Result<ServerConfig> {
    let file = ConfigFile::load(path).map_err(|e| ServerError::Config(e.to_string()))?;
    let mut config = ServerConfig::default();
    file.apply_to(&mut config);
    Ok(config)
}

// Shim for num_cpus functionality (fallback to std if needed)
//
// Safety: if CPU detection fails (restricted containers, odd cgroup setups)
// we fall back to a single worker and warn on stderr, since this can run
// before the logging subsystem is up.
mod num_cpus {
    use std::thread;

    pub fn get() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or_else(|e| {
                eprintln!(
                    "WARN: pulsar failed to detect available parallelism: {}. \
                    Defaulting to 1 worker process.",
                    e
                );
                1
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
        [server]
        master = true
        worker_processes = 4
        pid_path = "/tmp/pulsar-test.pid"

        [[listen]]
        addr = "127.0.0.1:8080"

        [[listen]]
        addr = "127.0.0.1:8081"
        backlog = 128

        [events]
        worker_connections = 64
        accept_mutex = false

        [log]
        level = "debug"
    "#;

    #[test]
    fn test_load_and_apply() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert!(config.master);
        assert_eq!(config.worker_processes, 4);
        assert_eq!(config.pid_path, PathBuf::from("/tmp/pulsar-test.pid"));
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[0].backlog, DEFAULT_BACKLOG);
        assert_eq!(config.listen[1].backlog, 128);
        assert_eq!(config.worker_connections, 64);
        assert!(!config.accept_mutex);
        assert_eq!(config.log_level, LogLevel::Debug);
        // Untouched keys keep their defaults
        assert_eq!(config.accept_mutex_delay_ms, 100);

        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigFile::load(Path::new("/nonexistent/pulsar.toml")).unwrap_err();
        assert!(matches!(err, ConfigFileError::Read { .. }));
    }

    #[test]
    fn test_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[server\nmaster = yes").unwrap();
        let err = ConfigFile::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigFileError::Parse { .. }));
    }

    #[test]
    fn test_validation_requires_listener() {
        let config = ServerConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("listen"));
    }

    #[test]
    fn test_validation_rejects_bad_addr() {
        let mut config = ServerConfig::default();
        config.listen.push(ListenConfig {
            addr: "not-an-address".to_string(),
            backlog: DEFAULT_BACKLOG,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_connections() {
        let mut config = ServerConfig::default();
        config.listen.push(ListenConfig {
            addr: "127.0.0.1:0".to_string(),
            backlog: DEFAULT_BACKLOG,
        });
        config.worker_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_count_auto() {
        let mut config = ServerConfig::default();
        config.worker_processes = 0;
        assert!(config.worker_count() >= 1);
        config.worker_processes = 3;
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn test_listen_addrs_parsed() {
        let mut config = ServerConfig::default();
        config.listen.push(ListenConfig {
            addr: "0.0.0.0:9000".to_string(),
            backlog: 64,
        });
        let addrs = config.listen_addrs().unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].0.port(), 9000);
        assert_eq!(addrs[0].1, 64);
    }
}
