/*!
 * Configuration cycle
 *
 * One cycle per configuration generation: the pool, the listener set and
 * the open-files registry live and die together. A new cycle is initialized
 * from the old one so listeners whose address survived the edit keep their
 * fds, which is what makes reconfiguration invisible to connected clients.
 */

use std::env;
use std::path::PathBuf;

use crate::config::ServerConfig;
use crate::core::{ChunkedList, Pool};
use crate::error::Result;
use crate::event::accept;
use crate::listener::{self, Listener, INHERIT_ENV};
use crate::logging::LogOutput;

/// Arena block size for the cycle pool
pub const CYCLE_POOL_SIZE: usize = 16 * 1024;

/// A long-lived file the REOPEN signal rotates
pub struct OpenFile {
    pub path: Option<PathBuf>,
    pub output: LogOutput,
}

pub struct Cycle {
    pub pool: Pool,
    pub config: ServerConfig,
    pub listeners: Vec<Listener>,
    pub open_files: ChunkedList<OpenFile>,
    /// Listener set came from the upgrade environment variable
    pub inherited: bool,
}

impl Cycle {
    /// Materialize a cycle from `config`.
    ///
    /// With `previous`, matching listeners move over and keep their fds;
    /// without it, a populated handoff environment variable supplies
    /// inherited fds. Bind failures leave `previous` fully intact so the
    /// master can keep running on the old cycle.
    pub fn init(
        config: ServerConfig,
        log: &LogOutput,
        mut previous: Option<&mut Cycle>,
    ) -> Result<Cycle> {
        let pool = Pool::create(CYCLE_POOL_SIZE);
        let addrs = config.listen_addrs()?;

        // Fresh start may adopt sockets from the upgrade handoff
        let mut env_listeners: Vec<Listener> = Vec::new();
        let mut inherited = false;
        if previous.is_none() {
            if let Ok(val) = env::var(INHERIT_ENV) {
                tracing::info!("using inherited sockets from \"{}\"", val);
                let fds = listener::parse_inherited(&pool, &val);
                for &fd in fds.iter() {
                    env_listeners.push(Listener::from_inherited(fd, accept::init_connection)?);
                }
                inherited = true;
            }
        }

        let old: &mut Vec<Listener> = match previous.as_deref_mut() {
            Some(prev) => &mut prev.listeners,
            None => &mut env_listeners,
        };

        // First pass: pull over every listener whose address still appears
        let mut planned: Vec<Option<Listener>> = Vec::with_capacity(addrs.len());
        let mut reused: Vec<bool> = Vec::with_capacity(addrs.len());
        for (addr, backlog) in &addrs {
            let pos = old.iter().position(|l| l.fd != -1 && l.addr == *addr);
            match pos {
                Some(i) => {
                    let mut l = old.swap_remove(i);
                    l.backlog = *backlog;
                    tracing::info!(addr = %addr, fd = l.fd, "reusing listening socket");
                    planned.push(Some(l));
                    reused.push(true);
                }
                None => {
                    planned.push(None);
                    reused.push(false);
                }
            }
        }

        // Second pass: bind the rest. On failure everything reused goes
        // back and everything fresh is closed.
        for (k, (addr, backlog)) in addrs.iter().enumerate() {
            if planned[k].is_some() {
                continue;
            }
            match Listener::open(*addr, *backlog, accept::init_connection) {
                Ok(l) => {
                    tracing::info!(addr = %addr, fd = l.fd, "bound listening socket");
                    planned[k] = Some(l);
                }
                Err(e) => {
                    for (slot, was_reused) in planned.iter_mut().zip(reused.iter()) {
                        if let Some(mut l) = slot.take() {
                            if *was_reused {
                                old.push(l);
                            } else {
                                l.close();
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }

        // Unmatched survivors of the old set are closed for good
        for l in old.iter_mut() {
            tracing::info!(addr = %l.addr, fd = l.fd, "closing unmatched listener");
            l.close();
        }
        old.clear();

        let listeners: Vec<Listener> = planned.into_iter().flatten().collect();

        let mut open_files = ChunkedList::new(8);
        open_files.push(OpenFile {
            path: log.path(),
            output: log.clone(),
        });

        Ok(Cycle {
            pool,
            config,
            listeners,
            open_files,
            inherited,
        })
    }

    /// Re-open every registered file in place (REOPEN signal)
    pub fn reopen_files(&self) {
        for file in self.open_files.iter() {
            if let Err(e) = file.output.reopen() {
                tracing::error!(path = ?file.path, "could not reopen log file: {}", e);
            }
        }
    }

    /// Close all listening sockets (master shutdown path)
    pub fn close_listeners(&mut self) {
        for l in self.listeners.iter_mut() {
            l.close();
        }
    }

    /// Handoff string for the upgrade exec
    pub fn inherited_env(&self) -> String {
        format!(
            "{}={}",
            INHERIT_ENV,
            listener::format_inherited(&self.listeners)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenConfig;

    fn test_config(addrs: &[&str]) -> ServerConfig {
        let mut config = ServerConfig::default();
        for a in addrs {
            config.listen.push(ListenConfig {
                addr: a.to_string(),
                backlog: 16,
            });
        }
        config
    }

    #[test]
    fn test_init_binds_configured_listeners() {
        let log = LogOutput::stderr();
        let mut cycle = Cycle::init(test_config(&["127.0.0.1:0"]), &log, None).unwrap();

        assert_eq!(cycle.listeners.len(), 1);
        assert!(cycle.listeners[0].fd >= 0);
        assert!(!cycle.inherited);
        assert_eq!(cycle.open_files.len(), 1);

        cycle.close_listeners();
    }

    #[test]
    fn test_reconfigure_reuses_matching_listener() {
        let log = LogOutput::stderr();
        let mut old = Cycle::init(test_config(&["127.0.0.1:0"]), &log, None).unwrap();

        let kept_addr = old.listeners[0].addr;
        let kept_fd = old.listeners[0].fd;

        // New config keeps the same address and adds another listener
        let new_config = test_config(&[&kept_addr.to_string(), "127.0.0.1:0"]);
        let mut new = Cycle::init(new_config, &log, Some(&mut old)).unwrap();

        assert_eq!(new.listeners.len(), 2);
        assert_eq!(new.listeners[0].fd, kept_fd);
        assert_eq!(new.listeners[0].addr, kept_addr);
        assert!(new.listeners[1].fd >= 0);
        assert_ne!(new.listeners[1].fd, kept_fd);

        // The old cycle no longer owns any listener
        assert!(old.listeners.is_empty());

        new.close_listeners();
    }

    #[test]
    fn test_reconfigure_closes_unmatched_listener() {
        let log = LogOutput::stderr();
        let mut old = Cycle::init(test_config(&["127.0.0.1:0", "127.0.0.1:0"]), &log, None).unwrap();

        let kept_addr = old.listeners[0].addr;
        let kept_fd = old.listeners[0].fd;
        let dropped_addr = old.listeners[1].addr;

        let mut new = Cycle::init(test_config(&[&kept_addr.to_string()]), &log, Some(&mut old))
            .unwrap();

        assert_eq!(new.listeners.len(), 1);
        assert_eq!(new.listeners[0].fd, kept_fd);

        // The dropped address is free again
        let probe = std::net::TcpListener::bind(dropped_addr);
        assert!(probe.is_ok());

        new.close_listeners();
    }

    #[test]
    fn test_failed_bind_preserves_previous_cycle() {
        let log = LogOutput::stderr();
        let mut old = Cycle::init(test_config(&["127.0.0.1:0"]), &log, None).unwrap();
        let kept_addr = old.listeners[0].addr;
        let kept_fd = old.listeners[0].fd;

        // Occupy a port, then ask the new cycle for it: the bind must fail
        // and the old cycle must keep its listener
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let blocked_addr = blocker.local_addr().unwrap();

        let new_config = test_config(&[&kept_addr.to_string(), &blocked_addr.to_string()]);
        let err = Cycle::init(new_config, &log, Some(&mut old));
        assert!(err.is_err());

        assert_eq!(old.listeners.len(), 1);
        assert_eq!(old.listeners[0].fd, kept_fd);
        assert_eq!(old.listeners[0].addr, kept_addr);

        old.close_listeners();
    }

    #[test]
    fn test_inherited_env_format() {
        let log = LogOutput::stderr();
        let mut cycle = Cycle::init(test_config(&["127.0.0.1:0"]), &log, None).unwrap();
        let env = cycle.inherited_env();
        assert!(env.starts_with("PULSAR="));
        assert!(env.ends_with(';'));
        cycle.close_listeners();
        // After close, no fds are advertised
        assert_eq!(cycle.inherited_env(), "PULSAR=");
    }
}
