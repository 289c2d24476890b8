/*!
 * Worker loop
 *
 * Each worker drops privileges, restores the signal mask the master held
 * closed around the fork, trims the inherited channel fds down to its own
 * read end, and then lives inside `process_events` until a control flag
 * tells it otherwise.
 */

use std::ffi::CString;
use std::process;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::event::EventLoop;
use crate::process::channel::{
    self, CMD_CLOSE_CHANNEL, CMD_OPEN_CHANNEL, CMD_QUIT, CMD_REOPEN, CMD_TERMINATE,
};
use crate::process::signals::{self, Role};
use crate::process::{set_process_title, Server};

/// Worker main; never returns. Fatal init problems exit with code 2, the
/// master observes the status and respawns per policy.
pub fn worker_process_cycle(server: &mut Server, slot: usize) -> ! {
    signals::set_role(Role::Worker);
    set_process_title("pulsar: worker");

    if let Err(e) = drop_privileges(&server.cycle.config) {
        tracing::error!("{}", e);
        process::exit(2);
    }

    if let Err(e) = signals::unblock_all() {
        tracing::error!("{}", e);
    }

    // Channel housekeeping: peers' read ends are theirs, our write end is
    // the master's
    let own_channel = server.procs.get(slot).channel[1];
    for i in 0..server.procs.last() {
        if i == slot {
            continue;
        }
        let p = server.procs.get_mut(i);
        if p.pid == -1 || p.channel[1] == -1 {
            continue;
        }
        unsafe {
            libc::close(p.channel[1]);
        }
        p.channel[1] = -1;
    }

    let accept_mutex = if server.cycle.config.accept_mutex && server.cycle.config.worker_count() > 1
    {
        server.accept_mutex
    } else {
        None
    };

    let mut el = match EventLoop::new(&mut server.cycle, &mut server.procs, accept_mutex, slot) {
        Ok(el) => el,
        Err(e) => {
            tracing::error!("{}", e);
            process::exit(2);
        }
    };

    if let Err(e) = worker_init(&mut el, own_channel) {
        tracing::error!("{}", e);
        process::exit(2);
    }

    tracing::info!(pid = std::process::id(), "worker started");

    loop {
        if el.exiting && el.timers.is_empty() {
            // Graceful drain complete
            tracing::info!("exiting");
            process::exit(0);
        }

        tracing::trace!("worker cycle");

        if let Err(e) = el.process_events() {
            tracing::error!("{}", e);
        }

        if signals::pending(&signals::TERMINATE) {
            tracing::info!("exiting");
            process::exit(0);
        }

        if signals::take(&signals::QUIT) {
            tracing::info!("gracefully shutting down");
            set_process_title("pulsar: worker is shutting down");
            if !el.exiting {
                el.close_listeners();
                el.exiting = true;
            }
        }

        if signals::take(&signals::REOPEN) {
            tracing::info!("reopening logs");
            el.cycle.reopen_files();
        }
    }
}

/// Attach listeners and the channel read end to the readiness engine
fn worker_init(el: &mut EventLoop<'_>, own_channel: i32) -> Result<()> {
    el.register_listeners()?;

    let chslot = el
        .conns
        .get(own_channel)
        .ok_or(ServerError::ConnectionsExhausted)?;
    el.conns.read_cell_mut(chslot).handler = channel_handler;
    // Level-triggered: queued control messages keep the fd readable
    el.add_read_event(chslot, false)
        .map_err(|e| ServerError::WorkerInit(format!("channel registration: {}", e)))?;

    Ok(())
}

/// Read handler on the channel fd: drain queued control records and fan
/// them out into the same flags the signals set
pub fn channel_handler(el: &mut EventLoop<'_>, slot: u32) {
    let fd = el.conns.conn(slot).fd;

    loop {
        let msg = match channel::read_channel(fd) {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                // A dead master leaves an EOF behind. Drop the channel so a
                // level-triggered engine stops reporting it; the worker
                // keeps serving until a signal says otherwise.
                tracing::error!("channel read: {}", e);
                el.close_connection(slot);
                return;
            }
        };

        tracing::debug!(command = msg.command, "channel command");

        match msg.command {
            CMD_QUIT => signals::QUIT.store(true, std::sync::atomic::Ordering::Relaxed),
            CMD_TERMINATE => {
                signals::TERMINATE.store(true, std::sync::atomic::Ordering::Relaxed)
            }
            CMD_REOPEN => signals::REOPEN.store(true, std::sync::atomic::Ordering::Relaxed),
            CMD_OPEN_CHANNEL => {
                tracing::debug!(
                    slot = msg.slot,
                    pid = msg.pid,
                    fd = msg.fd,
                    "get channel"
                );
                if msg.slot >= 0 {
                    el.procs.record_peer(msg.slot as usize, msg.pid, msg.fd);
                }
            }
            CMD_CLOSE_CHANNEL => {
                tracing::debug!(slot = msg.slot, pid = msg.pid, "close channel");
                if msg.slot >= 0 {
                    el.procs.forget_peer(msg.slot as usize);
                }
            }
            other => {
                tracing::warn!(command = other, "unknown channel command");
            }
        }
    }

    el.conns.read_cell_mut(slot).ready = false;
}

/// setgid before setuid, and only when actually privileged; a non-root
/// developer run keeps its own identity
fn drop_privileges(config: &ServerConfig) -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        return Ok(());
    }

    if let Some(ref group) = config.group {
        let gid = lookup_group(group)?;
        if unsafe { libc::setgid(gid) } == -1 {
            return Err(ServerError::WorkerInit(format!(
                "setgid({}) failed: {}",
                gid,
                std::io::Error::last_os_error()
            )));
        }
    }

    if let Some(ref user) = config.user {
        let uid = lookup_user(user)?;
        if unsafe { libc::setuid(uid) } == -1 {
            return Err(ServerError::WorkerInit(format!(
                "setuid({}) failed: {}",
                uid,
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

fn lookup_user(name: &str) -> Result<libc::uid_t> {
    let c_name = CString::new(name)
        .map_err(|_| ServerError::Config("user name contains NUL".to_string()))?;
    let pwd = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if pwd.is_null() {
        return Err(ServerError::WorkerInit(format!(
            "getpwnam(\"{}\") failed",
            name
        )));
    }
    Ok(unsafe { (*pwd).pw_uid })
}

fn lookup_group(name: &str) -> Result<libc::gid_t> {
    let c_name = CString::new(name)
        .map_err(|_| ServerError::Config("group name contains NUL".to_string()))?;
    let grp = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if grp.is_null() {
        return Err(ServerError::WorkerInit(format!(
            "getgrnam(\"{}\") failed",
            name
        )));
    }
    Ok(unsafe { (*grp).gr_gid })
}

/// Single-process mode: supervisor duties and the event loop in one
/// process. Reconfigure rebuilds the cycle in place; quit and terminate
/// leave directly.
pub fn single_process_cycle(mut server: Server) -> ! {
    signals::set_role(Role::Single);
    set_process_title("pulsar: single");

    'cycle: loop {
        let mut el =
            match EventLoop::new(&mut server.cycle, &mut server.procs, None, usize::MAX) {
                Ok(el) => el,
                Err(e) => {
                    tracing::error!("{}", e);
                    process::exit(e.exit_code());
                }
            };

        if let Err(e) = el.register_listeners() {
            tracing::error!("{}", e);
            process::exit(e.exit_code());
        }

        tracing::info!(pid = std::process::id(), "single process started");

        loop {
            if let Err(e) = el.process_events() {
                tracing::error!("{}", e);
            }

            if signals::pending(&signals::TERMINATE) || signals::pending(&signals::QUIT) {
                drop(el);
                crate::pidfile::delete(&server.cycle.config.pid_path);
                tracing::info!("exit");
                process::exit(0);
            }

            if signals::take(&signals::RECONFIGURE) {
                tracing::info!("reconfiguring");
                break;
            }

            if signals::take(&signals::REOPEN) {
                tracing::info!("reopening logs");
                el.cycle.reopen_files();
            }
        }

        // Active client connections do not survive a single-process
        // reconfigure; close them so their fds are not orphaned when the
        // engine goes
        for s in 0..el.conns.total() as u32 {
            if el.conns.conn(s).fd != -1 && !el.listener_slots.contains(&s) {
                el.close_connection(s);
            }
        }

        // The event loop borrowed the cycle; rebuild both
        drop(el);
        match crate::config::load_config(&server.config_path)
            .and_then(|c| c.validate().map(|_| c))
            .and_then(|c| {
                crate::cycle::Cycle::init(c, &server.log, Some(&mut server.cycle))
            }) {
            Ok(new_cycle) => {
                server.cycle = new_cycle;
                if let Err(e) = server
                    .log
                    .retarget(server.cycle.config.log_file.as_deref())
                {
                    tracing::error!("could not retarget error log: {}", e);
                }
            }
            Err(e) => {
                tracing::error!("reconfiguration failed, keeping old cycle: {}", e);
            }
        }
        continue 'cycle;
    }
}
