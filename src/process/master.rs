/*!
 * Master loop
 *
 * The master owns no connections. It sleeps in sigsuspend, and every wakeup
 * works through the flag set in a fixed priority order: reap, exit-if-empty,
 * fast terminate (with escalating kill delay), graceful quit, reload
 * cohort hand-over, reconfigure, restart, log reopen, binary upgrade,
 * no-accept.
 */

use std::process;

use crate::core::clock;
use crate::cycle::Cycle;
use crate::error::Result;
use crate::pidfile;
use crate::process::channel::{self, ChannelMsg, CMD_CLOSE_CHANNEL, CMD_OPEN_CHANNEL};
use crate::process::signals::{self, Role};
use crate::process::worker;
use crate::process::{set_process_title, ProcKind, Server, SpawnPolicy, Spawned};

/// Escalating shutdown timeout: TERM at 50 ms doubling to 800 ms, then KILL
pub struct KillSchedule {
    delay: u64,
}

/// What to do with a still-live fleet this escalation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillAction {
    /// Send TERM and re-check after this many milliseconds
    Term(u64),
    /// The fleet outstayed its welcome
    Kill,
}

impl KillSchedule {
    pub fn new() -> Self {
        Self { delay: 0 }
    }

    pub fn advance(&mut self) -> KillAction {
        if self.delay == 0 {
            self.delay = 50;
        } else {
            self.delay *= 2;
        }
        if self.delay > 1000 {
            KillAction::Kill
        } else {
            KillAction::Term(self.delay)
        }
    }
}

impl Default for KillSchedule {
    fn default() -> Self {
        Self::new()
    }
}

/// Supervisor main loop; only leaves through process exit
pub fn master_process_cycle(mut server: Server) -> ! {
    signals::set_role(Role::Master);
    if let Err(e) = signals::block_control_signals() {
        tracing::error!("{}", e);
    }
    set_process_title("pulsar: master");

    let n = server.cycle.config.worker_count();
    start_worker_processes(&mut server, n, SpawnPolicy::Respawn);

    signals::set_new_binary(0);
    let mut schedule = KillSchedule::new();
    let mut live = true;

    loop {
        signals::suspend();
        clock::update();

        let signo = signals::take_last_signal();
        if signo != 0 {
            tracing::info!(signal = signo, "wake up");
        }

        if signals::take(&signals::REAP) {
            server.procs.update_statuses();
            live = reap_children(&mut server);
        }

        if !live
            && (signals::pending(&signals::TERMINATE) || signals::pending(&signals::QUIT))
        {
            master_exit(&mut server);
        }

        if signals::pending(&signals::TERMINATE) {
            match schedule.advance() {
                KillAction::Term(delay) => {
                    if let Err(e) = signals::arm_alarm(delay) {
                        tracing::error!("{}", e);
                    }
                    signal_worker_processes(&mut server, signals::TERMINATE_SIGNAL);
                }
                KillAction::Kill => {
                    signal_worker_processes(&mut server, libc::SIGKILL);
                }
            }
            continue;
        }

        if signals::pending(&signals::QUIT) {
            signal_worker_processes(&mut server, signals::SHUTDOWN_SIGNAL);
            // Workers close their copies; the master's copies go too so the
            // port frees up at once
            server.cycle.close_listeners();
            continue;
        }

        if signals::take(&signals::TIMER) {
            // The reload kill-delay ran out: bring up the fresh cohort and
            // retire the old one
            let n = server.cycle.config.worker_count();
            start_worker_processes(&mut server, n, SpawnPolicy::JustRespawn);
            live = true;
            signal_worker_processes(&mut server, signals::SHUTDOWN_SIGNAL);
        }

        if signals::take(&signals::RECONFIGURE) {
            if signals::new_binary() > 0 {
                // The new binary owns the old fleet now; we just field a
                // fresh cohort of our own
                tracing::info!("start new workers");
                let n = server.cycle.config.worker_count();
                start_worker_processes(&mut server, n, SpawnPolicy::Respawn);
                server.noaccepting = false;
                live = true;
                continue;
            }

            tracing::info!("reconfiguring");
            match reload_cycle(&mut server) {
                Ok(()) => {
                    let n = server.cycle.config.worker_count();
                    start_worker_processes(&mut server, n, SpawnPolicy::JustRespawn);
                    live = true;
                    signal_worker_processes(&mut server, signals::SHUTDOWN_SIGNAL);
                }
                Err(e) => {
                    tracing::error!("reconfiguration failed, keeping old cycle: {}", e);
                }
            }
        }

        if server.restart {
            server.restart = false;
            let n = server.cycle.config.worker_count();
            start_worker_processes(&mut server, n, SpawnPolicy::Respawn);
            live = true;
        }

        if signals::take(&signals::REOPEN) {
            tracing::info!("reopening logs");
            server.cycle.reopen_files();
            signal_worker_processes(&mut server, signals::REOPEN_SIGNAL);
        }

        if signals::take(&signals::CHANGE_BINARY) {
            tracing::info!("changing binary");
            exec_new_binary(&mut server);
        }

        if signals::take(&signals::NOACCEPT) {
            server.noaccepting = true;
            signal_worker_processes(&mut server, signals::SHUTDOWN_SIGNAL);
        }
    }
}

/// Parse the config again and materialize a cycle over the old one; the
/// old cycle survives any failure
fn reload_cycle(server: &mut Server) -> Result<()> {
    let config = crate::config::load_config(&server.config_path)?;
    config.validate()?;
    let new_cycle = Cycle::init(config, &server.log, Some(&mut server.cycle))?;
    server.cycle = new_cycle;

    // The error log may have moved
    if let Err(e) = server
        .log
        .retarget(server.cycle.config.log_file.as_deref())
    {
        tracing::error!("could not retarget error log: {}", e);
    }
    Ok(())
}

/// Fork `n` workers; each new channel is announced to every older child
pub fn start_worker_processes(server: &mut Server, n: usize, policy: SpawnPolicy) {
    tracing::info!(n, "start worker processes");

    for _ in 0..n {
        match server
            .procs
            .spawn(ProcKind::Worker, "worker process", policy, None)
        {
            Ok(Spawned::Child { slot }) => {
                worker::worker_process_cycle(server, slot);
            }
            Ok(Spawned::Parent { slot, pid }) => {
                let ch = ChannelMsg {
                    command: CMD_OPEN_CHANNEL,
                    pid,
                    slot: slot as i32,
                    fd: server.procs.get(slot).channel[0],
                };
                broadcast(server, slot, &ch);
            }
            Err(e) => {
                tracing::error!("{}", e);
            }
        }
    }
}

/// Send a channel record to every live child except `skip`
fn broadcast(server: &mut Server, skip: usize, ch: &ChannelMsg) {
    for i in 0..server.procs.last() {
        let p = server.procs.get(i);
        if i == skip || p.pid == -1 || p.exited || p.channel[0] == -1 {
            continue;
        }
        tracing::debug!(
            to_slot = i,
            to_pid = p.pid,
            command = ch.command,
            "pass channel message"
        );
        if let Err(e) = channel::write_channel(p.channel[0], ch) {
            tracing::error!(slot = i, "channel write failed: {}", e);
        }
    }
}

/// Tell the fleet something: over the channel where possible, by signal
/// otherwise. just_respawn children are skipped once (they are the fresh
/// cohort a reload just started).
pub fn signal_worker_processes(server: &mut Server, signo: libc::c_int) {
    let command = match signo {
        s if s == signals::SHUTDOWN_SIGNAL => channel::CMD_QUIT,
        s if s == signals::TERMINATE_SIGNAL => channel::CMD_TERMINATE,
        s if s == signals::REOPEN_SIGNAL => channel::CMD_REOPEN,
        _ => 0,
    };

    for i in 0..server.procs.last() {
        let p = server.procs.get(i);
        let (pid, detached, just_respawn, exiting, channel_fd) =
            (p.pid, p.detached, p.just_respawn, p.exiting, p.channel[0]);

        if detached || pid == -1 {
            continue;
        }
        if just_respawn {
            server.procs.get_mut(i).just_respawn = false;
            continue;
        }
        if exiting && signo == signals::SHUTDOWN_SIGNAL {
            continue;
        }

        if command != 0 && channel_fd != -1 {
            let msg = ChannelMsg::new(command);
            if channel::write_channel(channel_fd, &msg).is_ok() {
                if signo != signals::REOPEN_SIGNAL {
                    server.procs.get_mut(i).exiting = true;
                }
                continue;
            }
        }

        tracing::debug!(pid, signo, "kill child");
        if unsafe { libc::kill(pid, signo) } == -1 {
            let err = std::io::Error::last_os_error();
            tracing::error!(pid, signo, "kill() failed: {}", err);
            if err.raw_os_error() == Some(libc::ESRCH) {
                let p = server.procs.get_mut(i);
                p.exited = true;
                p.exiting = false;
                signals::REAP.store(true, std::sync::atomic::Ordering::Relaxed);
            }
            continue;
        }

        if signo != signals::REOPEN_SIGNAL {
            server.procs.get_mut(i).exiting = true;
        }
    }
}

/// Walk the table after a reap: close and announce dead channels, respawn
/// what should come back, notice a dead upgrade binary. Returns whether any
/// child the master waits on is still live.
pub fn reap_children(server: &mut Server) -> bool {
    let mut live = false;

    let mut i = 0;
    while i < server.procs.last() {
        let p = server.procs.get(i);
        if p.pid == -1 {
            i += 1;
            continue;
        }

        if !p.exited {
            if p.exiting || !p.detached {
                live = true;
            }
            i += 1;
            continue;
        }

        let (pid, detached, respawn, exiting, chan) =
            (p.pid, p.detached, p.respawn, p.exiting, p.channel);
        let kind = p.kind;
        let name = p.name;

        if !detached {
            channel::close_channel(chan);
            server.procs.get_mut(i).channel = [-1, -1];

            let ch = ChannelMsg {
                command: CMD_CLOSE_CHANNEL,
                pid,
                slot: i as i32,
                fd: -1,
            };
            broadcast(server, i, &ch);
        }

        if respawn
            && !exiting
            && !signals::pending(&signals::TERMINATE)
            && !signals::pending(&signals::QUIT)
        {
            match server.procs.spawn(kind, name, SpawnPolicy::Respawn, Some(i)) {
                Ok(Spawned::Child { slot }) => {
                    worker::worker_process_cycle(server, slot);
                }
                Ok(Spawned::Parent { slot, pid }) => {
                    let ch = ChannelMsg {
                        command: CMD_OPEN_CHANNEL,
                        pid,
                        slot: slot as i32,
                        fd: server.procs.get(slot).channel[0],
                    };
                    broadcast(server, slot, &ch);
                    live = true;
                    i += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!("can not respawn {}: {}", name, e);
                    i += 1;
                    continue;
                }
            }
        }

        if pid == signals::new_binary() {
            // The upgrade binary is gone; roll back to accepting ourselves
            // if WINCH had paused us
            signals::set_new_binary(0);
            pidfile::delete(&pidfile::newbin_path(&server.cycle.config.pid_path));
            if server.noaccepting {
                server.restart = true;
                server.noaccepting = false;
            }
        }

        server.procs.get_mut(i).exited = false;
        server.procs.get_mut(i).pid = -1;
        server.procs.release(i);
        i += 1;
    }

    live
}

/// Spawn the new binary with the listener fds in its environment
fn exec_new_binary(server: &mut Server) {
    let env = server.cycle.inherited_env();
    let fds: Vec<i32> = server
        .cycle
        .listeners
        .iter()
        .map(|l| l.fd)
        .filter(|&fd| fd != -1)
        .collect();

    let path = server.args[0].clone();
    let args = server.args.clone();

    match server
        .procs
        .execute(&path, &args, &env, &fds, "new binary process")
    {
        Ok(pid) => {
            signals::set_new_binary(pid);
            let newbin = pidfile::newbin_path(&server.cycle.config.pid_path);
            if let Err(e) = pidfile::create(&newbin, pid as u32) {
                tracing::error!("{}", e);
            }
        }
        Err(e) => {
            tracing::error!("{}", e);
        }
    }
}

/// Last child is gone and a shutdown was requested
fn master_exit(server: &mut Server) -> ! {
    pidfile::delete(&server.cycle.config.pid_path);
    pidfile::delete(&pidfile::newbin_path(&server.cycle.config.pid_path));
    tracing::info!("exit");
    process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_schedule_escalation() {
        let mut s = KillSchedule::new();
        let mut delays = Vec::new();
        loop {
            match s.advance() {
                KillAction::Term(d) => delays.push(d),
                KillAction::Kill => break,
            }
        }
        assert_eq!(delays, vec![50, 100, 200, 400, 800]);
    }

    #[test]
    fn test_kill_schedule_stays_at_kill() {
        let mut s = KillSchedule::new();
        while s.advance() != KillAction::Kill {}
        assert_eq!(s.advance(), KillAction::Kill);
        assert_eq!(s.advance(), KillAction::Kill);
    }
}
