/*!
 * Process table and spawn
 *
 * A dense table of child slots, each with the socketpair channel the
 * master writes and the child reads. Respawned children reuse their old
 * slot so peers keep a stable address for OPEN_CHANNEL bookkeeping.
 */

pub mod channel;
pub mod master;
pub mod signals;
pub mod worker;

use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use crate::cycle::Cycle;
use crate::error::{Result, ServerError};
use crate::event::accept::AcceptMutex;
use crate::listener::set_nonblocking;
use crate::logging::LogOutput;

/// Everything the supervisor owns, threaded through explicitly instead of
/// living in process-wide globals. The signal flag set stays static (the
/// handler's async-signal-safety leaves no choice); all other state is here.
pub struct Server {
    pub cycle: Cycle,
    pub procs: ProcessTable,
    /// Created before the first fork so every worker maps the same word
    pub accept_mutex: Option<AcceptMutex>,
    /// argv as started, for the upgrade exec
    pub args: Vec<OsString>,
    pub config_path: PathBuf,
    pub log: LogOutput,
    /// WINCH was honored; a dying new binary re-arms the old fleet
    pub noaccepting: bool,
    /// An aborted upgrade wants a fresh cohort
    pub restart: bool,
}

/// Hard cap on table size
pub const MAX_PROCESSES: usize = 1024;

/// Respawn policy attached to a child at spawn time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnPolicy {
    /// One-shot child
    NoRespawn,
    /// Relaunch on unexpected exit
    Respawn,
    /// Respawn, but marked so the next fleet-wide signal skips it (fresh
    /// cohort during a reload)
    JustRespawn,
    /// New-binary master: not respawned, not signalled with the fleet
    Detached,
}

/// What the child runs after the fork
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcKind {
    Worker,
    /// Child that immediately execs another binary
    Exec,
}

pub struct Process {
    pub pid: libc::pid_t,
    pub status: libc::c_int,
    /// Master writes channel[0]; the child reads channel[1]
    pub channel: [RawFd; 2],
    pub kind: ProcKind,
    pub name: &'static str,
    pub respawn: bool,
    pub just_respawn: bool,
    pub detached: bool,
    pub exiting: bool,
    pub exited: bool,
}

/// Outcome of a fork as seen by each side
pub enum Spawned {
    Parent { slot: usize, pid: libc::pid_t },
    Child { slot: usize },
}

#[derive(Default)]
pub struct ProcessTable {
    procs: Vec<Process>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self { procs: Vec::new() }
    }

    /// High-water mark: slots are dense up to here
    pub fn last(&self) -> usize {
        self.procs.len()
    }

    pub fn get(&self, slot: usize) -> &Process {
        &self.procs[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut Process {
        &mut self.procs[slot]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Process)> {
        self.procs.iter().enumerate()
    }

    /// Drop a reaped slot: the high-water mark shrinks when the last slot
    /// goes, otherwise the slot is left vacant for reuse
    pub fn release(&mut self, slot: usize) {
        if slot == self.procs.len().saturating_sub(1) {
            self.procs.pop();
            // Trailing vacancies collapse too
            while self.procs.last().map(|p| p.pid == -1) == Some(true) {
                self.procs.pop();
            }
        } else {
            self.procs[slot].pid = -1;
        }
    }

    fn alloc_slot(&mut self, reuse: Option<usize>) -> Result<usize> {
        if let Some(slot) = reuse {
            return Ok(slot);
        }
        for i in 0..self.procs.len() {
            if self.procs[i].pid == -1 {
                return Ok(i);
            }
        }
        if self.procs.len() >= MAX_PROCESSES {
            return Err(ServerError::Other(format!(
                "no more than {} processes can be spawned",
                MAX_PROCESSES
            )));
        }
        self.procs.push(Process {
            pid: -1,
            status: 0,
            channel: [-1, -1],
            kind: ProcKind::Worker,
            name: "",
            respawn: false,
            just_respawn: false,
            detached: false,
            exiting: false,
            exited: false,
        });
        Ok(self.procs.len() - 1)
    }

    /// Fork a child into a slot. The parent arm records pid and policy; the
    /// child arm returns so the caller can enter the child's main function
    /// (which must not return).
    pub fn spawn(
        &mut self,
        kind: ProcKind,
        name: &'static str,
        policy: SpawnPolicy,
        reuse_slot: Option<usize>,
    ) -> Result<Spawned> {
        let slot = self.alloc_slot(reuse_slot)?;

        let channel: [RawFd; 2] = if policy == SpawnPolicy::Detached {
            [-1, -1]
        } else {
            let mut fds = [0 as RawFd; 2];
            let rc = unsafe {
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
            };
            if rc == -1 {
                return Err(ServerError::Spawn {
                    name,
                    source: io::Error::last_os_error(),
                });
            }
            for &fd in &fds {
                if let Err(source) = set_nonblocking(fd).and_then(|_| set_cloexec(fd)) {
                    channel::close_channel(fds);
                    return Err(ServerError::Spawn { name, source });
                }
            }
            fds
        };

        // The channel lands in the slot before the fork so the child's
        // snapshot of the table already carries it
        {
            let p = &mut self.procs[slot];
            p.channel = channel;
            p.kind = kind;
            p.name = name;
            p.status = 0;
            p.exiting = false;
            p.exited = false;
            p.respawn = matches!(policy, SpawnPolicy::Respawn | SpawnPolicy::JustRespawn);
            p.just_respawn = policy == SpawnPolicy::JustRespawn;
            p.detached = policy == SpawnPolicy::Detached;
        }

        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                let source = io::Error::last_os_error();
                channel::close_channel(channel);
                self.procs[slot].channel = [-1, -1];
                self.procs[slot].pid = -1;
                Err(ServerError::Spawn { name, source })
            }
            0 => {
                // Child: the write end belongs to the master
                if channel[0] != -1 {
                    unsafe {
                        libc::close(channel[0]);
                    }
                    self.procs[slot].channel[0] = -1;
                }
                self.procs[slot].pid = unsafe { libc::getpid() };
                Ok(Spawned::Child { slot })
            }
            pid => {
                self.procs[slot].pid = pid;
                tracing::info!(name, pid, slot, "spawned child process");
                Ok(Spawned::Parent { slot, pid })
            }
        }
    }

    /// Fork-and-exec a detached process (the hot-upgrade binary). The fds
    /// in `inherit_fds` have close-on-exec cleared in the child so they
    /// survive the exec; `extra_env` is appended to the environment.
    pub fn execute(
        &mut self,
        path: &OsStr,
        args: &[OsString],
        extra_env: &str,
        inherit_fds: &[RawFd],
        name: &'static str,
    ) -> Result<libc::pid_t> {
        let slot = self.alloc_slot(None)?;

        // Everything heap-allocated is prepared before the fork; the child
        // only makes raw syscalls
        let c_path = CString::new(path.as_bytes())
            .map_err(|_| ServerError::Other("binary path contains NUL".to_string()))?;
        let mut c_args: Vec<CString> = Vec::with_capacity(args.len());
        for a in args {
            c_args.push(
                CString::new(a.as_bytes())
                    .map_err(|_| ServerError::Other("argument contains NUL".to_string()))?,
            );
        }
        let mut argv: Vec<*const libc::c_char> =
            c_args.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());

        let mut c_env: Vec<CString> = Vec::new();
        for (k, v) in std::env::vars_os() {
            let mut kv = k;
            kv.push("=");
            kv.push(v);
            if let Ok(s) = CString::new(kv.as_bytes()) {
                c_env.push(s);
            }
        }
        c_env.push(
            CString::new(extra_env)
                .map_err(|_| ServerError::Other("environment contains NUL".to_string()))?,
        );
        let mut envp: Vec<*const libc::c_char> = c_env.iter().map(|e| e.as_ptr()).collect();
        envp.push(std::ptr::null());

        {
            let p = &mut self.procs[slot];
            p.channel = [-1, -1];
            p.kind = ProcKind::Exec;
            p.name = name;
            p.status = 0;
            p.exiting = false;
            p.exited = false;
            p.respawn = false;
            p.just_respawn = false;
            p.detached = true;
        }

        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                let source = io::Error::last_os_error();
                self.procs[slot].pid = -1;
                Err(ServerError::Spawn { name, source })
            }
            0 => {
                unsafe {
                    for &fd in inherit_fds {
                        libc::fcntl(fd, libc::F_SETFD, 0);
                    }
                    libc::execve(c_path.as_ptr(), argv.as_ptr(), envp.as_ptr());
                    // Only reached when execve failed
                    libc::_exit(1);
                }
            }
            pid => {
                self.procs[slot].pid = pid;
                tracing::info!(name, pid, slot, "executed new binary");
                Ok(pid)
            }
        }
    }

    /// Record a peer announced over the channel (OPEN_CHANNEL). The slot
    /// may be beyond this process's fork-time snapshot of the table.
    pub fn record_peer(&mut self, slot: usize, pid: libc::pid_t, fd: RawFd) {
        if slot >= MAX_PROCESSES {
            tracing::warn!(slot, "ignoring peer announcement for out-of-range slot");
            return;
        }
        while self.procs.len() <= slot {
            self.procs.push(Process {
                pid: -1,
                status: 0,
                channel: [-1, -1],
                kind: ProcKind::Worker,
                name: "",
                respawn: false,
                just_respawn: false,
                detached: false,
                exiting: false,
                exited: false,
            });
        }
        let p = &mut self.procs[slot];
        p.pid = pid;
        p.channel[0] = fd;
    }

    /// Close and forget a peer's channel (CLOSE_CHANNEL)
    pub fn forget_peer(&mut self, slot: usize) {
        if slot >= self.procs.len() {
            return;
        }
        let p = &mut self.procs[slot];
        if p.channel[0] != -1 {
            unsafe {
                libc::close(p.channel[0]);
            }
            p.channel[0] = -1;
        }
    }

    /// Collect exit statuses without blocking and mark the slots. Runs in
    /// the master loop when the reap flag is observed, never in the signal
    /// handler.
    pub fn update_statuses(&mut self) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            match pid {
                0 => return,
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    // ECHILD: nothing left to reap
                    return;
                }
                pid => {
                    for p in self.procs.iter_mut() {
                        if p.pid == pid {
                            p.status = status;
                            p.exited = true;
                            if libc::WIFSIGNALED(status) {
                                tracing::warn!(
                                    name = p.name,
                                    pid,
                                    signal = libc::WTERMSIG(status),
                                    "child killed by signal"
                                );
                            } else {
                                tracing::info!(
                                    name = p.name,
                                    pid,
                                    code = libc::WEXITSTATUS(status),
                                    "child exited"
                                );
                            }
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Shorten the process title as seen in ps/top
pub fn set_process_title(title: &str) {
    #[cfg(target_os = "linux")]
    {
        let mut buf = [0u8; 16];
        let bytes = title.as_bytes();
        let n = bytes.len().min(15);
        buf[..n].copy_from_slice(&bytes[..n]);
        unsafe {
            libc::prctl(libc::PR_SET_NAME, buf.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = title;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_allocation_is_dense() {
        let mut table = ProcessTable::new();
        assert_eq!(table.alloc_slot(None).unwrap(), 0);
        table.procs[0].pid = 100;
        assert_eq!(table.alloc_slot(None).unwrap(), 1);
        table.procs[1].pid = 101;
        assert_eq!(table.last(), 2);

        // A vacated middle slot is reused before the table grows
        table.procs[0].pid = -1;
        assert_eq!(table.alloc_slot(None).unwrap(), 0);
    }

    #[test]
    fn test_release_shrinks_high_water_mark() {
        let mut table = ProcessTable::new();
        for pid in [10, 11, 12] {
            let slot = table.alloc_slot(None).unwrap();
            table.procs[slot].pid = pid;
        }

        // Middle release leaves a vacancy
        table.procs[1].pid = -1;
        table.release(1);
        assert_eq!(table.last(), 3);

        // Releasing the tail collapses through trailing vacancies
        table.procs[2].pid = -1;
        table.release(2);
        assert_eq!(table.last(), 1);
    }

    #[test]
    fn test_reuse_slot_is_honored() {
        let mut table = ProcessTable::new();
        let slot = table.alloc_slot(None).unwrap();
        table.procs[slot].pid = 55;
        assert_eq!(table.alloc_slot(Some(slot)).unwrap(), slot);
    }

    #[test]
    fn test_set_process_title_accepts_long_names() {
        // Truncated to the kernel's 15-byte limit without panicking
        set_process_title("pulsar: worker process is shutting down");
    }
}
