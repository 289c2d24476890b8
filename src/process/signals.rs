/*!
 * Signal layer
 *
 * The handler is async-signal-safe: it translates the signal into exactly
 * one static atomic flag, refreshes the cached clock, and returns. All real
 * work happens in the master or worker loop when the flag is observed.
 * The flag set and role live in statics because that is all a handler may
 * touch; everything else threads through the `Server` value.
 */

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use crate::core::clock;
use crate::error::{Result, ServerError};

// Semantic signal mapping; the numeric values are build-time constants
pub const SHUTDOWN_SIGNAL: libc::c_int = libc::SIGQUIT;
pub const TERMINATE_SIGNAL: libc::c_int = libc::SIGTERM;
pub const RECONFIGURE_SIGNAL: libc::c_int = libc::SIGHUP;
pub const REOPEN_SIGNAL: libc::c_int = libc::SIGUSR1;
pub const CHANGEBIN_SIGNAL: libc::c_int = libc::SIGUSR2;
pub const NOACCEPT_SIGNAL: libc::c_int = libc::SIGWINCH;

/// Signal → flag translation targets. The main loops read and clear.
pub static REAP: AtomicBool = AtomicBool::new(false);
pub static TIMER: AtomicBool = AtomicBool::new(false);
pub static SIGIO: AtomicBool = AtomicBool::new(false);
pub static TERMINATE: AtomicBool = AtomicBool::new(false);
pub static QUIT: AtomicBool = AtomicBool::new(false);
pub static RECONFIGURE: AtomicBool = AtomicBool::new(false);
pub static REOPEN: AtomicBool = AtomicBool::new(false);
pub static CHANGE_BINARY: AtomicBool = AtomicBool::new(false);
pub static NOACCEPT: AtomicBool = AtomicBool::new(false);

/// Last signal number the handler saw, for the main loop's log line
static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Pid of an in-flight new-binary master; guards against a stale CHANGEBIN
static NEW_BINARY: AtomicI32 = AtomicI32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Single = 0,
    Master = 1,
    Worker = 2,
}

static ROLE: AtomicU8 = AtomicU8::new(Role::Single as u8);

pub fn set_role(role: Role) {
    ROLE.store(role as u8, Ordering::Relaxed);
}

pub fn role() -> Role {
    match ROLE.load(Ordering::Relaxed) {
        1 => Role::Master,
        2 => Role::Worker,
        _ => Role::Single,
    }
}

pub fn set_new_binary(pid: libc::pid_t) {
    NEW_BINARY.store(pid, Ordering::Relaxed);
}

pub fn new_binary() -> libc::pid_t {
    NEW_BINARY.load(Ordering::Relaxed)
}

/// Consume a flag: true if it was set
pub fn take(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::Relaxed)
}

pub fn pending(flag: &AtomicBool) -> bool {
    flag.load(Ordering::Relaxed)
}

/// Signal number observed most recently, consumed by the loop's log line
pub fn take_last_signal() -> i32 {
    LAST_SIGNAL.swap(0, Ordering::Relaxed)
}

extern "C" fn signal_handler(signo: libc::c_int) {
    // Only async-signal-safe operations from here on: atomics, getppid,
    // clock_gettime, errno save/restore
    let errno = unsafe { *libc::__errno_location() };

    clock::update();
    LAST_SIGNAL.store(signo, Ordering::Relaxed);

    match role() {
        Role::Master | Role::Single => match signo {
            SHUTDOWN_SIGNAL => QUIT.store(true, Ordering::Relaxed),
            TERMINATE_SIGNAL | libc::SIGINT => TERMINATE.store(true, Ordering::Relaxed),
            NOACCEPT_SIGNAL => NOACCEPT.store(true, Ordering::Relaxed),
            RECONFIGURE_SIGNAL => RECONFIGURE.store(true, Ordering::Relaxed),
            REOPEN_SIGNAL => REOPEN.store(true, Ordering::Relaxed),
            CHANGEBIN_SIGNAL => {
                // Ignore when we are the new binary and the old master is
                // still alive, or when an upgrade is already in flight
                if unsafe { libc::getppid() } > 1 || NEW_BINARY.load(Ordering::Relaxed) > 0 {
                    // stale
                } else {
                    CHANGE_BINARY.store(true, Ordering::Relaxed);
                }
            }
            libc::SIGALRM => {
                if !TERMINATE.load(Ordering::Relaxed) {
                    TIMER.store(true, Ordering::Relaxed);
                }
            }
            libc::SIGIO => SIGIO.store(true, Ordering::Relaxed),
            libc::SIGCHLD => REAP.store(true, Ordering::Relaxed),
            _ => {}
        },
        Role::Worker => match signo {
            SHUTDOWN_SIGNAL => QUIT.store(true, Ordering::Relaxed),
            TERMINATE_SIGNAL | libc::SIGINT => TERMINATE.store(true, Ordering::Relaxed),
            REOPEN_SIGNAL => REOPEN.store(true, Ordering::Relaxed),
            // RECONFIGURE, NOACCEPT, CHANGEBIN, SIGIO: master business
            _ => {}
        },
    }

    unsafe { *libc::__errno_location() = errno };
}

const HANDLED_SIGNALS: &[libc::c_int] = &[
    RECONFIGURE_SIGNAL,
    REOPEN_SIGNAL,
    NOACCEPT_SIGNAL,
    TERMINATE_SIGNAL,
    SHUTDOWN_SIGNAL,
    CHANGEBIN_SIGNAL,
    libc::SIGALRM,
    libc::SIGINT,
    libc::SIGIO,
    libc::SIGCHLD,
];

/// Register the handler for every control signal and ignore SIGPIPE
pub fn init() -> Result<()> {
    let handler = signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for &signo in HANDLED_SIGNALS {
        register(signo, handler)
            .map_err(|e| ServerError::Signal(format!("sigaction({}) failed: {}", signo, e)))?;
    }
    register(libc::SIGPIPE, libc::SIG_IGN)
        .map_err(|e| ServerError::Signal(format!("sigaction(SIGPIPE) failed: {}", e)))?;
    Ok(())
}

fn register(signo: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signo, &sa, std::ptr::null_mut()) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn control_set() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        for &signo in HANDLED_SIGNALS {
            libc::sigaddset(&mut set, signo);
        }
        set
    }
}

/// Mask the control signals; the master only takes them inside `suspend`
pub fn block_control_signals() -> Result<()> {
    let set = control_set();
    let rc = unsafe { libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc == -1 {
        return Err(ServerError::Signal(format!(
            "sigprocmask() failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Drop the inherited mask entirely (worker init: the master masked most
/// signals around the fork)
pub fn unblock_all() -> Result<()> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        if libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut()) == -1 {
            return Err(ServerError::Signal(format!(
                "sigprocmask() failed: {}",
                io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Sleep until any signal arrives
pub fn suspend() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigsuspend(&set);
    }
}

/// Arm a one-shot real-time alarm `ms` from now (the shutdown escalation)
pub fn arm_alarm(ms: u64) -> Result<()> {
    let itv = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        },
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &itv, std::ptr::null_mut()) };
    if rc == -1 {
        return Err(ServerError::Signal(format!(
            "setitimer() failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Signal state is process-global, so every behavior lives in one test
    // to keep the harness threads from racing on the role
    #[test]
    fn test_signal_to_flag_translation() {
        init().unwrap();

        set_role(Role::Master);
        unsafe { libc::raise(REOPEN_SIGNAL) };
        assert!(take(&REOPEN));
        assert!(!take(&REOPEN)); // consumed

        unsafe { libc::raise(RECONFIGURE_SIGNAL) };
        assert!(take(&RECONFIGURE));
        assert_eq!(take_last_signal(), RECONFIGURE_SIGNAL);

        unsafe { libc::raise(NOACCEPT_SIGNAL) };
        assert!(take(&NOACCEPT));

        unsafe { libc::raise(libc::SIGCHLD) };
        assert!(take(&REAP));

        // Workers ignore reconfigure and noaccept
        set_role(Role::Worker);
        unsafe { libc::raise(RECONFIGURE_SIGNAL) };
        assert!(!take(&RECONFIGURE));
        unsafe { libc::raise(NOACCEPT_SIGNAL) };
        assert!(!take(&NOACCEPT));

        unsafe { libc::raise(REOPEN_SIGNAL) };
        assert!(take(&REOPEN));

        // A test process always has a parent shell, so CHANGEBIN must be
        // treated as stale and ignored
        set_role(Role::Master);
        unsafe { libc::raise(CHANGEBIN_SIGNAL) };
        assert!(!take(&CHANGE_BINARY));

        // SIGPIPE is ignored rather than fatal
        unsafe { libc::raise(libc::SIGPIPE) };

        set_role(Role::Single);
    }

    #[test]
    fn test_alarm_arming() {
        // Arming and immediately disarming must not error
        arm_alarm(50).unwrap();
        arm_alarm(0).unwrap(); // 0 disarms
    }
}
