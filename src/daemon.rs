/*!
 * Daemonization
 *
 * Classic double-detach minus the second fork: fork so the shell gets its
 * prompt back, setsid to shed the controlling terminal, park stdin and
 * stdout on /dev/null. stderr is left alone so early startup failures are
 * still visible somewhere.
 */

use std::io;

use crate::error::{Result, ServerError};

pub fn daemonize() -> Result<()> {
    match unsafe { libc::fork() } {
        -1 => {
            return Err(ServerError::Other(format!(
                "fork() failed: {}",
                io::Error::last_os_error()
            )));
        }
        0 => {}
        _ => {
            // Parent's work is done
            std::process::exit(0);
        }
    }

    if unsafe { libc::setsid() } == -1 {
        return Err(ServerError::Other(format!(
            "setsid() failed: {}",
            io::Error::last_os_error()
        )));
    }

    unsafe {
        libc::umask(0);
    }

    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR) };
    if fd == -1 {
        return Err(ServerError::Other(format!(
            "open(\"/dev/null\") failed: {}",
            io::Error::last_os_error()
        )));
    }

    unsafe {
        if libc::dup2(fd, libc::STDIN_FILENO) == -1 {
            return Err(ServerError::Other(format!(
                "dup2(STDIN) failed: {}",
                io::Error::last_os_error()
            )));
        }
        if libc::dup2(fd, libc::STDOUT_FILENO) == -1 {
            return Err(ServerError::Other(format!(
                "dup2(STDOUT) failed: {}",
                io::Error::last_os_error()
            )));
        }
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }

    Ok(())
}
