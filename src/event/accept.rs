/*!
 * Accept arbitration and the accept path
 *
 * One worker at a time owns the right to accept: a process-shared word in
 * anonymous shared memory, taken with a single compare-exchange. The
 * holder registers the listeners with its readiness engine, drains the
 * accept backlog synchronously, and gives the lock up before any deferred
 * handler runs.
 */

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::conn::{accept_disabled_after, EventKind};
use crate::event::EventLoop;

/// Per-connection scratch buffer size, carved from the cycle pool
pub const CLIENT_BUFFER_SIZE: usize = 4096;

/// Cross-worker accept lock
///
/// Lives in a `MAP_SHARED | MAP_ANONYMOUS` page created by the master
/// before forking, so every worker addresses the same word. The word holds
/// the owner's pid, or 0 when free.
#[derive(Clone, Copy)]
pub struct AcceptMutex {
    word: *mut AtomicU32,
}

// The pointed-to word is shared-memory atomic state; moving the pointer
// between threads is sound.
unsafe impl Send for AcceptMutex {}
unsafe impl Sync for AcceptMutex {}

impl AcceptMutex {
    pub fn new() -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                std::mem::size_of::<AtomicU32>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let word = ptr.cast::<AtomicU32>();
        unsafe { (*word).store(0, Ordering::Relaxed) };
        Ok(Self { word })
    }

    /// Non-blocking bid: true when this process now owns the lock
    pub fn try_lock(&self, pid: u32) -> bool {
        unsafe { &*self.word }
            .compare_exchange(0, pid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release if owned by `pid`; a stranger's unlock is a no-op
    pub fn unlock(&self, pid: u32) {
        let _ = unsafe { &*self.word }.compare_exchange(
            pid,
            0,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    /// Current owner pid, 0 when free
    pub fn holder(&self) -> u32 {
        unsafe { &*self.word }.load(Ordering::Relaxed)
    }
}

/// Read handler for accept-flagged cells. Runs synchronously while the
/// accept lock is held so the backlog drains before the lock moves on.
pub fn accept_handler(el: &mut EventLoop<'_>, slot: u32) {
    let lst_idx = match el.conns.conn(slot).listener {
        Some(i) => i,
        None => return,
    };
    let lfd = el.conns.conn(slot).fd;
    el.conns.read_cell_mut(slot).ready = false;

    let flags = el.engine.flags();
    let greedy = flags.edge_triggered || flags.greedy_accept;

    loop {
        let fd = unsafe {
            libc::accept4(
                lfd,
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd == -1 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => break,
                // The peer gave up while queued; try the next one
                Some(libc::ECONNABORTED) => continue,
                Some(libc::EMFILE) | Some(libc::ENFILE) => {
                    tracing::error!("accept4() failed, out of file descriptors: {}", err);
                    break;
                }
                _ => {
                    tracing::error!("accept4() failed: {}", err);
                    break;
                }
            }
        }

        let cslot = match el.conns.get(fd) {
            Some(s) => s,
            None => {
                tracing::warn!("worker_connections are not enough");
                unsafe {
                    libc::close(fd);
                }
                break;
            }
        };

        el.accept_disabled = accept_disabled_after(el.conns.total(), el.conns.free_count());
        el.conns.conn_mut(cslot).listener = Some(lst_idx);

        tracing::debug!(fd, slot = cslot, "accepted connection");

        let handler = el.cycle.listeners[lst_idx].handler;
        handler(el, cslot);

        if !greedy {
            break;
        }
    }
}

/// Default connection handler a listener attaches to fresh accepts: arm the
/// client deadline and wait for readability. A protocol module would hang
/// its own state machine here instead.
pub fn init_connection(el: &mut EventLoop<'_>, slot: u32) {
    el.conns.read_cell_mut(slot).handler = client_read_handler;

    let edge = el.engine.flags().edge_triggered;
    if let Err(e) = el.add_read_event(slot, edge) {
        tracing::error!(slot, "could not watch accepted connection: {}", e);
        el.close_connection(slot);
        return;
    }

    let timeout = el.cycle.config.client_timeout_ms;
    el.arm_timer(slot, EventKind::Read, timeout);
}

/// Drain-and-discard service: read until EAGAIN, close on EOF, peer error
/// or deadline
pub fn client_read_handler(el: &mut EventLoop<'_>, slot: u32) {
    if el.conns.read_cell(slot).timedout {
        tracing::debug!(slot, "client timed out");
        el.close_connection(slot);
        return;
    }

    let fd = el.conns.conn(slot).fd;

    let buf = match el.conns.conn(slot).buffer {
        Some(b) => b,
        None => {
            let b = el.cycle.pool.alloc(CLIENT_BUFFER_SIZE);
            el.conns.conn_mut(slot).buffer = Some(b);
            b
        }
    };

    loop {
        let n = unsafe { libc::read(fd, buf.as_ptr().cast(), CLIENT_BUFFER_SIZE) };

        if n == 0 {
            tracing::debug!(slot, "client closed connection");
            el.close_connection(slot);
            return;
        }

        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => {
                    tracing::debug!(slot, "client read error: {}", err);
                    el.close_connection(slot);
                    return;
                }
            }
        }
        // Payload is discarded; keep draining until EAGAIN so an
        // edge-triggered backend reports the fd again
    }

    el.conns.read_cell_mut(slot).ready = false;
    let timeout = el.cycle.config.client_timeout_ms;
    el.arm_timer(slot, EventKind::Read, timeout);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_lock_is_exclusive() {
        let m = AcceptMutex::new().unwrap();
        assert!(m.try_lock(100));
        assert!(!m.try_lock(200));
        assert_eq!(m.holder(), 100);

        m.unlock(100);
        assert_eq!(m.holder(), 0);
        assert!(m.try_lock(200));
    }

    #[test]
    fn test_strangers_unlock_is_a_noop() {
        let m = AcceptMutex::new().unwrap();
        assert!(m.try_lock(100));
        m.unlock(999);
        assert_eq!(m.holder(), 100);
        m.unlock(100);
    }

    #[test]
    fn test_at_most_one_holder_under_contention() {
        let m = Arc::new(AcceptMutex::new().unwrap());
        let acquired = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for id in 1..=8u32 {
            let m = Arc::clone(&m);
            let acquired = Arc::clone(&acquired);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    if m.try_lock(id) {
                        // While held, the word must report us and only us
                        assert_eq!(m.holder(), id);
                        acquired.fetch_add(1, Ordering::Relaxed);
                        m.unlock(id);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(m.holder(), 0);
        assert!(acquired.load(Ordering::Relaxed) > 0);
    }
}
