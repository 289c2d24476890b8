/*!
 * epoll readiness backend (Linux)
 *
 * Interest per fd is one kernel mask: registering the second direction or
 * removing one of two is a MOD that carries the surviving direction's bit.
 * Error and hangup conditions are folded into both directions so a handler
 * always runs and observes the failure on its next read or write.
 */

use std::io;
use std::os::unix::io::RawFd;

use log::debug;

use crate::conn::EventKind;
use crate::event::{EngineFlags, EventEngine, Readiness};

pub struct EpollEngine {
    ep: RawFd,
    events: Vec<libc::epoll_event>,
}

impl EpollEngine {
    pub fn new(batch: usize) -> io::Result<Self> {
        let ep = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ep == -1 {
            return Err(io::Error::last_os_error());
        }
        let batch = batch.max(1);
        Ok(Self {
            ep,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; batch],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, tag: u64) -> io::Result<()> {
        let mut ee = libc::epoll_event { events, u64: tag };
        let rc = unsafe { libc::epoll_ctl(self.ep, op, fd, &mut ee) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

const READ_MASK: u32 = (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32;
const WRITE_MASK: u32 = (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) as u32;

impl EventEngine for EpollEngine {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn flags(&self) -> EngineFlags {
        EngineFlags {
            edge_triggered: true,
            greedy_accept: true,
        }
    }

    fn add_event(
        &mut self,
        fd: RawFd,
        kind: EventKind,
        other_active: bool,
        tag: u64,
        edge: bool,
    ) -> io::Result<()> {
        let (this, other) = match kind {
            EventKind::Read => (libc::EPOLLIN as u32, libc::EPOLLOUT as u32),
            EventKind::Write => (libc::EPOLLOUT as u32, libc::EPOLLIN as u32),
        };

        let (op, mut events) = if other_active {
            (libc::EPOLL_CTL_MOD, this | other)
        } else {
            (libc::EPOLL_CTL_ADD, this)
        };
        if edge {
            events |= libc::EPOLLET as u32;
        }

        debug!("epoll add event: fd:{} op:{} ev:{:08x}", fd, op, events);
        self.ctl(op, fd, events, tag)
    }

    fn del_event(
        &mut self,
        fd: RawFd,
        kind: EventKind,
        other_active: bool,
        tag: u64,
        closing: bool,
    ) -> io::Result<()> {
        // A closed fd leaves the interest set by itself; no syscall needed
        if closing {
            return Ok(());
        }

        let other = match kind {
            EventKind::Read => libc::EPOLLOUT as u32,
            EventKind::Write => libc::EPOLLIN as u32,
        };

        if other_active {
            // Both directions only ever coexist on edge-triggered
            // connections, so the surviving mask keeps EPOLLET
            let events = other | libc::EPOLLET as u32;
            debug!("epoll del event: fd:{} mod ev:{:08x}", fd, events);
            self.ctl(libc::EPOLL_CTL_MOD, fd, events, tag)
        } else {
            debug!("epoll del event: fd:{} del", fd);
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
        }
    }

    fn add_connection(&mut self, fd: RawFd, tag: u64) -> io::Result<()> {
        let events = (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32;
        debug!("epoll add connection: fd:{} ev:{:08x}", fd, events);
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, tag)
    }

    fn del_connection(&mut self, fd: RawFd, closing: bool) -> io::Result<()> {
        if closing {
            return Ok(());
        }
        debug!("epoll del connection: fd:{}", fd);
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    fn wait(&mut self, timeout_ms: Option<u64>, out: &mut Vec<Readiness>) -> io::Result<usize> {
        out.clear();

        let timeout: libc::c_int = match timeout_ms {
            None => -1,
            Some(ms) => ms.min(i32::MAX as u64) as libc::c_int,
        };

        let n = unsafe {
            libc::epoll_wait(
                self.ep,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout,
            )
        };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }

        for ev in &self.events[..n as usize] {
            let events = ev.events;
            let tag = ev.u64;
            let (slot, instance) = crate::conn::decode_tag(tag);
            out.push(Readiness {
                slot,
                instance,
                readable: events & READ_MASK != 0,
                writable: events & WRITE_MASK != 0,
                error: events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
            });
        }

        Ok(n as usize)
    }

    fn done(&mut self) -> io::Result<()> {
        if self.ep != -1 {
            let rc = unsafe { libc::close(self.ep) };
            self.ep = -1;
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

impl Drop for EpollEngine {
    fn drop(&mut self) {
        let _ = self.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::encode_tag;
    use std::os::unix::io::AsRawFd;

    fn pipe() -> (std::fs::File, std::fs::File) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        use std::os::unix::io::FromRawFd;
        unsafe {
            (
                std::fs::File::from_raw_fd(fds[0]),
                std::fs::File::from_raw_fd(fds[1]),
            )
        }
    }

    #[test]
    fn test_level_triggered_read() {
        let mut engine = EpollEngine::new(16).unwrap();
        let (r, w) = pipe();

        let tag = encode_tag(3, 1);
        engine
            .add_event(r.as_raw_fd(), EventKind::Read, false, tag, false)
            .unwrap();

        let mut out = Vec::new();
        // Nothing written yet: the wait times out empty
        assert_eq!(engine.wait(Some(0), &mut out).unwrap(), 0);

        unsafe {
            libc::write(w.as_raw_fd(), b"x".as_ptr().cast(), 1);
        }

        assert_eq!(engine.wait(Some(100), &mut out).unwrap(), 1);
        assert_eq!(out[0].slot, 3);
        assert_eq!(out[0].instance, 1);
        assert!(out[0].readable);

        // Level-triggered: still reported while un-drained
        assert_eq!(engine.wait(Some(0), &mut out).unwrap(), 1);
    }

    #[test]
    fn test_del_event_stops_reporting() {
        let mut engine = EpollEngine::new(16).unwrap();
        let (r, w) = pipe();

        let tag = encode_tag(0, 0);
        engine
            .add_event(r.as_raw_fd(), EventKind::Read, false, tag, false)
            .unwrap();
        unsafe {
            libc::write(w.as_raw_fd(), b"x".as_ptr().cast(), 1);
        }

        engine
            .del_event(r.as_raw_fd(), EventKind::Read, false, tag, false)
            .unwrap();

        let mut out = Vec::new();
        assert_eq!(engine.wait(Some(0), &mut out).unwrap(), 0);
    }

    #[test]
    fn test_mod_preserves_opposite_direction() {
        let mut engine = EpollEngine::new(16).unwrap();

        // A socketpair is writable from the start
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);

        let tag = encode_tag(7, 2);
        engine
            .add_event(fds[0], EventKind::Write, false, tag, false)
            .unwrap();
        // Second direction: must be a MOD keeping writability
        engine
            .add_event(fds[0], EventKind::Read, true, tag, false)
            .unwrap();

        let mut out = Vec::new();
        assert_eq!(engine.wait(Some(100), &mut out).unwrap(), 1);
        assert!(out[0].writable);
        assert!(!out[0].readable);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_flags() {
        let engine = EpollEngine::new(1).unwrap();
        assert!(engine.flags().edge_triggered);
        assert!(engine.flags().greedy_accept);
        assert_eq!(engine.name(), "epoll");
    }
}
