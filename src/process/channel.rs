/*!
 * Master/worker channel
 *
 * Fixed-size control records over the socketpair each child inherits.
 * OPEN_CHANNEL carries a peer's channel fd as SCM_RIGHTS ancillary data so
 * the number arriving in the child is the kernel's copy, not the sender's.
 */

use std::io;
use std::mem::{self, MaybeUninit};
use std::os::unix::io::RawFd;
use std::ptr;

pub const CMD_OPEN_CHANNEL: u32 = 1;
pub const CMD_CLOSE_CHANNEL: u32 = 2;
pub const CMD_QUIT: u32 = 3;
pub const CMD_TERMINATE: u32 = 4;
pub const CMD_REOPEN: u32 = 5;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMsg {
    pub command: u32,
    pub pid: libc::pid_t,
    pub slot: i32,
    /// Passed as ancillary data when the command opens a channel, -1
    /// otherwise
    pub fd: RawFd,
}

impl ChannelMsg {
    pub fn new(command: u32) -> Self {
        Self {
            command,
            pid: -1,
            slot: -1,
            fd: -1,
        }
    }
}

const MSG_SIZE: usize = mem::size_of::<ChannelMsg>();

/// Send one record; the fd rides along as SCM_RIGHTS when present
pub fn write_channel(channel: RawFd, msg: &ChannelMsg) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: (msg as *const ChannelMsg as *mut ChannelMsg).cast(),
        iov_len: MSG_SIZE,
    };

    let mut cmsg_buf = [0u8; 64];
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;

    if msg.fd != -1 {
        let fd_len = mem::size_of::<RawFd>() as libc::c_uint;
        hdr.msg_control = cmsg_buf.as_mut_ptr().cast();
        hdr.msg_controllen = unsafe { libc::CMSG_SPACE(fd_len) } as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&hdr);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_len) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), msg.fd);
        }
    }

    let n = unsafe { libc::sendmsg(channel, &hdr, 0) };
    if n == -1 {
        return Err(io::Error::last_os_error());
    }
    if n as usize != MSG_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "partial channel write",
        ));
    }
    Ok(())
}

/// Receive one record. None when the socket has nothing queued (EAGAIN or
/// an interrupted read); EOF is an error, the peer is gone.
pub fn read_channel(channel: RawFd) -> io::Result<Option<ChannelMsg>> {
    let mut buf = MaybeUninit::<ChannelMsg>::uninit();
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: MSG_SIZE,
    };

    let mut cmsg_buf = [0u8; 64];
    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = cmsg_buf.as_mut_ptr().cast();
    hdr.msg_controllen = mem::size_of_val(&cmsg_buf) as _;

    let n = unsafe { libc::recvmsg(channel, &mut hdr, 0) };
    if n == -1 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err),
        };
    }
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "channel closed by peer",
        ));
    }
    if n as usize != MSG_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated channel message",
        ));
    }

    let mut msg = unsafe { buf.assume_init() };

    if msg.command == CMD_OPEN_CHANNEL {
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&hdr) };
        if cmsg.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "open-channel message without ancillary fd",
            ));
        }
        let (level, ctype) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type) };
        if level != libc::SOL_SOCKET || ctype != libc::SCM_RIGHTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected ancillary data on channel",
            ));
        }
        msg.fd = unsafe { ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>()) };
    } else {
        msg.fd = -1;
    }

    Ok(Some(msg))
}

/// Close both endpoints of a channel pair
pub fn close_channel(pair: [RawFd; 2]) {
    unsafe {
        if pair[0] != -1 {
            libc::close(pair[0]);
        }
        if pair[1] != -1 {
            libc::close(pair[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::set_nonblocking;

    fn test_pair() -> [RawFd; 2] {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        set_nonblocking(fds[0]).unwrap();
        set_nonblocking(fds[1]).unwrap();
        fds
    }

    #[test]
    fn test_round_trip_without_fd() {
        let pair = test_pair();

        let msg = ChannelMsg {
            command: CMD_QUIT,
            pid: 1234,
            slot: 2,
            fd: -1,
        };
        write_channel(pair[0], &msg).unwrap();

        let got = read_channel(pair[1]).unwrap().unwrap();
        assert_eq!(got, msg);

        close_channel(pair);
    }

    #[test]
    fn test_fd_passing() {
        let pair = test_pair();
        let extra = test_pair(); // any fd will do as cargo

        let msg = ChannelMsg {
            command: CMD_OPEN_CHANNEL,
            pid: 42,
            slot: 1,
            fd: extra[0],
        };
        write_channel(pair[0], &msg).unwrap();

        let got = read_channel(pair[1]).unwrap().unwrap();
        assert_eq!(got.command, CMD_OPEN_CHANNEL);
        assert_eq!(got.pid, 42);
        assert_eq!(got.slot, 1);
        // The kernel installed its own copy: a live fd, generally a new number
        assert!(got.fd >= 0);
        let rc = unsafe { libc::fcntl(got.fd, libc::F_GETFD) };
        assert_ne!(rc, -1);

        unsafe { libc::close(got.fd) };
        close_channel(pair);
        close_channel(extra);
    }

    #[test]
    fn test_empty_channel_returns_none() {
        let pair = test_pair();
        assert!(read_channel(pair[1]).unwrap().is_none());
        close_channel(pair);
    }

    #[test]
    fn test_eof_is_an_error() {
        let pair = test_pair();
        unsafe { libc::close(pair[0]) };

        let err = read_channel(pair[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        unsafe { libc::close(pair[1]) };
    }

    #[test]
    fn test_non_open_commands_never_carry_a_stray_fd() {
        let pair = test_pair();

        // Sender claims an fd on a REOPEN message; the fd still travels as
        // ancillary data but the receiver must not trust the field for
        // non-open commands
        let extra = test_pair();
        let msg = ChannelMsg {
            command: CMD_REOPEN,
            pid: 7,
            slot: 0,
            fd: extra[0],
        };
        write_channel(pair[0], &msg).unwrap();
        let got = read_channel(pair[1]).unwrap().unwrap();
        assert_eq!(got.fd, -1);

        close_channel(pair);
        close_channel(extra);
    }
}
