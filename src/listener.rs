/*!
 * Listening sockets
 *
 * Bound, non-blocking listening fds plus the environment-variable handoff
 * that lets a freshly exec'd binary re-attach them during a hot upgrade.
 */

use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;

use crate::core::{Pool, PoolVec};
use crate::error::{Result, ServerError};
use crate::event::EventLoop;

/// Environment variable carrying listener fds across the upgrade exec
pub const INHERIT_ENV: &str = "PULSAR";

/// Handler attached to every connection accepted on a listener
pub type ConnHandler = for<'a, 'b> fn(&'a mut EventLoop<'b>, u32);

pub struct Listener {
    /// -1 after close
    pub fd: RawFd,
    pub addr: SocketAddr,
    pub backlog: i32,
    /// Came in through the handoff environment variable
    pub inherited: bool,
    pub handler: ConnHandler,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("fd", &self.fd)
            .field("addr", &self.addr)
            .field("backlog", &self.backlog)
            .field("inherited", &self.inherited)
            .finish()
    }
}

impl Listener {
    /// Bind and listen on `addr`
    pub fn open(addr: SocketAddr, backlog: i32, handler: ConnHandler) -> Result<Self> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };

        let fd = unsafe {
            libc::socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd == -1 {
            return Err(ServerError::Bind {
                addr,
                source: io::Error::last_os_error(),
            });
        }

        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&on as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == -1 {
            let source = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ServerError::Bind { addr, source });
        }

        let (storage, len) = sockaddr_from(&addr);
        let rc = unsafe { libc::bind(fd, (&storage as *const libc::sockaddr_storage).cast(), len) };
        if rc == -1 {
            let source = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ServerError::Bind { addr, source });
        }

        let rc = unsafe { libc::listen(fd, backlog) };
        if rc == -1 {
            let source = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ServerError::Bind { addr, source });
        }

        // Port 0 binds get their real port from the kernel
        let addr = local_addr(fd).unwrap_or(addr);

        Ok(Self {
            fd,
            addr,
            backlog,
            inherited: false,
            handler,
        })
    }

    /// Adopt an fd passed down by the previous binary
    pub fn from_inherited(fd: RawFd, handler: ConnHandler) -> Result<Self> {
        let addr = local_addr(fd).map_err(|e| {
            ServerError::Inherited(format!("getsockname() on fd {} failed: {}", fd, e))
        })?;

        set_nonblocking(fd)
            .map_err(|e| ServerError::Inherited(format!("fcntl() on fd {} failed: {}", fd, e)))?;

        Ok(Self {
            fd,
            addr,
            backlog: crate::config::DEFAULT_BACKLOG,
            inherited: true,
            handler,
        })
    }

    pub fn close(&mut self) {
        if self.fd != -1 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

/// Parse the handoff variable: ASCII decimal fds separated by `;` or `:`,
/// trailing separator required. A malformed entry stops parsing; the rest
/// of the variable is logged as ignored.
pub fn parse_inherited<'p>(pool: &'p Pool, value: &str) -> PoolVec<'p, RawFd> {
    let mut fds: PoolVec<'p, RawFd> = PoolVec::with_capacity(pool, 8);

    let bytes = value.as_bytes();
    let mut start = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b';' || b == b':' {
            match value[start..i].parse::<RawFd>() {
                Ok(fd) if fd >= 0 => fds.push(fd),
                _ => {
                    tracing::error!(
                        "invalid socket number \"{}\" in {} environment variable, \
                         ignoring the rest of the variable",
                        &value[start..],
                        INHERIT_ENV
                    );
                    break;
                }
            }
            start = i + 1;
        }
    }

    fds
}

/// Serialize listener fds for the upgrade exec: `<fd>;` per live listener
pub fn format_inherited(listeners: &[Listener]) -> String {
    let mut out = String::new();
    for l in listeners {
        if l.fd != -1 {
            out.push_str(&l.fd.to_string());
            out.push(';');
        }
    }
    out
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Socket's local address via getsockname
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            (&mut storage as *mut libc::sockaddr_storage).cast(),
            &mut len,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unsupported address family"))
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write((&mut storage as *mut libc::sockaddr_storage).cast(), sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                std::ptr::write((&mut storage as *mut libc::sockaddr_storage).cast(), sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin: &libc::sockaddr_in =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast() };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast() };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(
                IpAddr::V6(ip),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::accept::init_connection;

    #[test]
    fn test_open_and_close() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut l = Listener::open(addr, 16, init_connection).unwrap();
        assert!(l.fd >= 0);
        assert_ne!(l.addr.port(), 0);
        assert!(!l.inherited);

        // A client can actually connect
        let client = std::net::TcpStream::connect(l.addr).unwrap();
        drop(client);

        l.close();
        assert_eq!(l.fd, -1);
    }

    #[test]
    fn test_from_inherited_recovers_address() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut l = Listener::open(addr, 16, init_connection).unwrap();

        let mut adopted = Listener::from_inherited(l.fd, init_connection).unwrap();
        assert!(adopted.inherited);
        assert_eq!(adopted.addr, l.addr);

        adopted.close();
        l.fd = -1; // same fd, closed through `adopted`
    }

    #[test]
    fn test_inherited_round_trip() {
        let pool = Pool::create(1024);
        let fds = parse_inherited(&pool, "3;7;12;");
        assert_eq!(fds.as_slice(), &[3, 7, 12]);

        // Colon separators are accepted too
        let fds = parse_inherited(&pool, "3:7:12;");
        assert_eq!(fds.as_slice(), &[3, 7, 12]);
    }

    #[test]
    fn test_format_then_parse_is_identity() {
        let pool = Pool::create(1024);
        let listeners: Vec<Listener> = [4, 9, 21]
            .iter()
            .map(|&fd| Listener {
                fd,
                addr: "127.0.0.1:80".parse().unwrap(),
                backlog: 16,
                inherited: false,
                handler: init_connection,
            })
            .collect();

        let env = format_inherited(&listeners);
        assert_eq!(env, "4;9;21;");

        let fds = parse_inherited(&pool, &env);
        assert_eq!(fds.as_slice(), &[4, 9, 21]);
    }

    #[test]
    fn test_malformed_entry_stops_parsing() {
        let pool = Pool::create(1024);
        let fds = parse_inherited(&pool, "3;x;12;");
        assert_eq!(fds.as_slice(), &[3]);

        let fds = parse_inherited(&pool, "-2;5;");
        assert!(fds.is_empty());
    }

    #[test]
    fn test_missing_trailing_separator_drops_tail() {
        let pool = Pool::create(1024);
        let fds = parse_inherited(&pool, "3;7");
        assert_eq!(fds.as_slice(), &[3]);
    }

    #[test]
    fn test_closed_listeners_are_skipped_in_env() {
        let listeners = vec![Listener {
            fd: -1,
            addr: "127.0.0.1:80".parse().unwrap(),
            backlog: 16,
            inherited: false,
            handler: init_connection,
        }];
        assert_eq!(format_inherited(&listeners), "");
    }
}
