//! Opening the public listeners and the local worker channel.

use crate::error::{BrokerError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixListener;
use std::path::Path;
use tracing::{debug, warn};

/// Upper bound on public listening sockets across all addresses.
pub const MAX_LISTEN_SOCKETS: usize = 64;

const LISTEN_BACKLOG: i32 = 1024;

/// One entry of the `listen_addresses` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `*`: every local interface, IPv4 and IPv6.
    Any,
    /// A host name or literal address.
    Host(String),
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Host(host) => write!(f, "{}", host),
        }
    }
}

/// Split a comma-separated address list.
///
/// Whitespace around entries is ignored and an entry may be double-quoted
/// (a doubled `""` inside quotes is a literal quote). Empty entries, a
/// trailing comma, or an unterminated quote are syntax errors. An empty or
/// all-blank string is an empty list.
pub fn parse_listen_addresses(list: &str) -> Result<Vec<ListenAddr>> {
    let invalid = |why: &str| BrokerError::InvalidListenAddresses(why.to_string());
    let mut entries = Vec::new();
    let mut chars = list.chars().peekable();

    let skip_ws = |chars: &mut std::iter::Peekable<std::str::Chars<'_>>| {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
    };

    skip_ws(&mut chars);
    if chars.peek().is_none() {
        return Ok(entries);
    }

    loop {
        let mut entry = String::new();
        if chars.next_if_eq(&'"').is_some() {
            loop {
                match chars.next() {
                    Some('"') if chars.next_if_eq(&'"').is_some() => entry.push('"'),
                    Some('"') => break,
                    Some(c) => entry.push(c),
                    None => return Err(invalid("unterminated quoted entry")),
                }
            }
            if entry.is_empty() {
                return Err(invalid("empty quoted entry"));
            }
            skip_ws(&mut chars);
            entries.push(ListenAddr::Host(entry));
        } else {
            while let Some(c) = chars.next_if(|&c| c != ',' && !c.is_whitespace()) {
                entry.push(c);
            }
            if entry.is_empty() {
                return Err(invalid("empty entry"));
            }
            skip_ws(&mut chars);
            entries.push(if entry == "*" {
                ListenAddr::Any
            } else {
                ListenAddr::Host(entry)
            });
        }

        match chars.next() {
            None => return Ok(entries),
            Some(',') => skip_ws(&mut chars),
            Some(c) => return Err(invalid(&format!("unexpected character '{}'", c))),
        }
    }
}

/// Resolve one entry to the socket addresses it should bind.
fn resolve(addr: &ListenAddr, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    match addr {
        ListenAddr::Any => Ok(vec![
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        ]),
        ListenAddr::Host(host) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            Ok((host, port).to_socket_addrs()?.collect())
        }
    }
}

/// Bind and listen on one address, non-blocking.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        // Keep [::] from also claiming the IPv4 wildcard.
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Open every public listener named by `list`.
///
/// An entry counts as usable when at least one of its resolved addresses
/// binds. Failures of single entries are logged; ending up with no sockets
/// at all is fatal.
pub fn open_public_listeners(list: &str, port: u16) -> Result<Vec<TcpListener>> {
    let addrs = parse_listen_addresses(list)?;
    let mut listeners = Vec::new();

    for addr in &addrs {
        let mut opened = 0;
        match resolve(addr, port) {
            Ok(resolved) => {
                for sock_addr in resolved {
                    if listeners.len() >= MAX_LISTEN_SOCKETS {
                        warn!(address = %sock_addr, "too many listen sockets, skipping");
                        break;
                    }
                    match bind_listener(sock_addr) {
                        Ok(listener) => {
                            debug!(address = %sock_addr, "listening");
                            listeners.push(listener);
                            opened += 1;
                        }
                        Err(e) => {
                            warn!(address = %sock_addr, error = %e, "could not bind listen socket")
                        }
                    }
                }
            }
            Err(e) => warn!(address = %addr, error = %e, "could not resolve listen address"),
        }
        if opened == 0 {
            warn!("could not create listen socket for \"{}\"", addr);
        }
    }

    if listeners.is_empty() {
        return Err(BrokerError::NoListenSockets);
    }
    Ok(listeners)
}

/// Create the local worker channel at `path`, non-blocking.
///
/// A stale socket file left by a previous run is replaced; any other file at
/// that path is left alone and reported as an error.
pub fn open_ipc_listener(path: &Path) -> Result<UnixListener> {
    let ipc_err = |source| BrokerError::IpcSocket {
        path: path.to_path_buf(),
        source,
    };

    if let Ok(meta) = std::fs::symlink_metadata(path)
        && meta.file_type().is_socket()
    {
        std::fs::remove_file(path).map_err(ipc_err)?;
    }

    let listener = UnixListener::bind(path).map_err(ipc_err)?;
    listener.set_nonblocking(true).map_err(ipc_err)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_simple_list() {
        assert_eq!(
            parse_listen_addresses("localhost, 127.0.0.1 ,*").unwrap(),
            vec![
                ListenAddr::Host("localhost".into()),
                ListenAddr::Host("127.0.0.1".into()),
                ListenAddr::Any,
            ]
        );
    }

    #[test]
    fn test_parse_empty_list() {
        assert!(parse_listen_addresses("").unwrap().is_empty());
        assert!(parse_listen_addresses("   ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_quoted_entries() {
        assert_eq!(
            parse_listen_addresses(r#""::1", "a""b""#).unwrap(),
            vec![
                ListenAddr::Host("::1".into()),
                ListenAddr::Host("a\"b".into()),
            ]
        );
        // A quoted star is a host literal, not the wildcard.
        assert_eq!(
            parse_listen_addresses(r#""*""#).unwrap(),
            vec![ListenAddr::Host("*".into())]
        );
    }

    #[test]
    fn test_parse_syntax_errors() {
        for bad in ["a,,b", "a,", ",a", "\"open", "a b", "\"\""] {
            assert!(
                matches!(
                    parse_listen_addresses(bad),
                    Err(BrokerError::InvalidListenAddresses(_))
                ),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_open_loopback_listener() {
        let listeners = open_public_listeners("127.0.0.1", 0).unwrap();
        assert_eq!(listeners.len(), 1);
        assert!(listeners[0].local_addr().unwrap().ip().is_loopback());
    }

    #[test]
    fn test_unresolvable_only_address_is_fatal() {
        let err = open_public_listeners("no-such-host.invalid", 0).unwrap_err();
        assert!(matches!(err, BrokerError::NoListenSockets));
    }

    #[test]
    fn test_one_good_address_is_enough() {
        let listeners = open_public_listeners("no-such-host.invalid,127.0.0.1", 0).unwrap();
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn test_empty_list_has_no_sockets() {
        assert!(matches!(
            open_public_listeners("", 0),
            Err(BrokerError::NoListenSockets)
        ));
    }

    #[test]
    fn test_ipc_listener_replaces_stale_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".s.rustica.1");
        let first = open_ipc_listener(&path).unwrap();
        drop(first);
        assert!(path.exists());
        open_ipc_listener(&path).unwrap();
    }

    #[test]
    fn test_ipc_listener_in_missing_dir_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join(".s.rustica.1");
        assert!(matches!(
            open_ipc_listener(&path),
            Err(BrokerError::IpcSocket { .. })
        ));
    }

    #[test]
    fn test_ipc_listener_keeps_regular_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".s.rustica.1");
        std::fs::write(&path, b"not a socket").unwrap();
        assert!(open_ipc_listener(&path).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"not a socket");
    }
}
