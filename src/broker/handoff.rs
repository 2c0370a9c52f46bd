//! Passing accepted client connections to workers over the local channel.
//!
//! Each hand-off is a single marker byte carrying the connection's descriptor
//! in an `SCM_RIGHTS` control message.

use crate::error::{BrokerError, Result};
use nix::errno::Errno;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Data byte accompanying every passed descriptor.
const HANDOFF_MARKER: u8 = b'C';

/// Send `conn`'s descriptor to the worker at the other end of `channel`.
///
/// The caller still owns `conn` and should close its copy afterwards.
pub fn send_connection(channel: &UnixStream, conn: &impl AsRawFd) -> Result<()> {
    let fds = [conn.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&[HANDOFF_MARKER])];

    loop {
        match sendmsg::<()>(
            channel.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT,
            None,
        ) {
            Ok(1) => return Ok(()),
            Ok(n) => {
                return Err(BrokerError::Handoff(format!(
                    "sent {} bytes instead of 1",
                    n
                )));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(BrokerError::Handoff(e.to_string())),
        }
    }
}

/// Receive one passed descriptor from `channel`, blocking per the socket's
/// mode and read timeout.
///
/// Returns `Ok(None)` when the broker closed the channel.
pub fn recv_connection(channel: &UnixStream) -> Result<Option<OwnedFd>> {
    let mut byte = [0u8; 1];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    let (bytes, fd) = loop {
        let mut iov = [IoSliceMut::new(&mut byte)];
        match recvmsg::<()>(
            channel.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => {
                let mut passed = None;
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        passed = fds.first().copied();
                    }
                }
                break (msg.bytes, passed);
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock).into());
            }
            Err(e) => return Err(BrokerError::Handoff(e.to_string())),
        }
    };

    match (bytes, fd) {
        // Safety: the kernel installed this descriptor for us; nothing else owns it.
        (_, Some(fd)) => Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) })),
        (0, None) => Ok(None),
        (_, None) => Err(BrokerError::Handoff(
            "hand-off message carried no descriptor".into(),
        )),
    }
}
