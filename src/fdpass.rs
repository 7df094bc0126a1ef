// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// File descriptor passing over connected UNIX stream sockets via SCM_RIGHTS
// ancillary data. This is the only permitted cross-process descriptor
// transfer mechanism in the broker: every relay, every accepted peer
// socket, and every shmpair memfd crosses a process boundary through one
// of the two functions below.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoSlice;

use crate::error::{BrokerError, Result};

/// One opaque payload byte accompanies every FD message; neither side
/// currently inspects its value, but a zero-length message is rejected by
/// some kernels alongside `SCM_RIGHTS`, so a single byte is always sent.
const PAYLOAD: [u8; 1] = [0u8];

/// Send exactly one file descriptor across `sock`, which must be a
/// connected stream socket. The caller retains ownership of `fd`: on
/// success the kernel has duplicated the descriptor into the peer's
/// process, and the caller is expected to close its own copy afterward
/// per the broker's move-semantics for FDs (see spec data model: FD
/// passing is a move, not a copy).
pub fn send_fd(sock: &impl AsRawFd, fd: BorrowedFd<'_>) -> Result<()> {
    let iov = [IoSlice::new(&PAYLOAD)];
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    loop {
        match sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::EAGAIN) => {
                return Err(BrokerError::Io(std::io::Error::from(
                    std::io::ErrorKind::WouldBlock,
                )))
            }
            Err(e) => return Err(BrokerError::PeerGone(format!("sendmsg fd: {e}"))),
        }
    }
}

/// Attempt to receive exactly one file descriptor from `sock`. Returns
/// `Ok(None)` when the non-blocking read would block (caller should
/// retry/back off); `Ok(Some(fd))` on success; `Err` on EOF, malformed
/// ancillary data, or any other transport failure.
pub fn try_recv_fd(sock: &impl AsRawFd) -> Result<Option<OwnedFd>> {
    let mut buf = [0u8; 1];
    let mut iov = [std::io::IoSliceMut::new(&mut buf)];
    let mut cmsg_buf = nix::cmsg_space!(RawFd);
    loop {
        match recvmsg::<()>(
            sock.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        ) {
            Ok(msg) => {
                if msg.bytes == 0 {
                    return Err(BrokerError::PeerGone("eof while receiving fd".into()));
                }
                let mut received: Option<OwnedFd> = None;
                for cmsg in msg.cmsgs().map_err(|e| {
                    BrokerError::Rejected(format!("malformed ancillary data: {e}"))
                })? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        if let Some(raw) = fds.into_iter().next() {
                            // SAFETY: `raw` was just handed to us by the kernel via
                            // SCM_RIGHTS and is not owned anywhere else yet.
                            received = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                        }
                    }
                }
                return match received {
                    Some(fd) => Ok(Some(fd)),
                    None => Err(BrokerError::Rejected(
                        "message carried no SCM_RIGHTS fd".into(),
                    )),
                };
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(BrokerError::PeerGone(format!("recvmsg fd: {e}"))),
        }
    }
}
