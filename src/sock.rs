// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Listening-endpoint factory: bind a filesystem-named UNIX stream socket,
// set it non-blocking, and accept connections in batches without ever
// blocking the caller.

use std::fs;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

use crate::error::{BrokerError, Result};

/// A bound, non-blocking UNIX listening socket plus the credentials
/// queried from each accepted connection.
pub struct Endpoint {
    listener: UnixListener,
}

/// Kernel-supplied peer credentials for an accepted connection, captured at
/// accept time (the only authentication the broker performs — see the
/// non-goals on authentication).
#[derive(Debug, Clone, Copy)]
pub struct PeerCreds {
    pub uid: u32,
    pub pid: i32,
}

impl Endpoint {
    /// Bind a listening socket at `path`. An existing stale socket file at
    /// `path` is removed first — the broker owns this path exclusively and
    /// a leftover file from a prior crashed instance must not block bind.
    pub fn bind(path: impl AsRef<Path>, backlog: i32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(BrokerError::Io)?;
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BrokerError::Fatal(format!("clearing stale socket: {e}"))),
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| BrokerError::Fatal(format!("bind {}: {e}", path.display())))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| BrokerError::Fatal(format!("set_nonblocking: {e}")))?;
        let _ = backlog; // std's UnixListener::bind uses a fixed internal backlog
        Ok(Self { listener })
    }

    /// Accept up to `max` pending connections without blocking. Stops early
    /// when the accept queue is drained (WouldBlock).
    pub fn accept_batch(&self, max: usize) -> Vec<UnixStream> {
        let mut out = Vec::new();
        for _ in 0..max {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    out.push(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        out
    }
}

/// Query peer credentials (uid, pid) on a connected UNIX stream socket via
/// `SO_PEERCRED`, the kernel-level authentication the broker relies on.
pub fn peer_credentials(sock: &impl AsFd) -> Result<PeerCreds> {
    let creds = getsockopt(sock, PeerCredentials)
        .map_err(|e| BrokerError::Rejected(format!("getsockopt(SO_PEERCRED): {e}")))?;
    Ok(PeerCreds {
        uid: creds.uid(),
        pid: creds.pid(),
    })
}

/// Convert a std socket into an [`OwnedFd`] for use with the FD-passing and
/// shmpair primitives, which operate on raw/owned descriptors rather than
/// the std socket types.
pub fn into_owned_fd(sock: UnixStream) -> OwnedFd {
    sock.into()
}
