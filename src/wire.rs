// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Small wire-format helpers shared by the broker, host client, and peer
// connect paths: NUL-terminated name messages and single-byte tokens
// (`'K'` keepalive, `'R'` request, `'Q'` shutdown notice).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use crate::error::{BrokerError, Result};
use crate::roster::{HostName, MAX_HOST_NAME};

pub const KEEPALIVE: u8 = b'K';
pub const REQUEST: u8 = b'R';
pub const SHUTDOWN: u8 = b'Q';

/// Write a NUL-terminated name as a single message. Used by the host
/// client and peer connect paths, both of which perform this as a
/// blocking call immediately after connecting.
pub fn send_name_blocking(sock: &mut UnixStream, name: &HostName) -> Result<()> {
    let mut msg = Vec::with_capacity(name.as_str().len() + 1);
    msg.extend_from_slice(name.as_str().as_bytes());
    msg.push(0);
    sock.write_all(&msg).map_err(BrokerError::Io)
}

fn validate_name_bytes(buf: &[u8]) -> Result<HostName> {
    if buf.len() < 2 || buf[0] == 0 || buf[buf.len() - 1] != 0 {
        return Err(BrokerError::Rejected(
            "malformed name message (missing NUL terminator or empty)".into(),
        ));
    }
    let raw = std::str::from_utf8(&buf[..buf.len() - 1])
        .map_err(|_| BrokerError::Rejected("name message is not valid UTF-8".into()))?;
    HostName::new(raw)
}

/// Blocking single-call read of a name message, for use in the worker
/// process where blocking on the peer's first message is safe (the worker
/// owns nothing else and will be killed on timeout by the broker if the
/// peer never sends).
pub fn recv_name_blocking(sock: &mut UnixStream) -> Result<HostName> {
    let mut buf = [0u8; MAX_HOST_NAME + 2];
    let n = sock.read(&mut buf).map_err(BrokerError::Io)?;
    if n == 0 {
        return Err(BrokerError::PeerGone("eof reading name".into()));
    }
    validate_name_bytes(&buf[..n])
}

/// Non-blocking attempt at a single-message name read, for use in the
/// broker's registration-advance tick step. `Ok(None)` means "try again
/// next tick"; any framing violation is `Err(Rejected)` and drops the
/// slot.
pub fn try_recv_name(sock: &mut UnixStream) -> Result<Option<HostName>> {
    let mut buf = [0u8; MAX_HOST_NAME + 2];
    match sock.read(&mut buf) {
        Ok(0) => Err(BrokerError::PeerGone("eof reading name".into())),
        Ok(n) => validate_name_bytes(&buf[..n]).map(Some),
        Err(e) if BrokerError::is_transient(&e) => Ok(None),
        Err(e) => Err(BrokerError::Io(e)),
    }
}

/// Non-blocking attempt at a single-byte token read (`'K'`, `'R'`, or any
/// other application byte). `Ok(None)` on WouldBlock/EAGAIN.
pub fn try_read_byte(sock: &mut UnixStream) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match sock.read(&mut buf) {
        Ok(0) => Err(BrokerError::PeerGone("eof reading byte".into())),
        Ok(_) => Ok(Some(buf[0])),
        Err(e) if BrokerError::is_transient(&e) => Ok(None),
        Err(e) => Err(BrokerError::Io(e)),
    }
}

/// Blocking single-byte write. Used for the keepalive/request tokens,
/// which are always one byte and never partially written in practice on a
/// UNIX stream socket.
pub fn send_byte_blocking(sock: &mut UnixStream, byte: u8) -> Result<()> {
    sock.write_all(&[byte]).map_err(BrokerError::Io)
}

/// Best-effort non-blocking single-byte write, for the shutdown notice:
/// failures (including WouldBlock on a full send buffer) are ignored by
/// the caller, never escalated.
pub fn try_send_byte(sock: &mut UnixStream, byte: u8) -> Result<()> {
    match sock.write(&[byte]) {
        Ok(_) => Ok(()),
        Err(e) if BrokerError::is_transient(&e) => Ok(()),
        Err(e) => Err(BrokerError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrips_over_socketpair() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let name = HostName::new("echo_service").unwrap();
        send_name_blocking(&mut a, &name).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let got = try_recv_name(&mut b).unwrap().unwrap();
        assert_eq!(got.as_str(), "echo_service");
    }

    #[test]
    fn rejects_missing_nul_terminator() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        a.write_all(b"no-terminator").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(try_recv_name(&mut b).is_err());
    }

    #[test]
    fn byte_token_roundtrips() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        send_byte_blocking(&mut a, KEEPALIVE).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(try_read_byte(&mut b).unwrap(), Some(KEEPALIVE));
    }
}
