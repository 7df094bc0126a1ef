// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The host client library: register a name with the broker, maintain the
// relay channel with periodic keepalives, and accept relayed peer
// connections into a bounded local queue. This is the library a host
// application links against — it never touches the broker's own roster
// or handshake arrays, only its own two sockets and its own queue.

use std::collections::VecDeque;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::error::{BrokerError, Result};
use crate::fdpass;
use crate::roster::HostName;
use crate::timebase::{Timebase, Timestamp};
use crate::wire;

/// A single entry in the caller-handshake queue: a connected socket half
/// the broker has already delivered, plus when it was enqueued so the
/// host application can age out entries it never claims.
pub struct CallerHandshake {
    pub sock: UnixStream,
    pub enqueued_at: Timestamp,
}

/// A registered host's live connection to the broker: the original
/// registration socket (carries keepalives and `'R'` request tokens) and
/// the relay socket (carries freshly created peer-facing sockets).
pub struct HostHandle {
    name: HostName,
    broker_sock: UnixStream,
    relay_sock: UnixStream,
    caller_queue: VecDeque<CallerHandshake>,
    caller_cap: usize,
    last_keepalive: Timestamp,
    keepalive_interval_ms: u64,
    accept_batch: usize,
    tb: Timebase,
}

impl HostHandle {
    pub fn name(&self) -> &HostName {
        &self.name
    }

    /// Register `name` with the broker listening at `reg_path`. Connects,
    /// sends the name, waits up to `cfg.reg_timeout_ms` for the relayed
    /// socket, then sends the initial keepalive byte. Any failed step
    /// closes the socket and returns an error.
    pub fn register(reg_path: impl AsRef<Path>, name: &str, cfg: &Config) -> Result<Self> {
        let name = HostName::new(name)?;
        let mut broker_sock = UnixStream::connect(reg_path.as_ref()).map_err(BrokerError::Io)?;
        broker_sock.set_nonblocking(false).map_err(BrokerError::Io)?;

        if wire::send_name_blocking(&mut broker_sock, &name).is_err() {
            return Err(BrokerError::Rejected("registration send failed".into()));
        }

        broker_sock
            .set_nonblocking(true)
            .map_err(BrokerError::Io)?;
        let tb = Timebase::new();
        let deadline = tb.now();
        let relay_fd = loop {
            match fdpass::try_recv_fd(&broker_sock) {
                Ok(Some(fd)) => break fd,
                Ok(None) => {
                    if tb.elapsed_since(deadline, cfg.reg_timeout_ms) {
                        return Err(BrokerError::TimedOut("registration relay fd".into()));
                    }
                    std::thread::sleep(Duration::from_millis(cfg.connect_poll_interval_ms));
                }
                Err(e) => return Err(e),
            }
        };
        let mut relay_sock: UnixStream = relay_fd.into();
        relay_sock.set_nonblocking(true).map_err(BrokerError::Io)?;

        if wire::send_byte_blocking(&mut broker_sock, wire::KEEPALIVE).is_err() {
            return Err(BrokerError::Rejected("initial keepalive failed".into()));
        }

        let now = tb.now();
        Ok(Self {
            name,
            broker_sock,
            relay_sock,
            caller_queue: VecDeque::new(),
            caller_cap: cfg.caller_handshake_cap,
            last_keepalive: now,
            keepalive_interval_ms: cfg.keepalive_interval_ms,
            accept_batch: cfg.host_accept_batch,
            tb,
        })
    }

    /// Non-blocking: send a keepalive if due, then drain up to
    /// `accept_batch` single-byte reads from the broker socket. Each
    /// `'R'` byte creates a fresh socket pair, relays one half to the
    /// waiting worker, and enqueues the other half locally.
    pub fn accept(&mut self) -> Result<()> {
        if self.tb.elapsed_since(self.last_keepalive, self.keepalive_interval_ms) {
            wire::send_byte_blocking(&mut self.broker_sock, wire::KEEPALIVE)
                .map_err(|_| BrokerError::PeerGone("broker lost".into()))?;
            self.last_keepalive = self.tb.now();
        }

        for _ in 0..self.accept_batch {
            match wire::try_read_byte(&mut self.broker_sock) {
                Ok(Some(wire::REQUEST)) => self.handle_request_token()?,
                Ok(Some(_other)) => {
                    log::debug!("host {:?}: ignoring unrecognized byte", self.name.as_str());
                }
                Ok(None) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn handle_request_token(&mut self) -> Result<()> {
        if self.caller_queue.len() >= self.caller_cap {
            log::warn!(
                "host {:?}: caller-handshake queue full, dropping request token",
                self.name.as_str()
            );
            return Ok(());
        }
        let (ours, theirs) = UnixStream::pair().map_err(BrokerError::Io)?;
        ours.set_nonblocking(true).map_err(BrokerError::Io)?;
        theirs.set_nonblocking(true).map_err(BrokerError::Io)?;

        if fdpass::send_fd(&self.relay_sock, std::os::fd::AsFd::as_fd(&ours)).is_err() {
            return Err(BrokerError::PeerGone("relay send failed".into()));
        }
        self.caller_queue.push_back(CallerHandshake {
            sock: theirs,
            enqueued_at: self.tb.now(),
        });
        Ok(())
    }

    /// Pop the front of the caller-handshake queue. `None` when empty —
    /// the host application's EAGAIN.
    pub fn handshake(&mut self) -> Option<UnixStream> {
        self.caller_queue.pop_front().map(|entry| entry.sock)
    }

    /// Close the broker socket, the relay socket, and every still-queued
    /// caller socket, in that order.
    pub fn destroy(mut self) {
        drop(self.broker_sock);
        drop(self.relay_sock);
        self.caller_queue.clear();
    }
}
