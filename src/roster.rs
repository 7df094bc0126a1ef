// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The host roster: the broker's authoritative record of every registered
// host. Owned exclusively by the broker's tick loop — nothing else
// mutates it (see the shared-resource policy in the concurrency model).

use std::collections::HashMap;
use std::os::unix::net::UnixStream;

use crate::error::{BrokerError, Result};
use crate::timebase::{Timebase, Timestamp};

/// Maximum byte length of a host name. The C original used a fixed 64-byte
/// field; this leaves headroom since a `String` has no ABI reason to match
/// that width.
pub const MAX_HOST_NAME: usize = 256;

/// A validated, bounded host name. Construction enforces the same
/// constraints the broker applies when it reads a name off the wire: 1 to
/// [`MAX_HOST_NAME`] bytes, no interior NUL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostName(String);

impl HostName {
    pub fn new(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.len() > MAX_HOST_NAME {
            return Err(BrokerError::Rejected(format!(
                "host name length {} out of bounds",
                raw.len()
            )));
        }
        if raw.as_bytes().contains(&0) {
            return Err(BrokerError::Rejected("host name contains NUL".into()));
        }
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A registered host: a name, its two sockets, ownership/liveness metadata.
pub struct Host {
    pub name: HostName,
    /// The socket the host registered with: carries `'K'` keepalives from
    /// the host and `'R'` request bytes from the broker.
    pub request_sock: UnixStream,
    /// The broker's half of the relay socketpair created at registration;
    /// the other half lives in the host process. Used to deliver freshly
    /// created peer-facing sockets from host to waiting worker.
    pub relay_sock: UnixStream,
    pub uid: u32,
    pub created_at: Timestamp,
    pub last_ack: Timestamp,
}

impl Host {
    /// A host is unconfirmed until its first keepalive byte is observed,
    /// at which point `last_ack` advances past `created_at`.
    pub fn is_confirmed(&self) -> bool {
        self.last_ack != self.created_at
    }
}

/// The live host roster, keyed by unique name.
#[derive(Default)]
pub struct Roster {
    hosts: HashMap<HostName, Host>,
}

impl Roster {
    pub fn new() -> Self {
        Self {
            hosts: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn contains(&self, name: &HostName) -> bool {
        self.hosts.contains_key(name)
    }

    pub fn get(&self, name: &HostName) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn get_mut(&mut self, name: &HostName) -> Option<&mut Host> {
        self.hosts.get_mut(name)
    }

    /// Number of hosts currently owned by `uid`. Used to enforce the
    /// per-user host quota at registration time.
    pub fn count_for_uid(&self, uid: u32) -> usize {
        self.hosts.values().filter(|h| h.uid == uid).count()
    }

    /// Insert a newly confirmed registration. Returns `Err` if a host with
    /// the same name is already present — callers must check
    /// [`Roster::contains`] first if they want to distinguish "duplicate"
    /// from other rejection reasons before doing the (expensive) relay
    /// setup, but this is the authoritative guard.
    pub fn insert(&mut self, host: Host) -> Result<()> {
        if self.hosts.contains_key(&host.name) {
            return Err(BrokerError::Rejected(format!(
                "duplicate host name {:?}",
                host.name.as_str()
            )));
        }
        self.hosts.insert(host.name.clone(), host);
        Ok(())
    }

    /// Remove and return a host by name, for the caller to close/drop.
    pub fn remove(&mut self, name: &HostName) -> Option<Host> {
        self.hosts.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HostName, &Host)> {
        self.hosts.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&HostName, &mut Host)> {
        self.hosts.iter_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &HostName> {
        self.hosts.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_names() {
        assert!(HostName::new("").is_err());
        let too_long = "a".repeat(MAX_HOST_NAME + 1);
        assert!(HostName::new(&too_long).is_err());
        assert!(HostName::new("echo_service").is_ok());
    }

    #[test]
    fn roster_enforces_unique_names() {
        let (a, b) = UnixStream::pair().unwrap();
        let (c, d) = UnixStream::pair().unwrap();
        let mut roster = Roster::new();
        let now = Timebase::new().now();
        roster
            .insert(Host {
                name: HostName::new("svc").unwrap(),
                request_sock: a,
                relay_sock: b,
                uid: 1000,
                created_at: now,
                last_ack: now,
            })
            .unwrap();
        let err = roster.insert(Host {
            name: HostName::new("svc").unwrap(),
            request_sock: c,
            relay_sock: d,
            uid: 1000,
            created_at: now,
            last_ack: now,
        });
        assert!(err.is_err());
        assert_eq!(roster.len(), 1);
    }
}
