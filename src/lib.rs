// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Local-namespace IPC broker: a three-party rendezvous protocol that lets
// peers in separated mount/network namespaces reach services (hosts)
// registered on the same machine, by brokering the hand-off of a freshly
// connected byte-stream socket pair. An optional sealed shared-memory SPSC
// ring transport ("shmpair") can then be layered over that socket for
// higher throughput.

pub mod broker;
pub mod config;
pub mod error;
pub mod fdpass;
pub mod handshake;
pub mod host_client;
pub mod peer;
pub mod roster;
pub mod shmpair;
pub mod signals;
pub mod sock;
pub mod timebase;
pub mod wire;
mod worker;

pub use broker::Broker;
pub use config::Config;
pub use error::{BrokerError, Result};
pub use host_client::HostHandle;
pub use roster::HostName;
pub use shmpair::ShmPair;
