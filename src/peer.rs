// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Peer connect: the client side of a request handshake. A peer is any
// process that wants a byte-stream socket to a named host; it never talks
// to a host directly, only to the broker's request endpoint.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::error::{BrokerError, Result};
use crate::fdpass;
use crate::roster::HostName;
use crate::timebase::Timebase;
use crate::wire;

/// Connect to `name` via the broker listening at `req_path`. Sends the
/// NUL-terminated name, then polls for a relayed file descriptor with a
/// short back-off up to `cfg.req_timeout_ms`. On any failure the request
/// endpoint is closed and an error is returned; on success the connection
/// to the broker is closed since it's no longer needed and the received
/// socket (now connected to the host) is returned.
pub fn connect(req_path: impl AsRef<Path>, name: &str, cfg: &Config) -> Result<UnixStream> {
    let name = HostName::new(name)?;
    let mut sock = UnixStream::connect(req_path.as_ref()).map_err(BrokerError::Io)?;

    if wire::send_name_blocking(&mut sock, &name).is_err() {
        return Err(BrokerError::Rejected("request send failed".into()));
    }

    sock.set_nonblocking(true).map_err(BrokerError::Io)?;
    let tb = Timebase::new();
    let deadline = tb.now();
    loop {
        match fdpass::try_recv_fd(&sock) {
            Ok(Some(fd)) => return Ok(fd.into()),
            Ok(None) => {
                if tb.elapsed_since(deadline, cfg.req_timeout_ms) {
                    return Err(BrokerError::TimedOut(format!(
                        "connect to {:?}",
                        name.as_str()
                    )));
                }
                std::thread::sleep(Duration::from_millis(cfg.connect_poll_interval_ms));
            }
            Err(e) => return Err(e),
        }
    }
    // `sock` (the connection to the broker) drops here on every path,
    // closing it — it is never needed again once the relayed fd arrives.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::Endpoint;

    #[test]
    fn connect_times_out_against_a_silent_broker() {
        let dir = tempfile::tempdir().unwrap();
        let req_path = dir.path().join("req.sock");
        let ep = Endpoint::bind(&req_path, 4).unwrap();

        let mut cfg = Config::default();
        cfg.req_timeout_ms = 50;
        cfg.connect_poll_interval_ms = 1;

        let client = std::thread::spawn({
            let req_path = req_path.clone();
            move || connect(&req_path, "nonexistent", &cfg)
        });

        // accept but never answer — exercises the peer-side timeout path.
        std::thread::sleep(Duration::from_millis(10));
        let _accepted = ep.accept_batch(1);

        let result = client.join().unwrap();
        assert!(matches!(result, Err(BrokerError::TimedOut(_))));
    }
}
