// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-request worker: forked by the broker for every accepted peer
// connection. `fork()` gives the child its own copy-on-write snapshot of
// the broker's entire address space — including the host roster — so the
// worker can look the target host up itself after receiving the peer's
// name, exactly as if it held a read-only reference, without the parent
// needing to resolve anything before forking. The worker has no other
// access to broker state: it never sees the handshake arrays, any other
// host's sockets, or the parent's subsequent mutations to the roster,
// because those live in the parent's own un-shared pages.
//
// Because each request runs in its own address space, a stuck or
// malicious host cannot wedge the broker's main loop; the broker's own
// 5 s request timeout bounds the damage from the parent side regardless
// of what the worker does.

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::unistd::{ForkResult, Pid};

use crate::fdpass;
use crate::roster::Roster;
use crate::timebase::Timebase;
use crate::wire;

/// Exit status a worker reports to its parent via the process exit code,
/// per the error handling design: workers communicate failure only by
/// exit code, never by writing to a shared channel the broker reads.
const EXIT_OK: i32 = 0;
const EXIT_FAIL: i32 = 1;

pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Fork a worker process to service one accepted peer connection. The
/// child runs [`run`] against its own COW snapshot of `roster` and then
/// `_exit`s; the parent gets back the child's pid to track in a request
/// handshake slot.
///
/// # Safety
/// Calls `fork()`. The child must not return through the caller's stack
/// or run destructors shared with the parent (notably: it must not flush
/// buffered stdio the parent also owns, and must not drop any fd the
/// parent still needs) — `run` communicates its result only via the
/// process exit code, enforced by calling `_exit` directly.
pub unsafe fn spawn(peer_sock: UnixStream, roster: &Roster, cfg: &WorkerConfig) -> nix::Result<Pid> {
    match nix::unistd::fork()? {
        ForkResult::Parent { child } => {
            // `peer_sock` is dropped here at the end of this function,
            // closing the parent's copy — "parent closes its copy of the
            // accepted socket" from the broker's request-accept step.
            Ok(child)
        }
        ForkResult::Child => {
            let status = run(peer_sock, roster, cfg);
            nix::unistd::_exit(status);
        }
    }
}

fn run(mut peer_sock: UnixStream, roster: &Roster, cfg: &WorkerConfig) -> i32 {
    // The broker's accept loop leaves every accepted socket non-blocking;
    // that flag lives on the shared open file description, so it survives
    // fork() into this child. The first read here is meant to actually
    // block on the peer's name message, so put it back in blocking mode.
    if peer_sock.set_nonblocking(false).is_err() {
        return EXIT_FAIL;
    }
    let name = match wire::recv_name_blocking(&mut peer_sock) {
        Ok(name) => name,
        Err(_) => return EXIT_FAIL,
    };

    let host = match roster.get(&name) {
        Some(host) => host,
        None => return EXIT_FAIL,
    };

    if !host.is_confirmed() {
        // Unconfirmed-host gating: exit without ever sending 'R'.
        return EXIT_FAIL;
    }

    // `host.request_sock`/`host.relay_sock` are the same open file
    // descriptions the parent holds; writes/reads here are visible to
    // whichever process ends up servicing them (the live host process),
    // not just to this child's private page copy.
    let mut request_sock = match host.request_sock.try_clone() {
        Ok(s) => s,
        Err(_) => return EXIT_FAIL,
    };
    let relay_sock = match host.relay_sock.try_clone() {
        Ok(s) => s,
        Err(_) => return EXIT_FAIL,
    };
    if relay_sock.set_nonblocking(true).is_err() {
        return EXIT_FAIL;
    }

    if wire::send_byte_blocking(&mut request_sock, wire::REQUEST).is_err() {
        return EXIT_FAIL;
    }

    let tb = Timebase::new();
    let deadline = tb.now();
    let relay_fd = loop {
        match fdpass::try_recv_fd(&relay_sock) {
            Ok(Some(fd)) => break fd,
            Ok(None) => {
                if tb.elapsed_since(deadline, cfg.timeout.as_millis() as u64) {
                    return EXIT_FAIL;
                }
                std::thread::sleep(cfg.poll_interval);
            }
            Err(_) => return EXIT_FAIL,
        }
    };

    match fdpass::send_fd(&peer_sock, relay_fd.as_fd()) {
        Ok(()) => EXIT_OK,
        Err(_) => EXIT_FAIL,
    }
}

