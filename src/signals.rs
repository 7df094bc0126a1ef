// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Signal plumbing: SIGPIPE is ignored outright (the broker never wants a
// write to a dead socket to kill the process — every send already checks
// its own return value), and SIGTERM/SIGINT/SIGQUIT are captured into a
// shared flag the main tick loop polls once per iteration, in the same
// flag-registration style the CLI frontend in the retrieval pack uses for
// its own shutdown handling.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use nix::sys::signal::{self, SigHandler, Signal};
use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::flag;

use crate::error::{BrokerError, Result};

/// Ignore SIGPIPE and install a shared shutdown flag for SIGTERM/SIGINT/
/// SIGQUIT. The returned flag reads `true` once any of those three
/// signals has been received; the main loop should check it every tick.
pub fn install() -> Result<Arc<AtomicBool>> {
    // SAFETY: installing SIG_IGN for SIGPIPE at startup, before any other
    // thread exists, is the standard one-shot signal-disposition change
    // every non-blocking-socket daemon in this style makes.
    unsafe {
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)
            .map_err(|e| BrokerError::Fatal(format!("signal(SIGPIPE, SIG_IGN): {e}")))?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in [SIGTERM, SIGINT, SIGQUIT] {
        flag::register(sig, Arc::clone(&shutdown))
            .map_err(|e| BrokerError::Fatal(format!("signal_hook::register({sig}): {e}")))?;
    }
    Ok(shutdown)
}
