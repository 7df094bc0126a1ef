// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The two fixed-capacity handshake slot arrays: pending registrations and
// pending requests. Both are simple `Vec<Option<T>>` arenas rather than an
// intrusive linked list (see the re-architecture guidance on replacing
// intrusive lists with owned, indexable storage) — a free slot is any
// `None` entry, found by linear scan, which is fine at the capacities
// involved (default 25).

use std::os::unix::net::UnixStream;

use crate::timebase::Timestamp;

/// A pending registration: an accepted socket waiting for the host to send
/// its name.
pub struct RegSlot {
    pub uid: u32,
    pub pid: i32,
    pub created_at: Timestamp,
    pub sock: UnixStream,
}

/// A pending request: a peer socket handed off to a worker process, plus
/// enough bookkeeping for the broker to enforce the per-uid in-flight
/// limit and the 5 s timeout.
pub struct ReqSlot {
    pub uid: u32,
    pub pid: i32,
    pub created_at: Timestamp,
    pub worker_pid: nix::unistd::Pid,
    /// Set once the broker has sent a termination signal, so a slot isn't
    /// signalled twice while waiting for its child to be reaped.
    pub kill_sent: bool,
}

/// A fixed-capacity arena of optional slots. Used identically for both the
/// registration and request handshake arrays; only the slot payload type
/// differs.
pub struct SlotArray<T> {
    slots: Vec<Option<T>>,
}

impl<T> SlotArray<T> {
    pub fn with_capacity(cap: usize) -> Self {
        let mut slots = Vec::with_capacity(cap);
        slots.resize_with(cap, || None);
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Occupy the first free slot with `value`. Returns `false` (and drops
    /// nothing — the caller keeps ownership) if the array is full.
    pub fn try_insert(&mut self, value: T) -> Result<(), T> {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(value);
                return Ok(());
            }
        }
        Err(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    /// Iterate occupied slot indices together with their values, so callers
    /// can clear specific slots after deciding their fate.
    pub fn iter_indexed_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|v| (i, v)))
    }

    pub fn take(&mut self, index: usize) -> Option<T> {
        self.slots.get_mut(index).and_then(|s| s.take())
    }

    /// Drop every occupied slot. Used for the "reaped pid absent from the
    /// request array" fatal-inconsistency recovery path, which scrubs the
    /// entire array per the error handling design.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}
