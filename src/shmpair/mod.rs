// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The shmpair shared-memory transport: a sealed, mutually-paired pair of
// memfd-backed mappings carrying per-channel lock-free SPSC ring buffers.
// This is the optional high-throughput channel established over an
// already-brokered socket; the broker itself never constructs one — hosts
// and peers do, after Connect/Accept has handed them a byte-stream socket.

pub(crate) mod memfd;
mod header;

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::{BrokerError, Result};
use crate::fdpass;
use crate::timebase::Timebase;
use crate::wire;
use header::Header;

pub use header::{CHANNELS, MAGIC, MAX_NAME};

/// One side of a paired shmpair transport: an outbound mapping this
/// process owns and writes, and (once paired) an inbound mapping owned by
/// the peer, mapped read-only here.
pub struct ShmPair {
    name: String,
    slot_size: u32,
    slot_count: u32,
    read_only: bool,
    out_fd: OwnedFd,
    out_ptr: *mut u8,
    out_len: usize,
    inbound: Option<Inbound>,
}

struct Inbound {
    fd: OwnedFd,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapped memory is shared by design and all access goes
// through atomics or is confined to this process's exclusive half.
unsafe impl Send for ShmPair {}

impl Drop for ShmPair {
    fn drop(&mut self) {
        unsafe {
            memfd::munmap(self.out_ptr, self.out_len);
            if let Some(inbound) = &self.inbound {
                memfd::munmap(inbound.ptr, inbound.len);
            }
        }
    }
}

impl ShmPair {
    fn out_header(&self) -> &Header {
        unsafe { header::header_ref(self.out_ptr) }
    }

    fn in_header(&self) -> Option<&Header> {
        self.inbound
            .as_ref()
            .map(|i| unsafe { header::header_ref(i.ptr) })
    }

    /// Create the outbound half: a sealed memfd sized for `slot_count`
    /// slots of `slot_size` bytes each, across [`CHANNELS`] channels.
    /// `slot_count` must be at least 2 (one slot is always kept empty to
    /// distinguish full from empty).
    pub fn create(name: &str, slot_size: u32, slot_count: u32, read_only: bool) -> Result<Self> {
        if slot_count < 2 {
            return Err(BrokerError::Rejected("slot_count must be >= 2".into()));
        }
        let total = header::total_size(slot_size, slot_count) as usize;
        let out_fd = memfd::create_sealed(name, total).map_err(BrokerError::Io)?;
        let out_ptr = unsafe { memfd::mmap_rw(out_fd.as_fd(), total).map_err(BrokerError::Io)? };
        unsafe { header::write_header(out_ptr, name, slot_size, slot_count, read_only) };

        Ok(Self {
            name: name.to_owned(),
            slot_size,
            slot_count,
            read_only,
            out_fd,
            out_ptr,
            out_len: total,
            inbound: None,
        })
    }

    /// The file descriptor for this side's outbound mapping — hand this to
    /// [`fdpass::send_fd`](crate::fdpass::send_fd) to send it to the peer
    /// during the shmpair handshake.
    pub fn outbound_fd(&self) -> BorrowedFd<'_> {
        self.out_fd.as_fd()
    }

    /// Validate and map `foreign_fd` as the inbound half, completing the
    /// pairing. `foreign_fd` must carry the required seals, the correct
    /// magic, and geometry matching this side's own `slot_size`/
    /// `slot_count`.
    pub fn pair(&mut self, foreign_fd: OwnedFd) -> Result<()> {
        let total = header::total_size(self.slot_size, self.slot_count) as usize;
        let seals = memfd::get_seals(foreign_fd.as_fd()).map_err(BrokerError::Io)?;
        let size = memfd::file_size(foreign_fd.as_fd()).map_err(BrokerError::Io)?;

        if size < header::HEADER_SIZE as u64 {
            return Err(BrokerError::Rejected(
                "foreign memfd smaller than shmpair header".into(),
            ));
        }

        let probe_ptr = unsafe {
            memfd::mmap_ro(foreign_fd.as_fd(), header::HEADER_SIZE).map_err(BrokerError::Io)?
        };
        let probe_hdr = unsafe { header::header_ref(probe_ptr) };
        let validation = header::validate(
            probe_hdr,
            seals,
            size,
            Some(self.slot_size),
            Some(self.slot_count),
        );
        unsafe { memfd::munmap(probe_ptr, header::HEADER_SIZE) };
        validation?;

        let ptr = unsafe { memfd::mmap_ro(foreign_fd.as_fd(), total).map_err(BrokerError::Io)? };
        self.inbound = Some(Inbound {
            fd: foreign_fd,
            ptr,
            len: total,
        });
        Ok(())
    }

    /// Open a new local half derived from a foreign header and immediately
    /// pair with it: reads the foreign side's advertised geometry, creates
    /// a matching outbound mapping, then pairs.
    pub fn open(foreign_fd: OwnedFd, local_name: &str) -> Result<Self> {
        let size = memfd::file_size(foreign_fd.as_fd()).map_err(BrokerError::Io)?;
        if size < header::HEADER_SIZE as u64 {
            return Err(BrokerError::Rejected(
                "foreign memfd smaller than shmpair header".into(),
            ));
        }
        let probe_ptr = unsafe {
            memfd::mmap_ro(foreign_fd.as_fd(), header::HEADER_SIZE).map_err(BrokerError::Io)?
        };
        let probe_hdr = unsafe { header::header_ref(probe_ptr) };
        let slot_size = probe_hdr.slot_size;
        let slot_count = probe_hdr.slot_count;
        let foreign_read_only = probe_hdr.read_only != 0;
        unsafe { memfd::munmap(probe_ptr, header::HEADER_SIZE) };

        // Our own read_only is the opposite sense of the foreign side's
        // declared flag only in that both sides may independently choose;
        // here we default to read-write unless the foreign side demands a
        // read-only peer, which has no enforced meaning locally beyond
        // what Create's caller chose — so default false.
        let _ = foreign_read_only;
        let mut local = Self::create(local_name, slot_size, slot_count, false)?;
        local.pair(foreign_fd)?;
        Ok(local)
    }

    /// Perform the shmpair handshake over an already-established
    /// byte-stream socket (the one Connect/Accept handed the caller): send
    /// this side's outbound memfd, receive and pair the peer's, then
    /// exchange the readiness `'K'` byte — the initiator sends it, the
    /// other side waits for it. Both sides must agree in advance on
    /// `slot_size`/`slot_count`/`read_only` and on which one is the
    /// initiator; `stream` is switched to non-blocking mode (required for
    /// the polled fd/byte exchange below) and otherwise remains available
    /// to the caller afterward for any other purpose.
    pub fn establish(
        stream: &mut UnixStream,
        name: &str,
        slot_size: u32,
        slot_count: u32,
        read_only: bool,
        initiator: bool,
        timeout_ms: u64,
    ) -> Result<Self> {
        stream.set_nonblocking(true).map_err(BrokerError::Io)?;
        let mut local = Self::create(name, slot_size, slot_count, read_only)?;
        fdpass::send_fd(&*stream, local.outbound_fd())?;

        let tb = Timebase::new();
        let deadline = tb.now();
        let foreign_fd = loop {
            match fdpass::try_recv_fd(&*stream) {
                Ok(Some(fd)) => break fd,
                Ok(None) => {
                    if tb.elapsed_since(deadline, timeout_ms) {
                        return Err(BrokerError::TimedOut("shmpair fd handshake".into()));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e),
            }
        };
        local.pair(foreign_fd)?;

        if initiator {
            wire::send_byte_blocking(stream, wire::KEEPALIVE)?;
        } else {
            let deadline = tb.now();
            loop {
                match wire::try_read_byte(stream) {
                    Ok(Some(wire::KEEPALIVE)) => break,
                    Ok(Some(_other)) => {
                        return Err(BrokerError::Rejected(
                            "unexpected byte during shmpair handshake".into(),
                        ))
                    }
                    Ok(None) => {
                        if tb.elapsed_since(deadline, timeout_ms) {
                            return Err(BrokerError::TimedOut("shmpair readiness byte".into()));
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(local)
    }

    /// Send `buf` on `channel`. Returns `Ok(n)` with `n == buf.len()` on
    /// success, `Ok(0)` if the ring is full (no bytes written), or `Err`
    /// on a usage violation.
    pub fn send(&self, buf: &[u8], channel: usize) -> Result<usize> {
        if self.read_only {
            return Err(BrokerError::Rejected(
                "send on a read-only shmpair handle".into(),
            ));
        }
        if channel >= CHANNELS {
            return Err(BrokerError::Rejected("channel out of range".into()));
        }
        if buf.is_empty() || buf.len() > self.slot_size as usize {
            return Err(BrokerError::Rejected(
                "payload size out of bounds for slot_size".into(),
            ));
        }
        let inbound = self
            .inbound
            .as_ref()
            .ok_or_else(|| BrokerError::Rejected("shmpair not paired".into()))?;

        let out_hdr = self.out_header();
        let in_hdr = unsafe { header::header_ref(inbound.ptr) };

        let writeto = out_hdr.writeto[channel].load(Ordering::Relaxed);
        let freeslot = (writeto + 1) % self.slot_count as u64;
        let readat = in_hdr.readat[channel].load(Ordering::Acquire);
        if freeslot == readat {
            return Ok(0); // ring full
        }

        let slot_offset = header::HEADER_SIZE
            + (self.slot_size as usize) * (self.slot_count as usize) * channel
            + (self.slot_size as usize) * (freeslot as usize);
        unsafe {
            let dst = self.out_ptr.add(slot_offset);
            std::ptr::copy_nonoverlapping(buf.as_ptr(), dst, buf.len());
        }
        // Publish after the payload write is observable — the release half
        // of the SPSC handoff.
        out_hdr.writeto[channel].store(freeslot, Ordering::Release);
        Ok(buf.len())
    }

    /// Receive the next message on `channel` into a fresh `Vec`. Returns
    /// `Ok(None)` if the ring is empty.
    ///
    /// The C original (and this port) exposes `Recv` as a borrow into the
    /// inbound mapping valid until the next call; this API instead copies
    /// out immediately, which is the simpler and safer contract for a
    /// from-scratch Rust port and costs one memcpy per message.
    pub fn recv(&self, channel: usize) -> Result<Option<Vec<u8>>> {
        if channel >= CHANNELS {
            return Err(BrokerError::Rejected("channel out of range".into()));
        }
        let inbound = self
            .inbound
            .as_ref()
            .ok_or_else(|| BrokerError::Rejected("shmpair not paired".into()))?;

        let out_hdr = self.out_header();
        let in_hdr = unsafe { header::header_ref(inbound.ptr) };

        let readat = out_hdr.readat[channel].load(Ordering::Relaxed);
        // Acquire-load the producer's cursor before touching the slot it
        // guards, per the memory-ordering requirement.
        let writeto = in_hdr.writeto[channel].load(Ordering::Acquire);
        if readat == writeto {
            return Ok(None); // empty
        }
        let next = (readat + 1) % self.slot_count as u64;
        let slot_offset = header::HEADER_SIZE
            + (self.slot_size as usize) * (self.slot_count as usize) * channel
            + (self.slot_size as usize) * (next as usize);
        let mut out = vec![0u8; self.slot_size as usize];
        unsafe {
            let src = inbound.ptr.add(slot_offset);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
        }
        out_hdr.readat[channel].store(next, Ordering::Release);
        Ok(Some(out))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn is_paired(&self) -> bool {
        self.inbound.is_some()
    }

    /// Unmap both regions and close both descriptors. An explicit spelling
    /// of what dropping a `ShmPair` already does, for callers that want
    /// the teardown to read as a deliberate step (mirroring
    /// `shmpair_destroy` in the C original) rather than an implicit scope
    /// exit.
    pub fn destroy(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd};

    /// Duplicate a borrowed fd into an owned one, for tests that need to
    /// hand a second independent handle to the same memfd to `pair`.
    fn dup(fd: BorrowedFd<'_>) -> OwnedFd {
        let raw = unsafe { libc::dup(fd.as_raw_fd()) };
        assert!(raw >= 0);
        unsafe { OwnedFd::from_raw_fd(raw) }
    }

    #[test]
    fn send_recv_roundtrip_in_one_process() {
        let mut a = ShmPair::create("test-a", 64, 4, false).unwrap();
        let mut b = ShmPair::create("test-b", 64, 4, false).unwrap();

        let a_fd = dup(a.outbound_fd());
        let b_fd = dup(b.outbound_fd());
        a.pair(b_fd).unwrap();
        b.pair(a_fd).unwrap();

        assert_eq!(a.send(b"hello", 0).unwrap(), 5);
        let got = b.recv(0).unwrap().unwrap();
        assert_eq!(&got[..5], b"hello");
    }

    #[test]
    fn full_ring_send_returns_zero() {
        let mut a = ShmPair::create("test-c", 16, 4, false).unwrap();
        let mut b = ShmPair::create("test-d", 16, 4, false).unwrap();
        let a_fd = dup(a.outbound_fd());
        let b_fd = dup(b.outbound_fd());
        a.pair(b_fd).unwrap();
        b.pair(a_fd).unwrap();

        assert_eq!(a.send(b"1", 0).unwrap(), 1);
        assert_eq!(a.send(b"2", 0).unwrap(), 1);
        assert_eq!(a.send(b"3", 0).unwrap(), 1);
        // slot_count=4 means only 3 usable slots before the ring reports full
        assert_eq!(a.send(b"4", 0).unwrap(), 0);

        assert_eq!(b.recv(0).unwrap().unwrap()[0], b'1');
        assert_eq!(a.send(b"4", 0).unwrap(), 1);
    }

    #[test]
    fn pair_rejects_mismatched_slot_size() {
        let mut a = ShmPair::create("test-e", 64, 4, false).unwrap();
        let b = ShmPair::create("test-f", 32, 4, false).unwrap();
        let b_fd = dup(b.outbound_fd());
        assert!(a.pair(b_fd).is_err());
    }

    #[test]
    fn read_only_pair_refuses_send() {
        let mut a = ShmPair::create("test-g", 64, 4, true).unwrap();
        let mut b = ShmPair::create("test-h", 64, 4, false).unwrap();
        let a_fd = dup(a.outbound_fd());
        let b_fd = dup(b.outbound_fd());
        a.pair(b_fd).unwrap();
        b.pair(a_fd).unwrap();
        assert!(a.send(b"x", 0).is_err());
        assert_eq!(b.send(b"y", 0).unwrap(), 1);
    }

    #[test]
    fn establish_handshakes_over_a_connected_stream() {
        let (mut initiator_sock, mut responder_sock) = UnixStream::pair().unwrap();

        let responder = std::thread::spawn(move || {
            ShmPair::establish(&mut responder_sock, "resp", 64, 4, false, false, 1000).unwrap()
        });

        let initiator =
            ShmPair::establish(&mut initiator_sock, "init", 64, 4, false, true, 1000).unwrap();
        let responder = responder.join().unwrap();

        assert!(initiator.is_paired());
        assert!(responder.is_paired());
        assert_eq!(initiator.send(b"ping", 0).unwrap(), 4);
        assert_eq!(&responder.recv(0).unwrap().unwrap()[..4], b"ping");
    }
}
