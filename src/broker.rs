// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The broker core: owns both listening endpoints, the host roster, and
// the two handshake slot arrays. Nothing else mutates this state — the
// shared-resource policy confines all of it to the single tick loop
// below. `Broker::tick` performs the five-step fixed order from the
// component design exactly once; `Broker::run` wraps it in the ~12 Hz
// pacing loop and handles graceful shutdown.

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::config::Config;
use crate::error::{BrokerError, Result};
use crate::fdpass;
use crate::handshake::{RegSlot, ReqSlot, SlotArray};
use crate::roster::{Host, HostName, Roster};
use crate::sock::{self, Endpoint};
use crate::timebase::Timebase;
use crate::wire;
use crate::worker::{self, WorkerConfig};

pub struct Broker {
    cfg: Config,
    reg_ep: Endpoint,
    req_ep: Endpoint,
    roster: Roster,
    reg_slots: SlotArray<RegSlot>,
    req_slots: SlotArray<ReqSlot>,
    tb: Timebase,
    shutdown: Arc<AtomicBool>,
}

impl Broker {
    pub fn new(cfg: Config, shutdown: Arc<AtomicBool>) -> Result<Self> {
        let backlog = cfg.max_accept_per_tick as i32;
        let reg_ep = Endpoint::bind(&cfg.reg_path, backlog)?;
        let req_ep = Endpoint::bind(&cfg.req_path, backlog)?;
        Ok(Self {
            reg_slots: SlotArray::with_capacity(cfg.max_reg_handshakes),
            req_slots: SlotArray::with_capacity(cfg.max_req_handshakes),
            roster: Roster::new(),
            reg_ep,
            req_ep,
            tb: Timebase::new(),
            shutdown,
            cfg,
        })
    }

    pub fn roster_len(&self) -> usize {
        self.roster.len()
    }

    /// Number of occupied pending-registration slots. Exposed for tests
    /// that need to observe slot reclamation without reaching into the
    /// broker's private arrays.
    pub fn pending_registration_count(&self) -> usize {
        self.reg_slots.active_count()
    }

    /// Number of occupied pending-request slots.
    pub fn pending_request_count(&self) -> usize {
        self.req_slots.active_count()
    }

    /// Whether the named host is present and confirmed (has observed at
    /// least one keepalive past its creation timestamp).
    pub fn host_is_confirmed(&self, name: &str) -> Option<bool> {
        let name = HostName::new(name).ok()?;
        self.roster.get(&name).map(Host::is_confirmed)
    }

    /// Run the fixed-rate tick loop until a shutdown signal arrives, then
    /// drain: notify every host with a best-effort `'Q'` byte before
    /// returning.
    pub fn run(&mut self) -> Result<()> {
        let interval = self.cfg.tick_interval();
        while !self.shutdown.load(Ordering::Relaxed) {
            self.tick();
            std::thread::sleep(interval);
        }
        self.notify_hosts_shutdown();
        std::thread::sleep(std::time::Duration::from_millis(self.cfg.shutdown_drain_ms));
        Ok(())
    }

    fn notify_hosts_shutdown(&mut self) {
        for (_, host) in self.roster.iter_mut() {
            let _ = wire::try_send_byte(&mut host.request_sock, wire::SHUTDOWN);
        }
    }

    /// One iteration of the fixed five-step order: registration accept,
    /// registration advance, host liveness, request advance/reap, request
    /// accept.
    pub fn tick(&mut self) {
        self.accept_registrations();
        self.advance_registrations();
        self.advance_hosts();
        self.advance_requests();
        self.accept_requests();
    }

    // --- step 1: accept new registrations ---------------------------------

    fn accept_registrations(&mut self) {
        let accepted = self.reg_ep.accept_batch(self.cfg.max_accept_per_tick);
        for sock in accepted {
            let creds = match sock::peer_credentials(&sock) {
                Ok(c) => c,
                Err(_) => continue, // socket closed by drop
            };

            let active_for_uid = self.reg_slots.iter().filter(|s| s.uid == creds.uid).count();
            if active_for_uid > self.cfg.max_reg_handshakes_per_uid {
                log::warn!("uid {} exceeded pending-registration quota", creds.uid);
                continue;
            }
            if creds.uid != 0 && self.roster.count_for_uid(creds.uid) >= self.cfg.max_hosts_per_uid
            {
                log::warn!("uid {} exceeded host quota", creds.uid);
                continue;
            }

            let slot = RegSlot {
                uid: creds.uid,
                pid: creds.pid,
                created_at: self.tb.now(),
                sock,
            };
            if self.reg_slots.try_insert(slot).is_err() {
                log::debug!("registration handshake array full, dropping connection");
            }
        }
    }

    // --- step 2: advance pending registrations -----------------------------

    fn advance_registrations(&mut self) {
        let timeout_ms = self.cfg.reg_timeout_ms;
        let max_hosts = self.cfg.max_hosts;
        let now = self.tb.now();
        let tb = self.tb.clone();

        let mut to_drop = Vec::new();
        let mut to_confirm: Vec<(usize, HostName)> = Vec::new();

        for (idx, slot) in self.reg_slots.iter_indexed_mut() {
            if tb.elapsed(now, slot.created_at, timeout_ms) {
                to_drop.push(idx);
                continue;
            }
            if self.roster.len() >= max_hosts {
                continue; // leave intact for next tick
            }
            match wire::try_recv_name(&mut slot.sock) {
                Ok(None) => {}
                Ok(Some(name)) => {
                    if self.roster.contains(&name) {
                        log::warn!("duplicate host name {:?} rejected", name.as_str());
                        to_drop.push(idx);
                    } else {
                        to_confirm.push((idx, name));
                    }
                }
                Err(e) => {
                    log::debug!("registration slot dropped: {e}");
                    to_drop.push(idx);
                }
            }
        }

        for (idx, name) in to_confirm {
            match self.confirm_registration(idx, name) {
                Ok(()) => {}
                Err(e) => {
                    log::warn!("registration confirmation failed: {e}");
                    self.reg_slots.take(idx);
                }
            }
        }
        for idx in to_drop {
            self.reg_slots.take(idx);
        }
    }

    fn confirm_registration(&mut self, idx: usize, name: HostName) -> Result<()> {
        let mut slot = self
            .reg_slots
            .take(idx)
            .ok_or_else(|| BrokerError::Fatal("confirm_registration: slot vanished".into()))?;

        let (broker_half, host_half) = UnixStream::pair().map_err(BrokerError::Io)?;
        broker_half.set_nonblocking(true).map_err(BrokerError::Io)?;
        host_half.set_nonblocking(true).map_err(BrokerError::Io)?;

        fdpass::send_fd(&slot.sock, host_half.as_fd())?;
        drop(host_half); // the send was a move: close our copy

        slot.sock.set_nonblocking(true).map_err(BrokerError::Io)?;
        let now = self.tb.now();
        let host = Host {
            name,
            request_sock: slot.sock,
            relay_sock: broker_half,
            uid: slot.uid,
            created_at: now,
            last_ack: now, // unconfirmed until the first 'K'
        };
        self.roster.insert(host)
    }

    // --- step 3: advance host roster ---------------------------------------

    fn advance_hosts(&mut self) {
        let now = self.tb.now();
        let idle_timeout = self.cfg.host_idle_timeout_ms;
        let tb = self.tb.clone();

        let mut to_remove = Vec::new();
        for (name, host) in self.roster.iter() {
            if let Some(timeout_ms) = idle_timeout {
                if tb.elapsed(now, host.last_ack, timeout_ms) {
                    to_remove.push(name.clone());
                }
            }
        }

        let names: Vec<HostName> = self.roster.names().cloned().collect();
        for name in names {
            if to_remove.contains(&name) {
                continue;
            }
            let host = match self.roster.get_mut(&name) {
                Some(h) => h,
                None => continue,
            };
            match wire::try_read_byte(&mut host.request_sock) {
                Ok(Some(wire::KEEPALIVE)) => host.last_ack = now,
                Ok(Some(_other)) => {
                    log::debug!("host {:?}: ignoring unrecognized byte", name.as_str());
                }
                Ok(None) => {}
                Err(_) => to_remove.push(name),
            }
        }

        for name in to_remove {
            if let Some(host) = self.roster.remove(&name) {
                log::info!("host {:?} removed", host.name.as_str());
            }
        }
    }

    // --- step 4: advance requests -------------------------------------------

    fn advance_requests(&mut self) {
        let timeout_ms = self.cfg.req_timeout_ms;
        let now = self.tb.now();
        let tb = self.tb.clone();

        for slot in self.req_slots.iter_mut() {
            if !slot.kill_sent && tb.elapsed(now, slot.created_at, timeout_ms) {
                if slot.worker_pid.as_raw() > 1 {
                    let _ = kill(slot.worker_pid, Signal::SIGKILL);
                }
                slot.kill_sent = true;
            }
        }

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    let idx = self
                        .req_slots
                        .iter_indexed_mut()
                        .find(|(_, s)| s.worker_pid == pid)
                        .map(|(i, _)| i);
                    match idx {
                        Some(i) => {
                            self.req_slots.take(i);
                        }
                        None => {
                            log::error!(
                                "reaped pid {pid} not present in request array; scrubbing array"
                            );
                            self.req_slots.clear();
                            break;
                        }
                    }
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue, // Stopped/Continued/etc: keep draining
                Err(_) => break,   // ECHILD or similar: nothing left to reap
            }
        }
    }

    // --- step 5: accept new requests ----------------------------------------

    fn accept_requests(&mut self) {
        let accepted = self.req_ep.accept_batch(self.cfg.max_accept_per_tick);
        let worker_cfg = WorkerConfig {
            poll_interval: std::time::Duration::from_millis(self.cfg.worker_poll_interval_ms),
            timeout: std::time::Duration::from_millis(self.cfg.req_timeout_ms),
        };

        for sock in accepted {
            let creds = match sock::peer_credentials(&sock) {
                Ok(c) => c,
                Err(_) => continue,
            };
            if self.req_slots.iter().any(|s| s.uid == creds.uid) {
                log::debug!("uid {} already has an in-flight request", creds.uid);
                continue;
            }
            if self.req_slots.active_count() >= self.req_slots.capacity() {
                log::debug!("request handshake array full, dropping connection");
                continue;
            }

            // SAFETY: see worker::spawn's contract — the child never
            // returns through this function, it `_exit`s directly.
            let child = match unsafe { worker::spawn(sock, &self.roster, &worker_cfg) } {
                Ok(pid) => pid,
                Err(e) => {
                    log::error!("fork failed: {e}");
                    continue;
                }
            };

            let slot = ReqSlot {
                uid: creds.uid,
                pid: creds.pid,
                created_at: self.tb.now(),
                worker_pid: child,
                kill_sent: false,
            };
            if self.req_slots.try_insert(slot).is_err() {
                // Capacity was checked above; this should not happen, but
                // if it does, terminate the orphaned worker rather than
                // leak it untracked.
                let _ = kill(child, Signal::SIGKILL);
                let _ = waitpid(child, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_client::HostHandle;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.reg_path = dir.join("reg.sock").to_string_lossy().into_owned();
        cfg.req_path = dir.join("req.sock").to_string_lossy().into_owned();
        cfg.reg_timeout_ms = 200;
        cfg.req_timeout_ms = 200;
        cfg.connect_poll_interval_ms = 1;
        cfg.worker_poll_interval_ms = 2;
        cfg
    }

    #[test]
    fn registration_confirms_host_into_roster() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut broker = Broker::new(cfg.clone(), shutdown).unwrap();

        let reg_path = cfg.reg_path.clone();
        let cfg_for_client = cfg.clone();
        let client = std::thread::spawn(move || {
            HostHandle::register(&reg_path, "svc", &cfg_for_client)
        });

        // drive enough ticks for accept + advance to run
        for _ in 0..20 {
            broker.tick();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let handle = client.join().unwrap().unwrap();
        assert_eq!(handle.name().as_str(), "svc");
        assert_eq!(broker.roster_len(), 1);
    }

    #[test]
    fn duplicate_registration_keeps_exactly_one_host() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut broker = Broker::new(cfg.clone(), shutdown).unwrap();

        let reg_path = cfg.reg_path.clone();
        let cfg_a = cfg.clone();
        let cfg_b = cfg.clone();
        let a = std::thread::spawn({
            let reg_path = reg_path.clone();
            move || HostHandle::register(&reg_path, "svc", &cfg_a)
        });
        let b = std::thread::spawn(move || HostHandle::register(&reg_path, "svc", &cfg_b));

        for _ in 0..30 {
            broker.tick();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        let ra = a.join().unwrap();
        let rb = b.join().unwrap();
        let successes = [ra.is_ok(), rb.is_ok()].into_iter().filter(|x| *x).count();
        assert_eq!(successes, 1, "exactly one of two racing registrations should succeed");
        assert_eq!(broker.roster_len(), 1);
    }
}
