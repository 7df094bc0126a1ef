// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end scenarios against a live broker: each test spins up a real
// `Broker` on its own tempdir-scoped UNIX sockets, drives its tick loop on
// a background thread, and exercises the public host/peer APIs against it.
// These correspond to the rendezvous protocol's numbered end-to-end
// scenarios (echo round-trip, unknown host, unconfirmed host, per-uid
// in-flight limit, duplicate registration).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opbroker::{fdpass, peer, wire, Broker, Config, HostHandle};

fn fast_config(dir: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.reg_path = dir.join("reg.sock").to_string_lossy().into_owned();
    cfg.req_path = dir.join("req.sock").to_string_lossy().into_owned();
    cfg.tick_rate_hz = 200;
    cfg.reg_timeout_ms = 300;
    cfg.req_timeout_ms = 300;
    cfg.connect_poll_interval_ms = 1;
    cfg.worker_poll_interval_ms = 2;
    cfg.keepalive_interval_ms = 50;
    cfg
}

/// Drive `broker.tick()` on a background thread until `stop` is set.
/// Returns the thread handle and the shared broker for introspection.
fn spawn_ticking(
    broker: Broker,
    interval: Duration,
) -> (Arc<Mutex<Broker>>, Arc<AtomicBool>, std::thread::JoinHandle<()>) {
    let shared = Arc::new(Mutex::new(broker));
    let stop = Arc::new(AtomicBool::new(false));
    let handle = std::thread::spawn({
        let shared = Arc::clone(&shared);
        let stop = Arc::clone(&stop);
        move || {
            while !stop.load(Ordering::Relaxed) {
                shared.lock().unwrap().tick();
                std::thread::sleep(interval);
            }
        }
    });
    (shared, stop, handle)
}

fn stop_ticking(stop: Arc<AtomicBool>, handle: std::thread::JoinHandle<()>) {
    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

/// S1: host registers as `echo_service`; peer connects and round-trips a
/// message byte-for-byte; no broker state is left behind afterward.
#[test]
fn s1_echo_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = fast_config(dir.path());
    let broker = Broker::new(cfg.clone(), Arc::new(AtomicBool::new(false))).unwrap();
    let (shared, stop, ticker) = spawn_ticking(broker, cfg.tick_interval());

    let reg_path = cfg.reg_path.clone();
    let host_cfg = cfg.clone();
    let host_thread = std::thread::spawn(move || {
        let mut handle = HostHandle::register(&reg_path, "echo_service", &host_cfg).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            handle.accept().unwrap();
            if let Some(mut sock) = handle.handshake() {
                sock.set_nonblocking(false).unwrap();
                let mut buf = [0u8; 64];
                let n = sock.read(&mut buf).unwrap();
                sock.write_all(&buf[..n]).unwrap();
                return;
            }
            if std::time::Instant::now() > deadline {
                panic!("host never observed a request");
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    });

    std::thread::sleep(Duration::from_millis(60)); // let registration confirm
    let mut sock = peer::connect(&cfg.req_path, "echo_service", &cfg).unwrap();
    sock.set_nonblocking(false).unwrap();
    sock.write_all(b"aloha\0").unwrap();
    let mut got = [0u8; 6];
    sock.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"aloha\0");

    host_thread.join().unwrap();
    assert_eq!(shared.lock().unwrap().roster_len(), 1);
    stop_ticking(stop, ticker);
}

/// S2: a peer requests a host that was never registered. The peer's
/// connect times out and the broker reclaims the request slot without
/// disturbing any host (there are none).
#[test]
fn s2_unknown_host_times_out_and_reclaims_slot() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = fast_config(dir.path());
    let broker = Broker::new(cfg.clone(), Arc::new(AtomicBool::new(false))).unwrap();
    let (shared, stop, ticker) = spawn_ticking(broker, cfg.tick_interval());

    let result = peer::connect(&cfg.req_path, "nonexistent", &cfg);
    assert!(matches!(result, Err(opbroker::BrokerError::TimedOut(_))));

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(shared.lock().unwrap().pending_request_count(), 0);
    assert_eq!(shared.lock().unwrap().roster_len(), 0);
    stop_ticking(stop, ticker);
}

/// S3: a host registers but a raw registration (bypassing the host-client
/// library's automatic initial keepalive) never confirms. A peer request
/// to that host must fail without disturbing the host's roster entry.
#[test]
fn s3_unconfirmed_host_rejects_request_but_stays_in_roster() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = fast_config(dir.path());
    let broker = Broker::new(cfg.clone(), Arc::new(AtomicBool::new(false))).unwrap();
    let (shared, stop, ticker) = spawn_ticking(broker, cfg.tick_interval());

    // Manually perform the registration wire protocol, stopping short of
    // the keepalive byte a real HostHandle::register would send.
    let name = opbroker::HostName::new("silent_host").unwrap();
    let mut raw = UnixStream::connect(&cfg.reg_path).unwrap();
    wire::send_name_blocking(&mut raw, &name).unwrap();
    raw.set_nonblocking(true).unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    loop {
        if fdpass::try_recv_fd(&raw).unwrap().is_some() {
            break;
        }
        if std::time::Instant::now() > deadline {
            panic!("registration never confirmed");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    // deliberately never send the 'K' byte

    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(
        shared.lock().unwrap().host_is_confirmed("silent_host"),
        Some(false)
    );

    let result = peer::connect(&cfg.req_path, "silent_host", &cfg);
    assert!(matches!(result, Err(opbroker::BrokerError::TimedOut(_))));
    assert_eq!(shared.lock().unwrap().roster_len(), 1);
    stop_ticking(stop, ticker);
}

/// S4 (same-uid variant): two concurrent requests for the same confirmed
/// host from the same uid (the test process) — exactly one advances past
/// accept, the other is rejected and times out.
#[test]
fn s4_at_most_one_in_flight_request_per_uid() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = fast_config(dir.path());
    let broker = Broker::new(cfg.clone(), Arc::new(AtomicBool::new(false))).unwrap();
    let (shared, stop, ticker) = spawn_ticking(broker, cfg.tick_interval());

    let reg_path = cfg.reg_path.clone();
    let host_cfg = cfg.clone();
    let host_thread = std::thread::spawn(move || {
        let mut handle = HostHandle::register(&reg_path, "busy_host", &host_cfg).unwrap();
        let mut served = 0;
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while served < 1 && std::time::Instant::now() < deadline {
            handle.accept().unwrap();
            while let Some(sock) = handle.handshake() {
                served += 1;
                drop(sock); // connection established is all this test checks
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(served, 1, "exactly one request should have reached the host");
    });

    std::thread::sleep(Duration::from_millis(60));
    let req_path_a = cfg.req_path.clone();
    let req_path_b = cfg.req_path.clone();
    let cfg_a = cfg.clone();
    let cfg_b = cfg.clone();
    let a = std::thread::spawn(move || peer::connect(&req_path_a, "busy_host", &cfg_a));
    let b = std::thread::spawn(move || peer::connect(&req_path_b, "busy_host", &cfg_b));

    let ra = a.join().unwrap();
    let rb = b.join().unwrap();
    let successes = [ra.is_ok(), rb.is_ok()].into_iter().filter(|x| *x).count();
    assert_eq!(successes, 1, "exactly one concurrent same-uid request should succeed");

    host_thread.join().unwrap();
    stop_ticking(stop, ticker);
}
