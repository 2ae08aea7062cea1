mod common;

use std::{net::UdpSocket, sync::Arc, time::Duration};

use common::wait_for;
use fanout::{config::Config, control::Control, listener::Listener, pool::WorkerPool};
use fanout_communication::Counters;
use rand::RngCore;

const PACKETS: usize = 500;

#[test]
fn udp_straight_through() {
    let dest = UdpSocket::bind("127.0.0.1:0").unwrap();
    dest.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let config = Config::from_args([
        "127.0.0.1:0".to_string(),
        format!("127.0.0.1:{}/udp", dest.local_addr().unwrap().port()),
    ])
    .unwrap();

    let control = Control::new();
    let counters = Arc::new(Counters::default());
    let pool = WorkerPool::start(&config, Arc::clone(&control));
    let listener =
        Listener::spawn(&config, Arc::clone(&pool), Arc::clone(&counters), Arc::clone(&control))
            .unwrap();

    let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut rng = rand::rng();
    let mut sent = Vec::with_capacity(PACKETS);
    for i in 0..PACKETS {
        let mut payload = vec![0u8; 100];
        rng.fill_bytes(&mut payload);
        tx.send_to(&payload, listener.local_addr()).unwrap();
        sent.push(payload);
        // pace the bursts so neither rcvbuf overflows
        if i % 100 == 99 {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    let mut got = Vec::with_capacity(PACKETS);
    let mut buf = [0u8; 256];
    while got.len() < PACKETS {
        let n = dest.recv(&mut buf).expect("destination starved");
        got.push(buf[..n].to_vec());
    }
    assert_eq!(got, sent);

    wait_for("counters to settle", || {
        counters.snapshot().received_count == PACKETS as u64
            && pool.aggregate().sent_count == PACKETS as u64
    });
    let worker_totals = pool.aggregate();
    assert_eq!(worker_totals.spilled_count, 0);
    assert_eq!(worker_totals.dropped_count, 0);

    // A zero-length datagram is ignored entirely: no blob, no counters.
    tx.send_to(&[], listener.local_addr()).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(counters.snapshot().received_count, PACKETS as u64);

    listener.stop().unwrap();
    pool.shutdown();
}

#[test]
fn pps_limit_drops_the_overflow() {
    let dest = UdpSocket::bind("127.0.0.1:0").unwrap();
    let config = Config::from_args([
        "127.0.0.1:0".to_string(),
        format!("127.0.0.1:{}/udp", dest.local_addr().unwrap().port()),
        "--max-pps".into(),
        "10".into(),
    ])
    .unwrap();
    let control = Control::new();
    let counters = Arc::new(Counters::default());
    let pool = WorkerPool::start(&config, Arc::clone(&control));
    let listener =
        Listener::spawn(&config, Arc::clone(&pool), Arc::clone(&counters), Arc::clone(&control))
            .unwrap();

    let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
    for _ in 0..50 {
        tx.send_to(b"burst", listener.local_addr()).unwrap();
    }
    wait_for("burst fully classified", || {
        let snap = counters.snapshot();
        snap.received_count + snap.dropped_count == 50
    });
    let snap = counters.snapshot();
    assert!(snap.received_count < 50, "token bucket never kicked in");
    assert!(snap.received_count > 0);

    listener.stop().unwrap();
    pool.shutdown();
}
