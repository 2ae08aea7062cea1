mod common;

use std::{io::Write, net::{TcpStream, UdpSocket}, sync::Arc, time::Duration};

use common::wait_for;
use fanout::{config::Config, control::Control, listener::Listener, pool::WorkerPool};
use fanout_communication::Counters;

struct Rig {
    dest: UdpSocket,
    control: Arc<Control>,
    counters: Arc<Counters>,
    pool: Arc<WorkerPool>,
    listener: Listener,
}

fn rig() -> Rig {
    let dest = UdpSocket::bind("127.0.0.1:0").unwrap();
    dest.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let config = Config::from_args([
        "127.0.0.1:0/tcp".to_string(),
        format!("127.0.0.1:{}/udp", dest.local_addr().unwrap().port()),
    ])
    .unwrap();
    let control = Control::new();
    let counters = Arc::new(Counters::default());
    let pool = WorkerPool::start(&config, Arc::clone(&control));
    let listener =
        Listener::spawn(&config, Arc::clone(&pool), Arc::clone(&counters), Arc::clone(&control))
            .unwrap();
    Rig { dest, control: control.clone(), counters, pool, listener }
}

impl Rig {
    fn teardown(self) {
        self.listener.stop().unwrap();
        self.pool.shutdown();
        drop(self.control);
    }
}

#[test]
fn frames_reassembled_across_chunks() {
    let rig = rig();
    let mut stream = TcpStream::connect(rig.listener.local_addr()).unwrap();

    // Two frames in three arbitrary chunks, split mid-header and
    // mid-payload.
    let bytes = [0x02, 0x00, 0x00, 0x00, 0xAA, 0xBB, 0x01, 0x00, 0x00, 0x00, 0xCC];
    for chunk in [&bytes[..3], &bytes[3..9], &bytes[9..]] {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }

    let mut buf = [0u8; 64];
    let n = rig.dest.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0xAA, 0xBB]);
    let n = rig.dest.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0xCC]);

    wait_for("received counter", || rig.counters.snapshot().received_count == 2);
    rig.teardown();
}

#[test]
fn oversized_frame_tears_down_connection() {
    let rig = rig();
    let mut stream = TcpStream::connect(rig.listener.local_addr()).unwrap();
    wait_for("connection gauge up", || rig.counters.snapshot().tcp_connections == 1);

    // 65536 exceeds MAX_CHUNK_SIZE by one byte.
    stream.write_all(&[0x00, 0x00, 0x01, 0x00]).unwrap();
    wait_for("connection gauge down", || rig.counters.snapshot().tcp_connections == 0);

    assert_eq!(rig.counters.snapshot().received_count, 0);
    assert_eq!(rig.pool.aggregate().sent_count, 0);
    rig.teardown();
}

#[test]
fn stop_clears_connection_gauge() {
    let rig = rig();
    let _first = TcpStream::connect(rig.listener.local_addr()).unwrap();
    let _second = TcpStream::connect(rig.listener.local_addr()).unwrap();
    wait_for("gauge reflects live connections", || {
        rig.counters.snapshot().tcp_connections == 2
    });

    // Stopping the listener closes every client fd; the gauge must follow
    // even though the peers never hung up themselves.
    let counters = Arc::clone(&rig.counters);
    rig.teardown();
    assert_eq!(counters.snapshot().tcp_connections, 0);
}

#[test]
fn boundary_frame_relayed_to_tcp_destination() {
    use std::io::Read;

    // A 64 KiB payload cannot ride a UDP datagram, so the boundary case
    // gets a TCP destination; this also pins the outbound framing.
    let dest = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let config = Config::from_args([
        "127.0.0.1:0/tcp".to_string(),
        format!("127.0.0.1:{}/tcp", dest.local_addr().unwrap().port()),
    ])
    .unwrap();
    let control = Control::new();
    let counters = Arc::new(Counters::default());
    let pool = WorkerPool::start(&config, Arc::clone(&control));
    let listener =
        Listener::spawn(&config, Arc::clone(&pool), Arc::clone(&counters), Arc::clone(&control))
            .unwrap();

    let mut stream = TcpStream::connect(listener.local_addr()).unwrap();
    // Exactly MAX_CHUNK_SIZE is still a valid frame.
    let payload = vec![0x5A; 64 * 1024];
    stream.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
    stream.write_all(&payload).unwrap();

    let (mut conn, _) = dest.accept().unwrap();
    let mut header = [0u8; 4];
    conn.read_exact(&mut header).unwrap();
    assert_eq!(u32::from_le_bytes(header), payload.len() as u32);
    let mut relayed = vec![0u8; payload.len()];
    conn.read_exact(&mut relayed).unwrap();
    assert_eq!(relayed, payload);

    wait_for("counters settle", || {
        counters.snapshot().received_count == 1 && pool.aggregate().sent_count == 1
    });
    listener.stop().unwrap();
    pool.shutdown();
}
