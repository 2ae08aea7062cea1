// Not every test binary uses every helper.
#![allow(dead_code)]

use std::time::Duration;

/// Polls `cond` for up to five seconds.
pub fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

/// A localhost TCP port with nothing listening behind it.
pub fn dead_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
