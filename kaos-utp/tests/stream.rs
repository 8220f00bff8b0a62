//! End-to-end stream tests over loopback UDP.

mod common;

use common::{lossy_socket, read_to_end, socket};
use kaos_test_support::{pattern, ChaosMonkey, LossGenerator, StreamVerifier, VerifyResult};
use kaos_utp::MAX_PAYLOAD;
use std::io::{Read, Write};
use std::thread;

/// Accepts one Conn and checks everything read from it against the
/// test pattern until EOF.
fn spawn_verifying_server(server: kaos_utp::Socket, len: usize) -> thread::JoinHandle<StreamVerifier> {
    thread::spawn(move || {
        let conn = server.accept().unwrap();
        let verifier = StreamVerifier::new(len);
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = conn.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            assert_eq!(verifier.feed(&buf[..n]), VerifyResult::Ok);
        }
        conn.close().unwrap();
        verifier
    })
}

#[test]
fn echo_ping_pong() {
    let server = socket();
    let addr = server.local_addr();
    let echo = thread::spawn(move || {
        let conn = server.accept().unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        conn.write(b"pong").unwrap();
        conn.close().unwrap();
    });

    let client = socket();
    let conn = client.dial(addr).unwrap();
    assert_eq!(conn.peer_addr(), addr);
    assert_eq!(conn.write(b"ping").unwrap(), 4);
    let mut buf = [0u8; 16];
    let n = conn.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(conn.read(&mut buf).unwrap(), 0, "expected EOF after peer FIN");
    conn.close().unwrap();
    echo.join().unwrap();
}

#[test]
fn bulk_transfer_is_ordered_and_complete() {
    const LEN: usize = 2 * 1024 * 1024;
    let server = socket();
    let addr = server.local_addr();
    let receiver = spawn_verifying_server(server, LEN);

    let client = socket();
    let conn = client.dial(addr).unwrap();
    let data = pattern(LEN);
    assert_eq!(conn.write(&data).unwrap(), LEN);
    conn.close().unwrap();

    let verifier = receiver.join().unwrap();
    assert!(verifier.is_complete(), "{:?}", verifier.stats());
    // Every DATA packet is full-sized except the last.
    assert!(client.stats().packets_sent as usize >= LEN / MAX_PAYLOAD);
}

#[test]
fn writes_split_at_max_payload() {
    let server = socket();
    let addr = server.local_addr();
    let receiver = thread::spawn(move || {
        let conn = server.accept().unwrap();
        read_to_end(&conn, usize::MAX).unwrap()
    });

    let client = socket();
    let conn = client.dial(addr).unwrap();
    let data = pattern(MAX_PAYLOAD * 3 + 1);
    conn.write(&data).unwrap();
    conn.close().unwrap();
    assert_eq!(receiver.join().unwrap(), data);
}

#[test]
fn small_odd_reads_reassemble_segments() {
    const READS: [usize; 4] = [7, 1, 13, 3];
    let server = socket();
    let addr = server.local_addr();
    let receiver = thread::spawn(move || {
        let conn = server.accept().unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 13];
        for want in READS.iter().cycle() {
            let n = conn.read(&mut buf[..*want]).unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= *want);
            out.extend_from_slice(&buf[..n]);
        }
        out
    });

    let client = socket();
    let conn = client.dial(addr).unwrap();
    let data = pattern(MAX_PAYLOAD * 4 + 5);
    assert_eq!(conn.write(&data).unwrap(), data.len());
    conn.close().unwrap();
    assert_eq!(receiver.join().unwrap(), data);
}

#[test]
fn std_io_traits_round_trip() {
    const MSG: &[u8] = b"hello over io::Write";
    let server = socket();
    let addr = server.local_addr();
    let echo = thread::spawn(move || {
        let mut conn = server.accept().unwrap();
        let mut line = [0u8; MSG.len()];
        conn.read_exact(&mut line).unwrap();
        conn.write_all(&line).unwrap();
        conn.close().unwrap();
    });

    let client = socket();
    let mut conn = client.dial(addr).unwrap();
    conn.write_all(MSG).unwrap();
    let mut back = Vec::new();
    (&conn).read_to_end(&mut back).unwrap();
    assert_eq!(back, MSG);
    conn.close().unwrap();
    echo.join().unwrap();
}

#[test]
fn write_after_peer_fin_is_closed() {
    let server = socket();
    let addr = server.local_addr();
    let closer = thread::spawn(move || {
        let conn = server.accept().unwrap();
        conn.close().unwrap();
    });

    let client = socket();
    let conn = client.dial(addr).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(conn.read(&mut buf).unwrap(), 0);
    assert!(matches!(conn.write(b"late"), Err(kaos_utp::UtpError::Closed)));
    closer.join().unwrap();
}

#[test]
fn many_conns_share_one_socket() {
    const CLIENTS: usize = 8;
    const MSG_LEN: usize = 1800;
    let server = socket();
    let addr = server.local_addr();
    let echo = thread::spawn(move || {
        let handles: Vec<_> = (0..CLIENTS)
            .map(|_| {
                let conn = server.accept().unwrap();
                thread::spawn(move || {
                    let got = read_to_end(&conn, MSG_LEN).unwrap();
                    conn.write(&got).unwrap();
                    conn.close().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    });

    let client = socket();
    let client = &client;
    thread::scope(|s| {
        for i in 0..CLIENTS {
            s.spawn(move || {
                let conn = client.dial(addr).unwrap();
                let msg = format!("client {i} says hi").repeat(100);
                assert_eq!(msg.len(), MSG_LEN);
                conn.write(msg.as_bytes()).unwrap();
                assert_eq!(read_to_end(&conn, usize::MAX).unwrap(), msg.as_bytes());
                conn.close().unwrap();
            });
        }
    });
    echo.join().unwrap();
}

#[test]
fn transfer_survives_loss_and_duplication() {
    const LEN: usize = 256 * 1024;
    let server = lossy_socket(
        LossGenerator::random(0.03).with_seed(11),
        ChaosMonkey::new().with_seed(12).with_duplicate_probability(0.03),
    );
    let addr = server.local_addr();
    let receiver = spawn_verifying_server(server, LEN);

    let client = lossy_socket(
        LossGenerator::random(0.05).with_seed(21),
        ChaosMonkey::new().with_seed(22).with_duplicate_probability(0.05),
    );
    let conn = client.dial(addr).unwrap();
    conn.write(&pattern(LEN)).unwrap();
    conn.close().unwrap();

    let verifier = receiver.join().unwrap();
    assert!(verifier.is_complete(), "{:?}", verifier.stats());
    let stats = client.stats();
    assert!(stats.timeout_resends + stats.fast_resends > 0);
}

#[test]
fn periodic_loss_triggers_fast_resend() {
    const LEN: usize = 512 * 1024;
    let server = socket();
    let addr = server.local_addr();
    let receiver = spawn_verifying_server(server, LEN);

    let client = lossy_socket(LossGenerator::periodic(50), ChaosMonkey::new());
    let conn = client.dial(addr).unwrap();
    conn.write(&pattern(LEN)).unwrap();
    conn.close().unwrap();

    assert!(receiver.join().unwrap().is_complete());
    assert!(client.stats().fast_resends > 0, "{:?}", client.stats());
}

#[test]
fn crate_level_dial_and_listen() {
    let server = kaos_utp::listen("127.0.0.1:0").unwrap();
    let addr = server.local_addr();
    let echo = thread::spawn(move || {
        let conn = server.accept().unwrap();
        let got = read_to_end(&conn, 10).unwrap();
        conn.write(&got).unwrap();
        conn.close().unwrap();
    });

    let conn = kaos_utp::dial(addr).unwrap();
    conn.write(b"standalone").unwrap();
    assert_eq!(read_to_end(&conn, usize::MAX).unwrap(), b"standalone");
    conn.close().unwrap();
    echo.join().unwrap();
}
