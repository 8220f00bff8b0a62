//! uTP Echo Server Example
//!
//! Run: RUST_LOG=kaos_utp=debug cargo run -p kaos-utp --example echo_server [addr]

use kaos_utp::Socket;
use std::io::{Read, Write};
use std::thread;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:20001".to_string());
    let socket = Socket::bind(addr.as_str())?;

    println!("uTP Echo Server");
    println!("===============");
    println!("Listening on: {}", socket.local_addr());
    println!();

    loop {
        let mut conn = socket.accept()?;
        println!("accepted {}", conn);
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match conn.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = conn.write_all(&buf[..n]) {
                            eprintln!("{}: write failed: {}", conn, e);
                            return;
                        }
                    }
                    Err(e) => {
                        eprintln!("{}: read failed: {}", conn, e);
                        return;
                    }
                }
            }
            if let Err(e) = conn.close() {
                eprintln!("{}: close failed: {}", conn, e);
            }
            println!("closed {}", conn);
        });
    }
}
