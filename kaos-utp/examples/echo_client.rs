//! uTP Echo Client Example
//!
//! Sends each stdin line to the echo server and prints the reply.
//!
//! Run: cargo run -p kaos-utp --example echo_client [addr]

use std::io::{BufRead, Read, Write};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:20001".to_string());
    let mut conn = kaos_utp::dial_timeout(addr.as_str(), Duration::from_secs(5))?;
    println!("connected: {}", conn);

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let start = Instant::now();
        conn.write_all(line.as_bytes())?;

        let mut reply = vec![0u8; line.len()];
        conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
        conn.read_exact(&mut reply)?;
        println!(
            "{} ({:.2} ms)",
            String::from_utf8_lossy(&reply),
            start.elapsed().as_secs_f64() * 1000.0
        );
    }

    conn.close()?;
    Ok(())
}
