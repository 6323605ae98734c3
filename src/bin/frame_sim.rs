//! Field Node Simulator
//!
//! Builds telemetry frames the way a node does and pushes them to an ingest
//! server over plain TCP. Useful for testing without a modem.
//!
//! Usage: cargo run --bin frame-sim -- --server 127.0.0.1:12607

use clap::Parser;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};

use telemetry_node::codec::{encode_line, Location, Plaintext, Reading};

#[derive(Parser)]
#[command(name = "frame-sim")]
#[command(about = "Sends simulated node frames to an ingest server")]
#[command(version)]
struct Cli {
    /// Ingest server address
    #[arg(short, long, default_value = "127.0.0.1:12607")]
    server: SocketAddr,

    /// ICCID reported by the simulated node
    #[arg(long, default_value = "89520201234567890123")]
    iccid: String,

    /// Seconds to wait for each acknowledgement
    #[arg(long, default_value_t = 2)]
    ack_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let now = chrono::Utc::now().timestamp().max(0) as u64;

    println!("Telemetry frame simulator");
    println!("  Target: {}", cli.server);
    println!("  ICCID:  {}", cli.iccid);
    println!();

    let located = Reading {
        iccid: cli.iccid.clone(),
        epoch: now,
        location: Some(Location {
            lat: 20.676667,
            lng: -103.3475,
            alt: 1566.0,
        }),
        vars: [2215, 4830, 1013, 350, 0, 0, 0],
    };
    let no_fix = Reading {
        epoch: now + 600,
        location: None,
        vars: [2198, 5012, 1011, -45, 0, 0, 0],
        ..located.clone()
    };

    let scenarios: Vec<(&str, String, bool)> = vec![
        ("Frame with GPS fix", encode_line(&located, &Plaintext)?, true),
        ("Frame without fix (zero-filled)", encode_line(&no_fix, &Plaintext)?, true),
        ("Retransmission of the first frame", encode_line(&located, &Plaintext)?, true),
        ("Corrupted line", corrupt(&encode_line(&located, &Plaintext)?), false),
    ];

    let mut stream = TcpStream::connect(cli.server).await?;
    let wait = Duration::from_secs(cli.ack_timeout);
    let mut failures = 0;

    for (desc, line, expect_ack) in &scenarios {
        println!("Sending: {}", desc);
        println!("   Line: {}", line);
        stream.write_all(format!("{}\n", line).as_bytes()).await?;

        let mut ack = [0u8; 16];
        let acked = match timeout(wait, stream.read(&mut ack)).await {
            Ok(Ok(n)) => n > 0 && ack[..n].contains(&b'$'),
            Ok(Err(e)) => {
                println!("   Recv error: {}", e);
                false
            }
            Err(_) => false,
        };
        match (acked, *expect_ack) {
            (true, true) => println!("   Acknowledged"),
            (false, false) => println!("   Rejected as expected"),
            (true, false) => {
                println!("   Unexpected acknowledgement");
                failures += 1;
            }
            (false, true) => {
                println!("   No acknowledgement");
                failures += 1;
            }
        }
        println!();

        sleep(Duration::from_millis(500)).await;
    }

    if failures > 0 {
        anyhow::bail!("{} scenario(s) did not behave as expected", failures);
    }
    println!("Simulation complete");
    Ok(())
}

/// Flip one base64 character so the CRC no longer matches
fn corrupt(line: &str) -> String {
    let mut chars: Vec<char> = line.chars().collect();
    let mid = chars.len() / 2;
    chars[mid] = if chars[mid] == 'A' { 'B' } else { 'A' };
    chars.into_iter().collect()
}
