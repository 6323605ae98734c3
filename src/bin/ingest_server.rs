//! Ingest Server
//!
//! Receiving end of the node's wire protocol. Nodes open a TCP socket and
//! write one base64 line per buffered frame; every frame that decodes and
//! passes its CRC is acknowledged with `$`, recorded once per
//! (ICCID, epoch) and appended to a JSON-lines file.
//!
//! Usage: cargo run --bin ingest-server -- --bind 0.0.0.0:12607

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_node::codec::{decode_line, Location, Plaintext, Reading};

const ACK: &[u8] = b"$";

/// Longest line accepted before the connection is dropped
const MAX_LINE_LEN: usize = 4096;

#[derive(Parser)]
#[command(name = "ingest-server")]
#[command(about = "Receives, verifies and stores telemetry frames from field nodes")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:12607")]
    bind: SocketAddr,

    /// JSON-lines file accepted frames are appended to
    #[arg(short, long, default_value = "ingest.jsonl")]
    output: PathBuf,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// One stored frame
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    received_at: chrono::DateTime<chrono::Utc>,
    peer: String,
    iccid: String,
    epoch: u64,
    location: Option<Location>,
    vars: Vec<i32>,
}

/// Outcome of one received line
#[derive(Debug, PartialEq, Eq)]
enum LineVerdict {
    New,
    Duplicate,
    Invalid,
}

struct Ingest {
    seen: HashSet<(String, u64)>,
    output: PathBuf,
}

impl Ingest {
    /// Seed the dedupe set from an existing output file
    async fn open(output: PathBuf) -> anyhow::Result<Self> {
        let mut seen = HashSet::new();
        match tokio::fs::read_to_string(&output).await {
            Ok(content) => {
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<Record>(line) {
                        Ok(record) => {
                            seen.insert((record.iccid, record.epoch));
                        }
                        Err(e) => warn!("Skipping unreadable record in {:?}: {}", output, e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to read {:?}: {}", output, e)),
        }
        info!("{} frame(s) already stored in {:?}", seen.len(), output);
        Ok(Self { seen, output })
    }

    async fn accept(&mut self, peer: SocketAddr, line: &str) -> LineVerdict {
        let reading = match decode_line(line, &Plaintext) {
            Ok(r) => r,
            Err(e) => {
                warn!("Invalid line from {}: {}", peer, e);
                debug!("  Raw line: {:?}", line);
                return LineVerdict::Invalid;
            }
        };

        let key = (reading.iccid.clone(), reading.epoch);
        if self.seen.contains(&key) {
            info!("Duplicate frame {} @ {} from {}", key.0, key.1, peer);
            return LineVerdict::Duplicate;
        }

        match append_record(&self.output, &record_for(peer, reading)).await {
            Ok(()) => {
                info!("Stored frame {} @ {} from {}", key.0, key.1, peer);
                self.seen.insert(key);
                LineVerdict::New
            }
            Err(e) => {
                error!("Failed to store frame from {}: {}", peer, e);
                LineVerdict::Invalid
            }
        }
    }
}

fn record_for(peer: SocketAddr, reading: Reading) -> Record {
    Record {
        received_at: chrono::Utc::now(),
        peer: peer.to_string(),
        iccid: reading.iccid,
        epoch: reading.epoch,
        location: reading.location,
        vars: reading.vars.to_vec(),
    }
}

async fn append_record(path: &Path, record: &Record) -> anyhow::Result<()> {
    let mut json = serde_json::to_vec(record)?;
    json.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&json).await?;
    file.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let ingest = Arc::new(Mutex::new(Ingest::open(cli.output.clone()).await?));
    let listener = TcpListener::bind(cli.bind).await?;
    info!("Ingest server listening on {}", cli.bind);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let ingest = ingest.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ingest).await {
                        warn!("Connection {} ended with error: {}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ingest: Arc<Mutex<Ingest>>,
) -> anyhow::Result<()> {
    info!("Node connected from {}", peer);
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut counts = (0usize, 0usize, 0usize);

    loop {
        if read_bounded_line(&mut reader, &mut line).await? == 0 {
            break;
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let verdict = ingest.lock().await.accept(peer, text).await;
        match verdict {
            LineVerdict::New => counts.0 += 1,
            LineVerdict::Duplicate => counts.1 += 1,
            LineVerdict::Invalid => {
                counts.2 += 1;
                continue;
            }
        }
        writer.write_all(ACK).await?;
        writer.flush().await?;
    }

    info!(
        "Node {} disconnected: {} new, {} duplicate, {} invalid",
        peer, counts.0, counts.1, counts.2
    );
    Ok(())
}

/// Read one line into `line`, stopping after `MAX_LINE_LEN` bytes so a
/// peer that never sends a newline cannot grow the buffer.
async fn read_bounded_line<R>(reader: &mut R, line: &mut String) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_line(line)
        .await?;
    if n > MAX_LINE_LEN {
        anyhow::bail!("line exceeds {} bytes", MAX_LINE_LEN);
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_node::codec::encode_line;

    fn reading(epoch: u64) -> Reading {
        Reading {
            iccid: "89520201234567890123".to_string(),
            epoch,
            location: None,
            vars: [1, 2, 3, 4, 5, 6, 7],
        }
    }

    fn temp_output(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("ingest-{}-{}.jsonl", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn peer() -> SocketAddr {
        "10.0.0.7:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_dedupe_on_iccid_and_epoch() {
        let output = temp_output("dedupe");
        let mut ingest = Ingest::open(output.clone()).await.unwrap();
        let line = encode_line(&reading(1_718_000_000), &Plaintext).unwrap();

        assert_eq!(ingest.accept(peer(), &line).await, LineVerdict::New);
        assert_eq!(ingest.accept(peer(), &line).await, LineVerdict::Duplicate);
        let other = encode_line(&reading(1_718_000_600), &Plaintext).unwrap();
        assert_eq!(ingest.accept(peer(), &other).await, LineVerdict::New);

        let stored = std::fs::read_to_string(&output).unwrap();
        assert_eq!(stored.lines().count(), 2);

        // a restarted server still knows what it stored
        let mut reopened = Ingest::open(output.clone()).await.unwrap();
        assert_eq!(reopened.accept(peer(), &line).await, LineVerdict::Duplicate);
        std::fs::remove_file(&output).unwrap();
    }

    #[tokio::test]
    async fn test_unterminated_line_stops_at_limit() {
        let flood = vec![b'A'; MAX_LINE_LEN * 4];
        let mut reader = BufReader::new(flood.as_slice());
        let mut line = String::new();
        assert!(read_bounded_line(&mut reader, &mut line).await.is_err());
        assert_eq!(line.len(), MAX_LINE_LEN + 1);

        let data = b"first\nsecond".to_vec();
        let mut reader = BufReader::new(data.as_slice());
        assert_eq!(read_bounded_line(&mut reader, &mut line).await.unwrap(), 6);
        assert_eq!(line, "first\n");
        assert_eq!(read_bounded_line(&mut reader, &mut line).await.unwrap(), 6);
        assert_eq!(line, "second");
        assert_eq!(read_bounded_line(&mut reader, &mut line).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_lines_rejected() {
        let output = temp_output("invalid");
        let mut ingest = Ingest::open(output.clone()).await.unwrap();
        assert_eq!(ingest.accept(peer(), "not base64!").await, LineVerdict::Invalid);
        assert_eq!(ingest.accept(peer(), "AAAA").await, LineVerdict::Invalid);
        assert!(!output.exists());
    }
}
