//! End-to-end throughput benchmark for Relay.
//!
//! Connects chat clients to a running server and counts the messages they
//! receive back. Every client sends, and every client receives every message.

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{decode, EnvelopeType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:8000/";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

/// Pause between sends so the relay's store keeps up.
const SEND_INTERVAL: Duration = Duration::from_millis(5);

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("Relay End-to-End Throughput Benchmark");
    println!("Make sure the server is running: cargo run --release --bin relay");
    println!();

    run_chat_benchmark(num_clients, url).await;
}

async fn run_chat_benchmark(num_clients: usize, url: String) {
    println!("Chat benchmark: {} clients against {}", num_clients, url);
    println!("  Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let received = Arc::clone(&received);
        let barrier = Arc::clone(&barrier);
        let url = url.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &url, received, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("All {} clients connected", num_clients);

    println!("Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    received.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = received.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("RESULTS");
    println!("  Clients:         {:>10}", num_clients);
    println!("  Duration:        {:>10.2}s", elapsed.as_secs_f64());
    println!("  Deliveries:      {:>10}", total);
    println!("  Throughput:      {:>10.0} msg/s", per_sec);
    println!("  Per-Client:      {:>10.0} msg/s", per_sec / num_clients as f64);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    // History always arrives first
    if let Some(frame) = receiver.next().await {
        frame?;
    }

    barrier.wait().await;

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            if let Message::Text(text) = frame {
                let is_live = decode(&text)
                    .map(|envelope| envelope.envelope_type() == EnvelopeType::Message)
                    .unwrap_or(false);
                if is_live {
                    received.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    let username = format!("bench-{}", client_id);
    let mut seq = 0u64;
    loop {
        let text = serde_json::json!({ "username": username, "text": format!("msg {}", seq) });
        seq += 1;
        if sender.send(Message::Text(text.to_string())).await.is_err() {
            break;
        }
        tokio::time::sleep(SEND_INTERVAL).await;
    }

    recv_task.abort();
    Ok(())
}
