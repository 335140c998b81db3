//! Submission load test tool for the EIDA dataselect statistics service:
//! a rate-paced send loop posting synthetic, schema-valid
//! `SubmissionEnvelope` JSON bodies to `/submit` with a bearer token,
//! tracking throughput with atomic counters and a periodic progress line.

use chrono::{Datelike, NaiveDate, Utc};
use clap::Parser;
use eidastats_backend::hll::Hll;
use eidastats_backend::model::{SubmissionEnvelope, SubmissionStat};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "eidastats-loadtest")]
#[command(about = "Load test tool for the EIDA dataselect statistics /submit endpoint")]
struct Args {
    /// Server base URL (no trailing slash).
    #[arg(long, default_value = "http://localhost:8080")]
    url: String,

    /// Route prefix the server was configured with (EIDASTATS_PREFIX).
    #[arg(long, default_value = "")]
    prefix: String,

    /// Bearer token to authenticate submissions with.
    #[arg(long)]
    token: String,

    /// Submissions per second.
    #[arg(long, default_value_t = 5)]
    rate: u32,

    /// Duration in seconds.
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Number of distinct synthetic networks to spread stats across.
    #[arg(long, default_value_t = 4)]
    networks: usize,

    /// Number of SNCL buckets per envelope.
    #[arg(long, default_value_t = 10)]
    stats_per_envelope: usize,

    /// HTTP method to submit with: POST (merge) or PUT (replace).
    #[arg(long, default_value = "POST")]
    method: String,
}

struct Counters {
    sent: AtomicU64,
    accepted: AtomicU64,
    duplicate: AtomicU64,
    rejected: AtomicU64,
    network_error: AtomicU64,
    latency_sum_us: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            duplicate: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            network_error: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
        }
    }
}

const NETWORK_CODES: &[&str] = &["XX", "YY", "ZZ", "AA", "BB", "CC", "DD", "EE"];
const COUNTRY_CODES: &[&str] = &["GR", "FR", "DE", "IT", "US", "GB"];

/// Build one distinct HLL sketch per call, seeded with a handful of
/// synthetic client hashes, so successive submissions union to a plausible
/// cardinality instead of all resolving to the same single-client sketch.
fn synthetic_clients_sketch(rng: &mut impl Rng, tick: u64) -> String {
    let mut hll = Hll::new();
    let clients = rng.gen_range(1..200u64);
    for i in 0..clients {
        hll.add(tick.wrapping_mul(2_654_435_761).wrapping_add(i));
    }
    eidastats_backend::hll::to_hex_wire(&hll.to_bytes())
}

fn build_envelope(
    rng: &mut impl Rng,
    tick: u64,
    networks: usize,
    stats_per_envelope: usize,
    month: NaiveDate,
) -> SubmissionEnvelope {
    let stats = (0..stats_per_envelope)
        .map(|i| {
            let network = NETWORK_CODES[(tick as usize + i) % networks.max(1)].to_string();
            let nb_successful: i64 = rng.gen_range(10..10_000);
            let nb_failed: i64 = rng.gen_range(0..50);
            SubmissionStat {
                month,
                network,
                station: format!("STA{:02}", i % 20),
                location: "00".to_string(),
                channel: "HHZ".to_string(),
                country: Some(COUNTRY_CODES[i % COUNTRY_CODES.len()].to_string()),
                bytes: rng.gen_range(1_000..50_000_000),
                nb_requests: Some(nb_successful + nb_failed),
                nb_successful_requests: nb_successful,
                nb_unsuccessful_requests: Some(nb_failed),
                clients: synthetic_clients_sketch(rng, tick * 1000 + i as u64),
            }
        })
        .collect();

    SubmissionEnvelope {
        version: "1.0.0-loadtest".to_string(),
        generated_at: Utc::now(),
        days_coverage: vec![month],
        stats,
    }
}

fn main() {
    let args = Args::parse();

    println!("=== EIDA Dataselect Stats Load Test ===");
    let submit_url = format!("{}{}/submit", args.url, args.prefix);
    println!("Target:   {submit_url}");
    println!("Method:   {}", args.method);
    println!("Rate:     {} envelopes/s", args.rate);
    println!("Duration: {}s", args.duration);
    println!("Networks: {}", args.networks);
    println!();

    let health_url = format!("{}{}/_health", args.url, args.prefix);
    match reqwest::blocking::get(&health_url) {
        Ok(r) if r.status().is_success() => println!("Server health: OK"),
        Ok(r) => {
            eprintln!("Server health check failed: {}", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Cannot reach server: {e}");
            std::process::exit(1);
        }
    }

    let counters = Arc::new(Counters::new());
    let interval = Duration::from_micros(1_000_000 / args.rate.max(1) as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let month = Utc::now().date_naive().with_day(1).expect("day 1 is always valid");

    println!("\nSending...\n");
    let start = Instant::now();

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("client builds with a static config");

    let mut rng = rand::thread_rng();
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let envelope = build_envelope(&mut rng, tick, args.networks, args.stats_per_envelope, month);
        let body = serde_json::to_vec(&envelope).expect("envelope serializes");

        let req_start = Instant::now();
        counters.sent.fetch_add(1, Ordering::Relaxed);

        let request = match args.method.to_uppercase().as_str() {
            "PUT" => client.put(&submit_url),
            _ => client.post(&submit_url),
        };

        match request
            .header("Authentication", format!("Bearer {}", args.token))
            .header("content-type", "application/json")
            .body(body)
            .send()
        {
            Ok(resp) => {
                let latency = req_start.elapsed().as_micros() as u64;
                counters.latency_sum_us.fetch_add(latency, Ordering::Relaxed);

                match resp.status().as_u16() {
                    200 => {
                        counters.accepted.fetch_add(1, Ordering::Relaxed);
                    }
                    // 400 also covers duplicate-submission rejections (same
                    // status class as other validation failures).
                    400 => {
                        counters.duplicate.fetch_add(1, Ordering::Relaxed);
                    }
                    other => {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        if tick < 5 {
                            eprintln!("Unexpected status: {other}");
                        }
                    }
                }
            }
            Err(_) => {
                counters.network_error.fetch_add(1, Ordering::Relaxed);
            }
        }

        tick += 1;

        if tick % 50 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let sent = counters.sent.load(Ordering::Relaxed);
            println!(
                "  [{:.1}s] sent={} accepted={} duplicate={} rejected={} err={} ({:.1} env/s)",
                elapsed,
                sent,
                counters.accepted.load(Ordering::Relaxed),
                counters.duplicate.load(Ordering::Relaxed),
                counters.rejected.load(Ordering::Relaxed),
                counters.network_error.load(Ordering::Relaxed),
                sent as f64 / elapsed,
            );
        }

        let target = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual = start.elapsed();
        if actual < target {
            std::thread::sleep(target - actual);
        }
    }

    let elapsed = start.elapsed();
    let sent = counters.sent.load(Ordering::Relaxed);
    let accepted = counters.accepted.load(Ordering::Relaxed);
    let avg_lat = if sent > 0 {
        counters.latency_sum_us.load(Ordering::Relaxed) / sent
    } else {
        0
    };

    println!("\n=== Results ===");
    println!("Duration:     {:.2}s", elapsed.as_secs_f64());
    println!("Total sent:   {sent}");
    println!(
        "Accepted:     {} ({:.1}%)",
        accepted,
        accepted as f64 / sent.max(1) as f64 * 100.0
    );
    println!("Duplicate:    {}", counters.duplicate.load(Ordering::Relaxed));
    println!("Rejected:     {}", counters.rejected.load(Ordering::Relaxed));
    println!("Net errors:   {}", counters.network_error.load(Ordering::Relaxed));
    println!("Avg latency:  {avg_lat} us");
    println!("Throughput:   {:.1} env/s", sent as f64 / elapsed.as_secs_f64());
}
