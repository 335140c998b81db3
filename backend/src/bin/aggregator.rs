//! Per-node offline log aggregator CLI. Reads one or more request-log
//! files (plain NDJSON or `.bz2`-compressed), merges them through
//! `eidastats_backend::aggregator::Accumulator`, and writes a submission
//! envelope — optionally POSTing it straight to a running server.

use bzip2::read::BzDecoder;
use clap::Parser;
use eidastats_backend::aggregator::Accumulator;
use eidastats_backend::model::SubmissionEnvelope;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// Aggregate EIDA dataselect request logs into monthly per-SNCL-country
/// statistics ready for submission.
#[derive(Parser, Debug)]
#[command(name = "eidastats-aggregator", version)]
struct Cli {
    /// Request log files to aggregate (plain NDJSON or .bz2).
    files: Vec<PathBuf>,

    /// File to write the resulting submission envelope to.
    #[arg(long, default_value = "output_statistics.json")]
    output_file: PathBuf,

    /// Your EIDA node name, carried through into logs for operators'
    /// existing invocation scripts; not validated against a fixed choice
    /// list here since node identity is a runtime/DB concept, not a
    /// compile-time enum.
    #[arg(long, env = "EIDA_NODE", default_value = "other")]
    eida_node: String,

    /// Accepted for compatibility with existing node-operator invocation
    /// scripts. Client-id hashing is unsalted, so this flag is a
    /// documented no-op.
    #[arg(long, env = "EIDA_SALT", default_value = "pepper2021")]
    salt: String,

    /// If given with --token, POST the envelope directly to this server's
    /// /submit endpoint instead of (or in addition to) writing a file.
    #[arg(long)]
    submit_url: Option<String>,

    /// Bearer token for --submit-url.
    #[arg(long)]
    token: Option<String>,

    /// HTTP method used for direct submission: POST (merge) or PUT
    /// (replace).
    #[arg(long, default_value = "POST")]
    method: String,
}

fn open_reader(path: &PathBuf) -> std::io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    if path.extension().and_then(|e| e.to_str()) == Some("bz2") {
        Ok(Box::new(BufReader::new(BzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn run() -> Result<(), ExitCode> {
    let cli = Cli::parse();
    let _ = &cli.salt; // accepted, intentionally unused (see doc comment above)

    if cli.files.is_empty() {
        error!("no input files given");
        return Err(ExitCode::from(1));
    }

    let mut merged = Accumulator::new();
    for path in &cli.files {
        let mut acc = Accumulator::new();
        let reader = open_reader(path).map_err(|err| {
            error!(?path, error = %err, "could not read input file");
            ExitCode::from(2)
        })?;
        let lines = acc.process_reader(reader);
        info!(?path, lines, buckets = acc.len(), "aggregated file");
        merged.merge_from(acc);
    }

    info!(node = %cli.eida_node, buckets = merged.len(), "aggregation complete");

    let envelope = SubmissionEnvelope {
        version: env!("CARGO_PKG_VERSION").to_string(),
        generated_at: chrono::Utc::now(),
        days_coverage: vec![],
        stats: merged.into_submission_stats(),
    };

    let json = serde_json::to_string_pretty(&envelope).map_err(|err| {
        error!(error = %err, "could not serialize submission envelope");
        ExitCode::from(1)
    })?;
    std::fs::write(&cli.output_file, &json).map_err(|err| {
        error!(path = ?cli.output_file, error = %err, "could not write output file");
        ExitCode::from(2)
    })?;
    info!(path = ?cli.output_file, "wrote submission envelope");

    if let (Some(url), Some(token)) = (&cli.submit_url, &cli.token) {
        let client = reqwest::blocking::Client::new();
        let request = match cli.method.to_uppercase().as_str() {
            "PUT" => client.put(url),
            _ => client.post(url),
        };
        let response = request
            .header("Authentication", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(json)
            .send()
            .map_err(|err| {
                error!(error = %err, "submission request failed");
                ExitCode::from(2)
            })?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "server rejected submission");
            return Err(ExitCode::from(1));
        }
        info!(status = %response.status(), "submission accepted");
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "eidastats_aggregator=info".into()))
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}
