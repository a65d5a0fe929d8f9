//! Example: replay a recorded session through the engine and print confirmations.
//!
//! Reads newline-delimited JSON commands from a file (or stdin) and prints one-line JSON per
//! confirmed trigger. Blocks use the JSON-RPC header shape (`number`, `hash`, `parentHash`).
//!
//! Usage:
//!
//!   cargo run -p subscriber --example replay -- --input session.ndjson --history 128
//!
//! Commands, one per line:
//!   {"op":"add_job","job":{...},"block":{...}}       block is optional (job start = block + 1)
//!   {"op":"remove_job","id":"job-1"}
//!   {"op":"trigger","job":"job-1","initiator":0,"log_index":3,"block":{...}}
//!   {"op":"connected","block":{...}}
//!   {"op":"new_head","block":{...}}
//!   {"op":"disconnected"}

use anyhow::{Context, Result};
use serde_json::Value;
use std::io::BufRead;
use subscriber::{decode_job_spec, decode_rpc_header, Engine, JobId, OverflowPolicy, TriggerEvent};

async fn apply(engine: &Engine, line: &Value) -> Result<()> {
    let op = line
        .get("op")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Missing op"))?;
    let block = || -> Result<_> {
        decode_rpc_header(line.get("block").ok_or_else(|| anyhow::anyhow!("Missing block"))?)
    };
    match op {
        "add_job" => {
            let spec = decode_job_spec(line.get("job").ok_or_else(|| anyhow::anyhow!("Missing job"))?)?;
            let at = match line.get("block") {
                Some(b) => Some(decode_rpc_header(b)?),
                None => None,
            };
            engine.add_job(spec, at.as_ref()).await?;
        }
        "remove_job" => {
            let id = line
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("Missing id"))?;
            engine.remove_job(&JobId::from(id)).await?;
        }
        "trigger" => {
            let job = line
                .get("job")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("Missing job"))?;
            let status = engine
                .report_trigger(TriggerEvent {
                    job_id: JobId::from(job),
                    initiator: line.get("initiator").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                    head: block()?,
                    log_index: line.get("log_index").and_then(|v| v.as_u64()).unwrap_or(0),
                })
                .await?;
            tracing::debug!(?status, "trigger reported");
        }
        "connected" => engine.connect(block()?).await?,
        "new_head" => engine.on_new_longest_chain(block()?).await,
        "disconnected" => engine.disconnect().await,
        other => anyhow::bail!("Unknown op {}", other),
    }
    Ok(())
}

const USAGE: &str = "Usage: replay --history N [--input <path>] [--capacity N] [--reject-newest]";

#[derive(Debug, PartialEq)]
struct Options {
    input: String,
    history: u64,
    capacity: usize,
    overflow: OverflowPolicy,
}

/// Parses command-line flags. `Ok(None)` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut input = String::new();
    let mut history: Option<u64> = None;
    let mut capacity: usize = 256;
    let mut overflow = OverflowPolicy::DropOldest;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--input" => {
                i += 1;
                input = args.get(i).cloned().unwrap_or_default();
            }
            "--history" => {
                i += 1;
                let s = args.get(i).context("--history needs a value")?;
                history = Some(s.parse().context("parse --history")?);
            }
            "--capacity" => {
                i += 1;
                let s = args.get(i).context("--capacity needs a value")?;
                capacity = s.parse().context("parse --capacity")?;
            }
            "--reject-newest" => overflow = OverflowPolicy::RejectNewest,
            "--help" | "-h" => return Ok(None),
            _ => {}
        }
        i += 1;
    }
    let history = history.with_context(|| format!("--history is required\n{}", USAGE))?;
    Ok(Some(Options {
        input,
        history,
        capacity,
        overflow,
    }))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();
    let Some(options) = parse_args(&args)? else {
        eprintln!(
            "{}\n\
             Replays NDJSON chain/job commands and prints one-line JSON per confirmation.\n\
             --input     Command file. Default: stdin.\n\
             --history   Heads of history kept below the tip (deepest expected reorg). Required.\n\
             --capacity  Confirmation queue capacity. Default: 256.",
            USAGE
        );
        return Ok(());
    };
    let Options {
        input,
        history,
        capacity,
        overflow,
    } = options;

    let reader: Box<dyn BufRead> = if input.is_empty() {
        Box::new(std::io::stdin().lock())
    } else {
        let file = std::fs::File::open(&input).with_context(|| format!("open {}", input))?;
        Box::new(std::io::BufReader::new(file))
    };

    let (engine, mut confirmations) = Engine::builder()
        .history_depth(history)
        .queue_capacity(capacity)
        .overflow(overflow)
        .build()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let printer = tokio::spawn(async move {
            while let Some(c) = confirmations.recv().await {
                match serde_json::to_string(&c) {
                    Ok(json) => println!("{}", json),
                    Err(e) => tracing::warn!(%e, "encode confirmation"),
                }
            }
        });

        for (n, line) in reader.lines().enumerate() {
            let line = line.context("read input")?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(line = n + 1, reason = %e, "skipping malformed line");
                    continue;
                }
            };
            if let Err(e) = apply(&engine, &value).await {
                tracing::warn!(line = n + 1, reason = %e, "command failed");
            }
        }

        let stats = engine.stats().await;
        tracing::info!(?stats, "replay finished");
        engine.stop().await?;
        printer.await.context("printer task")?;
        Ok::<(), anyhow::Error>(())
    })
}
