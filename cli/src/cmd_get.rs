//! `batchrpc get`: issue every id inside one scope, then print the results
//! and the backend calls the scope made.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use batchrpc_core::{BatchingConfig, ItemId, SingleRequest, Transport};
use batchrpc_exec::{ExecutionGroup, FlushMode, ScopeReport};
use batchrpc_http::{HttpTransport, HttpTransportConfig};

use crate::FlushArg;

const ALL_OPERATIONS: &str = "*.*/*.*";

#[derive(Args)]
pub(crate) struct GetArgs {
    /// Base URL of the REST service
    #[arg(long)]
    url: String,
    /// Resource to query, e.g. `greetings`
    #[arg(long)]
    resource: String,
    /// Item ids; integers are sent as numbers, anything else as strings
    #[arg(long, num_args = 1.., required = true)]
    ids: Vec<String>,
    /// Item-level method
    #[arg(long, default_value = "get")]
    method: String,
    /// Batch-compatible parameters as a JSON object
    #[arg(long)]
    params: Option<String>,
    /// Batching config JSON file (default: batch everything)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Cap on items per batch call; overrides the config's catch-all rule
    #[arg(long)]
    max_batch_size: Option<usize>,
    /// Issue every call on its own
    #[arg(long, conflicts_with = "config")]
    no_batch: bool,
    /// When full groups are sent
    #[arg(long, value_enum, default_value_t = FlushArg::Eager)]
    flush: FlushArg,
    /// HTTP request timeout in milliseconds
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,
    /// Print results as one JSON document
    #[arg(long)]
    json: bool,
}

pub(crate) async fn run(args: GetArgs) -> Result<()> {
    let config = batching_config(&args)?;
    let params: Value = match &args.params {
        Some(raw) => serde_json::from_str(raw).context("--params must be valid JSON")?,
        None => Value::Null,
    };

    let transport: Arc<dyn Transport> = Arc::new(
        HttpTransport::new(
            &args.url,
            HttpTransportConfig {
                request_timeout: Duration::from_millis(args.timeout_ms),
                ..Default::default()
            },
        )
        .context("building HTTP transport")?,
    );
    let group = ExecutionGroup::new(transport)
        .with_config(Arc::new(config))
        .with_flush_mode(match args.flush {
            FlushArg::Eager => FlushMode::Eager,
            FlushArg::OnClose => FlushMode::OnClose,
        });

    let ids: Vec<ItemId> = args.ids.iter().map(String::as_str).map(parse_id).collect();
    tracing::info!(resource = %args.resource, ids = ids.len(), "opening scope");

    let scope = group.open();
    let handles: Vec<_> = ids
        .iter()
        .map(|id| {
            let req = SingleRequest::with_params(
                args.resource.as_str(),
                args.method.as_str(),
                id.clone(),
                params.clone(),
            );
            (id.clone(), scope.call(req))
        })
        .collect();
    let closed = scope.close().await;

    let mut results = Vec::with_capacity(handles.len());
    for (id, handle) in handles {
        results.push((id, handle.await));
    }

    let report = match &closed {
        Ok(report) => report,
        Err(failure) => &failure.report,
    };
    if args.json {
        print_json(&results, report)?;
    } else {
        print_text(&results, report);
    }

    closed.map(|_| ()).context("scope flush failed")
}

fn batching_config(args: &GetArgs) -> Result<BatchingConfig> {
    let mut config = match &args.config {
        Some(path) => BatchingConfig::from_path(path)
            .with_context(|| format!("loading batching config from {}", path.display()))?,
        None => BatchingConfig::new().add_batching_enabled(ALL_OPERATIONS, !args.no_batch)?,
    };
    if let Some(max) = args.max_batch_size {
        config = config.add_max_batch_size(ALL_OPERATIONS, max)?;
    }
    Ok(config)
}

fn parse_id(raw: &str) -> ItemId {
    raw.parse::<i64>()
        .map(ItemId::from)
        .unwrap_or_else(|_| ItemId::from(raw))
}

type Outcome = Result<Value, batchrpc_core::CallError>;

fn print_text(results: &[(ItemId, Outcome)], report: &ScopeReport) {
    for (id, outcome) in results {
        match outcome {
            Ok(value) => println!("{id}: {value}"),
            Err(e) => println!("{id}: error: {e}"),
        }
    }
    println!();
    println!("Backend calls ({}):", report.transport_calls());
    for flush in &report.flushes {
        let status = match &flush.failure {
            Some(_) if flush.lost => "LOST".to_string(),
            Some(e) => format!("FAILED: {e}"),
            None => "ok".to_string(),
        };
        println!("  {}  [{status}]", flush.name);
    }
}

fn print_json(results: &[(ItemId, Outcome)], report: &ScopeReport) -> Result<()> {
    let items: Vec<Value> = results
        .iter()
        .map(|(id, outcome)| match outcome {
            Ok(value) => serde_json::json!({ "id": id, "value": value }),
            Err(e) => serde_json::json!({
                "id": id,
                "error": e.to_string(),
                "transport": e.is_transport(),
            }),
        })
        .collect();
    let calls: Vec<Value> = report
        .flushes
        .iter()
        .map(|f| {
            serde_json::json!({
                "name": f.name,
                "items": f.items,
                "batched": f.batched,
                "lost": f.lost,
                "error": f.failure.as_ref().map(|e| e.to_string()),
            })
        })
        .collect();
    let doc = serde_json::json!({ "results": items, "calls": calls });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchrpc_core::{BatchingConfigProvider, OperationTarget};
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        get: GetArgs,
    }

    fn parse(args: &[&str]) -> GetArgs {
        let argv = ["batchrpc"].iter().chain(args.iter());
        Harness::try_parse_from(argv).unwrap().get
    }

    #[test]
    fn ids_keep_their_kind() {
        assert_eq!(parse_id("42"), ItemId::Number(42));
        assert_eq!(parse_id("-1"), ItemId::Number(-1));
        assert_eq!(parse_id("abc"), ItemId::String("abc".into()));
    }

    #[test]
    fn defaults_batch_everything() {
        let args = parse(&["--url", "http://localhost", "--resource", "greetings", "--ids", "1", "2"]);
        let config = batching_config(&args).unwrap();
        let policy = config.policy(&OperationTarget::new("greetings", "get"));
        assert!(policy.enabled);
        assert_eq!(policy.max_batch_size, batchrpc_core::DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(args.ids, vec!["1", "2"]);
    }

    #[test]
    fn max_batch_size_and_no_batch() {
        let args = parse(&[
            "--url", "http://localhost", "--resource", "greetings", "--ids", "1",
            "--max-batch-size", "3", "--no-batch",
        ]);
        let config = batching_config(&args).unwrap();
        let policy = config.policy(&OperationTarget::new("greetings", "get"));
        assert!(!policy.enabled);
        assert_eq!(policy.max_batch_size, 3);
    }

    #[test]
    fn zero_max_batch_size_is_rejected() {
        let args = parse(&[
            "--url", "http://localhost", "--resource", "greetings", "--ids", "1",
            "--max-batch-size", "0",
        ]);
        assert!(batching_config(&args).is_err());
    }
}
