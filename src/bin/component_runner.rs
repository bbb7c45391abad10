//! component-runner：从 YAML 组件清单运行变更订阅绑定或对话组件的命令行工具
//!
//! Usage:
//!   component-runner read <manifest> [--limit <n>]     Stream change events as JSON lines
//!   component-runner converse <manifest> <message>...  Send one message and print the reply
//!   component-runner metadata <component-type>         Print recognised metadata fields

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use component_contrib::bindings::statechange::StateChangeBinding;
use component_contrib::bindings::{InputBinding, ReadResponse};
use component_contrib::conversation::mistral::Mistral;
use component_contrib::conversation::{Conversation, ConversationInput, ConversationRequest};
use component_contrib::metadata::{ComponentManifest, MetadataMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const STATECHANGE_TYPE: &str = "bindings.rethinkdb.statechange";
const MISTRAL_TYPE: &str = "conversation.mistral";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "read" => cmd_read(&args[2..]).await,
        "converse" => cmd_converse(&args[2..]).await,
        "metadata" => cmd_metadata(&args[2..]),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"component-runner: run integration components from YAML manifests

USAGE:
    component-runner <COMMAND> [OPTIONS]

COMMANDS:
    read <manifest> [--limit <n>]       Stream change events as JSON lines until Ctrl-C
    converse <manifest> <message>...    Send one user message and print the reply
    metadata <component-type>           Print recognised metadata fields as JSON
    help                                Show this help message

COMPONENT TYPES:
    {STATECHANGE_TYPE}
    {MISTRAL_TYPE}

ENVIRONMENT:
    RUST_LOG                                Log filter (default: info)
    CONVERSATION_DEFAULT_MODEL_MISTRAL      Default Mistral model
    CONTRIB_HTTP_TIMEOUT_SECS               HTTP timeout for model clients"#
    );
}

async fn load_manifest(path: &str, expected_type: &str) -> Result<ComponentManifest> {
    let manifest = ComponentManifest::from_path(path)
        .await
        .with_context(|| format!("failed to load manifest {}", path))?;
    if manifest.component_type() != expected_type {
        bail!(
            "manifest {} declares type '{}', expected '{}'",
            path,
            manifest.component_type(),
            expected_type
        );
    }
    Ok(manifest)
}

fn parse_limit(args: &[String]) -> Result<Option<u64>> {
    match args.iter().position(|a| a == "--limit") {
        None => Ok(None),
        Some(i) => {
            let raw = args.get(i + 1).context("--limit needs a value")?;
            let limit = raw
                .parse::<u64>()
                .with_context(|| format!("invalid --limit '{}'", raw))?;
            Ok(Some(limit))
        }
    }
}

async fn cmd_read(args: &[String]) -> Result<()> {
    let path = args.first().context("read needs a manifest path")?;
    let limit = parse_limit(&args[1..])?;
    let manifest = load_manifest(path, STATECHANGE_TYPE).await?;

    let binding = StateChangeBinding::new();
    binding.init(&manifest.properties()?).await?;

    let cancel = CancellationToken::new();
    let seen = Arc::new(AtomicU64::new(0));
    let stop = cancel.clone();
    let sink = move |event: ReadResponse| {
        let line = serde_json::json!({
            "data": String::from_utf8_lossy(&event.data),
            "metadata": event.metadata,
        });
        println!("{}", line);
        let count = seen.fetch_add(1, Ordering::SeqCst) + 1;
        if limit.is_some_and(|l| count >= l) {
            stop.cancel();
        }
        futures::future::ready(Ok::<Option<Bytes>, component_contrib::Error>(None))
    };

    let subscription = binding.read(cancel.clone(), Arc::new(sink)).await?;
    info!(component = manifest.name(), subscription = %subscription.id(), "reading change feed");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => cancel.cancel(),
        _ = subscription.stopped() => {}
    }
    let reason = subscription.stopped().await;
    binding.close().await?;
    info!(reason = ?reason, delivered = subscription.delivered(), "change feed stopped");

    if reason.is_failure() {
        bail!("change feed failed: {:?}", reason);
    }
    Ok(())
}

async fn cmd_converse(args: &[String]) -> Result<()> {
    let path = args.first().context("converse needs a manifest path")?;
    if args.len() < 2 {
        bail!("converse needs a message");
    }
    let message = args[1..].join(" ");
    let manifest = load_manifest(path, MISTRAL_TYPE).await?;

    let mut mistral = Mistral::new();
    mistral.init(&manifest.properties()?).await?;
    let response = mistral
        .converse(ConversationRequest::new([ConversationInput::new(message)]))
        .await?;
    for output in &response.outputs {
        println!("{}", output.result);
    }
    mistral.close().await?;
    Ok(())
}

fn cmd_metadata(args: &[String]) -> Result<()> {
    let component_type = args.first().context("metadata needs a component type")?;
    let metadata: MetadataMap = match component_type.as_str() {
        STATECHANGE_TYPE => StateChangeBinding::new().component_metadata(),
        MISTRAL_TYPE => Mistral::new().component_metadata(),
        other => bail!("unknown component type '{}'", other),
    };
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}
