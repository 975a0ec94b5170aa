//! Inspect an agent transcript with the ballast guardrails.
//!
//! Loads a JSON array of messages, reports token usage against the
//! configured context window, replays tool calls through the cycle detector,
//! and scans assistant text for reasoning loops. With `--compact` it also
//! compacts the transcript the way a running agent would.
//!
//! # Examples
//!
//! ```sh
//! # Usage and loop report
//! ballast inspect session.json --context-size 128000
//!
//! # Compact with summarization (needs OPENROUTER_KEY)
//! ballast inspect session.json --compact --output compacted.json
//!
//! # Emergency truncation only, no model call
//! ballast inspect session.json --compact --emergency --json
//! ```

use ballast::context::CompactionOutcome;
use ballast::loops::{builtin_patterns, evaluate_patterns};
use ballast::prelude::*;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Runtime guardrails for tool-calling LLM agents.
#[derive(Parser)]
#[command(name = "ballast", version)]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report usage, tool cycles, and text loops for a transcript
    Inspect(InspectArgs),
}

#[derive(clap::Args)]
struct InspectArgs {
    /// Transcript file: a JSON array of messages
    transcript: PathBuf,

    // ── Configuration ──────────────────────────────────────────
    /// JSON config file (partial files keep defaults for the rest)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Context window size in tokens
    #[arg(long)]
    context_size: Option<usize>,

    /// Usage percentage that triggers compaction
    #[arg(long)]
    compact_threshold: Option<u8>,

    /// Usage percentage that forces truncation instead of summarization
    #[arg(long)]
    emergency_threshold: Option<u8>,

    /// Characters per token for the built-in estimator
    #[arg(long, default_value_t = ballast::context::DEFAULT_CHARS_PER_TOKEN)]
    chars_per_token: f64,

    // ── Compaction ─────────────────────────────────────────────
    /// Compact the transcript regardless of usage
    #[arg(long)]
    compact: bool,

    /// With --compact: never call the model, truncate instead
    #[arg(long, requires = "compact")]
    emergency: bool,

    /// Summarization model (with --compact)
    #[arg(long, default_value = ballast::api::openrouter::DEFAULT_MODEL)]
    model: String,

    /// Write the compacted transcript here (with --compact)
    #[arg(long, requires = "compact")]
    output: Option<PathBuf>,

    // ── Output ─────────────────────────────────────────────────
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

// ── Report ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Report {
    messages: usize,
    tokens: usize,
    context_size: usize,
    usage_percent: u8,
    remaining: usize,
    cycle_flags: Vec<CycleFlag>,
    text_loops: Vec<TextLoop>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compaction: Option<CompactionSummary>,
}

#[derive(Serialize)]
struct CycleFlag {
    message_index: usize,
    call_id: String,
    tool: String,
    kind: CycleKind,
    count: usize,
    advice: String,
}

#[derive(Serialize)]
struct TextLoop {
    message_index: usize,
    pattern: String,
    reason: String,
    match_count: usize,
}

#[derive(Serialize)]
struct CompactionSummary {
    strategy: CompactionStrategy,
    old_percent: u8,
    new_percent: u8,
    messages_before: usize,
    messages_after: usize,
    used_fallback: bool,
    file_references: Vec<String>,
}

/// Stand-in model client for `--emergency` or when no API key is set.
/// Every call fails, so a summarization attempt falls back to truncation.
struct OfflineClient;

impl ModelClient for OfflineClient {
    fn send<'a>(&'a self, _: &'a [Message], _: SendOptions) -> ModelFuture<'a> {
        Box::pin(async { ModelResponse::failed("no model client configured") })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Inspect(args) => inspect(args).await,
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(if e.is_fatal() { 2 } else { 1 });
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "ballast=debug" } else { "ballast=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(args: &InspectArgs) -> ballast::Result<GuardConfig> {
    let mut config = match &args.config {
        Some(path) => GuardConfig::from_json_file(path)?,
        None => GuardConfig::default(),
    };
    if let Some(size) = args.context_size {
        config = config.with_context_size(size);
    }
    if let Some(pct) = args.compact_threshold {
        config = config.with_compact_threshold(pct);
    }
    if let Some(pct) = args.emergency_threshold {
        config = config.with_emergency_threshold(pct);
    }
    config.validate()?;
    Ok(config)
}

async fn inspect(args: InspectArgs) -> ballast::Result<()> {
    let json = args.json;
    let report = build_report(args).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

async fn build_report(args: InspectArgs) -> ballast::Result<Report> {
    let config = load_config(&args)?;
    let raw = std::fs::read_to_string(&args.transcript)?;
    let messages: Vec<Message> = serde_json::from_str(&raw)?;

    let tokenizer: Arc<dyn Tokenizer> =
        Arc::new(CharRatioTokenizer::with_ratio(args.chars_per_token));
    let accountant = Arc::new(Mutex::new(TokenAccountant::new(
        tokenizer,
        config.compaction.context_size,
    )));
    let (tokens, usage_percent, remaining) = {
        let mut acc = accountant.lock().unwrap_or_else(|e| e.into_inner());
        let tokens = acc.total_cost(&messages);
        (tokens, acc.usage_percent(), acc.remaining())
    };

    let mut report = Report {
        messages: messages.len(),
        tokens,
        context_size: config.compaction.context_size,
        usage_percent,
        remaining,
        cycle_flags: replay_tool_calls(&messages, &config),
        text_loops: scan_text(&messages, &config),
        compaction: None,
    };

    if args.compact {
        let client: Arc<dyn ModelClient> = match std::env::var("OPENROUTER_KEY") {
            _ if args.emergency => Arc::new(OfflineClient),
            Ok(key) => Arc::new(OpenRouterClient::new(key)?.with_model(args.model.clone())),
            Err(_) => {
                tracing::warn!("OPENROUTER_KEY not set; falling back to truncation");
                Arc::new(OfflineClient)
            }
        };
        let compactor = ContextCompactor::new(config.compaction.clone(), accountant, client)
            .with_event_handler(Arc::new(LoggingHandler));
        let store = InMemoryConversation::new(messages);

        let outcome = if args.emergency {
            compactor.force_truncate(&store).await?
        } else {
            compactor.force_compact(&store).await?
        };
        match outcome {
            CompactionOutcome::Compacted(r) => {
                report.compaction = Some(CompactionSummary {
                    strategy: r.strategy,
                    old_percent: r.old_percent,
                    new_percent: r.new_percent,
                    messages_before: r.messages_before,
                    messages_after: r.messages_after,
                    used_fallback: r.used_fallback,
                    file_references: r.file_references,
                });
            }
            other => tracing::info!("compaction did not change the transcript: {other:?}"),
        }
        if let Some(path) = &args.output {
            std::fs::write(path, serde_json::to_string_pretty(&store.messages())?)?;
        }
    }

    Ok(report)
}

/// Feed every assistant tool batch through a fresh cycle detector, in
/// transcript order, the way the host would have.
fn replay_tool_calls(messages: &[Message], config: &GuardConfig) -> Vec<CycleFlag> {
    let outcomes: HashMap<String, ToolOutcome> = messages
        .iter()
        .filter_map(ToolOutcome::from_message)
        .map(|o| (o.call_id.clone(), o))
        .collect();

    let mut detector = ToolCycleDetector::new(config.cycles.clone());
    let mut flags = Vec::new();
    for (index, msg) in messages.iter().enumerate() {
        let calls = msg.calls();
        if calls.is_empty() {
            continue;
        }
        let batch: Vec<ToolOutcome> = calls
            .iter()
            .filter_map(|c| outcomes.get(c.id.as_str()).cloned())
            .collect();
        detector.record(calls, &batch);
        for (call_id, info) in detector.detect(calls) {
            flags.push(CycleFlag {
                message_index: index,
                call_id,
                tool: info.tool_name.clone(),
                kind: info.kind,
                count: info.count,
                advice: steering_message(&info),
            });
        }
        detector.clear_if_broken();
    }
    flags
}

/// Run the text-loop patterns over each assistant message once.
fn scan_text(messages: &[Message], config: &GuardConfig) -> Vec<TextLoop> {
    let patterns = builtin_patterns(&config.text_loops);
    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == MessageRole::Assistant && !m.text().trim().is_empty())
        .filter_map(|(index, m)| {
            evaluate_patterns(&patterns, m.text()).map(|d| TextLoop {
                message_index: index,
                pattern: d.pattern_name,
                reason: d.reason,
                match_count: d.match_count,
            })
        })
        .collect()
}

fn print_report(report: &Report) {
    println!(
        "{} messages, {} tokens of {} ({}% used, {} remaining)",
        report.messages, report.tokens, report.context_size, report.usage_percent, report.remaining
    );

    if report.cycle_flags.is_empty() {
        println!("No tool cycles.");
    } else {
        println!("\nTool cycles:");
        for f in &report.cycle_flags {
            println!(
                "  [{}] {} ({}): {} x{}",
                f.message_index, f.tool, f.call_id, f.kind, f.count
            );
            println!("      {}", f.advice);
        }
    }

    if report.text_loops.is_empty() {
        println!("No text loops.");
    } else {
        println!("\nText loops:");
        for t in &report.text_loops {
            println!("  [{}] {}: {}", t.message_index, t.pattern, t.reason);
        }
    }

    if let Some(c) = &report.compaction {
        println!(
            "\nCompacted ({:?}{}): {}% -> {}%, {} -> {} messages",
            c.strategy,
            if c.used_fallback { ", fallback" } else { "" },
            c.old_percent,
            c.new_percent,
            c.messages_before,
            c.messages_after
        );
        if !c.file_references.is_empty() {
            println!("  Files: {}", c.file_references.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::ffi::OsStr;
    use std::io::Write;

    fn grep_turn(id: &str) -> [Message; 2] {
        [
            Message::assistant_tool_calls(vec![ToolCall::from_value(
                id,
                "grep",
                &json!({"pattern": "fn main"}),
            )]),
            Message::tool_result(id, "src/main.rs:12: fn main() {"),
        ]
    }

    fn transcript() -> Vec<Message> {
        let mut messages = vec![
            Message::system("You are a coding agent."),
            Message::user("Find the entry point."),
        ];
        for id in ["c1", "c2", "c3"] {
            messages.extend(grep_turn(id));
        }
        messages
    }

    #[test]
    fn replay_flags_the_third_identical_search() {
        let flags = replay_tool_calls(&transcript(), &GuardConfig::default());
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].message_index, 6);
        assert_eq!(flags[0].call_id, "c3");
        assert_eq!(flags[0].kind, CycleKind::ExactDuplicate);
        assert_eq!(flags[0].count, 3);
    }

    #[test]
    fn scan_reports_looping_assistant_text() {
        let mut messages = transcript();
        messages.push(Message::assistant_text(
            "Let me reconsider this. Let me reconsider again.",
        ));
        let loops = scan_text(&messages, &GuardConfig::default());
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].message_index, 8);
        assert_eq!(loops[0].pattern, "reconstruction_cycle");
    }

    #[test]
    fn flag_overrides_replace_config_values() {
        let cli = Cli::try_parse_from([
            "ballast",
            "inspect",
            "t.json",
            "--context-size",
            "8000",
            "--compact-threshold",
            "90",
        ])
        .unwrap();
        let Command::Inspect(args) = cli.command;
        let config = load_config(&args).unwrap();
        assert_eq!(config.compaction.context_size, 8000);
        assert_eq!(config.compaction.compact_threshold, 90);
        assert_eq!(config.compaction.emergency_threshold, 98);
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let cli = Cli::try_parse_from([
            "ballast",
            "inspect",
            "t.json",
            "--compact-threshold",
            "99",
            "--emergency-threshold",
            "90",
        ])
        .unwrap();
        let Command::Inspect(args) = cli.command;
        assert!(matches!(load_config(&args), Err(GuardError::Config(_))));
    }

    #[test]
    fn emergency_requires_compact() {
        assert!(Cli::try_parse_from(["ballast", "inspect", "t.json", "--emergency"]).is_err());
    }

    #[tokio::test]
    async fn emergency_compaction_writes_truncated_transcript() {
        let mut input = tempfile::NamedTempFile::new().unwrap();
        write!(input, "{}", serde_json::to_string(&transcript()).unwrap()).unwrap();
        let output = tempfile::NamedTempFile::new().unwrap();

        let cli = Cli::try_parse_from([
            OsStr::new("ballast"),
            OsStr::new("inspect"),
            input.path().as_os_str(),
            OsStr::new("--compact"),
            OsStr::new("--emergency"),
            OsStr::new("--output"),
            output.path().as_os_str(),
        ])
        .unwrap();
        let Command::Inspect(args) = cli.command;
        let report = build_report(args).await.unwrap();
        let compaction = report.compaction.expect("no compaction in report");
        assert_eq!(compaction.strategy, CompactionStrategy::Truncate);
        assert!(!compaction.used_fallback);

        let written: Vec<Message> =
            serde_json::from_str(&std::fs::read_to_string(output.path()).unwrap()).unwrap();
        assert_eq!(written[0].role, MessageRole::System);
        assert!(
            written[1]
                .metadata
                .as_ref()
                .is_some_and(|m| m.is_truncation_notice)
        );
    }
}
