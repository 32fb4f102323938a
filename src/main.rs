//! tracehub: record and analyze streamed binary traces.
//!
//! `serve` runs the recorder and control-plane server over a trace
//! store; `list` inspects a store offline; `analyze` decodes a recorded
//! trace with the built-in analyzers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tracehub::analysis::analyzers::standard_analyzers;
use tracehub::analysis::AnalysisSession;
use tracehub::recorder::Recorder;
use tracehub::server::StoreService;
use tracehub::store::TraceStore;
use tracehub::stream::{FileStreamReader, FollowPolicy};
use tracehub::transport::Transport;

const DEFAULT_RECORDER_ADDR: &str = "127.0.0.1:7564";
const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:7565";

#[derive(Parser)]
#[command(name = "tracehub")]
#[command(about = "Record and analyze streamed binary traces")]
#[command(version)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides this)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recorder and control-plane server over a trace store
    Serve {
        /// Directory holding recorded traces
        #[arg(short, long)]
        store_dir: Option<PathBuf>,

        /// Address the recorder accepts producer connections on
        #[arg(long)]
        recorder_addr: Option<String>,

        /// Address the control-plane server listens on
        #[arg(long)]
        control_addr: Option<String>,

        /// JSON config file; command-line flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List the traces in a store directory
    List {
        /// Directory holding recorded traces
        #[arg(short, long)]
        store_dir: PathBuf,

        /// Output format: table, json
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Decode a recorded trace with the built-in analyzers
    Analyze {
        /// Path to a trace file
        trace: PathBuf,

        /// Keep tailing a trace that is still being recorded
        #[arg(long)]
        follow: bool,

        /// Output format: table, json
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

/// JSON config file for `serve`.
///
/// ```json
/// {
///   "store_dir": "/var/lib/tracehub",
///   "recorder_addr": "0.0.0.0:7564",
///   "control_addr": "127.0.0.1:7565"
/// }
/// ```
#[derive(Debug, Default, Deserialize)]
struct ServeConfig {
    store_dir: Option<PathBuf>,
    recorder_addr: Option<String>,
    control_addr: Option<String>,
}

impl ServeConfig {
    fn load(path: &PathBuf) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

fn run_serve(
    store_dir: Option<PathBuf>,
    recorder_addr: Option<String>,
    control_addr: Option<String>,
    config: Option<PathBuf>,
) -> Result<()> {
    let file_config = match &config {
        Some(path) => ServeConfig::load(path)?,
        None => ServeConfig::default(),
    };
    let store_dir = store_dir
        .or(file_config.store_dir)
        .unwrap_or_else(|| PathBuf::from("./traces"));
    let recorder_addr = recorder_addr
        .or(file_config.recorder_addr)
        .unwrap_or_else(|| DEFAULT_RECORDER_ADDR.to_string());
    let control_addr = control_addr
        .or(file_config.control_addr)
        .unwrap_or_else(|| DEFAULT_CONTROL_ADDR.to_string());

    let store = Arc::new(TraceStore::new(&store_dir)?);
    info!("store at {}", store.dir().display());

    // One reactor drives the accept loops, every relay, and every
    // control peer; nothing here needs a second thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let recorder_listener = TcpListener::bind(&recorder_addr)
            .await
            .with_context(|| format!("binding recorder to {recorder_addr}"))?;
        let control_listener = TcpListener::bind(&control_addr)
            .await
            .with_context(|| format!("binding control plane to {control_addr}"))?;

        let recorder = Recorder::new(Arc::clone(&store));
        let service = StoreService::new(store, Arc::clone(&recorder));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let recorder_task = tokio::spawn(recorder.run(recorder_listener, shutdown_rx.clone()));
        let control_task = tokio::spawn(service.run(control_listener, shutdown_rx));

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        let _ = shutdown_tx.send(true);

        recorder_task.await??;
        control_task.await??;
        Ok(())
    })
}

fn run_list(store_dir: PathBuf, format: String) -> Result<()> {
    let store = TraceStore::new(&store_dir)?;
    let traces = store.list()?;

    match format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&traces)?),
        _ => {
            let headers = ["name", "size", "modified_ms"];
            let rows: Vec<Vec<String>> = traces
                .iter()
                .map(|t| {
                    vec![
                        t.name.clone(),
                        t.size.to_string(),
                        t.modified_ms.to_string(),
                    ]
                })
                .collect();
            print_table(&headers, &rows);
            eprintln!("\n{} traces", traces.len());
        }
    }
    Ok(())
}

fn run_analyze(trace: PathBuf, follow: bool, format: String) -> Result<()> {
    if !trace.exists() {
        bail!("trace not found: {}", trace.display());
    }

    let policy = if follow {
        FollowPolicy {
            poll_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(5),
        }
    } else {
        FollowPolicy::no_follow()
    };
    let reader = FileStreamReader::with_policy(&trace, policy);
    let mut transport = Transport::new(Box::new(reader));

    let mut session = AnalysisSession::new();
    for analyzer in standard_analyzers() {
        session.add_analyzer(analyzer);
    }
    let stats = session.process(&mut transport)?;

    match format.as_str() {
        "json" => {
            let value = session.read(|providers| {
                json!({
                    "stats": stats,
                    "counters": providers.counters.iter().collect::<Vec<_>>(),
                    "log": providers.log.entries(),
                })
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        _ => {
            println!(
                "{} events, {} event types, {} definitions",
                stats.events, stats.declarations, stats.definitions
            );
            session.read(|providers| {
                if !providers.counters.is_empty() {
                    println!();
                    let headers = ["id", "name", "samples", "last"];
                    let rows: Vec<Vec<String>> = providers
                        .counters
                        .iter()
                        .map(|series| {
                            vec![
                                series.id.to_string(),
                                series.name.clone(),
                                series.points.len().to_string(),
                                series
                                    .last_value()
                                    .map(|v| format!("{v:.3}"))
                                    .unwrap_or_default(),
                            ]
                        })
                        .collect();
                    print_table(&headers, &rows);
                }
                if !providers.log.is_empty() {
                    println!();
                    for entry in providers.log.entries() {
                        println!("[{}] level={} {}", entry.ts, entry.level, entry.message);
                    }
                }
            });
        }
    }

    if transport.is_stalled() {
        eprintln!("warning: stream stalled on malformed framing; output is partial");
    }
    Ok(())
}

const MAX_COLUMN_WIDTH: usize = 50;

fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    if rows.is_empty() {
        println!("(no results)");
        return;
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, val) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(val.len());
            }
        }
    }
    for w in &mut widths {
        *w = (*w).min(MAX_COLUMN_WIDTH);
    }

    let header_line: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_line.join(" | "));

    let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    println!("{}", sep.join("-+-"));

    for row in rows {
        let row_line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let width = widths.get(i).copied().unwrap_or(10);
                let truncated = if v.len() > width && width > 3 {
                    format!("{}...", &v[..width.saturating_sub(3)])
                } else {
                    v.clone()
                };
                format!("{truncated:width$}")
            })
            .collect();
        println!("{}", row_line.join(" | "));
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve {
            store_dir,
            recorder_addr,
            control_addr,
            config,
        } => run_serve(store_dir, recorder_addr, control_addr, config),
        Commands::List { store_dir, format } => run_list(store_dir, format),
        Commands::Analyze {
            trace,
            follow,
            format,
        } => run_analyze(trace, follow, format),
    }
}
