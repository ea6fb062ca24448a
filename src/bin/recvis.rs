//! Replays one update selection from a TOML scenario file.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::PathBuf;

use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use sombra_reconcile::reconcile::{
    CounterMetrics, OnDiskValue, PageFootprint, PrepareState, RecSession, ReconcileContext,
    ReconcileOptions, RunStats, SavedUpdate, SlotLocator, SnapshotOracle, TimeWindow, Update,
    UpdateArena, UpdateChain, UpdateKind, UpdateSelection,
};
use sombra_reconcile::types::{Timestamp, TxnId, TS_MAX, TXN_MAX};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "recvis",
    version,
    about = "Inspect reconciliation update selection",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one selection over the chain described in a scenario file.
    Select {
        #[arg(value_name = "SCENARIO")]
        scenario: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Scenario {
    #[serde(default)]
    slot: u32,
    #[serde(default)]
    options: ReconcileOptions,
    #[serde(default)]
    oracle: SnapshotOracle,
    ondisk: Option<OnDiskEntry>,
    #[serde(default, rename = "update")]
    updates: Vec<UpdateEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OnDiskEntry {
    #[serde(default)]
    value: String,
    start: (TxnId, Timestamp),
    stop: Option<(TxnId, Timestamp)>,
    #[serde(default)]
    prepared: bool,
    #[serde(default)]
    overflow: bool,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateEntry {
    txn: TxnId,
    ts: Timestamp,
    durable: Option<Timestamp>,
    #[serde(default = "standard")]
    kind: UpdateKind,
    #[serde(default = "no_prepare")]
    prepare: PrepareState,
    #[serde(default)]
    value: String,
    #[serde(default)]
    aborted: bool,
}

fn standard() -> UpdateKind {
    UpdateKind::Standard
}

fn no_prepare() -> PrepareState {
    PrepareState::None
}

#[derive(Serialize)]
struct ChainEntry {
    handle: u32,
    kind: UpdateKind,
    txn: TxnId,
    ts: Timestamp,
    value: String,
}

#[derive(Serialize)]
struct Report {
    selection: UpdateSelection,
    stats: RunStats,
    leave_dirty: bool,
    saved: Vec<SavedUpdate>,
    chain: Vec<ChainEntry>,
    page_bytes_added: usize,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Command::Select { scenario } => {
            let text = fs::read_to_string(&scenario)?;
            let scenario: Scenario = toml::from_str(&text)?;
            let report = replay(&scenario)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => print_text(&report),
            }
            Ok(())
        }
    }
}

fn replay(scenario: &Scenario) -> sombra_reconcile::Result<Report> {
    let arena = UpdateArena::new();
    let chain = UpdateChain::new();
    // Scenario lists updates newest first; prepend oldest first.
    for entry in scenario.updates.iter().rev() {
        let upd = Update::new(entry.kind, Bytes::from(entry.value.clone().into_bytes()))
            .stamped(entry.txn, entry.ts, entry.durable.unwrap_or(entry.ts))
            .with_prepare(entry.prepare);
        let handle = chain.prepend(&arena, upd)?;
        if entry.aborted {
            arena.get(handle).mark_aborted();
        }
    }

    let ondisk = scenario.ondisk.as_ref().map(|entry| {
        let stop = entry.stop.unwrap_or((TXN_MAX, TS_MAX));
        let mut tw = TimeWindow::with_bounds(entry.start, stop);
        tw.prepare = entry.prepared;
        if entry.deleted {
            OnDiskValue::deleted(tw)
        } else {
            OnDiskValue::new(Bytes::from(entry.value.clone().into_bytes()), tw)
                .with_overflow(entry.overflow)
        }
    });

    let footprint = PageFootprint::default();
    let metrics = CounterMetrics::default();
    let session = RecSession::new(&arena, &scenario.oracle)
        .with_memory(&footprint)
        .with_metrics(&metrics);
    let mut ctx = ReconcileContext::new(&scenario.options, &scenario.oracle);
    let selection = session.select(
        &mut ctx,
        SlotLocator::Slot(scenario.slot),
        &chain,
        ondisk.as_ref(),
    )?;

    let chain = chain
        .iter(&arena)
        .map(|(handle, upd)| ChainEntry {
            handle: handle.raw(),
            kind: upd.kind(),
            txn: upd.txn_id(),
            ts: upd.start_ts(),
            value: String::from_utf8_lossy(upd.value()).into_owned(),
        })
        .collect();
    Ok(Report {
        selection,
        stats: *ctx.stats(),
        leave_dirty: ctx.leave_dirty(),
        saved: ctx.saved().to_vec(),
        chain,
        page_bytes_added: footprint.bytes(),
    })
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<30} {}", name, value);
}

fn print_text(report: &Report) {
    let sel = &report.selection;
    println!("─── selection");
    match sel.upd {
        Some(handle) => print_field("update", handle.raw()),
        None => print_field("update", "none"),
    }
    print_field("time window", sel.tw);
    print_field("newer updates", sel.has_newer_updates);
    print_field("saved", sel.saved);
    print_field("leave dirty", report.leave_dirty);

    println!("─── run");
    print_field("updates seen", report.stats.updates_seen);
    print_field("updates unstable", report.stats.updates_unstable);
    print_field("max txn", report.stats.max_txn);
    print_field("max ts", report.stats.max_ts);
    print_field("max on-disk ts", report.stats.max_ondisk_ts);
    print_field("page bytes added", report.page_bytes_added);
    for record in &report.saved {
        print_field(
            "saved record",
            format!(
                "{:?} onpage={} restore={} memsize={}",
                record.slot,
                record.onpage.map_or(0, |h| h.raw()),
                record.restore,
                record.memsize
            ),
        );
    }

    println!("─── chain (newest first)");
    for entry in &report.chain {
        println!(
            "  #{:<4} {:<9} txn={:<6} ts={:<6} {}",
            entry.handle,
            format!("{:?}", entry.kind),
            entry.txn,
            entry.ts,
            entry.value
        );
    }
}
