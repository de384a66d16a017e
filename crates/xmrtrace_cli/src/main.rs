//! xmrtrace CLI: ingest, intersect, merge, stats, report, verify.

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use xmrtrace::ring::{ingest_heights, IngestOptions};
use xmrtrace::verify::verify_bundle_hash;
use xmrtrace::{
    merge_siblings, reproducibility_hash, residual_stats, run_fork_pair, Cache, ChainId,
    ChainsConfig, DaemonLedger, Fetcher, ForkPair, IndexResolver, OutputLookup, ReportData,
    ResidualBundle, RingStore, RunReport, StoredOutputs,
};
use xmrtrace_report::render_report;

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() -> CliResult {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();
    let cli = Cli::parse();
    match &cli.command {
        Command::Ingest(args) => run_ingest(&cli.global, args),
        Command::Intersect(args) => run_intersect(&cli.global, args),
        Command::Merge(args) => run_merge(&cli.global, args),
        Command::Stats(args) => run_stats(&cli.global, args),
        Command::Report(args) => run_report(&cli.global, args),
        Command::Verify(args) => run_verify(args),
    }
}

#[derive(Parser)]
#[command(name = "xmrtrace")]
#[command(author = "gorusys <goru.connector@outlook.com>")]
#[command(about = "Cross-fork ring intersection for Monero and its hard forks")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Ring store (SQLite).
    #[arg(long, global = true, default_value = "./data/rings.sqlite")]
    db: PathBuf,
    #[arg(long, global = true, default_value = "./data/cache")]
    cache_dir: PathBuf,
    /// Chain endpoints (JSON). Missing file means a single local daemon.
    #[arg(long, global = true, default_value = "./xmrtrace.json")]
    config: PathBuf,
    /// Serve daemon requests from the response cache only.
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Populate ring records for a chain from its daemon.
    Ingest(IngestArgs),
    /// Narrow a chain's rings against another fork.
    Intersect(IntersectArgs),
    /// Intersect sibling result tables into one table.
    Merge(MergeArgs),
    /// Print the residual-size histogram of a table.
    Stats(StatsArgs),
    /// Write HTML report, residual bundle and its hash.
    Report(ReportArgs),
    /// Verify a bundle's reproducibility hash.
    Verify(VerifyArgs),
}

#[derive(Args)]
struct IngestArgs {
    #[arg(long)]
    chain: String,
    /// First height; resumes from the stored cursor when omitted.
    #[arg(long)]
    from: Option<u64>,
    #[arg(long)]
    to: u64,
    /// Also resolve and store every ring member's output key.
    #[arg(long)]
    record_outputs: bool,
}

#[derive(Args)]
struct IntersectArgs {
    #[arg(long)]
    left: String,
    #[arg(long)]
    right: String,
    /// Result table; defaults to `left`.
    #[arg(long)]
    into: Option<String>,
    /// Resolve from recorded outputs instead of the daemons.
    #[arg(long)]
    stored_outputs: bool,
    /// Also write the result table's report, including this run's counts.
    #[arg(long)]
    report: bool,
    #[arg(long, default_value = "./reports")]
    reports_dir: PathBuf,
}

#[derive(Args)]
struct MergeArgs {
    #[arg(long)]
    into: String,
    #[arg(long, value_delimiter = ',', required = true)]
    siblings: Vec<String>,
}

#[derive(Args)]
struct StatsArgs {
    #[arg(long)]
    chain: String,
}

#[derive(Args)]
struct ReportArgs {
    #[arg(long)]
    chain: String,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = "./reports")]
    reports_dir: PathBuf,
}

#[derive(Args)]
struct VerifyArgs {
    #[arg(long)]
    bundle: PathBuf,
}

fn open_store(global: &GlobalArgs) -> Result<RingStore, Box<dyn std::error::Error>> {
    if let Some(parent) = global.db.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(RingStore::open(&global.db)?)
}

fn open_ledger(
    global: &GlobalArgs,
    config: &ChainsConfig,
    chain: &ChainId,
) -> Result<DaemonLedger, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&global.cache_dir)?;
    let cache = Cache::open(global.cache_dir.join("cache.sqlite"))?;
    let fetch = config.fetch_for(chain, global.offline);
    info!(chain = %chain, base_url = %fetch.base_url, offline = fetch.offline, "daemon");
    let fetcher = Fetcher::new(chain.clone(), fetch, Some(cache))?;
    Ok(DaemonLedger::new(fetcher)?)
}

fn run_ingest(global: &GlobalArgs, args: &IngestArgs) -> CliResult {
    let config = ChainsConfig::load(&global.config)?;
    let store = open_store(global)?;
    let chain = ChainId::new(&args.chain);
    let ledger = open_ledger(global, &config, &chain)?;
    let opts = IngestOptions {
        from_height: args.from,
        to_height: args.to,
        record_outputs: args.record_outputs,
    };
    let summary = ingest_heights(&ledger, &store, &chain, &opts)?;
    info!(requests = ledger.fetcher().request_count(), "ingest complete");
    println!("blocks\t{}", summary.blocks);
    println!("transactions\t{}", summary.transactions);
    println!("inputs\t{}", summary.inputs);
    println!("inserted\t{}", summary.inserted);
    println!("skipped_inputs\t{}", summary.skipped_inputs);
    if args.record_outputs {
        println!("outputs_recorded\t{}", summary.outputs_recorded);
        println!("unresolved_outputs\t{}", summary.unresolved_outputs);
    }
    Ok(())
}

fn narrow<A: OutputLookup, B: OutputLookup>(
    store: &RingStore,
    pair: &ForkPair,
    left: A,
    right: B,
) -> Result<RunReport, Box<dyn std::error::Error>> {
    let mut left_resolver = IndexResolver::new(pair.left.clone(), left);
    left_resolver.seed(store.load_outputs(&pair.left)?);
    let mut right_resolver = IndexResolver::new(pair.right.clone(), right);
    right_resolver.seed(store.load_outputs(&pair.right)?);
    let report = run_fork_pair(store, pair, &mut left_resolver, &mut right_resolver)?;
    info!(
        left_lookups = left_resolver.lookups(),
        right_lookups = right_resolver.lookups(),
        "resolver lookups"
    );
    Ok(report)
}

fn run_intersect(global: &GlobalArgs, args: &IntersectArgs) -> CliResult {
    let store = open_store(global)?;
    let mut pair = ForkPair::new(ChainId::new(&args.left), ChainId::new(&args.right));
    if let Some(into) = &args.into {
        pair = pair.into_table(ChainId::new(into));
    }
    let report = if args.stored_outputs {
        narrow(
            &store,
            &pair,
            StoredOutputs::new(&store, pair.left.clone()),
            StoredOutputs::new(&store, pair.right.clone()),
        )?
    } else {
        let config = ChainsConfig::load(&global.config)?;
        let left = open_ledger(global, &config, &pair.left)?;
        let right = open_ledger(global, &config, &pair.right)?;
        narrow(&store, &pair, &left, &right)?
    };
    print_run(&report);
    if args.report {
        write_report(&store, &pair.into, None, &args.reports_dir, Some(report))?;
    }
    Ok(())
}

fn run_merge(global: &GlobalArgs, args: &MergeArgs) -> CliResult {
    let store = open_store(global)?;
    let siblings: Vec<ChainId> = args.siblings.iter().map(ChainId::new).collect();
    let report = merge_siblings(&store, &siblings, &ChainId::new(&args.into))?;
    print_run(&report);
    Ok(())
}

fn print_run(report: &RunReport) {
    println!("left_images\t{}", report.left_images);
    println!("shared_images\t{}", report.shared_images);
    println!("processed\t{}", report.processed);
    println!("fully_deanonymized\t{}", report.fully_deanonymized);
    println!("anomalies\t{}", report.anomalies);
    println!("partial_warnings\t{}", report.partial_warnings);
    println!("mismatches\t{}", report.mismatches);
    println!("malformed\t{}", report.malformed);
    println!("conflicts\t{}", report.conflicts);
    for f in &report.failures {
        eprintln!("failed\t{}\t{}", f.image, f.reason);
    }
}

fn run_stats(global: &GlobalArgs, args: &StatsArgs) -> CliResult {
    let store = open_store(global)?;
    let chain = ChainId::new(&args.chain);
    let stats = residual_stats(store.fork_index_lengths(&chain)?);
    println!("size\tcount");
    for (size, count) in stats.bincount().iter().enumerate() {
        println!("{}\t{}", size, count);
    }
    println!("Total\t{}", stats.total);
    println!("Intersection size 1\t{}", stats.fully_deanonymized);
    println!("Intersection size 0\t{}", stats.anomalies);
    println!("Rest\t{}", stats.ambiguous);
    println!("Not narrowed\t{}", stats.not_narrowed);
    if let Some(pct) = stats.deanonymized_pct() {
        println!("Deanonymized\t{:.2}%", pct);
    }
    Ok(())
}

fn run_report(global: &GlobalArgs, args: &ReportArgs) -> CliResult {
    let store = open_store(global)?;
    let chain = ChainId::new(&args.chain);
    let hash = write_report(&store, &chain, args.out.clone(), &args.reports_dir, None)?;
    println!("{}", hash);
    Ok(())
}

/// Write `<chain>.html`, `<chain>.bundle.json` and `<chain>.sha256`; returns the hash.
fn write_report(
    store: &RingStore,
    chain: &ChainId,
    out: Option<PathBuf>,
    reports_dir: &Path,
    last_run: Option<RunReport>,
) -> Result<String, Box<dyn std::error::Error>> {
    let bundle = ResidualBundle::from_store(store, chain)?;
    let reproducibility_hash_sha256 = reproducibility_hash(&bundle)?;
    let data = ReportData {
        bundle,
        reproducibility_hash_sha256: reproducibility_hash_sha256.clone(),
        last_run,
    };
    std::fs::create_dir_all(reports_dir)?;
    let html_path = out.unwrap_or_else(|| reports_dir.join(format!("{}.html", chain)));
    let bundle_path = reports_dir.join(format!("{}.bundle.json", chain));
    let hash_path = reports_dir.join(format!("{}.sha256", chain));
    render_report(&data, &html_path)?;
    std::fs::write(&bundle_path, serde_json::to_string_pretty(&data.bundle)?)?;
    std::fs::write(&hash_path, format!("{}\n", reproducibility_hash_sha256))?;
    info!(?html_path, ?bundle_path, ?hash_path, "report complete");
    Ok(reproducibility_hash_sha256)
}

/// `reports/xmr.bundle.json` -> `reports/xmr.sha256`.
fn sibling_hash_path(bundle: &Path) -> PathBuf {
    let name = bundle
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned();
    let stem = name
        .strip_suffix(".bundle.json")
        .or_else(|| name.strip_suffix(".json"))
        .unwrap_or(&name);
    bundle
        .parent()
        .unwrap_or(Path::new("."))
        .join(format!("{}.sha256", stem))
}

fn run_verify(args: &VerifyArgs) -> CliResult {
    let bundle_json = std::fs::read_to_string(&args.bundle)?;
    let bundle: ResidualBundle = serde_json::from_str(&bundle_json)?;
    let expected = std::fs::read_to_string(sibling_hash_path(&args.bundle)).ok();
    let result = verify_bundle_hash(&bundle, expected.as_deref())?;
    if result.matches {
        println!("OK\t{}", result.bundle_hash);
    } else {
        eprintln!(
            "MISMATCH\tcomputed={}\texpected={:?}",
            result.bundle_hash, result.expected_hash
        );
        std::process::exit(1);
    }
    Ok(())
}
