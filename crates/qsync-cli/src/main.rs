use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use qsync_cache::{ArtifactCache, ArtifactFetcher, DirectoryFetcher, OfflineFetcher};
use qsync_config::QsyncConfig;
use qsync_core::{ArtifactDigest, FileRef, FileRoot, Label, TargetRecord};
use qsync_sync::{SyncDiagnostic, SyncOrchestrator, SyncOutcome, SyncRequest};
use qsync_vcs::VcsState;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Parser)]
#[command(name = "qsync", version, about = "Incremental build-graph sync (sync, classify, resolve, cache)")]
struct Cli {
    /// Workspace root used to discover `.qsync.toml`
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,
    /// Explicit config file (skips discovery)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one sync transaction from an empty snapshot
    Sync(SyncArgs),
    /// Print whether each label belongs to the project
    Classify(ClassifyArgs),
    /// Resolve a root-relative file to an absolute path
    Resolve(ResolveArgs),
    /// Inspect or fill the artifact cache
    Cache(CacheArgs),
}

#[derive(Args)]
struct SyncArgs {
    /// JSON array of target records
    #[arg(long)]
    records: PathBuf,
    /// JSON VCS state (`upstream_revision` and `working_set`)
    #[arg(long)]
    vcs: PathBuf,
    /// Directory holding artifacts named by digest; without it every artifact is missing
    #[arg(long)]
    fetch_dir: Option<PathBuf>,
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ClassifyArgs {
    #[arg(required = true)]
    labels: Vec<String>,
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ResolveArgs {
    /// `workspace`, `output` or `external:<repository>`
    root: String,
    path: String,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Store a file under its SHA-256 digest
    Put { file: PathBuf },
    /// Print entry and byte counts
    Stats,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn load_config(cli: &Cli) -> Result<QsyncConfig> {
    match &cli.config {
        Some(path) => QsyncConfig::load_from_path(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => {
            let (config, _) = qsync_config::load_for_workspace(&cli.workspace)
                .with_context(|| format!("failed to load config for {}", cli.workspace.display()))?;
            Ok(config)
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli)?;
    qsync_config::init_tracing(&config.logging);

    match cli.command {
        Command::Sync(args) => sync(&config, args),
        Command::Classify(args) => {
            let rules = config.project_rules()?;
            let mut rows = Vec::with_capacity(args.labels.len());
            for raw in &args.labels {
                let label = Label::parse(raw).with_context(|| format!("invalid label {raw:?}"))?;
                let in_project = rules.classify(&label);
                rows.push(Classification { label, in_project });
            }
            if args.json {
                print_json(&rows)?;
            } else {
                for row in &rows {
                    let verdict = if row.in_project { "in project" } else { "excluded" };
                    println!("{}\t{verdict}", row.label);
                }
            }
            Ok(0)
        }
        Command::Resolve(args) => {
            let root = parse_root(&args.root)?;
            let file = FileRef::new(root, &args.path)
                .with_context(|| format!("invalid path {:?}", args.path))?;
            let resolved = config.path_resolver()?.resolve(&file)?;
            println!("{}", resolved.display());
            Ok(0)
        }
        Command::Cache(args) => {
            let cache = open_cache(&config, Arc::new(OfflineFetcher))?;
            match args.command {
                CacheCommand::Put { file } => {
                    let bytes = std::fs::read(&file)
                        .with_context(|| format!("failed to read {}", file.display()))?;
                    let digest = ArtifactDigest::of_bytes(&bytes);
                    cache.put_blocking(&digest, &bytes)?;
                    let path = cache.object_path(&digest);
                    if args.json {
                        print_json(&serde_json::json!({ "digest": digest, "path": path }))?;
                    } else {
                        println!("{digest}");
                    }
                }
                CacheCommand::Stats => {
                    let stats = cache.stats();
                    if args.json {
                        print_json(&stats)?;
                    } else {
                        println!("cache:");
                        println!("  dir: {}", cache.root().display());
                        println!("  entries: {}", stats.entries);
                        println!("  total_bytes: {}", stats.total_bytes);
                        println!("  max_bytes: {}", stats.max_bytes);
                    }
                }
            }
            Ok(0)
        }
    }
}

fn sync(config: &QsyncConfig, args: SyncArgs) -> Result<i32> {
    let records: Vec<TargetRecord> = read_json(&args.records)?;
    let vcs: VcsState = read_json(&args.vcs)?;
    tracing::debug!(
        target = "qsync.cli",
        records = records.len(),
        working_set = vcs.working_set.len(),
        revision = %vcs.upstream_revision,
        "loaded sync inputs"
    );

    let fetcher: Arc<dyn ArtifactFetcher> = match &args.fetch_dir {
        Some(dir) => Arc::new(DirectoryFetcher::new(dir)),
        None => Arc::new(OfflineFetcher),
    };
    let cache = open_cache(config, fetcher)?;
    let orchestrator = SyncOrchestrator::new(
        cache,
        config.path_resolver()?,
        config.project_rules()?,
        config.sync_options(),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    let request = SyncRequest::new(vcs).with_records(records);
    let outcome = runtime.block_on(orchestrator.sync(request))?;

    let summary = SyncSummary::from(&outcome);
    if args.json {
        print_json(&summary)?;
    } else {
        println!(
            "synced: generation {} (request {})",
            summary.generation, summary.request_id
        );
        println!("  targets: {}", summary.targets);
        println!("  in_project: {}", summary.in_project);
        println!("  artifacts: {}", summary.artifacts.len());
        println!("  diagnostics: {}", summary.diagnostics.len());
        for diagnostic in &summary.diagnostics {
            println!("    {diagnostic}");
        }
    }
    Ok(if outcome.is_clean() { 0 } else { 1 })
}

#[derive(Serialize)]
struct Classification {
    label: Label,
    in_project: bool,
}

#[derive(Serialize)]
struct SyncSummary {
    request_id: u64,
    generation: u64,
    targets: usize,
    in_project: usize,
    affected: usize,
    artifacts: BTreeMap<ArtifactDigest, PathBuf>,
    degraded: Vec<Label>,
    diagnostics: Vec<SyncDiagnostic>,
}

impl From<&SyncOutcome> for SyncSummary {
    fn from(outcome: &SyncOutcome) -> Self {
        let snapshot = &outcome.snapshot;
        SyncSummary {
            request_id: outcome.request_id,
            generation: snapshot.generation(),
            targets: snapshot.len(),
            in_project: snapshot.in_project_labels().len(),
            affected: outcome.affected.len(),
            artifacts: outcome.artifacts.clone(),
            degraded: snapshot.degraded().iter().cloned().collect(),
            diagnostics: outcome.diagnostics.clone(),
        }
    }
}

fn open_cache(config: &QsyncConfig, fetcher: Arc<dyn ArtifactFetcher>) -> Result<ArtifactCache> {
    ArtifactCache::open(&config.cache.dir, config.cache_options(), fetcher)
        .with_context(|| format!("failed to open cache at {}", config.cache.dir.display()))
}

fn parse_root(raw: &str) -> Result<FileRoot> {
    Ok(match raw {
        "workspace" => FileRoot::Workspace,
        "output" => FileRoot::Output,
        _ => match raw.strip_prefix("external:") {
            Some(repo) if !repo.is_empty() => FileRoot::External(repo.to_string()),
            _ => bail!("unknown root {raw:?} (expected workspace, output or external:<repository>)"),
        },
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{out}");
    Ok(())
}
