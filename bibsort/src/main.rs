mod input;

use anyhow::{bail, Context, Result};
use bibsort_core::{
    EngineConfig, FieldExtractor, LoggingScheduler, Method, MethodCatalog, Orchestrator, OrderIndex,
    PersistenceGateway, RecId, RecordCatalog, RecordSource, RunReport, RunRequest, SledGateway,
    SortError, SortOrder, SortValue, SortedView, WasherRegistry, WasherSpec,
};
use clap::{Parser, Subcommand};
use roaring::RoaringBitmap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "bibsort")]
#[command(about = "Maintain pre-computed sort orders for record collections", long_about = None)]
struct Cli {
    /// sled database holding index and bucket rows
    #[arg(long, global = true, default_value = "bibsort.db")]
    store: PathBuf,
    /// JSON file listing the sorting methods
    #[arg(long, global = true, default_value = "methods.json")]
    methods: PathBuf,
    /// Record dump: a .json/.jsonl file or a directory of them
    #[arg(long, global = true)]
    records: Option<PathBuf>,
    /// JSON array of ranking sets
    #[arg(long, global = true)]
    rankings: Option<PathBuf>,
    /// JSON object mapping field names to tag patterns
    #[arg(long, global = true)]
    fields: Option<PathBuf>,
    /// Engine settings (JSON); BIBSORT_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Stop at the next checkpoint after this many seconds
    #[arg(long, global = true)]
    time_limit: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the order and buckets of the selected methods from scratch
    Rebalance {
        /// Method name; repeat for several (default: all)
        #[arg(long = "method")]
        names: Vec<String>,
    },
    /// Apply records modified since the last run (or the given ones)
    Update {
        #[arg(long = "method")]
        names: Vec<String>,
        /// Record ids to re-examine, e.g. `1,5-9`
        #[arg(long)]
        recids: Option<String>,
    },
    /// Print record ids ordered by a method
    Sort {
        #[arg(long = "method")]
        name: String,
        /// Record ids to order (default: every record)
        #[arg(long)]
        hits: Option<String>,
        #[arg(long, default_value_t = false)]
        desc: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the registered methods
    ListMethods,
    /// Register a method, e.g. `add-method title "MARC: 245__a" --washer sort_case_insensitive`
    AddMethod {
        name: String,
        definition: String,
        #[arg(long)]
        washer: Option<String>,
    },
    /// Unregister a method and drop its stored data
    DeleteMethod { name: String },
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Rebalance { names } => run(&cli, request(RunRequest::rebalance(), names)),
        Commands::Update { names, recids } => {
            let mut req = request(RunRequest::update(), names);
            if let Some(raw) = recids {
                req.recids = Some(input::parse_recids(raw)?);
            }
            run(&cli, req)
        }
        Commands::Sort { name, hits, desc, limit } => {
            let order = if *desc { SortOrder::Descending } else { SortOrder::Ascending };
            sort(&cli, name, hits.as_deref(), order, *limit)
        }
        Commands::ListMethods => list_methods(&cli),
        Commands::AddMethod { name, definition, washer } => {
            let mut catalog = MethodCatalog::open(&cli.methods)?;
            let washer = washer.as_deref();
            if let Some(spec) = washer {
                WasherRegistry::default().check(&spec.parse::<WasherSpec>().unwrap_or_default())?;
            }
            let added = catalog.add(name, definition, washer)?.clone();
            catalog.save()?;
            println!("{}\t{}\t{}", added.id, added.name, added.definition);
            Ok(())
        }
        Commands::DeleteMethod { name } => {
            let mut catalog = MethodCatalog::open(&cli.methods)?;
            let removed = catalog.remove(name)?;
            SledGateway::open(&cli.store)?.delete_method(removed.id)?;
            catalog.save()?;
            tracing::info!(
                method = removed.name.as_str(),
                id = removed.id,
                "sorting method deleted"
            );
            Ok(())
        }
    }
}

fn request(base: RunRequest, names: &[String]) -> RunRequest {
    if names.is_empty() {
        base
    } else {
        base.with_methods(names.iter().cloned())
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

fn load_catalog(cli: &Cli, config: &EngineConfig) -> Result<RecordCatalog> {
    let mut catalog = RecordCatalog::new(config.deleted_markers.clone());
    match &cli.records {
        Some(path) => {
            input::load_records(path, &mut catalog)?;
        }
        None => tracing::warn!("no --records given; every method will see an empty collection"),
    }
    if let Some(path) = &cli.rankings {
        input::load_rankings(path, &mut catalog)?;
    }
    if let Some(path) = &cli.fields {
        input::load_fields(path, &mut catalog)?;
    }
    Ok(catalog)
}

fn run(cli: &Cli, request: RunRequest) -> Result<()> {
    let config = load_config(cli)?;
    let methods = MethodCatalog::open(&cli.methods)?;
    let records = load_catalog(cli, &config)?;
    let gateway = SledGateway::open(&cli.store)
        .with_context(|| format!("opening {}", cli.store.display()))?;

    let mut scheduler = match cli.time_limit {
        Some(secs) => LoggingScheduler::with_deadline(Instant::now() + Duration::from_secs(secs)),
        None => LoggingScheduler::new(),
    };
    let started = Instant::now();
    let orchestrator = Orchestrator::new(&methods, &records, &records, &gateway, config);
    let report = orchestrator.run(&request, &mut scheduler);
    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "run finished");
    print_report(&report);

    if report.cancelled {
        bail!("run cancelled before every method was processed");
    }
    let failed: Vec<&str> = report.failed().collect();
    if !failed.is_empty() {
        bail!("methods failed: {}", failed.join(", "));
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    for (name, outcome) in &report.outcomes {
        println!("{name}\t{outcome}");
    }
}

fn list_methods(cli: &Cli) -> Result<()> {
    let methods = MethodCatalog::open(&cli.methods)?;
    let gateway = SledGateway::open(&cli.store)?;
    for record in methods.records() {
        let updated = match gateway.last_updated(record.id)? {
            Some(ts) => ts.to_string(),
            None => "never".to_string(),
        };
        let washer = record.washer.as_deref().unwrap_or("NOOP");
        println!("{}\t{}\t{}\t{}\t{}", record.id, record.name, record.definition, washer, updated);
    }
    Ok(())
}

fn sort(
    cli: &Cli,
    name: &str,
    hits: Option<&str>,
    order: SortOrder,
    limit: Option<usize>,
) -> Result<()> {
    let config = load_config(cli)?;
    let methods = MethodCatalog::open(&cli.methods)?;
    let record = methods.get(name).with_context(|| format!("no sorting method called {name:?}"))?;
    let method = Method::from_record(record)?;
    let records = load_catalog(cli, &config)?;
    let hits = match hits {
        Some(raw) => input::parse_recids(raw)?,
        None => records.all_recids(config.include_deleted)?,
    };
    let gateway = SledGateway::open(&cli.store)?;

    let sorted = match SortedView::load(&gateway, method.id, config.buckets) {
        Ok(view) => view.sort(&hits, order, limit),
        Err(SortError::IncompleteBuckets { expected, found }) => {
            tracing::warn!(
                method = name,
                expected,
                found,
                "buckets not built, sorting from record values"
            );
            sort_unindexed(&records, &method, &hits, order, limit)?
        }
        Err(e) => return Err(e.into()),
    };
    for recid in sorted {
        println!("{recid}");
    }
    Ok(())
}

/// Extract, wash and order `hits` directly; records without a value come last.
fn sort_unindexed(
    records: &RecordCatalog,
    method: &Method,
    hits: &RoaringBitmap,
    order: SortOrder,
    limit: Option<usize>,
) -> Result<Vec<RecId>> {
    let washers = WasherRegistry::default();
    let mut values = records.extract(&method.source, hits)?;
    washers.wash_all(&method.washer, &mut values)?;

    let mut entries: Vec<(RecId, SortValue)> = values.into_iter().collect();
    OrderIndex::new(1, method.washer.collation()).sort_entries(&mut entries);
    if order == SortOrder::Descending {
        entries.reverse();
    }
    let valued: RoaringBitmap = entries.iter().map(|(recid, _)| *recid).collect();
    let mut sorted: Vec<RecId> = entries.into_iter().map(|(recid, _)| recid).collect();
    sorted.extend((hits - &valued).iter());
    if let Some(limit) = limit {
        sorted.truncate(limit);
    }
    Ok(sorted)
}
