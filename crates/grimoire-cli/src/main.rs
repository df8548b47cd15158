//! Grimoire command-line front end.
//!
//! Mounts a SQLite store at the configured device and runs one facade
//! operation against it, printing JSON on stdout.
//!
//! Usage:
//!   # Ephemeral in-memory store
//!   cargo run -p grimoire-cli -- seed data/seed.yaml
//!
//!   # Persistent store from a config file
//!   cargo run -p grimoire-cli -- --config grimoire.toml get character 42
//!   cargo run -p grimoire-cli -- --config grimoire.toml query feat 'level<=3'
//!   cargo run -p grimoire-cli -- --config grimoire.toml export backup.yaml
//!
//! Logs go to stderr; set RUST_LOG=grimoire_kernel=debug for tier traces.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

use grimoire_kernel::{
    Condition, Filter, Kernel, KernelConfig, OpenMode, Payload, Resolution, ResourceFacade,
    ResourceId, ResourceKind, SeedDocument, SqliteDriver,
};

/// Path-addressed access to character and rules data.
#[derive(Parser, Debug)]
#[command(name = "grimoire")]
#[command(about = "Resource kernel for character and rules data")]
struct Args {
    /// Kernel config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Allow flagged placeholder records when every backend tier fails
    #[arg(long, global = true)]
    degraded: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch one resource
    Get {
        #[arg(value_parser = parse_kind)]
        kind: ResourceKind,
        id: String,
        /// Sub-resource kind to list for an entity instead
        #[arg(long, value_parser = parse_kind)]
        sub: Option<ResourceKind>,
    },
    /// List every resource of a kind
    List {
        #[arg(value_parser = parse_kind)]
        kind: ResourceKind,
    },
    /// Merge a JSON object into a resource
    Update {
        #[arg(value_parser = parse_kind)]
        kind: ResourceKind,
        id: String,
        /// e.g. '{"level": 6}'
        patch: String,
    },
    /// Filtered query, bypassing the cache
    Query {
        #[arg(value_parser = parse_kind)]
        kind: ResourceKind,
        /// Conditions such as `level<=5` or `name=Amiri`
        conditions: Vec<String>,
    },
    /// Field inventory of a kind
    Describe {
        #[arg(value_parser = parse_kind)]
        kind: ResourceKind,
    },
    /// Import a YAML seed document
    Seed {
        file: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Write every resource to a YAML seed document
    Export { file: PathBuf },
    /// Show mounted devices
    Status,
}

fn parse_kind(s: &str) -> Result<ResourceKind, String> {
    s.parse().map_err(|_| format!("unknown resource kind: {s}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => KernelConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => KernelConfig::default(),
    };
    if args.degraded {
        config = config.with_degraded_reads(true);
    }

    let facade = ResourceFacade::new(Arc::new(boot(config).await?));
    let output = run(&facade, args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn boot(config: KernelConfig) -> Result<Kernel> {
    let driver = match &config.store.path {
        Some(path) => {
            tracing::info!(path = %path.display(), "opening store");
            SqliteDriver::open(path)?
        }
        None => {
            tracing::info!("starting with in-memory store");
            SqliteDriver::in_memory()?
        }
    };

    let kernel = Kernel::new(config);
    let device = kernel.default_device()?;
    let cap = kernel.register_capability(Arc::new(driver));
    if let Err(e) = kernel.mount(&device, cap).await {
        // The device stays bound; reads retry the heal path.
        tracing::warn!(device = %device, error = %e, "mount failed");
    }
    Ok(kernel)
}

async fn run(facade: &ResourceFacade, command: Command) -> Result<Value> {
    let output = match command {
        Command::Get { kind, id, sub: None } => {
            let res = facade.get_complete_resource(kind, &ResourceId::new(id)).await?;
            resolved(res.map(|r| r.to_json()))
        }
        Command::Get { kind, id, sub: Some(sub) } => {
            if kind != ResourceKind::Entity {
                bail!("--sub only applies to entities");
            }
            let res = facade.get_entity_sub_resource(&ResourceId::new(id), sub).await?;
            resolved(res.map(|l| json!(l)))
        }
        Command::List { kind } => {
            let res = facade.list_resources(kind).await?;
            resolved(res.map(|l| json!(l)))
        }
        Command::Update { kind, id, patch } => {
            let patch: Value = serde_json::from_str(&patch).context("patch is not JSON")?;
            let Some(fields) = patch.as_object() else {
                bail!("patch must be a JSON object");
            };
            facade
                .update_resource(kind, &ResourceId::new(id), fields)
                .await?
                .to_json()
        }
        Command::Query { kind, conditions } => {
            let mut filter = Filter::all();
            for expr in &conditions {
                let condition = Condition::parse(expr)
                    .with_context(|| format!("bad condition {expr:?}"))?;
                filter.conditions.push(condition);
            }
            let records = facade.query(kind, filter).await?;
            Value::Array(records.iter().map(|r| r.to_json()).collect())
        }
        Command::Describe { kind } => {
            let res = facade.describe(kind).await?;
            resolved(res.map(|s| json!(s)))
        }
        Command::Seed { file, dry_run } => {
            let doc = SeedDocument::load(&file)?;
            let report = facade.import_seed(&doc, dry_run).await?;
            json!({
                "dry_run": report.dry_run,
                "total": report.total(),
                "imported": report.imported.iter().map(|(k, n)| (k.to_string(), json!(n))).collect::<serde_json::Map<_, _>>(),
                "skipped": report.skipped,
            })
        }
        Command::Export { file } => {
            let doc = facade.export_seed().await?;
            std::fs::write(&file, doc.to_yaml_string()?)
                .with_context(|| format!("writing {}", file.display()))?;
            let tables: serde_json::Map<_, _> = doc
                .reference_tables
                .iter()
                .map(|(table, rows)| (table.clone(), json!(rows.len())))
                .collect();
            json!({
                "file": file.display().to_string(),
                "rpg_entities": doc.rpg_entities.len(),
                "characters": doc.characters.len(),
                "reference_tables": tables,
            })
        }
        Command::Status => status(facade.kernel())?,
    };
    Ok(output)
}

fn resolved(res: Resolution<Value>) -> Value {
    json!({
        "path": res.path.as_str(),
        "tier": res.tier.to_string(),
        "degraded": res.is_degraded(),
        "elapsed_ms": res.elapsed.as_millis() as u64,
        "value": res.value,
    })
}

fn status(kernel: &Kernel) -> Result<Value> {
    let mut devices = Vec::new();
    for capability in kernel.capabilities() {
        let Some(device) = capability.mount_path.clone() else {
            continue;
        };
        let guard = kernel.open_scoped(&device, OpenMode::Read)?;
        let Payload::Status(status) = guard.read()? else {
            bail!("{device} did not answer with a status");
        };
        devices.push(json!({
            "device": device.as_str(),
            "capability": capability.id.to_string(),
            "driver": status.driver,
            "state": status.state,
        }));
    }
    Ok(json!({ "devices": devices }))
}
