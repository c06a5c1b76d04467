use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use denorm_core::{
    denormalize, Accessor, Catalog, CyclePolicy, Denormalized, EntityStore, PlainValue, Schema,
    SharedValue,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "denorm.v1";
const LOG_ENV_VAR: &str = "DENORM_LOG";

#[derive(Debug, Parser)]
#[command(name = "denorm")]
#[command(about = "Rebuild nested JSON from a normalized entity store")]
struct Cli {
    /// Raise log verbosity: -v info, -vv debug, -vvv trace.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Denormalize a value against the root schema of a schema document.
    Resolve(ResolveArgs),
    /// Summarize the entity definitions in a schema document.
    Describe(DescribeArgs),
}

#[derive(Debug, Args)]
struct ResolveArgs {
    #[arg(long)]
    entities: PathBuf,
    #[arg(long)]
    schema: PathBuf,
    #[arg(long, conflicts_with = "value_json", required_unless_present = "value_json")]
    value: Option<PathBuf>,
    #[arg(long)]
    value_json: Option<String>,
    #[arg(long, value_enum, default_value_t = RepresentationArg::Plain)]
    representation: RepresentationArg,
    #[arg(long, value_enum, default_value_t = CycleArg::Error)]
    on_cycle: CycleArg,
    #[arg(long, default_value_t = false)]
    include_bag: bool,
}

#[derive(Debug, Args)]
struct DescribeArgs {
    #[arg(long)]
    schema: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RepresentationArg {
    Plain,
    Shared,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CycleArg {
    Error,
    EmitId,
}

impl CycleArg {
    fn into_policy(self) -> CyclePolicy {
        match self {
            Self::Error => CyclePolicy::Error,
            Self::EmitId => CyclePolicy::EmitId,
        }
    }
}

/// Entity definitions plus the schema the root value is read with.
#[derive(Debug, Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    entities: Catalog,
    #[serde(default)]
    root: Option<Schema>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Command::Resolve(args) => run_resolve(&args),
        Command::Describe(args) => run_describe(&args),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse JSON in {}", path.display()))
}

fn run_resolve(args: &ResolveArgs) -> Result<()> {
    let document: SchemaDocument = read_json(&args.schema)?;
    let store: Value = read_json(&args.entities)?;
    let value: Value = match (&args.value, &args.value_json) {
        (Some(path), _) => read_json(path)?,
        (None, Some(text)) => serde_json::from_str(text).context("failed to parse --value-json")?,
        (None, None) => return Err(anyhow!("either --value or --value-json is required")),
    };
    tracing::info!(
        entity_schemas = document.entities.len(),
        root = document.root.as_ref().map_or("none", Schema::variant_name),
        "loaded schema document"
    );

    let policy = args.on_cycle.into_policy();
    let payload = match args.representation {
        RepresentationArg::Plain => {
            resolve_as::<PlainValue>(store, value, &document, policy, args.include_bag)?
        }
        RepresentationArg::Shared => {
            resolve_as::<SharedValue>(store, value, &document, policy, args.include_bag)?
        }
    };
    emit_json(payload)
}

fn resolve_as<V: Accessor + From<Value>>(
    store: Value,
    value: Value,
    document: &SchemaDocument,
    policy: CyclePolicy,
    include_bag: bool,
) -> Result<Value> {
    let store = EntityStore::<V>::from_json(store).context("failed to load entity store")?;
    let value = V::from(value);
    let result = denormalize(&value, &store, &document.entities, document.root.as_ref())
        .context("denormalization failed")?;

    let root = result.to_json(policy).context("failed to materialize result")?;
    let mut payload = serde_json::json!({
        "resolved": root.is_some(),
        "value": root,
        "resolved_entities": result.bag.len(),
    });
    if include_bag {
        if let Value::Object(object) = &mut payload {
            object.insert("bag".to_string(), bag_json(&result, policy)?);
        }
    }
    Ok(payload)
}

fn bag_json<V: Accessor>(result: &Denormalized<V>, policy: CyclePolicy) -> Result<Value> {
    let mut collections: BTreeMap<String, serde_json::Map<String, Value>> = BTreeMap::new();
    for (handle, key, id, _) in result.bag.iter() {
        // Expand from the handle so the entry counts as its own ancestor.
        let flat = result
            .bag
            .materialize(&V::entity(handle), policy)
            .with_context(|| format!("failed to materialize bag entry {key}/{id}"))?;
        collections.entry(key.to_string()).or_default().insert(id.to_string(), flat);
    }
    Ok(Value::Object(
        collections.into_iter().map(|(key, entities)| (key, Value::Object(entities))).collect(),
    ))
}

fn run_describe(args: &DescribeArgs) -> Result<()> {
    let document: SchemaDocument = read_json(&args.schema)?;
    let entities = document
        .entities
        .iter()
        .map(|entity| {
            let fields = entity
                .fields()
                .iter()
                .map(|(name, schema)| {
                    (name.clone(), Value::String(schema.variant_name().to_string()))
                })
                .collect::<serde_json::Map<_, _>>();
            serde_json::json!({
                "key": entity.key(),
                "id_attribute": entity.id_attribute(),
                "fields": fields,
            })
        })
        .collect::<Vec<_>>();

    emit_json(serde_json::json!({
        "entities": entities,
        "root": document.root.as_ref().map(Schema::variant_name),
    }))
}
