//! gqlstore CLI tool
//!
//! Command-line interface for exercising a record store against JSON files.
//!
//! ## Commands
//!
//! - `normalize`: Write a server response into a store and print the resulting records
//! - `read`: Read an operation from a store and print the snapshot
//! - `check`: Report whether an operation can be fulfilled from a store

use clap::{Parser, Subcommand};
use gql_store::{
    check::Availability,
    config::{ConfigProvider, StoreConfig, TomlConfigProvider},
    environment::Environment,
    normalize::GraphQLResponse,
    operation::{OperationDescriptor, OperationRequest},
    store::{RecordMap, Store},
    StoreError,
};
use serde_json::{json, Value};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Parser)]
#[command(name = "gqlstore")]
#[command(
    author,
    version,
    about = "A tool for normalizing and reading GraphQL responses",
    long_about = None
)]
struct Cli {
    /// Configuration file with a [store] table
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct OperationArgs {
    /// Operation descriptor (JSON)
    #[arg(short, long)]
    operation: PathBuf,

    /// Variables as an inline JSON object
    #[arg(short, long, default_value = "{}")]
    variables: String,

    /// Existing store records (JSON map of id to record); starts empty when omitted
    #[arg(short, long)]
    store: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize a response into the store and print the records
    Normalize {
        #[command(flatten)]
        args: OperationArgs,

        /// Server response (JSON)
        #[arg(short, long)]
        response: PathBuf,

        /// Write the records here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Read the operation from the store and print the snapshot
    Read {
        #[command(flatten)]
        args: OperationArgs,
    },

    /// Check whether the store holds everything the operation selects
    Check {
        #[command(flatten)]
        args: OperationArgs,
    },
}

fn read_json(path: &Path) -> Result<Value, StoreError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn load_config(path: Option<&Path>) -> Result<StoreConfig, StoreError> {
    match path {
        Some(path) => TomlConfigProvider::new(path.to_path_buf()).get_config(),
        None => Ok(StoreConfig::default()),
    }
}

fn load(
    args: &OperationArgs,
    config: StoreConfig,
) -> Result<(Environment, OperationRequest), StoreError> {
    let operation = Arc::new(OperationDescriptor::from_json(read_json(&args.operation)?)?);
    let variables = match serde_json::from_str::<Value>(&args.variables)? {
        Value::Object(map) => map,
        other => {
            return Err(StoreError::InvalidOperation(format!(
                "Variables must be a JSON object, got {other}"
            )))
        }
    };
    let request = operation.request(variables)?;
    let records = match args.store.as_ref() {
        Some(path) => RecordMap::from_json(read_json(path)?)?,
        None => RecordMap::new(),
    };
    let store = Store::from_records(records, config, None);
    Ok((Environment::with_store(store), request))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Normalize { args, response, out } => {
            let (mut environment, request) = load(&args, config)?;
            let response = GraphQLResponse::from_json(read_json(&response)?)?;
            let execution = environment.execute(request);
            let result = environment.on_payload(execution, response)?;
            tracing::info!("Updated {} records", result.updated.len());
            for err in result.errors.iter() {
                tracing::warn!("{err}");
            }
            let records = serde_json::to_string_pretty(&environment.store().records().to_json()?)?;
            match out {
                Some(path) => fs::write(path, records)?,
                None => println!("{records}"),
            }
            Ok(())
        }

        Commands::Read { args } => {
            let (environment, request) = load(&args, config)?;
            let snapshot = environment.lookup(&request.root_selector())?;
            let report = json!({
                "data": snapshot.data,
                "isMissingData": snapshot.is_missing_data,
                "fieldErrors": snapshot.field_errors,
                "missingRequiredFields": snapshot.missing_required_fields,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Commands::Check { args } => {
            let (environment, request) = load(&args, config)?;
            match environment.check(&request) {
                Availability::Available => println!("available"),
                Availability::Missing => {
                    println!("missing");
                    std::process::exit(1);
                }
            }
            Ok(())
        }
    }
}
