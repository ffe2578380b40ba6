//! entities-registry CLI
//!
//! Command-line access to an entities registry:
//! - Uploading entity files
//! - Reading, searching and deleting entities
//! - Validating entity files offline
//! - Compacting a persistent store

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use entities_registry::upload::{self, EntityFormat, UploadError, UploadOptions, VersionBump};
use entities_registry::{
    BackendKind, ConfigError, ConfigOverrides, Credentials, Registry, RegistryConfig,
    RegistryError, SearchQuery,
};

fn parse_backend(s: &str) -> Result<BackendKind, ConfigError> {
    s.parse()
}

fn parse_format(s: &str) -> Result<EntityFormat, UploadError> {
    s.parse()
}

fn entity_noun(n: usize) -> &'static str {
    if n == 1 {
        "entity"
    } else {
        "entities"
    }
}

#[derive(Parser)]
#[command(name = "entities-registry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Registry of versioned, URI-addressed entity documents")]
#[command(long_about = "entities-registry - manage entity schema documents\n\n\
    Entities are identified by URIs of the form <namespace>/<version>/<name>,\n\
    for example http://onto-ns.com/meta/0.1/Person.\n\n\
    Examples:\n\
      entities-registry --data-dir ./registry upload --dir ./entities\n\
      entities-registry --data-dir ./registry get http://onto-ns.com/meta/0.1/Person\n\
      entities-registry --data-dir ./registry search --prop age --prop name")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Storage backend (memory or persistent)
    #[arg(long, global = true, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    /// Data directory; implies the persistent backend unless --backend is given
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Bearer token presented for writes
    #[arg(long, global = true)]
    token: Option<String>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload entity files
    #[command(group(ArgGroup::new("source").required(true).multiple(true).args(["file", "dir"])))]
    Upload {
        /// Entity file to upload
        #[arg(short, long, value_name = "FILE", action = clap::ArgAction::Append)]
        file: Vec<PathBuf>,

        /// Directory of entity files to upload
        #[arg(short, long, value_name = "DIR", action = clap::ArgAction::Append)]
        dir: Vec<PathBuf>,

        /// File format to upload (json or yaml)
        #[arg(long, default_value = "json", value_parser = parse_format)]
        format: EntityFormat,

        /// Stop at the first file that cannot be uploaded
        #[arg(long)]
        fail_fast: bool,

        /// Upload entities that differ from the stored ones under a new version;
        /// without VERSION the patch level is raised (0.1 -> 0.1.1)
        #[arg(long, value_name = "VERSION", num_args = 0..=1)]
        bump_version: Option<Option<String>>,
    },

    /// Print one entity
    Get {
        /// Entity URI
        uri: String,
    },

    /// Inclusive search; results match ANY of the given criteria
    Search {
        /// Entity URI
        #[arg(long = "id", value_name = "URI")]
        ids: Vec<String>,

        /// Property name
        #[arg(long = "prop", value_name = "NAME")]
        properties: Vec<String>,

        /// Dimension name
        #[arg(long = "dim", value_name = "NAME")]
        dimensions: Vec<String>,
    },

    /// Delete entities
    Delete {
        /// Entity URIs
        #[arg(required = true)]
        uris: Vec<String>,
    },

    /// Validate entity files without storing them
    Validate {
        /// Entity files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Fold the write-ahead log into a snapshot (persistent backend only)
    Compact,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(
    file: Option<&Path>,
    backend: Option<BackendKind>,
    data_dir: Option<PathBuf>,
) -> Result<RegistryConfig> {
    RegistryConfig::load(file, ConfigOverrides { backend, data_dir })
        .context("failed to load configuration")
}

fn open_for_writes(config: &RegistryConfig) -> Result<Registry> {
    if config.is_ephemeral() {
        warn!("using the in-memory backend; changes are discarded on exit (pass --data-dir to keep them)");
    }
    Registry::open(config).context("failed to open registry")
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> Result<ExitCode> {
    let Cli {
        config,
        backend,
        data_dir,
        token,
        command,
        ..
    } = cli;
    let credentials = token.map_or_else(Credentials::anonymous, Credentials::bearer);
    let settings = || load_config(config.as_deref(), backend, data_dir.clone());
    let open = || -> Result<Registry> {
        Registry::open(&settings()?).context("failed to open registry")
    };

    match command {
        Commands::Validate { files } => Ok(validate_files(&files)),

        Commands::Compact => compact(&settings()?),

        Commands::Upload {
            file,
            dir,
            format,
            fail_fast,
            bump_version,
        } => {
            let paths = upload::collect_paths(&file, &dir, format)?;
            let registry = open_for_writes(&settings()?)?;
            let options = UploadOptions {
                fail_fast,
                format,
                bump_version: bump_version
                    .map(|version| version.map_or(VersionBump::Patch, VersionBump::To)),
            };
            let report = upload::upload(&registry, &credentials, &paths, &options)?;

            for path in &report.unsupported {
                let format = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
                eprintln!("File format '{format}' is not supported.");
            }
            for (path, _) in &report.skipped {
                println!("Skipping file: {}", path.display());
            }
            for format in report.skipped_formats() {
                println!(
                    "Entities using the file format '{format}' can be uploaded by adding the option: --format={format}"
                );
            }
            for uri in &report.unchanged {
                println!("Entity already exists in the database: {uri}");
            }
            for (path, uri) in &report.conflicting {
                eprintln!("Entity already exists in the database, but they differ in their content: {uri}");
                println!("Skipping file: {}", path.display());
            }
            if !report.conflicting.is_empty() {
                println!("Pass --bump-version to upload changed entities under a new version.");
            }
            for (stored, bumped) in &report.bumped {
                println!("Uploading {stored} as version {}", bumped.version());
            }
            for failure in &report.failures {
                eprintln!("{failure}");
            }

            let uploaded = report.uploaded();
            if uploaded == 0 {
                println!("No entities were uploaded.");
            } else {
                println!("Successfully uploaded {uploaded} {}:", entity_noun(uploaded));
                for uri in &report.created {
                    println!("  {uri}");
                }
            }

            if report.failures.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                let failed = report.failures.len();
                eprintln!(
                    "Failed to upload {failed} {}, see above for more details.",
                    entity_noun(failed)
                );
                Ok(ExitCode::FAILURE)
            }
        }

        Commands::Get { uri } => match open()?.get(&uri) {
            Ok(entity) => {
                print_json(&entity)?;
                Ok(ExitCode::SUCCESS)
            }
            Err(err @ RegistryError::NotFound { .. }) => {
                eprintln!("{err}");
                Ok(ExitCode::FAILURE)
            }
            Err(err) => Err(err.into()),
        },

        Commands::Search {
            ids,
            properties,
            dimensions,
        } => {
            let mut query = SearchQuery::new();
            for uri in entities_registry::parse_identities(&ids)? {
                query = query.with_identity(uri);
            }
            for name in properties {
                query = query.with_property(name);
            }
            for name in dimensions {
                query = query.with_dimension(name);
            }

            match open()?.search(&query) {
                Ok(found) => {
                    print_json(&found)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(err @ RegistryError::NotFound { .. }) => {
                    eprintln!("Could not find entities.");
                    tracing::debug!(error = %err, "search returned nothing");
                    Ok(ExitCode::FAILURE)
                }
                Err(err) => Err(err.into()),
            }
        }

        Commands::Delete { uris } => {
            let deleted = open_for_writes(&settings()?)?.delete(&credentials, &uris)?;
            println!("Deleted {} {}:", deleted.len(), entity_noun(deleted.len()));
            for uri in deleted {
                println!("  {uri}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn validate_files(files: &[PathBuf]) -> ExitCode {
    let mut failed = 0usize;
    for path in files {
        match upload::load_entity(path) {
            Ok((uri, document)) => {
                let dialect = document
                    .dialect()
                    .map_or_else(|| "unknown".to_string(), |d| format!("{d:?}").to_lowercase());
                println!("{}: ok ({uri}, {dialect} dialect)", path.display());
            }
            Err(err) => {
                eprintln!("{err}");
                failed += 1;
            }
        }
    }

    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(feature = "persistent")]
fn compact(config: &RegistryConfig) -> Result<ExitCode> {
    if config.backend != BackendKind::Persistent {
        bail!("compact requires the persistent backend");
    }
    let dir = config
        .data_dir
        .as_deref()
        .context("compact requires --data-dir")?;

    let store = entities_registry::open_database(dir, Some(config.persistent_config()))
        .with_context(|| format!("failed to open {}", dir.display()))?;
    let result = store.compact()?;

    if result.snapshot_written {
        println!(
            "Compacted {} {} (log {} -> {} bytes).",
            result.entities,
            entity_noun(result.entities),
            result.wal_size_before,
            result.wal_size_after
        );
    } else {
        println!("Nothing to compact.");
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(not(feature = "persistent"))]
fn compact(_config: &RegistryConfig) -> Result<ExitCode> {
    bail!("this build does not include the persistent backend")
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
