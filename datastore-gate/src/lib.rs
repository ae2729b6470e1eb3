//! Library module for datastore-gate
//!
//! Argument parsing and command execution live here so they can be tested
//! without a database. The binary in `main.rs` only wires them together.

use clap::{Args, Parser, Subcommand};
use datastore_gate_core::{
    ActiveFlagResolver, AliasViewStatus, CatalogDependency, Datastore, DatastoreAction,
    DatastoreConfig, PoolConfig, ResourceDescriptor, Result,
    alias_view::{aliases_of, list_aliases},
    config::{DEFAULT_PROBE_TABLE, DEFAULT_SCHEMA},
    pool::open_pool,
    resolve_endpoints,
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{error, info};

/// CLI argument structure
#[derive(Debug, Parser)]
#[command(name = "datastore-gate")]
#[command(about = "Startup safety gates for a PostgreSQL datastore")]
#[command(version)]
#[command(long_about = "
Datastore Gate - verify the datastore security boundary

Runs the checks a datastore-enabled service performs at startup:
- the read endpoint does not share a database with the application
- the read-only credential really cannot write (probed, always rolled back)
- the _table_metadata alias view exists

Connection strings may be passed as flags or through the environment.
Credentials are redacted in every log line.

EXAMPLES:
  DATASTORE_WRITE_URL=postgres://writer:pw@db/datastore \\
  DATASTORE_READ_URL=postgres://reader:pw@db/datastore \\
  DATASTORE_CONTROL_URL=postgres://app:pw@db/app \\
    datastore-gate check

  datastore-gate active 3f1c2a9e-resource-id
  datastore-gate aliases --of readings
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(flatten)]
    pub endpoints: EndpointArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the full startup gate and report the outcome
    Check,
    /// Print whether a resource has a datastore table
    Active(ActiveArgs),
    /// List the view-to-table mapping from the alias view
    Aliases(AliasesArgs),
}

/// Arguments for `active`
#[derive(Debug, Args)]
pub struct ActiveArgs {
    /// Resource id
    #[arg(value_name = "RESOURCE_ID")]
    pub resource_id: String,
}

/// Arguments for `aliases`
#[derive(Debug, Args)]
pub struct AliasesArgs {
    /// Only list views built on this table
    #[arg(long, value_name = "TABLE")]
    pub of: Option<String>,
}

/// Datastore endpoints and gate settings
#[derive(Debug, Args)]
pub struct EndpointArgs {
    /// Application (control) database URL
    #[arg(
        long,
        env = "DATASTORE_CONTROL_URL",
        hide_env_values = true,
        help = "Application database connection string"
    )]
    pub control_url: Option<String>,

    /// Datastore write URL
    #[arg(
        long,
        env = "DATASTORE_WRITE_URL",
        hide_env_values = true,
        help = "Datastore write connection string (required)"
    )]
    pub write_url: Option<String>,

    /// Datastore read-only URL
    #[arg(
        long,
        env = "DATASTORE_READ_URL",
        hide_env_values = true,
        help = "Datastore read-only connection string; empty disables SQL search"
    )]
    pub read_url: Option<String>,

    /// Skip the endpoint separation check
    #[arg(
        long,
        env = "DATASTORE_DEBUG",
        action = clap::ArgAction::SetTrue,
        value_parser = clap::builder::BoolishValueParser::new(),
        help = "Skip the endpoint separation check (the write probe still runs)"
    )]
    pub debug: bool,

    /// Probe table name
    #[arg(long, env = "DATASTORE_PROBE_TABLE", default_value = DEFAULT_PROBE_TABLE)]
    pub probe_table: String,

    /// Datastore schema
    #[arg(long, env = "DATASTORE_SCHEMA", default_value = DEFAULT_SCHEMA)]
    pub schema: String,

    /// Connection acquire timeout
    #[arg(long, default_value_t = 30, value_name = "SECONDS")]
    pub connect_timeout: u64,

    /// Pool size
    #[arg(long, default_value_t = 10)]
    pub max_connections: u32,
}

impl EndpointArgs {
    /// Builds the gate configuration from the arguments.
    pub fn to_config(&self) -> DatastoreConfig {
        let mut config = match &self.write_url {
            Some(url) => DatastoreConfig::new(url.as_str()),
            None => DatastoreConfig::default(),
        };
        if let Some(url) = &self.control_url {
            config = config.with_control_url(url.as_str());
        }
        if let Some(url) = &self.read_url {
            config = config.with_read_url(url.as_str());
        }

        config
            .with_debug(self.debug)
            .with_probe_table(self.probe_table.as_str())
            .with_schema(self.schema.as_str())
            .with_pool(
                PoolConfig::default()
                    .with_connect_timeout(Duration::from_secs(self.connect_timeout))
                    .with_max_connections(self.max_connections),
            )
    }
}

/// Output and logging flags
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, help = "Suppress all log output except errors")]
    pub quiet: bool,

    /// JSON logs
    #[arg(long, help = "Emit logs as newline-delimited JSON")]
    pub log_json: bool,

    /// JSON output
    #[arg(long, help = "Print command results as JSON")]
    pub json: bool,
}

/// Outcome of a passing `check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    /// Write endpoint identity
    pub write: String,
    /// Read endpoint identity, when configured
    pub read: Option<String>,
    /// Probe statements refused by the read credential
    pub probe_refusals: usize,
    /// The read endpoint refused writes as a replica
    pub read_only_replica: bool,
    /// What the alias view step did
    pub alias_view: AliasViewStatus,
    /// Actions the API layer may expose
    pub actions: Vec<DatastoreAction>,
}

impl CheckSummary {
    /// Summarizes a configured datastore.
    pub fn from_datastore(datastore: &Datastore) -> Self {
        let endpoints = datastore.endpoints();
        let report = datastore.probe_report();
        Self {
            write: endpoints.write.identity().to_string(),
            read: endpoints.read.as_ref().map(|r| r.identity().to_string()),
            probe_refusals: report.map_or(0, |r| r.results.len()),
            read_only_replica: report.is_some_and(|r| r.read_only_replica()),
            alias_view: datastore.alias_view_status(),
            actions: datastore.available_actions(),
        }
    }
}

impl fmt::Display for CheckSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Datastore startup gate passed")?;
        writeln!(f, "Write: {}", self.write)?;
        match &self.read {
            Some(read) if self.read_only_replica => writeln!(
                f,
                "Read: {} (read-only replica, {} write probes refused)",
                read, self.probe_refusals
            )?,
            Some(read) => writeln!(
                f,
                "Read: {} ({} write probes refused)",
                read, self.probe_refusals
            )?,
            None => writeln!(f, "Read: not configured")?,
        }
        let alias_view = match self.alias_view {
            AliasViewStatus::AlreadyPresent => "already present",
            AliasViewStatus::Created => "created",
            AliasViewStatus::CreatedConcurrently => "created by another process",
        };
        writeln!(f, "Alias view: {}", alias_view)?;
        let actions: Vec<&str> = self.actions.iter().map(|a| a.name()).collect();
        write!(f, "Actions: {}", actions.join(", "))
    }
}

/// Executes the parsed command and returns what should be printed.
///
/// # Errors
/// Returns the gate error unchanged: configuration, security, database, or
/// connection failures.
pub async fn run(cli: &Cli) -> Result<String> {
    match &cli.command {
        Command::Check => check(&cli.endpoints, cli.global.json).await,
        Command::Active(args) => active(&cli.endpoints, &args.resource_id, cli.global.json).await,
        Command::Aliases(args) => {
            aliases(&cli.endpoints, args.of.as_deref(), cli.global.json).await
        }
    }
}

/// Runs the startup gate.
async fn check(endpoints: &EndpointArgs, json: bool) -> Result<String> {
    let config = endpoints.to_config();
    config.pool.validate()?;
    info!("Running startup gate: {}", config);

    let datastore = Datastore::configure(config).await.map_err(|e| {
        error!("Startup gate failed: {}", e);
        e
    })?;

    let summary = CheckSummary::from_datastore(&datastore);
    datastore.close().await;

    if json {
        to_json(&summary)
    } else {
        Ok(summary.to_string())
    }
}

/// Looks up the activity flag for one resource over the write endpoint.
async fn active(endpoints: &EndpointArgs, resource_id: &str, json: bool) -> Result<String> {
    let config = endpoints.to_config();
    config.pool.validate()?;
    let resolved = resolve_endpoints(&config)?;
    let pool = open_pool(&resolved.write, &config.pool)?;

    let resolver = ActiveFlagResolver::new(pool.clone(), config.schema.as_str());
    let active = resolver.is_active(resource_id).await;
    pool.close().await;
    let descriptor = ResourceDescriptor::with_id(resource_id).with_datastore_active(active?);

    if json {
        to_json(&descriptor)
    } else {
        Ok(format_active(&descriptor))
    }
}

/// Lists alias view entries over the write endpoint.
async fn aliases(endpoints: &EndpointArgs, of: Option<&str>, json: bool) -> Result<String> {
    let config = endpoints.to_config();
    config.pool.validate()?;
    let resolved = resolve_endpoints(&config)?;
    let pool = open_pool(&resolved.write, &config.pool)?;

    let entries: Result<Vec<CatalogDependency>> = match of {
        Some(relation) => aliases_of(&pool, &config.schema, relation)
            .await
            .map(|views| {
                views
                    .into_iter()
                    .map(|view| CatalogDependency {
                        dependent_relation: relation.to_string(),
                        dependee_relation: view,
                    })
                    .collect()
            }),
        None => list_aliases(&pool, &config.schema).await,
    };
    pool.close().await;
    let entries = entries?;

    info!("Found {} alias entries", entries.len());
    if json {
        to_json(&entries)
    } else {
        Ok(format_aliases(&entries))
    }
}

/// One line per resource: `<id>: datastore_active=<bool>`.
pub fn format_active(descriptor: &ResourceDescriptor) -> String {
    format!(
        "{}: datastore_active={}",
        descriptor.id(),
        descriptor.datastore_active().unwrap_or(false)
    )
}

/// One `view -> table` line per alias entry.
pub fn format_aliases(entries: &[CatalogDependency]) -> String {
    if entries.is_empty() {
        return "No aliases found".to_string();
    }
    entries
        .iter()
        .map(|e| format!("{} -> {}", e.dependee_relation, e.dependent_relation))
        .collect::<Vec<_>>()
        .join("\n")
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| {
        datastore_gate_core::DatastoreError::configuration(format!(
            "Failed to serialize output: {}",
            e
        ))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Every DATASTORE_* variable unset, so ambient settings cannot leak in.
    const CLEAN_ENV: [(&str, Option<&str>); 6] = [
        ("DATASTORE_CONTROL_URL", None),
        ("DATASTORE_WRITE_URL", None),
        ("DATASTORE_READ_URL", None),
        ("DATASTORE_DEBUG", None),
        ("DATASTORE_PROBE_TABLE", None),
        ("DATASTORE_SCHEMA", None),
    ];

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        temp_env::with_vars(CLEAN_ENV, || Cli::try_parse_from(args))
    }

    mod arguments {
        use super::*;

        #[test]
        fn test_check_with_flags() {
            let cli = parse(&[
                "datastore-gate",
                "--write-url",
                "postgres://writer:pw@db/datastore",
                "--read-url",
                "postgres://reader:pw@db/datastore",
                "--control-url",
                "postgres://app:pw@db/app",
                "check",
            ])
            .unwrap();

            assert!(matches!(cli.command, Command::Check));
            let config = cli.endpoints.to_config();
            assert_eq!(
                config.write_url.as_deref(),
                Some("postgres://writer:pw@db/datastore")
            );
            assert!(config.has_read_url());
            assert!(config.control_url.is_some());
            assert!(!config.debug);
            assert_eq!(config.probe_table, "writetest");
            assert_eq!(config.schema, "public");
        }

        #[test]
        fn test_active_requires_resource_id() {
            assert!(parse(&["datastore-gate", "active"]).is_err());

            let cli = parse(&["datastore-gate", "active", "abc123"]).unwrap();
            assert!(
                matches!(&cli.command, Command::Active(args) if args.resource_id == "abc123"),
                "{:?}",
                cli.command
            );
        }

        #[test]
        fn test_aliases_filter() {
            let cli = parse(&["datastore-gate", "aliases", "--of", "readings"]).unwrap();
            assert!(
                matches!(&cli.command, Command::Aliases(args) if args.of.as_deref() == Some("readings")),
                "{:?}",
                cli.command
            );
        }

        #[test]
        fn test_subcommand_required() {
            assert!(parse(&["datastore-gate"]).is_err());
        }

        #[test]
        fn test_verbosity_and_output_flags() {
            let cli = parse(&["datastore-gate", "-vv", "--log-json", "--json", "check"]).unwrap();
            assert_eq!(cli.global.verbose, 2);
            assert!(!cli.global.quiet);
            assert!(cli.global.log_json);
            assert!(cli.global.json);
        }

        #[test]
        fn test_pool_settings() {
            let cli = parse(&[
                "datastore-gate",
                "--connect-timeout",
                "5",
                "--max-connections",
                "2",
                "check",
            ])
            .unwrap();
            let config = cli.endpoints.to_config();

            assert_eq!(config.pool.connect_timeout, Duration::from_secs(5));
            assert_eq!(config.pool.max_connections, 2);
        }
    }

    mod environment {
        use super::*;

        #[test]
        fn test_endpoints_from_environment() {
            temp_env::with_vars(
                [
                    (
                        "DATASTORE_WRITE_URL",
                        Some("postgres://writer:pw@db/datastore"),
                    ),
                    ("DATASTORE_READ_URL", Some("postgres://reader:pw@db/datastore")),
                    ("DATASTORE_CONTROL_URL", Some("postgres://app:pw@db/app")),
                    ("DATASTORE_DEBUG", Some("yes")),
                    ("DATASTORE_PROBE_TABLE", Some("probe")),
                    ("DATASTORE_SCHEMA", Some("datastore")),
                ],
                || {
                    let cli = Cli::try_parse_from(["datastore-gate", "check"]).unwrap();
                    let config = cli.endpoints.to_config();

                    assert!(config.write_url.is_some());
                    assert!(config.has_read_url());
                    assert!(config.debug);
                    assert_eq!(config.probe_table, "probe");
                    assert_eq!(config.schema, "datastore");
                },
            );
        }

        #[test]
        fn test_empty_read_url_disables_read() {
            temp_env::with_vars(
                [
                    (
                        "DATASTORE_WRITE_URL",
                        Some("postgres://writer:pw@db/datastore"),
                    ),
                    ("DATASTORE_READ_URL", Some("")),
                    ("DATASTORE_DEBUG", None),
                ],
                || {
                    let cli = Cli::try_parse_from(["datastore-gate", "check"]).unwrap();
                    assert!(!cli.endpoints.to_config().has_read_url());
                },
            );
        }

        #[test]
        fn test_flag_overrides_environment() {
            temp_env::with_vars(
                [("DATASTORE_SCHEMA", Some("from_env"))],
                || {
                    let cli =
                        Cli::try_parse_from(["datastore-gate", "--schema", "from_flag", "check"])
                            .unwrap();
                    assert_eq!(cli.endpoints.schema, "from_flag");
                },
            );
        }

        #[test]
        fn test_debug_false_in_environment() {
            temp_env::with_vars([("DATASTORE_DEBUG", Some("false"))], || {
                let cli = Cli::try_parse_from(["datastore-gate", "check"]).unwrap();
                assert!(!cli.endpoints.debug);
            });
        }
    }

    mod commands {
        use super::*;

        #[tokio::test]
        async fn test_check_without_write_url_is_configuration_error() {
            let cli = parse(&["datastore-gate", "check"]).unwrap();

            let err = run(&cli).await.unwrap_err();
            assert!(err.is_configuration(), "{:?}", err);
        }

        #[tokio::test]
        async fn test_check_rejects_read_on_control_database() {
            let cli = parse(&[
                "datastore-gate",
                "--write-url",
                "postgres://writer@localhost:1/datastore",
                "--control-url",
                "postgres://app@localhost:1/app",
                "--read-url",
                "postgres://reader@localhost:1/app",
                "check",
            ])
            .unwrap();

            let err = run(&cli).await.unwrap_err();
            assert!(err.is_configuration(), "{:?}", err);
        }

        #[tokio::test]
        async fn test_aliases_rejects_invalid_pool_size() {
            let cli = parse(&[
                "datastore-gate",
                "--write-url",
                "postgres://writer@localhost:1/datastore",
                "--max-connections",
                "0",
                "aliases",
            ])
            .unwrap();

            let err = run(&cli).await.unwrap_err();
            assert!(err.is_configuration(), "{:?}", err);
        }
    }

    mod output {
        use super::*;

        fn summary() -> CheckSummary {
            CheckSummary {
                write: "db:5432/datastore".to_string(),
                read: Some("db:5432/datastore".to_string()),
                probe_refusals: 2,
                read_only_replica: false,
                alias_view: AliasViewStatus::Created,
                actions: datastore_gate_core::available_actions(true),
            }
        }

        #[test]
        fn test_check_summary_text() {
            let text = summary().to_string();

            assert!(text.starts_with("Datastore startup gate passed"));
            assert!(text.contains("Read: db:5432/datastore (2 write probes refused)"));
            assert!(text.contains("Alias view: created"));
            assert!(text.ends_with("datastore_search_sql"));
        }

        #[test]
        fn test_check_summary_without_read() {
            let summary = CheckSummary {
                read: None,
                probe_refusals: 0,
                actions: datastore_gate_core::available_actions(false),
                ..summary()
            };
            let text = summary.to_string();

            assert!(text.contains("Read: not configured"));
            assert!(!text.contains("datastore_search_sql"));
        }

        #[test]
        fn test_check_summary_json() {
            let json: serde_json::Value =
                serde_json::from_str(&to_json(&summary()).unwrap()).unwrap();

            assert_eq!(json["alias_view"], "Created");
            assert_eq!(json["actions"][4], "datastore_search_sql");
        }

        #[test]
        fn test_format_active() {
            let descriptor = ResourceDescriptor::with_id("abc123").with_datastore_active(true);
            assert_eq!(format_active(&descriptor), "abc123: datastore_active=true");
        }

        #[test]
        fn test_format_aliases() {
            assert_eq!(format_aliases(&[]), "No aliases found");

            let entries = [CatalogDependency {
                dependent_relation: "readings".to_string(),
                dependee_relation: "latest_readings".to_string(),
            }];
            assert_eq!(format_aliases(&entries), "latest_readings -> readings");
        }
    }
}
