use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use actor_migration::{
    MigrationOrchestrator, MigrationSettings,
    settings::{DEFAULT_DOWNTIME_THRESHOLD, DEFAULT_ITEMS_PER_CHUNK, DEFAULT_ITEMS_PER_ENUMERATION},
};
use actor_migration_remote::{
    RetryPolicy, RetrySettings,
    retry::{
        DEFAULT_CLIENT_CLEANUP_INTERVAL, DEFAULT_CLIENT_IDLE_TIMEOUT, DEFAULT_MAX_NON_TRANSIENT_BACKOFF,
        DEFAULT_MAX_RETRY_COUNT, DEFAULT_MAX_TRANSIENT_BACKOFF,
    },
};
use clap::{Parser as ClapParser, Subcommand as ClapSubcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};

use crate::initializers::{init_context, shutdown_on_ctrl_c};

pub const MEMORY_DB: &str = "memory";

pub const DEFAULT_EXPONENTIAL_BASE: u32 = 2;
pub const DEFAULT_EXPONENTIAL_UNIT_MS: u64 = 100;
pub const DEFAULT_MAX_JITTER_MS: u64 = 1_000;

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(
    name = "actor-migrate",
    version,
    about = "Live migration of actor state between stores"
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Option<Subcommand>,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "source.address",
        default_value = "http://127.0.0.1:8080/",
        value_name = "URL",
        help = "Base address of the migration listener of the source service.",
        help_heading = "Source options",
        env = "ACTOR_MIGRATE_SOURCE_ADDRESS"
    )]
    pub source_address: String,
    #[arg(
        long = "source.request-timeout",
        default_value_t = 30,
        value_name = "SECONDS",
        help = "Timeout of a single request to the source.",
        help_heading = "Source options",
        env = "ACTOR_MIGRATE_SOURCE_REQUEST_TIMEOUT"
    )]
    pub request_timeout_secs: u64,
    #[arg(
        long = "checkpoints.db",
        default_value = "checkpoints.db",
        value_name = "PATH",
        help = "Database holding the migration checkpoints.",
        long_help = "Use `memory` to keep checkpoints in memory. A run started this way cannot be resumed after a restart.",
        help_heading = "Storage options",
        env = "ACTOR_MIGRATE_CHECKPOINTS_DB"
    )]
    pub checkpoints_db: PathBuf,
    #[arg(
        long = "target.db",
        default_value = "target.db",
        value_name = "PATH",
        help = "Database receiving the migrated actor state.",
        long_help = "Use `memory` for a throwaway in-memory target.",
        help_heading = "Storage options",
        env = "ACTOR_MIGRATE_TARGET_DB"
    )]
    pub target_db: PathBuf,
    #[arg(
        long = "migration.copy-parallelism",
        value_name = "WORKERS",
        help = "Workers running the copy phase. Defaults to the number of available CPUs.",
        help_heading = "Migration options",
        env = "ACTOR_MIGRATE_COPY_PARALLELISM"
    )]
    pub copy_parallelism: Option<u32>,
    #[arg(
        long = "migration.downtime-threshold",
        default_value_t = DEFAULT_DOWNTIME_THRESHOLD,
        value_name = "SEQUENCE_NUMBERS",
        help = "Catchup repeats until the source is fewer than this many sequence numbers ahead.",
        help_heading = "Migration options",
        env = "ACTOR_MIGRATE_DOWNTIME_THRESHOLD"
    )]
    pub downtime_threshold: i64,
    #[arg(
        long = "migration.items-per-enumeration",
        default_value_t = DEFAULT_ITEMS_PER_ENUMERATION,
        value_name = "RECORDS",
        help = "Records requested per enumeration call.",
        help_heading = "Migration options",
        env = "ACTOR_MIGRATE_ITEMS_PER_ENUMERATION"
    )]
    pub items_per_enumeration: usize,
    #[arg(
        long = "migration.items-per-chunk",
        default_value_t = DEFAULT_ITEMS_PER_CHUNK,
        value_name = "RECORDS",
        help = "Records per transport chunk within an enumeration.",
        help_heading = "Migration options",
        env = "ACTOR_MIGRATE_ITEMS_PER_CHUNK"
    )]
    pub items_per_chunk: usize,
    #[arg(
        long = "retry.max-count",
        default_value_t = DEFAULT_MAX_RETRY_COUNT,
        value_name = "COUNT",
        help = "Consecutive retries of the same failure before a call gives up.",
        help_heading = "Retry options",
        env = "ACTOR_MIGRATE_RETRY_MAX_COUNT"
    )]
    pub retry_max_count: u32,
    #[arg(
        long = "retry.policy",
        default_value_t = RetryPolicyKind::Constant,
        value_name = "POLICY",
        help = "Delay policy between retries.",
        long_help = "Possible values: constant, exponential. The constant policy waits a random delay bounded by the backoff options, the exponential one grows the delay every third attempt.",
        help_heading = "Retry options",
        env = "ACTOR_MIGRATE_RETRY_POLICY"
    )]
    pub retry_policy: RetryPolicyKind,
    #[arg(
        long = "retry.exponential-base",
        default_value_t = DEFAULT_EXPONENTIAL_BASE,
        value_name = "BASE",
        help = "Growth factor of the exponential policy.",
        help_heading = "Retry options",
        env = "ACTOR_MIGRATE_RETRY_EXPONENTIAL_BASE"
    )]
    pub exponential_base: u32,
    #[arg(
        long = "retry.exponential-unit",
        default_value_t = DEFAULT_EXPONENTIAL_UNIT_MS,
        value_name = "MILLISECONDS",
        help = "Delay of the first attempts under the exponential policy.",
        help_heading = "Retry options",
        env = "ACTOR_MIGRATE_RETRY_EXPONENTIAL_UNIT"
    )]
    pub exponential_unit_ms: u64,
    #[arg(
        long = "retry.max-jitter",
        default_value_t = DEFAULT_MAX_JITTER_MS,
        value_name = "MILLISECONDS",
        help = "Upper bound of the random jitter added by the exponential policy.",
        help_heading = "Retry options",
        env = "ACTOR_MIGRATE_RETRY_MAX_JITTER"
    )]
    pub max_jitter_ms: u64,
    #[arg(
        long = "retry.max-transient-backoff",
        default_value_t = DEFAULT_MAX_TRANSIENT_BACKOFF.as_millis() as u64,
        value_name = "MILLISECONDS",
        help = "Upper bound of the random delay before retrying a transient failure.",
        help_heading = "Retry options",
        env = "ACTOR_MIGRATE_RETRY_MAX_TRANSIENT_BACKOFF"
    )]
    pub max_transient_backoff_ms: u64,
    #[arg(
        long = "retry.max-non-transient-backoff",
        default_value_t = DEFAULT_MAX_NON_TRANSIENT_BACKOFF.as_millis() as u64,
        value_name = "MILLISECONDS",
        help = "Upper bound of the random delay before re-resolving the source.",
        help_heading = "Retry options",
        env = "ACTOR_MIGRATE_RETRY_MAX_NON_TRANSIENT_BACKOFF"
    )]
    pub max_non_transient_backoff_ms: u64,
    #[arg(
        long = "client.cleanup-interval",
        default_value_t = DEFAULT_CLIENT_CLEANUP_INTERVAL.as_secs(),
        value_name = "SECONDS",
        help = "Mean interval between sweeps of the client cache.",
        help_heading = "Retry options",
        env = "ACTOR_MIGRATE_CLIENT_CLEANUP_INTERVAL"
    )]
    pub client_cleanup_interval_secs: u64,
    #[arg(
        long = "client.idle-timeout",
        default_value_t = DEFAULT_CLIENT_IDLE_TIMEOUT.as_secs(),
        value_name = "SECONDS",
        help = "Cached clients idle for longer than this are evicted by the next sweep.",
        help_heading = "Retry options",
        env = "ACTOR_MIGRATE_CLIENT_IDLE_TIMEOUT"
    )]
    pub client_idle_timeout_secs: u64,
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "ACTOR_MIGRATE_LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Log options"
    )]
    pub log_level: Level,
    #[arg(
        long = "log.color",
        default_value_t = LogColor::Auto,
        help = "Output logs with ANSI color codes.",
        long_help = "Possible values: auto, always, never",
        help_heading = "Log options",
        env = "ACTOR_MIGRATE_LOG_COLOR"
    )]
    pub log_color: LogColor,
}

impl Options {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self.retry_policy {
            RetryPolicyKind::Constant => RetryPolicy::Constant {
                max_transient_backoff: Duration::from_millis(self.max_transient_backoff_ms),
                max_non_transient_backoff: Duration::from_millis(self.max_non_transient_backoff_ms),
            },
            RetryPolicyKind::Exponential => RetryPolicy::Exponential {
                base: self.exponential_base,
                unit: Duration::from_millis(self.exponential_unit_ms),
                max_jitter: Duration::from_millis(self.max_jitter_ms),
            },
        }
    }

    pub fn migration_settings(&self) -> MigrationSettings {
        let defaults = MigrationSettings::default();
        MigrationSettings {
            copy_phase_parallelism: self
                .copy_parallelism
                .unwrap_or(defaults.copy_phase_parallelism),
            downtime_threshold: self.downtime_threshold,
            items_per_enumeration: self.items_per_enumeration,
            items_per_chunk: self.items_per_chunk,
            source_service_address: self.source_address.clone(),
            retry: RetrySettings {
                policy: self.retry_policy(),
                default_max_retry_count: self.retry_max_count,
                client_cleanup_interval: Duration::from_secs(self.client_cleanup_interval_secs),
                client_idle_timeout: Duration::from_secs(self.client_idle_timeout_secs),
            },
        }
    }
}

#[derive(ClapSubcommand, Debug, Clone, Default, PartialEq)]
pub enum Subcommand {
    #[default]
    #[command(about = "Start a migration, or resume the one recorded in the checkpoints.")]
    Run,
    #[command(about = "Print the recorded state of the migration as JSON.")]
    Status,
    #[command(
        about = "Abort the migration, giving writes back to the source if they were rejected."
    )]
    Abort,
}

impl Subcommand {
    pub async fn run(self, opts: &Options) -> eyre::Result<()> {
        let settings = opts.migration_settings();
        settings.validate()?;

        let cancel = CancellationToken::new();
        let (ctx, cleanup) = init_context(opts, settings, cancel.clone()).await?;
        let orchestrator = MigrationOrchestrator::new(ctx);

        let result = match self {
            Subcommand::Run => {
                let watcher = shutdown_on_ctrl_c(cancel.clone());
                let outcome = orchestrator.start_or_resume(&cancel).await;
                watcher.abort();
                match outcome {
                    Ok(status) => {
                        info!(
                            keys_migrated = status.keys_migrated,
                            skipped = status.health.skipped_records,
                            "Migration completed"
                        );
                        println!("{}", serde_json::to_string_pretty(&status)?);
                        Ok(())
                    }
                    Err(err) => {
                        error!(%err, "Migration stopped");
                        Err(err.into())
                    }
                }
            }
            Subcommand::Status => {
                let status = orchestrator.migration_status().await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
                Ok(())
            }
            Subcommand::Abort => {
                let watcher = shutdown_on_ctrl_c(cancel.clone());
                let outcome = orchestrator.abort(&cancel).await;
                watcher.abort();
                outcome.map_err(Into::into)
            }
        };

        cancel.cancel();
        if let Err(err) = cleanup.await {
            warn!(%err, "Client cache cleanup task did not stop cleanly");
        }
        result
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum RetryPolicyKind {
    #[default]
    Constant,
    Exponential,
}

impl Display for RetryPolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicyKind::Constant => write!(f, "constant"),
            RetryPolicyKind::Exponential => write!(f, "exponential"),
        }
    }
}

impl FromStr for RetryPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "constant" => Ok(RetryPolicyKind::Constant),
            "exponential" => Ok(RetryPolicyKind::Exponential),
            _ => Err(format!(
                "Invalid retry policy '{s}'. Expected: constant or exponential"
            )),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum LogColor {
    #[default]
    Auto,
    Always,
    Never,
}

impl Display for LogColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogColor::Auto => write!(f, "auto"),
            LogColor::Always => write!(f, "always"),
            LogColor::Never => write!(f, "never"),
        }
    }
}

impl FromStr for LogColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(LogColor::Auto),
            "always" => Ok(LogColor::Always),
            "never" => Ok(LogColor::Never),
            _ => Err(format!(
                "Invalid log color '{s}'. Expected: auto, always, or never"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_run_the_migration() {
        let cli = CLI::try_parse_from(["actor-migrate"]).unwrap();
        assert_eq!(cli.command.unwrap_or_default(), Subcommand::Run);
        assert_eq!(cli.opts.log_level, Level::INFO);
        assert_eq!(cli.opts.log_color, LogColor::Auto);

        let settings = cli.opts.migration_settings();
        assert_eq!(settings.downtime_threshold, DEFAULT_DOWNTIME_THRESHOLD);
        assert_eq!(settings.retry, RetrySettings::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn flags_map_onto_settings() {
        let cli = CLI::try_parse_from([
            "actor-migrate",
            "--source.address",
            "http://source:9000/",
            "--migration.copy-parallelism",
            "4",
            "--migration.items-per-enumeration",
            "256",
            "--migration.items-per-chunk",
            "32",
            "--retry.max-count",
            "3",
            "--checkpoints.db",
            MEMORY_DB,
            "status",
        ])
        .unwrap();
        assert_eq!(cli.command, Some(Subcommand::Status));
        assert_eq!(cli.opts.checkpoints_db, PathBuf::from(MEMORY_DB));

        let settings = cli.opts.migration_settings();
        assert_eq!(settings.copy_phase_parallelism, 4);
        assert_eq!(settings.items_per_enumeration, 256);
        assert_eq!(settings.items_per_chunk, 32);
        assert_eq!(settings.retry.default_max_retry_count, 3);
        assert_eq!(settings.source_service_address, "http://source:9000/");
    }

    #[test]
    fn chunk_larger_than_enumeration_is_rejected() {
        let cli = CLI::try_parse_from([
            "actor-migrate",
            "--migration.items-per-enumeration",
            "8",
            "--migration.items-per-chunk",
            "16",
        ])
        .unwrap();
        assert!(cli.opts.migration_settings().validate().is_err());
    }

    #[test]
    fn exponential_retry_policy_is_selectable() {
        let cli = CLI::try_parse_from([
            "actor-migrate",
            "--retry.policy",
            "exponential",
            "--retry.exponential-base",
            "3",
            "--retry.exponential-unit",
            "250",
            "--retry.max-jitter",
            "50",
        ])
        .unwrap();

        assert_eq!(
            cli.opts.migration_settings().retry.policy,
            RetryPolicy::Exponential {
                base: 3,
                unit: Duration::from_millis(250),
                max_jitter: Duration::from_millis(50),
            }
        );
        assert!("linear".parse::<RetryPolicyKind>().is_err());
    }

    #[test]
    fn log_color_parsing() {
        assert_eq!("ALWAYS".parse::<LogColor>(), Ok(LogColor::Always));
        assert_eq!("never".parse::<LogColor>(), Ok(LogColor::Never));
        assert!("sometimes".parse::<LogColor>().is_err());
    }
}
