use std::{io::IsTerminal, path::Path, sync::Arc};

use actor_migration::{MigrationContext, MigrationSettings, MigrationSource};
use actor_migration_remote::{
    CommunicationClientFactory, HttpSourceReplicaFactory, PartitionKey, ServicePartitionClient,
    StaticPartitionResolver,
};
use actor_migration_storage::{EngineType, Store};
use eyre::WrapErr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::Directive, fmt, layer::SubscriberExt,
};

use crate::cli::{LogColor, MEMORY_DB, Options};

pub const SOURCE_PARTITION: &str = "actor-state";
pub const MIGRATION_LISTENER: &str = "migration";

pub fn init_tracing(opts: &Options) -> eyre::Result<()> {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let use_color = match opts.log_color {
        LogColor::Always => true,
        LogColor::Never => false,
        LogColor::Auto => std::io::stderr().is_terminal(),
    };

    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);

    // Logs go to stderr, stdout carries the JSON status
    let fmt_layer = fmt::layer()
        .with_target(include_target)
        .with_ansi(use_color)
        .with_writer(std::io::stderr);

    let subscriber = Registry::default().with(fmt_layer.with_filter(log_filter));
    tracing::subscriber::set_global_default(subscriber)
        .wrap_err("setting default subscriber failed")
}

pub fn is_memory_db(path: &Path) -> bool {
    path.to_str() == Some(MEMORY_DB)
}

pub async fn init_store(path: &Path) -> eyre::Result<Store> {
    if is_memory_db(path) {
        return Ok(Store::new(path, EngineType::InMemory).await?);
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }
    Store::new(path, EngineType::SQL)
        .await
        .wrap_err_with(|| format!("failed to open store at {}", path.display()))
}

/// Builds the resilient source client and starts sweeping its client cache. The sweep stops
/// when `cancel` fires.
pub fn init_source(
    opts: &Options,
    settings: &MigrationSettings,
    cancel: CancellationToken,
) -> eyre::Result<(Arc<dyn MigrationSource>, JoinHandle<()>)> {
    let replicas = HttpSourceReplicaFactory::new(opts.request_timeout())?;
    let resolver = StaticPartitionResolver::new(
        SOURCE_PARTITION,
        MIGRATION_LISTENER,
        settings.source_service_address.clone(),
    );
    let factory = Arc::new(CommunicationClientFactory::new(
        replicas,
        Arc::new(resolver),
        settings.retry.clone(),
    ));
    let cleanup = factory.spawn_cleanup(cancel);
    let client = ServicePartitionClient::new(factory, PartitionKey::Singleton, MIGRATION_LISTENER);
    Ok((Arc::new(client), cleanup))
}

pub async fn init_context(
    opts: &Options,
    settings: MigrationSettings,
    cancel: CancellationToken,
) -> eyre::Result<(MigrationContext, JoinHandle<()>)> {
    if is_memory_db(&opts.checkpoints_db) {
        warn!("Checkpoints are kept in memory, this run cannot be resumed after a restart");
    }
    let checkpoints = init_store(&opts.checkpoints_db).await?;
    let target = init_store(&opts.target_db).await?;
    let (source, cleanup) = init_source(opts, &settings, cancel)?;
    info!(
        source = %settings.source_service_address,
        workers = settings.copy_phase_parallelism,
        "Migration context ready"
    );
    Ok((
        MigrationContext::new(source, checkpoints, target, settings),
        cleanup,
    ))
}

/// Cancels `cancel` on the first Ctrl-C.
pub fn shutdown_on_ctrl_c(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, stopping after the current chunk");
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_db_is_recognized() {
        assert!(is_memory_db(Path::new(MEMORY_DB)));
        assert!(!is_memory_db(Path::new("data/memory")));
        assert!(!is_memory_db(Path::new("checkpoints.db")));
    }

    #[tokio::test]
    async fn sql_store_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("checkpoints.db");
        let store = init_store(&path).await.unwrap();

        let mut tx = store.transaction().await.unwrap();
        tx.set("t", "k", "v").await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.get("t", "k").await.unwrap().as_deref(), Some("v"));
        assert!(path.parent().unwrap().is_dir());
    }
}
