/// binlog-scout 데몬
///
/// 저장된 소스 설정마다 Watchman 을 띄우고, 설정 변경 알림을 받아 교체하며,
/// Ctrl-C 를 받으면 모든 Watchman 을 정리하고 종료합니다.
use binlog_scout::config::{PipelineSettings, Settings};
use binlog_scout::connection::MySqlConnector;
use binlog_scout::pubsub::{PubSub, DB_CONFIG_TOPIC};
use binlog_scout::registry::IndexRegistry;
use binlog_scout::service::Service;
use binlog_scout::store::{DiskStore, KeyValueStore};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 백필 판단 기준이 없으면 시작하지 않는다
    let settings = Settings::from_env().map_err(|e| {
        error!(error = %e, "Invalid settings");
        e
    })?;

    info!(data_dir = %settings.data_dir.display(), "Opening store");
    let store: Arc<dyn KeyValueStore> = Arc::new(DiskStore::open(&settings.data_dir)?);

    let registry = Arc::new(IndexRegistry::new());
    registry.load_from_store(store.clone())?;

    let hub = PubSub::new();
    let mut service = Service::new(
        Arc::new(MySqlConnector::new()),
        store.clone(),
        registry.clone(),
        &settings,
        PipelineSettings::default(),
    );
    if let Err(e) = service.boot().await {
        error!(error = %e, "Boot failed, waiting for new source configs");
    }

    let subscription = hub.subscribe(DB_CONFIG_TOPIC);
    info!("Listening for source config changes");

    tokio::select! {
        _ = service.listen_for_new_host(subscription) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    service.shutdown().await;
    registry.close_all().await;
    drop(hub);

    info!("binlog-scout stopped");
    Ok(())
}
