//! Watchman: 소스 하나에 대한 복제 클라이언트 + 이벤트 필터 + 디스패처 묶음
//!
//! 회전 모니터는 주기적으로 마스터 위치를 조회하고, 추적 중인 위치와 다르면
//! 파이프라인 전체를 닫고 새 위치부터 다시 만든다. 그 사이 구간의 이벤트는
//! 중복되거나 빠질 수 있다.

use crate::config::{PipelineSettings, SourceConfig};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::filter::EventFilter;
use crate::offset::{BinlogPosition, PositionTracker, BINLOG_START_POSITION};
use crate::registry::IndexRegistry;
use crate::replication::{BackfillSource, ReplicationClient, ReplicationConfig, SourceConnector};
use crate::store::KeyValueStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Watchman 이 공유하는 협력자들
#[derive(Clone)]
pub struct WatchmanDeps {
    pub connector: Arc<dyn SourceConnector>,
    pub registry: Arc<IndexRegistry>,
    pub store: Arc<dyn KeyValueStore>,
    pub settings: PipelineSettings,
    /// 백필 마커 만료 기준
    pub full_sync_since: Duration,
}

/// 살아 있는 복제 세션 하나
struct Pipeline {
    client: Arc<dyn ReplicationClient>,
    filter: Arc<EventFilter>,
    stream: JoinHandle<()>,
}

impl Pipeline {
    async fn stop(self, grace: Duration) {
        self.client.close();
        self.filter.stop(grace).await;

        let mut stream = self.stream;
        if tokio::time::timeout(grace, &mut stream).await.is_err() {
            warn!("Replication stream did not finish after close, aborting");
            stream.abort();
        }
    }
}

struct Shared {
    source: SourceConfig,
    replication: ReplicationConfig,
    deps: WatchmanDeps,
    tracker: PositionTracker,
    pipeline: Mutex<Option<Pipeline>>,
}

impl Shared {
    fn start_pipeline(&self, from: Option<BinlogPosition>) -> Result<(Pipeline, Arc<Dispatcher>)> {
        let client = self.deps.connector.open_client(self.replication.clone())?;
        let dispatcher = Arc::new(Dispatcher::new(
            self.source.clone(),
            &self.deps.registry,
            self.deps.settings.clone(),
        ));
        let filter = Arc::new(EventFilter::new(&self.source, dispatcher.clone(), self.tracker.clone()));
        client.set_event_handler(filter.clone());

        let stream = {
            let client = client.clone();
            let index = self.source.index.clone();
            let host = self.replication.address();
            tokio::spawn(async move {
                let result = match from {
                    Some(position) => client.run_from(position).await,
                    None => client.run().await,
                };
                match result {
                    Ok(()) => info!(index = %index, host = %host, "Replication stream ended"),
                    Err(e) => error!(index = %index, host = %host, error = %e, "Replication stream failed"),
                }
            })
        };

        Ok((
            Pipeline {
                client,
                filter,
                stream,
            },
            dispatcher,
        ))
    }

    async fn stop_pipeline(&self) {
        let pipeline = self.pipeline.lock().take();
        if let Some(pipeline) = pipeline {
            pipeline.stop(self.deps.settings.replace_grace).await;
        }
    }

    /// 이전 필터를 멈춘 뒤 새 클라이언트/필터/디스패처로 `position` 부터 재개
    async fn rebuild(&self, position: BinlogPosition) -> Result<()> {
        self.stop_pipeline().await;
        let (pipeline, _) = self.start_pipeline(Some(position))?;
        *self.pipeline.lock() = Some(pipeline);
        Ok(())
    }

    fn has_pipeline(&self) -> bool {
        self.pipeline.lock().is_some()
    }
}

pub struct Watchman {
    shared: Arc<Shared>,
    server_id: u32,
    monitor_shutdown: watch::Sender<bool>,
    monitor: JoinHandle<()>,
    backfill: JoinHandle<()>,
    backfill_source: Arc<dyn BackfillSource>,
}

impl Watchman {
    /// 클라이언트 스트리밍, 백필, 회전 모니터를 모두 띄운다.
    /// 마스터 위치를 얻지 못하면 시작한 것을 정리하고 에러를 돌려준다.
    pub async fn spawn(source: SourceConfig, server_id: u32, deps: WatchmanDeps) -> Result<Self> {
        let replication = ReplicationConfig::from_source(&source, server_id);
        let shared = Arc::new(Shared {
            tracker: PositionTracker::new(BinlogPosition::new("", BINLOG_START_POSITION)),
            pipeline: Mutex::new(None),
            source,
            replication,
            deps,
        });

        let (pipeline, dispatcher) = shared.start_pipeline(None)?;
        *shared.pipeline.lock() = Some(pipeline);

        let backfill_source = shared.deps.connector.backfill_source(&shared.source);
        let backfill = {
            let source = backfill_source.clone();
            let store = shared.deps.store.clone();
            let threshold = shared.deps.full_sync_since;
            tokio::spawn(async move {
                dispatcher.do_first_time_index(source, store, threshold).await;
            })
        };

        info!(
            index = %shared.source.index,
            host = %shared.replication.address(),
            server_id,
            "Starting watchman"
        );

        let position = match shared.deps.connector.master_position(&shared.source).await {
            Ok(position) => position,
            Err(e) => {
                error!(index = %shared.source.index, host = %shared.source.host, error = %e, "Error getting master status");
                backfill.abort();
                release_backfill(&shared.source.index, backfill_source.as_ref()).await;
                shared.stop_pipeline().await;
                return Err(e);
            }
        };
        shared.tracker.set(position);

        let (monitor_shutdown, shutdown) = watch::channel(false);
        let monitor = tokio::spawn(monitor_binlog_changes(shared.clone(), shutdown));

        Ok(Watchman {
            shared,
            server_id,
            monitor_shutdown,
            monitor,
            backfill,
            backfill_source,
        })
    }

    pub fn source(&self) -> &SourceConfig {
        &self.shared.source
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub fn address(&self) -> String {
        self.shared.replication.address()
    }

    pub fn position(&self) -> BinlogPosition {
        self.shared.tracker.get()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.has_pipeline()
    }

    /// 모니터 정지 → 백필 중단과 연결 반환 → 클라이언트 close → 필터 stop 순서로 정리
    pub async fn teardown(self) {
        let index = self.shared.source.index.clone();
        let grace = self.shared.deps.settings.replace_grace;

        self.monitor_shutdown.send_replace(true);
        let mut monitor = self.monitor;
        if tokio::time::timeout(grace, &mut monitor).await.is_err() {
            warn!(index = %index, "Rotation monitor did not stop in time, aborting");
            monitor.abort();
        }
        self.backfill.abort();
        release_backfill(&index, self.backfill_source.as_ref()).await;
        self.shared.stop_pipeline().await;

        info!(index = %index, "Watchman closed");
    }
}

/// 중단된 백필이 빌려 둔 연결을 돌려준다
async fn release_backfill(index: &str, source: &dyn BackfillSource) {
    if let Err(e) = source.close().await {
        warn!(index = %index, error = %e, "Failed to release backfill connections");
    }
}

/// 폴링 주기마다 마스터 위치를 확인해 바뀌었으면 파이프라인을 재구성한다.
/// 조회 실패는 로그만 남기고 다음 주기에 다시 시도한다.
async fn monitor_binlog_changes(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let index = shared.source.index.clone();
    let mut ticker = tokio::time::interval(shared.deps.settings.rotation_poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let live = match shared.deps.connector.master_position(&shared.source).await {
            Ok(position) => position,
            Err(e) => {
                error!(index = %index, error = %e, "Error getting master status on rotate");
                continue;
            }
        };

        let changed = shared.tracker.update_if_changed(&live);
        if !changed && shared.has_pipeline() {
            continue;
        }

        info!(index = %index, position = %live, "Binlog position moved, resuming from new position");
        if let Err(e) = shared.rebuild(live).await {
            error!(index = %index, error = %e, "Error creating replication client on rotate");
        }
    }
}
