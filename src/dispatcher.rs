//! 변경 이벤트 디스패처
//!
//! 입력 채널 → 디바운스 → flush 시 버퍼의 변경을 정규화해 싱크로 보낸다.
//! 웹훅이 설정되어 있으면 웹훅, 아니면 인덱스, 둘 다 없으면 에러 로그 후 버린다.
//! 최초 인덱싱(백필)은 디바운스 버퍼를 거치지 않고 페이지 단위로 바로 보낸다.

use crate::config::{PipelineSettings, SourceConfig};
use crate::debounce::{debounce, DebounceWindows};
use crate::error::{CdcError, Result};
use crate::events::{normalize_all, ChangeEvent, EventStatus, NormalizedRecord, RawRowChange};
use crate::registry::IndexRegistry;
use crate::replication::BackfillSource;
use crate::sink::{IndexSink, WebhookSink};
use crate::store::{KeyValueStore, DEFAULT_BUCKET};
use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 완료 마커 시각 형식 (UTC)
pub const MARKER_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn marker_key(database: &str, table: &str) -> String {
    format!("completed:{}:{}", database, table)
}

/// 배치 전달 결과. 실패도 호출자에게는 값일 뿐 재시도하지 않는다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Webhook(u16),
    Indexed(usize),
    Failed,
    Dropped,
}

enum Route {
    Webhook(WebhookSink),
    Index(Arc<dyn IndexSink>),
    Unrouted,
}

pub struct Dispatcher {
    source: SourceConfig,
    changes: Arc<Mutex<Vec<RawRowChange>>>,
    route: Route,
    settings: PipelineSettings,
}

impl Dispatcher {
    pub fn new(source: SourceConfig, registry: &IndexRegistry, settings: PipelineSettings) -> Self {
        let index = match registry.index_by_name(&source.index) {
            Ok(index) => Some(index),
            Err(e) => {
                error!(index = %source.index, error = %e, "Watching data changes but no index found");
                None
            }
        };

        let route = match (source.webhook_url(), index) {
            (Some(url), _) => match WebhookSink::new(url, &source.maker_headers) {
                Ok(webhook) => Route::Webhook(webhook),
                Err(e) => {
                    error!(index = %source.index, url, error = %e, "Invalid webhook configuration");
                    Route::Unrouted
                }
            },
            (None, Some(index)) => Route::Index(index),
            (None, None) => Route::Unrouted,
        };

        Dispatcher {
            source,
            changes: Arc::new(Mutex::new(Vec::new())),
            route,
            settings,
        }
    }

    pub fn source(&self) -> &SourceConfig {
        &self.source
    }

    /// 아직 flush 되지 않은 변경 수
    pub fn buffered(&self) -> usize {
        self.changes.lock().len()
    }

    /// 입력 채널과 디바운스 결합기를 만들고 메인 루프를 띄운다
    pub fn start(self: &Arc<Self>) -> DispatcherHandle {
        let (events, input) = mpsc::channel(self.settings.channel_capacity);
        let (done, mut done_rx) = oneshot::channel::<()>();

        let buffer = self.changes.clone();
        let windows = DebounceWindows::new(self.settings.min_window, self.settings.max_window);
        let (mut flushed, debouncer) = debounce(windows, input, move |event: &mut ChangeEvent| {
            if let Some(payload) = event.payload.take() {
                buffer.lock().push(payload);
            }
        });

        let dispatcher = self.clone();
        let task = tokio::spawn(async move {
            let index = dispatcher.source.index.clone();
            info!(index = %index, "Dispatcher started");

            loop {
                tokio::select! {
                    _ = &mut done_rx => break,
                    received = flushed.recv() => match received {
                        Some(event) => match event.status {
                            EventStatus::Start | EventStatus::Stop => {
                                debug!(index = %index, id = %event.id, status = ?event.status, "flush");
                                dispatcher.process_flush().await;
                            }
                        },
                        None => break,
                    },
                }
            }

            // 입력이 닫힐 때까지 남은 이벤트를 버퍼로 흘려보낸다
            let drain = async { while flushed.recv().await.is_some() {} };
            if tokio::time::timeout(dispatcher.settings.shutdown_grace, drain)
                .await
                .is_err()
            {
                debug!(index = %index, "Dispatcher input still open after grace period");
            }
            debouncer.abort();
            dispatcher.process_flush().await;
            info!(index = %index, "Dispatcher stopped");
        });

        DispatcherHandle { events, done, task }
    }

    /// 버퍼를 비우고 정규화한 레코드를 락 밖에서 전달. 전달한 레코드 수를 반환한다.
    pub async fn process_flush(&self) -> usize {
        let records = {
            let mut changes = self.changes.lock();
            if changes.is_empty() {
                return 0;
            }
            let records = normalize_all(changes.iter());
            changes.clear();
            records
        };

        let count = records.len();
        self.dispatch(records).await;
        count
    }

    pub async fn dispatch(&self, records: Vec<NormalizedRecord>) -> Delivery {
        let index = &self.source.index;
        let count = records.len();

        match &self.route {
            Route::Webhook(webhook) => {
                debug!(index = %index, count, url = webhook.url(), "Posting batch to webhook");
                match webhook.post(&records).await {
                    Ok(status) => {
                        info!(index = %index, count, status = %status, "Webhook response");
                        Delivery::Webhook(status.as_u16())
                    }
                    Err(e) => {
                        error!(index = %index, count, error = %e, "Webhook post failed");
                        Delivery::Failed
                    }
                }
            }
            Route::Index(sink) => match sink.prepare_and_index(records).await {
                Ok(written) => {
                    info!(index = %index, written, "Batch indexed");
                    Delivery::Indexed(written)
                }
                Err(e) => {
                    error!(index = %index, count, error = %e, "Prepare index failed");
                    Delivery::Failed
                }
            },
            Route::Unrouted => {
                error!(index = %index, count, "No webhook or index configured, dropping batch");
                Delivery::Dropped
            }
        }
    }

    /// 마커가 없거나, 읽을 수 없거나, `threshold` 보다 오래됐으면 백필이 필요하다
    pub fn backfill_needed(&self, store: &dyn KeyValueStore, table: &str, threshold: Duration) -> bool {
        let key = marker_key(&self.source.database, table);
        let raw = match store.get(&key, DEFAULT_BUCKET) {
            Ok(Some(raw)) => raw,
            Ok(None) => return true,
            Err(e) => {
                warn!(index = %self.source.index, table, error = %e, "Failed to read completion marker");
                return true;
            }
        };

        let completed = match NaiveDateTime::parse_from_str(raw.trim(), MARKER_FORMAT) {
            Ok(completed) => completed,
            Err(e) => {
                warn!(index = %self.source.index, table, value = %raw, error = %e, "Completion marker parse error");
                return true;
            }
        };

        let age = Utc::now().naive_utc() - completed;
        match age.to_std() {
            Ok(age) => age >= threshold,
            // 미래 시각은 방금 완료된 것으로 본다
            Err(_) => false,
        }
    }

    /// 감시 테이블마다 필요하면 전체 행을 페이지 단위로 보내고 완료 마커를 남긴다.
    /// 백필한 테이블 수를 반환한다.
    pub async fn do_first_time_index(
        &self,
        source: Arc<dyn BackfillSource>,
        store: Arc<dyn KeyValueStore>,
        threshold: Duration,
    ) -> usize {
        let index = &self.source.index;
        let page_size = self.settings.page_size.max(1);
        let mut completed = 0;

        for table in self.source.watched_tables() {
            if !self.backfill_needed(store.as_ref(), &table, threshold) {
                info!(index = %index, table = %table, "Backfill marker is fresh, skipping");
                continue;
            }

            let total = match source.count_rows(&table).await {
                Ok(total) => total,
                Err(e) => {
                    error!(index = %index, table = %table, error = %e, "Failed to count rows");
                    continue;
                }
            };

            let pages = total.div_ceil(page_size as u64);
            for page in 0..pages {
                let offset = page * page_size as u64;
                match source.fetch_page(&table, offset, page_size).await {
                    Ok(rows) if rows.is_empty() => {}
                    Ok(rows) => {
                        self.dispatch(rows).await;
                    }
                    Err(e) => {
                        error!(index = %index, table = %table, offset, error = %e, "Failed to read backfill page");
                    }
                }
            }

            let marker = Utc::now().naive_utc().format(MARKER_FORMAT).to_string();
            let key = marker_key(&self.source.database, &table);
            if let Err(e) = store.put(&key, &marker, DEFAULT_BUCKET) {
                error!(index = %index, table = %table, error = %e, "Failed to write completion marker");
            }
            info!(index = %index, table = %table, total, "Backfill completed");
            completed += 1;
        }

        if let Err(e) = source.close().await {
            warn!(index = %index, error = %e, "Failed to release backfill connections");
        }
        completed
    }
}

/// 실행 중인 디스패처 루프에 대한 핸들
pub struct DispatcherHandle {
    events: mpsc::Sender<ChangeEvent>,
    done: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn sender(&self) -> mpsc::Sender<ChangeEvent> {
        self.events.clone()
    }

    /// 채널이 가득 차면 자리가 날 때까지 기다린다
    pub async fn send(&self, event: ChangeEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| CdcError::ChannelClosed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// stop 이벤트, done 신호 순서로 보내고 `grace` 안에 루프가 끝나기를 기다린다
    pub async fn shutdown(self, grace: Duration) -> bool {
        let DispatcherHandle { events, done, task } = self;

        if tokio::time::timeout(grace, events.send(ChangeEvent::stop()))
            .await
            .is_err()
        {
            warn!("Dispatcher input full, stop event not delivered");
        }
        drop(events);
        let _ = done.send(());

        match tokio::time::timeout(grace, task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Dispatcher task failed");
                false
            }
            Err(_) => {
                warn!("Dispatcher did not stop within grace period");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CellValue, RowAction, TableId};
    use crate::store::DiskStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<NormalizedRecord>>>,
    }

    impl RecordingSink {
        fn records(&self) -> Vec<NormalizedRecord> {
            self.batches.lock().iter().flatten().cloned().collect()
        }
    }

    #[async_trait]
    impl IndexSink for RecordingSink {
        fn name(&self) -> &str {
            "orders-idx"
        }

        async fn prepare_and_index(&self, records: Vec<NormalizedRecord>) -> Result<usize> {
            let count = records.len();
            self.batches.lock().push(records);
            Ok(count)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeBackfill {
        tables: HashMap<String, Vec<NormalizedRecord>>,
        failing_offset: Option<u64>,
        fetches: Mutex<Vec<(String, u64)>>,
        closes: AtomicUsize,
    }

    impl FakeBackfill {
        fn new(table: &str, rows: usize) -> Self {
            let records = (0..rows)
                .map(|i| record(json!({"id": i, "total": i as f64 * 1.5})))
                .collect();
            FakeBackfill {
                tables: HashMap::from([(table.to_string(), records)]),
                failing_offset: None,
                fetches: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BackfillSource for FakeBackfill {
        async fn count_rows(&self, table: &str) -> Result<u64> {
            self.tables
                .get(table)
                .map(|rows| rows.len() as u64)
                .ok_or_else(|| CdcError::QueryError(format!("no table {}", table)))
        }

        async fn fetch_page(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<NormalizedRecord>> {
            self.fetches.lock().push((table.to_string(), offset));
            if self.failing_offset == Some(offset) {
                return Err(CdcError::QueryError("page failed".to_string()));
            }
            let rows = self.tables.get(table).cloned().unwrap_or_default();
            Ok(rows.into_iter().skip(offset as usize).take(limit).collect())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record(value: serde_json::Value) -> NormalizedRecord {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("record must be an object"),
        }
    }

    fn source() -> SourceConfig {
        SourceConfig::new("db1", "shop", "orders-idx", "orders,customers")
    }

    fn order_insert(id: i64, total: f64) -> RawRowChange {
        RawRowChange {
            table: TableId::new("shop", "orders"),
            action: RowAction::Insert,
            columns: vec!["id".to_string(), "total".to_string()],
            rows: vec![vec![CellValue::Int(id), CellValue::Double(total)]],
        }
    }

    fn indexed_dispatcher(settings: PipelineSettings) -> (Arc<RecordingSink>, Arc<Dispatcher>) {
        let sink = Arc::new(RecordingSink::default());
        let registry = IndexRegistry::new();
        registry.register("orders-idx", sink.clone()).unwrap();
        (sink, Arc::new(Dispatcher::new(source(), &registry, settings)))
    }

    fn store() -> (tempfile::TempDir, Arc<dyn KeyValueStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(DiskStore::open(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_is_buffered_then_flushed_as_record() {
        let (sink, dispatcher) = indexed_dispatcher(PipelineSettings::default());
        let handle = dispatcher.start();

        handle.send(ChangeEvent::start(order_insert(1, 9.99))).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.buffered(), 1);
        assert!(sink.records().is_empty());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.buffered(), 0);
        assert_eq!(sink.records(), vec![record(json!({"id": 1, "total": 9.99}))]);

        assert!(handle.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_flushed_once_in_order() {
        let (sink, dispatcher) = indexed_dispatcher(PipelineSettings::default());
        let handle = dispatcher.start();

        for id in 0..5 {
            handle.send(ChangeEvent::start(order_insert(id, 1.0))).await.unwrap();
            sleep(Duration::from_millis(20)).await;
        }
        sleep(Duration::from_millis(200)).await;

        assert_eq!(sink.batches.lock().len(), 1);
        let ids: Vec<_> = sink.records().iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrouted_batches_are_dropped_without_stopping_loop() {
        let registry = IndexRegistry::new();
        let dispatcher = Arc::new(Dispatcher::new(source(), &registry, PipelineSettings::default()));
        let handle = dispatcher.start();

        handle.send(ChangeEvent::start(order_insert(1, 1.0))).await.unwrap();
        sleep(Duration::from_millis(150)).await;
        handle.send(ChangeEvent::start(order_insert(2, 2.0))).await.unwrap();
        sleep(Duration::from_millis(150)).await;

        assert_eq!(dispatcher.buffered(), 0);
        assert!(!handle.is_finished());
        assert_eq!(dispatcher.dispatch(vec![record(json!({"id": 3}))]).await, Delivery::Dropped);
        assert!(handle.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_buffer() {
        let (sink, dispatcher) = indexed_dispatcher(PipelineSettings::default());
        let handle = dispatcher.start();

        handle.send(ChangeEvent::start(order_insert(1, 1.0))).await.unwrap();
        handle.send(ChangeEvent::start(order_insert(2, 2.0))).await.unwrap();
        assert!(handle.shutdown(Duration::from_secs(1)).await);

        assert_eq!(dispatcher.buffered(), 0);
        assert_eq!(sink.records().len(), 2);
    }

    #[tokio::test]
    async fn test_webhook_takes_precedence_and_failure_is_not_propagated() {
        let sink = Arc::new(RecordingSink::default());
        let registry = IndexRegistry::new();
        registry.register("orders-idx", sink.clone()).unwrap();
        let mut cfg = source();
        cfg.maker_hook = Some("http://127.0.0.1:1/hook".to_string());
        let dispatcher = Dispatcher::new(cfg, &registry, PipelineSettings::default());

        let delivery = dispatcher.dispatch(vec![record(json!({"id": 1}))]).await;
        assert_eq!(delivery, Delivery::Failed);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_backfill_pages_and_writes_marker() {
        let (_dir, store) = store();
        let mut settings = PipelineSettings::default();
        settings.page_size = 2;
        let (sink, dispatcher) = indexed_dispatcher(settings);
        let mut backfill = FakeBackfill::new("orders", 5);
        backfill.tables.insert("customers".to_string(), Vec::new());
        let backfill = Arc::new(backfill);

        let done = dispatcher
            .do_first_time_index(backfill.clone(), store.clone(), Duration::from_secs(600))
            .await;

        assert_eq!(done, 2);
        assert_eq!(sink.batches.lock().len(), 3);
        assert_eq!(sink.records().len(), 5);
        let marker = store.get("completed:shop:orders", DEFAULT_BUCKET).unwrap().unwrap();
        assert!(NaiveDateTime::parse_from_str(&marker, MARKER_FORMAT).is_ok());
        assert!(store.get("completed:shop:customers", DEFAULT_BUCKET).unwrap().is_some());
        assert_eq!(backfill.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backfill_skips_fresh_marker() {
        let (_dir, store) = store();
        let fresh = Utc::now().naive_utc().format(MARKER_FORMAT).to_string();
        store.put("completed:shop:orders", &fresh, DEFAULT_BUCKET).unwrap();
        store.put("completed:shop:customers", &fresh, DEFAULT_BUCKET).unwrap();

        let (sink, dispatcher) = indexed_dispatcher(PipelineSettings::default());
        let backfill = Arc::new(FakeBackfill::new("orders", 3));
        let done = dispatcher
            .do_first_time_index(backfill.clone(), store, Duration::from_secs(600))
            .await;

        assert_eq!(done, 0);
        assert!(backfill.fetches.lock().is_empty());
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_backfill_reruns_stale_marker_and_skips_failed_page() {
        let (_dir, store) = store();
        store
            .put("completed:shop:orders", "2020-01-01 00:00:00", DEFAULT_BUCKET)
            .unwrap();

        let mut settings = PipelineSettings::default();
        settings.page_size = 2;
        let (sink, dispatcher) = indexed_dispatcher(settings);
        let mut backfill = FakeBackfill::new("orders", 6);
        backfill.failing_offset = Some(2);
        let backfill = Arc::new(backfill);

        dispatcher
            .do_first_time_index(backfill.clone(), store.clone(), Duration::from_secs(600))
            .await;

        // customers 는 count 실패로 건너뛴다
        let offsets: Vec<u64> = backfill.fetches.lock().iter().map(|(_, o)| *o).collect();
        assert_eq!(offsets, vec![0, 2, 4]);
        assert_eq!(sink.records().len(), 4);
        assert!(!dispatcher.backfill_needed(store.as_ref(), "orders", Duration::from_secs(600)));
        assert!(dispatcher.backfill_needed(store.as_ref(), "customers", Duration::from_secs(600)));
    }

    #[test]
    fn test_unparseable_marker_requires_backfill() {
        let (_dir, store) = store();
        store.put("completed:shop:orders", "yesterday", DEFAULT_BUCKET).unwrap();
        let dispatcher = Dispatcher::new(source(), &IndexRegistry::new(), PipelineSettings::default());
        assert!(dispatcher.backfill_needed(store.as_ref(), "orders", Duration::from_secs(60)));
    }
}
