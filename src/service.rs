//! Watchman 관리자
//!
//! 인덱스 이름 → Watchman 맵을 소유한다. 맵은 이 서비스의 메서드(`&mut self`)에서만
//! 바뀌므로 별도 락이 없다.

use crate::config::{PipelineSettings, Settings, SourceConfig};
use crate::error::Result;
use crate::pubsub::{Message, Subscription};
use crate::registry::IndexRegistry;
use crate::replication::SourceConnector;
use crate::store::{JsonStoreExt, KeyValueStore, DB_CONFIG_BUCKET};
use crate::watchman::{Watchman, WatchmanDeps};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};

/// 호스트별로 사용 중인 복제 server id.
/// 같은 서버에 붙는 세션은 서로 다른 server id 를 가져야 한다.
#[derive(Debug)]
pub struct HostBindings {
    base_server_id: u32,
    by_host: HashMap<String, BTreeSet<u32>>,
}

impl HostBindings {
    pub fn new(base_server_id: u32) -> Self {
        HostBindings {
            base_server_id,
            by_host: HashMap::new(),
        }
    }

    /// 해당 호스트에서 아직 쓰이지 않은 가장 작은 server id
    pub fn acquire(&mut self, address: &str) -> u32 {
        let used = self.by_host.entry(address.to_string()).or_default();
        let mut server_id = self.base_server_id;
        while used.contains(&server_id) {
            server_id = server_id.wrapping_add(1);
        }
        used.insert(server_id);
        server_id
    }

    pub fn release(&mut self, address: &str, server_id: u32) {
        if let Some(used) = self.by_host.get_mut(address) {
            used.remove(&server_id);
            if used.is_empty() {
                self.by_host.remove(address);
            }
        }
    }

    pub fn is_bound(&self, address: &str) -> bool {
        self.by_host.contains_key(address)
    }

    pub fn sessions(&self, address: &str) -> usize {
        self.by_host.get(address).map(BTreeSet::len).unwrap_or(0)
    }
}

pub struct Service {
    warehouse: HashMap<String, Watchman>,
    bindings: HostBindings,
    deps: WatchmanDeps,
}

impl Service {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        store: Arc<dyn KeyValueStore>,
        registry: Arc<IndexRegistry>,
        settings: &Settings,
        pipeline: PipelineSettings,
    ) -> Self {
        Service {
            warehouse: HashMap::new(),
            bindings: HostBindings::new(settings.server_id),
            deps: WatchmanDeps {
                connector,
                registry,
                store,
                settings: pipeline,
                full_sync_since: settings.full_sync_since,
            },
        }
    }

    /// 저장된 모든 소스 설정에 Watchman 을 배정하고 배정된 수를 반환
    pub async fn boot(&mut self) -> Result<usize> {
        let configs: Vec<SourceConfig> = match self.deps.store.find_json("", 0, DB_CONFIG_BUCKET) {
            Ok(configs) => configs,
            Err(e) => {
                error!(error = %e, "Error booting watchmen");
                return Err(e);
            }
        };

        let mut assigned = 0;
        for config in configs {
            if self.assign_new_watchman(config).await.is_ok() {
                assigned += 1;
            }
        }
        info!(assigned, "Watchmen booted");
        Ok(assigned)
    }

    /// 설정 검증 후 Watchman 을 만들어 인덱스 이름으로 등록한다.
    /// 같은 인덱스의 기존 Watchman 은 먼저 닫는다.
    pub async fn assign_new_watchman(&mut self, config: SourceConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            error!(index = %config.index, error = %e, "Rejecting source config");
            return Err(e);
        }

        if let Some(existing) = self.warehouse.remove(&config.index) {
            warn!(index = %config.index, "Existing watchman found, closing it first");
            self.close_watchman(existing).await;
        }

        let address = config.address();
        let server_id = self.bindings.acquire(&address);
        let index = config.index.clone();

        match Watchman::spawn(config, server_id, self.deps.clone()).await {
            Ok(watchman) => {
                self.warehouse.insert(index, watchman);
                Ok(())
            }
            Err(e) => {
                error!(index = %index, host = %address, error = %e, "Error creating watchman");
                self.bindings.release(&address, server_id);
                Err(e)
            }
        }
    }

    /// 설정 변경 알림을 받아 Watchman 을 교체한다. 구독 채널이 닫히면 반환.
    pub async fn listen_for_new_host(&mut self, mut subscription: Subscription) {
        while let Some(message) = subscription.recv().await {
            self.handle_message(message).await;
        }
        info!("Source config subscription closed");
    }

    pub async fn handle_message(&mut self, message: Message) {
        match message {
            Message::DbConfig(config) => {
                info!(index = %config.index, "Requesting a new watchman");
                if let Some(existing) = self.warehouse.remove(&config.index) {
                    warn!(index = %config.index, "Existing watchman found, closing connection");
                    self.close_watchman(existing).await;
                    tokio::time::sleep(self.deps.settings.replace_grace).await;
                }
                // 실패는 assign 쪽에서 로그를 남긴다
                let _ = self.assign_new_watchman(config).await;
            }
            other => error!(message = ?other, "Unexpected message type"),
        }
    }

    async fn close_watchman(&mut self, watchman: Watchman) {
        let address = watchman.address();
        let server_id = watchman.server_id();
        watchman.teardown().await;
        self.bindings.release(&address, server_id);
    }

    /// 모든 Watchman 정리
    pub async fn shutdown(&mut self) {
        let watchmen: Vec<Watchman> = self.warehouse.drain().map(|(_, w)| w).collect();
        for watchman in watchmen {
            self.close_watchman(watchman).await;
        }
        info!("All watchmen closed");
    }

    pub fn watchman(&self, index: &str) -> Option<&Watchman> {
        self.warehouse.get(index)
    }

    pub fn indices(&self) -> Vec<String> {
        let mut indices: Vec<String> = self.warehouse.keys().cloned().collect();
        indices.sort();
        indices
    }

    pub fn bindings(&self) -> &HostBindings {
        &self.bindings
    }
}
