//! 복제 파이프라인이 의존하는 외부 협력자 경계
//!
//! - `RowEventHandler`: 복제 클라이언트가 행 변경/위치 동기화를 알려주는 콜백
//! - `ReplicationClient`: binlog 스트림 세션
//! - `BackfillSource`: 최초 인덱싱용 테이블 페이지 읽기
//! - `SourceConnector`: 위 객체들을 `SourceConfig`로부터 만들어 주는 팩토리
//!
//! 실제 MySQL 구현은 `binlog_client` / `connection` 모듈에 있고,
//! 테스트는 이 트레이트의 가짜 구현을 주입한다.

use crate::config::SourceConfig;
use crate::error::Result;
use crate::events::{NormalizedRecord, RawRowChange};
use crate::offset::BinlogPosition;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait RowEventHandler: Send + Sync {
    async fn on_row(&self, change: RawRowChange) -> Result<()>;

    /// rotate/xid 이후 스트림 위치가 확정될 때 호출
    async fn on_pos_synced(&self, position: &BinlogPosition, force: bool) -> Result<()>;
}

#[async_trait]
pub trait ReplicationClient: Send + Sync {
    fn set_event_handler(&self, handler: Arc<dyn RowEventHandler>);

    /// 현재 마스터 위치부터 스트리밍. `close()` 될 때까지 반환하지 않는다.
    async fn run(&self) -> Result<()>;

    async fn run_from(&self, position: BinlogPosition) -> Result<()>;

    fn close(&self);
}

#[async_trait]
pub trait BackfillSource: Send + Sync {
    async fn count_rows(&self, table: &str) -> Result<u64>;

    async fn fetch_page(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<NormalizedRecord>>;

    /// 잡고 있는 연결 자원을 돌려준다. 여러 번 불려도 된다.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn open_client(&self, config: ReplicationConfig) -> Result<Arc<dyn ReplicationClient>>;

    async fn master_position(&self, source: &SourceConfig) -> Result<BinlogPosition>;

    fn backfill_source(&self, source: &SourceConfig) -> Arc<dyn BackfillSource>;
}

/// 복제 클라이언트 설정
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub charset: String,
    /// 복제 세션마다 고유해야 한다
    pub server_id: u32,
    /// `db\.table` 형태의 정규식
    pub include_tables: Vec<String>,
    pub connect_timeout: Duration,
    /// 0 이면 heartbeat 요청 안 함
    pub heartbeat_period: Duration,
}

impl ReplicationConfig {
    pub fn from_source(source: &SourceConfig, server_id: u32) -> Self {
        ReplicationConfig {
            host: source.host.clone(),
            port: source.safe_port(),
            user: source.user.clone(),
            password: source.password.clone(),
            charset: "utf8".to_string(),
            server_id,
            include_tables: source.include_table_patterns(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_period: Duration::from_secs(30),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_config_scoped_to_watched_tables() {
        let mut source = SourceConfig::new("db1", " shop ", "orders-idx", "orders, customers");
        source.password = "pw".to_string();
        let config = ReplicationConfig::from_source(&source, 2001);

        assert_eq!(config.port, 3306);
        assert_eq!(config.server_id, 2001);
        assert_eq!(config.charset, "utf8");
        assert_eq!(
            config.include_tables,
            vec!["^shop\\.orders$".to_string(), "^shop\\.customers$".to_string()]
        );
        assert_eq!(config.address(), "db1:3306");
    }
}
