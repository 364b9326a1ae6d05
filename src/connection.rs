//! MySQL 일반 쿼리 연결 (mysql_async)
//!
//! 복제 스트림과 별개로 마스터 위치 조회, 컬럼 이름 조회, 백필 페이지 읽기에 쓰입니다.

use crate::binlog_client::BinlogClient;
use crate::config::SourceConfig;
use crate::error::{CdcError, Result};
use crate::events::NormalizedRecord;
use crate::offset::BinlogPosition;
use crate::replication::{BackfillSource, ReplicationClient, ReplicationConfig, SourceConnector};
use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Row, Value};
use serde_json::Value as Json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 접속 대상 (복제 설정/소스 설정 양쪽에서 만든다)
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
}

impl ConnectionConfig {
    pub fn from_source(source: &SourceConfig) -> Self {
        let database = source.database.trim();
        ConnectionConfig {
            hostname: source.host.clone(),
            port: source.safe_port(),
            username: source.user.clone(),
            password: source.password.clone(),
            database: (!database.is_empty()).then(|| database.to_string()),
        }
    }

    pub fn from_replication(config: &ReplicationConfig) -> Self {
        ConnectionConfig {
            hostname: config.host.clone(),
            port: config.port,
            username: config.user.clone(),
            password: config.password.clone(),
            database: None,
        }
    }

    fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .into()
    }
}

/// 테이블 컬럼 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub unsigned: bool,
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, Conn::new(config.build_opts()))
            .await
            .map_err(|_| CdcError::Timeout)?
            .map_err(|e| {
                CdcError::ConnectionError(format!(
                    "Failed to connect to {}:{}: {}",
                    config.hostname, config.port, e
                ))
            })?;
        Ok(MySqlConnection { conn })
    }

    fn from_conn(conn: Conn) -> Self {
        MySqlConnection { conn }
    }

    /// 현재 binlog 파일/위치. 8.4 이후 문법을 먼저 시도한다.
    pub async fn master_position(&mut self) -> Result<BinlogPosition> {
        let row: Option<Row> = match self.conn.query_first("SHOW BINARY LOG STATUS").await {
            Ok(row) => row,
            Err(e) => {
                debug!(error = %e, "SHOW BINARY LOG STATUS failed, falling back to SHOW MASTER STATUS");
                self.conn.query_first("SHOW MASTER STATUS").await?
            }
        };

        let row = row.ok_or_else(|| {
            CdcError::QueryError("No binlog status available (is log_bin enabled?)".to_string())
        })?;
        let file: String = row
            .get("File")
            .ok_or_else(|| CdcError::QueryError("binlog status without File".to_string()))?;
        let position: u64 = row
            .get("Position")
            .ok_or_else(|| CdcError::QueryError("binlog status without Position".to_string()))?;
        Ok(BinlogPosition::new(file, position))
    }

    /// ORDINAL_POSITION 순서의 컬럼 목록
    pub async fn table_columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows: Vec<(String, String)> = self
            .conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
                (schema, table),
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, column_type)| ColumnInfo {
                unsigned: column_type.to_ascii_lowercase().contains("unsigned"),
                name,
            })
            .collect())
    }

    pub async fn count_rows(&mut self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
        let count: Option<u64> = self.conn.query_first(sql).await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn fetch_page(
        &mut self,
        table: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<NormalizedRecord>> {
        let sql = format!(
            "SELECT * FROM {} LIMIT {} OFFSET {}",
            quote_identifier(table),
            limit,
            offset
        );
        // 바이너리 프로토콜로 받아야 숫자/날짜가 타입을 유지한다
        let rows: Vec<Row> = self.conn.exec(sql, ()).await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    pub async fn close(self) -> Result<()> {
        self.conn.disconnect().await?;
        Ok(())
    }
}

/// 백틱 식별자
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.trim().replace('`', "``"))
}

fn row_to_record(row: &Row) -> NormalizedRecord {
    row.columns_ref()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let value = row
                .as_ref(idx)
                .map(|v| value_to_json(v, column.column_type()))
                .unwrap_or(Json::Null);
            (column.name_str().into_owned(), value)
        })
        .collect()
}

/// mysql_async 값을 평탄한 JSON 스칼라로
pub fn value_to_json(value: &Value, column_type: ColumnType) -> Json {
    match value {
        Value::NULL => Json::Null,
        Value::Int(i) => Json::from(*i),
        Value::UInt(u) => Json::from(*u),
        Value::Float(f) => serde_json::Number::from_f64(*f as f64)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Double(d) => serde_json::Number::from_f64(*d)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Bytes(bytes) => {
            if column_type == ColumnType::MYSQL_TYPE_JSON {
                if let Ok(json) = serde_json::from_slice(bytes) {
                    return json;
                }
            }
            Json::String(String::from_utf8_lossy(bytes).into_owned())
        }
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let date = format!("{:04}-{:02}-{:02}", year, month, day);
            if matches!(column_type, ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE) {
                return Json::String(date);
            }
            let mut text = format!("{} {:02}:{:02}:{:02}", date, hour, minute, second);
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            Json::String(text)
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let mut text = format!(
                "{}{:02}:{:02}:{:02}",
                if *negative { "-" } else { "" },
                *days as u64 * 24 + *hours as u64,
                minutes,
                seconds
            );
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            Json::String(text)
        }
    }
}

/// 소스 설정 하나에 대한 백필 읽기. 호출마다 풀에서 연결을 빌린다.
pub struct MySqlBackfill {
    pool: Pool,
    closed: AtomicBool,
}

impl MySqlBackfill {
    pub fn new(source: &SourceConfig) -> Self {
        MySqlBackfill {
            pool: Pool::new(ConnectionConfig::from_source(source).build_opts()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connection(&self) -> Result<MySqlConnection> {
        let conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;
        Ok(MySqlConnection::from_conn(conn))
    }
}

#[async_trait]
impl BackfillSource for MySqlBackfill {
    async fn count_rows(&self, table: &str) -> Result<u64> {
        self.connection().await?.count_rows(table).await
    }

    async fn fetch_page(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<NormalizedRecord>> {
        self.connection().await?.fetch_page(table, offset, limit).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.clone().disconnect().await?;
        Ok(())
    }
}

/// MySQL 기반 `SourceConnector`
#[derive(Debug, Default, Clone)]
pub struct MySqlConnector;

impl MySqlConnector {
    pub fn new() -> Self {
        MySqlConnector
    }
}

#[async_trait]
impl SourceConnector for MySqlConnector {
    fn open_client(&self, config: ReplicationConfig) -> Result<Arc<dyn ReplicationClient>> {
        if config.host.trim().is_empty() {
            return Err(CdcError::InvalidConfig("replication host is empty".to_string()));
        }
        Ok(Arc::new(BinlogClient::new(config)?))
    }

    async fn master_position(&self, source: &SourceConfig) -> Result<BinlogPosition> {
        let mut conn = MySqlConnection::connect(&ConnectionConfig::from_source(source)).await?;
        let position = conn.master_position().await;
        conn.close().await?;
        position
    }

    fn backfill_source(&self, source: &SourceConfig) -> Arc<dyn BackfillSource> {
        Arc::new(MySqlBackfill::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_config_from_source() {
        let mut source = SourceConfig::new("db1", " shop ", "idx", "orders");
        source.port = 3307;
        let config = ConnectionConfig::from_source(&source);
        assert_eq!(config.port, 3307);
        assert_eq!(config.database.as_deref(), Some("shop"));

        source.database = String::new();
        assert!(ConnectionConfig::from_source(&source).database.is_none());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("orders"), "`orders`");
        assert_eq!(quote_identifier(" we`ird "), "`we``ird`");
    }

    #[test]
    fn test_value_to_json() {
        assert_eq!(value_to_json(&Value::NULL, ColumnType::MYSQL_TYPE_LONG), Json::Null);
        assert_eq!(value_to_json(&Value::Int(-3), ColumnType::MYSQL_TYPE_LONG), json!(-3));
        assert_eq!(
            value_to_json(&Value::Bytes(b"9.99".to_vec()), ColumnType::MYSQL_TYPE_NEWDECIMAL),
            json!("9.99")
        );
        assert_eq!(
            value_to_json(&Value::Bytes(br#"{"a":1}"#.to_vec()), ColumnType::MYSQL_TYPE_JSON),
            json!({"a": 1})
        );
        assert_eq!(
            value_to_json(&Value::Date(2024, 3, 15, 0, 0, 0, 0), ColumnType::MYSQL_TYPE_DATE),
            json!("2024-03-15")
        );
        assert_eq!(
            value_to_json(
                &Value::Date(2024, 3, 15, 10, 20, 30, 500),
                ColumnType::MYSQL_TYPE_DATETIME
            ),
            json!("2024-03-15 10:20:30.000500")
        );
        assert_eq!(
            value_to_json(&Value::Time(true, 1, 2, 3, 4, 0), ColumnType::MYSQL_TYPE_TIME),
            json!("-26:03:04")
        );
    }

    #[tokio::test]
    async fn test_backfill_close_is_idempotent() {
        let backfill = MySqlBackfill::new(&SourceConfig::new("127.0.0.1", "testdb", "idx", "orders"));
        assert!(!backfill.is_closed());
        backfill.close().await.unwrap();
        backfill.close().await.unwrap();
        assert!(backfill.is_closed());
    }

    #[tokio::test]
    #[ignore] // 실제 MySQL 연결 필요
    async fn test_master_position_live() -> Result<()> {
        let mut source = SourceConfig::new("127.0.0.1", "testdb", "idx", "orders");
        source.password = "rootpassword".to_string();
        let position = MySqlConnector::new().master_position(&source).await?;
        assert!(position.position >= 4);
        Ok(())
    }
}
