//! MySQL Binlog 복제 클라이언트
//!
//! COM_BINLOG_DUMP 로 스트림을 열고, 디코딩한 행 이벤트를 `RowEventHandler` 로 올려보냅니다.
//! 컬럼 이름은 binlog 에 없으므로 INFORMATION_SCHEMA 에서 조회해 테이블별로 캐시합니다.

use crate::binlog::{as_unsigned, BinlogDecoder, DecodedEvent, TableMap};
use crate::connection::{ColumnInfo, ConnectionConfig, MySqlConnection};
use crate::error::{CdcError, Result};
use crate::events::{CellValue, RawRowChange, RowAction, TableId};
use crate::offset::BinlogPosition;
use crate::protocol::{self, ErrPacket, PacketChannel};
use crate::replication::{ReplicationClient, ReplicationConfig, RowEventHandler};
use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// COM_BINLOG_DUMP 명령어 코드
const COM_BINLOG_DUMP: u8 = 0x12;

/// Binlog 클라이언트
pub struct BinlogClient {
    config: ReplicationConfig,
    include: Vec<Regex>,
    handler: Mutex<Option<Arc<dyn RowEventHandler>>>,
    closed: watch::Sender<bool>,
}

impl BinlogClient {
    pub fn new(config: ReplicationConfig) -> Result<Self> {
        let include = config
            .include_tables
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    CdcError::InvalidConfig(format!("invalid table pattern {}: {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let (closed, _) = watch::channel(false);

        Ok(BinlogClient {
            config,
            include,
            handler: Mutex::new(None),
            closed,
        })
    }

    /// `db.table` 이 포함 패턴에 걸리는지. 패턴이 없으면 전부 포함.
    pub fn is_included(&self, table: &TableId) -> bool {
        if self.include.is_empty() {
            return true;
        }
        let name = table.to_string();
        self.include.iter().any(|re| re.is_match(&name))
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn stream(&self, start: BinlogPosition) -> Result<()> {
        let mut channel = PacketChannel::connect(
            &self.config.host,
            self.config.port,
            self.config.connect_timeout,
        )
        .await?;
        let greeting = channel
            .authenticate(&self.config.user, &self.config.password)
            .await?;
        info!(
            host = %self.config.address(),
            server_version = %greeting.server_version,
            "Replication connection authenticated"
        );

        // 서버 체크섬을 그대로 받는다. 실제 사용 여부는 FORMAT_DESCRIPTION 으로 판단.
        if let Err(e) = channel
            .execute("SET @master_binlog_checksum = @@global.binlog_checksum")
            .await
        {
            warn!(error = %e, "Failed to announce binlog checksum support");
        }
        let heartbeat = self.config.heartbeat_period.as_nanos();
        if heartbeat > 0 {
            channel
                .execute(&format!("SET @master_heartbeat_period = {}", heartbeat))
                .await?;
        }

        let dump = create_binlog_dump_command(self.config.server_id, &start.filename, start.position)?;
        channel.write_command(&dump).await?;
        info!(
            server_id = self.config.server_id,
            position = %start,
            "Binlog dump requested"
        );

        let mut decoder = BinlogDecoder::new();
        let mut current = start;
        let mut columns: HashMap<TableId, Vec<ColumnInfo>> = HashMap::new();
        let mut schema_conn: Option<MySqlConnection> = None;

        let result = loop {
            let packet = channel.read_packet().await?;
            if protocol::is_error_packet(&packet) {
                break Err(CdcError::ProtocolError(ErrPacket::parse(&packet).to_string()));
            }
            if protocol::is_eof_packet(&packet) {
                info!("Binlog stream ended by server");
                break Ok(());
            }

            // 첫 바이트 0x00 은 OK 표시
            let data = packet.get(1..).unwrap_or_default();
            let (header, event) = decoder.decode(data)?;

            match event {
                DecodedEvent::Rotate { next_file, position } => {
                    current = BinlogPosition::new(next_file, position);
                    debug!(position = %current, "Binlog rotated");
                    self.sync_position(&current, true).await;
                }
                DecodedEvent::Xid(_) => {
                    if header.next_pos > 0 {
                        current.position = header.next_pos as u64;
                    }
                    self.sync_position(&current, false).await;
                }
                DecodedEvent::Query { schema, query } => {
                    if is_schema_change(&query) {
                        debug!(schema = %schema, "DDL observed, dropping column cache");
                        columns.clear();
                    }
                }
                DecodedEvent::Rows(rows) => {
                    let Some(table) = decoder.table(rows.table_id).cloned() else {
                        warn!(table_id = rows.table_id, "Rows event without table map");
                        continue;
                    };
                    let table_id = table.table_ref();
                    if !self.is_included(&table_id) {
                        trace!(table = %table_id, "Skipping table outside include list");
                        continue;
                    }

                    let known = match columns.get(&table_id) {
                        Some(cols) if cols.len() == table.column_types.len() => cols.clone(),
                        _ => match self.lookup_columns(&mut schema_conn, &table_id).await {
                            Ok(cols) => {
                                columns.insert(table_id.clone(), cols.clone());
                                cols
                            }
                            Err(e) => {
                                error!(table = %table_id, error = %e, "Failed to resolve column names");
                                schema_conn = None;
                                continue;
                            }
                        },
                    };

                    let change = build_change(&table, rows.action, rows.rows, &known);
                    self.deliver(change).await;
                }
                DecodedEvent::FormatDescription {
                    server_version,
                    checksum,
                } => {
                    debug!(server_version = %server_version, checksum, "Format description received");
                }
                DecodedEvent::TableMap(_) | DecodedEvent::Heartbeat | DecodedEvent::Other(_) => {}
            }
        };

        if let Some(conn) = schema_conn {
            let _ = conn.close().await;
        }
        channel.shutdown().await;
        result
    }

    async fn lookup_columns(
        &self,
        conn: &mut Option<MySqlConnection>,
        table: &TableId,
    ) -> Result<Vec<ColumnInfo>> {
        if conn.is_none() {
            let config = ConnectionConfig::from_replication(&self.config);
            *conn = Some(MySqlConnection::connect(&config).await?);
        }
        let conn = conn
            .as_mut()
            .ok_or_else(|| CdcError::ConnectionError("schema connection unavailable".to_string()))?;
        let columns = conn.table_columns(&table.schema, &table.name).await?;
        if columns.is_empty() {
            return Err(CdcError::NotFound(format!("columns of {}", table)));
        }
        Ok(columns)
    }

    fn current_handler(&self) -> Option<Arc<dyn RowEventHandler>> {
        self.handler.lock().clone()
    }

    async fn deliver(&self, change: RawRowChange) {
        let Some(handler) = self.current_handler() else {
            debug!(table = %change.table, "No event handler set, dropping rows");
            return;
        };
        if let Err(e) = handler.on_row(change).await {
            error!(error = %e, "Row handler failed");
        }
    }

    async fn sync_position(&self, position: &BinlogPosition, force: bool) {
        if let Some(handler) = self.current_handler() {
            if let Err(e) = handler.on_pos_synced(position, force).await {
                warn!(position = %position, error = %e, "Position sync handler failed");
            }
        }
    }
}

#[async_trait]
impl ReplicationClient for BinlogClient {
    fn set_event_handler(&self, handler: Arc<dyn RowEventHandler>) {
        *self.handler.lock() = Some(handler);
    }

    async fn run(&self) -> Result<()> {
        let mut conn =
            MySqlConnection::connect(&ConnectionConfig::from_replication(&self.config)).await?;
        let position = conn.master_position().await;
        conn.close().await?;
        self.run_from(position?).await
    }

    async fn run_from(&self, position: BinlogPosition) -> Result<()> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(());
        }

        tokio::select! {
            result = self.stream(position) => result,
            _ = closed.wait_for(|closed| *closed) => {
                info!(host = %self.config.address(), "Binlog client closed");
                Ok(())
            }
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// 부호 없는 컬럼 보정 후 컬럼 이름과 함께 `RawRowChange` 로 묶는다
pub fn build_change(
    table: &TableMap,
    action: RowAction,
    rows: Vec<Vec<CellValue>>,
    columns: &[ColumnInfo],
) -> RawRowChange {
    let rows = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .enumerate()
                .map(|(idx, cell)| match (columns.get(idx), table.column_types.get(idx)) {
                    (Some(info), Some(column_type)) if info.unsigned => {
                        as_unsigned(cell, *column_type)
                    }
                    _ => cell,
                })
                .collect()
        })
        .collect();

    RawRowChange {
        table: table.table_ref(),
        action,
        columns: columns.iter().map(|c| c.name.clone()).collect(),
        rows,
    }
}

fn is_schema_change(query: &str) -> bool {
    let head = query.trim_start().to_ascii_uppercase();
    ["ALTER", "CREATE", "DROP", "RENAME", "TRUNCATE"]
        .iter()
        .any(|keyword| head.starts_with(keyword))
}

/// COM_BINLOG_DUMP 명령어 생성
fn create_binlog_dump_command(
    server_id: u32,
    binlog_filename: &str,
    binlog_position: u64,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    buffer.write_u8(COM_BINLOG_DUMP)?;
    buffer.write_u32::<LittleEndian>(binlog_position as u32)?;
    // flags: 0 = 블로킹 (새 이벤트를 기다림)
    buffer.write_u16::<LittleEndian>(0)?;
    buffer.write_u32::<LittleEndian>(server_id)?;
    buffer.write_all(binlog_filename.as_bytes())?;

    Ok(buffer)
}
