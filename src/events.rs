//! Binlog 이벤트 타입과 파이프라인 데이터 구조 정의
//!
//! - 와이어 레벨: `EventType`, `ColumnType`, `EventHeader`
//! - 파이프라인 레벨: `RawRowChange` → (정규화) → `NormalizedRecord`
//! - 디스패처 채널: `ChangeEvent { status, id, payload }`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    QueryEvent = 2,
    StopEvent = 3,
    RotateEvent = 4,
    FormatDescriptionEvent = 15,
    XidEvent = 16,
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    HeartbeatEvent = 27,
    WriteRowsEventV2 = 30,
    UpdateRowsEventV2 = 31,
    DeleteRowsEventV2 = 32,
    GtidEvent = 33,
    AnonymousGtidEvent = 34,
    PreviousGtidsEvent = 35,
    RowsQueryEvent = 29,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            29 => EventType::RowsQueryEvent,
            30 => EventType::WriteRowsEventV2,
            31 => EventType::UpdateRowsEventV2,
            32 => EventType::DeleteRowsEventV2,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            _ => EventType::Unknown,
        }
    }

    pub fn row_action(&self) -> Option<RowAction> {
        match self {
            EventType::WriteRowsEventV1 | EventType::WriteRowsEventV2 => Some(RowAction::Insert),
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEventV2 => Some(RowAction::Update),
            EventType::DeleteRowsEventV1 | EventType::DeleteRowsEventV2 => Some(RowAction::Delete),
            _ => None,
        }
    }

    /// v2 rows 이벤트는 헤더 뒤에 extra-data 블록이 붙는다
    pub fn is_rows_v2(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV2 | EventType::UpdateRowsEventV2 | EventType::DeleteRowsEventV2
        )
    }
}

/// MySQL 컬럼 타입 (TABLE_MAP 이벤트 기준)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => ColumnType::VarString,
        }
    }
}

/// Binlog 이벤트 헤더 (19 bytes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    /// 다음 이벤트 위치
    pub next_pos: u32,
    pub flags: u16,
}

/// 셀 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Date(String),
    Time(String),
    DateTime(String),
    Json(Value),
    Enum(u16),
    Set(u64),
    Bit(Vec<u8>),
}

impl CellValue {
    /// 웹훅/인덱스로 나가는 평탄한 스칼라 값
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Int(i) => Value::from(*i),
            CellValue::UInt(u) => Value::from(*u),
            CellValue::Float(f) => float_value(*f as f64),
            CellValue::Double(d) => float_value(*d),
            CellValue::Decimal(s)
            | CellValue::String(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::DateTime(s) => Value::String(s.clone()),
            CellValue::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
            CellValue::Json(v) => v.clone(),
            CellValue::Enum(e) => Value::from(*e),
            CellValue::Set(s) => Value::from(*s),
            CellValue::Bit(bits) => {
                Value::from(bits.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
            }
        }
    }
}

fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// 스키마 + 테이블 이름
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub name: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        TableId {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// 행 변경 연산
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

impl RowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowAction::Insert => "insert",
            RowAction::Update => "update",
            RowAction::Delete => "delete",
        }
    }
}

/// 복제 클라이언트가 올려주는 원본 행 변경
///
/// UPDATE의 경우 `rows`는 [before, after, before, after, ...] 순서이다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRowChange {
    pub table: TableId,
    pub action: RowAction,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

/// 컬럼 이름 → 스칼라 값
pub type NormalizedRecord = Map<String, Value>;

impl RawRowChange {
    /// 컬럼 목록과 각 행 튜플을 zip 하여 레코드로 변환
    pub fn normalize(&self) -> Vec<NormalizedRecord> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, cell)| (column.clone(), cell.to_json()))
                    .collect()
            })
            .collect()
    }
}

/// 여러 변경을 받은 순서대로 평탄화
pub fn normalize_all<'a, I>(changes: I) -> Vec<NormalizedRecord>
where
    I: IntoIterator<Item = &'a RawRowChange>,
{
    changes.into_iter().flat_map(|c| c.normalize()).collect()
}

/// 디스패처 채널 이벤트 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Start,
    Stop,
}

/// 디스패처 입력 채널로 흐르는 이벤트. `id`는 진단용 상관 ID로 고유하지 않을 수 있다.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub status: EventStatus,
    pub id: Uuid,
    pub payload: Option<RawRowChange>,
}

impl ChangeEvent {
    pub fn start(payload: RawRowChange) -> Self {
        ChangeEvent {
            status: EventStatus::Start,
            id: Uuid::new_v4(),
            payload: Some(payload),
        }
    }

    pub fn stop() -> Self {
        ChangeEvent {
            status: EventStatus::Stop,
            id: Uuid::nil(),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orders_insert() -> RawRowChange {
        RawRowChange {
            table: TableId::new("shop", "orders"),
            action: RowAction::Insert,
            columns: vec!["id".to_string(), "total".to_string()],
            rows: vec![vec![CellValue::Int(1), CellValue::Double(9.99)]],
        }
    }

    #[test]
    fn test_event_type_row_action() {
        assert_eq!(EventType::from_u8(30).row_action(), Some(RowAction::Insert));
        assert_eq!(EventType::from_u8(24).row_action(), Some(RowAction::Update));
        assert_eq!(EventType::from_u8(32).row_action(), Some(RowAction::Delete));
        assert_eq!(EventType::from_u8(16).row_action(), None);
        assert!(EventType::UpdateRowsEventV2.is_rows_v2());
        assert!(!EventType::UpdateRowsEventV1.is_rows_v2());
    }

    #[test]
    fn test_normalize_zips_columns() {
        let records = orders_insert().normalize();
        assert_eq!(records.len(), 1);
        assert_eq!(Value::Object(records[0].clone()), json!({"id": 1, "total": 9.99}));
    }

    #[test]
    fn test_normalize_all_counts_every_tuple() {
        let mut update = orders_insert();
        update.action = RowAction::Update;
        update.rows = vec![
            vec![CellValue::Int(1), CellValue::Double(9.99)],
            vec![CellValue::Int(1), CellValue::Double(12.5)],
            vec![CellValue::Int(2), CellValue::Null],
            vec![CellValue::Int(2), CellValue::Double(3.0)],
        ];
        let changes = vec![orders_insert(), update];
        let records = normalize_all(&changes);
        assert_eq!(records.len(), 5);
        for record in &records {
            let keys: Vec<&String> = record.keys().collect();
            assert_eq!(keys.len(), 2);
            assert!(record.contains_key("id") && record.contains_key("total"));
        }
        assert_eq!(records[2]["total"], json!(12.5));
        assert_eq!(records[3]["total"], Value::Null);
    }

    #[test]
    fn test_cell_value_json() {
        assert_eq!(CellValue::Bytes(b"hello".to_vec()).to_json(), json!("hello"));
        assert_eq!(CellValue::Bit(vec![0x01, 0x02]).to_json(), json!(258));
        assert_eq!(CellValue::Decimal("10.50".into()).to_json(), json!("10.50"));
        assert_eq!(CellValue::Double(f64::NAN).to_json(), Value::Null);
    }

    #[test]
    fn test_stop_event_has_no_payload() {
        let stop = ChangeEvent::stop();
        assert_eq!(stop.status, EventStatus::Stop);
        assert!(stop.payload.is_none());
        assert_eq!(ChangeEvent::start(orders_insert()).status, EventStatus::Start);
    }
}
