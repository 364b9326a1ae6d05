//! MySQL Binlog 이벤트 디코더
//!
//! 복제 스트림으로 받은 이벤트 하나(헤더 19 bytes + 본문 [+ CRC32])를 해석합니다.
//! 이벤트 헤더:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!
//! TABLE_MAP 이벤트를 table_id 기준으로 캐시하고, 이후 ROWS 이벤트의 셀 값을
//! 컬럼 타입/메타데이터에 맞춰 `CellValue`로 변환합니다.

use crate::error::{CdcError, Result};
use crate::events::*;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::{debug, trace};

pub const EVENT_HEADER_SIZE: usize = 19;
const CHECKSUM_SIZE: usize = 4;

/// TABLE_MAP 이벤트 (19)
#[derive(Debug, Clone, PartialEq)]
pub struct TableMap {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub column_types: Vec<ColumnType>,
    pub column_metadata: Vec<u16>,
    pub null_bitmap: Vec<u8>,
}

impl TableMap {
    pub fn table_ref(&self) -> TableId {
        TableId::new(self.schema.clone(), self.table.clone())
    }
}

/// WRITE/UPDATE/DELETE ROWS 이벤트
///
/// 각 행은 테이블의 전체 컬럼 수만큼 값을 가지며, 이미지에 없는 컬럼은 `Null`이다.
/// UPDATE는 [before, after, before, after, ...] 순서로 펼친다.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub table_id: u64,
    pub action: RowAction,
    pub rows: Vec<Vec<CellValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    FormatDescription {
        server_version: String,
        checksum: bool,
    },
    TableMap(TableMap),
    Rows(RowsEvent),
    Rotate {
        next_file: String,
        position: u64,
    },
    Xid(u64),
    Query {
        schema: String,
        query: String,
    },
    Heartbeat,
    Other(EventType),
}

pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
    if data.len() < EVENT_HEADER_SIZE {
        return Err(CdcError::BinlogParseError(format!(
            "event header too short: {} bytes",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    Ok(EventHeader {
        timestamp: cursor.read_u32::<LittleEndian>()?,
        event_type: EventType::from_u8(cursor.read_u8()?),
        server_id: cursor.read_u32::<LittleEndian>()?,
        event_length: cursor.read_u32::<LittleEndian>()?,
        next_pos: cursor.read_u32::<LittleEndian>()?,
        flags: cursor.read_u16::<LittleEndian>()?,
    })
}

/// 스트림 단위 디코더. 연결마다 하나씩 둔다.
#[derive(Debug, Default)]
pub struct BinlogDecoder {
    tables: HashMap<u64, TableMap>,
    checksum: bool,
}

impl BinlogDecoder {
    pub fn new() -> Self {
        BinlogDecoder::default()
    }

    pub fn table(&self, table_id: u64) -> Option<&TableMap> {
        self.tables.get(&table_id)
    }

    pub fn has_checksum(&self) -> bool {
        self.checksum
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<(EventHeader, DecodedEvent)> {
        let header = parse_header(data)?;
        let event_type = header.event_type;

        let checksum = if event_type == EventType::FormatDescriptionEvent {
            fde_has_checksum(&data[EVENT_HEADER_SIZE..])
        } else {
            self.checksum
        };
        let end = if checksum && data.len() >= EVENT_HEADER_SIZE + CHECKSUM_SIZE {
            data.len() - CHECKSUM_SIZE
        } else {
            data.len()
        };
        let body = &data[EVENT_HEADER_SIZE..end];

        trace!(?event_type, len = data.len(), checksum, "decoding event");

        let event = self.decode_body(event_type, body, checksum).map_err(|e| match e {
            CdcError::IoError(msg) => {
                CdcError::BinlogParseError(format!("truncated {:?} event: {}", event_type, msg))
            }
            other => other,
        })?;
        Ok((header, event))
    }

    fn decode_body(
        &mut self,
        event_type: EventType,
        body: &[u8],
        checksum: bool,
    ) -> Result<DecodedEvent> {
        match event_type {
            EventType::FormatDescriptionEvent => {
                let server_version = decode_server_version(body)?;
                self.checksum = checksum;
                debug!(%server_version, checksum, "format description");
                Ok(DecodedEvent::FormatDescription {
                    server_version,
                    checksum,
                })
            }
            EventType::TableMapEvent => {
                let table = decode_table_map(body)?;
                self.tables.insert(table.table_id, table.clone());
                Ok(DecodedEvent::TableMap(table))
            }
            EventType::RotateEvent => {
                let mut cursor = Cursor::new(body);
                let position = cursor.read_u64::<LittleEndian>()?;
                let next_file = String::from_utf8_lossy(&body[8..])
                    .trim_end_matches('\0')
                    .to_string();
                Ok(DecodedEvent::Rotate {
                    next_file,
                    position,
                })
            }
            EventType::XidEvent => {
                let xid = Cursor::new(body).read_u64::<LittleEndian>()?;
                Ok(DecodedEvent::Xid(xid))
            }
            EventType::QueryEvent => decode_query(body),
            EventType::HeartbeatEvent => Ok(DecodedEvent::Heartbeat),
            other => match other.row_action() {
                Some(action) => Ok(DecodedEvent::Rows(self.decode_rows(
                    body,
                    action,
                    other.is_rows_v2(),
                )?)),
                None => Ok(DecodedEvent::Other(other)),
            },
        }
    }

    fn decode_rows(&self, body: &[u8], action: RowAction, v2: bool) -> Result<RowsEvent> {
        let mut cursor = Cursor::new(body);
        let table_id = cursor.read_u48::<LittleEndian>()?;
        let _flags = cursor.read_u16::<LittleEndian>()?;

        if v2 {
            // extra-data 길이는 자기 자신 2 bytes를 포함한다
            let extra_len = cursor.read_u16::<LittleEndian>()? as u64;
            if extra_len > 2 {
                cursor.set_position(cursor.position() + extra_len - 2);
            }
        }

        let table = self.tables.get(&table_id).ok_or_else(|| {
            CdcError::BinlogParseError(format!("rows event for unknown table id {}", table_id))
        })?;

        let column_count = read_packed_int(&mut cursor)? as usize;
        let bitmap_len = column_count.div_ceil(8);
        let mut present = vec![0u8; bitmap_len];
        cursor.read_exact(&mut present)?;

        let present_after = if action == RowAction::Update {
            let mut bitmap = vec![0u8; bitmap_len];
            cursor.read_exact(&mut bitmap)?;
            bitmap
        } else {
            present.clone()
        };

        let mut rows = Vec::new();
        while (cursor.position() as usize) < body.len() {
            rows.push(decode_row_image(&mut cursor, table, column_count, &present)?);
            if action == RowAction::Update {
                rows.push(decode_row_image(&mut cursor, table, column_count, &present_after)?);
            }
        }

        Ok(RowsEvent {
            table_id,
            action,
            rows,
        })
    }
}

/// FDE 본문 끝의 checksum_alg 바이트(뒤에 CRC32가 붙은 경우 끝에서 5번째)를 확인
fn fde_has_checksum(body: &[u8]) -> bool {
    // binlog_version(2) + server_version(50) + create_timestamp(4) + header_length(1)
    if body.len() < 57 + 1 + CHECKSUM_SIZE {
        return false;
    }
    let version = String::from_utf8_lossy(&body[2..52]);
    if !version_supports_checksum(version.trim_end_matches('\0')) {
        return false;
    }
    body[body.len() - CHECKSUM_SIZE - 1] == 1
}

/// MySQL 5.6.1+ / MariaDB 5.3+
fn version_supports_checksum(version: &str) -> bool {
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts
        .next()
        .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);

    if version.contains("MariaDB") {
        return major > 5 || (major == 5 && minor >= 3);
    }
    major > 5 || (major == 5 && minor >= 6)
}

fn decode_server_version(body: &[u8]) -> Result<String> {
    if body.len() < 52 {
        return Err(CdcError::BinlogParseError(
            "format description too short".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&body[2..52])
        .trim_end_matches('\0')
        .to_string())
}

fn decode_query(body: &[u8]) -> Result<DecodedEvent> {
    let mut cursor = Cursor::new(body);
    let _thread_id = cursor.read_u32::<LittleEndian>()?;
    let _exec_time = cursor.read_u32::<LittleEndian>()?;
    let schema_len = cursor.read_u8()? as usize;
    let _error_code = cursor.read_u16::<LittleEndian>()?;
    let status_len = cursor.read_u16::<LittleEndian>()? as u64;
    cursor.set_position(cursor.position() + status_len);

    let mut schema = vec![0u8; schema_len];
    cursor.read_exact(&mut schema)?;
    cursor.read_u8()?;

    let start = (cursor.position() as usize).min(body.len());
    Ok(DecodedEvent::Query {
        schema: String::from_utf8_lossy(&schema).to_string(),
        query: String::from_utf8_lossy(&body[start..]).to_string(),
    })
}

pub fn decode_table_map(body: &[u8]) -> Result<TableMap> {
    let mut cursor = Cursor::new(body);
    let table_id = cursor.read_u48::<LittleEndian>()?;
    let _flags = cursor.read_u16::<LittleEndian>()?;

    let schema = read_short_string(&mut cursor)?;
    cursor.read_u8()?;
    let table = read_short_string(&mut cursor)?;
    cursor.read_u8()?;

    let column_count = read_packed_int(&mut cursor)? as usize;
    let mut raw_types = vec![0u8; column_count];
    cursor.read_exact(&mut raw_types)?;
    let column_types: Vec<ColumnType> = raw_types.into_iter().map(ColumnType::from_u8).collect();

    let metadata_len = read_packed_int(&mut cursor)? as usize;
    let mut metadata = vec![0u8; metadata_len];
    cursor.read_exact(&mut metadata)?;
    let column_metadata = decode_column_metadata(&column_types, &metadata)?;

    let mut null_bitmap = vec![0u8; column_count.div_ceil(8)];
    cursor.read_exact(&mut null_bitmap)?;
    // 이후의 optional metadata (binlog_row_metadata=FULL)는 사용하지 않는다

    Ok(TableMap {
        table_id,
        schema,
        table,
        column_types,
        column_metadata,
        null_bitmap,
    })
}

fn decode_column_metadata(types: &[ColumnType], block: &[u8]) -> Result<Vec<u16>> {
    let mut cursor = Cursor::new(block);
    types
        .iter()
        .map(|column_type| {
            Ok(match column_type {
                ColumnType::Float
                | ColumnType::Double
                | ColumnType::Blob
                | ColumnType::TinyBlob
                | ColumnType::MediumBlob
                | ColumnType::LongBlob
                | ColumnType::Json
                | ColumnType::Geometry
                | ColumnType::Time2
                | ColumnType::DateTime2
                | ColumnType::Timestamp2 => cursor.read_u8()? as u16,
                ColumnType::Bit | ColumnType::Varchar | ColumnType::VarString => {
                    cursor.read_u16::<LittleEndian>()?
                }
                // (real_type, length) / (precision, scale) 순서
                ColumnType::NewDecimal
                | ColumnType::String
                | ColumnType::Enum
                | ColumnType::Set => cursor.read_u16::<BigEndian>()?,
                _ => 0,
            })
        })
        .collect()
}

fn decode_row_image(
    cursor: &mut Cursor<&[u8]>,
    table: &TableMap,
    column_count: usize,
    present: &[u8],
) -> Result<Vec<CellValue>> {
    let mut null_bitmap = vec![0u8; count_set_bits(present).div_ceil(8)];
    cursor.read_exact(&mut null_bitmap)?;

    let mut row = Vec::with_capacity(column_count);
    let mut present_idx = 0;
    for col in 0..column_count {
        if !is_bit_set(present, col) {
            row.push(CellValue::Null);
            continue;
        }
        let is_null = is_bit_set(&null_bitmap, present_idx);
        present_idx += 1;
        if is_null {
            row.push(CellValue::Null);
            continue;
        }

        let column_type = table
            .column_types
            .get(col)
            .copied()
            .unwrap_or(ColumnType::VarString);
        let metadata = table.column_metadata.get(col).copied().unwrap_or(0);
        row.push(decode_cell(cursor, column_type, metadata)?);
    }
    Ok(row)
}

fn decode_cell(cursor: &mut Cursor<&[u8]>, column_type: ColumnType, metadata: u16) -> Result<CellValue> {
    let value = match column_type {
        ColumnType::Tiny => CellValue::Int(cursor.read_i8()? as i64),
        ColumnType::Short => CellValue::Int(cursor.read_i16::<LittleEndian>()? as i64),
        ColumnType::Int24 => CellValue::Int(cursor.read_i24::<LittleEndian>()? as i64),
        ColumnType::Long => CellValue::Int(cursor.read_i32::<LittleEndian>()? as i64),
        ColumnType::LongLong => CellValue::Int(cursor.read_i64::<LittleEndian>()?),
        ColumnType::Float => CellValue::Float(cursor.read_f32::<LittleEndian>()?),
        ColumnType::Double => CellValue::Double(cursor.read_f64::<LittleEndian>()?),
        ColumnType::Year => {
            let year = cursor.read_u8()? as i64;
            CellValue::Int(if year == 0 { 0 } else { year + 1900 })
        }
        ColumnType::Date | ColumnType::NewDate => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            CellValue::Date(format!(
                "{:04}-{:02}-{:02}",
                (packed >> 9) & 0x7FFF,
                (packed >> 5) & 0x0F,
                packed & 0x1F
            ))
        }
        ColumnType::Time => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            CellValue::Time(format!(
                "{:02}:{:02}:{:02}",
                packed / 10000,
                (packed / 100) % 100,
                packed % 100
            ))
        }
        ColumnType::DateTime => {
            let packed = cursor.read_u64::<LittleEndian>()?;
            let date = packed / 1_000_000;
            let time = packed % 1_000_000;
            CellValue::DateTime(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                date / 10000,
                (date / 100) % 100,
                date % 100,
                time / 10000,
                (time / 100) % 100,
                time % 100
            ))
        }
        ColumnType::Timestamp => {
            let seconds = cursor.read_u32::<LittleEndian>()?;
            CellValue::DateTime(format_timestamp(seconds, 0, 0))
        }
        ColumnType::Timestamp2 => {
            let seconds = cursor.read_u32::<BigEndian>()?;
            let fsp = metadata as u8;
            let micros = read_fractional_seconds(cursor, fsp)?;
            CellValue::DateTime(format_timestamp(seconds, micros, fsp))
        }
        ColumnType::DateTime2 => {
            let packed = cursor.read_uint::<BigEndian>(5)?;
            let fsp = metadata as u8;
            let micros = read_fractional_seconds(cursor, fsp)?;
            let year_month = (packed >> 22) & 0x1FFFF;
            let text = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year_month / 13,
                year_month % 13,
                (packed >> 17) & 0x1F,
                (packed >> 12) & 0x1F,
                (packed >> 6) & 0x3F,
                packed & 0x3F
            );
            CellValue::DateTime(with_fraction(text, micros, fsp))
        }
        ColumnType::Time2 => {
            let packed = cursor.read_u24::<BigEndian>()?;
            let fsp = metadata as u8;
            let micros = read_fractional_seconds(cursor, fsp)?;
            let negative = packed & 0x80_0000 == 0;
            let value = if negative {
                0x80_0000 - (packed & 0x7F_FFFF)
            } else {
                packed & 0x7F_FFFF
            };
            let text = format!(
                "{}{:02}:{:02}:{:02}",
                if negative { "-" } else { "" },
                (value >> 12) & 0x3FF,
                (value >> 6) & 0x3F,
                value & 0x3F
            );
            CellValue::Time(with_fraction(text, micros, fsp))
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if metadata < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            CellValue::String(read_lossy_string(cursor, len)?)
        }
        ColumnType::String => decode_string_family(cursor, metadata)?,
        ColumnType::Enum => CellValue::Enum(read_enum(cursor, metadata & 0xFF)?),
        ColumnType::Set => CellValue::Set(read_set(cursor, metadata & 0xFF)?),
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Geometry => {
            let len = cursor.read_uint::<LittleEndian>(length_width(metadata))? as usize;
            CellValue::Bytes(read_bytes(cursor, len)?)
        }
        ColumnType::Json => {
            let len = cursor.read_uint::<LittleEndian>(length_width(metadata))? as usize;
            CellValue::Json(decode_json_binary(&read_bytes(cursor, len)?))
        }
        ColumnType::NewDecimal | ColumnType::Decimal => {
            let precision = (metadata >> 8) as usize;
            let scale = (metadata & 0xFF) as usize;
            CellValue::Decimal(decode_decimal(cursor, precision, scale)?)
        }
        ColumnType::Bit => {
            let bits = ((metadata >> 8) * 8 + (metadata & 0xFF)) as usize;
            CellValue::Bit(read_bytes(cursor, bits.div_ceil(8))?)
        }
        ColumnType::Null => CellValue::Null,
    };
    Ok(value)
}

/// CHAR/BINARY와 ENUM/SET은 모두 STRING 타입으로 기록되고 메타데이터의 real_type으로 구분한다
fn decode_string_family(cursor: &mut Cursor<&[u8]>, metadata: u16) -> Result<CellValue> {
    let mut real_type = (metadata >> 8) as u8;
    let mut max_len = metadata & 0xFF;
    if real_type & 0x30 != 0x30 {
        // 255 바이트를 넘는 CHAR 길이는 real_type의 상위 비트에 섞여 있다
        max_len |= (((real_type & 0x30) ^ 0x30) as u16) << 4;
        real_type |= 0x30;
    }

    match ColumnType::from_u8(real_type) {
        ColumnType::Enum => Ok(CellValue::Enum(read_enum(cursor, max_len)?)),
        ColumnType::Set => Ok(CellValue::Set(read_set(cursor, max_len)?)),
        _ => {
            let len = if max_len < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            Ok(CellValue::String(read_lossy_string(cursor, len)?))
        }
    }
}

fn read_enum(cursor: &mut Cursor<&[u8]>, width: u16) -> Result<u16> {
    Ok(match width {
        1 => cursor.read_u8()? as u16,
        _ => cursor.read_u16::<LittleEndian>()?,
    })
}

fn read_set(cursor: &mut Cursor<&[u8]>, width: u16) -> Result<u64> {
    let width = (width as usize).clamp(1, 8);
    Ok(cursor.read_uint::<LittleEndian>(width)?)
}

fn length_width(metadata: u16) -> usize {
    match metadata {
        1..=4 => metadata as usize,
        _ => 1,
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_lossy_string(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<String> {
    Ok(String::from_utf8_lossy(&read_bytes(cursor, len)?).into_owned())
}

fn read_short_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u8()? as usize;
    read_lossy_string(cursor, len)
}

/// length-encoded integer
pub fn read_packed_int(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let first = cursor.read_u8()?;
    match first {
        0..=250 => Ok(first as u64),
        252 => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        253 => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        254 => Ok(cursor.read_u64::<LittleEndian>()?),
        _ => Err(CdcError::BinlogParseError(format!(
            "invalid packed integer prefix: {:#x}",
            first
        ))),
    }
}

/// fsp 자릿수만큼의 소수 초를 마이크로초로
fn read_fractional_seconds(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let bytes = (fsp.min(6) as usize).div_ceil(2);
    if bytes == 0 {
        return Ok(0);
    }
    let raw = cursor.read_uint::<BigEndian>(bytes)? as u32;
    Ok(raw * 10u32.pow(6 - 2 * bytes as u32))
}

fn with_fraction(mut text: String, micros: u32, fsp: u8) -> String {
    if fsp > 0 {
        let digits = format!("{:06}", micros);
        text.push('.');
        text.push_str(&digits[..fsp.min(6) as usize]);
    }
    text
}

fn format_timestamp(seconds: u32, micros: u32, fsp: u8) -> String {
    if seconds == 0 {
        return with_fraction("0000-00-00 00:00:00".to_string(), micros, fsp);
    }
    let text = chrono::DateTime::from_timestamp(seconds as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    with_fraction(text, micros, fsp)
}

pub fn count_set_bits(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
}

pub fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .map(|byte| byte & (1 << (idx % 8)) != 0)
        .unwrap_or(false)
}

/// DECIMAL 바이너리 형식: 9자리씩 4 bytes 워드, 남는 자릿수는 1~4 bytes, 부호 비트 반전
pub fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    if scale > precision {
        return Err(CdcError::BinlogParseError(format!(
            "invalid decimal({}, {})",
            precision, scale
        )));
    }
    const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

    let int_digits = precision - scale;
    let (int_words, int_rest) = (int_digits / 9, int_digits % 9);
    let (frac_words, frac_rest) = (scale / 9, scale % 9);
    let int_rest_bytes = DIG_TO_BYTES[int_rest];
    let frac_rest_bytes = DIG_TO_BYTES[frac_rest];
    let size = int_rest_bytes + int_words * 4 + frac_words * 4 + frac_rest_bytes;

    let mut raw = read_bytes(cursor, size)?;
    if raw.is_empty() {
        return Ok("0".to_string());
    }
    let negative = raw[0] & 0x80 == 0;
    raw[0] ^= 0x80;
    if negative {
        raw.iter_mut().for_each(|b| *b = !*b);
    }

    let mut digits = Cursor::new(raw.as_slice());
    let mut int_part = String::new();
    if int_rest_bytes > 0 {
        let value = digits.read_uint::<BigEndian>(int_rest_bytes)?;
        if value > 0 {
            int_part.push_str(&value.to_string());
        }
    }
    for _ in 0..int_words {
        let value = digits.read_u32::<BigEndian>()?;
        if int_part.is_empty() {
            if value > 0 {
                int_part.push_str(&value.to_string());
            }
        } else {
            int_part.push_str(&format!("{:09}", value));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut text = String::new();
    if negative {
        text.push('-');
    }
    text.push_str(&int_part);

    if scale > 0 {
        text.push('.');
        for _ in 0..frac_words {
            text.push_str(&format!("{:09}", digits.read_u32::<BigEndian>()?));
        }
        if frac_rest_bytes > 0 {
            let value = digits.read_uint::<BigEndian>(frac_rest_bytes)?;
            text.push_str(&format!("{:0width$}", value, width = frac_rest));
        }
    }
    Ok(text)
}

/// MySQL 바이너리 JSON. 해석할 수 없으면 텍스트 JSON, 그것도 아니면 문자열로 둔다.
pub fn decode_json_binary(data: &[u8]) -> Value {
    if data.is_empty() {
        return Value::Null;
    }
    match json_typed(data[0], &data[1..]) {
        Ok(value) => value,
        Err(_) => serde_json::from_slice(data)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(data).into_owned())),
    }
}

fn json_error(what: &str) -> CdcError {
    CdcError::BinlogParseError(format!("json binary: {}", what))
}

fn json_slice(data: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    data.get(start..start + len).ok_or_else(|| json_error("truncated"))
}

fn json_typed(type_byte: u8, data: &[u8]) -> Result<Value> {
    let mut cursor = Cursor::new(data);
    Ok(match type_byte {
        0x00 => json_container(data, false, true)?,
        0x01 => json_container(data, true, true)?,
        0x02 => json_container(data, false, false)?,
        0x03 => json_container(data, true, false)?,
        0x04 => json_literal(cursor.read_u8()? as u16),
        0x05 => Value::from(cursor.read_i16::<LittleEndian>()?),
        0x06 => Value::from(cursor.read_u16::<LittleEndian>()?),
        0x07 => Value::from(cursor.read_i32::<LittleEndian>()?),
        0x08 => Value::from(cursor.read_u32::<LittleEndian>()?),
        0x09 => Value::from(cursor.read_i64::<LittleEndian>()?),
        0x0a => Value::from(cursor.read_u64::<LittleEndian>()?),
        0x0b => serde_json::Number::from_f64(cursor.read_f64::<LittleEndian>()?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        0x0c => {
            let (len, prefix) = json_var_len(data)?;
            Value::String(String::from_utf8_lossy(json_slice(data, prefix, len)?).into_owned())
        }
        0x0f => {
            // opaque: 내부 컬럼 타입 1 byte + 가변 길이 데이터
            let rest = data.get(1..).ok_or_else(|| json_error("truncated opaque"))?;
            let (len, prefix) = json_var_len(rest)?;
            Value::String(String::from_utf8_lossy(json_slice(rest, prefix, len)?).into_owned())
        }
        other => return Err(json_error(&format!("unknown type {:#x}", other))),
    })
}

fn json_literal(code: u16) -> Value {
    match code {
        0x01 => Value::Bool(true),
        0x02 => Value::Bool(false),
        _ => Value::Null,
    }
}

fn json_read_offset(data: &[u8], at: usize, large: bool) -> Result<usize> {
    let width = if large { 4 } else { 2 };
    let mut cursor = Cursor::new(json_slice(data, at, width)?);
    Ok(cursor.read_uint::<LittleEndian>(width)? as usize)
}

fn json_container(data: &[u8], large: bool, object: bool) -> Result<Value> {
    let width = if large { 4 } else { 2 };
    let count = json_read_offset(data, 0, large)?;
    let header = width * 2;
    let key_entry = width + 2;
    let value_entry = width + 1;
    let values_start = if object {
        header + count * key_entry
    } else {
        header
    };

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let entry = values_start + i * value_entry;
        let type_byte = *data.get(entry).ok_or_else(|| json_error("truncated entry"))?;
        values.push(json_entry_value(data, type_byte, entry + 1, large)?);
    }

    if !object {
        return Ok(Value::Array(values));
    }

    let mut map = Map::with_capacity(count);
    for (i, value) in values.into_iter().enumerate() {
        let entry = header + i * key_entry;
        let key_offset = json_read_offset(data, entry, large)?;
        let key_len =
            Cursor::new(json_slice(data, entry + width, 2)?).read_u16::<LittleEndian>()? as usize;
        let key = String::from_utf8_lossy(json_slice(data, key_offset, key_len)?).into_owned();
        map.insert(key, value);
    }
    Ok(Value::Object(map))
}

/// 작은 스칼라는 값 엔트리의 오프셋 자리에 인라인으로 들어 있다
fn json_entry_value(data: &[u8], type_byte: u8, at: usize, large: bool) -> Result<Value> {
    let inline = |width: usize| json_slice(data, at, width).map(Cursor::new);
    match type_byte {
        0x04 => return Ok(json_literal(inline(2)?.read_u16::<LittleEndian>()?)),
        0x05 => return Ok(Value::from(inline(2)?.read_i16::<LittleEndian>()?)),
        0x06 => return Ok(Value::from(inline(2)?.read_u16::<LittleEndian>()?)),
        0x07 if large => return Ok(Value::from(inline(4)?.read_i32::<LittleEndian>()?)),
        0x08 if large => return Ok(Value::from(inline(4)?.read_u32::<LittleEndian>()?)),
        _ => {}
    }
    let offset = json_read_offset(data, at, large)?;
    let value = data.get(offset..).ok_or_else(|| json_error("offset out of bounds"))?;
    json_typed(type_byte, value)
}

/// 7비트 단위 가변 길이 정수 (최대 5 bytes)
fn json_var_len(data: &[u8]) -> Result<(usize, usize)> {
    let mut len = 0usize;
    for (i, byte) in data.iter().take(5).enumerate() {
        len |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((len, i + 1));
        }
    }
    Err(json_error("truncated length"))
}

/// 부호 없는 정수 컬럼의 값을 타입 폭에 맞춰 재해석
pub fn as_unsigned(cell: CellValue, column_type: ColumnType) -> CellValue {
    match cell {
        CellValue::Int(v) => CellValue::UInt(match column_type {
            ColumnType::Tiny => v as u8 as u64,
            ColumnType::Short => v as u16 as u64,
            ColumnType::Int24 => (v as u32 & 0xFF_FFFF) as u64,
            ColumnType::Long => v as u32 as u64,
            _ => v as u64,
        }),
        other => other,
    }
}
