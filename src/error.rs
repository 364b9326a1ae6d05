//! 복제 파이프라인 전역 에러 타입

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP 요청 에러: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("감시할 테이블이 지정되지 않았습니다")]
    NoWatchTable,

    #[error("감시할 데이터베이스가 지정되지 않았습니다")]
    NoWatchDatabase,

    #[error("환경 설정 에러: {0}")]
    SettingsError(String),

    #[error("저장소 에러: {0}")]
    StoreError(String),

    #[error("찾을 수 없음: {0}")]
    NotFound(String),

    #[error("인덱스 {0}에 id 필드가 설정되지 않았습니다")]
    MissingIdField(String),

    #[error("갱신된 문서가 없습니다")]
    NoUpdate,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("Timeout 에러")]
    Timeout,
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        CdcError::QueryError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
