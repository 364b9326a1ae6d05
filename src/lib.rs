//! MySQL binlog 변경 데이터 캡처 파이프라인
//!
//! 소스 DB 의 행 변경을 복제 스트림으로 받아 디바운스로 묶은 뒤
//! 검색 인덱스나 웹훅으로 전달합니다.
//! 주요 구성:
//! - binlog 프로토콜/디코더와 복제 클라이언트
//! - 행 이벤트 필터, 디바운스 결합기, 디스패처(백필 포함)
//! - Watchman 과 이를 관리하는 서비스 (회전 감지, 핫 재설정)

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod config;
pub mod connection;
pub mod debounce;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod filter;
pub mod offset;
pub mod protocol;
pub mod pubsub;
pub mod registry;
pub mod replication;
pub mod service;
pub mod sink;
pub mod store;
pub mod watchman;

pub use binlog_client::BinlogClient;
pub use config::{PipelineSettings, Settings, SourceConfig};
pub use connection::{MySqlConnection, MySqlConnector};
pub use dispatcher::Dispatcher;
pub use error::{CdcError, Result};
pub use events::{ChangeEvent, NormalizedRecord, RawRowChange};
pub use filter::EventFilter;
pub use offset::BinlogPosition;
pub use service::Service;
pub use watchman::Watchman;
