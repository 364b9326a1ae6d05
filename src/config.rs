//! 소스 설정 및 프로세스 환경 설정
//!
//! - `SourceConfig`: 인덱스 하나에 대응하는 MySQL 소스 (저장소에 JSON으로 영속화)
//! - `Settings`: 환경 변수에서 읽는 프로세스 설정
//! - `PipelineSettings`: 디바운스/백필/모니터 주기 등 파이프라인 상수

use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 포트가 0으로 저장된 경우 사용하는 기본 MySQL 포트
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// 웹훅 요청에 붙는 고정 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookHeader {
    pub header_key: String,
    pub header_val: String,
}

/// 복제 소스 설정. 한 번 Watchman이 만들어지면 변경되지 않으며,
/// 새 값은 항상 새 Watchman을 만든다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// 논리 인덱스 이름 (Watchman 레지스트리의 키)
    pub index: String,
    /// 쉼표로 구분된 감시 테이블 목록
    pub watch_table: String,
    #[serde(default)]
    pub maker_hook: Option<String>,
    #[serde(default)]
    pub maker_headers: Vec<WebhookHeader>,
}

impl SourceConfig {
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        index: impl Into<String>,
        watch_table: impl Into<String>,
    ) -> Self {
        SourceConfig {
            host: host.into(),
            user: "root".to_string(),
            database: database.into(),
            index: index.into(),
            watch_table: watch_table.into(),
            ..Default::default()
        }
    }

    /// Watchman 생성 전 필수 항목 검사
    pub fn validate(&self) -> Result<()> {
        if self.watched_tables().is_empty() {
            return Err(CdcError::NoWatchTable);
        }
        if self.database.trim().is_empty() {
            return Err(CdcError::NoWatchDatabase);
        }
        if self.host.trim().is_empty() {
            return Err(CdcError::InvalidConfig(format!(
                "host is empty for index {}",
                self.index
            )));
        }
        if self.index.trim().is_empty() {
            return Err(CdcError::InvalidConfig("index name is empty".to_string()));
        }
        Ok(())
    }

    pub fn safe_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_MYSQL_PORT
        } else {
            self.port
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.safe_port())
    }

    /// 감시 테이블 목록 (공백 제거, 빈 항목 제외)
    pub fn watched_tables(&self) -> Vec<String> {
        self.watch_table
            .split(',')
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// 복제 클라이언트에 넘길 `db\.table` 정규식 패턴
    pub fn include_table_patterns(&self) -> Vec<String> {
        let database = regex::escape(self.database.trim());
        self.watched_tables()
            .iter()
            .map(|t| format!("^{}\\.{}$", database, regex::escape(t)))
            .collect()
    }

    /// 빈 문자열은 웹훅 미설정으로 취급
    pub fn webhook_url(&self) -> Option<&str> {
        self.maker_hook
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// 프로세스 환경 설정
#[derive(Debug, Clone)]
pub struct Settings {
    /// 이 시간보다 최근에 완료된 백필은 다시 수행하지 않는다
    pub full_sync_since: Duration,
    pub data_dir: PathBuf,
    pub server_id: u32,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup("FULL_SYNC_SINCE").ok_or_else(|| {
            CdcError::SettingsError("FULL_SYNC_SINCE env variable not set".to_string())
        })?;
        let minutes: f64 = raw.trim().parse().map_err(|_| {
            CdcError::SettingsError(format!("FULL_SYNC_SINCE has invalid value: {}", raw))
        })?;
        if !minutes.is_finite() || minutes < 0.0 {
            return Err(CdcError::SettingsError(format!(
                "FULL_SYNC_SINCE must be a non-negative number of minutes: {}",
                raw
            )));
        }
        let full_sync_since = Duration::try_from_secs_f64(minutes * 60.0).map_err(|_| {
            CdcError::SettingsError(format!("FULL_SYNC_SINCE is out of range: {}", raw))
        })?;

        let data_dir = lookup("SCOUT_DATA_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let server_id = match lookup("SCOUT_SERVER_ID") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                CdcError::SettingsError(format!("SCOUT_SERVER_ID has invalid value: {}", raw))
            })?,
            None => 2001,
        };

        Ok(Settings {
            full_sync_since,
            data_dir,
            server_id,
        })
    }
}

/// 파이프라인 타이밍/크기 상수
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub min_window: Duration,
    pub max_window: Duration,
    pub channel_capacity: usize,
    pub page_size: usize,
    pub rotation_poll: Duration,
    pub replace_grace: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            min_window: Duration::from_millis(100),
            max_window: Duration::from_secs(1),
            channel_capacity: 1000,
            page_size: 1000,
            rotation_poll: Duration::from_secs(2),
            replace_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(100),
        }
    }
}
