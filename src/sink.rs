//! 정규화된 레코드의 최종 목적지 (검색 인덱스 / 웹훅)
//!
//! 두 싱크 모두 best-effort 전달이다. 결과는 호출자가 로그로 남기고 버리며 재시도는 없다.

use crate::config::WebhookHeader;
use crate::error::{CdcError, Result};
use crate::events::NormalizedRecord;
use crate::store::KeyValueStore;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 인덱스 설정 (`_index_config_` 버킷에 저장)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub index: String,
    /// 문서 고유 ID로 쓸 컬럼
    #[serde(default)]
    pub id_field: String,
}

#[async_trait]
pub trait IndexSink: Send + Sync {
    fn name(&self) -> &str;

    /// id 필드를 추출해 중복 제거(마지막 값 우선) 후 일괄 기록. 기록한 문서 수를 반환한다.
    async fn prepare_and_index(&self, records: Vec<NormalizedRecord>) -> Result<usize>;

    async fn close(&self) -> Result<()>;
}

/// 레코드에서 문서 ID 추출 (문자열/숫자만 허용)
pub fn document_id(record: &NormalizedRecord, id_field: &str) -> Option<String> {
    match record.get(id_field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 같은 ID는 마지막 레코드만 남기고, 남은 레코드는 마지막 등장 순서를 따른다
pub fn dedup_last_wins(
    records: Vec<NormalizedRecord>,
    id_field: &str,
) -> (Vec<(String, NormalizedRecord)>, usize) {
    let mut seen = HashSet::new();
    let mut missing = 0;
    let mut kept = Vec::with_capacity(records.len());

    for record in records.into_iter().rev() {
        match document_id(&record, id_field) {
            Some(id) => {
                if seen.insert(id.clone()) {
                    kept.push((id, record));
                }
            }
            None => missing += 1,
        }
    }
    kept.reverse();
    (kept, missing)
}

/// 키-값 저장소에 문서를 보관하는 인덱스
pub struct DocumentIndex {
    config: IndexConfig,
    bucket: String,
    store: Arc<dyn KeyValueStore>,
    closed: AtomicBool,
}

impl DocumentIndex {
    pub fn new(config: IndexConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let bucket = format!("_index_{}_", config.index);
        DocumentIndex {
            config,
            bucket,
            store,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn get_document(&self, id: &str) -> Result<Option<NormalizedRecord>> {
        match self.store.get(id, &self.bucket)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn document_count(&self) -> Result<usize> {
        Ok(self.store.find("", 0, &self.bucket)?.len())
    }
}

#[async_trait]
impl IndexSink for DocumentIndex {
    fn name(&self) -> &str {
        &self.config.index
    }

    async fn prepare_and_index(&self, records: Vec<NormalizedRecord>) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CdcError::StoreError(format!(
                "index {} is closed",
                self.config.index
            )));
        }
        let id_field = self.config.id_field.trim();
        if id_field.is_empty() {
            return Err(CdcError::MissingIdField(self.config.index.clone()));
        }

        let (documents, missing) = dedup_last_wins(records, id_field);
        if missing > 0 {
            warn!(
                index = %self.config.index,
                id_field,
                missing,
                "records without id skipped"
            );
        }
        if documents.is_empty() {
            return Err(CdcError::NoUpdate);
        }

        let entries = documents
            .into_iter()
            .map(|(id, doc)| Ok((id, serde_json::to_string(&doc)?)))
            .collect::<Result<Vec<_>>>()?;
        let count = entries.len();

        let store = self.store.clone();
        let bucket = self.bucket.clone();
        tokio::task::spawn_blocking(move || store.put_batch(entries, &bucket))
            .await
            .map_err(|e| CdcError::StoreError(format!("index write task failed: {}", e)))??;

        debug!(index = %self.config.index, count, "documents indexed");
        Ok(count)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// 웹훅 싱크: JSON 배열을 그대로 POST
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, headers: &[WebhookHeader]) -> Result<Self> {
        let mut map = HeaderMap::new();
        for header in headers {
            let name = HeaderName::from_bytes(header.header_key.trim().as_bytes()).map_err(|e| {
                CdcError::InvalidConfig(format!("invalid header {}: {}", header.header_key, e))
            })?;
            let value = HeaderValue::from_str(header.header_val.trim()).map_err(|e| {
                CdcError::InvalidConfig(format!("invalid header value for {}: {}", header.header_key, e))
            })?;
            map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(WebhookSink {
            client,
            url: url.into(),
            headers: map,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn post(&self, records: &[NormalizedRecord]) -> Result<reqwest::StatusCode> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(records)
            .send()
            .await?;
        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DiskStore;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn record(value: Value) -> NormalizedRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("record must be an object"),
        }
    }

    fn index(id_field: &str) -> (tempfile::TempDir, DocumentIndex) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(DiskStore::open(dir.path()).unwrap());
        let config = IndexConfig {
            index: "orders-idx".to_string(),
            id_field: id_field.to_string(),
        };
        (dir, DocumentIndex::new(config, store))
    }

    #[test]
    fn test_dedup_keeps_last_write() {
        let records = vec![
            record(json!({"id": 1, "total": 1.0})),
            record(json!({"id": 2, "total": 2.0})),
            record(json!({"total": 3.0})),
            record(json!({"id": 1, "total": 4.0})),
        ];
        let (kept, missing) = dedup_last_wins(records, "id");
        assert_eq!(missing, 1);
        let ids: Vec<&str> = kept.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
        assert_eq!(kept[1].1["total"], json!(4.0));
    }

    #[tokio::test]
    async fn test_prepare_and_index_writes_documents() {
        let (_dir, idx) = index("id");
        let written = idx
            .prepare_and_index(vec![
                record(json!({"id": 1, "total": 9.99})),
                record(json!({"id": "abc", "total": 1.5})),
                record(json!({"id": 1, "total": 10.5})),
            ])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(idx.document_count().unwrap(), 2);
        let doc = idx.get_document("1").unwrap().unwrap();
        assert_eq!(doc["total"], json!(10.5));
    }

    #[tokio::test]
    async fn test_prepare_and_index_requires_id_field() {
        let (_dir, idx) = index("");
        let err = idx
            .prepare_and_index(vec![record(json!({"id": 1}))])
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::MissingIdField(_)));
    }

    #[tokio::test]
    async fn test_prepare_and_index_without_ids_is_no_update() {
        let (_dir, idx) = index("sku");
        let err = idx
            .prepare_and_index(vec![record(json!({"id": 1}))])
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::NoUpdate));
    }

    #[tokio::test]
    async fn test_closed_index_rejects_writes() {
        let (_dir, idx) = index("id");
        tokio_test::assert_ok!(idx.close().await);
        assert!(idx
            .prepare_and_index(vec![record(json!({"id": 1}))])
            .await
            .is_err());
    }

    #[test]
    fn test_webhook_rejects_bad_header() {
        let headers = vec![WebhookHeader {
            header_key: "bad header".to_string(),
            header_val: "x".to_string(),
        }];
        assert!(matches!(
            WebhookSink::new("http://localhost/hook", &headers),
            Err(CdcError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_posts_json_with_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|line| {
                            let lower = line.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        let headers = vec![WebhookHeader {
            header_key: "X-Token".to_string(),
            header_val: "secret".to_string(),
        }];
        let sink = WebhookSink::new(format!("http://{}/hook", addr), &headers).unwrap();
        let status = sink
            .post(&[record(json!({"id": 1, "total": 9.99}))])
            .await
            .unwrap();
        assert!(status.is_success());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.to_ascii_lowercase().contains("x-token: secret"));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let parsed: Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed, json!([{"id": 1, "total": 9.99}]));
    }
}
