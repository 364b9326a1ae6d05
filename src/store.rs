//! 키-값 저장소
//!
//! 소스 설정, 인덱스 설정, 백필 완료 마커, 인덱스 문서를 버킷 단위로 보관합니다.
//! `DiskStore`는 JSON-lines 추가 전용 로그를 열 때 재생(replay)하고 압축(compact)합니다.

use crate::error::{CdcError, Result};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_BUCKET: &str = "_default_";
pub const DB_CONFIG_BUCKET: &str = "_db_config_";
pub const INDEX_CONFIG_BUCKET: &str = "_index_config_";

const STORE_FILE: &str = "storage.scout";

/// 버킷 이름이 비어 있으면 기본 버킷
fn bucket_name(bucket: &str) -> &str {
    if bucket.is_empty() {
        DEFAULT_BUCKET
    } else {
        bucket
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str, bucket: &str) -> Result<Option<String>>;

    fn put(&self, key: &str, value: &str, bucket: &str) -> Result<()>;

    /// 여러 항목을 한 번에 기록
    fn put_batch(&self, entries: Vec<(String, String)>, bucket: &str) -> Result<()>;

    fn delete(&self, key: &str, bucket: &str) -> Result<()>;

    /// `prefix`로 시작하는 항목을 키 순서로 최대 `limit`개 (0이면 무제한)
    fn find(&self, prefix: &str, limit: usize, bucket: &str) -> Result<Vec<(String, String)>>;
}

/// JSON 값 저장/조회 헬퍼
pub trait JsonStoreExt: KeyValueStore {
    fn put_json<T: Serialize>(&self, key: &str, value: &T, bucket: &str) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.put(key, &encoded, bucket)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str, bucket: &str) -> Result<Option<T>> {
        match self.get(key, bucket)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn find_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
        limit: usize,
        bucket: &str,
    ) -> Result<Vec<T>> {
        self.find(prefix, limit, bucket)?
            .into_iter()
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(CdcError::from))
            .collect()
    }
}

impl<S: KeyValueStore + ?Sized> JsonStoreExt for S {}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogRecord {
    Put {
        bucket: String,
        key: String,
        value: String,
    },
    Delete {
        bucket: String,
        key: String,
    },
}

type Buckets = BTreeMap<String, BTreeMap<String, String>>;

/// 파일 기반 저장소
#[derive(Debug)]
pub struct DiskStore {
    path: PathBuf,
    buckets: RwLock<Buckets>,
    log: Mutex<File>,
}

impl DiskStore {
    /// `dir` 아래 저장소 파일을 열거나 만든다
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(STORE_FILE);

        let mut buckets = Buckets::new();
        if path.exists() {
            replay(&path, &mut buckets)?;
        }
        for bucket in [DEFAULT_BUCKET, DB_CONFIG_BUCKET, INDEX_CONFIG_BUCKET] {
            buckets.entry(bucket.to_string()).or_default();
        }

        compact(&path, &buckets)?;

        let log = OpenOptions::new().append(true).create(true).open(&path)?;
        debug!(path = %path.display(), buckets = buckets.len(), "store opened");

        Ok(DiskStore {
            path,
            buckets: RwLock::new(buckets),
            log: Mutex::new(log),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, records: &[LogRecord]) -> Result<()> {
        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }
        let mut log = self.log.lock();
        log.write_all(&buffer)?;
        log.flush()?;
        Ok(())
    }
}

fn replay(path: &Path, buckets: &mut Buckets) -> Result<()> {
    let reader = BufReader::new(File::open(path)?);
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(&line) {
            Ok(LogRecord::Put { bucket, key, value }) => {
                buckets.entry(bucket).or_default().insert(key, value);
            }
            Ok(LogRecord::Delete { bucket, key }) => {
                if let Some(entries) = buckets.get_mut(&bucket) {
                    entries.remove(&key);
                }
            }
            Err(e) => {
                // 마지막 줄이 쓰다 만 상태일 수 있다
                warn!(line = line_no + 1, error = %e, "skipping unreadable store record");
            }
        }
    }
    Ok(())
}

fn compact(path: &Path, buckets: &Buckets) -> Result<()> {
    let tmp = path.with_extension("compact");
    {
        let mut file = File::create(&tmp)?;
        for (bucket, entries) in buckets {
            for (key, value) in entries {
                let record = LogRecord::Put {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    value: value.clone(),
                };
                serde_json::to_writer(&mut file, &record)?;
                file.write_all(b"\n")?;
            }
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl KeyValueStore for DiskStore {
    fn get(&self, key: &str, bucket: &str) -> Result<Option<String>> {
        let buckets = self.buckets.read();
        Ok(buckets
            .get(bucket_name(bucket))
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn put(&self, key: &str, value: &str, bucket: &str) -> Result<()> {
        self.put_batch(vec![(key.to_string(), value.to_string())], bucket)
    }

    fn put_batch(&self, entries: Vec<(String, String)>, bucket: &str) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let bucket = bucket_name(bucket).to_string();
        let records: Vec<LogRecord> = entries
            .iter()
            .map(|(key, value)| LogRecord::Put {
                bucket: bucket.clone(),
                key: key.clone(),
                value: value.clone(),
            })
            .collect();

        // 로그와 메모리에 같은 순서로 반영되도록 쓰기 락을 잡은 채 기록한다
        let mut buckets = self.buckets.write();
        self.append(&records)?;
        let target = buckets.entry(bucket).or_default();
        for (key, value) in entries {
            target.insert(key, value);
        }
        Ok(())
    }

    fn delete(&self, key: &str, bucket: &str) -> Result<()> {
        let bucket = bucket_name(bucket);
        let mut buckets = self.buckets.write();
        let Some(entries) = buckets.get_mut(bucket) else {
            return Err(CdcError::StoreError(format!("bucket {} not found", bucket)));
        };
        self.append(&[LogRecord::Delete {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }])?;
        entries.remove(key);
        Ok(())
    }

    fn find(&self, prefix: &str, limit: usize, bucket: &str) -> Result<Vec<(String, String)>> {
        let buckets = self.buckets.read();
        let Some(entries) = buckets.get(bucket_name(bucket)) else {
            return Ok(Vec::new());
        };
        let matching = entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()));
        Ok(if limit > 0 {
            matching.take(limit).collect()
        } else {
            matching.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use std::sync::Arc;

    #[test]
    fn test_get_put_default_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(store.get("missing", "").unwrap(), None);

        store.put("completed:shop:orders", "2024-01-01 00:00:00", "").unwrap();
        assert_eq!(
            store.get("completed:shop:orders", DEFAULT_BUCKET).unwrap().as_deref(),
            Some("2024-01-01 00:00:00")
        );
    }

    #[test]
    fn test_find_prefix_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store
            .put_batch(
                vec![
                    ("a:1".into(), "x".into()),
                    ("a:2".into(), "y".into()),
                    ("a:3".into(), "z".into()),
                    ("b:1".into(), "w".into()),
                ],
                "bucket",
            )
            .unwrap();

        let all_a = store.find("a:", 0, "bucket").unwrap();
        assert_eq!(all_a.len(), 3);
        assert_eq!(store.find("a:", 2, "bucket").unwrap().len(), 2);
        assert_eq!(store.find("", 0, "bucket").unwrap().len(), 4);
        assert!(store.find("a:", 0, "nope").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_replays_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path()).unwrap();
            let cfg = SourceConfig::new("db1", "shop", "orders-idx", "orders");
            store.put_json(&cfg.index, &cfg, DB_CONFIG_BUCKET).unwrap();
            store.put("gone", "soon", "").unwrap();
            store.delete("gone", "").unwrap();
        }

        let store = DiskStore::open(dir.path()).unwrap();
        let configs: Vec<SourceConfig> = store.find_json("", 0, DB_CONFIG_BUCKET).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].watch_table, "orders");
        assert_eq!(store.get("gone", "").unwrap(), None);
    }

    #[test]
    fn test_torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path()).unwrap();
            store.put("k", "v", "").unwrap();
        }
        let path = dir.path().join(STORE_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"put\",\"buck").unwrap();

        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(store.get("k", "").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_concurrent_writes_replay_to_served_value() {
        let dir = tempfile::tempdir().unwrap();
        let served = {
            let store = Arc::new(DiskStore::open(dir.path()).unwrap());
            let writers: Vec<_> = (0..8)
                .map(|writer| {
                    let store = store.clone();
                    std::thread::spawn(move || {
                        for round in 0..50 {
                            let value = format!("{}-{}", writer, round);
                            store.put("doc-1", &value, "_index_orders_").unwrap();
                        }
                    })
                })
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }
            store.get("doc-1", "_index_orders_").unwrap()
        };

        let store = DiskStore::open(dir.path()).unwrap();
        assert!(served.is_some());
        assert_eq!(store.get("doc-1", "_index_orders_").unwrap(), served);
    }

    #[test]
    fn test_delete_unknown_bucket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.delete("k", "missing-bucket"),
            Err(CdcError::StoreError(_))
        ));
    }
}
