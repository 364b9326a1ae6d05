//! 프로세스 내부 pub/sub
//!
//! 핫 재설정 알림(새 소스 설정 등)을 토픽 구독자에게 전달합니다.
//! 발행은 구독자 처리 속도와 관계없이 즉시 반환합니다.

use crate::config::SourceConfig;
use crate::sink::IndexConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// 소스 설정 변경 토픽
pub const DB_CONFIG_TOPIC: &str = "db-cnf";

#[derive(Debug, Clone)]
pub enum Message {
    DbConfig(SourceConfig),
    IndexConfig(IndexConfig),
}

pub type Subscription = mpsc::UnboundedReceiver<Message>;

#[derive(Debug, Default)]
pub struct PubSub {
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
}

impl PubSub {
    pub fn new() -> Self {
        PubSub::default()
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// 닫힌 구독을 정리한다. 수신자를 drop 한 뒤 호출하면 된다.
    pub fn unsubscribe_closed(&self, topic: &str) {
        if let Some(subscribers) = self.subscribers.write().get_mut(topic) {
            subscribers.retain(|tx| !tx.is_closed());
        }
    }

    /// 구독자 수를 반환
    pub fn publish(&self, topic: &str, message: Message) -> usize {
        let subscribers = self.subscribers.read();
        let Some(targets) = subscribers.get(topic) else {
            debug!(topic, "publish without subscribers");
            return 0;
        };
        targets
            .iter()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }
}
