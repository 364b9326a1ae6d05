//! 행 이벤트 필터
//!
//! 복제 클라이언트 콜백에서 감시 테이블의 insert/update 만 디스패처 입력 채널로 넘긴다.
//! 채널이 가득 차면 콜백이 블록되어 복제 스트림에 역압이 걸린다. 이벤트는 버리지 않는다.

use crate::config::SourceConfig;
use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::error::{CdcError, Result};
use crate::events::{ChangeEvent, RawRowChange, RowAction};
use crate::offset::{BinlogPosition, PositionTracker};
use crate::replication::RowEventHandler;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub struct EventFilter {
    index: String,
    watched: HashSet<String>,
    tracker: PositionTracker,
    events: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
    handle: Mutex<Option<DispatcherHandle>>,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
}

impl EventFilter {
    /// 디스패처 루프를 시작하고 그 입력 채널에 연결된 필터를 만든다
    pub fn new(source: &SourceConfig, dispatcher: Arc<Dispatcher>, tracker: PositionTracker) -> Self {
        let handle = dispatcher.start();
        EventFilter {
            index: source.index.clone(),
            watched: source.watched_tables().into_iter().collect(),
            tracker,
            events: Mutex::new(Some(handle.sender())),
            handle: Mutex::new(Some(handle)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn accepts(&self, change: &RawRowChange) -> bool {
        matches!(change.action, RowAction::Insert | RowAction::Update)
            && self.watched.contains(&change.table.name)
    }

    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.lock().is_none()
    }

    /// stop 이벤트와 done 신호를 보내고 디스패처 참조를 놓는다.
    /// 이미 멈춘 필터에서는 아무 일도 하지 않는다.
    pub async fn stop(&self, grace: Duration) -> bool {
        self.events.lock().take();
        let handle = self.handle.lock().take();
        let stopped = match handle {
            Some(handle) => handle.shutdown(grace).await,
            None => true,
        };
        self.dispatcher.lock().take();
        debug!(index = %self.index, stopped, "Event filter stopped");
        stopped
    }
}

#[async_trait]
impl RowEventHandler for EventFilter {
    async fn on_row(&self, change: RawRowChange) -> Result<()> {
        if !self.accepts(&change) {
            trace!(index = %self.index, table = %change.table, action = change.action.as_str(), "row event dropped");
            return Ok(());
        }

        let Some(sender) = self.events.lock().clone() else {
            return Ok(());
        };

        let table = change.table.name.clone();
        let count = change.rows.len();
        sender
            .send(ChangeEvent::start(change))
            .await
            .map_err(|_| CdcError::ChannelClosed)?;
        debug!(index = %self.index, table = %table, count, "Binlog row activity");
        Ok(())
    }

    async fn on_pos_synced(&self, position: &BinlogPosition, force: bool) -> Result<()> {
        self.tracker.set(position.clone());
        trace!(index = %self.index, position = %position, force, "position synced");
        Ok(())
    }
}
