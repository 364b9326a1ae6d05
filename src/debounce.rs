//! 시간 창 기반 디바운스 결합기
//!
//! 상태 머신: `Idle` ↔ `Accumulating { min_deadline, max_deadline }`
//! - 이벤트 수신: min 타이머 재설정, max 타이머는 비어 있을 때만 설정
//! - min 또는 max 만료: 두 타이머 해제 후 마지막으로 받은 이벤트를 flush 신호로 출력
//!
//! 버스트는 `min` 동안 조용해지면 한 번의 flush로 합쳐지고,
//! 계속 들어오는 경우에도 첫 이벤트로부터 `max` 안에 flush 된다.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceWindows {
    pub min: Duration,
    pub max: Duration,
}

impl DebounceWindows {
    pub fn new(min: Duration, max: Duration) -> Self {
        DebounceWindows { min, max }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Accumulating {
        min_deadline: Instant,
        max_deadline: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// 입력이 `min` 동안 없었음
    Quiet,
    /// 첫 이벤트로부터 `max` 경과
    MaxWait,
}

#[derive(Debug)]
pub struct Debouncer {
    windows: DebounceWindows,
    state: DebounceState,
}

impl Debouncer {
    pub fn new(windows: DebounceWindows) -> Self {
        Debouncer {
            windows,
            state: DebounceState::Idle,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn on_event(&mut self, now: Instant) {
        let min_deadline = now + self.windows.min;
        let max_deadline = match self.state {
            DebounceState::Idle => now + self.windows.max,
            DebounceState::Accumulating { max_deadline, .. } => max_deadline,
        };
        self.state = DebounceState::Accumulating {
            min_deadline,
            max_deadline,
        };
    }

    /// 다음 만료 시각과 그 이유
    pub fn next_deadline(&self) -> Option<(Instant, FlushReason)> {
        match self.state {
            DebounceState::Idle => None,
            DebounceState::Accumulating {
                min_deadline,
                max_deadline,
            } => {
                if min_deadline <= max_deadline {
                    Some((min_deadline, FlushReason::Quiet))
                } else {
                    Some((max_deadline, FlushReason::MaxWait))
                }
            }
        }
    }

    /// 타이머 만료: 두 타이머 모두 해제
    pub fn on_timer(&mut self) {
        self.state = DebounceState::Idle;
    }
}

async fn wait_for(deadline: Option<(Instant, FlushReason)>) -> FlushReason {
    match deadline {
        Some((at, reason)) => {
            sleep_until(at).await;
            reason
        }
        None => std::future::pending().await,
    }
}

/// 입력 채널 위에 디바운스 결합기를 띄운다.
///
/// `on_item`은 이벤트마다 호출되어 페이로드를 공유 버퍼로 옮기는 등의 처리를 한다.
/// 입력 채널이 닫히거나 출력 쪽이 사라지면 태스크가 종료된다.
pub fn debounce<T, F>(
    windows: DebounceWindows,
    mut input: mpsc::Receiver<T>,
    mut on_item: F,
) -> (mpsc::Receiver<T>, JoinHandle<()>)
where
    T: Send + 'static,
    F: FnMut(&mut T) + Send + 'static,
{
    let (output, flushed) = mpsc::channel(1);

    let task = tokio::spawn(async move {
        let mut debouncer = Debouncer::new(windows);
        let mut last: Option<T> = None;

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                received = input.recv() => match received {
                    Some(mut item) => {
                        on_item(&mut item);
                        last = Some(item);
                        debouncer.on_event(Instant::now());
                    }
                    None => {
                        trace!("debounce input closed");
                        return;
                    }
                },
                reason = wait_for(deadline) => {
                    debouncer.on_timer();
                    if let Some(item) = last.take() {
                        trace!(?reason, "debounce flush");
                        if output.send(item).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    (flushed, task)
}
