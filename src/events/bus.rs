//! 事件总线：有界、尽力而为的扇出
//!
//! 每个订阅者一条有界通道。publish 用 try_send，从不阻塞编排逻辑；某订阅者缓冲满时该事件对它丢弃并记日志，
//! 通道关闭（订阅者断开）时顺手移除。订阅者只能收到订阅之后发布的事件，空闲超过 keepalive 间隔时收到一条 Keepalive。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::events::OrchestrationEvent;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<OrchestrationEvent>,
}

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    buffer: usize,
    keepalive: Duration,
}

/// 可克隆的总线句柄
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(buffer: usize, keepalive: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
                buffer: buffer.max(1),
                keepalive,
            }),
        }
    }

    /// 发布事件；不阻塞、不返回错误
    pub fn publish(&self, event: OrchestrationEvent) {
        let mut subs = self.inner.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if subs.is_empty() {
            tracing::debug!(kind = event.kind(), "no subscribers, event not delivered");
            return;
        }
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(subscriber = sub.id, kind = event.kind(), "subscriber buffer full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = sub.id, "subscriber gone");
                false
            }
        });
        tracing::debug!(kind = event.kind(), subscribers = subs.len(), "event published");
    }

    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { id, tx });
        tracing::info!(subscriber = id, "event stream subscribed");
        EventStream {
            id,
            rx,
            keepalive: self.inner.keepalive,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 累计因缓冲满而丢弃的事件数
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// 单个订阅者的事件流
pub struct EventStream {
    id: u64,
    rx: mpsc::Receiver<OrchestrationEvent>,
    keepalive: Duration,
}

impl EventStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 下一个事件；空闲超过 keepalive 间隔时返回 Keepalive，总线销毁后返回 None
    pub async fn recv(&mut self) -> Option<OrchestrationEvent> {
        match tokio::time::timeout(self.keepalive, self.rx.recv()).await {
            Ok(ev) => ev,
            Err(_) => Some(OrchestrationEvent::Keepalive {
                text: "keepalive".to_string(),
            }),
        }
    }

    /// 不等待，取已缓冲的下一个事件
    pub fn try_recv(&mut self) -> Option<OrchestrationEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = OrchestrationEvent> + Send {
        futures_util::stream::unfold(self, |mut s| async move {
            let ev = s.recv().await?;
            Some((ev, s))
        })
    }
}
