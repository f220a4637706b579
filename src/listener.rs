//! # 回调分发模块
//!
//! ## 设计思路
//!
//! 所有请求的监听回调都投递到同一个专用回调线程上按 FIFO 顺序执行：
//! - 同一请求的事件严格有序：start → progress → 终态（success / error / cancel）
//! - 不同请求的回调不会在同一个监听器上交错执行
//! - 回调执行不占用 tokio 工作线程
//!
//! ## 实现思路
//!
//! - 请求任务通过无界 mpsc 通道投递事件，回调线程 `blocking_recv` 逐个执行。
//! - 下载进度按时间间隔、字节增量、百分比增量与心跳做节流，避免回调风暴。
//! - `flush` 投递一个屏障事件，等待此前所有事件执行完毕。

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::error::RequestFailure;
use crate::executor::ImageData;
use crate::request::ImageRequest;
use crate::ImageError;

const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(50);
const PROGRESS_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(400);
const PROGRESS_MIN_BYTES_DELTA: u64 = 256 * 1024;
const PROGRESS_MIN_PERCENT_DELTA: u8 = 1;
const PROGRESS_FORCE_PERCENT_DELTA: u8 = 5;

/// 请求监听器。所有方法都在回调线程上调用。
pub trait ImageListener: Send + Sync {
    fn on_start(&self, _request: &ImageRequest) {}

    fn on_progress(&self, _request: &ImageRequest, _downloaded: u64, _total: Option<u64>) {}

    fn on_success(&self, _request: &ImageRequest, _data: &ImageData) {}

    fn on_error(&self, _request: &ImageRequest, _failure: &RequestFailure) {}

    /// 取消不是错误，不会触发 `on_error`。
    fn on_cancel(&self, _request: &ImageRequest) {}
}

enum ListenerEvent {
    Start,
    Progress { downloaded: u64, total: Option<u64> },
    Success(ImageData),
    Error(RequestFailure),
    Cancel,
}

enum CallbackMessage {
    Deliver {
        listener: Arc<dyn ImageListener>,
        request: Arc<ImageRequest>,
        event: ListenerEvent,
    },
    Flush(oneshot::Sender<()>),
}

/// 回调线程句柄。所有克隆都被丢弃后回调线程自然退出。
#[derive(Clone)]
pub(crate) struct CallbackDispatcher {
    sender: mpsc::UnboundedSender<CallbackMessage>,
}

impl CallbackDispatcher {
    pub(crate) fn spawn() -> Result<Self, ImageError> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<CallbackMessage>();

        std::thread::Builder::new()
            .name("image-pipeline-callbacks".to_string())
            .spawn(move || {
                while let Some(message) = receiver.blocking_recv() {
                    match message {
                        CallbackMessage::Deliver {
                            listener,
                            request,
                            event,
                        } => deliver(listener.as_ref(), &request, event),
                        CallbackMessage::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                log::debug!("🛑 回调线程退出");
            })
            .map_err(|e| ImageError::Config(format!("无法创建回调线程：{}", e)))?;

        Ok(Self { sender })
    }

    fn post(&self, message: CallbackMessage) {
        if self.sender.send(message).is_err() {
            log::warn!("⚠️ 回调线程已退出，事件被丢弃");
        }
    }

    /// 等待此前投递的全部回调执行完毕。
    pub(crate) async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.post(CallbackMessage::Flush(done));
        let _ = wait.await;
    }
}

fn deliver(listener: &dyn ImageListener, request: &ImageRequest, event: ListenerEvent) {
    let outcome = catch_unwind(AssertUnwindSafe(|| match &event {
        ListenerEvent::Start => listener.on_start(request),
        ListenerEvent::Progress { downloaded, total } => listener.on_progress(request, *downloaded, *total),
        ListenerEvent::Success(data) => listener.on_success(request, data),
        ListenerEvent::Error(failure) => listener.on_error(request, failure),
        ListenerEvent::Cancel => listener.on_cancel(request),
    }));

    if outcome.is_err() {
        log::error!("❌ 监听器回调 panic，已忽略 - uri={}", crate::fetch::redact_uri_for_log(request.uri()));
    }
}

#[derive(Debug, Default)]
struct ProgressThrottle {
    last_emit_at: Option<Instant>,
    last_percent: u8,
    last_downloaded: u64,
    last_total: Option<u64>,
}

impl ProgressThrottle {
    fn should_emit(&self, percent: u8, downloaded: u64, total: Option<u64>) -> bool {
        let Some(last_emit_at) = self.last_emit_at else {
            return true;
        };

        if total.is_some_and(|total| downloaded >= total) && downloaded != self.last_downloaded {
            return true;
        }

        let elapsed = last_emit_at.elapsed();
        let percent_delta = percent.saturating_sub(self.last_percent);
        let downloaded_delta = downloaded.saturating_sub(self.last_downloaded);

        if percent_delta >= PROGRESS_FORCE_PERCENT_DELTA {
            return true;
        }
        if percent_delta >= PROGRESS_MIN_PERCENT_DELTA && elapsed >= PROGRESS_MIN_INTERVAL {
            return true;
        }
        if downloaded_delta >= PROGRESS_MIN_BYTES_DELTA && elapsed >= PROGRESS_MIN_INTERVAL {
            return true;
        }
        if total != self.last_total {
            return true;
        }

        elapsed >= PROGRESS_HEARTBEAT_INTERVAL
    }

    fn update(&mut self, percent: u8, downloaded: u64, total: Option<u64>) {
        self.last_emit_at = Some(Instant::now());
        self.last_percent = percent;
        self.last_downloaded = downloaded;
        self.last_total = total;
    }
}

fn percent_of(downloaded: u64, total: Option<u64>) -> u8 {
    match total {
        Some(0) | None => 0,
        Some(total) => (downloaded.saturating_mul(100) / total).min(100) as u8,
    }
}

/// 单个请求的事件出口；没有监听器时所有方法都是空操作。
#[derive(Clone)]
pub(crate) struct RequestEvents {
    dispatcher: CallbackDispatcher,
    listener: Option<Arc<dyn ImageListener>>,
    request: Arc<ImageRequest>,
    throttle: Arc<Mutex<ProgressThrottle>>,
}

impl RequestEvents {
    pub(crate) fn new(dispatcher: CallbackDispatcher, request: &ImageRequest) -> Self {
        Self {
            dispatcher,
            listener: request.listener().cloned(),
            request: Arc::new(request.clone()),
            throttle: Arc::new(Mutex::new(ProgressThrottle::default())),
        }
    }

    fn emit(&self, event: ListenerEvent) {
        let Some(listener) = &self.listener else {
            return;
        };
        self.dispatcher.post(CallbackMessage::Deliver {
            listener: Arc::clone(listener),
            request: Arc::clone(&self.request),
            event,
        });
    }

    pub(crate) fn start(&self) {
        self.emit(ListenerEvent::Start);
    }

    pub(crate) fn progress(&self, downloaded: u64, total: Option<u64>) {
        if self.listener.is_none() {
            return;
        }

        let percent = percent_of(downloaded, total);
        {
            let mut throttle = match self.throttle.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if !throttle.should_emit(percent, downloaded, total) {
                return;
            }
            throttle.update(percent, downloaded, total);
        }

        self.emit(ListenerEvent::Progress { downloaded, total });
    }

    pub(crate) fn success(&self, data: &ImageData) {
        self.emit(ListenerEvent::Success(data.clone()));
    }

    pub(crate) fn error(&self, failure: &RequestFailure) {
        self.emit(ListenerEvent::Error(failure.clone()));
    }

    pub(crate) fn cancel(&self) {
        self.emit(ListenerEvent::Cancel);
    }
}
