//! 列表快速滑动时暂停网络加载，停止滑动后自动继续。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{Chain, IGNORE_PAUSE_LOAD_PARAM, Interceptor};
use crate::ImageError;
use crate::executor::ImageData;
use crate::fetch::{redact_uri_for_log, strip_scheme};

/// 滑动状态开关，由 UI 层在滑动开始与结束时更新。
#[derive(Debug, Clone)]
pub struct ScrollState {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ScrollState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrollState {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn set_scrolling(&self, scrolling: bool) {
        self.sender.send_replace(scrolling);
    }

    pub fn is_scrolling(&self) -> bool {
        *self.sender.borrow()
    }

    /// 等到不再滑动。
    pub async fn wait_idle(&self) {
        let mut receiver = self.sender.subscribe();
        // 发送端由 self 持有，wait_for 不会因通道关闭而失败
        let _ = receiver.wait_for(|scrolling| !*scrolling).await;
    }
}

/// 滑动期间挂起尚未命中下载缓存的网络请求。
pub struct PauseLoadWhenScrollingInterceptor {
    state: ScrollState,
}

impl PauseLoadWhenScrollingInterceptor {
    pub fn new(state: ScrollState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Interceptor<ImageData> for PauseLoadWhenScrollingInterceptor {
    fn key(&self) -> &str {
        "PauseLoadWhenScrollingInterceptor"
    }

    fn sort_weight(&self) -> i32 {
        10
    }

    async fn intercept(&self, chain: Chain<'_, ImageData>) -> Result<ImageData, ImageError> {
        let ctx = chain.context();
        let request = ctx.request();

        let is_network =
            strip_scheme(request.uri(), "http://").is_some() || strip_scheme(request.uri(), "https://").is_some();
        let ignored = request.parameter(IGNORE_PAUSE_LOAD_PARAM) == Some("true");

        if is_network
            && !ignored
            && self.state.is_scrolling()
            && !(request.download_cache_policy().read && ctx.download_cache().contains(ctx.download_cache_key()))
        {
            log::debug!("⏸️ 滑动中，暂停加载 - {}", redact_uri_for_log(request.uri()));
            tokio::select! {
                biased;
                _ = ctx.cancel_token().cancelled() => {
                    return Err(ImageError::Cancelled("滑动暂停期间被取消".to_string()));
                }
                _ = self.state.wait_idle() => {}
            }
            log::debug!("▶️ 滑动结束，继续加载 - {}", redact_uri_for_log(request.uri()));
        }

        chain.proceed().await
    }
}
