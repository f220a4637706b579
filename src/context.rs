//! # 请求上下文
//!
//! ## 设计思路
//!
//! 每个提交的请求构建一次上下文，构建完成后不可变：
//! - 确定目标尺寸（可能需要等待异步 `SizeResolver`，这是一个可取消的挂起点）
//! - 计算 CacheKey 与 DownloadCacheKey
//! - 固定本次请求生效的组件注册表（请求级组件叠加在全局组件之上）
//!
//! 下游阶段只读上下文。拦截器改写请求时通过 `with_request` 得到一个新上下文，
//! key 基于新请求重新计算，不会沿用旧值。
//!
//! ## 实现思路
//!
//! 上下文持有流水线共享状态的 `Arc`，缓存、配置、HTTP 客户端都从这里取；
//! 取消令牌、状态通道、回调出口在同一请求派生出的所有上下文之间共享。

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::ImageError;
use crate::cache::{BitmapPool, DiskCache, DownloadCache, MemoryCache};
use crate::config::PipelineConfig;
use crate::executor::{PipelineShared, RequestState};
use crate::fetch::ContentResolver;
use crate::listener::RequestEvents;
use crate::registry::ComponentRegistry;
use crate::request::{ImageRequest, SizeSpec};
use crate::resize::Size;

/// 各阶段耗时，请求完成时汇总进日志。
#[derive(Debug, Clone, Default)]
pub(crate) struct StageTimings(Arc<Mutex<Vec<(&'static str, u128)>>>);

impl StageTimings {
    pub(crate) fn record(&self, stage: &'static str, started: Instant) {
        let elapsed = started.elapsed().as_millis();
        match self.0.lock() {
            Ok(mut timings) => timings.push((stage, elapsed)),
            Err(poisoned) => poisoned.into_inner().push((stage, elapsed)),
        }
    }

    /// 形如 `fetch=12ms decode=30ms`。
    pub(crate) fn summary(&self) -> String {
        let timings = match self.0.lock() {
            Ok(timings) => timings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        timings
            .iter()
            .map(|(stage, ms)| format!("{}={}ms", stage, ms))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub struct RequestContext {
    request: ImageRequest,
    resolved_size: Option<Size>,
    cache_key: String,
    download_cache_key: String,
    registry: ComponentRegistry,
    shared: Arc<PipelineShared>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<RequestState>>,
    events: RequestEvents,
    timings: StageTimings,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request", &self.request)
            .field("resolved_size", &self.resolved_size)
            .field("cache_key", &self.cache_key)
            .field("download_cache_key", &self.download_cache_key)
            .finish_non_exhaustive()
    }
}

/// URI 基本校验：非空、不含空白与控制字符、带 scheme 或为绝对路径。
pub(crate) fn validate_uri(uri: &str) -> Result<(), ImageError> {
    if uri.trim().is_empty() {
        return Err(ImageError::UriInvalid("URI 为空".to_string()));
    }

    if uri.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ImageError::UriInvalid("URI 含有空白或控制字符".to_string()));
    }

    if std::path::Path::new(uri).is_absolute() {
        return Ok(());
    }

    let scheme = uri.split_once(':').map(|(scheme, _)| scheme).unwrap_or("");
    let valid_scheme = scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid_scheme {
        return Err(ImageError::UriInvalid(format!(
            "URI 缺少 scheme：{}",
            crate::fetch::redact_uri_for_log(uri)
        )));
    }

    Ok(())
}

impl RequestContext {
    pub(crate) async fn build(
        request: ImageRequest,
        shared: Arc<PipelineShared>,
        cancel: CancellationToken,
        state: Arc<watch::Sender<RequestState>>,
        events: RequestEvents,
        timings: StageTimings,
    ) -> Result<Self, ImageError> {
        validate_uri(request.uri())?;

        let resolved_size = match request.size() {
            SizeSpec::Original => None,
            SizeSpec::Fixed(size) => Some(*size),
            SizeSpec::Resolver(resolver) => {
                let started = Instant::now();
                let size = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(ImageError::Cancelled("等待目标尺寸时被取消".to_string()));
                    }
                    size = resolver.resolve() => size,
                };
                timings.record("size", started);
                size
            }
        };
        let resolved_size = resolved_size.filter(|size| {
            if size.is_empty() {
                log::debug!("📐 目标尺寸为 0，按原图尺寸解码");
            }
            !size.is_empty()
        });

        let registry = Self::registry_for(&request, &shared);
        Ok(Self {
            cache_key: request.cache_key(resolved_size),
            download_cache_key: request.download_cache_key(),
            request,
            resolved_size,
            registry,
            shared,
            cancel,
            state,
            events,
            timings,
        })
    }

    fn registry_for(request: &ImageRequest, shared: &PipelineShared) -> ComponentRegistry {
        match request.components() {
            Some(components) => components.merged(&shared.registry),
            None => shared.registry.clone(),
        }
    }

    /// 基于改写后的请求派生新上下文；取消令牌、状态与回调出口保持共享。
    pub fn with_request(&self, request: ImageRequest) -> RequestContext {
        let resolved_size = match request.size() {
            SizeSpec::Original => None,
            SizeSpec::Fixed(size) => Some(*size).filter(|size| !size.is_empty()),
            SizeSpec::Resolver(_) => self.resolved_size,
        };

        RequestContext {
            cache_key: request.cache_key(resolved_size),
            download_cache_key: request.download_cache_key(),
            registry: Self::registry_for(&request, &self.shared),
            request,
            resolved_size,
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.clone(),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            timings: self.timings.clone(),
        }
    }

    pub fn request(&self) -> &ImageRequest {
        &self.request
    }

    /// 解析后的目标尺寸；`None` 表示按原图尺寸解码。
    pub fn resolved_size(&self) -> Option<Size> {
        self.resolved_size
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn download_cache_key(&self) -> &str {
        &self.download_cache_key
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn memory_cache(&self) -> &MemoryCache {
        &self.shared.memory_cache
    }

    pub fn download_cache(&self) -> &DownloadCache {
        &self.shared.download_cache
    }

    pub fn result_cache(&self) -> Option<&DiskCache> {
        self.shared.result_cache.as_ref()
    }

    pub fn bitmap_pool(&self) -> &Arc<BitmapPool> {
        &self.shared.bitmap_pool
    }

    pub fn content_resolver(&self) -> Option<&Arc<dyn ContentResolver>> {
        self.shared.content_resolver.as_ref()
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.shared.http_client
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), ImageError> {
        if self.cancel.is_cancelled() {
            return Err(ImageError::Cancelled("请求已取消".to_string()));
        }
        Ok(())
    }

    /// 上报下载进度，经节流后投递给监听器。
    pub fn report_progress(&self, downloaded: u64, total: Option<u64>) {
        self.events.progress(downloaded, total);
    }

    /// 记录某阶段从 `started` 起的耗时。
    pub fn record_timing(&self, stage: &'static str, started: Instant) {
        self.timings.record(stage, started);
    }

    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        log::trace!("🔄 请求状态 -> {:?} key={}", state, self.cache_key);
        self.state.send_replace(state);
    }
}
