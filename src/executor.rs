//! # 请求执行器
//!
//! ## 设计思路
//!
//! 每个请求是一个独立的状态机：
//!
//! ```text
//! Pending → CheckingMemoryCache ─命中→ Completed
//!                 │
//!                 └→ RunningChain → [CheckingResultCache] → Fetching → [Downloading]
//!                        → Decoding → StoringToMemoryCache → Completed
//! 任意非终态 ─取消→ Cancelled
//! 任意非终态 ─错误→ Failed
//! ```
//!
//! - 内存缓存检查发生在请求拦截器链之前，命中直接完成，不构建拦截器链。
//! - 监听回调顺序固定：`on_start` → 零或多次 `on_progress` → 恰好一个终态回调。
//! - 取消不是错误：取消后只触发 `on_cancel`，不产生 `Failed`。
//!
//! ## 实现思路
//!
//! - `ImagePipeline` 持有 `Arc<PipelineShared>`，克隆廉价，可在任意任务中提交请求。
//! - 请求主体与取消令牌在 `tokio::select!` 中竞争，取消时整个请求 future 被丢弃，
//!   持有的磁盘编辑器、进行中下载登记都随之释放。
//! - `enqueue` 在后台任务中执行并返回 `RequestHandle`，支持取消与等待结束。

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ImageError;
use crate::cache::{BitmapPool, DiskCache, DownloadCache, ImageRef, MemoryCache, RefKind};
use crate::config::PipelineConfig;
use crate::context::{RequestContext, StageTimings};
use crate::decode::{DecoderFactory, default_decoders};
use crate::error::{RequestFailure, Stage};
use crate::fetch::{ContentResolver, FetcherFactory, default_fetchers, redact_uri_for_log};
use crate::interceptor::{
    Chain, DecodeInterceptor, EngineRequestInterceptor, PauseLoadWhenScrollingInterceptor, RequestInterceptor,
    ResultCacheDecodeInterceptor, ScrollState, TransformationDecodeInterceptor, sorted,
};
use crate::listener::{CallbackDispatcher, RequestEvents};
use crate::registry::ComponentRegistry;
use crate::request::ImageRequest;
use crate::resize::ResizeMapping;
use crate::source::{DataFrom, ImageInfo};

/// 请求生命周期状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Pending,
    CheckingMemoryCache,
    RunningChain,
    CheckingResultCache,
    Fetching,
    Downloading,
    Decoding,
    StoringToMemoryCache,
    Completed,
    Cancelled,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// 该状态下出错时归属的阶段；其余状态按错误类型归属。
    fn failing_stage(self) -> Option<Stage> {
        match self {
            Self::Fetching | Self::Downloading => Some(Stage::Fetch),
            Self::Decoding => Some(Stage::Decode),
            Self::StoringToMemoryCache => Some(Stage::Cache),
            _ => None,
        }
    }
}

/// 请求成功的产物。
///
/// `image` 持有一个“等待使用”引用，在交给显示层（`into_display`）或被丢弃之前，
/// 即使内存缓存淘汰了该条目，像素也不会被回收。
#[derive(Debug, Clone)]
pub struct ImageData {
    pub cache_key: String,
    pub image: ImageRef,
    pub info: ImageInfo,
    pub data_from: DataFrom,
    pub resize: Option<ResizeMapping>,
    pub transformations: Vec<String>,
}

impl ImageData {
    pub(crate) fn new(cache_key: impl Into<String>, image: ImageRef, data_from: DataFrom) -> Self {
        Self {
            cache_key: cache_key.into(),
            info: image.info().clone(),
            resize: image.resize(),
            transformations: image.transformations().to_vec(),
            data_from,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// 交给显示层：等待使用引用转换为显示引用。
    pub fn into_display(self) -> ImageRef {
        self.image.into_display()
    }
}

/// 请求终态。
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(ImageData),
    Failed(RequestFailure),
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn data(&self) -> Option<&ImageData> {
        match self {
            Self::Success(data) => Some(data),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&RequestFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<ImageData, ImageError> {
        match self {
            Self::Success(data) => Ok(data),
            Self::Failed(failure) => Err(failure.error),
            Self::Cancelled => Err(ImageError::Cancelled("请求已取消".to_string())),
        }
    }
}

/// 所有请求共享的组件与缓存。
pub(crate) struct PipelineShared {
    pub(crate) config: PipelineConfig,
    pub(crate) registry: ComponentRegistry,
    pub(crate) memory_cache: MemoryCache,
    pub(crate) bitmap_pool: Arc<BitmapPool>,
    pub(crate) download_cache: DownloadCache,
    pub(crate) result_cache: Option<DiskCache>,
    pub(crate) http_client: reqwest::Client,
    pub(crate) content_resolver: Option<Arc<dyn ContentResolver>>,
    pub(crate) callbacks: CallbackDispatcher,
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    registry: ComponentRegistry,
    content_resolver: Option<Arc<dyn ContentResolver>>,
}

impl PipelineBuilder {
    fn new(config: PipelineConfig) -> Self {
        let mut registry = ComponentRegistry::new();
        for fetcher in default_fetchers() {
            registry = registry.add_fetcher(fetcher);
        }
        for decoder in default_decoders() {
            registry = registry.add_decoder(decoder);
        }
        let registry = registry
            .add_decode_interceptor(Arc::new(ResultCacheDecodeInterceptor))
            .add_decode_interceptor(Arc::new(TransformationDecodeInterceptor));

        Self {
            config,
            registry,
            content_resolver: None,
        }
    }

    /// 注册获取器；与内置获取器同 key 时原位替换。
    pub fn fetcher(mut self, factory: Arc<dyn FetcherFactory>) -> Self {
        self.registry = self.registry.add_fetcher(factory);
        self
    }

    pub fn decoder(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
        self.registry = self.registry.add_decoder(factory);
        self
    }

    pub fn request_interceptor(mut self, interceptor: Arc<RequestInterceptor>) -> Self {
        self.registry = self.registry.add_request_interceptor(interceptor);
        self
    }

    pub fn decode_interceptor(mut self, interceptor: Arc<DecodeInterceptor>) -> Self {
        self.registry = self.registry.add_decode_interceptor(interceptor);
        self
    }

    /// 启用 `content://` 获取器。
    pub fn content_resolver(mut self, resolver: Arc<dyn ContentResolver>) -> Self {
        self.content_resolver = Some(resolver);
        self
    }

    /// 滑动期间暂停网络请求。
    pub fn pause_load_when_scrolling(self, scroll_state: ScrollState) -> Self {
        self.request_interceptor(Arc::new(PauseLoadWhenScrollingInterceptor::new(scroll_state)))
    }

    pub fn build(self) -> Result<ImagePipeline, ImageError> {
        self.config.validate()?;
        let config = self.config;

        let (download_disk, result_cache) = match &config.disk_cache_dir {
            Some(dir) => (
                Some(DiskCache::open(dir.join("download"), config.download_cache_max_bytes)?),
                Some(DiskCache::open(dir.join("result"), config.result_cache_max_bytes)?),
            ),
            None => {
                log::info!("ℹ️ 未配置磁盘缓存目录，下载缓存与结果缓存已禁用");
                (None, None)
            }
        };

        let http_client = crate::fetch::build_base_http_client(&config)?;
        let callbacks = CallbackDispatcher::spawn()?;

        log::info!(
            "🚀 图片流水线已启动 - 内存缓存 {:.1} MB，获取器 {} 个，解码器 {} 个",
            crate::fetch::as_mb(config.memory_cache_max_bytes),
            self.registry.fetchers().len(),
            self.registry.decoders().len()
        );

        Ok(ImagePipeline {
            shared: Arc::new(PipelineShared {
                memory_cache: MemoryCache::new(config.memory_cache_max_bytes),
                bitmap_pool: Arc::new(BitmapPool::new(config.bitmap_pool_max_bytes)),
                download_cache: DownloadCache::new(download_disk),
                result_cache,
                http_client,
                content_resolver: self.content_resolver,
                registry: self.registry,
                callbacks,
                config,
            }),
        })
    }
}

/// 图片加载流水线入口。
#[derive(Clone)]
pub struct ImagePipeline {
    shared: Arc<PipelineShared>,
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("registry", &self.shared.registry)
            .field("memory_cache_bytes", &self.shared.memory_cache.size())
            .finish_non_exhaustive()
    }
}

impl ImagePipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub(crate) fn shared(&self) -> Arc<PipelineShared> {
        Arc::clone(&self.shared)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.shared.registry
    }

    pub fn memory_cache(&self) -> &MemoryCache {
        &self.shared.memory_cache
    }

    pub fn bitmap_pool(&self) -> &Arc<BitmapPool> {
        &self.shared.bitmap_pool
    }

    pub fn download_cache(&self) -> &DownloadCache {
        &self.shared.download_cache
    }

    pub fn result_cache(&self) -> Option<&DiskCache> {
        self.shared.result_cache.as_ref()
    }

    /// 等待此前所有请求的监听回调执行完毕。
    pub async fn flush_callbacks(&self) {
        self.shared.callbacks.flush().await;
    }

    /// 在当前任务中执行请求直到终态。
    pub async fn execute(&self, request: ImageRequest) -> Outcome {
        let (state, _) = watch::channel(RequestState::Pending);
        self.run(request, CancellationToken::new(), Arc::new(state)).await
    }

    /// 在后台任务中执行请求，立即返回句柄。
    pub fn enqueue(&self, request: ImageRequest) -> RequestHandle {
        let cancel = CancellationToken::new();
        let (state, state_rx) = watch::channel(RequestState::Pending);

        let pipeline = self.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { pipeline.run(request, task_cancel, Arc::new(state)).await });

        RequestHandle {
            cancel,
            state: state_rx,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(
        &self,
        request: ImageRequest,
        cancel: CancellationToken,
        state: Arc<watch::Sender<RequestState>>,
    ) -> Outcome {
        let started = Instant::now();
        let uri = redact_uri_for_log(request.uri());
        let events = RequestEvents::new(self.shared.callbacks.clone(), &request);
        let timings = StageTimings::default();
        events.start();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RequestFailure::new(
                request.uri(),
                ImageError::Cancelled("请求已取消".to_string()),
            )),
            result = self.run_request(request.clone(), &cancel, &state, &events, &timings) => result,
        };

        match result {
            Ok(data) => {
                state.send_replace(RequestState::Completed);
                log::info!(
                    "✅ 图片请求完成 - key={} {}x{} 来源={} {} total={}ms",
                    data.cache_key,
                    data.width(),
                    data.height(),
                    data.data_from.as_str(),
                    timings.summary(),
                    started.elapsed().as_millis()
                );
                events.success(&data);
                Outcome::Success(data)
            }
            Err(failure) if failure.error.is_cancelled() => {
                state.send_replace(RequestState::Cancelled);
                log::info!("🛑 图片请求已取消 - {} 耗时={}ms", uri, started.elapsed().as_millis());
                events.cancel();
                Outcome::Cancelled
            }
            Err(failure) => {
                state.send_replace(RequestState::Failed);
                log::warn!(
                    "❌ 图片请求失败 - {} 阶段={} 错误={} 耗时={}ms",
                    uri,
                    failure.stage.as_str(),
                    failure.error,
                    started.elapsed().as_millis()
                );
                events.error(&failure);
                Outcome::Failed(failure)
            }
        }
    }

    async fn run_request(
        &self,
        request: ImageRequest,
        cancel: &CancellationToken,
        state: &Arc<watch::Sender<RequestState>>,
        events: &RequestEvents,
        timings: &StageTimings,
    ) -> Result<ImageData, RequestFailure> {
        let fallback_key = request.uri().to_string();
        let ctx = RequestContext::build(
            request,
            Arc::clone(&self.shared),
            cancel.clone(),
            Arc::clone(state),
            events.clone(),
            timings.clone(),
        )
        .await
        .map_err(|error| RequestFailure::new(fallback_key, error))?;

        ctx.set_state(RequestState::CheckingMemoryCache);
        if ctx.request().memory_cache_policy().read {
            if let Some(hit) = self.shared.memory_cache.get(ctx.cache_key()) {
                log::debug!("♻️ 命中内存缓存 - key={}", ctx.cache_key());
                let waiting = hit.acquire(RefKind::WaitingUse);
                return Ok(ImageData::new(ctx.cache_key(), waiting, DataFrom::MemoryCache));
            }
        }

        ctx.set_state(RequestState::RunningChain);
        let mut interceptors = sorted(ctx.registry().request_interceptors());
        interceptors.push(Arc::new(EngineRequestInterceptor));

        Chain::new(&ctx, &interceptors).proceed().await.map_err(|error| {
            let stage = ctx.state().failing_stage().unwrap_or_else(|| error.stage());
            RequestFailure::with_stage(stage, ctx.cache_key(), error)
        })
    }
}

/// 后台请求句柄。丢弃句柄不会取消请求。
pub struct RequestHandle {
    cancel: CancellationToken,
    state: watch::Receiver<RequestState>,
    task: Mutex<Option<JoinHandle<Outcome>>>,
}

impl RequestHandle {
    /// 发出取消信号，不等待。
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    /// 等待请求进入终态。
    pub async fn outcome(self) -> Outcome {
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(task) = task else {
            return Outcome::Cancelled;
        };

        match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Outcome::Cancelled,
            Err(e) => Outcome::Failed(RequestFailure::new(
                String::new(),
                ImageError::Config(format!("请求任务异常退出：{}", e)),
            )),
        }
    }

    /// 取消并等待清理完成（编辑器已中止、进行中登记已移除）。
    pub async fn cancel_and_wait(self) -> Outcome {
        self.cancel.cancel();
        self.outcome().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::CachePolicy;
    use base64::Engine;

    fn png_data_uri(width: u32, height: u32) -> String {
        let image = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode png failed");
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )
    }

    fn pipeline() -> ImagePipeline {
        ImagePipeline::builder(PipelineConfig::default())
            .build()
            .expect("pipeline build failed")
    }

    #[tokio::test]
    async fn second_request_hits_memory_cache() {
        let pipeline = pipeline();
        let uri = png_data_uri(8, 6);

        let first = pipeline.execute(ImageRequest::new(uri.clone())).await;
        let first = first.data().cloned().expect("first request failed");
        assert_eq!(first.data_from, DataFrom::Memory);
        assert_eq!((first.width(), first.height()), (8, 6));

        let second = pipeline.execute(ImageRequest::new(uri)).await;
        let second = second.data().cloned().expect("second request failed");
        assert_eq!(second.data_from, DataFrom::MemoryCache);
        assert_eq!(second.cache_key, first.cache_key);
        assert_eq!(pipeline.memory_cache().len(), 1);
    }

    #[tokio::test]
    async fn memory_write_disabled_keeps_cache_empty() {
        let pipeline = pipeline();
        let request = ImageRequest::builder(png_data_uri(4, 4))
            .memory_cache_policy(CachePolicy::READ_ONLY)
            .build();

        let outcome = pipeline.execute(request).await;
        assert!(outcome.is_success());
        assert!(pipeline.memory_cache().is_empty());
    }

    #[tokio::test]
    async fn waiting_reference_survives_memory_clear() {
        let pipeline = pipeline();
        let data = pipeline
            .execute(ImageRequest::new(png_data_uri(4, 4)))
            .await
            .into_result()
            .expect("request failed");

        pipeline.memory_cache().clear();
        assert!(!data.image.is_freed());
        assert_eq!(data.image.ref_counts().waiting_use, 1);

        let display = data.into_display();
        assert_eq!(display.ref_counts().display, 1);
        assert_eq!(display.ref_counts().waiting_use, 0);
    }

    #[tokio::test]
    async fn unknown_scheme_fails_at_fetch_stage() {
        let pipeline = pipeline();
        let outcome = pipeline.execute(ImageRequest::new("ftp://host/a.png")).await;

        let failure = outcome.failure().cloned().expect("expected failure");
        assert!(matches!(failure.error, ImageError::NoFetcherMatched(_)));
        assert_eq!(failure.stage, Stage::Fetch);
    }

    #[tokio::test]
    async fn invalid_uri_fails_before_chain() {
        let pipeline = pipeline();
        let outcome = pipeline.execute(ImageRequest::new("")).await;
        assert!(matches!(
            outcome.failure().map(|f| &f.error),
            Some(ImageError::UriInvalid(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_handle_reports_cancelled_state() {
        struct Never;

        #[async_trait::async_trait]
        impl crate::request::SizeResolver for Never {
            async fn resolve(&self) -> Option<crate::resize::Size> {
                std::future::pending().await
            }
        }

        let pipeline = pipeline();
        let handle = pipeline.enqueue(
            ImageRequest::builder(png_data_uri(2, 2))
                .size_resolver(Arc::new(Never))
                .build(),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let state_rx = handle.state.clone();
        let outcome = handle.cancel_and_wait().await;
        assert!(outcome.is_cancelled());
        assert_eq!(*state_rx.borrow(), RequestState::Cancelled);
    }
}
