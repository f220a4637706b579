//! # 拦截器链
//!
//! ## 设计思路
//!
//! 经典责任链：每个拦截器拿到 `Chain`，可以
//! - 直接返回结果（短路，不调用 `proceed`）
//! - 改写请求后 `proceed_with`
//! - 调用 `proceed` 后再加工结果
//!
//! 两条独立的链：
//! - 请求级（输出 `ImageData`）：包住整个获取 + 解码 + 写内存缓存
//! - 解码级（输出 `DecodeResult`）：只包住获取 + 解码，用于结果缓存与变换
//!
//! ## 实现思路
//!
//! - 顺序是数据：按 `sort_weight` 升序，权重相同保持注册顺序。
//! - 引擎拦截器（`EngineRequestInterceptor` / `EngineDecodeInterceptor`）不进注册表，
//!   构建链时固定追加在末尾，作为终止节点。

use std::sync::Arc;

use async_trait::async_trait;

use crate::ImageError;
use crate::context::RequestContext;
use crate::executor::ImageData;
use crate::request::ImageRequest;
use crate::source::DecodeResult;

mod engine;
mod pause;
mod result_cache;
mod transformation;

pub use engine::{EngineDecodeInterceptor, EngineRequestInterceptor};
pub use pause::{PauseLoadWhenScrollingInterceptor, ScrollState};
pub use result_cache::ResultCacheDecodeInterceptor;
pub use transformation::TransformationDecodeInterceptor;

/// 请求参数：为 `true` 时不受滑动暂停影响。
pub const IGNORE_PAUSE_LOAD_PARAM: &str = "ignore_pause_load";

#[async_trait]
pub trait Interceptor<O: Send + 'static>: Send + Sync {
    /// 注册表去重用的标识。
    fn key(&self) -> &str;

    /// 升序执行，越小越靠外层。
    fn sort_weight(&self) -> i32 {
        0
    }

    async fn intercept(&self, chain: Chain<'_, O>) -> Result<O, ImageError>;
}

pub type RequestInterceptor = dyn Interceptor<ImageData>;
pub type DecodeInterceptor = dyn Interceptor<DecodeResult>;

pub struct Chain<'a, O: Send + 'static> {
    ctx: &'a RequestContext,
    interceptors: &'a [Arc<dyn Interceptor<O>>],
    index: usize,
}

impl<'a, O: Send + 'static> Chain<'a, O> {
    pub fn new(ctx: &'a RequestContext, interceptors: &'a [Arc<dyn Interceptor<O>>]) -> Self {
        Self {
            ctx,
            interceptors,
            index: 0,
        }
    }

    pub fn context(&self) -> &'a RequestContext {
        self.ctx
    }

    pub fn request(&self) -> &'a ImageRequest {
        self.ctx.request()
    }

    /// 交给下一个拦截器。
    pub async fn proceed(self) -> Result<O, ImageError> {
        let next = self.next()?;
        next.intercept(Chain {
            ctx: self.ctx,
            interceptors: self.interceptors,
            index: self.index + 1,
        })
        .await
    }

    /// 用改写后的请求继续；下游看到的是基于新请求重新计算 key 的上下文。
    pub async fn proceed_with(self, request: ImageRequest) -> Result<O, ImageError> {
        let next = self.next()?;
        let ctx = self.ctx.with_request(request);
        next.intercept(Chain {
            ctx: &ctx,
            interceptors: self.interceptors,
            index: self.index + 1,
        })
        .await
    }

    fn next(&self) -> Result<&'a Arc<dyn Interceptor<O>>, ImageError> {
        self.interceptors
            .get(self.index)
            .ok_or_else(|| ImageError::Config("拦截器链缺少终止节点".to_string()))
    }
}

/// 稳定排序：权重升序，同权重保持注册顺序。
pub(crate) fn sorted<O: Send + 'static>(interceptors: &[Arc<dyn Interceptor<O>>]) -> Vec<Arc<dyn Interceptor<O>>> {
    let mut sorted = interceptors.to_vec();
    sorted.sort_by_key(|interceptor| interceptor.sort_weight());
    sorted
}
