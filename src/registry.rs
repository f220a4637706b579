//! # 组件注册表
//!
//! ## 设计思路
//!
//! 三组有序列表：获取器工厂、解码器工厂、拦截器（请求级 / 解码级）。
//! 注册表是显式实例，由 `ImagePipeline` 持有并按引用传给每个请求，没有全局单例。
//!
//! ## 实现思路
//!
//! - `new_fetcher` / `new_decoder`：按注册顺序询问，第一个匹配的工厂胜出。
//! - 每个组件都有 `key`，同一注册表内重复注册同一 key 时原位替换并记录日志。
//! - `merged`：请求级注册表叠加在全局注册表之上，请求级组件排在前面，
//!   同 key 的全局组件被移除，不会出现两个同名组件同时生效。

use std::collections::HashSet;
use std::sync::Arc;

use crate::ImageError;
use crate::context::RequestContext;
use crate::decode::{Decoder, DecoderFactory};
use crate::fetch::{Fetcher, FetcherFactory, redact_uri_for_log};
use crate::interceptor::{DecodeInterceptor, RequestInterceptor};
use crate::source::FetchResult;

#[derive(Clone, Default)]
pub struct ComponentRegistry {
    fetchers: Vec<Arc<dyn FetcherFactory>>,
    decoders: Vec<Arc<dyn DecoderFactory>>,
    request_interceptors: Vec<Arc<RequestInterceptor>>,
    decode_interceptors: Vec<Arc<DecodeInterceptor>>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("fetchers", &self.fetchers.iter().map(|c| c.key()).collect::<Vec<_>>())
            .field("decoders", &self.decoders.iter().map(|c| c.key()).collect::<Vec<_>>())
            .field(
                "request_interceptors",
                &self.request_interceptors.iter().map(|c| c.key()).collect::<Vec<_>>(),
            )
            .field(
                "decode_interceptors",
                &self.decode_interceptors.iter().map(|c| c.key()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// 按 key 原位替换或追加。
fn upsert<T: ?Sized>(list: &mut Vec<Arc<T>>, item: Arc<T>, key_of: impl Fn(&T) -> &str) {
    let key = key_of(&*item).to_string();
    match list.iter().position(|existing| key_of(&**existing) == key) {
        Some(idx) => {
            log::debug!("🔁 组件重复注册，替换原有实现 - key={}", key);
            list[idx] = item;
        }
        None => list.push(item),
    }
}

/// overlay 在前，base 中与 overlay 同 key 的组件被移除。
fn overlay<T: ?Sized>(top: &[Arc<T>], base: &[Arc<T>], key_of: impl Fn(&T) -> &str) -> Vec<Arc<T>> {
    let keys: HashSet<&str> = top.iter().map(|item| key_of(&**item)).collect();
    top.iter()
        .cloned()
        .chain(
            base.iter()
                .filter(|item| !keys.contains(key_of(&***item)))
                .cloned(),
        )
        .collect()
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fetcher(mut self, factory: Arc<dyn FetcherFactory>) -> Self {
        upsert(&mut self.fetchers, factory, |f| f.key());
        self
    }

    pub fn add_decoder(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
        upsert(&mut self.decoders, factory, |f| f.key());
        self
    }

    pub fn add_request_interceptor(mut self, interceptor: Arc<RequestInterceptor>) -> Self {
        upsert(&mut self.request_interceptors, interceptor, |i| i.key());
        self
    }

    pub fn add_decode_interceptor(mut self, interceptor: Arc<DecodeInterceptor>) -> Self {
        upsert(&mut self.decode_interceptors, interceptor, |i| i.key());
        self
    }

    pub fn fetchers(&self) -> &[Arc<dyn FetcherFactory>] {
        &self.fetchers
    }

    pub fn decoders(&self) -> &[Arc<dyn DecoderFactory>] {
        &self.decoders
    }

    pub fn request_interceptors(&self) -> &[Arc<RequestInterceptor>] {
        &self.request_interceptors
    }

    pub fn decode_interceptors(&self) -> &[Arc<DecodeInterceptor>] {
        &self.decode_interceptors
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
            && self.decoders.is_empty()
            && self.request_interceptors.is_empty()
            && self.decode_interceptors.is_empty()
    }

    /// 以 `self` 为请求级注册表叠加到 `base` 之上。
    pub fn merged(&self, base: &ComponentRegistry) -> ComponentRegistry {
        if self.is_empty() {
            return base.clone();
        }

        ComponentRegistry {
            fetchers: overlay(&self.fetchers, &base.fetchers, |f| f.key()),
            decoders: overlay(&self.decoders, &base.decoders, |f| f.key()),
            request_interceptors: overlay(&self.request_interceptors, &base.request_interceptors, |i| i.key()),
            decode_interceptors: overlay(&self.decode_interceptors, &base.decode_interceptors, |i| i.key()),
        }
    }

    /// 第一个匹配的获取器。
    pub fn new_fetcher(&self, ctx: &RequestContext) -> Result<Box<dyn Fetcher>, ImageError> {
        for factory in &self.fetchers {
            if let Some(fetcher) = factory.create(ctx) {
                log::debug!("🔎 匹配获取器 - {}", factory.key());
                return Ok(fetcher);
            }
        }

        Err(ImageError::NoFetcherMatched(redact_uri_for_log(ctx.request().uri())))
    }

    /// 第一个匹配的解码器。
    pub fn new_decoder(&self, ctx: &RequestContext, fetched: &FetchResult) -> Result<Box<dyn Decoder>, ImageError> {
        for factory in &self.decoders {
            if let Some(decoder) = factory.create(ctx, fetched) {
                log::debug!("🔎 匹配解码器 - {}", factory.key());
                return Ok(decoder);
            }
        }

        Err(ImageError::NoDecoderMatched(format!(
            "{}（{}）",
            redact_uri_for_log(ctx.request().uri()),
            fetched.mime_type
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Named(&'static str);

    impl FetcherFactory for Named {
        fn key(&self) -> &str {
            self.0
        }

        fn create(&self, _ctx: &RequestContext) -> Option<Box<dyn Fetcher>> {
            None
        }
    }

    struct Tagged(&'static str);

    #[async_trait]
    impl crate::interceptor::Interceptor<crate::source::DecodeResult> for Tagged {
        fn key(&self) -> &str {
            self.0
        }

        async fn intercept(
            &self,
            chain: crate::interceptor::Chain<'_, crate::source::DecodeResult>,
        ) -> Result<crate::source::DecodeResult, ImageError> {
            chain.proceed().await
        }
    }

    fn fetcher_keys(registry: &ComponentRegistry) -> Vec<&str> {
        registry.fetchers().iter().map(|f| f.key()).collect()
    }

    #[test]
    fn duplicate_key_replaces_in_place() {
        let registry = ComponentRegistry::new()
            .add_fetcher(Arc::new(Named("http")))
            .add_fetcher(Arc::new(Named("file")))
            .add_fetcher(Arc::new(Named("http")));

        assert_eq!(fetcher_keys(&registry), vec!["http", "file"]);
    }

    #[test]
    fn overlay_takes_precedence_and_removes_shadowed_entries() {
        let base = ComponentRegistry::new()
            .add_fetcher(Arc::new(Named("http")))
            .add_fetcher(Arc::new(Named("file")))
            .add_decode_interceptor(Arc::new(Tagged("result-cache")));
        let overlay = ComponentRegistry::new()
            .add_fetcher(Arc::new(Named("file")))
            .add_fetcher(Arc::new(Named("custom")))
            .add_decode_interceptor(Arc::new(Tagged("result-cache")));

        let merged = overlay.merged(&base);

        assert_eq!(fetcher_keys(&merged), vec!["file", "custom", "http"]);
        assert_eq!(merged.decode_interceptors().len(), 1);
    }

    #[test]
    fn empty_overlay_returns_base() {
        let base = ComponentRegistry::new().add_fetcher(Arc::new(Named("http")));
        let merged = ComponentRegistry::new().merged(&base);
        assert_eq!(fetcher_keys(&merged), vec!["http"]);
    }
}
