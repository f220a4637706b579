//! 终止节点：真正执行获取、解码与写内存缓存。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::{Chain, Interceptor, sorted};
use crate::ImageError;
use crate::cache::{CachedImage, ImageRef, RefKind};
use crate::executor::{ImageData, RequestState};
use crate::fetch::redact_uri_for_log;
use crate::source::DecodeResult;

/// 请求链终点：运行解码链，把结果登记进内存缓存并返回等待使用引用。
pub struct EngineRequestInterceptor;

#[async_trait]
impl Interceptor<ImageData> for EngineRequestInterceptor {
    fn key(&self) -> &str {
        "EngineRequestInterceptor"
    }

    async fn intercept(&self, chain: Chain<'_, ImageData>) -> Result<ImageData, ImageError> {
        let ctx = chain.context();

        let mut interceptors = sorted(ctx.registry().decode_interceptors());
        interceptors.push(Arc::new(EngineDecodeInterceptor));
        let decoded = Chain::new(ctx, &interceptors).proceed().await?;
        ctx.check_cancelled()?;

        ctx.set_state(RequestState::StoringToMemoryCache);
        let data_from = decoded.data_from;
        let image = CachedImage::new(ctx.cache_key(), decoded, Some(Arc::clone(ctx.bitmap_pool())));
        // 先登记等待使用引用，再放入内存缓存，避免入缓存即被淘汰回收
        let waiting = ImageRef::new(Arc::clone(&image), RefKind::WaitingUse);
        if ctx.request().memory_cache_policy().write {
            ctx.memory_cache().put(ctx.cache_key(), image);
        }

        Ok(ImageData::new(ctx.cache_key(), waiting, data_from))
    }
}

/// 解码链终点：匹配获取器取回字节，再匹配解码器解码。
pub struct EngineDecodeInterceptor;

#[async_trait]
impl Interceptor<DecodeResult> for EngineDecodeInterceptor {
    fn key(&self) -> &str {
        "EngineDecodeInterceptor"
    }

    async fn intercept(&self, chain: Chain<'_, DecodeResult>) -> Result<DecodeResult, ImageError> {
        let ctx = chain.context();
        let uri = redact_uri_for_log(ctx.request().uri());

        ctx.set_state(RequestState::Fetching);
        let fetch_started = Instant::now();
        let fetcher = ctx.registry().new_fetcher(ctx)?;
        let fetched = fetcher.fetch(ctx).await?;
        ctx.record_timing("fetch", fetch_started);
        ctx.check_cancelled()?;

        ctx.set_state(RequestState::Decoding);
        let decode_started = Instant::now();
        let decoder = ctx.registry().new_decoder(ctx, &fetched)?;
        let mime_type = fetched.mime_type.clone();
        let decoded = decoder.decode(ctx, fetched).await?;
        ctx.record_timing("decode", decode_started);

        log::debug!("🧩 获取与解码完成 - {} mime={} 来源={}", uri, mime_type, decoded.data_from);
        Ok(decoded)
    }
}
