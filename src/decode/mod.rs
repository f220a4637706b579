//! # 解码阶段
//!
//! `DecoderFactory` 根据请求上下文与获取结果（主要是 MIME）决定是否接手，
//! `Decoder` 消费获取结果并产出 RGBA 像素与元数据。
//! 内置的 `RasterDecoder` 基于 `image` crate，覆盖常见位图格式；
//! 其他编解码器（GIF 动画、SVG、视频帧等）通过同样的两个接口接入。

use std::sync::Arc;

use async_trait::async_trait;

use crate::ImageError;
use crate::context::RequestContext;
use crate::source::{DecodeResult, FetchResult};

mod raster;

pub use raster::{RasterDecoder, RasterDecoderFactory};

#[async_trait]
pub trait Decoder: Send + Sync {
    async fn decode(&self, ctx: &RequestContext, fetched: FetchResult) -> Result<DecodeResult, ImageError>;
}

pub trait DecoderFactory: Send + Sync {
    fn key(&self) -> &str;

    fn create(&self, ctx: &RequestContext, fetched: &FetchResult) -> Option<Box<dyn Decoder>>;
}

pub fn default_decoders() -> Vec<Arc<dyn DecoderFactory>> {
    vec![Arc::new(RasterDecoderFactory)]
}
