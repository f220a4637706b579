//! `content://` URI：由宿主注册的 `ContentResolver` 打开，未注册时不匹配。

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::{Fetcher, FetcherFactory, as_mb, strip_scheme};
use crate::ImageError;
use crate::context::RequestContext;
use crate::source::{DataFrom, DataSource, FetchResult, sniff_mime};

/// 宿主提供的内容解析器（例如平台相册、沙盒文件提供者）。
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn open(&self, uri: &str) -> Result<Bytes, ImageError>;

    /// 已知的 MIME；返回 `None` 时按字节签名推断。
    fn mime_type(&self, _uri: &str) -> Option<String> {
        None
    }
}

pub struct ContentUriFetcherFactory;

impl FetcherFactory for ContentUriFetcherFactory {
    fn key(&self) -> &str {
        "ContentUriFetcher"
    }

    fn create(&self, ctx: &RequestContext) -> Option<Box<dyn Fetcher>> {
        strip_scheme(ctx.request().uri(), "content://")?;
        let resolver = Arc::clone(ctx.content_resolver()?);
        Some(Box::new(ContentUriFetcher {
            uri: ctx.request().uri().to_string(),
            resolver,
        }))
    }
}

pub struct ContentUriFetcher {
    uri: String,
    resolver: Arc<dyn ContentResolver>,
}

#[async_trait]
impl Fetcher for ContentUriFetcher {
    async fn fetch(&self, ctx: &RequestContext) -> Result<FetchResult, ImageError> {
        let bytes = self.resolver.open(&self.uri).await?;

        let max_file_size = ctx.config().max_file_size;
        if bytes.len() as u64 > max_file_size {
            return Err(ImageError::ResourceLimit(format!(
                "文件过大：{:.2} MB（限制：{:.2} MB）",
                as_mb(bytes.len() as u64),
                as_mb(max_file_size)
            )));
        }

        let mime_type = self
            .resolver
            .mime_type(&self.uri)
            .or_else(|| sniff_mime(&bytes).map(str::to_string))
            .unwrap_or_else(|| "application/octet-stream".to_string());

        Ok(FetchResult::new(
            DataSource::Bytes {
                bytes,
                from: DataFrom::Local,
            },
            mime_type,
        ))
    }
}
