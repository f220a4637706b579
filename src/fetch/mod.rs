//! # 获取阶段
//!
//! ## 设计思路
//!
//! `FetcherFactory` 负责“能不能处理这个 URI”，`Fetcher` 负责“把字节取回来”。
//! 注册表按注册顺序逐个询问工厂，第一个返回 `Some` 的工厂胜出。
//!
//! 内置 scheme：
//! - `http://` / `https://`：经下载缓存与进行中请求去重
//! - `file://` 与绝对路径
//! - `asset://`：相对 `asset_root` 的打包资源
//! - `content://`：交给注册的 `ContentResolver`
//! - `data:`：内联 base64
//! - `blurhash://`：生成占位图

use std::sync::Arc;

use async_trait::async_trait;

use crate::ImageError;
use crate::context::RequestContext;
use crate::source::FetchResult;

mod asset;
mod blurhash;
mod content;
mod data_uri;
mod file;
mod http;

pub use asset::{AssetUriFetcher, AssetUriFetcherFactory};
pub use blurhash::{BlurHashUriFetcher, BlurHashUriFetcherFactory, decode_blurhash};
pub use content::{ContentResolver, ContentUriFetcher, ContentUriFetcherFactory};
pub use data_uri::{Base64UriFetcher, Base64UriFetcherFactory};
pub use file::{FileUriFetcher, FileUriFetcherFactory};
pub use http::{HttpUriFetcher, HttpUriFetcherFactory};

pub(crate) use http::build_base_http_client;

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, ctx: &RequestContext) -> Result<FetchResult, ImageError>;
}

pub trait FetcherFactory: Send + Sync {
    /// 注册表去重用的标识。
    fn key(&self) -> &str;

    /// 能处理该请求时返回具体的 `Fetcher`。
    fn create(&self, ctx: &RequestContext) -> Option<Box<dyn Fetcher>>;
}

/// 内置获取器，按匹配优先级排列。
pub fn default_fetchers() -> Vec<Arc<dyn FetcherFactory>> {
    vec![
        Arc::new(HttpUriFetcherFactory),
        Arc::new(FileUriFetcherFactory),
        Arc::new(AssetUriFetcherFactory),
        Arc::new(ContentUriFetcherFactory),
        Arc::new(Base64UriFetcherFactory),
        Arc::new(BlurHashUriFetcherFactory),
    ]
}

/// 大小写不敏感地剥离 scheme 前缀。
pub(crate) fn strip_scheme<'a>(uri: &'a str, prefix: &str) -> Option<&'a str> {
    let head = uri.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        uri.get(prefix.len()..)
    } else {
        None
    }
}

/// 日志用的 URI 脱敏：去掉查询串与片段，内联数据只保留长度。
pub(crate) fn redact_uri_for_log(uri: &str) -> String {
    if strip_scheme(uri, "data:").is_some() {
        return format!("data:<{} bytes>", uri.len());
    }

    if strip_scheme(uri, "http://").is_some() || strip_scheme(uri, "https://").is_some() {
        let Ok(parsed) = reqwest::Url::parse(uri) else {
            return "<invalid-url>".to_string();
        };
        let host = parsed.host_str().unwrap_or("<unknown-host>");
        let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
        return format!("{}://{}{}{}", parsed.scheme(), host, port, parsed.path());
    }

    let end = uri.find(['?', '#']).unwrap_or(uri.len());
    uri[..end].chars().take(160).collect()
}

/// 字节体积格式化为 MB，供错误信息使用。
pub(crate) fn as_mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}
