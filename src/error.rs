//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 使用单一错误枚举承载请求链路中的所有错误来源，避免字符串拼接式错误处理。
//! 载荷统一为 `String`，因此错误可以 `Clone`，在下载去重时原样分发给所有等待者。
//!
//! ## 实现思路
//!
//! - `ImageError`：各阶段内部使用的扁平错误。
//! - `RequestFailure`：终态失败，附带出错阶段与 CacheKey，交给调用方。
//! - `Cancelled` 不是失败，只通过独立的取消信号送达，永远不会包装成 `RequestFailure`。

use std::fmt;

/// 图片请求统一错误类型。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("URI 无效：{0}")]
    UriInvalid(String),

    #[error("没有匹配的 Fetcher：{0}")]
    NoFetcherMatched(String),

    #[error("没有匹配的 Decoder：{0}")]
    NoDecoderMatched(String),

    #[error("获取失败：{0}")]
    FetchFailed(String),

    #[error("超时错误：{0}")]
    Timeout(String),

    #[error("资源限制：{0}")]
    ResourceLimit(String),

    #[error("解码错误：{0}")]
    DecodeFailed(String),

    #[error("缓存错误：{0}")]
    Cache(String),

    #[error("配置错误：{0}")]
    Config(String),

    #[error("请求已取消：{0}")]
    Cancelled(String),
}

/// 错误发生的阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Context,
    Fetch,
    Decode,
    Cache,
    Config,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Fetch => "fetch",
            Self::Decode => "decode",
            Self::Cache => "cache",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ImageError {
    /// 稳定的机器可读错误码，供上层按码分支或上报。
    pub fn code(&self) -> &'static str {
        match self {
            Self::UriInvalid(_) => "E_URI_INVALID",
            Self::NoFetcherMatched(_) => "E_NO_FETCHER",
            Self::NoDecoderMatched(_) => "E_NO_DECODER",
            Self::FetchFailed(_) => "E_FETCH",
            Self::Timeout(_) => "E_TIMEOUT",
            Self::ResourceLimit(_) => "E_RESOURCE_LIMIT",
            Self::DecodeFailed(_) => "E_DECODE",
            Self::Cache(_) => "E_CACHE",
            Self::Config(_) => "E_CONFIG",
            Self::Cancelled(_) => "E_CANCELLED",
        }
    }

    /// 错误所属阶段。
    pub fn stage(&self) -> Stage {
        match self {
            Self::UriInvalid(_) => Stage::Context,
            Self::NoFetcherMatched(_) | Self::FetchFailed(_) | Self::Timeout(_) | Self::ResourceLimit(_) => Stage::Fetch,
            Self::NoDecoderMatched(_) | Self::DecodeFailed(_) => Stage::Decode,
            Self::Cache(_) | Self::Cancelled(_) => Stage::Cache,
            Self::Config(_) => Stage::Config,
        }
    }

    /// 调用方是否可以重试。本层自身从不重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::FetchFailed(_) | Self::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<ImageError> for String {
    /// 兼容部分仍使用字符串错误的调用点。
    fn from(error: ImageError) -> Self {
        error.to_string()
    }
}

/// 请求终态失败：原始错误 + 出错阶段 + CacheKey 上下文。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{stage}] {cache_key}: {error}")]
pub struct RequestFailure {
    pub stage: Stage,
    pub cache_key: String,
    #[source]
    pub error: ImageError,
}

impl RequestFailure {
    pub fn new(cache_key: impl Into<String>, error: ImageError) -> Self {
        Self {
            stage: error.stage(),
            cache_key: cache_key.into(),
            error,
        }
    }

    pub fn with_stage(stage: Stage, cache_key: impl Into<String>, error: ImageError) -> Self {
        Self {
            stage,
            cache_key: cache_key.into(),
            error,
        }
    }
}
