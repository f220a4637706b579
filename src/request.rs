//! # 请求模型
//!
//! ## 设计思路
//!
//! `ImageRequest` 是提交后不可变的值对象，只能通过 `ImageRequestBuilder` 构造。
//! 请求上的参数分两类：
//! - 影响像素的参数（尺寸、精度、裁剪、变换、方向、普通参数）进入 CacheKey
//! - 只影响获取的参数（HTTP 请求头）只进入 DownloadCacheKey
//!
//! ## 实现思路
//!
//! - 参数与请求头均用 `BTreeMap` 保存，序列化顺序天然确定，key 跨进程稳定。
//! - 目标尺寸可以是固定值、原图尺寸或异步 `SizeResolver`，真正的尺寸在构建上下文时才确定。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::listener::ImageListener;
use crate::registry::ComponentRegistry;
use crate::resize::{Precision, Scale, Size};
use crate::transform::Transformation;

/// 缓存读写开关。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CachePolicy {
    pub read: bool,
    pub write: bool,
}

impl CachePolicy {
    pub const ENABLED: Self = Self { read: true, write: true };
    pub const READ_ONLY: Self = Self { read: true, write: false };
    pub const WRITE_ONLY: Self = Self { read: false, write: true };
    pub const DISABLED: Self = Self { read: false, write: false };
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::ENABLED
    }
}

/// 异步确定目标尺寸（例如等待视图完成测量）。返回 `None` 表示按原图尺寸解码。
#[async_trait]
pub trait SizeResolver: Send + Sync {
    async fn resolve(&self) -> Option<Size>;
}

/// 目标尺寸来源。
#[derive(Clone, Default)]
pub enum SizeSpec {
    #[default]
    Original,
    Fixed(Size),
    Resolver(Arc<dyn SizeResolver>),
}

impl fmt::Debug for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Original => f.write_str("Original"),
            Self::Fixed(size) => write!(f, "Fixed({size})"),
            Self::Resolver(_) => f.write_str("Resolver"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Parameter {
    value: String,
    in_cache_key: bool,
}

/// 一次图片加载请求。
#[derive(Clone)]
pub struct ImageRequest {
    uri: String,
    size: SizeSpec,
    precision: Precision,
    scale: Scale,
    memory_cache_policy: CachePolicy,
    result_cache_policy: CachePolicy,
    download_cache_policy: CachePolicy,
    parameters: BTreeMap<String, Parameter>,
    http_headers: BTreeMap<String, String>,
    transformations: Vec<Arc<dyn Transformation>>,
    ignore_exif_orientation: bool,
    listener: Option<Arc<dyn ImageListener>>,
    components: Option<ComponentRegistry>,
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("uri", &self.uri)
            .field("size", &self.size)
            .field("precision", &self.precision)
            .field("scale", &self.scale)
            .field("parameters", &self.parameters)
            .field("http_headers", &self.http_headers.keys().collect::<Vec<_>>())
            .field(
                "transformations",
                &self.transformations.iter().map(|t| t.key()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl ImageRequest {
    pub fn builder(uri: impl Into<String>) -> ImageRequestBuilder {
        ImageRequestBuilder {
            request: ImageRequest {
                uri: uri.into(),
                size: SizeSpec::Original,
                precision: Precision::default(),
                scale: Scale::default(),
                memory_cache_policy: CachePolicy::ENABLED,
                result_cache_policy: CachePolicy::ENABLED,
                download_cache_policy: CachePolicy::ENABLED,
                parameters: BTreeMap::new(),
                http_headers: BTreeMap::new(),
                transformations: Vec::new(),
                ignore_exif_orientation: false,
                listener: None,
                components: None,
            },
        }
    }

    pub fn new(uri: impl Into<String>) -> Self {
        Self::builder(uri).build()
    }

    /// 以当前请求为模板派生新请求（拦截器改写请求时使用）。
    pub fn new_builder(&self) -> ImageRequestBuilder {
        ImageRequestBuilder { request: self.clone() }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn size(&self) -> &SizeSpec {
        &self.size
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn scale(&self) -> Scale {
        self.scale
    }

    pub fn memory_cache_policy(&self) -> CachePolicy {
        self.memory_cache_policy
    }

    pub fn result_cache_policy(&self) -> CachePolicy {
        self.result_cache_policy
    }

    pub fn download_cache_policy(&self) -> CachePolicy {
        self.download_cache_policy
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|p| p.value.as_str())
    }

    pub fn http_headers(&self) -> &BTreeMap<String, String> {
        &self.http_headers
    }

    pub fn transformations(&self) -> &[Arc<dyn Transformation>] {
        &self.transformations
    }

    pub fn ignore_exif_orientation(&self) -> bool {
        self.ignore_exif_orientation
    }

    pub fn listener(&self) -> Option<&Arc<dyn ImageListener>> {
        self.listener.as_ref()
    }

    pub fn components(&self) -> Option<&ComponentRegistry> {
        self.components.as_ref()
    }

    /// 解码结果的缓存 key：URI + 全部影响像素的参数。
    ///
    /// 序列化格式：`<uri>?_size=WxH&_precision=..&_scale=..&_transformations=[..]&_ignoreOrientation=true&k=v`，
    /// 原图尺寸记为 `_size=ORIGINAL`，此时不再追加精度与裁剪策略。
    pub fn cache_key(&self, resolved_size: Option<Size>) -> String {
        let mut query: Vec<String> = Vec::new();
        match resolved_size {
            Some(size) => {
                query.push(format!("_size={size}"));
                query.push(format!("_precision={}", self.precision.as_str()));
                query.push(format!("_scale={}", self.scale.as_str()));
            }
            None => query.push("_size=ORIGINAL".to_string()),
        }
        if !self.transformations.is_empty() {
            let keys: Vec<String> = self.transformations.iter().map(|t| t.key()).collect();
            query.push(format!("_transformations=[{}]", keys.join(",")));
        }
        if self.ignore_exif_orientation {
            query.push("_ignoreOrientation=true".to_string());
        }
        for (key, param) in &self.parameters {
            if param.in_cache_key {
                query.push(format!("{}={}", escape_param_key(key), escape_param(&param.value)));
            }
        }

        join_query(&self.uri, &query)
    }

    /// 原始字节的缓存 key：URI + 只影响获取的参数（请求头）。
    pub fn download_cache_key(&self) -> String {
        if self.http_headers.is_empty() {
            return self.uri.clone();
        }

        let headers: Vec<String> = self
            .http_headers
            .iter()
            .map(|(name, value)| format!("{}:{}", name, value))
            .collect();
        join_query(&self.uri, &[format!("_headers={{{}}}", headers.join(","))])
    }
}

/// 转义参数中的分隔符，保证拼接后的 key 可以无歧义地还原。
fn escape_param(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}

/// `_` 开头的名字留给内置字段，用户参数以 `%5F` 代替。
fn escape_param_key(raw: &str) -> String {
    match raw.strip_prefix('_') {
        Some(rest) => format!("%5F{}", escape_param(rest)),
        None => escape_param(raw),
    }
}

fn join_query(uri: &str, query: &[String]) -> String {
    if query.is_empty() {
        return uri.to_string();
    }
    let separator = if uri.contains('?') { '&' } else { '?' };
    format!("{}{}{}", uri, separator, query.join("&"))
}

pub struct ImageRequestBuilder {
    request: ImageRequest,
}

impl ImageRequestBuilder {
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.request.uri = uri.into();
        self
    }

    pub fn size(mut self, size: Size) -> Self {
        self.request.size = SizeSpec::Fixed(size);
        self
    }

    pub fn original_size(mut self) -> Self {
        self.request.size = SizeSpec::Original;
        self
    }

    pub fn size_resolver(mut self, resolver: Arc<dyn SizeResolver>) -> Self {
        self.request.size = SizeSpec::Resolver(resolver);
        self
    }

    pub fn precision(mut self, precision: Precision) -> Self {
        self.request.precision = precision;
        self
    }

    pub fn scale(mut self, scale: Scale) -> Self {
        self.request.scale = scale;
        self
    }

    pub fn memory_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.request.memory_cache_policy = policy;
        self
    }

    pub fn result_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.request.result_cache_policy = policy;
        self
    }

    pub fn download_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.request.download_cache_policy = policy;
        self
    }

    /// 影响像素的参数，参与 CacheKey。
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.parameters.insert(
            key.into(),
            Parameter {
                value: value.into(),
                in_cache_key: true,
            },
        );
        self
    }

    /// 只影响调度、不影响像素的参数，不参与任何 key。
    pub fn transient_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.parameters.insert(
            key.into(),
            Parameter {
                value: value.into(),
                in_cache_key: false,
            },
        );
        self
    }

    pub fn remove_parameter(mut self, key: &str) -> Self {
        self.request.parameters.remove(key);
        self
    }

    pub fn http_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.http_headers.insert(name.into(), value.into());
        self
    }

    pub fn transformation(mut self, transformation: Arc<dyn Transformation>) -> Self {
        self.request.transformations.push(transformation);
        self
    }

    pub fn ignore_exif_orientation(mut self, ignore: bool) -> Self {
        self.request.ignore_exif_orientation = ignore;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ImageListener>) -> Self {
        self.request.listener = Some(listener);
        self
    }

    /// 请求级组件，优先于全局注册的同类组件。
    pub fn components(mut self, components: ComponentRegistry) -> Self {
        self.request.components = Some(components);
        self
    }

    pub fn build(self) -> ImageRequest {
        self.request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::RotateTransformation;

    #[test]
    fn headers_only_change_download_key() {
        let a = ImageRequest::builder("https://example.com/a.jpg")
            .size(Size::new(200, 200))
            .http_header("Authorization", "token-1")
            .build();
        let b = ImageRequest::builder("https://example.com/a.jpg")
            .size(Size::new(200, 200))
            .http_header("Authorization", "token-2")
            .build();

        let size = Some(Size::new(200, 200));
        assert_eq!(a.cache_key(size), b.cache_key(size));
        assert_ne!(a.download_cache_key(), b.download_cache_key());
    }

    #[test]
    fn pixel_parameters_change_cache_key_but_not_download_key() {
        let small = ImageRequest::builder("https://example.com/a.jpg").size(Size::new(100, 100)).build();
        let large = ImageRequest::builder("https://example.com/a.jpg").size(Size::new(400, 400)).build();

        assert_ne!(
            small.cache_key(Some(Size::new(100, 100))),
            large.cache_key(Some(Size::new(400, 400)))
        );
        assert_eq!(small.download_cache_key(), large.download_cache_key());
        assert_eq!(small.download_cache_key(), "https://example.com/a.jpg");
    }

    #[test]
    fn cache_key_serialization_is_deterministic() {
        let a = ImageRequest::builder("file:///tmp/a.png")
            .size(Size::new(10, 20))
            .precision(Precision::Exact)
            .scale(Scale::EndCrop)
            .parameter("zeta", "1")
            .parameter("alpha", "2")
            .transformation(Arc::new(RotateTransformation::new(90)))
            .ignore_exif_orientation(true)
            .build();
        let b = ImageRequest::builder("file:///tmp/a.png")
            .ignore_exif_orientation(true)
            .transformation(Arc::new(RotateTransformation::new(90)))
            .parameter("alpha", "2")
            .parameter("zeta", "1")
            .scale(Scale::EndCrop)
            .precision(Precision::Exact)
            .size(Size::new(10, 20))
            .build();

        let key = a.cache_key(Some(Size::new(10, 20)));
        assert_eq!(key, b.cache_key(Some(Size::new(10, 20))));
        assert_eq!(
            key,
            "file:///tmp/a.png?_size=10x20&_precision=EXACT&_scale=END_CROP\
             &_transformations=[Rotate(90)]&_ignoreOrientation=true&alpha=2&zeta=1"
        );
    }

    #[test]
    fn transient_parameters_stay_out_of_keys() {
        let plain = ImageRequest::new("https://example.com/a.jpg?v=1");
        let tagged = ImageRequest::builder("https://example.com/a.jpg?v=1")
            .transient_parameter("ignore_pause_load", "true")
            .build();

        assert_eq!(plain.cache_key(None), tagged.cache_key(None));
        assert_eq!(tagged.cache_key(None), "https://example.com/a.jpg?v=1&_size=ORIGINAL");
        assert_eq!(tagged.parameter("ignore_pause_load"), Some("true"));
    }

    #[test]
    fn user_parameters_cannot_forge_reserved_fields() {
        let forged = ImageRequest::builder("file:///tmp/a.png")
            .parameter("_size", "10x20")
            .build();
        let sized = ImageRequest::builder("file:///tmp/a.png").build();

        let key = forged.cache_key(None);
        assert_eq!(key, "file:///tmp/a.png?_size=ORIGINAL&%5Fsize=10x20");
        assert_ne!(key, sized.cache_key(Some(Size::new(10, 20))));
        assert_eq!(forged.parameter("_size"), Some("10x20"));
    }

    #[test]
    fn parameter_separators_are_escaped() {
        let packed = ImageRequest::builder("file:///tmp/a.png").parameter("a", "1&b=2").build();
        let split = ImageRequest::builder("file:///tmp/a.png")
            .parameter("a", "1")
            .parameter("b", "2")
            .build();

        assert_ne!(packed.cache_key(None), split.cache_key(None));
        assert_eq!(packed.cache_key(None), "file:///tmp/a.png?_size=ORIGINAL&a=1%26b%3D2");
        assert_eq!(
            ImageRequest::builder("file:///tmp/a.png")
                .parameter("a%26b", "x")
                .build()
                .cache_key(None),
            "file:///tmp/a.png?_size=ORIGINAL&a%2526b=x"
        );
    }
}
