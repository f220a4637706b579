//! 内联 `data:<mime>;base64,<payload>` 图片。

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;

use super::{Fetcher, FetcherFactory, as_mb, strip_scheme};
use crate::ImageError;
use crate::context::RequestContext;
use crate::source::{DataFrom, DataSource, FetchResult, sniff_mime};

pub struct Base64UriFetcherFactory;

impl FetcherFactory for Base64UriFetcherFactory {
    fn key(&self) -> &str {
        "Base64UriFetcher"
    }

    fn create(&self, ctx: &RequestContext) -> Option<Box<dyn Fetcher>> {
        strip_scheme(ctx.request().uri(), "data:")?;
        Some(Box::new(Base64UriFetcher))
    }
}

pub struct Base64UriFetcher;

#[async_trait]
impl Fetcher for Base64UriFetcher {
    async fn fetch(&self, ctx: &RequestContext) -> Result<FetchResult, ImageError> {
        let (declared_mime, bytes) = parse_data_uri(ctx.request().uri(), ctx.config().max_file_size)?;

        let mime_type = declared_mime
            .filter(|mime| mime.starts_with("image/"))
            .or_else(|| sniff_mime(&bytes).map(str::to_string))
            .unwrap_or_else(|| "application/octet-stream".to_string());

        Ok(FetchResult::new(
            DataSource::Bytes {
                bytes: Bytes::from(bytes),
                from: DataFrom::Memory,
            },
            mime_type,
        ))
    }
}

fn estimate_base64_decoded_upper_bound_len(base64_data: &str) -> Result<u64, ImageError> {
    let len = base64_data.len() as u64;
    let groups = len
        .checked_add(3)
        .ok_or_else(|| ImageError::ResourceLimit("Base64 输入长度溢出".to_string()))?
        / 4;

    groups
        .checked_mul(3)
        .ok_or_else(|| ImageError::ResourceLimit("Base64 解码体积估算溢出".to_string()))
}

/// 解析 data URI，返回（声明的 MIME，解码后字节）。解码前先按长度估算体积上限。
fn parse_data_uri(uri: &str, max_file_size: u64) -> Result<(Option<String>, Vec<u8>), ImageError> {
    let body = strip_scheme(uri.trim(), "data:").ok_or_else(|| ImageError::UriInvalid("缺少 data: 前缀".to_string()))?;
    let (header, payload) = body
        .split_once(',')
        .ok_or_else(|| ImageError::UriInvalid("data URI 缺少数据分隔符".to_string()))?;

    let mut parts = header.split(';');
    let mime = parts
        .next()
        .map(|mime| mime.trim().to_ascii_lowercase())
        .filter(|mime| !mime.is_empty());
    if !parts.any(|part| part.trim().eq_ignore_ascii_case("base64")) {
        return Err(ImageError::UriInvalid("仅支持 base64 编码的 data URI".to_string()));
    }

    let payload = payload.trim();
    let estimated_len = estimate_base64_decoded_upper_bound_len(payload)?;
    if estimated_len > max_file_size {
        return Err(ImageError::ResourceLimit(format!(
            "Base64 预计解码体积过大：{:.2} MB（限制：{:.2} MB）",
            as_mb(estimated_len),
            as_mb(max_file_size)
        )));
    }

    let bytes = general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| ImageError::UriInvalid(format!("Base64 解码失败：{}", e)))?;
    if bytes.is_empty() {
        return Err(ImageError::UriInvalid("data URI 内容为空".to_string()));
    }

    Ok((mime, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_declared_mime_and_payload() {
        let (mime, bytes) = parse_data_uri("data:image/png;base64,SGVsbG8=", 1024).expect("parse failed");
        assert_eq!(mime.as_deref(), Some("image/png"));
        assert_eq!(bytes, b"Hello");
    }

    #[test]
    fn mime_is_optional() {
        let (mime, _) = parse_data_uri("DATA:;base64,SGVsbG8=", 1024).expect("parse failed");
        assert_eq!(mime, None);
    }

    #[test]
    fn rejects_non_base64_and_malformed_payloads() {
        assert!(matches!(
            parse_data_uri("data:image/svg+xml,<svg/>", 1024),
            Err(ImageError::UriInvalid(_))
        ));
        assert!(matches!(parse_data_uri("data:image/png;base64", 1024), Err(ImageError::UriInvalid(_))));
        assert!(matches!(
            parse_data_uri("data:image/png;base64,@@@", 1024),
            Err(ImageError::UriInvalid(_))
        ));
    }

    #[test]
    fn rejects_large_payload_before_decode() {
        let huge = format!("data:image/png;base64,{}", "A".repeat(1024 * 1024));
        assert!(matches!(parse_data_uri(&huge, 32), Err(ImageError::ResourceLimit(_))));
    }
}
