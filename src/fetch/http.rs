//! # HTTP 获取器
//!
//! ## 设计思路
//!
//! 在“尽可能早”的阶段失败，减少不必要的流量与内存占用：
//! - 发请求前：协议、主机安全（默认阻止内网 / 本地地址，防 SSRF）
//! - 收到响应头：状态码、内容类型、`Content-Length` 体积上限
//! - 流式读取中：首包 / 分块超时、累计体积上限、前若干字节的签名探测
//!
//! ## 实现思路
//!
//! - 重定向手动跟随，每一跳都重新做主机安全校验，次数受 `max_redirects` 限制。
//! - 开启 DNS 校验时，解析得到的公网地址通过 `resolve` 固定到本次请求的客户端，
//!   避免校验与连接之间被 DNS 重绑定。
//! - 字节经 `DownloadCache::fetch` 写入：同一 DownloadCacheKey 并发请求只下载一次。
//! - 不做自动重试，失败交由调用方决定。

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::net::lookup_host;

use super::{Fetcher, FetcherFactory, as_mb, redact_uri_for_log, strip_scheme};
use crate::ImageError;
use crate::cache::DownloadSink;
use crate::config::PipelineConfig;
use crate::context::RequestContext;
use crate::executor::RequestState;
use crate::source::{DataFrom, FetchResult, sniff_mime};

const STREAM_SIGNATURE_PROBE_BYTES: usize = 4096;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const DEFAULT_ACCEPT: &str = "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8";

pub struct HttpUriFetcherFactory;

impl FetcherFactory for HttpUriFetcherFactory {
    fn key(&self) -> &str {
        "HttpUriFetcher"
    }

    fn create(&self, ctx: &RequestContext) -> Option<Box<dyn Fetcher>> {
        let uri = ctx.request().uri();
        if strip_scheme(uri, "http://").is_none() && strip_scheme(uri, "https://").is_none() {
            return None;
        }
        Some(Box::new(HttpUriFetcher { url: uri.to_string() }))
    }
}

pub struct HttpUriFetcher {
    url: String,
}

#[async_trait]
impl Fetcher for HttpUriFetcher {
    async fn fetch(&self, ctx: &RequestContext) -> Result<FetchResult, ImageError> {
        let url = reqwest::Url::parse(&self.url).map_err(|e| ImageError::UriInvalid(format!("URL 格式错误：{}", e)))?;

        let downloaded = ctx
            .download_cache()
            .fetch(ctx.download_cache_key(), ctx.request().download_cache_policy(), |sink| {
                download(ctx, url, sink)
            })
            .await?;

        if downloaded.data_from() == DataFrom::DownloadCache {
            let total = downloaded.content_length;
            ctx.report_progress(total, Some(total));
        }

        Ok(FetchResult::new(downloaded.source, downloaded.mime_type))
    }
}

async fn download(ctx: &RequestContext, url: reqwest::Url, mut sink: DownloadSink) -> Result<DownloadSink, ImageError> {
    ctx.set_state(RequestState::Downloading);
    let config = ctx.config();
    let headers = build_headers(ctx.request().http_headers())?;
    let mut current_url = url;

    log::debug!("📡 发送 HTTP 请求 - {}", redact_uri_for_log(current_url.as_str()));

    for redirect_count in 0..=config.max_redirects {
        ctx.check_cancelled()?;
        validate_url_safety(current_url.as_str(), config).await?;

        let client = client_for_url(ctx, &current_url).await?;
        let referer = format!("{}://{}/", current_url.scheme(), current_url.host_str().unwrap_or(""));
        let mut request_headers = headers.clone();
        if !request_headers.contains_key(reqwest::header::REFERER) {
            if let Ok(value) = HeaderValue::from_str(&referer) {
                request_headers.insert(reqwest::header::REFERER, value);
            }
        }

        let response = client
            .get(current_url.clone())
            .headers(request_headers)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, current_url.as_str(), config))?;

        if response.status().is_redirection() {
            if redirect_count >= config.max_redirects {
                return Err(ImageError::FetchFailed(format!(
                    "重定向次数超过限制（{}）",
                    config.max_redirects
                )));
            }

            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .ok_or_else(|| ImageError::FetchFailed("重定向响应缺少 Location 头".to_string()))?
                .to_str()
                .map_err(|e| ImageError::FetchFailed(format!("重定向地址无效：{}", e)))?;

            let next_url = current_url
                .join(location)
                .map_err(|e| ImageError::FetchFailed(format!("重定向 URL 解析失败：{}", e)))?;

            log::debug!("↪️ 跳转到: {}", redact_uri_for_log(next_url.as_str()));
            current_url = next_url;
            continue;
        }

        if !response.status().is_success() {
            return Err(ImageError::FetchFailed(format!(
                "HTTP {}: {}",
                response.status().as_u16(),
                status_message(response.status().as_u16())
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .map(str::to_string);
        if let Some(ct) = &content_type {
            if !is_acceptable_content_type(ct) {
                return Err(ImageError::FetchFailed(format!("不是图片类型：{}", ct)));
            }
            if is_image_content_type(ct) {
                sink.set_mime_type(base_mime(ct));
            }
        }

        let total_len = response.content_length();
        if let Some(size) = total_len {
            if size > config.max_file_size {
                return Err(ImageError::ResourceLimit(format!(
                    "文件过大：{:.2} MB（限制：{:.2} MB）",
                    as_mb(size),
                    as_mb(config.max_file_size)
                )));
            }
        }

        ctx.report_progress(0, total_len);
        stream_body(ctx, response, &mut sink, total_len).await?;

        if content_type.as_deref().is_none_or(|ct| !is_image_content_type(ct)) {
            if let Some(mime) = sniff_mime(sink.bytes()) {
                sink.set_mime_type(mime);
            }
        }

        log::debug!("✅ 下载完成 - {} bytes", sink.len());
        return Ok(sink);
    }

    Err(ImageError::FetchFailed("下载流程异常结束".to_string()))
}

async fn stream_body(
    ctx: &RequestContext,
    mut response: reqwest::Response,
    sink: &mut DownloadSink,
    total_len: Option<u64>,
) -> Result<(), ImageError> {
    let config = ctx.config();
    let mut total: u64 = 0;
    let mut signature_checked = false;
    let mut received_first_chunk = false;

    loop {
        let read_timeout = if received_first_chunk {
            Duration::from_millis(config.stream_chunk_timeout_ms)
        } else {
            Duration::from_millis(config.stream_first_byte_timeout_ms)
        };

        let next_chunk = tokio::time::timeout(read_timeout, response.chunk()).await.map_err(|_| {
            if received_first_chunk {
                ImageError::Timeout("下载数据流读取超时".to_string())
            } else {
                ImageError::Timeout("下载首包超时".to_string())
            }
        })?;

        let Some(chunk) = next_chunk.map_err(|e| ImageError::FetchFailed(format!("下载失败：{}", e)))? else {
            break;
        };
        received_first_chunk = true;
        ctx.check_cancelled()?;

        total = total.saturating_add(chunk.len() as u64);
        if total > config.max_file_size {
            return Err(ImageError::ResourceLimit("下载后文件超过大小限制".to_string()));
        }
        sink.write(&chunk);
        ctx.report_progress(total, total_len);

        if !signature_checked {
            signature_checked = probe_signature(sink.bytes(), STREAM_SIGNATURE_PROBE_BYTES)?;
        }
    }

    if total == 0 {
        return Err(ImageError::FetchFailed("图片内容为空".to_string()));
    }

    ctx.report_progress(total, total_len.or(Some(total)));
    Ok(())
}

fn build_headers(custom: &std::collections::BTreeMap<String, String>) -> Result<HeaderMap, ImageError> {
    let mut headers = HeaderMap::new();
    headers.insert(reqwest::header::USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));

    for (name, value) in custom {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ImageError::UriInvalid(format!("请求头名称无效 {}：{}", name, e)))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| ImageError::UriInvalid(format!("请求头 {} 的值无效：{}", name, e)))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

pub(crate) fn build_base_http_client(config: &PipelineConfig) -> Result<reqwest::Client, ImageError> {
    client_builder(config)
        .build()
        .map_err(|e| ImageError::Config(format!("无法创建 HTTP 客户端：{}", e)))
}

fn client_builder(config: &PipelineConfig) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.download_timeout))
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .redirect(reqwest::redirect::Policy::none())
}

/// 需要 DNS 固定时为本次请求单独构建客户端，否则复用共享客户端。
async fn client_for_url(ctx: &RequestContext, url: &reqwest::Url) -> Result<reqwest::Client, ImageError> {
    let config = ctx.config();
    if config.allow_private_network || !config.resolve_dns_for_url_safety {
        return Ok(ctx.http_client().clone());
    }

    let Some(host) = url.host_str() else {
        return Ok(ctx.http_client().clone());
    };
    if host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_ok() {
        return Ok(ctx.http_client().clone());
    }

    let port = url
        .port_or_known_default()
        .ok_or_else(|| ImageError::UriInvalid("URL 缺少端口信息".to_string()))?;
    let pinned = resolve_public_socket_addrs(host, port)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ImageError::FetchFailed("URL 未解析到有效公网地址".to_string()))?;

    client_builder(config)
        .resolve(host, pinned)
        .build()
        .map_err(|e| ImageError::FetchFailed(format!("无法创建 DNS 绑定客户端：{}", e)))
}

/// 校验 URL 安全性。默认阻止本地 / 内网目标，防止 SSRF。
pub(crate) async fn validate_url_safety(url: &str, config: &PipelineConfig) -> Result<(), ImageError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ImageError::UriInvalid(format!("URL 格式错误：{}", e)))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ImageError::UriInvalid("仅支持 HTTP/HTTPS".to_string()));
    }

    if config.allow_private_network {
        return Ok(());
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ImageError::UriInvalid("URL 缺少主机地址".to_string()))?;

    if is_local_hostname(host) {
        return Err(ImageError::FetchFailed(format!("禁止访问本地网络地址：{}", host)));
    }

    // IPv6 字面量在 host_str 中带方括号
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_or_local_ip(ip) {
            return Err(ImageError::FetchFailed(format!("禁止访问内网 IP：{}", ip)));
        }
        return Ok(());
    }

    if config.resolve_dns_for_url_safety {
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| ImageError::UriInvalid("URL 缺少端口信息".to_string()))?;

        if resolve_public_socket_addrs(host, port).await?.is_empty() {
            return Err(ImageError::FetchFailed("URL 未解析到有效地址".to_string()));
        }
    }

    Ok(())
}

async fn resolve_public_socket_addrs(host: &str, port: u16) -> Result<Vec<SocketAddr>, ImageError> {
    let addrs = lookup_host((host, port))
        .await
        .map_err(|e| ImageError::FetchFailed(format!("URL 主机解析失败：{}", e)))?;

    let mut result = Vec::new();
    for addr in addrs {
        if is_private_or_local_ip(addr.ip()) {
            return Err(ImageError::FetchFailed(format!("URL 解析结果命中内网地址：{}", addr.ip())));
        }
        result.push(addr);
    }

    Ok(result)
}

fn is_local_hostname(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || host.eq_ignore_ascii_case("localhost.") || host.ends_with(".local")
}

/// 本地 / 内网 / 链路本地等受限范围。
fn is_private_or_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || v4.is_multicast()
            {
                return true;
            }

            let octets = v4.octets();
            octets[0] == 0 || (octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || v6.is_unique_local() || v6.is_unicast_link_local() || v6.is_multicast()
        }
    }
}

fn base_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

fn is_image_content_type(content_type: &str) -> bool {
    base_mime(content_type).starts_with("image/")
}

/// 部分 CDN 对图片返回通用二进制类型，交给签名探测与解码器判断。
fn is_acceptable_content_type(content_type: &str) -> bool {
    is_image_content_type(content_type)
        || matches!(
            base_mime(content_type).as_str(),
            "application/octet-stream" | "binary/octet-stream"
        )
}

/// 流式签名探测。
///
/// - `Ok(true)`：已识别为图片，或探测窗口已满仍无法识别（交给解码器判断）
/// - `Ok(false)`：字节不足，继续探测
/// - `Err(...)`：已明确识别为非图片内容
fn probe_signature(bytes: &[u8], probe_limit: usize) -> Result<bool, ImageError> {
    if bytes.is_empty() {
        return Ok(false);
    }

    if let Some(kind) = infer::get(bytes) {
        if kind.matcher_type() != infer::MatcherType::Image {
            return Err(ImageError::FetchFailed(format!("下载内容不是图片类型：{}", kind.mime_type())));
        }
        return Ok(true);
    }

    Ok(bytes.len() >= probe_limit)
}

fn map_reqwest_error(e: reqwest::Error, url: &str, config: &PipelineConfig) -> ImageError {
    let err_msg = sanitize_error_message_with_redacted_url(&e.to_string(), url);

    if e.is_timeout() {
        ImageError::Timeout(format!("下载超时（{}秒）", config.download_timeout))
    } else if e.is_connect() {
        ImageError::FetchFailed(format!("无法连接：{}", err_msg))
    } else {
        ImageError::FetchFailed(format!("请求失败：{}", err_msg))
    }
}

fn sanitize_error_message_with_redacted_url(error_msg: &str, url: &str) -> String {
    error_msg.replace(url, &redact_uri_for_log(url))
}

fn status_message(code: u16) -> &'static str {
    match code {
        404 => "未找到",
        403 => "访问被拒绝",
        429 => "请求过于频繁",
        500..=599 => "服务器错误",
        _ => "请求失败",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn url_safety_blocks_private_targets_by_default() {
        let config = PipelineConfig::default();

        assert!(matches!(
            validate_url_safety("http://127.0.0.1/image.png", &config).await,
            Err(ImageError::FetchFailed(_))
        ));
        assert!(matches!(
            validate_url_safety("https://localhost/image.png", &config).await,
            Err(ImageError::FetchFailed(_))
        ));
        assert!(matches!(
            validate_url_safety("http://[::1]/image.png", &config).await,
            Err(ImageError::FetchFailed(_))
        ));
        assert!(matches!(
            validate_url_safety("http://100.64.1.1/image.png", &config).await,
            Err(ImageError::FetchFailed(_))
        ));
    }

    #[tokio::test]
    async fn url_safety_allows_private_targets_when_enabled() {
        let config = PipelineConfig {
            allow_private_network: true,
            ..PipelineConfig::default()
        };

        assert!(validate_url_safety("http://127.0.0.1/image.png", &config).await.is_ok());
        assert!(matches!(
            validate_url_safety("ftp://127.0.0.1/image.png", &config).await,
            Err(ImageError::UriInvalid(_))
        ));
    }

    #[tokio::test]
    async fn url_safety_accepts_public_ip_literal() {
        let config = PipelineConfig::default();
        assert!(validate_url_safety("https://93.184.216.34/a.png", &config).await.is_ok());
    }

    #[test]
    fn content_type_parser_accepts_image_with_params() {
        assert!(is_image_content_type("image/png; charset=utf-8"));
        assert!(is_image_content_type("IMAGE/JPEG"));
        assert!(!is_image_content_type("text/html; charset=utf-8"));
        assert!(is_acceptable_content_type("application/octet-stream"));
        assert!(!is_acceptable_content_type("text/html"));
        assert_eq!(base_mime("Image/WebP; q=1"), "image/webp");
    }

    #[test]
    fn stream_signature_probe_recognizes_png_header() {
        let png_signature = [137_u8, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13];
        assert!(matches!(probe_signature(&png_signature, 64), Ok(true)));
    }

    #[test]
    fn stream_signature_probe_rejects_known_non_image_payload() {
        let zip = [0x50_u8, 0x4B, 0x03, 0x04, 0x14, 0x00, 0x00, 0x00];
        assert!(matches!(probe_signature(&zip, 64), Err(ImageError::FetchFailed(_))));
    }

    #[test]
    fn stream_signature_probe_defers_unknown_payload_to_decoder() {
        let payload = b"plain bytes without a signature";
        assert!(matches!(probe_signature(payload, 4096), Ok(false)));
        assert!(matches!(probe_signature(payload, 8), Ok(true)));
    }

    #[test]
    fn custom_headers_override_defaults() {
        let mut custom = std::collections::BTreeMap::new();
        custom.insert("User-Agent".to_string(), "pipeline-test".to_string());
        custom.insert("X-Token".to_string(), "abc".to_string());

        let headers = build_headers(&custom).expect("headers invalid");
        assert_eq!(headers.get(reqwest::header::USER_AGENT).map(|v| v.as_bytes()), Some(&b"pipeline-test"[..]));
        assert_eq!(headers.get("x-token").map(|v| v.as_bytes()), Some(&b"abc"[..]));

        custom.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(build_headers(&custom), Err(ImageError::UriInvalid(_))));
    }

    #[test]
    fn status_messages_are_localized() {
        assert_eq!(status_message(404), "未找到");
        assert_eq!(status_message(503), "服务器错误");
        assert_eq!(status_message(418), "请求失败");
    }
}
