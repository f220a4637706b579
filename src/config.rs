//! # 配置模块
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到 `PipelineConfig`，保证运行时行为可观测、可调整、可测试。
//! 性能档位（quality / balanced / speed）作为高层语义，映射到底层参数组合。
//!
//! ## 实现思路
//!
//! - `Default` 提供生产可用的平衡配置。
//! - `from_json` 使用 `serde_json` 解析，缺省字段回落到默认值，解析后统一 `validate`。
//! - `PerformanceProfile` 负责档位字符串解析与反向输出。
//! - `apply_performance_profile` / `infer_performance_profile` 负责档位与参数之间的双向映射。

use std::path::PathBuf;

use fast_image_resize as fr;
use serde::Deserialize;

use crate::ImageError;

/// 重采样滤镜。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    Nearest,
    Bilinear,
    CatmullRom,
    Lanczos3,
}

impl ResizeFilter {
    pub(crate) fn to_fast_filter(self) -> fr::FilterType {
        match self {
            Self::Nearest => fr::FilterType::Box,
            Self::Bilinear => fr::FilterType::Bilinear,
            Self::CatmullRom => fr::FilterType::CatmullRom,
            Self::Lanczos3 => fr::FilterType::Lanczos3,
        }
    }

    pub(crate) fn to_image_filter(self) -> image::imageops::FilterType {
        match self {
            Self::Nearest => image::imageops::FilterType::Nearest,
            Self::Bilinear => image::imageops::FilterType::Triangle,
            Self::CatmullRom => image::imageops::FilterType::CatmullRom,
            Self::Lanczos3 => image::imageops::FilterType::Lanczos3,
        }
    }
}

/// 图片流水线配置。
///
/// 字段覆盖了内存缓存、磁盘缓存、下载与解码四个阶段。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 内存缓存字节预算。
    pub memory_cache_max_bytes: u64,
    /// 像素缓冲复用池字节预算，`0` 表示不复用。
    pub bitmap_pool_max_bytes: u64,
    /// 磁盘缓存根目录；为空时下载缓存与结果缓存都被禁用。
    pub disk_cache_dir: Option<PathBuf>,
    /// 下载缓存（原始字节）字节上限。
    pub download_cache_max_bytes: u64,
    /// 结果缓存（解码后像素）字节上限。
    pub result_cache_max_bytes: u64,
    /// `asset://` 资源根目录。
    pub asset_root: Option<PathBuf>,
    /// 下载/读取原始字节时允许的最大文件体积（字节）。
    pub max_file_size: u64,
    /// 网络下载超时时间（秒）。
    pub download_timeout: u64,
    /// 建立连接（TCP/TLS）超时时间（秒）。
    pub connect_timeout: u64,
    /// 下载首包超时时间（毫秒）。
    pub stream_first_byte_timeout_ms: u64,
    /// 下载分块读取超时时间（毫秒）。
    pub stream_chunk_timeout_ms: u64,
    /// 最大重定向次数，避免无限跳转或恶意链路。
    pub max_redirects: usize,
    /// 是否允许访问内网或本地地址（默认关闭，防 SSRF）。
    pub allow_private_network: bool,
    /// 是否对域名执行 DNS 解析后再做内网 IP 拦截。
    pub resolve_dns_for_url_safety: bool,
    /// 解码后的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    /// 解码阶段允许的预计内存上限（按 RGBA 估算，字节）。
    pub max_decoded_bytes: u64,
    /// 缩放滤镜策略。
    pub resize_filter: ResizeFilter,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            memory_cache_max_bytes: 128 * 1024 * 1024,
            bitmap_pool_max_bytes: 32 * 1024 * 1024,
            disk_cache_dir: None,
            download_cache_max_bytes: 300 * 1024 * 1024,
            result_cache_max_bytes: 200 * 1024 * 1024,
            asset_root: None,
            max_file_size: 50 * 1024 * 1024,
            download_timeout: 30,
            connect_timeout: 8,
            stream_first_byte_timeout_ms: 10_000,
            stream_chunk_timeout_ms: 15_000,
            max_redirects: 5,
            allow_private_network: false,
            resolve_dns_for_url_safety: true,
            max_decoded_pixels: 40_000_000,
            max_decoded_bytes: 160 * 1024 * 1024,
            resize_filter: ResizeFilter::Bilinear,
        }
    }
}

impl PipelineConfig {
    /// 从 JSON 文本解析配置，缺省字段使用默认值。
    ///
    /// # 示例
    /// ```rust
    /// use image_pipeline::PipelineConfig;
    ///
    /// let config = PipelineConfig::from_json(r#"{ "memory_cache_max_bytes": 1048576 }"#)?;
    /// assert_eq!(config.memory_cache_max_bytes, 1024 * 1024);
    /// # Ok::<(), image_pipeline::ImageError>(())
    /// ```
    pub fn from_json(text: &str) -> Result<Self, ImageError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| ImageError::Config(format!("配置 JSON 解析失败：{}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验各参数取值范围。
    pub fn validate(&self) -> Result<(), ImageError> {
        if self.memory_cache_max_bytes == 0 {
            return Err(ImageError::Config("memory_cache_max_bytes 不能为 0".to_string()));
        }
        if self.max_decoded_bytes < 8 * 1024 * 1024 {
            return Err(ImageError::Config("max_decoded_bytes 不能小于 8MB".to_string()));
        }
        if self.max_file_size == 0 {
            return Err(ImageError::Config("max_file_size 不能为 0".to_string()));
        }
        if !(1..=120).contains(&self.connect_timeout) {
            return Err(ImageError::Config("connect_timeout 必须在 1~120 秒之间".to_string()));
        }
        if !(1..=600).contains(&self.download_timeout) {
            return Err(ImageError::Config("download_timeout 必须在 1~600 秒之间".to_string()));
        }
        if !(500..=120_000).contains(&self.stream_first_byte_timeout_ms) {
            return Err(ImageError::Config(
                "stream_first_byte_timeout_ms 必须在 500~120000 毫秒之间".to_string(),
            ));
        }
        if !(500..=120_000).contains(&self.stream_chunk_timeout_ms) {
            return Err(ImageError::Config(
                "stream_chunk_timeout_ms 必须在 500~120000 毫秒之间".to_string(),
            ));
        }
        if self.disk_cache_dir.is_some()
            && (self.download_cache_max_bytes == 0 || self.result_cache_max_bytes == 0)
        {
            return Err(ImageError::Config("启用磁盘缓存时缓存上限不能为 0".to_string()));
        }

        Ok(())
    }

    /// 基于当前参数反推性能档位。
    pub fn infer_performance_profile(&self) -> PerformanceProfile {
        match self.resize_filter {
            ResizeFilter::Lanczos3 | ResizeFilter::CatmullRom => PerformanceProfile::Quality,
            ResizeFilter::Bilinear => PerformanceProfile::Balanced,
            ResizeFilter::Nearest => PerformanceProfile::Speed,
        }
    }

    /// 应用指定性能档位到实际参数。
    pub fn apply_performance_profile(&mut self, profile: PerformanceProfile) {
        match profile {
            PerformanceProfile::Quality => {
                self.resize_filter = ResizeFilter::Lanczos3;
                self.max_decoded_pixels = 80_000_000;
            }
            PerformanceProfile::Balanced => {
                self.resize_filter = ResizeFilter::Bilinear;
                self.max_decoded_pixels = 40_000_000;
            }
            PerformanceProfile::Speed => {
                self.resize_filter = ResizeFilter::Nearest;
                self.max_decoded_pixels = 20_000_000;
            }
        }
    }
}

/// 性能档位（面向产品/用户语义）。
///
/// - `Quality`：尽量保真
/// - `Balanced`：质量与性能平衡
/// - `Speed`：优先解码速度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceProfile {
    Quality,
    Balanced,
    Speed,
}

impl PerformanceProfile {
    /// 从外部字符串解析档位。
    pub fn from_str(profile: &str) -> Result<Self, ImageError> {
        match profile.trim().to_lowercase().as_str() {
            "quality" => Ok(Self::Quality),
            "balanced" => Ok(Self::Balanced),
            "speed" => Ok(Self::Speed),
            other => Err(ImageError::Config(format!(
                "未知性能档位：{}（可选：quality / balanced / speed）",
                other
            ))),
        }
    }

    /// 将档位输出为稳定字符串。
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quality => "quality",
            Self::Balanced => "balanced",
            Self::Speed => "speed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        PipelineConfig::default()
            .validate()
            .expect("default config should validate");
    }

    #[test]
    fn from_json_fills_missing_fields_with_defaults() {
        let config = PipelineConfig::from_json(
            r#"{ "allow_private_network": true, "resize_filter": "lanczos3" }"#,
        )
        .expect("config should parse");

        assert!(config.allow_private_network);
        assert_eq!(config.resize_filter, ResizeFilter::Lanczos3);
        assert_eq!(config.max_redirects, 5);
    }

    #[test]
    fn from_json_rejects_invalid_connect_timeout() {
        let result = PipelineConfig::from_json(r#"{ "connect_timeout": 0 }"#);
        assert!(matches!(result, Err(ImageError::Config(_))));
    }

    #[test]
    fn validate_rejects_invalid_stream_timeouts() {
        let mut config = PipelineConfig::default();
        config.stream_first_byte_timeout_ms = 100;
        assert!(matches!(config.validate(), Err(ImageError::Config(_))));

        let mut config = PipelineConfig::default();
        config.stream_chunk_timeout_ms = 200_000;
        assert!(matches!(config.validate(), Err(ImageError::Config(_))));
    }

    #[test]
    fn profile_roundtrip_through_config() {
        let mut config = PipelineConfig::default();
        for name in ["quality", "balanced", "speed"] {
            let profile = PerformanceProfile::from_str(name).expect("profile should parse");
            config.apply_performance_profile(profile);
            assert_eq!(config.infer_performance_profile().as_str(), name);
        }
    }

    #[test]
    fn rejects_unknown_profile() {
        assert!(matches!(
            PerformanceProfile::from_str("ultra"),
            Err(ImageError::Config(_))
        ));
    }
}
