//! # 数据源与中间模型
//!
//! ## 设计思路
//!
//! 将“外部来源”和“流水线中间结果”解耦：
//! - `DataSource` 表示可一次性打开的字节来源，并携带 `DataFrom` 出处标签
//! - `FetchResult` 表示获取阶段的产物（字节来源 + 声明的 MIME）
//! - `Bitmap` / `DecodeResult` 表示解码阶段的产物（RGBA 像素 + 元数据）

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ImageError;
use crate::cache::disk::Snapshot;
use crate::resize::{ResizeMapping, Size};

/// 数据出处，用于诊断与缓存策略判断。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFrom {
    Network,
    DownloadCache,
    Local,
    ResultCache,
    MemoryCache,
    Memory,
}

impl DataFrom {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::DownloadCache => "DOWNLOAD_CACHE",
            Self::Local => "LOCAL",
            Self::ResultCache => "RESULT_CACHE",
            Self::MemoryCache => "MEMORY_CACHE",
            Self::Memory => "MEMORY",
        }
    }
}

impl fmt::Display for DataFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 可一次性打开的字节来源。
#[derive(Debug, Clone)]
pub enum DataSource {
    /// 已在内存中的字节（下载结果、data URI、生成的占位图等）。
    Bytes { bytes: Bytes, from: DataFrom },
    /// 本地文件。
    File { path: PathBuf, from: DataFrom },
    /// 磁盘缓存中已提交的条目。
    DiskCache { snapshot: Snapshot, from: DataFrom },
}

impl DataSource {
    pub fn data_from(&self) -> DataFrom {
        match self {
            Self::Bytes { from, .. } | Self::File { from, .. } | Self::DiskCache { from, .. } => *from,
        }
    }

    /// 读取全部字节。
    pub fn read_all(&self) -> Result<Bytes, ImageError> {
        match self {
            Self::Bytes { bytes, .. } => Ok(bytes.clone()),
            Self::File { path, .. } => std::fs::read(path)
                .map(Bytes::from)
                .map_err(|e| ImageError::FetchFailed(format!("无法读取图片文件 {}：{}", path.display(), e))),
            Self::DiskCache { snapshot, .. } => snapshot
                .read_data()
                .map(Bytes::from)
                .map_err(|e| ImageError::Cache(format!("读取缓存条目失败：{}", e))),
        }
    }
}

/// 获取阶段输出，解码阶段恰好消费一次。
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub source: DataSource,
    pub mime_type: String,
}

impl FetchResult {
    pub fn new(source: DataSource, mime_type: impl Into<String>) -> Self {
        Self {
            source,
            mime_type: mime_type.into(),
        }
    }

    pub fn data_from(&self) -> DataFrom {
        self.source.data_from()
    }
}

/// 通过文件签名（magic bytes）推断 MIME，无法识别时返回 `None`。
pub(crate) fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    infer::get(bytes)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .map(|kind| kind.mime_type())
}

/// 原图信息。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// 原图宽度（未应用方向）。
    pub width: u32,
    /// 原图高度（未应用方向）。
    pub height: u32,
    pub mime_type: String,
    /// EXIF 方向值（1~8），没有方向信息时为 1。
    pub exif_orientation: u8,
}

impl ImageInfo {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// 应用方向后的尺寸（5~8 会交换宽高）。
    pub fn oriented_size(&self) -> Size {
        if (5..=8).contains(&self.exif_orientation) {
            Size::new(self.height, self.width)
        } else {
            self.size()
        }
    }
}

/// RGBA8 像素缓冲。
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    /// RGBA 字节数组（`width * height * 4`）。
    pub pixels: Vec<u8>,
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

impl Bitmap {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, ImageError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(4))
            .ok_or_else(|| ImageError::ResourceLimit("图片尺寸导致内存溢出风险".to_string()))?;

        if pixels.len() != expected {
            return Err(ImageError::DecodeFailed(format!(
                "像素数据长度异常：{}（期望 {}）",
                pixels.len(),
                expected
            )));
        }

        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn from_rgba_image(image: image::RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            pixels: image.into_raw(),
        }
    }

    pub fn to_rgba_image(&self) -> Result<image::RgbaImage, ImageError> {
        image::RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| ImageError::DecodeFailed("RGBA 缓冲长度异常".to_string()))
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn byte_count(&self) -> u64 {
        self.pixels.len() as u64
    }
}

/// 解码阶段输出。
#[derive(Debug, Clone)]
pub struct DecodeResult {
    pub bitmap: Bitmap,
    pub info: ImageInfo,
    pub data_from: DataFrom,
    pub resize: Option<ResizeMapping>,
    /// 已应用变换的 key（缩放以 `Resized(...)` 记录）。
    pub transformations: Vec<String>,
}
