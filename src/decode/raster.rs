//! # 位图解码器
//!
//! ## 设计思路
//!
//! 将“字节 → 图像 → RGBA”的过程集中管理，并在关键节点做资源上限控制：
//! 先读图片头拿尺寸并按像素 / 内存上限快速拒绝，再完整解码。
//!
//! ## 实现思路
//!
//! 1. 读取 header 尺寸，按像素与预计内存上限校验
//! 2. 完整解码，读取 EXIF 方向并（除非请求忽略）应用
//! 3. 以方向校正后的尺寸计算缩放映射
//! 4. 裁剪 + 缩放一步完成（`fast_image_resize`），输出缓冲优先从复用池取
//! 5. `fast_image_resize` 失败时回退 `image` 自带的裁剪与缩放
//!
//! 解码是 CPU 密集操作，整个过程在 `spawn_blocking` 中执行。

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fast_image_resize as fr;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};

use super::{Decoder, DecoderFactory};
use crate::ImageError;
use crate::cache::BitmapPool;
use crate::config::{PipelineConfig, ResizeFilter};
use crate::context::RequestContext;
use crate::resize::{Precision, ResizeMapping, Scale, Size, map};
use crate::source::{Bitmap, DataFrom, DecodeResult, FetchResult, ImageInfo, sniff_mime};

const OCTET_STREAM: &str = "application/octet-stream";

pub struct RasterDecoderFactory;

impl DecoderFactory for RasterDecoderFactory {
    fn key(&self) -> &str {
        "RasterDecoder"
    }

    fn create(&self, _ctx: &RequestContext, fetched: &FetchResult) -> Option<Box<dyn Decoder>> {
        let supported = fetched.mime_type.eq_ignore_ascii_case(OCTET_STREAM)
            || ImageFormat::from_mime_type(&fetched.mime_type).is_some_and(|format| format.reading_enabled());
        supported.then(|| Box::new(RasterDecoder) as Box<dyn Decoder>)
    }
}

pub struct RasterDecoder;

/// 解码所需的请求参数快照，移入阻塞任务。
struct DecodeJob {
    bytes: Bytes,
    mime_type: String,
    data_from: DataFrom,
    target: Option<Size>,
    precision: Precision,
    scale: Scale,
    ignore_orientation: bool,
    max_decoded_pixels: u64,
    max_decoded_bytes: u64,
    filter: ResizeFilter,
    pool: Arc<BitmapPool>,
}

#[async_trait]
impl Decoder for RasterDecoder {
    async fn decode(&self, ctx: &RequestContext, fetched: FetchResult) -> Result<DecodeResult, ImageError> {
        let config: &PipelineConfig = ctx.config();
        let request = ctx.request();
        let source = fetched.source;

        let mut job = DecodeJob {
            bytes: Bytes::new(),
            mime_type: fetched.mime_type,
            data_from: source.data_from(),
            target: ctx.resolved_size(),
            precision: request.precision(),
            scale: request.scale(),
            ignore_orientation: request.ignore_exif_orientation(),
            max_decoded_pixels: config.max_decoded_pixels,
            max_decoded_bytes: config.max_decoded_bytes,
            filter: config.resize_filter,
            pool: Arc::clone(ctx.bitmap_pool()),
        };

        tokio::task::spawn_blocking(move || {
            job.bytes = source.read_all()?;
            decode_bytes(job)
        })
        .await
        .map_err(|e| ImageError::DecodeFailed(format!("解码任务异常：{}", e)))?
    }
}

fn decode_bytes(job: DecodeJob) -> Result<DecodeResult, ImageError> {
    let (header_width, header_height) = inspect_dimensions_from_memory(&job.bytes)?;
    validate_pixel_limits(job.max_decoded_pixels, header_width, header_height)?;
    validate_decoded_memory_limits(job.max_decoded_bytes, header_width, header_height)?;

    let mut decoder = ImageReader::new(Cursor::new(&job.bytes[..]))
        .with_guessed_format()
        .map_err(|e| ImageError::DecodeFailed(format!("无法识别图片格式：{}", e)))?
        .into_decoder()
        .map_err(|e| ImageError::DecodeFailed(format!("不支持的图片格式：{}", e)))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut image =
        DynamicImage::from_decoder(decoder).map_err(|e| ImageError::DecodeFailed(format!("图片解码失败：{}", e)))?;

    let (raw_width, raw_height) = (image.width(), image.height());
    let mime_type = if job.mime_type.eq_ignore_ascii_case(OCTET_STREAM) {
        sniff_mime(&job.bytes).map(str::to_string).unwrap_or(job.mime_type)
    } else {
        job.mime_type
    };
    let info = ImageInfo {
        width: raw_width,
        height: raw_height,
        mime_type,
        exif_orientation: orientation.to_exif(),
    };

    if !job.ignore_orientation && orientation != Orientation::NoTransforms {
        image.apply_orientation(orientation);
    }
    let oriented = Size::new(image.width(), image.height());

    let mapping = job
        .target
        .and_then(|target| map(oriented, target, job.precision, job.scale));
    let mut transformations = Vec::new();
    let bitmap = match mapping {
        Some(mapping) if !mapping.is_identity() => {
            transformations.push(format!("Resized({}x{})", mapping.dest.width(), mapping.dest.height()));
            resize_region(&image, mapping, job.filter, &job.pool)
        }
        _ => Bitmap::from_rgba_image(image.to_rgba8()),
    };

    log::info!(
        "✅ 图片解码成功 - 来源: {} 原始尺寸: {}x{} 输出尺寸: {}x{}",
        job.data_from.as_str(),
        raw_width,
        raw_height,
        bitmap.width,
        bitmap.height
    );

    Ok(DecodeResult {
        bitmap,
        info,
        data_from: job.data_from,
        resize: mapping,
        transformations,
    })
}

/// 仅通过图片头信息读取宽高，用于完整解码前的上限检查。
fn inspect_dimensions_from_memory(bytes: &[u8]) -> Result<(u32, u32), ImageError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ImageError::DecodeFailed(format!("无法识别图片格式：{}", e)))?
        .into_dimensions()
        .map_err(|e| ImageError::DecodeFailed(format!("无法读取图片尺寸：{}", e)))
}

fn validate_pixel_limits(max_pixels: u64, width: u32, height: u32) -> Result<(), ImageError> {
    let pixels = (width as u64)
        .checked_mul(height as u64)
        .ok_or_else(|| ImageError::ResourceLimit("图片像素数溢出".to_string()))?;

    if pixels > max_pixels {
        return Err(ImageError::ResourceLimit(format!(
            "图片像素过大：{} 像素（限制：{} 像素）",
            pixels, max_pixels
        )));
    }

    Ok(())
}

fn validate_decoded_memory_limits(max_bytes: u64, width: u32, height: u32) -> Result<(), ImageError> {
    let estimated = (width as u64)
        .checked_mul(height as u64)
        .and_then(|pixels| pixels.checked_mul(4))
        .ok_or_else(|| ImageError::ResourceLimit("图片解码内存估算溢出".to_string()))?;

    if estimated > max_bytes {
        return Err(ImageError::ResourceLimit(format!(
            "图片解码预计内存过大：{:.2} MB（限制：{:.2} MB）",
            crate::fetch::as_mb(estimated),
            crate::fetch::as_mb(max_bytes)
        )));
    }

    Ok(())
}

/// 裁剪 `mapping.src` 并缩放到 `mapping.dest`，失败时回退 `image` 实现。
fn resize_region(image: &DynamicImage, mapping: ResizeMapping, filter: ResizeFilter, pool: &BitmapPool) -> Bitmap {
    match resize_with_fast_image_resize(image, mapping, filter, pool) {
        Ok(bitmap) => bitmap,
        Err(err) => {
            log::warn!("⚠️ fast_image_resize 缩放失败，回退 image::resize_exact：{}", err);
            let src = mapping.src;
            let cropped = image.crop_imm(src.left, src.top, src.width(), src.height());
            let resized = cropped.resize_exact(mapping.dest.width(), mapping.dest.height(), filter.to_image_filter());
            Bitmap::from_rgba_image(resized.to_rgba8())
        }
    }
}

fn resize_with_fast_image_resize(
    image: &DynamicImage,
    mapping: ResizeMapping,
    filter: ResizeFilter,
    pool: &BitmapPool,
) -> Result<Bitmap, ImageError> {
    let src = image.to_rgba8();
    let (src_width, src_height) = src.dimensions();
    let src_image = fr::images::Image::from_vec_u8(src_width, src_height, src.into_raw(), fr::PixelType::U8x4)
        .map_err(|e| ImageError::DecodeFailed(format!("构建源图像缓冲失败：{}", e)))?;

    let (dest_width, dest_height) = (mapping.dest.width(), mapping.dest.height());
    let dest_len = (dest_width as usize)
        .checked_mul(dest_height as usize)
        .and_then(|pixels| pixels.checked_mul(4))
        .ok_or_else(|| ImageError::ResourceLimit("图片尺寸导致内存溢出风险".to_string()))?;
    let mut dst_image =
        fr::images::Image::from_vec_u8(dest_width, dest_height, pool.take(dest_len), fr::PixelType::U8x4)
            .map_err(|e| ImageError::DecodeFailed(format!("构建目标图像缓冲失败：{}", e)))?;

    let algorithm = if mapping.is_crop_only() {
        fr::ResizeAlg::Nearest
    } else {
        fr::ResizeAlg::Convolution(filter.to_fast_filter())
    };
    let src_rect = mapping.src;
    let options = fr::ResizeOptions::new().resize_alg(algorithm).crop(
        src_rect.left as f64,
        src_rect.top as f64,
        src_rect.width() as f64,
        src_rect.height() as f64,
    );

    let mut resizer = fr::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| ImageError::DecodeFailed(format!("fast_image_resize 执行失败：{}", e)))?;

    Bitmap::new(dest_width, dest_height, dst_image.into_vec())
}
