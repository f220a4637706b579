//! # BlurHash 占位图
//!
//! `blurhash://<HASH>[?width=W&height=H]`：把 BlurHash 字符串还原成像素并编码为 PNG，
//! 作为普通图片交给解码阶段，出处为 `MEMORY`。
//!
//! ## 实现思路
//!
//! - base83 解出分量数、最大 AC 幅度、DC 颜色与各 AC 系数。
//! - DC 从 sRGB 转到线性空间，AC 按 `signPow((q - 9) / 9, 2) * max` 还原。
//! - 逐像素累加余弦基函数，再转回 sRGB。横纵方向的余弦值预先按列 / 行算好。
//! - 哈希字符集包含 `?`，只有最后一个 `?` 之后能解析成宽高参数时才当作查询串。

use std::f32::consts::PI;
use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::RgbaImage;

use super::{Fetcher, FetcherFactory, strip_scheme};
use crate::ImageError;
use crate::context::RequestContext;
use crate::source::{DataFrom, DataSource, FetchResult};

const BLURHASH_SCHEME: &str = "blurhash://";
const DEFAULT_SIZE: u32 = 32;
const MAX_SIZE: u32 = 1024;
const BASE83_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz#$%*+,-.:;=?@[]^_{|}~";

pub struct BlurHashUriFetcherFactory;

impl FetcherFactory for BlurHashUriFetcherFactory {
    fn key(&self) -> &str {
        "BlurHashUriFetcher"
    }

    fn create(&self, ctx: &RequestContext) -> Option<Box<dyn Fetcher>> {
        let body = strip_scheme(ctx.request().uri(), BLURHASH_SCHEME)?;
        let (hash, width, height) = parse_blurhash_uri(body);
        Some(Box::new(BlurHashUriFetcher {
            hash: hash.to_string(),
            width,
            height,
        }))
    }
}

pub struct BlurHashUriFetcher {
    hash: String,
    width: u32,
    height: u32,
}

#[async_trait]
impl Fetcher for BlurHashUriFetcher {
    async fn fetch(&self, _ctx: &RequestContext) -> Result<FetchResult, ImageError> {
        let (hash, width, height) = (self.hash.clone(), self.width, self.height);

        let png = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ImageError> {
            let image = decode_blurhash(&hash, width, height)?;
            let mut out = Vec::new();
            image::DynamicImage::ImageRgba8(image)
                .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
                .map_err(|e| ImageError::DecodeFailed(format!("占位图编码失败：{}", e)))?;
            Ok(out)
        })
        .await
        .map_err(|e| ImageError::FetchFailed(format!("占位图生成任务异常：{}", e)))??;

        Ok(FetchResult::new(
            DataSource::Bytes {
                bytes: Bytes::from(png),
                from: DataFrom::Memory,
            },
            "image/png",
        ))
    }
}

/// 拆出哈希与宽高。宽高缺省为 32，上限 1024。
fn parse_blurhash_uri(body: &str) -> (&str, u32, u32) {
    let mut width = DEFAULT_SIZE;
    let mut height = DEFAULT_SIZE;

    let hash = match body.rsplit_once('?') {
        Some((hash, query)) => match parse_size_query(query) {
            Some((w, h)) => {
                width = w.unwrap_or(DEFAULT_SIZE);
                height = h.unwrap_or(DEFAULT_SIZE);
                hash
            }
            None => body,
        },
        None => body,
    };

    (hash, width.min(MAX_SIZE), height.min(MAX_SIZE))
}

fn parse_size_query(query: &str) -> Option<(Option<u32>, Option<u32>)> {
    let mut width = None;
    let mut height = None;
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=')?;
        let value = value.parse::<u32>().ok()?;
        match key {
            "width" => width = Some(value),
            "height" => height = Some(value),
            _ => return None,
        }
    }
    if width.is_none() && height.is_none() {
        return None;
    }
    Some((width, height))
}

fn decode83(text: &str) -> Result<u32, ImageError> {
    text.bytes().try_fold(0_u32, |acc, byte| {
        let digit = BASE83_CHARS
            .iter()
            .position(|c| *c == byte)
            .ok_or_else(|| ImageError::UriInvalid(format!("BlurHash 含非法字符：{}", byte as char)))?;
        Ok(acc * 83 + digit as u32)
    })
}

fn srgb_to_linear(value: u32) -> f32 {
    let v = value as f32 / 255.0;
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(value: f32) -> u8 {
    let v = value.clamp(0.0, 1.0);
    if v <= 0.003_130_8 {
        (v * 12.92 * 255.0 + 0.5) as u8
    } else {
        ((1.055 * v.powf(1.0 / 2.4) - 0.055) * 255.0 + 0.5) as u8
    }
}

fn sign_pow(value: f32, exp: f32) -> f32 {
    value.abs().powf(exp).copysign(value)
}

/// 把 BlurHash 解码为指定尺寸的 RGBA 图像。
pub fn decode_blurhash(hash: &str, width: u32, height: u32) -> Result<RgbaImage, ImageError> {
    if width == 0 || height == 0 {
        return Err(ImageError::UriInvalid("占位图尺寸不能为 0".to_string()));
    }
    if !hash.is_ascii() || hash.len() < 6 {
        return Err(ImageError::UriInvalid("BlurHash 长度不足".to_string()));
    }

    let size_flag = decode83(&hash[0..1])?;
    let num_y = (size_flag / 9 + 1) as usize;
    let num_x = (size_flag % 9 + 1) as usize;
    if hash.len() != 4 + 2 * num_x * num_y {
        return Err(ImageError::UriInvalid(format!(
            "BlurHash 长度不匹配：{}（期望 {}）",
            hash.len(),
            4 + 2 * num_x * num_y
        )));
    }

    let max_value = (decode83(&hash[1..2])? + 1) as f32 / 166.0;

    let mut colors = Vec::with_capacity(num_x * num_y);
    let dc = decode83(&hash[2..6])?;
    colors.push([
        srgb_to_linear(dc >> 16),
        srgb_to_linear((dc >> 8) & 255),
        srgb_to_linear(dc & 255),
    ]);
    for i in 1..num_x * num_y {
        let value = decode83(&hash[4 + i * 2..6 + i * 2])?;
        let quant = [value / (19 * 19), (value / 19) % 19, value % 19];
        colors.push(quant.map(|q| sign_pow((q as f32 - 9.0) / 9.0, 2.0) * max_value));
    }

    let (w, h) = (width as usize, height as usize);
    let cos_x: Vec<f32> = (0..w)
        .flat_map(|x| (0..num_x).map(move |i| (PI * x as f32 * i as f32 / w as f32).cos()))
        .collect();
    let cos_y: Vec<f32> = (0..h)
        .flat_map(|y| (0..num_y).map(move |j| (PI * y as f32 * j as f32 / h as f32).cos()))
        .collect();

    let mut image = RgbaImage::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let (x, y) = (x as usize, y as usize);
        let mut rgb = [0.0_f32; 3];
        for j in 0..num_y {
            let basis_y = cos_y[y * num_y + j];
            for i in 0..num_x {
                let basis = cos_x[x * num_x + i] * basis_y;
                let color = colors[i + j * num_x];
                rgb[0] += color[0] * basis;
                rgb[1] += color[1] * basis;
                rgb[2] += color[2] * basis;
            }
        }
        pixel.0 = [linear_to_srgb(rgb[0]), linear_to_srgb(rgb[1]), linear_to_srgb(rgb[2]), 255];
    }

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solid_hash_decodes_to_uniform_color() {
        // 单分量，DC = 0xFF0000
        let image = decode_blurhash("00TI:j", 4, 3).expect("decode failed");
        assert_eq!(image.dimensions(), (4, 3));
        assert!(image.pixels().all(|p| p.0 == [255, 0, 0, 255]));
    }

    #[test]
    fn multi_component_hash_produces_gradient() {
        let image = decode_blurhash("LEHV6nWB2yk8pyo0adR*.7kCMdnj", 16, 12).expect("decode failed");
        assert_eq!(image.dimensions(), (16, 12));
        assert_ne!(image.get_pixel(0, 0), image.get_pixel(15, 11));
    }

    #[test]
    fn malformed_hashes_are_rejected() {
        assert!(matches!(decode_blurhash("00TI", 4, 4), Err(ImageError::UriInvalid(_))));
        assert!(matches!(decode_blurhash("10TI:j", 4, 4), Err(ImageError::UriInvalid(_))));
        assert!(matches!(decode_blurhash("00TI\"j", 4, 4), Err(ImageError::UriInvalid(_))));
        assert!(matches!(decode_blurhash("00TI:j", 0, 4), Err(ImageError::UriInvalid(_))));
    }

    #[test]
    fn uri_query_is_split_only_when_it_carries_size() {
        assert_eq!(parse_blurhash_uri("00TI:j"), ("00TI:j", 32, 32));
        assert_eq!(parse_blurhash_uri("00TI:j?width=10&height=20"), ("00TI:j", 10, 20));
        assert_eq!(parse_blurhash_uri("00TI:j?height=5000"), ("00TI:j", 32, 1024));
        // `?` 是合法的 base83 字符
        assert_eq!(parse_blurhash_uri("00T?:j"), ("00T?:j", 32, 32));
    }
}
