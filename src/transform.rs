//! # 位图变换
//!
//! 变换作用于解码后的 RGBA 位图，按注册顺序依次执行。
//! 每个变换的 `key` 参与 CacheKey 计算，并记录在结果的 `transformations` 列表中，
//! 所以 key 必须完整描述变换参数。

use image::imageops;

use crate::ImageError;
use crate::source::Bitmap;

pub trait Transformation: Send + Sync {
    fn key(&self) -> String;

    fn transform(&self, input: &Bitmap) -> Result<Bitmap, ImageError>;
}

/// 顺时针旋转，只支持 90 的整数倍。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotateTransformation {
    degrees: i32,
}

impl RotateTransformation {
    pub fn new(degrees: i32) -> Self {
        Self {
            degrees: degrees.rem_euclid(360),
        }
    }

    pub fn degrees(&self) -> i32 {
        self.degrees
    }
}

impl Transformation for RotateTransformation {
    fn key(&self) -> String {
        format!("Rotate({})", self.degrees)
    }

    fn transform(&self, input: &Bitmap) -> Result<Bitmap, ImageError> {
        let image = input.to_rgba_image()?;
        let rotated = match self.degrees {
            0 => image,
            90 => imageops::rotate90(&image),
            180 => imageops::rotate180(&image),
            270 => imageops::rotate270(&image),
            other => {
                return Err(ImageError::Config(format!("不支持的旋转角度：{}", other)));
            }
        };
        Ok(Bitmap::from_rgba_image(rotated))
    }
}

/// 居中裁成正方形并把内切圆以外的像素置为透明。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircleCropTransformation;

impl Transformation for CircleCropTransformation {
    fn key(&self) -> String {
        "CircleCrop".to_string()
    }

    fn transform(&self, input: &Bitmap) -> Result<Bitmap, ImageError> {
        let side = input.width.min(input.height);
        if side == 0 {
            return Ok(input.clone());
        }

        let left = (input.width - side) / 2;
        let top = (input.height - side) / 2;
        let image = input.to_rgba_image()?;
        let mut square = imageops::crop_imm(&image, left, top, side, side).to_image();

        let radius = side as f32 / 2.0;
        for (x, y, pixel) in square.enumerate_pixels_mut() {
            let dx = x as f32 + 0.5 - radius;
            let dy = y as f32 + 0.5 - radius;
            if dx * dx + dy * dy > radius * radius {
                pixel.0 = [0, 0, 0, 0];
            }
        }

        Ok(Bitmap::from_rgba_image(square))
    }
}

/// 高斯模糊。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlurTransformation {
    sigma: f32,
}

impl BlurTransformation {
    pub fn new(sigma: f32) -> Self {
        Self {
            sigma: if sigma.is_finite() { sigma.max(0.0) } else { 0.0 },
        }
    }
}

impl Transformation for BlurTransformation {
    fn key(&self) -> String {
        format!("Blur({:.1})", self.sigma)
    }

    fn transform(&self, input: &Bitmap) -> Result<Bitmap, ImageError> {
        if self.sigma <= 0.0 {
            return Ok(input.clone());
        }
        let image = input.to_rgba_image()?;
        Ok(Bitmap::from_rgba_image(imageops::blur(&image, self.sigma)))
    }
}
