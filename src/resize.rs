//! # 尺寸映射模块
//!
//! ## 设计思路
//!
//! 纯函数：根据原图尺寸、目标尺寸、精度策略与裁剪策略，计算 (源矩形, 目标矩形)。
//! 解码阶段据此一次性完成“裁剪 + 缩放”，不在这里触碰任何像素。
//!
//! ## 实现思路
//!
//! - `Exact`：目标尺寸即输出尺寸，源矩形按比例裁剪，全程整数运算避免 1px 漂移。
//! - `LessPixels` / `SmallerSize`：每步缩小 1%（比例 = 0.99^步数），满足约束即停止，
//!   比例本身不做取整，只对候选宽高向下取整，输出至少 1×1。

use serde::{Deserialize, Serialize};

/// 宽高（像素）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 左闭右开矩形。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width(), self.height())
    }
}

/// 精度策略：输出尺寸与目标尺寸的贴合程度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Precision {
    /// 输出尺寸严格等于目标尺寸，多余部分按 `Scale` 裁掉。
    Exact,
    /// 输出像素总数不超过目标像素总数。
    #[default]
    LessPixels,
    /// 输出宽、高均不超过目标宽、高。
    SmallerSize,
}

impl Precision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "EXACT",
            Self::LessPixels => "LESS_PIXELS",
            Self::SmallerSize => "SMALLER_SIZE",
        }
    }
}

/// 裁剪策略，仅在 `Precision::Exact` 下生效。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Scale {
    StartCrop,
    #[default]
    CenterCrop,
    EndCrop,
    /// 不裁剪，整图拉伸到目标尺寸。
    Fill,
}

impl Scale {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartCrop => "START_CROP",
            Self::CenterCrop => "CENTER_CROP",
            Self::EndCrop => "END_CROP",
            Self::Fill => "FILL",
        }
    }
}

/// 一次解码使用的 (源矩形, 目标矩形)。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeMapping {
    pub src: Rect,
    pub dest: Rect,
}

impl ResizeMapping {
    pub fn identity(size: Size) -> Self {
        Self {
            src: Rect::from_size(size),
            dest: Rect::from_size(size),
        }
    }

    /// 源矩形与目标矩形完全一致（不裁剪、不缩放）。
    pub fn is_identity(&self) -> bool {
        self.src.left == 0 && self.src.top == 0 && self.src.size() == self.dest.size()
    }

    /// 仅裁剪、不缩放。
    pub fn is_crop_only(&self) -> bool {
        self.src.size() == self.dest.size()
    }
}

const SHRINK_STEP: f64 = 0.99;

/// 计算尺寸映射。任一尺寸面积为 0 时返回 `None`。
///
/// # 示例
/// ```rust
/// use image_pipeline::resize::{map, Precision, Rect, Scale, Size};
///
/// let mapping = map(Size::new(300, 500), Size::new(200, 200), Precision::Exact, Scale::CenterCrop)
///     .expect("non-degenerate sizes");
/// assert_eq!(mapping.dest, Rect::new(0, 0, 200, 200));
/// assert_eq!(mapping.src, Rect::new(0, 100, 300, 400));
/// ```
pub fn map(image: Size, target: Size, precision: Precision, scale: Scale) -> Option<ResizeMapping> {
    if image.is_empty() || target.is_empty() {
        return None;
    }

    if image == target {
        return Some(ResizeMapping::identity(image));
    }

    let mapping = match precision {
        Precision::Exact => map_exact(image, target, scale),
        Precision::LessPixels => {
            let limit = target.pixels() as f64;
            let dest = shrink(image, |w, h| w * h <= limit);
            ResizeMapping {
                src: Rect::from_size(image),
                dest: Rect::from_size(dest),
            }
        }
        Precision::SmallerSize => {
            let (max_w, max_h) = (f64::from(target.width), f64::from(target.height));
            let dest = shrink(image, |w, h| w <= max_w && h <= max_h);
            ResizeMapping {
                src: Rect::from_size(image),
                dest: Rect::from_size(dest),
            }
        }
    };

    Some(mapping)
}

fn map_exact(image: Size, target: Size, scale: Scale) -> ResizeMapping {
    let dest = Rect::from_size(target);
    if scale == Scale::Fill {
        return ResizeMapping {
            src: Rect::from_size(image),
            dest,
        };
    }

    // finalScale = min(iw/tw, ih/th)，交叉相乘比较，避免浮点误差
    let (iw, ih) = (u64::from(image.width), u64::from(image.height));
    let (tw, th) = (u64::from(target.width), u64::from(target.height));
    let (src_w, src_h) = if iw * th <= ih * tw {
        (iw, th * iw / tw)
    } else {
        (tw * ih / th, ih)
    };
    let src_w = src_w.clamp(1, iw) as u32;
    let src_h = src_h.clamp(1, ih) as u32;

    let (left, top) = match scale {
        Scale::StartCrop => (0, 0),
        Scale::CenterCrop => ((image.width - src_w) / 2, (image.height - src_h) / 2),
        Scale::EndCrop => (image.width - src_w, image.height - src_h),
        Scale::Fill => (0, 0),
    };

    ResizeMapping {
        src: Rect::new(left, top, left + src_w, top + src_h),
        dest,
    }
}

/// 以 1% 为步长等比缩小，直到 `fits` 成立；从不放大。
///
/// 每一步的比例都由步数直接求幂得到，约束按取整后的候选尺寸判断。
/// 候选尺寸最终会收敛到 1×1，而目标至少为 1×1，循环必然结束。
fn shrink(image: Size, fits: impl Fn(f64, f64) -> bool) -> Size {
    let (w, h) = (f64::from(image.width), f64::from(image.height));
    let mut steps: i32 = 0;
    loop {
        let scale = SHRINK_STEP.powi(steps);
        let candidate = Size::new(
            ((w * scale).floor() as u32).max(1),
            ((h * scale).floor() as u32).max(1),
        );
        if fits(f64::from(candidate.width), f64::from(candidate.height)) {
            return candidate;
        }
        steps += 1;
    }
}
