//! # 引用计数图片
//!
//! ## 设计思路
//!
//! 解码后的像素可能同时被内存缓存、正在显示的视图、等待消费的调用方持有。
//! 三类持有关系各自计数，只有三者同时为 0 时才真正释放像素（归还复用池）。
//!
//! ## 实现思路
//!
//! - 计数只通过 `ImageRef`（RAII 句柄）增减：创建即 +1，`Drop` 即 -1，计数永不为负。
//! - 释放动作由最后一个 `Drop` 触发，且只执行一次；重复释放只记录异常日志。
//! - 像素归还复用池发生在锁外。

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::pool::BitmapPool;
use crate::resize::ResizeMapping;
use crate::source::{Bitmap, DataFrom, DecodeResult, ImageInfo};

/// 持有关系类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// 内存缓存槽位持有。
    Cache,
    /// 正在显示。
    Display,
    /// 已交付、等待调用方消费。
    WaitingUse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefCounts {
    pub cache: u32,
    pub display: u32,
    pub waiting_use: u32,
}

impl RefCounts {
    pub fn is_zero(&self) -> bool {
        self.cache == 0 && self.display == 0 && self.waiting_use == 0
    }

    fn slot(&mut self, kind: RefKind) -> &mut u32 {
        match kind {
            RefKind::Cache => &mut self.cache,
            RefKind::Display => &mut self.display,
            RefKind::WaitingUse => &mut self.waiting_use,
        }
    }
}

struct ImageState {
    counts: RefCounts,
    bitmap: Option<Bitmap>,
}

/// 内存缓存条目：像素 + 元数据 + 三级引用计数。
pub struct CachedImage {
    key: String,
    info: ImageInfo,
    data_from: DataFrom,
    resize: Option<ResizeMapping>,
    transformations: Vec<String>,
    width: u32,
    height: u32,
    byte_count: u64,
    state: Mutex<ImageState>,
    pool: Option<Arc<BitmapPool>>,
}

impl fmt::Debug for CachedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedImage")
            .field("key", &self.key)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("bytes", &self.byte_count)
            .field("counts", &self.ref_counts())
            .finish()
    }
}

impl CachedImage {
    pub fn new(key: impl Into<String>, result: DecodeResult, pool: Option<Arc<BitmapPool>>) -> Arc<Self> {
        let DecodeResult {
            bitmap,
            info,
            data_from,
            resize,
            transformations,
        } = result;

        Arc::new(Self {
            key: key.into(),
            info,
            data_from,
            resize,
            transformations,
            width: bitmap.width,
            height: bitmap.height,
            byte_count: bitmap.byte_count(),
            state: Mutex::new(ImageState {
                counts: RefCounts::default(),
                bitmap: Some(bitmap),
            }),
            pool,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    /// 首次解码时的数据出处。
    pub fn data_from(&self) -> DataFrom {
        self.data_from
    }

    pub fn resize(&self) -> Option<ResizeMapping> {
        self.resize
    }

    pub fn transformations(&self) -> &[String] {
        &self.transformations
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// 像素占用字节数，释放后仍保留原值用于统计。
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    pub fn ref_counts(&self) -> RefCounts {
        self.lock_state().counts
    }

    pub fn is_freed(&self) -> bool {
        self.lock_state().bitmap.is_none()
    }

    /// 在锁内访问像素；已释放时返回 `None`。
    pub fn with_bitmap<R>(&self, f: impl FnOnce(&Bitmap) -> R) -> Option<R> {
        self.lock_state().bitmap.as_ref().map(f)
    }

    fn lock_state(&self) -> MutexGuard<'_, ImageState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn acquire(&self, kind: RefKind) {
        let mut state = self.lock_state();
        if state.bitmap.is_none() {
            log::warn!("⚠️ 引用已释放的图片 - key={} kind={:?}", self.key, kind);
        }
        *state.counts.slot(kind) += 1;
    }

    fn release(&self, kind: RefKind) {
        let freed = {
            let mut state = self.lock_state();
            let slot = state.counts.slot(kind);
            if *slot == 0 {
                log::warn!("⚠️ 引用计数下溢已忽略 - key={} kind={:?}", self.key, kind);
                return;
            }
            *slot -= 1;

            if state.counts.is_zero() {
                self.take_bitmap(&mut state)
            } else {
                None
            }
        };

        self.recycle(freed);
    }

    /// 取出像素，只有第一次调用能拿到；重复释放只记日志。
    fn take_bitmap(&self, state: &mut ImageState) -> Option<Bitmap> {
        let bitmap = state.bitmap.take();
        if bitmap.is_none() {
            log::warn!("⚠️ 重复释放图片像素已忽略 - key={}", self.key);
        }
        bitmap
    }

    fn recycle(&self, bitmap: Option<Bitmap>) {
        let Some(bitmap) = bitmap else {
            return;
        };
        log::debug!("♻️ 释放图片像素 - key={} bytes={}", self.key, bitmap.pixels.len());
        if let Some(pool) = &self.pool {
            pool.recycle(bitmap.pixels);
        }
    }

    #[cfg(test)]
    fn force_free(&self) {
        let freed = {
            let mut state = self.lock_state();
            self.take_bitmap(&mut state)
        };
        self.recycle(freed);
    }
}

/// 一份计数持有关系；`Drop` 时自动归还。
pub struct ImageRef {
    image: Arc<CachedImage>,
    kind: RefKind,
}

impl ImageRef {
    pub fn new(image: Arc<CachedImage>, kind: RefKind) -> Self {
        image.acquire(kind);
        Self { image, kind }
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    pub fn image(&self) -> &Arc<CachedImage> {
        &self.image
    }

    /// 另开一份同一图片的其他类别持有。
    pub fn acquire(&self, kind: RefKind) -> ImageRef {
        Self::new(Arc::clone(&self.image), kind)
    }

    /// 转为显示持有：先增加 display，再归还当前持有，避免中途归零被释放。
    pub fn into_display(self) -> ImageRef {
        self.acquire(RefKind::Display)
    }
}

impl Clone for ImageRef {
    fn clone(&self) -> Self {
        self.acquire(self.kind)
    }
}

impl Drop for ImageRef {
    fn drop(&mut self) {
        self.image.release(self.kind);
    }
}

impl Deref for ImageRef {
    type Target = CachedImage;

    fn deref(&self) -> &Self::Target {
        &self.image
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRef")
            .field("kind", &self.kind)
            .field("image", &self.image)
            .finish()
    }
}
