//! # 内存缓存模块
//!
//! ## 设计思路
//!
//! 以 CacheKey 为键、按字节预算（而非条目数）限界的 LRU。
//! 缓存槽位本身就是一份 `RefKind::Cache` 持有，淘汰 / 替换 / 删除只是丢弃这份持有，
//! 像素是否真正释放由 `CachedImage` 的三级计数决定。
//!
//! ## 实现思路
//!
//! - 单把粗粒度锁保护 LRU 与字节计数，临界区内只做 O(1) 的映射操作。
//! - 被淘汰的持有先收集起来，出锁后再丢弃，像素归还复用池不占用缓存锁。
//! - `trim` 跳过正在显示或等待消费的条目，继续向 LRU 更前端寻找可淘汰项。

use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

use crate::cache::image::{CachedImage, ImageRef, RefKind};

pub struct MemoryCache {
    max_size: u64,
    inner: Mutex<MemoryInner>,
}

struct MemoryInner {
    entries: LruCache<String, ImageRef>,
    size: u64,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("size", &self.size())
            .field("max_size", &self.max_size)
            .field("len", &self.len())
            .finish()
    }
}

impl MemoryCache {
    pub fn new(max_size: u64) -> Self {
        Self {
            max_size,
            inner: Mutex::new(MemoryInner {
                entries: LruCache::unbounded(),
                size: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 命中时移到最近使用端，并返回一份新的 `Cache` 持有。
    pub fn get(&self, key: &str) -> Option<ImageRef> {
        let mut inner = self.lock();
        inner
            .entries
            .get(key)
            .map(|slot| slot.acquire(RefKind::Cache))
    }

    /// 写入条目。
    ///
    /// 同一 key 已有不同图片时先丢弃旧持有；空间不足时从 LRU 尾部淘汰直到放得下。
    /// 单张图片超过整个预算时拒绝写入，返回 `false`，且不淘汰任何条目。
    pub fn put(&self, key: &str, image: Arc<CachedImage>) -> bool {
        let cost = image.byte_count();
        if cost > self.max_size {
            log::warn!(
                "⚠️ 图片超过内存缓存预算，跳过缓存 - key={} bytes={} max={}",
                key,
                cost,
                self.max_size
            );
            return false;
        }

        let mut released = Vec::new();
        {
            let mut inner = self.lock();
            let same = inner
                .entries
                .get(key)
                .is_some_and(|slot| Arc::ptr_eq(slot.image(), &image));
            if same {
                return true;
            }

            if let Some(old) = inner.entries.pop(key) {
                inner.size = inner.size.saturating_sub(old.byte_count());
                released.push(old);
            }

            while inner.size + cost > self.max_size {
                let Some((evicted_key, old)) = inner.entries.pop_lru() else {
                    break;
                };
                log::debug!("🧹 内存缓存淘汰 - key={}", evicted_key);
                inner.size = inner.size.saturating_sub(old.byte_count());
                released.push(old);
            }

            inner.entries.put(key.to_string(), ImageRef::new(image, RefKind::Cache));
            inner.size += cost;
        }

        drop(released);
        true
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut inner = self.lock();
            let removed = inner.entries.pop(key);
            if let Some(old) = &removed {
                inner.size = inner.size.saturating_sub(old.byte_count());
            }
            removed
        };

        removed.is_some()
    }

    pub fn clear(&self) {
        let released: Vec<ImageRef> = {
            let mut inner = self.lock();
            inner.size = 0;
            let mut released = Vec::with_capacity(inner.entries.len());
            while let Some((_, old)) = inner.entries.pop_lru() {
                released.push(old);
            }
            released
        };

        log::debug!("🧹 清空内存缓存 - {} 条", released.len());
    }

    /// 从 LRU 尾部淘汰，直到占用不超过 `target_size`。
    ///
    /// 正在显示或等待消费的条目会被跳过；返回本次淘汰的字节数。
    pub fn trim(&self, target_size: u64) -> u64 {
        let mut released = Vec::new();
        let mut trimmed = 0;
        {
            let mut inner = self.lock();
            if inner.size <= target_size {
                return 0;
            }

            let mut remaining = inner.size;
            let victims: Vec<String> = inner
                .entries
                .iter()
                .rev()
                .filter_map(|(key, slot)| {
                    if remaining <= target_size {
                        return None;
                    }
                    let counts = slot.ref_counts();
                    if counts.display > 0 || counts.waiting_use > 0 {
                        return None;
                    }
                    remaining = remaining.saturating_sub(slot.byte_count());
                    Some(key.clone())
                })
                .collect();

            for key in victims {
                if let Some(old) = inner.entries.pop(&key) {
                    inner.size = inner.size.saturating_sub(old.byte_count());
                    trimmed += old.byte_count();
                    released.push(old);
                }
            }
        }

        log::debug!("🧹 内存缓存收缩 - 淘汰 {} 条 / {} bytes", released.len(), trimmed);
        trimmed
    }

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否存在，不改变 LRU 顺序。
    pub fn exists(&self, key: &str) -> bool {
        self.lock().entries.contains(key)
    }

    /// 所有 key，最近使用的在前。
    pub fn keys(&self) -> Vec<String> {
        self.lock().entries.iter().map(|(key, _)| key.clone()).collect()
    }
}
