//! # 磁盘缓存模块
//!
//! ## 设计思路
//!
//! 下载缓存与结果缓存共用的键值磁盘存储，读写分离：
//! - 读：`get` 返回已提交条目的 `Snapshot`，写入中的条目对读者不可见
//! - 写：`edit` 返回独占的 `Editor`，同一 key 同时最多一个编辑者；
//!   `commit` 原子可见，`abort`（或直接丢弃 Editor）不留任何痕迹
//!
//! ## 实现思路
//!
//! - 每个条目是一个文件 `<sha256(key)>.bin`：`[数据][元数据][尾部]`，
//!   尾部为 `元数据长度(u64 LE) + 是否有元数据(u8) + 魔数`。
//!   数据与元数据在同一文件里，一次 rename 同时发布，读者不会看到新旧混合的条目。
//! - 写入先落到 `.tmp`，提交时追加元数据与尾部、落盘后 rename 覆盖正式文件。
//! - `Snapshot` 在 `get` 时打开文件并持有句柄，之后的覆盖写不影响已打开的快照。
//! - 内存中维护 LRU 索引（hash → 字节数 + 代号），打开目录时按修改时间重建，并清理残留 `.tmp`。
//! - 锁内只做索引操作；文件打开、stat、删除都在锁外进行。
//!   锁外发现文件缺失或损坏时，只有代号未变才把条目移出索引，避免误删并发提交的新条目。

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::ImageError;

const DATA_SUFFIX: &str = ".bin";
const TMP_SUFFIX: &str = ".tmp";
const ENTRY_MAGIC: &[u8; 4] = b"IPC1";
const TRAILER_LEN: u64 = 8 + 1 + 4;

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn hash_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(64);
    for &b in digest.iter() {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

fn cache_io_error(action: &str, path: &Path, err: io::Error) -> ImageError {
    ImageError::Cache(format!("{}失败 {}：{}", action, path.display(), err))
}

fn remove_if_exists(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            log::warn!("⚠️ 删除缓存文件失败 - path={} err={}", path.display(), err);
        }
    }
}

fn corrupt(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.to_string())
}

fn encode_trailer(metadata: Option<&[u8]>) -> [u8; TRAILER_LEN as usize] {
    let mut trailer = [0u8; TRAILER_LEN as usize];
    let meta_len = metadata.map_or(0, |meta| meta.len() as u64);
    trailer[..8].copy_from_slice(&meta_len.to_le_bytes());
    trailer[8] = u8::from(metadata.is_some());
    trailer[9..].copy_from_slice(ENTRY_MAGIC);
    trailer
}

/// 解析尾部，返回（数据长度，元数据长度）。
fn read_layout(file: &mut File) -> io::Result<(u64, Option<u64>)> {
    let file_len = file.metadata()?.len();
    if file_len < TRAILER_LEN {
        return Err(corrupt("缓存条目长度不足"));
    }

    let mut trailer = [0u8; TRAILER_LEN as usize];
    file.seek(SeekFrom::Start(file_len - TRAILER_LEN))?;
    file.read_exact(&mut trailer)?;
    if &trailer[9..] != ENTRY_MAGIC {
        return Err(corrupt("缓存条目尾部标记不匹配"));
    }

    let mut meta_len = [0u8; 8];
    meta_len.copy_from_slice(&trailer[..8]);
    let meta_len = u64::from_le_bytes(meta_len);
    let body_len = file_len - TRAILER_LEN;
    if meta_len > body_len {
        return Err(corrupt("缓存条目元数据长度越界"));
    }

    let metadata = (trailer[8] == 1).then_some(meta_len);
    Ok((body_len - meta_len, metadata))
}

/// 已提交条目的只读视图。持有打开的文件句柄，读到的始终是同一版本。
#[derive(Debug, Clone)]
pub struct Snapshot {
    key: String,
    path: PathBuf,
    file: Arc<Mutex<File>>,
    data_len: u64,
    meta_len: Option<u64>,
}

impl Snapshot {
    fn open(key: &str, path: PathBuf) -> io::Result<Self> {
        let mut file = File::open(&path)?;
        let (data_len, meta_len) = read_layout(&mut file)?;
        Ok(Self {
            key: key.to_string(),
            path,
            file: Arc::new(Mutex::new(file)),
            data_len,
            meta_len,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 数据部分的字节数。
    pub fn len(&self) -> u64 {
        self.data_len
    }

    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    fn read_range(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let len = usize::try_from(len).map_err(|_| corrupt("缓存条目过大"))?;
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_data(&self) -> io::Result<Vec<u8>> {
        self.read_range(0, self.data_len)
    }

    /// 读取元数据；条目没有写入元数据时返回 `None`。
    pub fn read_metadata(&self) -> io::Result<Option<Vec<u8>>> {
        match self.meta_len {
            Some(meta_len) => self.read_range(self.data_len, meta_len).map(Some),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    bytes: u64,
    generation: u64,
}

struct DiskInner {
    index: LruCache<String, Slot>,
    size: u64,
    editing: HashSet<String>,
    next_generation: u64,
}

struct DiskShared {
    dir: PathBuf,
    max_size: u64,
    inner: Mutex<DiskInner>,
}

impl DiskShared {
    fn lock(&self) -> MutexGuard<'_, DiskInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn data_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}{DATA_SUFFIX}"))
    }

    fn remove_files(&self, hash: &str) {
        remove_if_exists(&self.data_path(hash));
    }

    /// 代号未变时移出索引，返回是否移除。
    fn forget(&self, hash: &str, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.index.peek(hash).is_none_or(|slot| slot.generation != generation) {
            return false;
        }
        if let Some(slot) = inner.index.pop(hash) {
            inner.size = inner.size.saturating_sub(slot.bytes);
        }
        true
    }

    /// 在锁内挑出需要淘汰的条目并移出索引，返回待删除的 hash。
    fn evict_locked(&self, inner: &mut DiskInner, keep: Option<&str>) -> Vec<String> {
        if inner.size <= self.max_size {
            return Vec::new();
        }

        let mut remaining = inner.size;
        let victims: Vec<String> = inner
            .index
            .iter()
            .rev()
            .filter_map(|(hash, slot)| {
                if remaining <= self.max_size {
                    return None;
                }
                if inner.editing.contains(hash) || keep == Some(hash.as_str()) {
                    return None;
                }
                remaining = remaining.saturating_sub(slot.bytes);
                Some(hash.clone())
            })
            .collect();

        for hash in &victims {
            if let Some(slot) = inner.index.pop(hash) {
                inner.size = inner.size.saturating_sub(slot.bytes);
            }
        }
        victims
    }
}

/// 带字节预算的 LRU 磁盘缓存。克隆后共享同一份索引。
#[derive(Clone)]
pub struct DiskCache {
    shared: Arc<DiskShared>,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("dir", &self.shared.dir)
            .field("size", &self.size())
            .field("max_size", &self.shared.max_size)
            .finish()
    }
}

impl DiskCache {
    /// 打开（必要时创建）缓存目录，并按文件修改时间重建 LRU 索引。
    pub fn open(dir: impl Into<PathBuf>, max_size: u64) -> Result<Self, ImageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| cache_io_error("创建缓存目录", &dir, e))?;

        let mut found: Vec<(String, u64, SystemTime)> = Vec::new();
        let read_dir = fs::read_dir(&dir).map_err(|e| cache_io_error("读取缓存目录", &dir, e))?;
        for entry in read_dir.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };

            if name.ends_with(TMP_SUFFIX) {
                remove_if_exists(&path);
                continue;
            }

            let Some(hash) = name.strip_suffix(DATA_SUFFIX) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((hash.to_string(), meta.len().saturating_sub(TRAILER_LEN), modified));
        }

        found.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));
        let mut index = LruCache::unbounded();
        let mut size = 0;
        let mut next_generation = 0;
        for (hash, bytes, _) in found {
            size += bytes;
            next_generation += 1;
            index.put(
                hash,
                Slot {
                    bytes,
                    generation: next_generation,
                },
            );
        }

        let cache = Self {
            shared: Arc::new(DiskShared {
                dir,
                max_size,
                inner: Mutex::new(DiskInner {
                    index,
                    size,
                    editing: HashSet::new(),
                    next_generation,
                }),
            }),
        };

        let victims = {
            let mut inner = cache.shared.lock();
            cache.shared.evict_locked(&mut inner, None)
        };
        for hash in &victims {
            cache.shared.remove_files(hash);
        }

        log::info!(
            "✅ 磁盘缓存已打开 - dir={} entries={} size={} max={}",
            cache.shared.dir.display(),
            cache.len(),
            cache.size(),
            max_size
        );
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// 读取已提交条目；命中时刷新 LRU 位置与文件修改时间。
    ///
    /// 会打开文件，属于阻塞 I/O，异步上下文中应放进 `spawn_blocking`。
    pub fn get(&self, key: &str) -> Option<Snapshot> {
        let hash = hash_key(key);
        let generation = self.shared.lock().index.get(&hash)?.generation;

        let path = self.shared.data_path(&hash);
        let snapshot = match Snapshot::open(key, path.clone()) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                if self.shared.forget(&hash, generation) {
                    if err.kind() == io::ErrorKind::NotFound {
                        log::debug!("🔍 缓存文件已不存在，移出索引 - key={}", key);
                    } else {
                        log::warn!("⚠️ 缓存条目不可读，已删除 - key={} err={}", key, err);
                        remove_if_exists(&path);
                    }
                }
                return None;
            }
        };

        if let Ok(file) = File::options().write(true).open(&path) {
            let _ = file.set_modified(SystemTime::now());
        }
        Some(snapshot)
    }

    /// 开始写入；同一 key 已有编辑者时返回 `None`。不做文件 I/O。
    pub fn edit(&self, key: &str) -> Option<Editor> {
        let hash = hash_key(key);
        {
            let mut inner = self.shared.lock();
            if !inner.editing.insert(hash.clone()) {
                return None;
            }
        }

        let data_path = self.shared.data_path(&hash);
        Some(Editor {
            shared: Arc::clone(&self.shared),
            key: key.to_string(),
            tmp_path: append_suffix(&data_path, TMP_SUFFIX),
            data_path,
            hash,
            file: None,
            written: 0,
            metadata: None,
            finished: false,
        })
    }

    /// 是否存在已提交条目，不改变 LRU 顺序。
    pub fn exists(&self, key: &str) -> bool {
        self.shared.lock().index.contains(&hash_key(key))
    }

    pub fn remove(&self, key: &str) -> bool {
        let hash = hash_key(key);
        let removed = {
            let mut inner = self.shared.lock();
            let removed = inner.index.pop(&hash);
            if let Some(slot) = removed {
                inner.size = inner.size.saturating_sub(slot.bytes);
            }
            removed.is_some()
        };

        if removed {
            self.shared.remove_files(&hash);
        }
        removed
    }

    /// 删除所有已提交条目；进行中的编辑不受影响。
    pub fn clear(&self) {
        let hashes: Vec<String> = {
            let mut inner = self.shared.lock();
            inner.size = 0;
            let mut hashes = Vec::with_capacity(inner.index.len());
            while let Some((hash, _)) = inner.index.pop_lru() {
                hashes.push(hash);
            }
            hashes
        };

        for hash in &hashes {
            self.shared.remove_files(hash);
        }
        log::info!("🧹 清空磁盘缓存 - dir={} 条目={}", self.shared.dir.display(), hashes.len());
    }

    pub fn size(&self) -> u64 {
        self.shared.lock().size
    }

    pub fn max_size(&self) -> u64 {
        self.shared.max_size
    }

    pub fn len(&self) -> usize {
        self.shared.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 独占写入句柄。未提交就丢弃等同于 `abort`。
pub struct Editor {
    shared: Arc<DiskShared>,
    key: String,
    hash: String,
    data_path: PathBuf,
    tmp_path: PathBuf,
    file: Option<File>,
    written: u64,
    metadata: Option<Vec<u8>>,
    finished: bool,
}

impl std::fmt::Debug for Editor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("key", &self.key)
            .field("written", &self.written)
            .finish()
    }
}

impl Editor {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn tmp_file(&mut self) -> Result<&mut File, ImageError> {
        if self.file.is_none() {
            let file = File::create(&self.tmp_path).map_err(|e| cache_io_error("创建临时文件", &self.tmp_path, e))?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| ImageError::Cache("临时文件句柄丢失".to_string()))
    }

    /// 追加数据到临时文件。
    pub fn write_data(&mut self, chunk: &[u8]) -> Result<(), ImageError> {
        let tmp_path = self.tmp_path.clone();
        self.tmp_file()?
            .write_all(chunk)
            .map_err(|e| cache_io_error("写入临时文件", &tmp_path, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn set_metadata(&mut self, metadata: Vec<u8>) {
        self.metadata = Some(metadata);
    }

    /// 提交：补齐元数据与尾部，一次 rename 发布，随后按预算淘汰旧条目。
    pub fn commit(mut self) -> Result<Snapshot, ImageError> {
        let result = self.persist();
        self.finished = true;

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(err) => {
                self.cleanup();
                return Err(err);
            }
        };

        // 先打开新文件，之后的覆盖写不会影响返回的快照
        let snapshot = Snapshot::open(&self.key, self.data_path.clone());

        let victims = {
            let mut inner = self.shared.lock();
            inner.editing.remove(&self.hash);
            if let Some(old) = inner.index.pop(&self.hash) {
                inner.size = inner.size.saturating_sub(old.bytes);
            }
            inner.next_generation += 1;
            let slot = Slot {
                bytes,
                generation: inner.next_generation,
            };
            inner.index.put(self.hash.clone(), slot);
            inner.size += bytes;
            self.shared.evict_locked(&mut inner, Some(&self.hash))
        };

        for hash in &victims {
            log::debug!("🧹 磁盘缓存淘汰 - hash={}", hash);
            self.shared.remove_files(hash);
        }

        snapshot.map_err(|e| cache_io_error("打开已提交条目", &self.data_path, e))
    }

    /// 放弃写入，删除临时文件。
    pub fn abort(mut self) {
        self.finished = true;
        self.cleanup();
    }

    fn persist(&mut self) -> Result<u64, ImageError> {
        let metadata = self.metadata.take();
        let trailer = encode_trailer(metadata.as_deref());
        let tmp_path = self.tmp_path.clone();

        let file = self.tmp_file()?;
        if let Some(metadata) = &metadata {
            file.write_all(metadata)
                .map_err(|e| cache_io_error("写入元数据", &tmp_path, e))?;
        }
        file.write_all(&trailer)
            .map_err(|e| cache_io_error("写入条目尾部", &tmp_path, e))?;
        file.sync_all().map_err(|e| cache_io_error("刷新临时文件", &tmp_path, e))?;
        self.file = None;

        fs::rename(&self.tmp_path, &self.data_path).map_err(|e| cache_io_error("提交条目", &self.data_path, e))?;
        Ok(self.written + metadata.map_or(0, |meta| meta.len() as u64))
    }

    fn cleanup(&mut self) {
        self.file = None;
        remove_if_exists(&self.tmp_path);
        self.shared.lock().editing.remove(&self.hash);
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.finished {
            log::debug!("🗑️ 缓存写入未提交，已放弃 - key={}", self.key);
            self.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time went backwards")
            .as_nanos();
        std::env::temp_dir().join(format!("image-pipeline-disk-{}-{}", name, nanos))
    }

    fn put(cache: &DiskCache, key: &str, data: &[u8]) -> Snapshot {
        let mut editor = cache.edit(key).expect("editor");
        editor.write_data(data).expect("write failed");
        editor.commit().expect("commit failed")
    }

    #[test]
    fn committed_entry_is_readable_with_metadata() {
        let dir = unique_dir("commit");
        let cache = DiskCache::open(&dir, 1024).expect("open failed");

        let mut editor = cache.edit("https://a/img.png").expect("editor");
        editor.write_data(b"hello ").expect("write failed");
        editor.write_data(b"world").expect("write failed");
        editor.set_metadata(b"{\"mime\":\"image/png\"}".to_vec());
        assert!(cache.get("https://a/img.png").is_none());
        editor.commit().expect("commit failed");

        let snapshot = cache.get("https://a/img.png").expect("hit");
        assert_eq!(snapshot.read_data().expect("read failed"), b"hello world");
        assert_eq!(
            snapshot.read_metadata().expect("read failed"),
            Some(b"{\"mime\":\"image/png\"}".to_vec())
        );
        assert_eq!(cache.size(), 11 + 20);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn only_one_editor_per_key() {
        let dir = unique_dir("exclusive");
        let cache = DiskCache::open(&dir, 1024).expect("open failed");

        let editor = cache.edit("k").expect("editor");
        assert!(cache.edit("k").is_none());
        assert!(cache.edit("other").is_some());

        drop(editor);
        assert!(cache.edit("k").is_some());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn aborted_or_dropped_editor_leaves_nothing() {
        let dir = unique_dir("abort");
        let cache = DiskCache::open(&dir, 1024).expect("open failed");

        let mut editor = cache.edit("a").expect("editor");
        editor.write_data(b"partial").expect("write failed");
        editor.abort();

        let mut editor = cache.edit("b").expect("editor");
        editor.write_data(b"partial").expect("write failed");
        drop(editor);

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert!(cache.is_empty());
        let leftovers = fs::read_dir(&dir).expect("read_dir failed").count();
        assert_eq!(leftovers, 0);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn eviction_follows_lru_order_and_skips_open_editors() {
        let dir = unique_dir("evict");
        let cache = DiskCache::open(&dir, 30).expect("open failed");

        put(&cache, "a", &[1; 10]);
        put(&cache, "b", &[2; 10]);
        put(&cache, "c", &[3; 10]);
        assert!(cache.get("a").is_some());

        // b 最旧，但正在被重新写入，不能淘汰
        let pending = cache.edit("b").expect("editor");
        put(&cache, "d", &[4; 10]);

        assert!(cache.exists("a"));
        assert!(cache.exists("b"));
        assert!(!cache.exists("c"));
        assert!(cache.exists("d"));
        assert_eq!(cache.size(), 30);
        drop(pending);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn reopen_rebuilds_index_and_drops_temp_files() {
        let dir = unique_dir("reopen");
        {
            let cache = DiskCache::open(&dir, 1024).expect("open failed");
            put(&cache, "a", &[1; 10]);
            put(&cache, "b", &[2; 20]);
        }
        fs::write(dir.join("stale.bin.tmp"), b"junk").expect("write failed");

        let cache = DiskCache::open(&dir, 1024).expect("open failed");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.size(), 30);
        assert_eq!(cache.get("b").expect("hit").read_data().expect("read failed"), vec![2; 20]);
        assert!(!dir.join("stale.bin.tmp").exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn overwrite_replaces_size_accounting() {
        let dir = unique_dir("overwrite");
        let cache = DiskCache::open(&dir, 1024).expect("open failed");

        put(&cache, "a", &[1; 10]);
        put(&cache, "a", &[2; 4]);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 4);
        assert_eq!(cache.get("a").expect("hit").read_data().expect("read failed"), vec![2; 4]);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn remove_and_clear_delete_files() {
        let dir = unique_dir("clear");
        let cache = DiskCache::open(&dir, 1024).expect("open failed");

        put(&cache, "a", b"1");
        put(&cache, "b", b"2");
        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert!(cache.get("a").is_none());

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        assert_eq!(fs::read_dir(&dir).expect("read_dir failed").count(), 0);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn concurrent_commits_never_mix_data_and_metadata() {
        let dir = unique_dir("atomic");
        let cache = DiskCache::open(&dir, 1 << 20).expect("open failed");
        put(&cache, "k", b"seed");

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer = {
            let cache = cache.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut round = 0u32;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let payload = if round % 2 == 0 { vec![b'A'; 64] } else { vec![b'B'; 32] };
                    if let Some(mut editor) = cache.edit("k") {
                        editor.write_data(&payload).expect("write failed");
                        editor.set_metadata(payload);
                        editor.commit().expect("commit failed");
                    }
                    round += 1;
                }
            })
        };

        let mut checked = 0;
        for _ in 0..2000 {
            let Some(snapshot) = cache.get("k") else {
                continue;
            };
            let data = snapshot.read_data().expect("read failed");
            match snapshot.read_metadata().expect("read failed") {
                Some(meta) => assert_eq!(meta, data),
                None => assert_eq!(data, b"seed"),
            }
            checked += 1;
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        writer.join().expect("writer panicked");

        assert!(checked > 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn snapshot_survives_later_overwrite() {
        let dir = unique_dir("snapshot");
        let cache = DiskCache::open(&dir, 1024).expect("open failed");

        let old = put(&cache, "k", b"first");
        assert_eq!(old.read_metadata().expect("read failed"), None);
        let mut editor = cache.edit("k").expect("editor");
        editor.write_data(b"second!").expect("write failed");
        editor.set_metadata(b"m".to_vec());
        editor.commit().expect("commit failed");

        assert_eq!(old.read_data().expect("read failed"), b"first");
        let fresh = cache.get("k").expect("hit");
        assert_eq!(fresh.len(), 7);
        assert_eq!(fresh.read_data().expect("read failed"), b"second!");
        assert_eq!(fresh.read_metadata().expect("read failed"), Some(b"m".to_vec()));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn file_deleted_externally_is_dropped_from_index() {
        let dir = unique_dir("vanished");
        let cache = DiskCache::open(&dir, 1024).expect("open failed");

        let snapshot = put(&cache, "a", &[1; 10]);
        put(&cache, "b", &[2; 5]);
        fs::remove_file(snapshot.path()).expect("remove failed");

        assert!(cache.get("a").is_none());
        assert!(!cache.exists("a"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 5);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_entry_is_removed_on_read() {
        let dir = unique_dir("corrupt");
        let cache = DiskCache::open(&dir, 1024).expect("open failed");

        let snapshot = put(&cache, "a", &[1; 10]);
        let path = snapshot.path().to_path_buf();
        drop(snapshot);
        fs::write(&path, b"not a cache entry").expect("write failed");

        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        assert!(!path.exists());

        let _ = fs::remove_dir_all(dir);
    }
}
