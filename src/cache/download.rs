//! # 下载缓存
//!
//! ## 设计思路
//!
//! 以 DownloadCacheKey 为键缓存原始字节，叠加进行中请求去重：
//! - 磁盘命中直接返回，出处为 `DOWNLOAD_CACHE`
//! - 未命中时同一 key 只有一个调用方真正下载，其余调用方等待并共享同一结果（成功或失败）
//!
//! ## 实现思路
//!
//! - 下载闭包拿到 `DownloadSink`，下载过程中只追加到内存缓冲。
//! - 下载成功后在 `spawn_blocking` 中一次性写入磁盘编辑器并提交，元数据（MIME、长度）以 JSON 形式随条目保存。
//! - 磁盘命中只在阻塞线程里打开条目、读元数据，返回 `DataSource::DiskCache`，字节留给解码阶段读取。
//! - 下载失败或 future 被丢弃（取消）时，编辑器随 sink 一起被丢弃，自动 abort。

use std::future::Future;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ImageError;
use crate::cache::disk::{DiskCache, Editor};
use crate::cache::inflight::{Flight, InFlightRegistry};
use crate::request::CachePolicy;
use crate::source::{DataFrom, DataSource, sniff_mime};

const FALLBACK_MIME: &str = "application/octet-stream";

/// 下载结果。
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub source: DataSource,
    pub mime_type: String,
    pub content_length: u64,
}

impl Downloaded {
    pub fn data_from(&self) -> DataFrom {
        self.source.data_from()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DownloadMeta {
    mime_type: String,
    content_length: u64,
}

/// 下载写入端。
#[derive(Debug)]
pub struct DownloadSink {
    key: String,
    editor: Option<Editor>,
    buffer: Vec<u8>,
    mime_type: Option<String>,
}

impl DownloadSink {
    fn new(key: &str, editor: Option<Editor>) -> Self {
        Self {
            key: key.to_string(),
            editor,
            buffer: Vec::new(),
            mime_type: None,
        }
    }

    /// 仅内存缓冲、不落盘的 sink。
    pub fn detached(key: &str) -> Self {
        Self::new(key, None)
    }

    /// 追加一块数据。
    pub fn write(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn set_mime_type(&mut self, mime_type: impl Into<String>) {
        self.mime_type = Some(mime_type.into());
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// 结束下载；有编辑器时落盘提交，写缓存失败只记日志。
    async fn finish(self) -> Downloaded {
        let Self {
            key,
            editor,
            buffer,
            mime_type,
        } = self;

        let mime_type = mime_type
            .or_else(|| sniff_mime(&buffer).map(str::to_string))
            .unwrap_or_else(|| FALLBACK_MIME.to_string());
        let bytes = Bytes::from(buffer);
        let content_length = bytes.len() as u64;

        if let Some(editor) = editor {
            let meta = DownloadMeta {
                mime_type: mime_type.clone(),
                content_length,
            };
            let data = bytes.clone();
            let stored = tokio::task::spawn_blocking(move || store(editor, &data, &meta))
                .await
                .map_err(|e| ImageError::Cache(format!("下载缓存写入任务异常：{}", e)))
                .and_then(|stored| stored);
            if let Err(err) = stored {
                log::warn!("⚠️ 下载缓存写入失败，本次不落盘 - key={} err={}", key, err);
            }
        }

        Downloaded {
            source: DataSource::Bytes {
                bytes,
                from: DataFrom::Network,
            },
            mime_type,
            content_length,
        }
    }
}

fn store(mut editor: Editor, data: &[u8], meta: &DownloadMeta) -> Result<(), ImageError> {
    let meta = serde_json::to_vec(meta).map_err(|e| ImageError::Cache(format!("下载缓存元数据序列化失败：{}", e)))?;
    editor.write_data(data)?;
    editor.set_metadata(meta);
    editor.commit()?;
    Ok(())
}

/// 原始字节缓存 + 进行中下载去重。
#[derive(Debug)]
pub struct DownloadCache {
    disk: Option<DiskCache>,
    inflight: InFlightRegistry<Downloaded>,
}

impl DownloadCache {
    pub fn new(disk: Option<DiskCache>) -> Self {
        Self {
            disk,
            inflight: InFlightRegistry::new(),
        }
    }

    pub fn disk(&self) -> Option<&DiskCache> {
        self.disk.as_ref()
    }

    /// 磁盘上是否已有该 key 的已提交条目（不更新访问顺序）。
    pub fn contains(&self, key: &str) -> bool {
        self.disk.as_ref().is_some_and(|disk| disk.exists(key))
    }

    /// 当前正在下载的 key 数量。
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// 查找已缓存的条目。只读元数据，字节由返回的 `DataSource` 按需读取。
    pub async fn read(&self, key: &str) -> Option<Downloaded> {
        let disk = self.disk.clone()?;
        let owned_key = key.to_string();
        match tokio::task::spawn_blocking(move || read_entry(&disk, &owned_key)).await {
            Ok(hit) => hit,
            Err(err) => {
                log::warn!("⚠️ 下载缓存读取任务异常 - key={} err={}", key, err);
                None
            }
        }
    }

    /// 获取原始字节：磁盘命中 → 加入进行中的同 key 下载 → 自己下载。
    ///
    /// `download` 只会在当前调用方成为下载所有者时被调用一次。
    pub async fn fetch<F, Fut>(&self, key: &str, policy: CachePolicy, download: F) -> Result<Downloaded, ImageError>
    where
        F: FnOnce(DownloadSink) -> Fut,
        Fut: Future<Output = Result<DownloadSink, ImageError>>,
    {
        if policy.read {
            if let Some(hit) = self.read(key).await {
                log::debug!("💾 下载缓存命中 - key={}", key);
                return Ok(hit);
            }
        }

        let owner = loop {
            match self.inflight.join(key) {
                Flight::Owner(owner) => break owner,
                Flight::Waiter(waiter) => {
                    log::debug!("🔗 加入进行中的下载 - key={}", key);
                    if let Some(result) = waiter.wait().await {
                        return result;
                    }
                }
            }
        };

        // 等待所有权期间，前一个所有者可能已经写好了缓存
        if policy.read {
            if let Some(hit) = self.read(key).await {
                owner.finish(Ok(hit.clone()));
                return Ok(hit);
            }
        }

        let editor = match (&self.disk, policy.write) {
            (Some(disk), true) => disk.edit(key),
            _ => None,
        };
        let result = match download(DownloadSink::new(key, editor)).await {
            Ok(sink) => Ok(sink.finish().await),
            Err(err) => Err(err),
        };
        match &result {
            // 所有者自己被取消，等待者重新竞争所有权
            Err(err) if err.is_cancelled() => drop(owner),
            _ => owner.finish(result.clone()),
        }
        result
    }
}

fn read_entry(disk: &DiskCache, key: &str) -> Option<Downloaded> {
    let snapshot = disk.get(key)?;
    let meta = match snapshot.read_metadata() {
        Ok(meta) => meta,
        Err(err) => {
            log::warn!("⚠️ 下载缓存条目不可读，已删除 - key={} err={}", key, err);
            disk.remove(key);
            return None;
        }
    };

    // 没有可用元数据时交给解码阶段按签名识别
    let mime_type = meta
        .and_then(|meta| serde_json::from_slice::<DownloadMeta>(&meta).ok())
        .map(|meta| meta.mime_type)
        .unwrap_or_else(|| FALLBACK_MIME.to_string());

    Some(Downloaded {
        content_length: snapshot.len(),
        source: DataSource::DiskCache {
            snapshot,
            from: DataFrom::DownloadCache,
        },
        mime_type,
    })
}
