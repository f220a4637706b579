//! # 结果缓存
//!
//! 以 CacheKey 为键把“缩放 / 变换之后”的像素写入磁盘，下次同参数请求跳过获取与解码。
//! 只有结果与原图不同（发生缩放或应用了变换）时才写入，原样解码的结果不值得占用磁盘。
//!
//! 条目格式：数据文件为 RGBA 原始字节，元数据为 JSON（尺寸、原图信息、缩放映射、变换列表）。
//! 磁盘读写都在 `spawn_blocking` 中进行。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Chain, Interceptor};
use crate::ImageError;
use crate::cache::DiskCache;
use crate::executor::RequestState;
use crate::resize::ResizeMapping;
use crate::source::{Bitmap, DataFrom, DecodeResult, ImageInfo};

#[derive(Debug, Serialize, Deserialize)]
struct ResultMeta {
    width: u32,
    height: u32,
    info: ImageInfo,
    resize: Option<ResizeMapping>,
    transformations: Vec<String>,
}

pub struct ResultCacheDecodeInterceptor;

impl ResultCacheDecodeInterceptor {
    fn read(disk: &DiskCache, key: &str) -> Option<DecodeResult> {
        let snapshot = disk.get(key)?;

        let loaded = (|| -> Result<DecodeResult, ImageError> {
            let meta = snapshot
                .read_metadata()
                .map_err(|e| ImageError::Cache(format!("读取结果缓存元数据失败：{}", e)))?
                .ok_or_else(|| ImageError::Cache("结果缓存缺少元数据".to_string()))?;
            let meta: ResultMeta = serde_json::from_slice(&meta)
                .map_err(|e| ImageError::Cache(format!("结果缓存元数据损坏：{}", e)))?;
            let pixels = snapshot
                .read_data()
                .map_err(|e| ImageError::Cache(format!("读取结果缓存数据失败：{}", e)))?;

            Ok(DecodeResult {
                bitmap: Bitmap::new(meta.width, meta.height, pixels)?,
                info: meta.info,
                data_from: DataFrom::ResultCache,
                resize: meta.resize,
                transformations: meta.transformations,
            })
        })();

        match loaded {
            Ok(result) => Some(result),
            Err(err) => {
                log::warn!("⚠️ 结果缓存条目不可用，已删除 - key={} err={}", key, err);
                disk.remove(key);
                None
            }
        }
    }

    fn write(disk: &DiskCache, key: &str, result: &DecodeResult) -> Result<(), ImageError> {
        let Some(mut editor) = disk.edit(key) else {
            log::debug!("⏭️ 结果缓存条目正在被写入，跳过 - key={}", key);
            return Ok(());
        };

        let meta = ResultMeta {
            width: result.bitmap.width,
            height: result.bitmap.height,
            info: result.info.clone(),
            resize: result.resize,
            transformations: result.transformations.clone(),
        };
        let meta = serde_json::to_vec(&meta).map_err(|e| ImageError::Cache(format!("序列化结果缓存元数据失败：{}", e)))?;

        editor.write_data(&result.bitmap.pixels)?;
        editor.set_metadata(meta);
        editor.commit()?;
        Ok(())
    }

    fn worth_caching(result: &DecodeResult) -> bool {
        let resized = result.resize.is_some_and(|mapping| !mapping.is_identity());
        resized || !result.transformations.is_empty()
    }
}

#[async_trait]
impl Interceptor<DecodeResult> for ResultCacheDecodeInterceptor {
    fn key(&self) -> &str {
        "ResultCacheDecodeInterceptor"
    }

    fn sort_weight(&self) -> i32 {
        80
    }

    async fn intercept(&self, chain: Chain<'_, DecodeResult>) -> Result<DecodeResult, ImageError> {
        let ctx = chain.context();
        let Some(disk) = ctx.result_cache().cloned() else {
            return chain.proceed().await;
        };
        let policy = ctx.request().result_cache_policy();
        let key = ctx.cache_key().to_string();

        if policy.read {
            ctx.set_state(RequestState::CheckingResultCache);
            let hit = {
                let disk = disk.clone();
                let key = key.clone();
                tokio::task::spawn_blocking(move || Self::read(&disk, &key))
                    .await
                    .map_err(|e| ImageError::Cache(format!("结果缓存读取任务异常：{}", e)))?
            };
            if let Some(hit) = hit {
                log::debug!("💾 结果缓存命中 - key={}", key);
                return Ok(hit);
            }
        }

        let result = chain.proceed().await?;

        if policy.write && Self::worth_caching(&result) {
            let snapshot = result.clone();
            let written = tokio::task::spawn_blocking(move || Self::write(&disk, &key, &snapshot))
                .await
                .map_err(|e| ImageError::Cache(format!("结果缓存写入任务异常：{}", e)))?;
            // 写缓存失败不影响本次请求
            if let Err(err) = written {
                log::warn!("⚠️ 写入结果缓存失败：{}", err);
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resize::Size;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time went backwards")
            .as_nanos();
        std::env::temp_dir().join(format!("image-pipeline-result-{}-{}", name, nanos))
    }

    fn resized_result() -> DecodeResult {
        let mut result = crate::cache::image::tests::decoded(4, 2);
        result.resize = Some(ResizeMapping {
            src: crate::resize::Rect::new(0, 0, 8, 4),
            dest: crate::resize::Rect::new(0, 0, 4, 2),
        });
        result
    }

    #[test]
    fn stored_result_reads_back_as_result_cache() {
        let dir = unique_dir("roundtrip");
        let disk = DiskCache::open(&dir, 1 << 20).expect("open failed");
        let original = resized_result();

        ResultCacheDecodeInterceptor::write(&disk, "k", &original).expect("write failed");
        let loaded = ResultCacheDecodeInterceptor::read(&disk, "k").expect("entry missing");

        assert_eq!(loaded.data_from, DataFrom::ResultCache);
        assert_eq!(loaded.bitmap, original.bitmap);
        assert_eq!(loaded.resize, original.resize);
        assert_eq!(loaded.info, original.info);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_metadata_is_evicted() {
        let dir = unique_dir("corrupt");
        let disk = DiskCache::open(&dir, 1 << 20).expect("open failed");
        let mut editor = disk.edit("k").expect("editor busy");
        editor.write_data(&[1, 2, 3]).expect("write failed");
        editor.set_metadata(b"not json".to_vec());
        editor.commit().expect("commit failed");

        assert!(ResultCacheDecodeInterceptor::read(&disk, "k").is_none());
        assert!(!disk.exists("k"));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn only_changed_results_are_cached() {
        let mut plain = crate::cache::image::tests::decoded(4, 2);
        assert!(!ResultCacheDecodeInterceptor::worth_caching(&plain));

        plain.resize = Some(ResizeMapping::identity(Size::new(4, 2)));
        assert!(!ResultCacheDecodeInterceptor::worth_caching(&plain));

        plain.transformations.push("CircleCrop".to_string());
        assert!(ResultCacheDecodeInterceptor::worth_caching(&plain));
        assert!(ResultCacheDecodeInterceptor::worth_caching(&resized_result()));
    }
}
