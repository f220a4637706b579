//! 本地文件：`file://` URI 或绝对路径。

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Fetcher, FetcherFactory, as_mb, strip_scheme};
use crate::ImageError;
use crate::context::RequestContext;
use crate::source::{DataFrom, DataSource, FetchResult, sniff_mime};

const SNIFF_BYTES: usize = 64;

pub struct FileUriFetcherFactory;

impl FetcherFactory for FileUriFetcherFactory {
    fn key(&self) -> &str {
        "FileUriFetcher"
    }

    fn create(&self, ctx: &RequestContext) -> Option<Box<dyn Fetcher>> {
        let uri = ctx.request().uri();
        let path = if strip_scheme(uri, "file://").is_some() {
            reqwest::Url::parse(uri).ok()?.to_file_path().ok()?
        } else if Path::new(uri).is_absolute() {
            PathBuf::from(uri)
        } else {
            return None;
        };
        Some(Box::new(FileUriFetcher { path }))
    }
}

pub struct FileUriFetcher {
    path: PathBuf,
}

impl FileUriFetcher {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Fetcher for FileUriFetcher {
    async fn fetch(&self, ctx: &RequestContext) -> Result<FetchResult, ImageError> {
        open_local(self.path.clone(), ctx.config().max_file_size).await
    }
}

/// 校验存在性与体积，嗅探 MIME，返回惰性读取的文件来源。
pub(super) async fn open_local(path: PathBuf, max_file_size: u64) -> Result<FetchResult, ImageError> {
    tokio::task::spawn_blocking(move || {
        log::debug!("📁 读取本地图片 - 路径: {}", path.display());

        let metadata = std::fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ImageError::FetchFailed(format!("文件不存在：{}", path.display()))
            } else {
                ImageError::FetchFailed(format!("无法读取文件信息：{}", e))
            }
        })?;

        if !metadata.is_file() {
            return Err(ImageError::FetchFailed(format!("不是普通文件：{}", path.display())));
        }

        if metadata.len() > max_file_size {
            return Err(ImageError::ResourceLimit(format!(
                "文件过大：{:.2} MB（限制：{:.2} MB）",
                as_mb(metadata.len()),
                as_mb(max_file_size)
            )));
        }

        let mut head = Vec::with_capacity(SNIFF_BYTES);
        std::fs::File::open(&path)
            .and_then(|file| file.take(SNIFF_BYTES as u64).read_to_end(&mut head))
            .map_err(|e| ImageError::FetchFailed(format!("无法读取图片文件：{}", e)))?;

        let mime_type = sniff_mime(&head)
            .map(str::to_string)
            .or_else(|| {
                image::ImageFormat::from_path(&path)
                    .ok()
                    .map(|format| format.to_mime_type().to_string())
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        Ok(FetchResult::new(
            DataSource::File {
                path,
                from: DataFrom::Local,
            },
            mime_type,
        ))
    })
    .await
    .map_err(|e| ImageError::FetchFailed(format!("文件读取任务异常：{}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time went backwards")
            .as_nanos();
        std::env::temp_dir().join(format!("image-pipeline-file-{}-{}", nanos, name))
    }

    #[tokio::test]
    async fn sniffs_mime_from_content_not_extension() {
        let path = unique_path("really-a-png.jpg");
        let png = [137_u8, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13, 73, 72, 68, 82];
        std::fs::write(&path, png).expect("write failed");

        let fetched = open_local(path.clone(), 1024).await.expect("open failed");
        assert_eq!(fetched.mime_type, "image/png");
        assert_eq!(fetched.data_from(), DataFrom::Local);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn rejects_missing_and_oversized_files() {
        let missing = unique_path("missing.png");
        assert!(matches!(open_local(missing, 1024).await, Err(ImageError::FetchFailed(_))));

        let big = unique_path("big.png");
        std::fs::write(&big, vec![0_u8; 2048]).expect("write failed");
        assert!(matches!(open_local(big.clone(), 1024).await, Err(ImageError::ResourceLimit(_))));
        let _ = std::fs::remove_file(big);
    }
}
