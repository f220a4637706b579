//! `asset://` 打包资源，相对 `asset_root` 解析，禁止越出根目录。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use super::file::open_local;
use super::{Fetcher, FetcherFactory, strip_scheme};
use crate::ImageError;
use crate::context::RequestContext;
use crate::source::FetchResult;

const ASSET_SCHEME: &str = "asset://";

pub struct AssetUriFetcherFactory;

impl FetcherFactory for AssetUriFetcherFactory {
    fn key(&self) -> &str {
        "AssetUriFetcher"
    }

    fn create(&self, ctx: &RequestContext) -> Option<Box<dyn Fetcher>> {
        let relative = strip_scheme(ctx.request().uri(), ASSET_SCHEME)?;
        let relative = relative.split(['?', '#']).next().unwrap_or(relative);
        Some(Box::new(AssetUriFetcher {
            relative: relative.to_string(),
        }))
    }
}

pub struct AssetUriFetcher {
    relative: String,
}

/// 把资源相对路径拼到根目录下，拒绝空路径、绝对路径与 `..`。
fn resolve_asset_path(root: &Path, relative: &str) -> Result<PathBuf, ImageError> {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return Err(ImageError::UriInvalid("资源路径为空".to_string()));
    }

    let mut path = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => {
                return Err(ImageError::UriInvalid(format!("资源路径越界：{}", relative)));
            }
        }
    }

    Ok(path)
}

#[async_trait]
impl Fetcher for AssetUriFetcher {
    async fn fetch(&self, ctx: &RequestContext) -> Result<FetchResult, ImageError> {
        let root = ctx
            .config()
            .asset_root
            .as_deref()
            .ok_or_else(|| ImageError::Config("未配置 asset_root，无法加载 asset:// 资源".to_string()))?;

        let path = resolve_asset_path(root, &self.relative)?;
        open_local(path, ctx.config().max_file_size).await
    }
}
