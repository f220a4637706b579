use async_trait::async_trait;

use super::{Chain, Interceptor};
use crate::ImageError;
use crate::source::DecodeResult;

/// 按注册顺序应用请求上的变换，位于结果缓存之内，结果缓存保存的是变换后的像素。
pub struct TransformationDecodeInterceptor;

#[async_trait]
impl Interceptor<DecodeResult> for TransformationDecodeInterceptor {
    fn key(&self) -> &str {
        "TransformationDecodeInterceptor"
    }

    fn sort_weight(&self) -> i32 {
        90
    }

    async fn intercept(&self, chain: Chain<'_, DecodeResult>) -> Result<DecodeResult, ImageError> {
        let transformations = chain.request().transformations().to_vec();
        let mut result = chain.proceed().await?;
        if transformations.is_empty() {
            return Ok(result);
        }

        tokio::task::spawn_blocking(move || {
            for transformation in &transformations {
                result.bitmap = transformation.transform(&result.bitmap)?;
                result.transformations.push(transformation.key());
            }
            log::debug!("🎨 已应用 {} 个变换", transformations.len());
            Ok(result)
        })
        .await
        .map_err(|e| ImageError::DecodeFailed(format!("变换任务异常：{}", e)))?
    }
}
