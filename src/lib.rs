//! # 图片加载流水线 — 库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  调用方：ImageRequest (uri + 尺寸 + 缓存策略 + 变换)      │
//! │       │ execute / enqueue                                │
//! └───────┼──────────────────────────────────────────────────┘
//!         ↓
//! ┌───────┼──────────────────────────────────────────────────┐
//! │  executor ── 状态机 + 取消 + 监听回调                     │
//! │       │                                                  │
//! │       ├─ 内存缓存 (cache::memory) ── 命中直接完成          │
//! │       ↓                                                  │
//! │  请求拦截器链 (interceptor)                               │
//! │   ├─ PauseLoadWhenScrolling   滑动暂停                    │
//! │   └─ Engine ── 解码拦截器链                               │
//! │        ├─ ResultCache         变换后结果磁盘缓存          │
//! │        ├─ Transformation      旋转 / 圆形裁剪 / 模糊      │
//! │        └─ EngineDecode                                   │
//! │             ├─ fetch   http / file / asset / content /   │
//! │             │          data / blurhash                   │
//! │             │   └─ 下载缓存 (cache::download) + 合并下载  │
//! │             └─ decode  raster (image + fast_image_resize) │
//! │                  └─ resize::map 计算源矩形与目标尺寸      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 统一错误类型 `ImageError`，失败阶段 `Stage` |
//! | [`config`] | 流水线配置、缩放滤镜、性能档位 |
//! | [`request`] | 请求描述、缓存策略、尺寸解析、缓存键 |
//! | [`resize`] | 尺寸映射：精度 + 裁剪方式 → 源矩形与目标尺寸 |
//! | [`source`] | 数据来源、获取结果、位图与解码结果 |
//! | [`cache`] | 位图池、内存缓存、磁盘缓存、下载缓存、进行中下载登记 |
//! | [`fetch`] | 按 URI 协议匹配的获取器 |
//! | [`decode`] | 按 MIME 匹配的解码器 |
//! | [`transform`] | 解码后的像素变换 |
//! | [`interceptor`] | 请求链与解码链 |
//! | [`listener`] | 监听回调的串行派发 |
//! | [`registry`] | 组件注册表 |
//! | [`context`] | 单个请求的上下文 |
//! | [`executor`] | 流水线入口与请求状态机 |

pub mod cache;
pub mod config;
pub mod context;
pub mod decode;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod interceptor;
pub mod listener;
pub mod registry;
pub mod request;
pub mod resize;
pub mod source;
pub mod transform;

pub use config::{PerformanceProfile, PipelineConfig, ResizeFilter};
pub use context::RequestContext;
pub use error::{ImageError, RequestFailure, Stage};
pub use executor::{ImageData, ImagePipeline, Outcome, PipelineBuilder, RequestHandle, RequestState};
pub use interceptor::ScrollState;
pub use listener::ImageListener;
pub use registry::ComponentRegistry;
pub use request::{CachePolicy, ImageRequest, ImageRequestBuilder, SizeResolver, SizeSpec};
pub use resize::{Precision, Rect, ResizeMapping, Scale, Size};
pub use source::{Bitmap, DataFrom, DataSource, DecodeResult, FetchResult, ImageInfo};
pub use transform::{BlurTransformation, CircleCropTransformation, RotateTransformation, Transformation};
