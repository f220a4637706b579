//! 缓存层：引用计数图片、内存 LRU、像素复用池、磁盘缓存与下载去重。

pub mod disk;
pub mod download;
pub mod image;
pub mod inflight;
pub mod memory;
pub mod pool;

pub use disk::{DiskCache, Editor, Snapshot};
pub use download::{DownloadCache, DownloadSink, Downloaded};
pub use image::{CachedImage, ImageRef, RefCounts, RefKind};
pub use inflight::{Flight, FlightOwner, FlightWaiter, InFlightRegistry};
pub use memory::MemoryCache;
pub use pool::BitmapPool;
