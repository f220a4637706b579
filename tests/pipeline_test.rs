//! 流水线端到端测试：本地文件、data URI、HTTP（本地测试服务器）、缓存命中、取消与回调顺序。

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use image_pipeline::{
    CachePolicy, DataFrom, ImageData, ImageError, ImageListener, ImagePipeline, ImageRequest, Outcome,
    PipelineConfig, Precision, RequestFailure, RequestState, RotateTransformation, Scale, Size, Stage,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn unique_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_nanos();
    std::env::temp_dir().join(format!("image-pipeline-it-{}-{}", name, nanos))
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_fn(width, height, |x, _| {
        if x < width / 2 {
            image::Rgba([255, 0, 0, 255])
        } else {
            image::Rgba([0, 0, 255, 255])
        }
    });
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode png failed");
    bytes
}

fn png_data_uri(width: u32, height: u32) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png_bytes(width, height))
    )
}

fn write_png_file(dir: &PathBuf, width: u32, height: u32) -> PathBuf {
    std::fs::create_dir_all(dir).expect("create dir failed");
    let path = dir.join("sample.png");
    std::fs::write(&path, png_bytes(width, height)).expect("write png failed");
    path
}

/// 只服务一次的 HTTP 测试服务器。
fn serve_once(body: Vec<u8>, content_type: &'static str) -> (String, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server failed");
    let addr = listener.local_addr().expect("read local addr failed");

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept failed");
        let mut req_buf = [0u8; 2048];
        let _ = stream.read(&mut req_buf);

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            content_type,
            body.len()
        );
        stream.write_all(response.as_bytes()).expect("write headers failed");
        stream.write_all(&body).expect("write body failed");
        stream.flush().expect("flush failed");
    });

    (format!("http://127.0.0.1:{}/photo.png", addr.port()), server)
}

fn network_config(cache_dir: Option<PathBuf>) -> PipelineConfig {
    PipelineConfig {
        allow_private_network: true,
        disk_cache_dir: cache_dir,
        ..PipelineConfig::default()
    }
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl RecordingListener {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event.into());
    }
}

impl ImageListener for RecordingListener {
    fn on_start(&self, _request: &ImageRequest) {
        self.push("start");
    }

    fn on_progress(&self, _request: &ImageRequest, _downloaded: u64, _total: Option<u64>) {
        self.push("progress");
    }

    fn on_success(&self, _request: &ImageRequest, _data: &ImageData) {
        self.push("success");
    }

    fn on_error(&self, _request: &ImageRequest, failure: &RequestFailure) {
        self.push(format!("error:{}", failure.stage.as_str()));
    }

    fn on_cancel(&self, _request: &ImageRequest) {
        self.push("cancel");
    }
}

#[tokio::test]
async fn local_file_is_center_cropped_to_exact_size() {
    init_logger();
    let dir = unique_dir("file");
    let path = write_png_file(&dir, 40, 20);

    let pipeline = ImagePipeline::builder(PipelineConfig::default())
        .build()
        .expect("pipeline build failed");
    let request = ImageRequest::builder(path.to_string_lossy().to_string())
        .size(Size::new(10, 10))
        .precision(Precision::Exact)
        .scale(Scale::CenterCrop)
        .build();

    let data = pipeline.execute(request).await.into_result().expect("load failed");
    assert_eq!(data.data_from, DataFrom::Local);
    assert_eq!((data.width(), data.height()), (10, 10));
    assert_eq!((data.info.width, data.info.height), (40, 20));
    assert!(data.transformations.iter().any(|t| t == "Resized(10x10)"));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn http_headers_do_not_change_memory_cache_key() {
    init_logger();
    let pipeline = ImagePipeline::builder(PipelineConfig::default())
        .build()
        .expect("pipeline build failed");
    let uri = png_data_uri(6, 6);

    let first = ImageRequest::builder(uri.clone()).http_header("X-Trace", "a").build();
    let second = ImageRequest::builder(uri).http_header("X-Trace", "b").build();
    assert_eq!(first.cache_key(None), second.cache_key(None));
    assert_ne!(first.download_cache_key(), second.download_cache_key());

    let first = pipeline.execute(first).await.into_result().expect("first load failed");
    let second = pipeline.execute(second).await.into_result().expect("second load failed");
    assert_eq!(first.cache_key, second.cache_key);
    assert_eq!(second.data_from, DataFrom::MemoryCache);
}

#[tokio::test]
async fn rotation_is_applied_after_decode() {
    init_logger();
    let pipeline = ImagePipeline::builder(PipelineConfig::default())
        .build()
        .expect("pipeline build failed");
    let request = ImageRequest::builder(png_data_uri(8, 6))
        .transformation(Arc::new(RotateTransformation::new(90)))
        .build();

    let data = pipeline.execute(request).await.into_result().expect("load failed");
    assert_eq!((data.width(), data.height()), (6, 8));
    assert_eq!(data.transformations, vec!["Rotate(90)".to_string()]);
}

#[tokio::test]
async fn blurhash_placeholder_decodes_to_requested_size() {
    init_logger();
    let pipeline = ImagePipeline::builder(PipelineConfig::default())
        .build()
        .expect("pipeline build failed");

    let data = pipeline
        .execute(ImageRequest::new("blurhash://00TI:j?width=8&height=4"))
        .await
        .into_result()
        .expect("load failed");
    assert_eq!((data.width(), data.height()), (8, 4));
    assert_eq!(data.data_from, DataFrom::Memory);
    let first_pixel = data
        .image
        .image()
        .with_bitmap(|bitmap| bitmap.pixels[..4].to_vec())
        .expect("bitmap freed");
    assert_eq!(first_pixel, vec![255, 0, 0, 255]);
}

#[tokio::test]
async fn http_download_is_served_from_download_cache_second_time() {
    init_logger();
    let dir = unique_dir("download");
    let (url, server) = serve_once(png_bytes(12, 8), "image/png");

    let pipeline = ImagePipeline::builder(network_config(Some(dir.clone())))
        .build()
        .expect("pipeline build failed");

    let first = pipeline.execute(ImageRequest::new(url.clone())).await.into_result().expect("download failed");
    assert_eq!(first.data_from, DataFrom::Network);
    assert_eq!((first.width(), first.height()), (12, 8));
    server.join().expect("server thread panicked");

    let key = ImageRequest::new(url.clone()).download_cache_key();
    assert!(pipeline.download_cache().contains(&key));

    // 服务器已关闭，第二次只能从下载缓存读取
    let second = ImageRequest::builder(url)
        .memory_cache_policy(CachePolicy::DISABLED)
        .build();
    let second = pipeline.execute(second).await.into_result().expect("cached load failed");
    assert_eq!(second.data_from, DataFrom::DownloadCache);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn non_image_content_type_fails_at_fetch_stage() {
    init_logger();
    let (url, server) = serve_once(b"<html></html>".to_vec(), "text/html");
    let pipeline = ImagePipeline::builder(network_config(None))
        .build()
        .expect("pipeline build failed");

    let outcome = pipeline.execute(ImageRequest::new(url)).await;
    let failure = outcome.failure().expect("request should fail");
    assert_eq!(failure.stage, Stage::Fetch);
    assert!(matches!(failure.error, ImageError::FetchFailed(_)));
    server.join().expect("server thread panicked");
}

#[tokio::test]
async fn private_network_is_blocked_by_default() {
    init_logger();
    let pipeline = ImagePipeline::builder(PipelineConfig::default())
        .build()
        .expect("pipeline build failed");

    let outcome = pipeline.execute(ImageRequest::new("http://127.0.0.1:9/x.png")).await;
    let failure = outcome.failure().expect("request should fail");
    assert_eq!(failure.stage, Stage::Fetch);
}

#[tokio::test]
async fn resized_result_is_reused_by_a_fresh_pipeline() {
    init_logger();
    let dir = unique_dir("result");
    let path = write_png_file(&dir.join("src"), 32, 32);
    let request = || {
        ImageRequest::builder(path.to_string_lossy().to_string())
            .size(Size::new(8, 8))
            .build()
    };

    let first_pipeline = ImagePipeline::builder(network_config(Some(dir.join("cache"))))
        .build()
        .expect("pipeline build failed");
    let first = first_pipeline.execute(request()).await.into_result().expect("first load failed");
    assert_eq!(first.data_from, DataFrom::Local);

    let second_pipeline = ImagePipeline::builder(network_config(Some(dir.join("cache"))))
        .build()
        .expect("pipeline build failed");
    let second = second_pipeline.execute(request()).await.into_result().expect("second load failed");
    assert_eq!(second.data_from, DataFrom::ResultCache);
    assert_eq!((second.width(), second.height()), (8, 8));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn listener_sees_start_then_single_terminal_event() {
    init_logger();
    let pipeline = ImagePipeline::builder(PipelineConfig::default())
        .build()
        .expect("pipeline build failed");

    let ok_listener = Arc::new(RecordingListener::default());
    let request = ImageRequest::builder(png_data_uri(4, 4)).listener(ok_listener.clone()).build();
    assert!(pipeline.execute(request).await.is_success());

    let err_listener = Arc::new(RecordingListener::default());
    let request = ImageRequest::builder("ftp://example.com/a.png").listener(err_listener.clone()).build();
    assert!(!pipeline.execute(request).await.is_success());

    pipeline.flush_callbacks().await;
    assert_eq!(ok_listener.events(), vec!["start", "success"]);
    assert_eq!(err_listener.events(), vec!["start", "error:fetch"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_download_leaves_no_cache_entry() {
    init_logger();
    let dir = unique_dir("cancel");
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server failed");
    let addr = listener.local_addr().expect("read local addr failed");

    // 只发送部分响应体，然后挂起连接
    let _server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept failed");
        let mut req_buf = [0u8; 2048];
        let _ = stream.read(&mut req_buf);
        let header = "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 100000\r\n\r\n";
        let _ = stream.write_all(header.as_bytes());
        let _ = stream.write_all(&png_bytes(4, 4)[..16]);
        let _ = stream.flush();
        thread::sleep(Duration::from_secs(3));
    });

    let pipeline = ImagePipeline::builder(network_config(Some(dir.clone())))
        .build()
        .expect("pipeline build failed");
    let url = format!("http://127.0.0.1:{}/slow.png", addr.port());
    let recorder = Arc::new(RecordingListener::default());
    let handle = pipeline.enqueue(ImageRequest::builder(url.clone()).listener(recorder.clone()).build());

    let mut waited = 0;
    while handle.state() != RequestState::Downloading && waited < 200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert_eq!(handle.state(), RequestState::Downloading);

    let outcome = handle.cancel_and_wait().await;
    assert!(matches!(outcome, Outcome::Cancelled));

    let key = ImageRequest::new(url).download_cache_key();
    assert!(!pipeline.download_cache().contains(&key));
    assert_eq!(pipeline.download_cache().in_flight(), 0);

    pipeline.flush_callbacks().await;
    let events = recorder.events();
    assert_eq!(events.first().map(String::as_str), Some("start"));
    assert_eq!(events.last().map(String::as_str), Some("cancel"));
    assert!(!events.iter().any(|e| e.starts_with("error")));

    let _ = std::fs::remove_dir_all(dir);
}
