//! End-to-end checks of the HTTP surface against the simulated camera

use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use camstream::config::AppConfig;
use camstream::state::AppState;
use camstream::stream::FrameDistributor;
use camstream::video::{CaptureEngine, EngineState, SimConfig, SimControl, SimFactory};
use camstream::web::create_router;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    base: String,
    client: reqwest::Client,
    engine: Arc<CaptureEngine>,
    control: SimControl,
}

impl TestServer {
    async fn spawn() -> Self {
        let factory = SimFactory::new(SimConfig::default());
        let control = factory.control();

        let mut config = AppConfig::default();
        config.capture.device = "/dev/video-sim".to_string();
        config.capture.acquire_timeout_ms = 200;
        config.stream.stream_idle_timeout_ms = 500;
        config.stream.max_idle_keepalives = 2;

        let distributor = FrameDistributor::new(config.stream.snapshot_staleness());
        let engine = Arc::new(
            CaptureEngine::spawn(
                config.capture.to_capture_config().unwrap(),
                Arc::new(factory),
                distributor,
            )
            .unwrap(),
        );

        let app = create_router(AppState::new(config, engine.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::builder().timeout(WAIT).build().unwrap(),
            engine,
            control,
        }
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap()
    }
}

async fn json(resp: reqwest::Response) -> Value {
    serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_snapshot_stop() {
    let server = TestServer::spawn().await;

    let resp = server.get("/camera/frame").await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json(resp).await["code"], "not_streaming");

    let resp = server.post("/camera/start").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json(resp).await["status"], "started");

    let resp = server.get("/camera/frame").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers().clone();
    assert_eq!(headers["content-type"], "image/jpeg");
    assert!(headers["cache-control"].to_str().unwrap().contains("no-cache"));
    assert!(headers.contains_key("x-timestamp"));
    let sequence: u64 = headers["x-frame-sequence"].to_str().unwrap().parse().unwrap();
    assert!(sequence >= 1);
    let body = resp.bytes().await.unwrap();
    assert_eq!(
        headers["content-length"].to_str().unwrap(),
        body.len().to_string()
    );
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
    assert_eq!(&body[body.len() - 2..], &[0xFF, 0xD9]);

    let resp = server.get("/camera/capture").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let doc = json(resp).await;
    assert_eq!(doc["width"], 640);
    assert_eq!(doc["height"], 480);
    assert_eq!(doc["format"], "MJPEG");
    assert_eq!(doc["content_type"], "image/jpeg");
    assert!(doc["sequence"].as_u64().unwrap() >= sequence);
    assert!(!doc["image"].as_str().unwrap().is_empty());

    // Clients that trigger captures with POST get the same document
    let resp = server.post("/camera/capture").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let doc = json(resp).await;
    assert_eq!(doc["format"], "MJPEG");
    assert!(doc["sequence"].as_u64().unwrap() >= sequence);

    let status = json(server.get("/camera/status").await).await;
    assert_eq!(status["state"], "streaming");
    assert_eq!(status["device"], "/dev/video-sim");
    assert_eq!(status["negotiated_format"]["pixel_format"], "MJPEG");

    for _ in 0..2 {
        let resp = server.post("/camera/stop").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["status"], "stopped");
    }
    assert_eq!(
        server.get("/camera/frame").await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );

    server.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_format_queries() {
    let server = TestServer::spawn().await;

    let resp = server.post("/camera/start?format=h264").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .post("/camera/start?resolution=1280x720&format=mjpeg&fps=15")
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let doc = json(resp).await;
    assert_eq!(doc["format"]["resolution"]["width"], 1280);
    assert_eq!(doc["format"]["fps"], 15);

    assert_eq!(
        server.get("/camera/frame?resolution=1280x720").await.status(),
        StatusCode::OK
    );
    assert_eq!(
        server.get("/camera/frame?format=yuyv").await.status(),
        StatusCode::CONFLICT
    );
    assert_eq!(
        server.get("/camera/capture?resolution=640x480").await.status(),
        StatusCode::CONFLICT
    );
    assert_eq!(
        server.get("/camera/frame?resolution=huge").await.status(),
        StatusCode::BAD_REQUEST
    );

    // Only the pixel format changes; the resolution is kept
    let resp = server.post("/camera/start?format=yuyv").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json(resp).await["format"]["resolution"]["height"], 720);
    let resp = server.get("/camera/frame").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "image/yuyv");

    server.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_failure_reports_error() {
    let server = TestServer::spawn().await;
    server.control.set_missing(true);

    let resp = server.post("/camera/start").await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let doc = json(resp).await;
    assert_eq!(doc["success"], false);
    assert_eq!(doc["code"], "device_unavailable");

    let status = json(server.get("/camera/status").await).await;
    assert_eq!(status["state"], "closed");
    assert!(status["last_error"].is_string());

    server.control.set_missing(false);
    assert_eq!(server.post("/camera/start").await.status(), StatusCode::OK);
    server.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mjpeg_stream_ends_on_stop() {
    let server = TestServer::spawn().await;

    assert_eq!(
        server.get("/camera/stream").await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(server.post("/camera/start").await.status(), StatusCode::OK);

    let resp = server.get("/camera/stream").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"],
        "multipart/x-mixed-replace; boundary=frame"
    );

    let mut body = resp.bytes_stream();
    let mut received = Vec::new();
    while count_parts(&received) < 3 {
        let chunk = tokio::time::timeout(WAIT, body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        received.extend_from_slice(&chunk);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\n"));
    assert!(text.contains("X-Timestamp: "));

    assert_eq!(server.post("/camera/stop").await.status(), StatusCode::OK);

    // The body finishes once the session is terminated
    let drained = tokio::time::timeout(WAIT, async {
        while let Some(chunk) = body.next().await {
            if chunk.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(drained.is_ok(), "stream did not end after stop");
    assert_eq!(server.engine.distributor().subscriber_count(), 0);

    server.engine.shutdown().await;
}

fn count_parts(data: &[u8]) -> usize {
    let marker = b"--frame\r\n";
    data.windows(marker.len()).filter(|w| w == marker).count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fault_reflected_in_health_and_stream() {
    let server = TestServer::spawn().await;

    let health = server.get("/health").await;
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(json(health).await["status"], "ok");

    assert_eq!(server.post("/camera/start").await.status(), StatusCode::OK);
    assert_eq!(server.get("/camera/frame").await.status(), StatusCode::OK);

    server.control.fail_next_dequeues(4);
    assert!(
        server
            .engine
            .wait_for_state(EngineState::Faulted, WAIT)
            .await
    );

    assert_eq!(
        server.get("/camera/stream").await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
    let health = server.get("/health").await;
    assert_eq!(health.status(), StatusCode::SERVICE_UNAVAILABLE);
    let doc = json(health).await;
    assert_eq!(doc["status"], "faulted");
    assert!(doc["last_error"].is_string());

    // An explicit start reopens the device
    assert_eq!(server.post("/camera/start").await.status(), StatusCode::OK);
    assert_eq!(server.get("/health").await.status(), StatusCode::OK);
    assert_eq!(server.get("/camera/stream").await.status(), StatusCode::OK);

    server.engine.shutdown().await;
}
