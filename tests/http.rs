use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use video_downloader::{
    AppState, ArtifactStore, CommandRunner, Config, JobOutcome, RunnerError,
    rate_limit::RateLimitPolicy, router, runner::stderr_excerpt,
};

type Respond = Box<dyn Fn(&[String]) -> JobOutcome + Send + Sync>;

struct StubRunner {
    respond: Respond,
    calls: Mutex<Vec<Vec<String>>>,
}

impl StubRunner {
    fn new(respond: impl Fn(&[String]) -> JobOutcome + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for StubRunner {
    async fn run(&self, args: &[String], _budget: Duration) -> Result<JobOutcome, RunnerError> {
        self.calls.lock().push(args.to_vec());
        Ok((self.respond)(args))
    }
}

/// Behaves like a successful yt-dlp run: writes `bytes` where `-o` points
/// and prints the final path.
fn writes_output(bytes: &'static [u8]) -> impl Fn(&[String]) -> JobOutcome + Send + Sync {
    move |args| {
        let Some(template) = args
            .iter()
            .position(|arg| arg == "-o")
            .and_then(|index| args.get(index + 1))
        else {
            return JobOutcome::Failed {
                exit_code: Some(2),
                stderr_excerpt: "missing -o".to_string(),
            };
        };
        let ext = if args.iter().any(|arg| arg == "-x") { "mp3" } else { "mp4" };
        let path = template.replace("%(ext)s", ext);
        std::fs::write(&path, bytes).unwrap();
        JobOutcome::Succeeded {
            stdout: format!("{path}\n").into_bytes(),
        }
    }
}

fn exits_with(exit_code: i32, stderr: &'static str) -> impl Fn(&[String]) -> JobOutcome + Send + Sync {
    move |_| JobOutcome::Failed {
        exit_code: Some(exit_code),
        stderr_excerpt: stderr_excerpt(stderr.as_bytes()),
    }
}

struct TestServer {
    base: String,
    client: reqwest::Client,
    download_dir: PathBuf,
    _temp: tempfile::TempDir,
}

impl TestServer {
    async fn start(runner: Arc<dyn CommandRunner>) -> Self {
        Self::start_with_limits(runner, RateLimitPolicy::default()).await
    }

    async fn start_with_limits(runner: Arc<dyn CommandRunner>, limits: RateLimitPolicy) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.download_dir = temp.path().join("descargas");
        config.rate_limits = limits;

        let store = ArtifactStore::open(&config.download_dir).await.unwrap();
        let download_dir = store.root().to_path_buf();
        let app = router(AppState::new(store, runner, &config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            download_dir,
            _temp: temp,
        }
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn video_download_is_served_back_once_finished() {
    let runner = StubRunner::new(writes_output(b"fake mp4 bytes"));
    let server = TestServer::start(runner.clone()).await;

    let (status, body) = server
        .post(
            "/download",
            json!({"url": "https://youtu.be/abc", "format": "video", "quality": "medium"}),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["platform"], "youtube");
    assert_eq!(body["quality"], "medium");
    let filename = body["filename"].as_str().unwrap().to_string();
    assert!(filename.ends_with(".mp4"));
    assert_eq!(filename.len(), 12 + ".mp4".len());
    assert!(body["message"].as_str().unwrap().contains(&filename));

    let args = &runner.calls()[0];
    assert!(args.iter().any(|arg| arg.contains("height<=720")));
    assert_eq!(args.last().unwrap(), "https://youtu.be/abc");

    let response = server.get(&format!("/download_file/{filename}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "video/mp4");
    assert!(
        response.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .starts_with("attachment;")
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"fake mp4 bytes");
}

#[tokio::test]
async fn audio_download_produces_mp3() {
    let runner = StubRunner::new(writes_output(b"id3"));
    let server = TestServer::start(runner.clone()).await;

    let (status, body) = server
        .post(
            "/download",
            json!({"url": "https://vimeo.com/1", "format": "audio", "quality": "low"}),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body["filename"].as_str().unwrap().ends_with(".mp3"));
    assert_eq!(body["platform"], "other");

    let args = &runner.calls()[0];
    let quality = args
        .iter()
        .position(|arg| arg == "--audio-quality")
        .map(|index| args[index + 1].as_str());
    assert_eq!(quality, Some("9"));
}

#[tokio::test]
async fn unknown_options_fall_back_to_best_video() {
    let runner = StubRunner::new(writes_output(b"x"));
    let server = TestServer::start(runner).await;

    let (status, body) = server
        .post(
            "/download",
            json!({"url": "https://www.tiktok.com/@u/video/1", "format": "gif", "quality": 42}),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["quality"], "best");
    assert_eq!(body["platform"], "tiktok");
    assert!(body["filename"].as_str().unwrap().ends_with(".mp4"));
}

#[tokio::test]
async fn tool_failure_surfaces_stderr_as_bad_request() {
    let runner = StubRunner::new(exits_with(1, "no such format"));
    let server = TestServer::start(runner).await;

    let (status, body) = server
        .post(
            "/download",
            json!({"url": "https://youtu.be/abc", "format": "video", "quality": "medium"}),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Error en la descarga: no such format");
    assert!(body.get("success").is_none());
}

#[tokio::test]
async fn timeout_is_reported_distinctly() {
    let runner = StubRunner::new(|_| JobOutcome::TimedOut {
        budget: Duration::from_secs(300),
    });
    let server = TestServer::start(runner).await;

    let (status, body) = server
        .post("/download", json!({"url": "https://youtu.be/abc"}))
        .await;

    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert!(body["error"].as_str().unwrap().contains("muy grande"));
}

#[tokio::test]
async fn success_without_output_file_is_not_found() {
    let runner = StubRunner::new(|_| JobOutcome::Succeeded { stdout: Vec::new() });
    let server = TestServer::start(runner).await;

    let (status, body) = server
        .post("/download", json!({"url": "https://youtu.be/abc"}))
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No se encontro el archivo descargado");
}

#[tokio::test]
async fn cleanup_removes_every_artifact() {
    let runner = StubRunner::new(writes_output(b"bytes"));
    let server = TestServer::start(runner).await;

    let mut filenames = Vec::new();
    for _ in 0..2 {
        let (status, body) = server
            .post("/download", json!({"url": "https://youtu.be/abc"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        filenames.push(body["filename"].as_str().unwrap().to_string());
    }
    assert_ne!(filenames[0], filenames[1]);

    let (status, body) = server.post("/cleanup", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["removed"], 2);
    assert_eq!(std::fs::read_dir(&server.download_dir).unwrap().count(), 0);

    for filename in filenames {
        let response = server.get(&format!("/download_file/{filename}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn file_route_rejects_traversal() {
    let runner = StubRunner::new(writes_output(b"x"));
    let server = TestServer::start(runner).await;
    let secret = server.download_dir.parent().unwrap().join("secret");
    std::fs::write(&secret, b"top secret").unwrap();

    for path in ["/download_file/..%2Fsecret", "/download_file/.hidden", "/download_file/missing.mp4"] {
        let response = server.get(path).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Archivo no encontrado");
    }
}

#[tokio::test]
async fn info_returns_normalized_metadata() {
    let runner = StubRunner::new(|_| JobOutcome::Succeeded {
        stdout: br#"{"title":"Clip","duration":95,"thumbnail":"https://i.test/t.jpg","uploader":"Ana",
                     "formats":[{"height":1920},{"height":480},{"resolution":"audio only"}]}"#
            .to_vec(),
    });
    let server = TestServer::start(runner.clone()).await;

    let (status, body) = server
        .post("/get_info", json!({"url": "https://www.youtube.com/watch?v=abc"}))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["title"], "Clip");
    assert_eq!(body["duration"], 95.0);
    assert_eq!(body["uploader"], "Ana");
    assert_eq!(body["platform"], "youtube");
    assert_eq!(body["max_resolution"], 1920);
    assert_eq!(
        body["available_qualities"],
        json!({"best": true, "high": true, "medium": false, "low": true})
    );
    assert!(runner.calls()[0].contains(&"--dump-json".to_string()));
    assert_eq!(std::fs::read_dir(&server.download_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn info_failures_map_to_status_codes() {
    let failing = TestServer::start(StubRunner::new(exits_with(1, "ERROR: Unsupported URL"))).await;
    let (status, body) = failing
        .post("/get_info", json!({"url": "https://example.com/video"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No se pudo obtener informacion del video");

    let slow = TestServer::start(StubRunner::new(|_| JobOutcome::TimedOut {
        budget: Duration::from_secs(30),
    }))
    .await;
    let (status, _) = slow
        .post("/get_info", json!({"url": "https://example.com/video"}))
        .await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);

    let garbled = TestServer::start(StubRunner::new(|_| JobOutcome::Succeeded {
        stdout: b"<html>".to_vec(),
    }))
    .await;
    let (status, body) = garbled
        .post("/get_info", json!({"url": "https://example.com/video"}))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body["error"].as_str().unwrap().contains("<html>"));
}

#[tokio::test]
async fn missing_or_malformed_input_is_rejected_before_running() {
    let runner = StubRunner::new(writes_output(b"x"));
    let server = TestServer::start(runner.clone()).await;

    let (status, body) = server.post("/get_info", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "URL no proporcionada");

    let (status, body) = server
        .post("/download", json!({"url": "not a url", "format": "video"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "URL invalida");

    let response = server
        .client
        .post(format!("{}/download", server.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn download_quota_rejects_before_invoking_tool() {
    let runner = StubRunner::new(writes_output(b"x"));
    let server = TestServer::start_with_limits(
        runner.clone(),
        RateLimitPolicy {
            download_per_minute: 2,
            ..RateLimitPolicy::default()
        },
    )
    .await;

    for _ in 0..2 {
        let (status, _) = server
            .post("/download", json!({"url": "https://youtu.be/abc"}))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let response = server
        .client
        .post(format!("{}/download", server.base))
        .json(&json!({"url": "https://youtu.be/abc"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_header: u64 = response.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["retry_after"], retry_header);
    assert!(retry_header >= 1 && retry_header <= 60);
    assert!(body["message"].as_str().unwrap().contains("por minuto"));
    assert!(body["error"].is_string());

    assert_eq!(runner.calls().len(), 2);

    let (status, _) = server
        .post("/get_info", json!({"url": "https://youtu.be/abc"}))
        .await;
    assert_ne!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn index_and_health_are_served() {
    let server = TestServer::start(StubRunner::new(writes_output(b"x"))).await;

    let index = server.get("/").await;
    assert_eq!(index.status(), StatusCode::OK);
    assert!(index.text().await.unwrap().contains("/get_info"));

    let health: Value = server.get("/health").await.json().await.unwrap();
    assert_eq!(health, json!({"status": "ok"}));
}
