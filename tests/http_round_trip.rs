mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{MIB, TestEnv, insert_auth_session, insert_event, payload, setup_with};
use media_uploads::{
    build_app,
    client::{
        ClientConfig, ClientError, DriverError, FileUpload, HttpPartTransport, PartProgress,
        PartTransport, TransportError, UploadClient, UploadProgress, UploadSource,
    },
    config::UploadPolicy,
    models::{session::PartToken, wire::InitiateRequest},
};
use reqwest::{StatusCode, Url, header};
use serde_json::{Value, json};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use tokio::{net::TcpListener, sync::watch};
use tokio_util::sync::CancellationToken;

const SINGLE_PUT_MAX: u64 = MIB as u64;

async fn serve() -> (String, TestEnv) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let policy = UploadPolicy {
        single_put_max_size: SINGLE_PUT_MAX,
        ..UploadPolicy::default()
    };
    let env = setup_with(&base_url, policy).await;
    let app = build_app(env.state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (base_url, env)
}

fn client(base_url: &str) -> UploadClient {
    UploadClient::new(base_url).with_config(ClientConfig {
        concurrency: 2,
        max_part_retries: 1,
    })
}

fn progress_channel() -> (watch::Sender<UploadProgress>, watch::Receiver<UploadProgress>) {
    watch::channel(UploadProgress::default())
}

#[tokio::test]
async fn multipart_upload_through_http() {
    let (base_url, env) = serve().await;
    insert_event(&env.db, "party", "owner", None, true).await;
    insert_auth_session(&env.db, "owner-token", "owner").await;

    let data = payload(10 * MIB + 17);
    let file = FileUpload {
        event_id: "party".into(),
        file_name: "clip.mp4".into(),
        file_type: "video/mp4".into(),
        source: UploadSource::Memory(Bytes::from(data.clone())),
    };
    let (tx, rx) = progress_channel();

    let uploaded = client(&base_url)
        .with_bearer("owner-token")
        .upload(&file, &CancellationToken::new(), tx)
        .await
        .unwrap();

    assert!(uploaded.file_key.starts_with("events/party/media/"));
    assert!(uploaded.file_key.ends_with(".mp4"));
    assert!(uploaded.etag.ends_with("-2\""));
    assert_eq!(uploaded.record.uploader_id.as_deref(), Some("owner"));
    assert!(uploaded.record.approved);

    let done = *rx.borrow();
    assert_eq!(done.total_bytes, data.len() as u64);
    assert_eq!(done.uploaded_bytes, data.len() as u64);
    assert_eq!(done.percent, 100);

    let response = reqwest::get(&uploaded.file_url).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "video/mp4"
    );
    let body = response.bytes().await.unwrap();
    assert!(body[..] == data[..]);
}

#[tokio::test]
async fn single_put_upload_from_file() {
    let (base_url, env) = serve().await;
    insert_event(&env.db, "party", "owner", None, false).await;

    let path = env.dir.path().join("upload-source.png");
    tokio::fs::write(&path, payload(4096)).await.unwrap();
    let file = FileUpload {
        event_id: "party".into(),
        file_name: "photo.png".into(),
        file_type: "image/png".into(),
        source: UploadSource::File(path),
    };
    let (tx, rx) = progress_channel();

    let uploaded = client(&base_url)
        .upload(&file, &CancellationToken::new(), tx)
        .await
        .unwrap();
    assert!(uploaded.record.approved);
    assert_eq!(uploaded.record.uploader_id, None);
    assert_eq!(rx.borrow().percent, 100);

    let head = reqwest::Client::new()
        .head(&uploaded.file_url)
        .send()
        .await
        .unwrap();
    assert_eq!(head.status(), StatusCode::OK);
    assert_eq!(head.headers().get(header::CONTENT_LENGTH).unwrap(), "4096");
    let etag = head.headers().get(header::ETAG).unwrap().to_str().unwrap();
    assert_eq!(etag, uploaded.etag);
}

#[tokio::test]
async fn protocol_errors_map_to_statuses() {
    let (base_url, env) = serve().await;
    insert_event(&env.db, "party", "owner", None, false).await;
    let client = client(&base_url);

    let err = client
        .initiate(&InitiateRequest {
            event_id: "party".into(),
            file_name: "doc.pdf".into(),
            file_type: "application/pdf".into(),
            file_size: 1024,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Api { status: 400, .. }), "{err}");

    let err = client
        .initiate(&InitiateRequest {
            event_id: "missing".into(),
            file_name: "a.jpg".into(),
            file_type: "image/jpeg".into(),
            file_size: 1024,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Api { status: 404, .. }), "{err}");

    let http = reqwest::Client::new();
    let response = http
        .post(format!("{}/api/uploads/parts", base_url))
        .header(header::CONTENT_TYPE, "application/json")
        .body(r#"{"fileKey": "k"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], json!(400));

    let response = http
        .post(format!("{}/api/uploads/parts", base_url))
        .json(&json!({ "fileKey": "k", "uploadId": "u", "partNumbers": [1, 10001] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("10001"));

    for _ in 0..2 {
        let aborted = client.abort("events/party/media/x_1.jpg", "gone").await.unwrap();
        assert!(aborted.success);
    }

    let err = client
        .complete("events/party/media/x_1.jpg", "gone", &[PartToken::new(1, "\"a\"")])
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::SessionExpired), "{err}");

    let response = http
        .put(format!(
            "{}/storage/events/party/media/x_1.jpg?contentType=image%2Fjpeg&expires=99999999999&signature=bogus",
            base_url
        ))
        .header(header::CONTENT_TYPE, "image/jpeg")
        .body("data")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = http.get(format!("{}/readyz", base_url)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn signed_url_is_bound_to_content_type() {
    let (base_url, env) = serve().await;
    insert_event(&env.db, "party", "owner", None, false).await;
    let client = client(&base_url);

    let ticket = client
        .presign(&InitiateRequest {
            event_id: "party".into(),
            file_name: "a.jpg".into(),
            file_type: "image/jpeg".into(),
            file_size: 4,
        })
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .put(&ticket.upload_url)
        .header(header::CONTENT_TYPE, "image/png")
        .body("data")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn cancelled_upload_aborts_its_session() {
    let (base_url, env) = serve().await;
    insert_event(&env.db, "party", "owner", None, false).await;

    let file = FileUpload {
        event_id: "party".into(),
        file_name: "clip.mov".into(),
        file_type: "video/quicktime".into(),
        source: UploadSource::Memory(Bytes::from(payload(2 * MIB))),
    };
    let cancel = CancellationToken::new();
    cancel.cancel();
    let (tx, _rx) = progress_channel();

    let err = client(&base_url)
        .upload(&file, &cancel, tx)
        .await
        .unwrap_err();
    assert!(
        matches!(err, ClientError::Driver(DriverError::Cancelled { .. })),
        "{err}"
    );

    let open_sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM multipart_uploads")
        .fetch_one(&*env.db)
        .await
        .unwrap();
    assert_eq!(open_sessions, 0);
}

/// Real HTTP parts, except the first ETag reported for part 1 is wrong.
struct WrongFirstEtag {
    inner: HttpPartTransport,
    tripped: AtomicBool,
    puts: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl PartTransport for WrongFirstEtag {
    async fn put_part(
        &self,
        url: &str,
        body: Bytes,
        progress: PartProgress,
    ) -> Result<String, TransportError> {
        let part_number = Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(name, _)| name == "partNumber")
            .map(|(_, value)| value.parse::<u32>().unwrap())
            .unwrap();
        self.puts.lock().unwrap().push(part_number);

        let etag = self.inner.put_part(url, body, progress).await?;
        if part_number == 1 && !self.tripped.swap(true, Ordering::SeqCst) {
            return Ok("\"00000000000000000000000000000000\"".into());
        }
        Ok(etag)
    }
}

#[tokio::test]
async fn mismatched_part_is_reuploaded_alone() {
    let (base_url, env) = serve().await;
    insert_event(&env.db, "party", "owner", None, false).await;

    let data = payload(9 * MIB);
    let file = FileUpload {
        event_id: "party".into(),
        file_name: "clip.mp4".into(),
        file_type: "video/mp4".into(),
        source: UploadSource::Memory(Bytes::from(data.clone())),
    };
    let puts = Arc::new(Mutex::new(Vec::new()));
    let transport = WrongFirstEtag {
        inner: HttpPartTransport::new(reqwest::Client::new()),
        tripped: AtomicBool::new(false),
        puts: puts.clone(),
    };
    let (tx, _rx) = progress_channel();

    let uploaded = client(&base_url)
        .with_part_transport(transport)
        .upload(&file, &CancellationToken::new(), tx)
        .await
        .unwrap();
    assert!(uploaded.etag.ends_with("-2\""));

    let mut puts = puts.lock().unwrap().clone();
    puts.sort_unstable();
    assert_eq!(puts, vec![1, 1, 2]);

    let body = reqwest::get(&uploaded.file_url)
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert!(body[..] == data[..]);
}

#[tokio::test]
async fn start_follows_the_server_threshold() {
    let (base_url, env) = serve().await;
    insert_event(&env.db, "party", "owner", None, false).await;
    let http = reqwest::Client::new();

    for (size, strategy) in [(SINGLE_PUT_MAX, "single-put"), (SINGLE_PUT_MAX + 1, "multipart")] {
        let body: Value = http
            .post(format!("{}/api/uploads/start", base_url))
            .json(&json!({
                "eventId": "party",
                "fileName": "a.jpg",
                "fileType": "image/jpeg",
                "fileSize": size,
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["strategy"], json!(strategy));
        assert!(body["fileKey"].as_str().unwrap().starts_with("events/party/media/"));
        match strategy {
            "single-put" => assert!(body["uploadUrl"].is_string()),
            _ => assert!(body["uploadId"].is_string() && body["partCount"] == json!(1)),
        }
    }
}
