//! HTTP client for the upload endpoints and the full caller-level flow.
//!
//! `UploadClient::upload` lets the server pick single PUT or multipart,
//! drives the parts, re-signs and re-uploads failed or mismatched parts a
//! bounded number of times and aborts the session before returning any error.

use crate::{
    client::{
        driver::{
            DriverError, PartJob, PartTransport, ProgressReporter, TransportError, UploadDriver,
            UploadProgress, UploadSource, normalize_etag,
        },
        http::HttpPartTransport,
    },
    models::{
        session::{PartToken, SignedPartUrl},
        upload::UploadRecord,
        wire::{
            AbortRequest, AbortResponse, CompleteRequest, CompleteResponse, InitiateRequest,
            InitiateResponse, PresignResponse, RecordUploadRequest, SignPartsRequest,
            SignPartsResponse, StartUploadResponse,
        },
    },
    services::part_planner::PartPlan,
};
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{collections::HashMap, io, sync::Arc};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Most part numbers sent in one signing request.
pub const SIGN_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Parts in flight at once.
    pub concurrency: usize,
    /// Rounds of re-signing and re-uploading failed parts.
    pub max_part_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_part_retries: 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server answered {status}: {message}")]
    Api { status: u16, message: String },
    /// Completion rejected one part; it can be re-uploaded on its own.
    #[error("part {part_number} does not match the uploaded data")]
    PartMismatch { part_number: u32 },
    /// The session is gone; the upload has to start over.
    #[error("upload session expired or no longer exists")]
    SessionExpired,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("server returned a part plan that does not fit the file")]
    InvalidPlan,
    #[error("upload cancelled")]
    Cancelled,
}

/// A file to upload into an event.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub event_id: String,
    pub file_name: String,
    pub file_type: String,
    pub source: UploadSource,
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_key: String,
    pub file_url: String,
    pub etag: String,
    pub record: UploadRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    part_number: Option<u32>,
}

impl ErrorBody {
    fn into_error(self, status: u16) -> ClientError {
        match (self.code.as_deref(), self.part_number) {
            (Some("PART_MISMATCH"), Some(part_number)) => ClientError::PartMismatch { part_number },
            (Some("SESSION_EXPIRED"), _) => ClientError::SessionExpired,
            _ => ClientError::Api {
                status,
                message: self.error,
            },
        }
    }
}

#[derive(Clone)]
pub struct UploadClient {
    http: Client,
    base_url: String,
    bearer: Option<String>,
    transport: HttpPartTransport,
    parts: Arc<dyn PartTransport>,
    config: ClientConfig,
}

impl UploadClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::new();
        let transport = HttpPartTransport::new(http.clone());
        Self {
            parts: Arc::new(transport.clone()),
            transport,
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer: None,
            config: ClientConfig::default(),
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Send multipart parts through `transport` instead of plain HTTP.
    pub fn with_part_transport(mut self, transport: impl PartTransport + 'static) -> Self {
        self.parts = Arc::new(transport);
        self
    }

    pub async fn start(&self, req: &InitiateRequest) -> Result<StartUploadResponse, ClientError> {
        self.post("start", req).await
    }

    pub async fn initiate(&self, req: &InitiateRequest) -> Result<InitiateResponse, ClientError> {
        self.post("initiate", req).await
    }

    pub async fn presign(&self, req: &InitiateRequest) -> Result<PresignResponse, ClientError> {
        self.post("presign", req).await
    }

    pub async fn sign_parts(
        &self,
        file_key: &str,
        upload_id: &str,
        part_numbers: &[u32],
    ) -> Result<Vec<SignedPartUrl>, ClientError> {
        let body = SignPartsRequest {
            file_key: file_key.into(),
            upload_id: upload_id.into(),
            part_numbers: part_numbers.iter().copied().map(Value::from).collect(),
        };
        let response: SignPartsResponse = self.post("parts", &body).await?;
        Ok(response.urls)
    }

    pub async fn complete(
        &self,
        file_key: &str,
        upload_id: &str,
        parts: &[PartToken],
    ) -> Result<CompleteResponse, ClientError> {
        let body = CompleteRequest {
            file_key: file_key.into(),
            upload_id: upload_id.into(),
            parts: parts
                .iter()
                .map(|token| json!({ "PartNumber": token.part_number, "ETag": token.e_tag }))
                .collect(),
        };
        self.post("complete", &body).await
    }

    pub async fn abort(&self, file_key: &str, upload_id: &str) -> Result<AbortResponse, ClientError> {
        let body = AbortRequest {
            file_key: file_key.into(),
            upload_id: upload_id.into(),
        };
        self.post("abort", &body).await
    }

    pub async fn record(&self, req: &RecordUploadRequest) -> Result<UploadRecord, ClientError> {
        self.post("record", req).await
    }

    /// Upload `file` end to end and record it against its event.
    pub async fn upload(
        &self,
        file: &FileUpload,
        cancel: &CancellationToken,
        progress: watch::Sender<UploadProgress>,
    ) -> Result<UploadedFile, ClientError> {
        let size = file.source.len().await?;
        let request = InitiateRequest {
            event_id: file.event_id.clone(),
            file_name: file.file_name.clone(),
            file_type: file.file_type.clone(),
            file_size: i64::try_from(size).unwrap_or(i64::MAX),
        };

        let (file_key, file_url, etag) = match self.start(&request).await? {
            StartUploadResponse::SinglePut(ticket) => {
                self.single_put(file, ticket, &request.file_type, size, cancel, progress)
                    .await?
            }
            StartUploadResponse::Multipart(ticket) => {
                self.multipart(file, ticket, size, cancel, progress).await?
            }
        };

        let record = self
            .record(&RecordUploadRequest {
                event_id: file.event_id.clone(),
                file_key: file_key.clone(),
                file_name: file.file_name.clone(),
                file_type: file.file_type.clone(),
                file_size: request.file_size,
            })
            .await?;

        info!(key = %file_key, size, "upload finished");
        Ok(UploadedFile {
            file_key,
            file_url,
            etag,
            record,
        })
    }

    async fn single_put(
        &self,
        file: &FileUpload,
        ticket: PresignResponse,
        content_type: &str,
        size: u64,
        cancel: &CancellationToken,
        progress: watch::Sender<UploadProgress>,
    ) -> Result<(String, String, String), ClientError> {
        let body = file.source.slice(0..size).await?;
        let reporter = ProgressReporter::with_sender(&[size], progress);

        let etag = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            result = self.transport.put_object(
                &ticket.upload_url,
                content_type,
                body,
                reporter.part(1, size),
            ) => result?,
        };
        reporter.finish(0, size);

        Ok((ticket.file_key, ticket.file_url, normalize_etag(&etag)))
    }

    async fn multipart(
        &self,
        file: &FileUpload,
        ticket: InitiateResponse,
        size: u64,
        cancel: &CancellationToken,
        progress: watch::Sender<UploadProgress>,
    ) -> Result<(String, String, String), ClientError> {
        match self
            .drive_session(file, &ticket, size, cancel, progress)
            .await
        {
            Ok(etag) => Ok((ticket.file_key, ticket.file_url, etag)),
            Err(err) => {
                warn!(key = %ticket.file_key, error = %err, "upload failed, aborting session");
                if let Err(abort_err) = self.abort(&ticket.file_key, &ticket.upload_id).await {
                    warn!(key = %ticket.file_key, error = %abort_err, "abort failed");
                }
                Err(err)
            }
        }
    }

    async fn drive_session(
        &self,
        file: &FileUpload,
        ticket: &InitiateResponse,
        size: u64,
        cancel: &CancellationToken,
        progress: watch::Sender<UploadProgress>,
    ) -> Result<String, ClientError> {
        if ticket.part_size == 0 || u64::from(ticket.part_count) != size.div_ceil(ticket.part_size) {
            return Err(ClientError::InvalidPlan);
        }
        let plan = PartPlan {
            file_size: size,
            part_size: ticket.part_size,
            part_count: ticket.part_count,
        };
        let sizes = plan
            .part_numbers()
            .filter_map(|n| plan.byte_range(n))
            .map(|range| range.end - range.start)
            .collect::<Vec<_>>();
        let reporter = ProgressReporter::with_sender(&sizes, progress);
        let driver = UploadDriver::new(self.config.concurrency);

        let mut tokens: Vec<PartToken> = Vec::with_capacity(sizes.len());
        let mut pending = plan.part_numbers().collect::<Vec<_>>();
        let mut retries = 0;
        loop {
            let jobs = self.sign_jobs(ticket, &plan, &pending).await?;
            match driver
                .drive(&file.source, jobs, &*self.parts, &reporter, cancel)
                .await
            {
                Ok(done) => tokens.extend(done),
                Err(DriverError::PartsFailed { completed, failed })
                    if retries < self.config.max_part_retries =>
                {
                    tokens.extend(completed);
                    pending = failed.iter().map(|f| f.part_number).collect();
                    retries += 1;
                    warn!(retries, parts = ?pending, "re-uploading failed parts");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            match self
                .complete(&ticket.file_key, &ticket.upload_id, &tokens)
                .await
            {
                Ok(completed) => return Ok(completed.etag),
                Err(ClientError::PartMismatch { part_number })
                    if retries < self.config.max_part_retries
                        && tokens.iter().any(|t| t.part_number == part_number) =>
                {
                    tokens.retain(|t| t.part_number != part_number);
                    pending = vec![part_number];
                    retries += 1;
                    warn!(retries, part_number, "completion rejected part, re-uploading it");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn sign_jobs(
        &self,
        ticket: &InitiateResponse,
        plan: &PartPlan,
        part_numbers: &[u32],
    ) -> Result<Vec<PartJob>, ClientError> {
        let mut urls = HashMap::with_capacity(part_numbers.len());
        for batch in part_numbers.chunks(SIGN_BATCH_SIZE) {
            let signed = self
                .sign_parts(&ticket.file_key, &ticket.upload_id, batch)
                .await?;
            urls.extend(signed.into_iter().map(|s| (s.part_number, s.url)));
        }

        part_numbers
            .iter()
            .map(|&part_number| {
                let range = plan.byte_range(part_number).ok_or(ClientError::InvalidPlan)?;
                let url = urls.remove(&part_number).ok_or(ClientError::InvalidPlan)?;
                Ok(PartJob {
                    part_number,
                    range,
                    url,
                })
            })
            .collect()
    }

    async fn post<B, R>(&self, endpoint: &str, body: &B) -> Result<R, ClientError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self
            .http
            .post(format!("{}/api/uploads/{}", self.base_url, endpoint))
            .json(body);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(match response.json::<ErrorBody>().await {
                Ok(body) => body.into_error(status.as_u16()),
                Err(_) => ClientError::Api {
                    status: status.as_u16(),
                    message: status.to_string(),
                },
            });
        }
        Ok(response.json::<R>().await?)
    }
}
