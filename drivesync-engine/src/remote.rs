//! Remote drive client
//!
//! Thin contract over the cloud file store plus the production `reqwest`
//! implementation. A transient connection error retries exactly once after
//! a 2-second pause; everything else propagates to the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use drivesync_core::{Result, SyncConfig, SyncError};

use crate::record::{Change, ChangePage, FileList, FileRecord, RecordPatch};

/// Pause before the single retry of a transient failure
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Field selector applied to every record the engine touches
const RECORD_FIELDS: &str = "id,name,mimeType,md5Checksum,size,modifiedTime,parents,trashed";

/// Contract over the cloud service. The engine only ever talks to this
/// trait; tests substitute an in-memory fake.
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// `None` when the service reports not-found; other errors propagate
    async fn get_record(&self, id: &str) -> Result<Option<FileRecord>>;

    async fn list_children(&self, parent_id: &str, page_token: Option<&str>) -> Result<FileList>;

    async fn create_file(
        &self,
        metadata: RecordPatch,
        content: Option<Vec<u8>>,
    ) -> Result<FileRecord>;

    async fn update_content(&self, id: &str, content: Vec<u8>) -> Result<FileRecord>;

    async fn update_metadata(&self, id: &str, patch: RecordPatch) -> Result<FileRecord>;

    async fn delete_record(&self, id: &str) -> Result<()>;

    async fn trash_record(&self, id: &str) -> Result<FileRecord>;

    async fn download(&self, id: &str) -> Result<Vec<u8>>;

    async fn changes_since(&self, token: &str, page_token: Option<&str>) -> Result<ChangePage>;

    async fn start_page_token(&self) -> Result<String>;
}

/// Drain every page of the change feed starting at `token`, concatenating
/// changes and surfacing the newest start token the server handed back.
pub async fn drain_changes(
    client: &Arc<dyn RemoteDrive>,
    token: &str,
) -> Result<(Vec<Change>, Option<String>)> {
    let mut changes = Vec::new();
    let mut new_start_token = None;
    let mut page_token: Option<String> = None;

    loop {
        let page = client.changes_since(token, page_token.as_deref()).await?;
        changes.extend(page.changes);
        if page.new_start_page_token.is_some() {
            new_start_token = page.new_start_page_token;
        }
        match page.next_page_token {
            Some(next) => page_token = Some(next),
            None => break,
        }
    }

    Ok((changes, new_start_token))
}

/// Retry `op` once after [`RETRY_DELAY`] when it fails transiently.
pub async fn with_retry<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            warn!("Transient remote failure, retrying once: {}", e);
            tokio::time::sleep(RETRY_DELAY).await;
            op().await
        }
        other => other,
    }
}

/// Production client over the Drive-style REST API
pub struct DriveClient {
    http: Client,
    api_base: String,
    upload_base: String,
    token: String,
    page_size: u32,
}

impl DriveClient {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: config.api_base_url.trim_end_matches('/').to_string(),
            upload_base: config.upload_base_url.trim_end_matches('/').to_string(),
            token: config.access_token.clone(),
            page_size: config.page_size,
        })
    }

    fn map_transport(e: reqwest::Error) -> SyncError {
        if e.is_connect() || e.is_timeout() {
            SyncError::Transient(e.to_string())
        } else {
            SyncError::Remote(e.to_string())
        }
    }

    /// Convert a non-success response into an error, keeping the body for
    /// diagnostics
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(body));
        }
        Err(SyncError::Remote(format!("HTTP {}: {}", status, body)))
    }

    async fn json_of<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T> {
        Self::check(response)
            .await?
            .json::<T>()
            .await
            .map_err(|e| SyncError::Remote(format!("decode: {}", e)))
    }

    async fn get_record_once(&self, id: &str) -> Result<Option<FileRecord>> {
        let response = self
            .http
            .get(format!("{}/files/{}", self.api_base, id))
            .bearer_auth(&self.token)
            .query(&[("fields", RECORD_FIELDS)])
            .send()
            .await
            .map_err(Self::map_transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::json_of(response).await?))
    }

    async fn list_children_once(
        &self,
        parent_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileList> {
        let query = format!("trashed = false and \"{}\" in parents", parent_id);
        let fields = format!("nextPageToken,files({})", RECORD_FIELDS);
        let mut request = self
            .http
            .get(format!("{}/files", self.api_base))
            .bearer_auth(&self.token)
            .query(&[
                ("q", query.as_str()),
                ("corpora", "user"),
                ("spaces", "drive"),
                ("fields", fields.as_str()),
            ])
            .query(&[("pageSize", self.page_size)]);
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }

        let response = request.send().await.map_err(Self::map_transport)?;
        Self::json_of(response).await
    }

    async fn changes_once(&self, token: &str, page_token: Option<&str>) -> Result<ChangePage> {
        let fields = format!(
            "nextPageToken,newStartPageToken,changes(fileId,removed,file({}))",
            RECORD_FIELDS
        );
        let response = self
            .http
            .get(format!("{}/changes", self.api_base))
            .bearer_auth(&self.token)
            .query(&[
                ("pageToken", page_token.unwrap_or(token)),
                ("spaces", "drive"),
                ("restrictToMyDrive", "true"),
                ("fields", fields.as_str()),
            ])
            .query(&[("pageSize", self.page_size)])
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::json_of(response).await
    }

    async fn update_content_once(&self, id: &str, content: &[u8]) -> Result<FileRecord> {
        let response = self
            .http
            .patch(format!("{}/files/{}", self.upload_base, id))
            .bearer_auth(&self.token)
            .query(&[("uploadType", "media"), ("fields", RECORD_FIELDS)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content.to_vec())
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::json_of(response).await
    }

    async fn create_once(&self, metadata: &RecordPatch) -> Result<FileRecord> {
        let response = self
            .http
            .post(format!("{}/files", self.api_base))
            .bearer_auth(&self.token)
            .query(&[("fields", RECORD_FIELDS)])
            .json(metadata)
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::json_of(response).await
    }

    async fn update_metadata_once(&self, id: &str, patch: &RecordPatch) -> Result<FileRecord> {
        let response = self
            .http
            .patch(format!("{}/files/{}", self.api_base, id))
            .bearer_auth(&self.token)
            .query(&[("fields", RECORD_FIELDS)])
            .json(patch)
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::json_of(response).await
    }

    async fn delete_once(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/files/{}", self.api_base, id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::check(response).await.map(|_| ())
    }

    async fn download_once(&self, id: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(format!("{}/files/{}", self.api_base, id))
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(Self::map_transport)?;
        let response = Self::check(response).await?;
        let bytes = response.bytes().await.map_err(Self::map_transport)?;
        Ok(bytes.to_vec())
    }

    async fn start_token_once(&self) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct StartToken {
            start_page_token: String,
        }

        let response = self
            .http
            .get(format!("{}/changes/startPageToken", self.api_base))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::map_transport)?;
        let token: StartToken = Self::json_of(response).await?;
        Ok(token.start_page_token)
    }
}

#[async_trait]
impl RemoteDrive for DriveClient {
    async fn get_record(&self, id: &str) -> Result<Option<FileRecord>> {
        with_retry(|| self.get_record_once(id)).await
    }

    async fn list_children(&self, parent_id: &str, page_token: Option<&str>) -> Result<FileList> {
        with_retry(|| self.list_children_once(parent_id, page_token)).await
    }

    async fn create_file(
        &self,
        metadata: RecordPatch,
        content: Option<Vec<u8>>,
    ) -> Result<FileRecord> {
        let created = with_retry(|| self.create_once(&metadata)).await?;
        debug!(id = %created.id, name = %created.name, "Created remote record");

        match content {
            Some(bytes) => self.update_content(&created.id, bytes).await,
            None => Ok(created),
        }
    }

    async fn update_content(&self, id: &str, content: Vec<u8>) -> Result<FileRecord> {
        with_retry(|| self.update_content_once(id, &content)).await
    }

    async fn update_metadata(&self, id: &str, patch: RecordPatch) -> Result<FileRecord> {
        with_retry(|| self.update_metadata_once(id, &patch)).await
    }

    async fn delete_record(&self, id: &str) -> Result<()> {
        with_retry(|| self.delete_once(id)).await
    }

    async fn trash_record(&self, id: &str) -> Result<FileRecord> {
        self.update_metadata(
            id,
            RecordPatch {
                trashed: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>> {
        with_retry(|| self.download_once(id)).await
    }

    async fn changes_since(&self, token: &str, page_token: Option<&str>) -> Result<ChangePage> {
        with_retry(|| self.changes_once(token, page_token)).await
    }

    async fn start_page_token(&self) -> Result<String> {
        with_retry(|| self.start_token_once()).await
    }
}
