use async_trait::async_trait;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not_found")]
    NotFound,
    #[error("other: {0}")]
    Other(String),
}

/// Which attachment slot of a report a blob belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    ScreenshotOriginal,
    ScreenshotSanitized,
    ConsoleLogs,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::ScreenshotOriginal => "screenshot_original",
            AttachmentKind::ScreenshotSanitized => "screenshot_sanitized",
            AttachmentKind::ConsoleLogs => "console_logs",
        }
    }

    pub fn parse(s: &str) -> Option<AttachmentKind> {
        match s {
            "screenshot_original" => Some(AttachmentKind::ScreenshotOriginal),
            "screenshot_sanitized" => Some(AttachmentKind::ScreenshotSanitized),
            "console_logs" => Some(AttachmentKind::ConsoleLogs),
            _ => None,
        }
    }
}

/// Store keys are scoped by the report's external id so one report's
/// attachments never collide with another's.
pub fn attachment_key(external_id: &str, kind: AttachmentKind) -> String {
    format!("{}/{}", external_id, kind.as_str())
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), StoreError>;
    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

// ---------------- Filesystem implementation (dev / tests) ----------------

pub struct FsAttachmentStore {
    root: PathBuf,
}

impl FsAttachmentStore {
    pub fn new() -> Self {
        let mut root = std::env::var("BUGRELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        root.push("attachments");
        Self { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are "{external_id}/{kind}"; keep that as the directory layout.
        self.root.join(key)
    }

    fn mime_path_for(&self, key: &str) -> PathBuf {
        let mut p = self.path_for(key);
        p.set_extension("mime");
        p
    }
}

impl Default for FsAttachmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AttachmentStore for FsAttachmentStore {
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::Other(e.to_string()))?;
        }
        std::fs::write(&path, bytes).map_err(|e| StoreError::Other(e.to_string()))?;
        std::fs::write(self.mime_path_for(key), mime)
            .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), StoreError> {
        let bytes = std::fs::read(self.path_for(key)).map_err(|_| StoreError::NotFound)?;
        let mime = std::fs::read_to_string(self.mime_path_for(key))
            .unwrap_or_else(|_| sniff_mime(&bytes));
        Ok((bytes, mime))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _ = std::fs::remove_file(self.path_for(key));
        let _ = std::fs::remove_file(self.mime_path_for(key));
        Ok(())
    }
}

fn sniff_mime(bytes: &[u8]) -> String {
    infer::get(bytes)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".into())
}

// ---------------- S3 implementation (MinIO compatible) ----------------

pub struct S3AttachmentStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    prefix: String,
}

impl S3AttachmentStore {
    pub async fn new() -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "bugrelay-attachments".into());
        let endpoint = std::env::var("S3_ENDPOINT")
            .map_err(|_| anyhow::anyhow!("S3_ENDPOINT must be set (MinIO / S3 endpoint)"))?;
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
        let access = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
        let secret = std::env::var("S3_SECRET_KEY").unwrap_or_default();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region));
        loader = loader.endpoint_url(endpoint);
        if !access.is_empty() && !secret.is_empty() {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        // Path-style addressing; required for most MinIO/local endpoints.
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("Initialized S3/MinIO attachment store");

        // Ensure bucket exists (create if missing).
        if client.head_bucket().bucket(&bucket).send().await.is_err() {
            let mut attempt = 0u32;
            let max_attempts = 8;
            loop {
                attempt += 1;
                match client.create_bucket().bucket(&bucket).send().await {
                    Ok(_) => {
                        info!("created bucket '{bucket}' (attempt {attempt})");
                        break;
                    }
                    Err(e) => {
                        if attempt >= max_attempts {
                            error!("create_bucket failed for '{bucket}' after {attempt} attempts: {e:?}");
                            return Err(anyhow::anyhow!("failed to ensure bucket '{bucket}': {e}"));
                        }
                        let backoff_ms = 200 * attempt.pow(2);
                        warn!("create_bucket attempt {attempt} failed for '{bucket}': {e:?} (retrying in {backoff_ms}ms)");
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms as u64))
                            .await;
                    }
                }
            }
        }

        Ok(Self {
            bucket,
            client,
            prefix: "reports".into(),
        })
    }

    fn key_for(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

#[async_trait]
impl AttachmentStore for S3AttachmentStore {
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), StoreError> {
        use aws_sdk_s3::primitives::ByteStream;
        let object_key = self.key_for(key);
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(mime);
        if let Err(e) = put.send().await {
            error!(
                "put_object failed key={object_key} bucket={} err={:?}",
                self.bucket, e
            );
            return Err(StoreError::Other(e.to_string()));
        }
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), StoreError> {
        let object_key = self.key_for(key);
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|_| StoreError::NotFound)?;
        let mime = obj
            .content_type()
            .map(|s| s.to_string())
            .unwrap_or_default();
        let data = obj
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let bytes = Vec::from(data.into_bytes().as_ref());
        let mime = if mime.is_empty() { sniff_mime(&bytes) } else { mime };
        Ok((bytes, mime))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        // Best-effort delete: treat not found as success.
        let _ = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key_for(key))
            .send()
            .await;
        Ok(())
    }
}

/// Factory used in `main`: S3 when an endpoint is configured, local
/// filesystem otherwise.
pub async fn build_attachment_store() -> Arc<dyn AttachmentStore> {
    if std::env::var("S3_ENDPOINT").is_ok() {
        match S3AttachmentStore::new().await {
            Ok(store) => return Arc::new(store),
            Err(e) => panic!("Failed to initialize S3 attachment store: {e}"),
        }
    }
    info!("Using filesystem attachment store");
    Arc::new(FsAttachmentStore::new())
}
