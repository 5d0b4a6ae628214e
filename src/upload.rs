//! Upload gateway: push a finished trace file to object storage.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::{Path, PathBuf};

/// Errors from an upload attempt.
#[derive(Debug)]
pub enum UploadError {
    /// The local file could not be opened or read.
    Read { path: PathBuf, message: String },
    /// The storage service rejected or failed the request.
    Remote {
        bucket: String,
        key: String,
        message: String,
    },
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Read { path, message } => {
                write!(f, "failed to read {}: {}", path.display(), message)
            }
            UploadError::Remote {
                bucket,
                key,
                message,
            } => write!(f, "failed to upload to s3://{bucket}/{key}: {message}"),
        }
    }
}

impl std::error::Error for UploadError {}

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `local_path` to `bucket` under `key`.
    async fn upload(&self, local_path: &Path, bucket: &str, key: &str) -> Result<(), UploadError>;
}

/// [`Uploader`] backed by Amazon S3 (or an S3-compatible endpoint).
#[derive(Debug, Clone)]
pub struct S3Uploader {
    client: Client,
}

impl S3Uploader {
    pub fn new(client: Client) -> Self {
        S3Uploader { client }
    }

    /// Build a client from the default credential/region chain.
    pub async fn new_with_default_config(endpoint: Option<String>, path_style: bool) -> Self {
        let sdk_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        s3_config_builder.set_endpoint_url(endpoint); // For local S3 storage, i.e: Minio
        s3_config_builder.set_force_path_style(Some(path_style));

        S3Uploader::new(Client::from_conf(s3_config_builder.build()))
    }
}

/// MIME type for a trace file, from its extension.
fn content_type_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Some("application/json"),
        Some("txt") => Some("text/plain"),
        Some("svg") => Some("image/svg+xml"),
        _ => None,
    }
}

#[async_trait]
impl Uploader for S3Uploader {
    async fn upload(&self, local_path: &Path, bucket: &str, key: &str) -> Result<(), UploadError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| UploadError::Read {
                path: local_path.to_path_buf(),
                message: e.to_string(),
            })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type_for(local_path).map(str::to_string))
            .body(body)
            .send()
            .await
            .map_err(|err| UploadError::Remote {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            })?;

        tracing::info!(bucket, key, "uploaded trace file");
        Ok(())
    }
}
