//! S3-backed [`ObjectStore`]: the object-store half of C1.
//!
//! `aws-sdk-s3` is natively async; the rest of the pipeline is
//! synchronous (spec §5 does not mandate async), so this adapter owns a
//! small current-thread Tokio runtime and blocks on it per call, the same
//! way a CLI wrapping an async SDK commonly does.

use anyhow::anyhow;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use super::{ClassifiedError, ObjectDescriptor, ObjectStore};
use crate::error::ErrorKind;

pub struct S3Store {
    client: Client,
    bucket: String,
    runtime: tokio::runtime::Runtime,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { client, bucket: bucket.into(), runtime })
    }

    /// Build a store using the ambient AWS config (environment, profile,
    /// or instance credentials) resolved via `aws-config`.
    pub fn from_env(bucket: impl Into<String>) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let config = runtime.block_on(aws_config::load_from_env());
        let client = Client::new(&config);
        Ok(Self { client, bucket: bucket.into(), runtime })
    }

    fn classify(err: impl std::fmt::Display + Send + Sync + 'static, status: Option<u16>) -> ClassifiedError {
        let kind = match status {
            Some(403) | Some(401) | Some(404) => ErrorKind::Fatal,
            Some(412) => ErrorKind::Conflict,
            Some(s) if s >= 500 => ErrorKind::Transient,
            Some(429) => ErrorKind::Transient,
            _ => ErrorKind::Transient,
        };
        ClassifiedError::new(kind, anyhow!("{err}"))
    }
}

impl ObjectStore for S3Store {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ClassifiedError> {
        self.runtime.block_on(async {
            let body = ByteStream::from(bytes.to_vec());
            let resp = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|e| Self::classify(e, None))?;
            Ok(resp.e_tag().unwrap_or_default().to_string())
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ClassifiedError> {
        self.runtime.block_on(async {
            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Self::classify(e, None))?;
            let data = resp
                .body
                .collect()
                .await
                .map_err(|e| ClassifiedError::new(ErrorKind::Transient, anyhow!(e)))?;
            Ok(data.into_bytes().to_vec())
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>, ClassifiedError> {
        self.runtime.block_on(async {
            let mut out = Vec::new();
            let mut continuation = None;
            loop {
                let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
                if let Some(token) = continuation.take() {
                    req = req.continuation_token(token);
                }
                let resp = req.send().await.map_err(|e| Self::classify(e, None))?;
                for obj in resp.contents() {
                    out.push(ObjectDescriptor {
                        key: obj.key().unwrap_or_default().to_string(),
                        size: obj.size().unwrap_or(0) as u64,
                        mtime: obj
                            .last_modified()
                            .and_then(|d| chrono::DateTime::from_timestamp(d.secs(), 0))
                            .unwrap_or_else(chrono::Utc::now),
                    });
                }
                if resp.is_truncated().unwrap_or(false) {
                    continuation = resp.next_continuation_token().map(|s| s.to_string());
                } else {
                    break;
                }
            }
            Ok(out)
        })
    }

    fn delete(&self, key: &str) -> Result<(), ClassifiedError> {
        self.runtime.block_on(async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| Self::classify(e, None))?;
            Ok(())
        })
    }

    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<(), ClassifiedError> {
        self.runtime.block_on(async {
            let body = ByteStream::from(bytes.to_vec());
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                // Conditional put: only succeed if the key doesn't exist yet.
                .if_none_match("*")
                .send()
                .await
                .map_err(|e| Self::classify(e, Some(412)))?;
            Ok(())
        })
    }
}
