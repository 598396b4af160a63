//! AWS SDK S3 object store.

use std::ops::Range;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use chrono::{DateTime, Utc};

use super::{ObjectStore, StorageError, StorageObject, UploadBody, next_chunk};

/// Smallest part size S3 accepts for every part but the last.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Connection settings for [`S3Store`].
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Bucket holding every namespace
    pub bucket: String,
    /// Region override; the default provider chain is used when unset
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services (enables path-style addressing)
    pub endpoint_url: Option<String>,
    /// Multipart upload part size in bytes
    pub part_size: usize,
}

impl S3Config {
    /// Settings for `bucket` with default region, endpoint and part size.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: None,
            endpoint_url: None,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    /// Use an explicit region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Talk to a custom endpoint.
    pub fn with_endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint_url.into());
        self
    }

    /// Set the multipart part size, raised to [`MIN_PART_SIZE`] if smaller.
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(MIN_PART_SIZE);
        self
    }
}

/// [`ObjectStore`] backed by a single S3 bucket.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: S3Client,
    bucket: String,
    part_size: usize,
}

struct MultipartUpload {
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
}

impl S3Store {
    /// Build a store using the default AWS credential chain.
    pub async fn from_env(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(ref region) = config.region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url).force_path_style(true);
        }

        Self::from_client(S3Client::from_conf(builder.build()), config)
    }

    /// Build a store from a pre-configured client.
    pub fn from_client(client: S3Client, config: S3Config) -> Self {
        Self {
            client,
            bucket: config.bucket,
            part_size: config.part_size.max(MIN_PART_SIZE),
        }
    }

    async fn start_multipart(&self, key: &str) -> Result<MultipartUpload, StorageError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(backend_error)?;

        let upload_id = response
            .upload_id()
            .ok_or_else(|| StorageError::UploadAborted {
                key: key.to_string(),
                reason: "no upload id returned".to_string(),
            })?
            .to_string();

        tracing::debug!(key = %key, upload_id = %upload_id, "started multipart upload");
        Ok(MultipartUpload {
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
        })
    }

    async fn upload_part(
        &self,
        upload: &mut MultipartUpload,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        let part_number =
            i32::try_from(upload.parts.len() + 1).map_err(|_| StorageError::UploadAborted {
                key: upload.key.clone(),
                reason: "too many parts".to_string(),
            })?;

        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(backend_error)?;

        upload.parts.push(
            CompletedPart::builder()
                .set_e_tag(response.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn complete(&self, upload: &MultipartUpload) -> Result<(), StorageError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(upload.parts.clone()))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn abort(&self, upload: &MultipartUpload) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&upload.key)
            .upload_id(&upload.upload_id)
            .send()
            .await;
        if let Err(err) = result {
            tracing::warn!(
                key = %upload.key,
                upload_id = %upload.upload_id,
                error = %DisplayErrorContext(&err),
                "failed to abort multipart upload"
            );
        }
    }

    async fn finish(
        &self,
        upload: &mut MultipartUpload,
        tail: Vec<u8>,
    ) -> Result<(), StorageError> {
        if !tail.is_empty() {
            self.upload_part(upload, tail).await?;
        }
        self.complete(upload).await
    }
}

fn backend_error<E: std::error::Error>(err: E) -> StorageError {
    StorageError::Backend(DisplayErrorContext(err).to_string())
}

fn to_utc(timestamp: &S3DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}

fn range_header(range: &Range<u64>) -> String {
    format!("bytes={}-{}", range.start, range.end - 1)
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix: &str) -> Result<Vec<StorageObject>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(backend_error)?;

            for object in response.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                objects.push(StorageObject {
                    key: key.to_string(),
                    size: object
                        .size()
                        .and_then(|s| u64::try_from(s).ok())
                        .unwrap_or(0),
                    last_modified: object
                        .last_modified()
                        .and_then(to_utc)
                        .unwrap_or_else(Utc::now),
                });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated() == Some(true) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>, StorageError> {
        if range.start >= range.end {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range_header(&range))
            .send()
            .await
            .map_err(|err| {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    StorageError::NotFound(key.to_string())
                } else {
                    backend_error(service_err)
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(backend_error)?
            .into_bytes()
            .to_vec();
        Ok(data)
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn upload(&self, key: &str, mut body: UploadBody) -> Result<(), StorageError> {
        let mut buffer = Vec::with_capacity(self.part_size);
        let mut multipart: Option<MultipartUpload> = None;

        loop {
            let chunk = match next_chunk(&mut body, key).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    if let Some(ref upload) = multipart {
                        self.abort(upload).await;
                    }
                    tracing::warn!(key = %key, error = %err, "upload abandoned");
                    return Err(err);
                }
            };
            buffer.extend_from_slice(&chunk);
            if buffer.len() < self.part_size {
                continue;
            }

            let part = std::mem::replace(&mut buffer, Vec::with_capacity(self.part_size));
            if multipart.is_none() {
                multipart = Some(self.start_multipart(key).await?);
            }
            if let Some(ref mut upload) = multipart {
                if let Err(err) = self.upload_part(upload, part).await {
                    self.abort(upload).await;
                    return Err(err);
                }
            }
        }

        // Bodies smaller than one part never start a multipart upload.
        let Some(mut upload) = multipart else {
            return self.put(key, buffer).await;
        };

        if let Err(err) = self.finish(&mut upload, buffer).await {
            self.abort(&upload).await;
            return Err(err);
        }
        tracing::debug!(key = %key, parts = upload.parts.len(), "completed multipart upload");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(backend_error)?;
        Ok(())
    }
}
