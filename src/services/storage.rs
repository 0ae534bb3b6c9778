use async_trait::async_trait;
use bytes::Bytes;
use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Bytes plus the content type they were stored with.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PutObject {
    pub key: String,
    pub bytes: Bytes,
    pub content_type: String,
}

/// Byte-level access to transient job binaries. Shared by every worker; a
/// given input key is only ever deleted by the processor that owns its job.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object_buffer(&self, key: &str) -> Result<StoredObject, StorageError>;

    async fn put_object_buffer(&self, object: PutObject) -> Result<(), StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;
}

/// S3-compatible object storage client (R2, MinIO, AWS).
pub struct S3ObjectStore {
    bucket: Box<Bucket>,
}

impl S3ObjectStore {
    pub fn new(
        bucket_name: &str,
        region: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }
}

fn check_status(key: &str, code: u16) -> Result<(), StorageError> {
    match code {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        _ => Err(StorageError::Status {
            key: key.to_string(),
            code,
        }),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object_buffer(&self, key: &str) -> Result<StoredObject, StorageError> {
        let response = self.bucket.get_object(key).await?;
        check_status(key, response.status_code())?;

        let content_type = response
            .headers()
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone());

        Ok(StoredObject {
            bytes: response.bytes().clone(),
            content_type,
        })
    }

    async fn put_object_buffer(&self, object: PutObject) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(&object.key, &object.bytes, &object.content_type)
            .await?;
        check_status(&object.key, response.status_code())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(key).await?;
        // S3 answers 204 for both existing and absent keys.
        check_status(key, response.status_code())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object storage returned status {code} for {key}")]
    Status { key: String, code: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
