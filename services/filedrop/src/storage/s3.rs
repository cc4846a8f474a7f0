use super::{
    new_object_id, ListFilter, ObjectEntry, ObjectMetadata, ObjectStore, ObjectStream,
    ReadSource, StoreError, StoredObject, WriteTarget,
};
use crate::config::S3Config;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

const CLIENT_ID_METADATA_KEY: &str = "client-id";
const FILENAME_METADATA_KEY: &str = "filename";
const CONTENT_TYPE: &str = "application/octet-stream";

/// Object store on top of an S3 bucket.
///
/// Every upload is written to `{prefix}{name}/{object_id}`, so uploads
/// never overwrite each other and the newest object for a name is the
/// greatest key under `{prefix}{name}/`.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    key_prefix: String,
    part_size: usize,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            prefix = %config.key_prefix,
            "S3 object store initialized"
        );

        Ok(Self::with_client(client, config))
    }

    /// Wrap an already configured client
    pub fn with_client(client: S3Client, config: &S3Config) -> Self {
        Self {
            client,
            bucket: config.bucket.clone(),
            key_prefix: config.key_prefix.clone(),
            part_size: config.part_size_bytes,
        }
    }

    /// Collect every key belonging to exactly `name`
    async fn keys_for_name(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{}{}/", self.key_prefix, name);
        let key_prefix = self.key_prefix.clone();
        let name = name.to_string();

        list_keys(self.client.clone(), self.bucket.clone(), prefix)
            .try_filter(move |key| {
                let exact = name_from_key(&key_prefix, key) == Some(name.as_str());
                futures::future::ready(exact)
            })
            .try_collect()
            .await
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, metadata), fields(bucket = %self.bucket))]
    async fn begin_write(
        &self,
        name: &str,
        metadata: ObjectMetadata,
    ) -> Result<Box<dyn WriteTarget>, StoreError> {
        // Nothing is sent until a part fills, so check the bucket is reachable now
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| unavailable("Failed to reach bucket", e))?;

        let object_id = new_object_id();
        let key = object_key(&self.key_prefix, name, &object_id);

        debug!(key = %key, "Opening S3 write target");

        Ok(Box::new(S3WriteTarget {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            object_id,
            name: name.to_string(),
            metadata,
            part_size: self.part_size,
            buffer: Vec::new(),
            upload_id: None,
            parts: Vec::new(),
            size_bytes: 0,
        }))
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn begin_read(&self, name: &str) -> Result<ReadSource, StoreError> {
        let key = self
            .keys_for_name(name)
            .await?
            .into_iter()
            .max()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StoreError::NotFound(name.to_string())
                } else {
                    unavailable("Failed to get object", e)
                }
            })?;

        debug!(key = %key, "Opened S3 object for reading");
        Ok(Box::pin(response.body.into_async_read()))
    }

    async fn list(&self, filter: ListFilter) -> Result<ObjectStream, StoreError> {
        let key_prefix = self.key_prefix.clone();
        let keys = list_keys(self.client.clone(), self.bucket.clone(), key_prefix.clone());

        let names = keys.try_filter_map(move |key| {
            let name = name_from_key(&key_prefix, &key).map(String::from);
            futures::future::ready(Ok(name.map(|name| (key, name))))
        });

        let stream = match filter.client_id {
            None => names.map_ok(|(_, name)| ObjectEntry { name }).boxed(),
            Some(client_id) => {
                let client = self.client.clone();
                let bucket = self.bucket.clone();
                names
                    .try_filter_map(move |(key, name)| {
                        let client = client.clone();
                        let bucket = bucket.clone();
                        let wanted = client_id.clone();
                        async move {
                            head_metadata(&client, &bucket, &key).await.map(|metadata| {
                                (metadata.client_id == wanted).then_some(ObjectEntry { name })
                            })
                        }
                    })
                    .boxed()
            }
        };

        Ok(stream)
    }
}

/// Lazily page through every key under `prefix`
fn list_keys(
    client: S3Client,
    bucket: String,
    prefix: String,
) -> impl futures::Stream<Item = Result<String, StoreError>> + Send + 'static {
    // `None` once the last page has been fetched, otherwise the next continuation token
    let start: Option<Option<String>> = Some(None);

    stream::try_unfold(start, move |state| {
        let client = client.clone();
        let bucket = bucket.clone();
        let prefix = prefix.clone();
        async move {
            match state {
                None => Ok(None),
                Some(token) => fetch_page(&client, &bucket, &prefix, token)
                    .await
                    .map(|(keys, next)| Some((stream::iter(keys), next))),
            }
        }
    })
    .try_flatten()
}

type Page = (Vec<Result<String, StoreError>>, Option<Option<String>>);

async fn fetch_page(
    client: &S3Client,
    bucket: &str,
    prefix: &str,
    token: Option<String>,
) -> Result<Page, StoreError> {
    let mut request = client.list_objects_v2().bucket(bucket).prefix(prefix);
    if let Some(token) = token {
        request = request.continuation_token(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| unavailable("Failed to list objects", e))?;

    let keys = response
        .contents()
        .iter()
        .filter_map(|obj| obj.key().map(|key| Ok(key.to_string())))
        .collect();

    let next = match (
        response.is_truncated().unwrap_or(false),
        response.next_continuation_token(),
    ) {
        (true, Some(token)) => Some(Some(token.to_string())),
        _ => None,
    };

    Ok((keys, next))
}

async fn head_metadata(
    client: &S3Client,
    bucket: &str,
    key: &str,
) -> Result<ObjectMetadata, StoreError> {
    let response = client
        .head_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| {
            if e.as_service_error()
                .map(|e| e.is_not_found())
                .unwrap_or(false)
            {
                StoreError::NotFound(key.to_string())
            } else {
                unavailable("Failed to head object", e)
            }
        })?;

    Ok(metadata_from_headers(response.metadata()))
}

fn unavailable<E>(context: &str, err: E) -> StoreError
where
    E: std::error::Error,
{
    StoreError::Unavailable(format!("{}: {}", context, DisplayErrorContext(err)))
}

/// Key an upload is stored under
fn object_key(prefix: &str, name: &str, object_id: &str) -> String {
    format!("{}{}/{}", prefix, name, object_id)
}

/// Recover the object name from a key written by [`object_key`]
fn name_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    let (name, object_id) = rest.rsplit_once('/')?;
    if name.is_empty() || object_id.is_empty() {
        return None;
    }
    Some(name)
}

/// S3 user metadata travels in HTTP headers, so values are percent-encoded
fn encode_metadata_value(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn metadata_from_headers(headers: Option<&HashMap<String, String>>) -> ObjectMetadata {
    let client_id = headers
        .and_then(|headers| headers.get(CLIENT_ID_METADATA_KEY))
        .map(|value| {
            urlencoding::decode(value)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| value.clone())
        })
        .unwrap_or_default();

    ObjectMetadata { client_id }
}

/// Streams an upload into S3.
///
/// Content is buffered up to one part; objects that never fill a part are
/// sent with a single `PutObject`, larger ones go through multipart upload.
struct S3WriteTarget {
    client: S3Client,
    bucket: String,
    key: String,
    object_id: String,
    name: String,
    metadata: ObjectMetadata,
    part_size: usize,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    size_bytes: u64,
}

impl S3WriteTarget {
    async fn ensure_upload(&mut self) -> Result<String, StoreError> {
        if let Some(ref upload_id) = self.upload_id {
            return Ok(upload_id.clone());
        }

        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type(CONTENT_TYPE)
            .metadata(FILENAME_METADATA_KEY, encode_metadata_value(&self.name))
            .metadata(
                CLIENT_ID_METADATA_KEY,
                encode_metadata_value(&self.metadata.client_id),
            )
            .send()
            .await
            .map_err(|e| unavailable("Failed to create multipart upload", e))?;

        let upload_id = response
            .upload_id()
            .ok_or_else(|| StoreError::Unavailable("No upload ID in response".to_string()))?
            .to_string();

        debug!(key = %self.key, upload_id = %upload_id, "Started multipart upload");
        self.upload_id = Some(upload_id.clone());
        Ok(upload_id)
    }

    async fn flush_part(&mut self) -> Result<(), StoreError> {
        let upload_id = self.ensure_upload().await?;
        let part_number = self.parts.len() as i32 + 1;
        let body = ByteStream::from(std::mem::take(&mut self.buffer));

        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(body)
            .send()
            .await
            .map_err(|e| unavailable("Failed to upload part", e))?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .e_tag(response.e_tag().unwrap_or_default())
                .build(),
        );
        self.buffer.reserve(self.part_size);
        Ok(())
    }

    async fn put_single(&mut self) -> Result<(), StoreError> {
        let body = ByteStream::from(std::mem::take(&mut self.buffer));

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(body)
            .content_type(CONTENT_TYPE)
            .metadata(FILENAME_METADATA_KEY, encode_metadata_value(&self.name))
            .metadata(
                CLIENT_ID_METADATA_KEY,
                encode_metadata_value(&self.metadata.client_id),
            )
            .send()
            .await
            .map_err(|e| unavailable("Failed to upload object", e))?;

        Ok(())
    }

    async fn complete(&mut self, upload_id: &str) -> Result<(), StoreError> {
        if !self.buffer.is_empty() || self.parts.is_empty() {
            self.flush_part().await?;
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| unavailable("Failed to complete multipart upload", e))?;

        Ok(())
    }

    async fn abort(&self, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(
                key = %self.key,
                error = %DisplayErrorContext(e),
                "Failed to abort multipart upload"
            );
        }
    }
}

#[async_trait]
impl WriteTarget for S3WriteTarget {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.buffer.extend_from_slice(chunk);
        self.size_bytes += chunk.len() as u64;

        if self.buffer.len() >= self.part_size {
            self.flush_part().await?;
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<StoredObject, StoreError> {
        match self.upload_id.clone() {
            None => self.put_single().await?,
            Some(upload_id) => {
                if let Err(e) = self.complete(&upload_id).await {
                    self.abort(&upload_id).await;
                    return Err(e);
                }
            }
        }

        info!(
            key = %self.key,
            size_bytes = self.size_bytes,
            parts = self.parts.len(),
            "Object uploaded to S3"
        );

        Ok(StoredObject {
            id: self.object_id.clone(),
            name: self.name.clone(),
            size_bytes: self.size_bytes,
        })
    }
}
