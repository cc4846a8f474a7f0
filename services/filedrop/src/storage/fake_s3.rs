//! In-process stand-in for the S3 endpoints the write path uses.
//!
//! Understands `HeadBucket`, `PutObject` and the multipart calls, records
//! every call it sees, and can be told to fail a given part or the final
//! `CompleteMultipartUpload`.

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client as S3Client;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const BUCKET: &str = "uploads";

/// Object as the fake holds it once a put or multipart upload finished
#[derive(Debug, Clone)]
pub struct FakeObject {
    pub key: String,
    pub body: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

struct Upload {
    key: String,
    metadata: HashMap<String, String>,
    parts: BTreeMap<i32, Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    objects: Vec<FakeObject>,
    uploads: HashMap<String, Upload>,
    calls: Vec<String>,
    fail_part: Option<i32>,
    fail_complete: bool,
    next_upload: u32,
}

#[derive(Clone)]
pub struct FakeS3 {
    endpoint: String,
    inner: Arc<Mutex<Inner>>,
}

impl FakeS3 {
    pub async fn start() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let app = Router::new().fallback(handle).with_state(inner.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await });

        Self { endpoint, inner }
    }

    pub fn client(&self) -> S3Client {
        client_for(&self.endpoint)
    }

    pub fn fail_part(&self, part_number: i32) {
        self.inner.lock().fail_part = Some(part_number);
    }

    pub fn fail_complete(&self) {
        self.inner.lock().fail_complete = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn objects(&self) -> Vec<FakeObject> {
        self.inner.lock().objects.clone()
    }
}

/// Client with static credentials and no retries, pointed at `endpoint`
pub fn client_for(endpoint: &str) -> S3Client {
    let config = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .endpoint_url(endpoint)
        .force_path_style(true)
        .credentials_provider(Credentials::new("test", "test", None, None, "static"))
        .retry_config(RetryConfig::disabled())
        .build();
    S3Client::from_conf(config)
}

async fn handle(
    State(inner): State<Arc<Mutex<Inner>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().trim_start_matches('/');
    let (bucket, key) = path.split_once('/').unwrap_or((path, ""));
    let key = urlencoding::decode(key).unwrap().into_owned();
    let query = parse_query(uri.query().unwrap_or_default());

    let mut inner = inner.lock();
    if bucket != BUCKET {
        inner.calls.push(format!("{} {}", method, bucket));
        return StatusCode::NOT_FOUND.into_response();
    }

    let body = if is_aws_chunked(&headers) {
        decode_aws_chunked(&body)
    } else {
        body.to_vec()
    };

    match (method, query.get("uploadId"), query.get("partNumber")) {
        (Method::HEAD, _, _) if key.is_empty() => {
            inner.calls.push("HeadBucket".to_string());
            StatusCode::OK.into_response()
        }
        (Method::PUT, None, _) => {
            inner.calls.push("PutObject".to_string());
            inner.objects.push(FakeObject {
                key,
                body,
                metadata: user_metadata(&headers),
            });
            etag("object")
        }
        (Method::POST, None, _) if query.contains_key("uploads") => {
            inner.calls.push("CreateMultipartUpload".to_string());
            inner.next_upload += 1;
            let upload_id = format!("upload-{}", inner.next_upload);
            inner.uploads.insert(
                upload_id.clone(),
                Upload {
                    key: key.clone(),
                    metadata: user_metadata(&headers),
                    parts: BTreeMap::new(),
                },
            );
            xml(format!(
                "<InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key>\
                 <UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                BUCKET, key, upload_id
            ))
        }
        (Method::PUT, Some(upload_id), Some(part_number)) => {
            let part_number: i32 = part_number.parse().unwrap();
            inner.calls.push(format!("UploadPart {}", part_number));
            if inner.fail_part == Some(part_number) {
                return internal_error();
            }
            match inner.uploads.get_mut(upload_id) {
                Some(upload) => {
                    upload.parts.insert(part_number, body);
                    etag(&format!("part-{}", part_number))
                }
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }
        (Method::POST, Some(upload_id), None) => {
            inner.calls.push("CompleteMultipartUpload".to_string());
            if inner.fail_complete {
                return internal_error();
            }
            let Some(upload) = inner.uploads.remove(upload_id) else {
                return StatusCode::NOT_FOUND.into_response();
            };
            let listed = listed_part_numbers(&String::from_utf8_lossy(&body));
            let assembled = upload
                .parts
                .iter()
                .filter(|(number, _)| listed.contains(number))
                .flat_map(|(_, bytes)| bytes.iter().copied())
                .collect();
            inner.objects.push(FakeObject {
                key: upload.key.clone(),
                body: assembled,
                metadata: upload.metadata,
            });
            xml(format!(
                "<CompleteMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key>\
                 <ETag>\"complete\"</ETag></CompleteMultipartUploadResult>",
                BUCKET, upload.key
            ))
        }
        (Method::DELETE, Some(upload_id), None) => {
            inner.calls.push("AbortMultipartUpload".to_string());
            inner.uploads.remove(upload_id);
            StatusCode::NO_CONTENT.into_response()
        }
        (method, _, _) => {
            inner.calls.push(format!("{} {}", method, uri));
            StatusCode::NOT_IMPLEMENTED.into_response()
        }
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), urlencoding::decode(v).unwrap().into_owned()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn user_metadata(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix("x-amz-meta-")?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

fn listed_part_numbers(body: &str) -> Vec<i32> {
    body.split("<PartNumber>")
        .skip(1)
        .filter_map(|rest| rest.split('<').next()?.trim().parse().ok())
        .collect()
}

fn is_aws_chunked(headers: &HeaderMap) -> bool {
    let encoded = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("aws-chunked"))
        .unwrap_or(false);
    encoded || headers.contains_key("x-amz-decoded-content-length")
}

/// Strip `aws-chunked` framing: `<hex len>[;ext]\r\n<data>\r\n` until a zero chunk
fn decode_aws_chunked(mut rest: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(eol) = rest.windows(2).position(|w| w == b"\r\n") {
        let line = String::from_utf8_lossy(&rest[..eol]);
        let size_hex = line.split(';').next().unwrap_or_default().trim().to_string();
        let size = usize::from_str_radix(&size_hex, 16).unwrap_or(0);
        rest = &rest[eol + 2..];
        if size == 0 {
            break;
        }
        out.extend_from_slice(&rest[..size]);
        rest = &rest[(size + 2).min(rest.len())..];
    }
    out
}

fn etag(tag: &str) -> Response {
    (StatusCode::OK, [(header::ETAG, format!("\"{}\"", tag))]).into_response()
}

fn xml(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}", body),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/xml")],
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Error><Code>InternalError</Code><Message>injected failure</Message></Error>",
    )
        .into_response()
}
