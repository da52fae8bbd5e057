//! Transport contract and the bundled reqwest implementation

use super::{
    body::{collect_limited, Body, Part},
    RequestKind,
};
use crate::error::{status_error, Error};
use async_trait::async_trait;
use bytes::Bytes;
use dyn_clone::{clone_trait_object, DynClone};
use flate2::{write::GzEncoder, Compression};
use http::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_ENCODING, CONTENT_TYPE, DATE},
    Method,
    StatusCode,
};
use httpdate::fmt_http_date;
use reqwest_middleware::ClientWithMiddleware;
use std::{
    io::Write,
    time::{Duration, SystemTime},
};
use tracing::{debug, warn};
use url::Url;

/// Status and headers of an HTTP exchange, kept after the body is consumed.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    /// HTTP status of the response
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
}

/// The `(response, result, error)` triple produced by one attempt.
///
/// `error` is `None` exactly when the attempt succeeded. A failed attempt may
/// still carry a `response` (the remote answered with a non-success status)
/// and a decoded `result` (an error body).
#[derive(Debug)]
pub struct AttemptOutcome<R> {
    /// Response head, if the remote answered at all
    pub response: Option<ResponseHead>,
    /// Decoded response payload, if one was produced
    pub result: Option<R>,
    /// The failure, absent on success
    pub error: Option<Error>,
}

impl<R> AttemptOutcome<R> {
    /// A successful outcome.
    pub fn success(response: ResponseHead, result: Option<R>) -> Self {
        Self {
            response: Some(response),
            result,
            error: None,
        }
    }

    /// A failed outcome, with or without a response head.
    pub fn failure(response: Option<ResponseHead>, error: Error) -> Self {
        Self {
            response,
            result: None,
            error: Some(error),
        }
    }

    /// Whether this outcome is worth retrying.
    pub fn is_transient(&self) -> bool {
        self.error.as_ref().is_some_and(Error::is_transient)
    }
}

/// One outbound operation handed to a [`Transport`].
///
/// Attempts are rebuilt from descriptors for every retry, so a transport may
/// consume the attempt freely.
#[derive(Clone, Debug)]
pub struct Attempt {
    /// How the wire request is built
    pub kind: RequestKind,
    /// HTTP method
    pub method: Method,
    /// Target URL
    pub url: Url,
    /// Extra headers merged over the transport defaults
    pub headers: HeaderMap,
    /// Request payload descriptors
    pub body: Body,
    /// Whether the transport should gzip the request body
    pub compressed: bool,
}

/// Executes one outbound operation and reports its outcome.
#[async_trait]
pub trait Transport<R>: Send + Sync {
    /// Perform `attempt` once. Never retries internally.
    async fn execute(&self, attempt: Attempt) -> AttemptOutcome<R>;
}

/// Attaches credentials to every attempt before it reaches the transport.
#[async_trait]
pub trait Authenticator: DynClone + Send + Sync {
    /// Mutate `attempt` (typically its headers) with fresh credentials.
    ///
    /// An error here is permanent and completes the request immediately.
    async fn authenticate(&self, attempt: &mut Attempt) -> Result<(), Error>;
}

clone_trait_object!(Authenticator);

/// Response payload surfaced by [`HttpTransport`].
#[derive(Clone, Debug)]
pub enum Payload {
    /// A JSON response body
    Json(serde_json::Value),
    /// Anything else, raw. Multipart download payloads land here for the
    /// caller's decoder; wire decoding is out of scope for this crate.
    Raw(Bytes),
}

/// Default cap on collected response bodies.
const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// The bundled transport: executes attempts over a reqwest client and decodes
/// JSON response bodies into [`Payload`].
#[derive(Clone)]
pub struct HttpTransport {
    client: ClientWithMiddleware,
    request_timeout: Duration,
    body_limit: usize,
    suppress_404_logging: bool,
}

impl HttpTransport {
    /// Construct a transport over `client` applying `request_timeout` to each
    /// attempt.
    pub fn new(client: ClientWithMiddleware, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
            body_limit: DEFAULT_BODY_LIMIT,
            suppress_404_logging: false,
        }
    }

    /// Cap collected response bodies at `limit` bytes.
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Demote not-found logging to debug, for polling paths where a 404 is
    /// routine.
    pub fn suppress_404_logging(mut self, suppress: bool) -> Self {
        self.suppress_404_logging = suppress;
        self
    }

    fn build_request(&self, attempt: &Attempt) -> Result<reqwest::Request, Error> {
        let mut builder = self
            .client
            .request(attempt.method.clone(), attempt.url.clone())
            .timeout(self.request_timeout)
            .headers(base_headers(attempt.kind));

        builder = match &attempt.body {
            Body::Empty => builder,
            Body::Json(value) => {
                let serialized = serde_json::to_vec(value)?;
                if attempt.compressed {
                    builder
                        .header(CONTENT_TYPE, "application/json")
                        .header(CONTENT_ENCODING, "gzip")
                        .body(gzip(&serialized)?)
                } else {
                    builder.header(CONTENT_TYPE, "application/json").body(serialized)
                }
            }
            Body::Bytes(bytes) => {
                if attempt.compressed {
                    builder
                        .header(CONTENT_ENCODING, "gzip")
                        .body(gzip(bytes)?)
                } else {
                    builder.body(bytes.clone())
                }
            }
            // Multipart entities stream out as-is; compression is up to the
            // individual parts.
            Body::Multipart(parts) => builder.multipart(multipart_form(parts)?),
        };

        for (name, value) in &attempt.headers {
            builder = builder.header(name, value);
        }

        builder
            .build()
            .map_err(|err| Error::InvalidRequest(err.to_string()))
    }

    fn log_failure(&self, attempt: &Attempt, status: StatusCode, body: &Bytes) {
        if status == StatusCode::NOT_FOUND && self.suppress_404_logging {
            debug!("{} {} returned 404", attempt.method, attempt.url);
        } else {
            warn!(
                "{} {} failed with status {}: {}",
                attempt.method,
                attempt.url,
                status,
                String::from_utf8_lossy(body),
            );
        }
    }
}

#[async_trait]
impl Transport<Payload> for HttpTransport {
    async fn execute(&self, attempt: Attempt) -> AttemptOutcome<Payload> {
        let request = match self.build_request(&attempt) {
            Ok(request) => request,
            Err(err) => return AttemptOutcome::failure(None, err),
        };

        let response = match self.client.execute(request).await {
            Ok(response) => response,
            // No response at all: connection refused/reset, timeout, DNS.
            Err(err) => {
                debug!("{} {} failed: {err}", attempt.method, attempt.url);
                return AttemptOutcome::failure(None, Error::Network(err.to_string()));
            }
        };

        let head = ResponseHead {
            status: response.status(),
            headers: response.headers().clone(),
        };
        let body = match collect_limited(response, self.body_limit).await {
            Ok(body) => body,
            Err(err) => return AttemptOutcome::failure(Some(head), err),
        };

        if head.status.is_success() {
            match decode_payload(attempt.kind, &head, body) {
                Ok(payload) => AttemptOutcome::success(head, payload),
                Err(err) => AttemptOutcome::failure(Some(head), err),
            }
        } else {
            self.log_failure(&attempt, head.status, &body);
            let result = serde_json::from_slice(&body).ok().map(Payload::Json);
            let error = status_error(head.status);
            AttemptOutcome {
                response: Some(head),
                result,
                error: Some(error),
            }
        }
    }
}

/// Default headers for an attempt of the given kind.
fn base_headers(kind: RequestKind) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let accept = match kind {
        RequestKind::Simple => "application/json",
        RequestKind::MultipartUpload => "*/*",
        RequestKind::MultipartDownload => "multipart/related, application/json",
    };
    headers.insert(ACCEPT, HeaderValue::from_static(accept));
    if let Ok(date) = HeaderValue::from_str(&fmt_http_date(SystemTime::now())) {
        headers.insert(DATE, date);
    }
    headers
}

fn decode_payload(
    kind: RequestKind,
    head: &ResponseHead,
    body: Bytes,
) -> Result<Option<Payload>, Error> {
    if body.is_empty() {
        return Ok(None);
    }
    let is_json = head
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));
    if kind != RequestKind::MultipartDownload && is_json {
        return Ok(Some(Payload::Json(serde_json::from_slice(&body)?)));
    }
    Ok(Some(Payload::Raw(body)))
}

fn multipart_form(parts: &[Part]) -> Result<reqwest::multipart::Form, Error> {
    let mut form = reqwest::multipart::Form::new();
    for part in parts {
        let mut wire = reqwest::multipart::Part::bytes(part.content.to_vec());
        if let Some(content_type) = &part.content_type {
            wire = wire
                .mime_str(content_type)
                .map_err(|err| Error::InvalidRequest(err.to_string()))?;
        }
        if let Some(file_name) = &part.file_name {
            wire = wire.file_name(file_name.clone());
        }
        form = form.part(part.name.clone(), wire);
    }
    Ok(form)
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(Error::other)?;
    encoder.finish().map_err(Error::other)
}
