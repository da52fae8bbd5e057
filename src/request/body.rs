//! Request payload descriptors and size-limited response collection

use crate::error::Error;
use bytes::{BufMut, Bytes, BytesMut};
use futures_core::{ready, stream::BoxStream, Stream};
use pin_project_lite::pin_project;
use reqwest::Response;
use std::{
    future::Future,
    mem,
    pin::Pin,
    task::{Context, Poll},
};

/// Request payload, kept as descriptors so every retry attempt can rebuild a
/// fresh wire body.
#[derive(Clone, Debug, Default)]
pub enum Body {
    /// No payload
    #[default]
    Empty,
    /// Opaque value serialized as JSON by the transport
    Json(serde_json::Value),
    /// Raw bytes sent as-is
    Bytes(Bytes),
    /// Multipart entity assembled from part descriptors and streamed out
    Multipart(Vec<Part>),
}

impl Body {
    /// Serialize `value` into a JSON body.
    pub fn json<S: serde::Serialize>(value: &S) -> Result<Self, Error> {
        Ok(Body::Json(serde_json::to_value(value)?))
    }
}

/// One part of a multipart upload entity.
#[derive(Clone, Debug)]
pub struct Part {
    /// Form field name of the part
    pub name: String,
    /// Part content
    pub content: Bytes,
    /// MIME type of the part, if known
    pub content_type: Option<String>,
    /// Attachment file name, if any
    pub file_name: Option<String>,
}

impl Part {
    /// A part holding raw bytes under `name`.
    pub fn bytes(name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            content_type: None,
            file_name: None,
        }
    }

    /// Set the MIME type of this part.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the attachment file name of this part.
    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }
}

pin_project! {
    /// Collects a response body up to a byte limit.
    ///
    /// Reqwest does not bound response bodies on its own; replies come from
    /// remote servers we do not control, so collection fails with
    /// [`Error::ResponseBodyLimit`] once the limit is crossed.
    pub(crate) struct CollectBody {
        #[pin]
        stream: BoxStream<'static, reqwest::Result<Bytes>>,
        limit: usize,
        aggregator: BytesMut,
    }
}

impl Future for CollectBody {
    type Output = Result<Bytes, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let this = self.as_mut().project();
            match ready!(this.stream.poll_next(cx)) {
                Some(Ok(chunk)) => {
                    this.aggregator.put(chunk);
                    if this.aggregator.len() > *this.limit {
                        return Poll::Ready(Err(Error::ResponseBodyLimit));
                    }
                }
                // A failure mid-body is not an absent response; callers treat
                // it as permanent.
                Some(Err(err)) => return Poll::Ready(Err(Error::other(err))),
                None => break,
            }
        }

        Poll::Ready(Ok(mem::take(self.project().aggregator).freeze()))
    }
}

/// Collect `response`'s body, failing once it exceeds `limit` bytes.
pub(crate) fn collect_limited(response: Response, limit: usize) -> CollectBody {
    CollectBody {
        stream: Box::pin(response.bytes_stream()),
        limit,
        aggregator: BytesMut::new(),
    }
}
