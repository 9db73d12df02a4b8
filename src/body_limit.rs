//! Streaming body size enforcement.
//!
//! [`LimitedBody`] wraps a body with a monotone byte counter and a ceiling.
//! Frames are forwarded as-is - nothing is buffered beyond what the inner
//! body yields - and the first frame that pushes the count past the ceiling
//! turns into an error, which tears the exchange down. The same wrapper
//! serves the inbound request body and the upstream response body.

use bytes::Bytes;
use http_body::{Body, Frame};
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;

/// Error yielded once the wrapped body crosses its ceiling.
#[derive(Error, Debug)]
#[error("body exceeded the configured maximum of {limit} bytes")]
pub struct BodyLimitExceeded {
    pub limit: u64,
}

/// Body wrapper enforcing a byte ceiling.
///
/// A body of exactly `limit` bytes completes; one byte more errors the
/// stream.
pub struct LimitedBody<B> {
    inner: B,
    limit: u64,
    seen: u64,
}

impl<B> LimitedBody<B> {
    pub fn new(inner: B, limit: u64) -> Self {
        Self {
            inner,
            limit,
            seen: 0,
        }
    }

    /// Bytes observed so far.
    pub fn seen(&self) -> u64 {
        self.seen
    }
}

impl<B> Body for LimitedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = Box<dyn std::error::Error + Send + Sync>;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.seen += data.len() as u64;
                    if this.seen > this.limit {
                        return Poll::Ready(Some(Err(
                            BodyLimitExceeded { limit: this.limit }.into()
                        )));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
