//! Wall-clock deadline enforcement for streaming bodies.
//!
//! One outbound exchange gets a single deadline covering connect through the
//! final response byte. The connect/header phase is guarded with
//! `tokio::time::timeout_at` against the deadline; [`DeadlineBody`] carries
//! the same deadline through the response stream, so a slow-dripping
//! upstream cannot hold the exchange open past it.

use bytes::Bytes;
use http_body::{Body, Frame};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::time::{Instant, Sleep, sleep_until};

/// Error yielded when the stream outlives its deadline.
#[derive(Error, Debug)]
#[error("stream deadline exceeded")]
pub struct DeadlineExceeded;

/// Body wrapper that errors once the shared exchange deadline passes.
pub struct DeadlineBody<B> {
    inner: B,
    deadline: Pin<Box<Sleep>>,
}

impl<B> DeadlineBody<B> {
    /// Wrap `inner` with an absolute deadline.
    pub fn new(inner: B, deadline: Instant) -> Self {
        Self {
            inner,
            deadline: Box::pin(sleep_until(deadline)),
        }
    }
}

impl<B> Body for DeadlineBody<B>
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

        if this.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(DeadlineExceeded.into())));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(result) => Poll::Ready(result.map(|r| r.map_err(Into::into))),
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
