//! Response body relayed from an upstream instance.
//!
//! The upstream call is not complete when the headers arrive: the body may
//! still stall or break. [`UpstreamBody`] keeps the breaker permit and the
//! in-flight guard until the body ends, and cuts the transfer off once the
//! route's response deadline passes.
use std::{
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    BoxError,
    body::{Body, BodyDataStream, Bytes},
};
use futures_util::{Stream, StreamExt};
use tokio::time::{Instant, Sleep, sleep_until};

use crate::core::{
    circuit_breaker::{CallOutcome, CallPermit},
    error::GatewayError,
    load_balancer::InFlightGuard,
};

/// Resources released when the relayed body finishes.
pub struct CallCompletion {
    pub permit: CallPermit,
    pub guard: InFlightGuard,
    pub route: String,
    pub instance: String,
    pub response_timeout: std::time::Duration,
}

/// Stream of body chunks that settles the call when it ends.
///
/// A clean end is recorded as a success, a body error or a passed deadline
/// as a failure. Dropping the stream early (the client went away) releases
/// the permit without an outcome.
pub struct UpstreamBody {
    inner: BodyDataStream,
    deadline: Pin<Box<Sleep>>,
    completion: Option<CallCompletion>,
}

impl UpstreamBody {
    pub fn new(body: Body, deadline: Instant, completion: CallCompletion) -> Self {
        Self {
            inner: body.into_data_stream(),
            deadline: Box::pin(sleep_until(deadline)),
            completion: Some(completion),
        }
    }

    pub fn into_body(self) -> Body {
        Body::from_stream(self)
    }

    fn finish(&mut self, outcome: CallOutcome) {
        if let Some(completion) = self.completion.take() {
            completion.permit.record(outcome);
            drop(completion.guard);
        }
    }

    fn fail(&mut self, error: BoxError) -> Poll<Option<Result<Bytes, BoxError>>> {
        if let Some(completion) = &self.completion {
            tracing::warn!(
                route = %completion.route,
                instance = %completion.instance,
                error = %error,
                "Upstream response body failed"
            );
        }
        self.finish(CallOutcome::Failure);
        Poll::Ready(Some(Err(error)))
    }
}

impl Stream for UpstreamBody {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(completion) = &this.completion else {
            return Poll::Ready(None);
        };

        if this.deadline.as_mut().poll(cx).is_ready() {
            let error = GatewayError::UpstreamTimeout {
                instance: completion.instance.clone(),
                timeout: completion.response_timeout,
            };
            return this.fail(error.into());
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => this.fail(e.into()),
            Poll::Ready(None) => {
                this.finish(CallOutcome::Success);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
