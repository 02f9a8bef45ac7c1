//! Body types shared by the relay, the interceptors and the local services
//!
//! Every request and response flowing through the proxy is boxed into a
//! [`ProxyBody`] so that the hyper `Incoming` body of a live connection and the
//! in-memory bodies built by local services and tests share one type.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Response};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tonic::Status;
use tracing::{debug, trace};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Type-erased streaming body used on both sides of the proxy.
///
/// Not `Sync`, matching the bodies tonic services produce.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Box any compatible body into a [`ProxyBody`]
pub fn boxed<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

pub fn empty() -> ProxyBody {
    boxed(Empty::<Bytes>::new())
}

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    boxed(Full::new(data.into()))
}

/// How an observed body finished
#[derive(Debug, Clone)]
pub enum StreamEnd {
    /// The body ended normally. Carries the gRPC status found in the trailers, if any.
    Completed(Option<Status>),
    /// The body yielded an error
    Failed(String),
    /// The body was dropped before reaching its end
    Cancelled,
}

/// Summary passed to the completion hook of an [`ObservedBody`]
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub end: StreamEnd,
    pub elapsed: Duration,
    pub data_frames: u64,
    pub data_bytes: u64,
}

type CompletionHook = Box<dyn FnOnce(StreamSummary) + Send + Sync>;

/// Fires the completion hook exactly once, on end of stream or on drop.
struct Completion {
    hook: Option<CompletionHook>,
    started_at: Instant,
    data_frames: u64,
    data_bytes: u64,
}

impl Completion {
    fn finish(&mut self, end: StreamEnd) {
        if let Some(hook) = self.hook.take() {
            hook(StreamSummary {
                end,
                elapsed: self.started_at.elapsed(),
                data_frames: self.data_frames,
                data_bytes: self.data_bytes,
            });
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.finish(StreamEnd::Cancelled);
    }
}

/// Streaming body adapter that forwards every frame untouched, trailers
/// included, and reports once when the stream is over.
#[pin_project]
pub struct ObservedBody<B> {
    #[pin]
    inner: B,
    completion: Completion,
}

impl<B> ObservedBody<B> {
    pub fn new<F>(inner: B, on_complete: F) -> Self
    where
        F: FnOnce(StreamSummary) + Send + Sync + 'static,
    {
        Self::starting_at(inner, Instant::now(), on_complete)
    }

    /// Like [`ObservedBody::new`] but measures elapsed time from `started_at`
    pub fn starting_at<F>(inner: B, started_at: Instant, on_complete: F) -> Self
    where
        F: FnOnce(StreamSummary) + Send + Sync + 'static,
    {
        Self {
            inner,
            completion: Completion {
                hook: Some(Box::new(on_complete)),
                started_at,
                data_frames: 0,
                data_bytes: 0,
            },
        }
    }
}

impl<B> Body for ObservedBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.completion.data_frames += 1;
                    this.completion.data_bytes += data.len() as u64;
                    trace!("Forwarding data frame, size: {} bytes", data.len());
                } else if let Some(trailers) = frame.trailers_ref() {
                    debug!("Forwarding HTTP trailers: {:?}", trailers);
                    this.completion
                        .finish(StreamEnd::Completed(Status::from_header_map(trailers)));
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.completion.finish(StreamEnd::Failed(e.to_string()));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.completion.finish(StreamEnd::Completed(None));
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Write `grpc-status` and `grpc-message` for `status` into `headers`.
///
/// A message that cannot be encoded as a header value is dropped; the code always goes out.
fn write_status(status: &Status, headers: &mut HeaderMap) {
    if status.add_header(headers).is_err() {
        headers.insert("grpc-status", HeaderValue::from(status.code() as i32));
    }
}

/// Build a trailers frame carrying a gRPC status
pub fn status_trailers(status: &Status) -> Frame<Bytes> {
    let mut trailers = HeaderMap::new();
    write_status(status, &mut trailers);
    Frame::trailers(trailers)
}

/// Trailers-only gRPC response: HTTP 200 with the status in the headers and no body
pub fn status_response(status: Status) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    write_status(&status, headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::StreamBody;
    use tonic::Code;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Option<StreamSummary>>>, impl FnOnce(StreamSummary) + Send + Sync) {
        let slot = Arc::new(Mutex::new(None));
        let writer = Arc::clone(&slot);
        (slot, move |summary| {
            *writer.lock().unwrap() = Some(summary);
        })
    }

    #[tokio::test]
    async fn test_observed_body_reports_trailer_status() {
        let frames: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"abc"))),
            Ok(Frame::data(Bytes::from_static(b"de"))),
            Ok(status_trailers(&Status::unimplemented("method not found"))),
        ];
        let (slot, hook) = recorder();
        let body = ObservedBody::new(StreamBody::new(futures::stream::iter(frames)), hook);

        let collected = body.collect().await.unwrap();
        let trailers = collected.trailers().cloned().unwrap();
        assert_eq!(trailers["grpc-status"], "12");
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"abcde"));

        let summary = slot.lock().unwrap().clone().unwrap();
        assert_eq!(summary.data_frames, 2);
        assert_eq!(summary.data_bytes, 5);
        match summary.end {
            StreamEnd::Completed(Some(status)) => assert_eq!(status.code(), Code::Unimplemented),
            other => panic!("unexpected end: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_observed_body_reports_cancellation_on_drop() {
        let (slot, hook) = recorder();
        let body = ObservedBody::new(full("never read"), hook);
        drop(body);

        let summary = slot.lock().unwrap().clone().unwrap();
        assert!(matches!(summary.end, StreamEnd::Cancelled));
    }

    #[tokio::test]
    async fn test_observed_body_without_trailers() {
        let (slot, hook) = recorder();
        let body = ObservedBody::new(full("payload"), hook);
        let bytes = body.collect().await.unwrap().to_bytes();

        assert_eq!(bytes, Bytes::from_static(b"payload"));
        let summary = slot.lock().unwrap().clone().unwrap();
        assert!(matches!(summary.end, StreamEnd::Completed(None)));
    }

    #[test]
    fn test_status_response_is_trailers_only() {
        let response = status_response(Status::unavailable("target down"));

        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], GRPC_CONTENT_TYPE);
        assert_eq!(response.headers()["grpc-status"], "14");
        assert!(response.body().is_end_stream());

        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "target down");
    }
}
