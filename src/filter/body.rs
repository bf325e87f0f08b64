//! Bounded response buffering for filtered responses.

use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper::http::response::Parts;
use hyper::Response;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Result of buffering a response body against a limit.
pub enum Buffered<B> {
    /// The whole body fit.
    Complete(Response<Bytes>),
    /// The body exceeded the limit. `prefix` holds every byte read so far,
    /// `rest` the unread remainder, so the original can still be forwarded.
    Overflow {
        parts: Parts,
        prefix: Bytes,
        rest: B,
    },
}

/// Read a response body into memory, stopping as soon as it exceeds `limit`.
///
/// Trailers are dropped.
pub async fn buffer_response<B>(response: Response<B>, limit: usize) -> Result<Buffered<B>, B::Error>
where
    B: Body<Data = Bytes> + Unpin,
{
    let (parts, mut body) = response.into_parts();
    let mut collected = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Ok(data) = frame.into_data() {
            collected.extend_from_slice(&data);
            if collected.len() > limit {
                return Ok(Buffered::Overflow {
                    parts,
                    prefix: collected.freeze(),
                    rest: body,
                });
            }
        }
    }

    Ok(Buffered::Complete(Response::from_parts(parts, collected.freeze())))
}

/// A body that yields already-read bytes before streaming the remainder.
pub struct PrefixedBody<B> {
    prefix: Option<Bytes>,
    rest: B,
}

impl<B> PrefixedBody<B> {
    pub fn new(prefix: Bytes, rest: B) -> Self {
        Self {
            prefix: Some(prefix).filter(|p| !p.is_empty()),
            rest,
        }
    }
}

impl<B> Body for PrefixedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if let Some(prefix) = self.prefix.take() {
            return Poll::Ready(Some(Ok(Frame::data(prefix))));
        }
        Pin::new(&mut self.rest).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.prefix.is_none() && self.rest.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let extra = self.prefix.as_ref().map_or(0, |p| p.len() as u64);
        let rest = self.rest.size_hint();
        let mut hint = SizeHint::new();
        hint.set_lower(rest.lower() + extra);
        if let Some(upper) = rest.upper() {
            hint.set_upper(upper + extra);
        }
        hint
    }
}
