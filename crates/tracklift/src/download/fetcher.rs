use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream};
use futures::StreamExt;
use reqwest::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::error::TransportError;
use crate::track::Segment;

/// Upper bound for the buffer reserved up front when collecting a body.
const MAX_PREALLOCATION: usize = 8 * 1024 * 1024;

/// A segment body as it arrives.
pub type SegmentBody = BoxStream<'static, Result<Bytes, TransportError>>;

/// Fetches the raw bytes of one segment in a single attempt. Retries are the
/// caller's business.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    /// Starts the transfer and hands back the body as a stream of chunks.
    async fn open(
        &self,
        segment: &Segment,
        token: &CancellationToken,
    ) -> Result<SegmentBody, TransportError>;

    /// Collects the whole body.
    async fn fetch(
        &self,
        segment: &Segment,
        token: &CancellationToken,
    ) -> Result<Bytes, TransportError> {
        let body = self.open(segment, token).await?;
        collect_body(body, segment.expected_len()).await
    }
}

/// Reserves at most [`MAX_PREALLOCATION`] bytes, whatever the size hint says.
fn initial_capacity(size_hint: Option<u64>) -> usize {
    size_hint.map_or(0, |hint| {
        usize::try_from(hint)
            .unwrap_or(usize::MAX)
            .min(MAX_PREALLOCATION)
    })
}

async fn collect_body(
    mut body: SegmentBody,
    size_hint: Option<u64>,
) -> Result<Bytes, TransportError> {
    let mut buffer = BytesMut::with_capacity(initial_capacity(size_hint));
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// Ends `body` with `on_timeout` once `deadline` passes.
fn with_deadline<S>(body: S, deadline: Instant, on_timeout: TransportError) -> SegmentBody
where
    S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
{
    stream::unfold(
        Some((Box::pin(body), on_timeout)),
        move |state| async move {
            let (mut body, on_timeout) = state?;
            match tokio::time::timeout_at(deadline, body.next()).await {
                Ok(Some(chunk)) => Some((chunk, Some((body, on_timeout)))),
                Ok(None) => None,
                Err(_) => Some((Err(on_timeout), None)),
            }
        },
    )
    .boxed()
}

/// HTTP(S) segment source with byte-range support.
pub struct HttpSegmentFetcher {
    http_client: Client,
    segment_timeout: Duration,
}

impl HttpSegmentFetcher {
    pub fn new(http_client: Client, segment_timeout: Duration) -> Self {
        Self {
            http_client,
            segment_timeout,
        }
    }

    async fn request(&self, url: Url, segment: &Segment) -> Result<reqwest::Response, TransportError> {
        let mut request = self.http_client.get(url.clone());
        if let Some(range) = segment.range.and_then(|r| r.header_value()) {
            request = request.header(reqwest::header::RANGE, range);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::http_status(status, url.as_str()));
        }

        trace!(
            index = segment.index,
            http_version = ?response.version(),
            content_length = ?response.content_length(),
            "Receiving segment body"
        );
        Ok(response)
    }

    fn timed_out(&self, segment: &Segment) -> TransportError {
        TransportError::Timeout {
            reason: format!(
                "segment {} not received within {:?}",
                segment.index, self.segment_timeout
            ),
        }
    }
}

#[async_trait]
impl SegmentSource for HttpSegmentFetcher {
    /// The timeout covers the whole transfer, body included.
    async fn open(
        &self,
        segment: &Segment,
        token: &CancellationToken,
    ) -> Result<SegmentBody, TransportError> {
        let url = Url::parse(&segment.url)
            .map_err(|e| TransportError::invalid_url(&segment.url, e.to_string()))?;
        let deadline = Instant::now() + self.segment_timeout;

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TransportError::Cancelled),
            result = tokio::time::timeout_at(deadline, self.request(url, segment)) => {
                result.map_err(|_| self.timed_out(segment))??
            }
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from));
        Ok(with_deadline(body, deadline, self.timed_out(segment)))
    }
}
