//! Streaming relay
//!
//! Forwards upstream body chunks as they arrive with a running byte count
//! seeded by the sniffed prefix. A breach of the ceiling, a read error or
//! the request deadline ends the stream with an error and drops the upstream
//! body, which closes the upstream connection.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::time::Instant;
use tracing::warn;

use crate::logging::targets;
use crate::media::fetch::FetchError;
use crate::media::transport::BodyStream;

/// Bytes relayed to the caller
pub type ImageStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Read whole chunks until at least `min` bytes are buffered or the body ends.
///
/// Fails with [`FetchError::TooLarge`] if the buffered prefix already exceeds
/// `limit`.
pub async fn read_prefix(body: &mut BodyStream, min: usize, limit: u64) -> Result<Bytes, FetchError> {
    let mut prefix = BytesMut::new();

    while prefix.len() < min {
        match body.next().await {
            Some(Ok(chunk)) => {
                prefix.extend_from_slice(&chunk);
                if prefix.len() as u64 > limit {
                    return Err(FetchError::TooLarge { limit });
                }
            }
            Some(Err(e)) => return Err(FetchError::Upstream(e.to_string())),
            None => break,
        }
    }

    Ok(prefix.freeze())
}

struct RelayState {
    pending: Option<Bytes>,
    upstream: Option<BodyStream>,
    relayed: u64,
    limit: u64,
    deadline: Instant,
    timeout_ms: u64,
}

impl RelayState {
    fn abort(mut self, err: FetchError) -> Option<(Result<Bytes, FetchError>, Self)> {
        self.upstream = None;
        Some((Err(err), self))
    }
}

/// Relay `prefix` followed by the rest of `upstream`.
pub fn relay_body(
    prefix: Bytes,
    upstream: BodyStream,
    limit: u64,
    deadline: Instant,
    timeout_ms: u64,
) -> ImageStream {
    let state = RelayState {
        relayed: prefix.len() as u64,
        pending: (!prefix.is_empty()).then_some(prefix),
        upstream: Some(upstream),
        limit,
        deadline,
        timeout_ms,
    };

    stream::unfold(state, |mut state| async move {
        if let Some(prefix) = state.pending.take() {
            return Some((Ok(prefix), state));
        }

        let upstream = state.upstream.as_mut()?;
        match tokio::time::timeout_at(state.deadline, upstream.next()).await {
            Err(_) => {
                warn!(target: targets::PROXY, relayed = state.relayed, "deadline hit mid-stream");
                let timeout_ms = state.timeout_ms;
                state.abort(FetchError::Timeout { timeout_ms })
            }
            Ok(None) => None,
            Ok(Some(Err(e))) => {
                warn!(target: targets::PROXY, error = %e, "upstream read failed mid-stream");
                state.abort(FetchError::Upstream(e.to_string()))
            }
            Ok(Some(Ok(chunk))) => {
                state.relayed += chunk.len() as u64;
                if state.relayed > state.limit {
                    warn!(
                        target: targets::PROXY,
                        relayed = state.relayed,
                        limit = state.limit,
                        "size ceiling exceeded mid-stream, aborting"
                    );
                    let limit = state.limit;
                    state.abort(FetchError::TooLarge { limit })
                } else {
                    Some((Ok(chunk), state))
                }
            }
        }
    })
    .boxed()
}
