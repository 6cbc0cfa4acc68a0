//! # transport
//!
//! why: the node needs request/reply rpc to its peers without caring how bytes move
//! relations: implemented by local.rs (tests) and tcp.rs (network), used by node.rs fan-out
//! what: Transport trait, TransportError, bounded retry helper

pub mod local;
pub mod tcp;

use std::future::Future;
use std::io;

use async_trait::async_trait;
use raft_core::{
    AppendEntriesArgs, AppendEntriesReply, NodeId, RaftConfig, RaftError, RequestVoteArgs,
    RequestVoteReply,
};
use thiserror::Error;
use tokio::time;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("rpc attempt timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(String),

    #[error("malformed frame: {0}")]
    Codec(String),

    #[error("peer refused the request: {0}")]
    Remote(String),

    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    /// Whether another attempt could succeed
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::Codec(_) | Self::Closed)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::InvalidData => Self::Codec(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

impl From<TransportError> for RaftError {
    fn from(err: TransportError) -> Self {
        RaftError::Transport(err.to_string())
    }
}

/// Point-to-point rpc to cluster peers.
///
/// Implementations surface connection problems as errors; timeouts and
/// retries are applied by the caller through [`with_retries`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_request_vote(
        &self,
        peer: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError>;

    async fn send_append_entries(
        &self,
        peer: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError>;
}

/// Run `call` up to `1 + max_retries` times.
///
/// Each attempt is cut off after `rpc_timeout`; attempts are separated by
/// `retry_delay`. Returns the last error once every attempt has failed, the
/// error is not retriable, or `still_wanted` reports that the caller no
/// longer needs the reply.
pub async fn with_retries<T, W, F, Fut>(
    config: &RaftConfig,
    peer: NodeId,
    rpc: &'static str,
    still_wanted: W,
    mut call: F,
) -> Result<T, TransportError>
where
    W: Fn() -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = config.max_retries.saturating_add(1);
    let mut attempt = 1;
    loop {
        let err = match time::timeout(config.rpc_timeout(), call()).await {
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(err)) => err,
            Err(_) => TransportError::Timeout,
        };
        if attempt >= attempts || !err.is_retriable() {
            return Err(err);
        }
        time::sleep(config.retry_delay()).await;
        if !still_wanted() {
            debug!(peer, rpc, attempt, error = %err, "rpc no longer needed, not retrying");
            return Err(err);
        }
        debug!(peer, rpc, attempt, error = %err, "rpc failed, retrying");
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn fast() -> RaftConfig {
        RaftConfig {
            max_retries: 3,
            retry_delay: 1,
            rpc_timeout: 20,
            ..RaftConfig::default()
        }
    }

    #[tokio::test]
    async fn gives_up_after_one_plus_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&fast(), 2, "test", || true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Unreachable(2)) }
        })
        .await;

        assert_eq!(result, Err(TransportError::Unreachable(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries(&fast(), 2, "test", || true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TransportError::Io("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let config = RaftConfig {
            max_retries: 1,
            ..fast()
        };
        let result: Result<(), _> = with_retries(&config, 2, "test", || true, || async {
            time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn codec_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&fast(), 2, "test", || true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Codec("bad frame".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_stop_once_the_reply_is_no_longer_wanted() {
        let calls = AtomicU32::new(0);
        let wanted = AtomicBool::new(true);
        let result: Result<(), _> = with_retries(
            &fast(),
            2,
            "test",
            || wanted.load(Ordering::SeqCst),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                // the term moves on while the first attempt is in flight
                wanted.store(false, Ordering::SeqCst);
                async { Err(TransportError::Unreachable(2)) }
            },
        )
        .await;

        assert_eq!(result, Err(TransportError::Unreachable(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
