//! Guarded access to the current session's transport.
//!
//! Pipelines and tool batches hold a `SessionLink` instead of the transport
//! itself. Sending through a detached or closed link is a logged no-op, never
//! an error that could take the caller down.

use crate::error::{LiveError, Result};
use crate::protocol::ClientMessage;
use crate::transport::TransportHandle;
use tracing::debug;

/// What happened to a message offered without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Sent,
    /// Transport is saturated; the message was dropped
    Dropped,
    /// No open session; the message was discarded
    Detached,
}

#[derive(Debug, Clone, Default)]
pub struct SessionLink {
    inner: Option<(u64, TransportHandle)>,
}

impl SessionLink {
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn bound(generation: u64, handle: TransportHandle) -> Self {
        Self {
            inner: Some((generation, handle)),
        }
    }

    pub fn generation(&self) -> Option<u64> {
        self.inner.as_ref().map(|(generation, _)| *generation)
    }

    pub fn is_open(&self) -> bool {
        matches!(&self.inner, Some((_, handle)) if !handle.is_closed())
    }

    /// Send without waiting. Used for realtime media where a late frame is worthless.
    pub fn offer(&self, msg: ClientMessage) -> Offer {
        let Some((generation, handle)) = &self.inner else {
            return Offer::Detached;
        };
        match handle.try_send(msg) {
            Ok(()) => Offer::Sent,
            Err(LiveError::Timeout) => Offer::Dropped,
            Err(_) => {
                debug!("Session {} transport closed, discarding message", generation);
                Offer::Detached
            }
        }
    }

    /// Send, waiting for room on the transport.
    pub async fn deliver(&self, msg: ClientMessage) -> Result<()> {
        match &self.inner {
            Some((_, handle)) => handle.send(msg).await,
            None => {
                debug!("No open session, discarding {} message", msg.kind());
                Err(LiveError::ConnectionClosed)
            }
        }
    }

    pub fn detach(&mut self) {
        self.inner = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_detached_link_is_a_quiet_no_op() {
        let link = SessionLink::detached();
        assert!(!link.is_open());
        assert_eq!(link.offer(ClientMessage::audio(&[0, 0])), Offer::Detached);
        assert!(matches!(
            link.deliver(ClientMessage::tool_response(Vec::new())).await,
            Err(LiveError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_bound_link_offers_and_drops() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut link = SessionLink::bound(3, TransportHandle::new(tx));
        assert_eq!(link.generation(), Some(3));
        assert!(link.is_open());

        assert_eq!(link.offer(ClientMessage::audio(&[1, 0])), Offer::Sent);
        assert_eq!(link.offer(ClientMessage::audio(&[2, 0])), Offer::Dropped);
        assert_eq!(rx.recv().await.map(|m| m.kind()), Some("audio"));

        link.detach();
        assert_eq!(link.generation(), None);
        assert_eq!(link.offer(ClientMessage::audio(&[3, 0])), Offer::Detached);
    }

    #[tokio::test]
    async fn test_closed_transport_reports_detached() {
        let (tx, rx) = mpsc::channel(4);
        let link = SessionLink::bound(1, TransportHandle::new(tx));
        drop(rx);
        assert!(!link.is_open());
        assert_eq!(link.offer(ClientMessage::audio(&[0, 0])), Offer::Detached);
        assert!(link.deliver(ClientMessage::tool_response(Vec::new())).await.is_err());
    }
}
