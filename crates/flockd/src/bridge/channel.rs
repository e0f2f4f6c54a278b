//! Duplex control channel to one peer.
//!
//! A single task owns the framed transport and the table of outstanding
//! requests; callers reach it through a cloneable handle backed by an mpsc
//! command channel. Responses are matched strictly by correlation token,
//! never by arrival order, so any number of requests may be in flight at
//! once. When the peer hangs up, every pending request resolves with
//! [`ChannelError::Closed`] and the event stream ends with
//! [`Inbound::Closed`].

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{ControlMessage, Token, TracingReply, WorkerId};

/// Channel-level failures surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The peer exited while the operation was outstanding.
    #[error("control channel closed")]
    Closed,

    /// No response arrived within the configured deadline. A response that
    /// shows up later is discarded; the request never resolves twice.
    #[error("control request timed out")]
    Timeout,
}

/// Inbound traffic that is not a response to an outstanding request.
///
/// Delivered in arrival order, one stream per channel. No ordering is
/// implied across different channels.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Peer reported a worker's status.
    Status { id: WorkerId, is_tracing: bool },

    /// Peer pushed a serialized trace record.
    Trace { record: String },

    /// Peer asked us to toggle trace capture; answer with
    /// [`ControlChannel::respond_tracing`] using the same token.
    SetTracing { token: Token, enabled: bool },

    /// The peer hung up. No further events follow.
    Closed,
}

enum Command {
    Send(ControlMessage),
    Request {
        enabled: bool,
        reply: oneshot::Sender<Result<TracingReply, ChannelError>>,
    },
}

type Pending = HashMap<Token, oneshot::Sender<Result<TracingReply, ChannelError>>>;

/// Handle to a spawned control channel task.
#[derive(Clone)]
pub struct ControlChannel {
    cmd_tx: mpsc::Sender<Command>,
    request_timeout: Option<Duration>,
}

impl ControlChannel {
    /// Spawn the channel task over an arbitrary duplex byte stream.
    ///
    /// Non-response traffic is forwarded to `events` in arrival order.
    /// Requests wait indefinitely; see [`Self::spawn_with_timeout`] for a
    /// bounded variant. Must be called from within a tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W, events: mpsc::Sender<Inbound>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn_with_timeout(reader, writer, events, None)
    }

    /// Like [`Self::spawn`], but requests fail with [`ChannelError::Timeout`]
    /// after `request_timeout`.
    pub fn spawn_with_timeout<R, W>(
        reader: R,
        writer: W,
        events: mpsc::Sender<Inbound>,
        request_timeout: Option<Duration>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        tokio::spawn(channel_task(reader, writer, cmd_rx, events));
        Self {
            cmd_tx,
            request_timeout,
        }
    }

    /// Fire-and-forget delivery. Resolving `Ok` means the message was handed
    /// to the channel task, not that the peer processed it.
    pub async fn send(&self, msg: ControlMessage) -> Result<(), ChannelError> {
        self.cmd_tx
            .send(Command::Send(msg))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Send a tracing toggle tagged with a fresh correlation token and wait
    /// for the matching response.
    ///
    /// Other traffic on the channel keeps flowing while the caller waits.
    pub async fn request_tracing(&self, enabled: bool) -> Result<TracingReply, ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                enabled,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ChannelError::Closed)?;

        let outcome = match self.request_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, reply_rx).await {
                Ok(resolved) => resolved,
                // Dropping the receiver here is what discards a late
                // response: first resolution wins.
                Err(_) => return Err(ChannelError::Timeout),
            },
            None => reply_rx.await,
        };
        outcome.map_err(|_| ChannelError::Closed)?
    }

    /// Answer a previously received [`Inbound::SetTracing`].
    pub async fn respond_tracing(
        &self,
        token: Token,
        error: Option<String>,
    ) -> Result<(), ChannelError> {
        self.send(ControlMessage::TracingResult { token, error })
            .await
    }
}

async fn channel_task<R, W>(
    reader: R,
    writer: W,
    mut cmd_rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<Inbound>,
) where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut rd = FramedRead::new(reader, FrameCodec::<ControlMessage>::new());
    let mut wr = FramedWrite::new(writer, FrameCodec::<ControlMessage>::new());
    let mut pending: Pending = HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    if let Err(e) = wr.send(msg).await {
                        tracing::warn!(error = %e, "control write failed, closing channel");
                        break;
                    }
                }
                Some(Command::Request { enabled, reply }) => {
                    // Requesters that timed out have dropped their receiver;
                    // shed those entries so an unresponsive peer cannot make
                    // the table grow without bound.
                    pending.retain(|token, waiter| {
                        if waiter.is_closed() {
                            tracing::trace!(%token, "dropping abandoned request");
                            false
                        } else {
                            true
                        }
                    });
                    let token = Token::new();
                    match wr.send(ControlMessage::Tracing { token, enabled }).await {
                        Ok(()) => {
                            pending.insert(token, reply);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "control write failed, closing channel");
                            let _ = reply.send(Err(ChannelError::Closed));
                            break;
                        }
                    }
                }
                // All handles dropped.
                None => break,
            },

            frame = rd.next() => match frame {
                // The typed parse happens here, not in the decoder: a
                // decoder error is terminal for FramedRead, and a protocol
                // violation must only cost the one frame.
                Some(Ok(frame)) => match FrameCodec::<ControlMessage>::parse(&frame) {
                    Ok(msg) => {
                        if dispatch(msg, &mut pending, &events).await.is_err() {
                            // Event receiver gone; nobody is listening anymore.
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed control frame");
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "control channel transport error");
                    break;
                }
                None => break,
            },
        }
    }

    // No silent leaks: everything still outstanding resolves as closed.
    for (token, waiter) in pending.drain() {
        tracing::debug!(%token, "resolving pending request: channel closed");
        let _ = waiter.send(Err(ChannelError::Closed));
    }
    let _ = events.send(Inbound::Closed).await;
}

async fn dispatch(
    msg: ControlMessage,
    pending: &mut Pending,
    events: &mpsc::Sender<Inbound>,
) -> Result<(), ()> {
    match msg {
        ControlMessage::TracingResult { token, error } => {
            match pending.remove(&token) {
                Some(waiter) => {
                    // A timed-out requester has already dropped its
                    // receiver; the late response dies here.
                    let _ = waiter.send(Ok(TracingReply { error }));
                }
                None => {
                    tracing::warn!(%token, "response with no outstanding request");
                }
            }
            Ok(())
        }
        ControlMessage::Status { id, is_tracing } => events
            .send(Inbound::Status { id, is_tracing })
            .await
            .map_err(|_| ()),
        ControlMessage::TraceObject { record } => events
            .send(Inbound::Trace { record })
            .await
            .map_err(|_| ()),
        ControlMessage::Tracing { token, enabled } => events
            .send(Inbound::SetTracing { token, enabled })
            .await
            .map_err(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Spawn a connected pair of channels over an in-memory duplex stream.
    fn channel_pair() -> (
        ControlChannel,
        mpsc::Receiver<Inbound>,
        ControlChannel,
        mpsc::Receiver<Inbound>,
    ) {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        let left = ControlChannel::spawn(ar, aw, a_tx);
        let right = ControlChannel::spawn(br, bw, b_tx);
        (left, a_rx, right, b_rx)
    }

    #[tokio::test]
    async fn send_delivers_to_peer_in_order() {
        let (left, _left_rx, _right, mut right_rx) = channel_pair();

        left.send(ControlMessage::Status {
            id: WorkerId::new(1),
            is_tracing: false,
        })
        .await
        .unwrap();
        left.send(ControlMessage::TraceObject {
            record: "{}".to_string(),
        })
        .await
        .unwrap();

        match right_rx.recv().await.unwrap() {
            Inbound::Status { id, is_tracing } => {
                assert_eq!(id, WorkerId::new(1));
                assert!(!is_tracing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            right_rx.recv().await.unwrap(),
            Inbound::Trace { .. }
        ));
    }

    #[tokio::test]
    async fn responses_match_by_token_not_arrival_order() {
        let (left, _left_rx, right, mut right_rx) = channel_pair();

        let enable = tokio::spawn({
            let left = left.clone();
            async move { left.request_tracing(true).await }
        });
        let disable = tokio::spawn({
            let left = left.clone();
            async move { left.request_tracing(false).await }
        });

        let mut received = Vec::new();
        for _ in 0..2 {
            match right_rx.recv().await.unwrap() {
                Inbound::SetTracing { token, enabled } => received.push((token, enabled)),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        // Reply in reverse arrival order; the enable request succeeds, the
        // disable request is refused, regardless of which arrived first.
        for (token, enabled) in received.into_iter().rev() {
            let error = if enabled {
                None
            } else {
                Some("nope".to_string())
            };
            right.respond_tracing(token, error).await.unwrap();
        }

        let enable_reply = enable.await.unwrap().unwrap();
        let disable_reply = disable.await.unwrap().unwrap();
        assert!(enable_reply.is_ok());
        assert_eq!(disable_reply.error.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn pending_requests_resolve_closed_when_peer_exits() {
        let (left, _left_rx, right, mut right_rx) = channel_pair();

        let request = tokio::spawn({
            let left = left.clone();
            async move { left.request_tracing(true).await }
        });

        // Wait until the request is actually on the wire, then drop the
        // peer handle; its task exits and the transport closes.
        assert!(matches!(
            right_rx.recv().await.unwrap(),
            Inbound::SetTracing { .. }
        ));
        drop(right);
        assert!(matches!(right_rx.recv().await, Some(Inbound::Closed)));

        assert_eq!(request.await.unwrap(), Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_and_channel_stays_open() {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let channel = ControlChannel::spawn(ar, aw, events_tx);

        let mut raw = FramedWrite::new(bw, FrameCodec::<serde_json::Value>::new());
        raw.send(json!({"cmd": "selfdestruct", "now": true}))
            .await
            .unwrap();
        raw.send(json!({"cmd": "status", "id": 2, "isTracing": true}))
            .await
            .unwrap();

        // The bogus frame is skipped; the next valid frame comes through.
        match events_rx.recv().await.unwrap() {
            Inbound::Status { id, is_tracing } => {
                assert_eq!(id, WorkerId::new(2));
                assert!(is_tracing);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // The channel survived: a request still resolves end to end.
        let mut raw_read = FramedRead::new(br, FrameCodec::<ControlMessage>::new());
        let request = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request_tracing(true).await }
        });
        let frame = raw_read.next().await.unwrap().unwrap();
        let token = match FrameCodec::<ControlMessage>::parse(&frame).unwrap() {
            ControlMessage::Tracing { token, .. } => token,
            other => panic!("wrong variant: {:?}", other),
        };
        raw.send(json!({"cmd": "tracingResult", "token": token}))
            .await
            .unwrap();
        assert!(request.await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn abandoned_requests_are_swept_by_later_requests() {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let (left_tx, _left_rx) = mpsc::channel(16);
        let (right_tx, mut right_rx) = mpsc::channel(16);
        let left = ControlChannel::spawn_with_timeout(
            ar,
            aw,
            left_tx,
            Some(Duration::from_millis(20)),
        );
        let right = ControlChannel::spawn(br, bw, right_tx);

        // The peer ignores several requests; each times out and abandons
        // its token.
        let mut stale_tokens = Vec::new();
        for _ in 0..3 {
            assert_eq!(left.request_tracing(true).await, Err(ChannelError::Timeout));
            match right_rx.recv().await.unwrap() {
                Inbound::SetTracing { token, .. } => stale_tokens.push(token),
                other => panic!("unexpected event: {:?}", other),
            }
        }

        // Replies to long-abandoned tokens resolve nothing, and the channel
        // still serves a fresh request afterwards.
        for token in stale_tokens {
            right.respond_tracing(token, None).await.unwrap();
        }
        let fresh = tokio::spawn({
            let left = left.clone();
            async move { left.request_tracing(false).await }
        });
        let token = loop {
            match right_rx.recv().await.unwrap() {
                Inbound::SetTracing { token, .. } => break token,
                Inbound::Closed => panic!("channel closed unexpectedly"),
                _ => continue,
            }
        };
        right.respond_tracing(token, None).await.unwrap();
        assert!(fresh.await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn request_times_out_and_late_reply_is_discarded() {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let (left_tx, _left_rx) = mpsc::channel(16);
        let (right_tx, mut right_rx) = mpsc::channel(16);
        let left = ControlChannel::spawn_with_timeout(
            ar,
            aw,
            left_tx,
            Some(Duration::from_millis(50)),
        );
        let right = ControlChannel::spawn(br, bw, right_tx);

        let result = left.request_tracing(true).await;
        assert_eq!(result, Err(ChannelError::Timeout));

        // The peer answers long after the deadline; the channel must absorb
        // the orphaned response and keep working.
        let token = match right_rx.recv().await.unwrap() {
            Inbound::SetTracing { token, .. } => token,
            other => panic!("unexpected event: {:?}", other),
        };
        right.respond_tracing(token, None).await.unwrap();

        right
            .send(ControlMessage::Status {
                id: WorkerId::new(9),
                is_tracing: false,
            })
            .await
            .unwrap();
        // Channel still alive: a fresh request resolves normally.
        let fresh = tokio::spawn({
            let left = left.clone();
            async move { left.request_tracing(false).await }
        });
        let token = loop {
            match right_rx.recv().await.unwrap() {
                Inbound::SetTracing { token, .. } => break token,
                Inbound::Closed => panic!("channel closed unexpectedly"),
                _ => continue,
            }
        };
        right.respond_tracing(token, None).await.unwrap();
        assert!(fresh.await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn send_after_close_reports_closed() {
        let (a, b) = tokio::io::duplex(64);
        let (ar, aw) = tokio::io::split(a);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let channel = ControlChannel::spawn(ar, aw, events_tx);

        drop(b);
        assert!(matches!(events_rx.recv().await, Some(Inbound::Closed)));

        let result = channel
            .send(ControlMessage::TraceObject {
                record: "{}".to_string(),
            })
            .await;
        assert_eq!(result, Err(ChannelError::Closed));
    }
}
