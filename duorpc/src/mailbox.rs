//! In-process message carrier.
//!
//! Models carriers that deliver one complete message per event (the original
//! transport family behind this module ferried each message in a single
//! window-message datagram). Every event is exactly the 12-byte frame header
//! followed by the payload, tagged with [`CARRIER_TAG`]; events with a
//! foreign tag or inconsistent framing are ignored at the door. Cross-linking
//! two carriers with [`pair`] also makes this the loopback transport of
//! choice for tests.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, ErrorKind, Result},
    method_id::fnv1a,
    msg::Message,
    transport::{
        FRAME_HEADER_SIZE, Transport, TransportRx, TransportTx, decode_frame_header,
        encode_frame_header,
    },
};

/// Fixed 32-bit tag identifying events that belong to this carrier.
pub const CARRIER_TAG: u32 = fnv1a("AsyncCppRpc-CopyData-Transport");

/// Posting side of a mailbox: the entry point through which events reach a
/// carrier's inbox.
#[derive(Debug, Clone)]
pub struct MailboxPost {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl MailboxPost {
    /// Delivers one raw event.
    ///
    /// Returns `false` when the event is not for this carrier (foreign tag),
    /// is malformed (framing and length do not line up), or the receiving
    /// mailbox is gone. Mirrors an event-loop hook: the caller keeps
    /// dispatching events that were not consumed here.
    pub fn post(&self, tag: u32, data: &[u8]) -> bool {
        if tag != CARRIER_TAG || data.len() < FRAME_HEADER_SIZE {
            return false;
        }
        let (_, payload_size) = decode_frame_header(data[..FRAME_HEADER_SIZE].try_into().unwrap());
        if FRAME_HEADER_SIZE + payload_size as usize != data.len() {
            return false;
        }
        self.tx.send(data.to_vec()).is_ok()
    }
}

/// A message-per-event carrier endpoint.
#[derive(Debug)]
pub struct MailboxTransport {
    peer: MailboxPost,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
}

impl MailboxTransport {
    /// Creates an endpoint that sends to `peer`. Inbound events are fed
    /// through the returned [`MailboxPost`].
    #[must_use]
    pub fn connected_to(peer: MailboxPost) -> (Self, MailboxPost) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let transport = Self {
            peer,
            inbox,
            cancel: CancellationToken::new(),
        };
        (transport, MailboxPost { tx })
    }
}

/// Two carriers cross-linked into an in-process full-duplex pipe.
#[must_use]
pub fn pair() -> (MailboxTransport, MailboxTransport) {
    let (left_tx, left_inbox) = mpsc::unbounded_channel();
    let (right_tx, right_inbox) = mpsc::unbounded_channel();
    (
        MailboxTransport {
            peer: MailboxPost { tx: right_tx },
            inbox: left_inbox,
            cancel: CancellationToken::new(),
        },
        MailboxTransport {
            peer: MailboxPost { tx: left_tx },
            inbox: right_inbox,
            cancel: CancellationToken::new(),
        },
    )
}

impl Transport for MailboxTransport {
    type Tx = MailboxTx;
    type Rx = MailboxRx;

    fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancel = token.child_token();
    }

    fn split(self) -> (Self::Tx, Self::Rx) {
        (
            MailboxTx { peer: self.peer },
            MailboxRx {
                inbox: self.inbox,
                cancel: self.cancel,
            },
        )
    }
}

pub struct MailboxTx {
    peer: MailboxPost,
}

impl TransportTx for MailboxTx {
    fn write(&mut self, message: Message) -> impl Future<Output = Result<()>> + Send {
        let payload_size = message.payload.len() as u32;
        let mut event = Vec::with_capacity(FRAME_HEADER_SIZE + message.payload.len());
        event.extend_from_slice(&encode_frame_header(message.header, payload_size));
        event.extend_from_slice(&message.payload);

        let result = if self.peer.post(CARRIER_TAG, &event) {
            Ok(())
        } else {
            Err(Error::kind(ErrorKind::MailboxClosed))
        };
        std::future::ready(result)
    }
}

pub struct MailboxRx {
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
}

impl TransportRx for MailboxRx {
    async fn read(&mut self) -> Result<Message> {
        let event = tokio::select! {
            () = self.cancel.cancelled() => return Err(Error::kind(ErrorKind::Cancelled)),
            event = self.inbox.recv() => {
                event.ok_or_else(|| Error::kind(ErrorKind::MailboxClosed))?
            }
        };

        // Framing was validated when the event was posted.
        let (header, _) = decode_frame_header(event[..FRAME_HEADER_SIZE].try_into().unwrap());
        Ok(Message::new(header, event[FRAME_HEADER_SIZE..].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallType, Header, MethodId};

    fn sample_message() -> Message {
        Message::new(
            Header::new(9, CallType::Request, MethodId::from_name("echo")),
            b"payload".to_vec(),
        )
    }

    #[test]
    fn test_carrier_tag_is_name_derived() {
        assert_eq!(CARRIER_TAG, fnv1a("AsyncCppRpc-CopyData-Transport"));
        assert_ne!(CARRIER_TAG, 0);
    }

    #[tokio::test]
    async fn test_pair_round_trip() {
        let (left, right) = pair();
        let (mut tx, _) = left.split();
        let (_, mut rx) = right.split();

        let message = sample_message();
        tx.write(message.clone()).await.unwrap();
        assert_eq!(rx.read().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_post_filters_foreign_and_malformed_events() {
        let (transport, post) = MailboxTransport::connected_to(pair().0.peer);
        let (_, mut rx) = transport.split();

        let message = sample_message();
        let mut event = encode_frame_header(message.header, message.payload.len() as u32).to_vec();
        event.extend_from_slice(&message.payload);

        assert!(!post.post(0xDEAD_BEEF, &event), "foreign tag must be ignored");
        assert!(!post.post(CARRIER_TAG, &event[..4]), "truncated header must be ignored");
        let mut oversized = event.clone();
        oversized.push(0);
        assert!(!post.post(CARRIER_TAG, &oversized), "length mismatch must be ignored");

        assert!(post.post(CARRIER_TAG, &event));
        assert_eq!(rx.read().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_read_fails_when_peer_is_gone() {
        let (left, right) = pair();
        drop(right);
        let (_, mut rx) = left.split();
        assert_eq!(rx.read().await.unwrap_err().kind, ErrorKind::MailboxClosed);
    }

    #[tokio::test]
    async fn test_write_fails_when_peer_is_gone() {
        let (left, right) = pair();
        drop(right);
        let (mut tx, _) = left.split();
        assert_eq!(
            tx.write(sample_message()).await.unwrap_err().kind,
            ErrorKind::MailboxClosed
        );
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_read() {
        let (mut left, _right) = pair();
        let token = CancellationToken::new();
        left.set_cancellation_token(token.clone());
        let (_, mut rx) = left.split();

        let pending = tokio::spawn(async move { rx.read().await });
        token.cancel();
        assert_eq!(pending.await.unwrap().unwrap_err().kind, ErrorKind::Cancelled);
    }
}
