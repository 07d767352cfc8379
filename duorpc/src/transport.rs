use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{
    error::Result,
    msg::{Header, Message},
};

/// Sending half of a carrier.
pub trait TransportTx: Send + 'static {
    /// Delivers one message, in order, exactly once. Completes only when the
    /// carrier is ready to accept another write, so messages from a single
    /// writer can never interleave.
    fn write(&mut self, message: Message) -> impl Future<Output = Result<()>> + Send;
}

/// Receiving half of a carrier.
pub trait TransportRx: Send + 'static {
    /// Produces the next complete message, or a transport error (peer
    /// disconnect included).
    fn read(&mut self) -> impl Future<Output = Result<Message>> + Send;
}

/// A byte-framed, message-oriented carrier.
///
/// A connection takes exclusive ownership of its transport for as long as it
/// runs: the carrier is split into its two directions, the writer task owning
/// the tx half and the reader task the rx half. Cancellation is wired before
/// the split so carrier I/O aborts promptly when the connection stops.
pub trait Transport: Send + 'static {
    type Tx: TransportTx;
    type Rx: TransportRx;

    /// Links carrier I/O to the connection's cancellation scope. Carriers
    /// derive a child token so an external stop propagates inward only.
    fn set_cancellation_token(&mut self, token: CancellationToken);

    fn split(self) -> (Self::Tx, Self::Rx);
}

/// Size of the extended frame header stream carriers prepend: the packed
/// message header plus a u32 payload size.
pub const FRAME_HEADER_SIZE: usize = Header::WIRE_SIZE + 4;

#[must_use]
pub fn encode_frame_header(header: Header, payload_size: u32) -> [u8; FRAME_HEADER_SIZE] {
    let mut out = [0u8; FRAME_HEADER_SIZE];
    out[..Header::WIRE_SIZE].copy_from_slice(&header.pack());
    out[Header::WIRE_SIZE..].copy_from_slice(&payload_size.to_le_bytes());
    out
}

#[must_use]
pub fn decode_frame_header(bytes: [u8; FRAME_HEADER_SIZE]) -> (Header, u32) {
    let header = Header::unpack(bytes[..Header::WIRE_SIZE].try_into().unwrap());
    let payload_size = u32::from_le_bytes(bytes[Header::WIRE_SIZE..].try_into().unwrap());
    (header, payload_size)
}

trait ErasedTx: Send {
    fn write(&mut self, message: Message) -> BoxFuture<'_, Result<()>>;
}

impl<T: TransportTx> ErasedTx for T {
    fn write(&mut self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(TransportTx::write(self, message))
    }
}

trait ErasedRx: Send {
    fn read(&mut self) -> BoxFuture<'_, Result<Message>>;
}

impl<T: TransportRx> ErasedRx for T {
    fn read(&mut self) -> BoxFuture<'_, Result<Message>> {
        Box::pin(TransportRx::read(self))
    }
}

trait ErasedTransport: Send {
    fn set_cancellation_token(&mut self, token: CancellationToken);
    fn split(self: Box<Self>) -> (DynTx, DynRx);
}

impl<T: Transport> ErasedTransport for T {
    fn set_cancellation_token(&mut self, token: CancellationToken) {
        Transport::set_cancellation_token(self, token);
    }

    fn split(self: Box<Self>) -> (DynTx, DynRx) {
        let (tx, rx) = Transport::split(*self);
        (DynTx(Box::new(tx)), DynRx(Box::new(rx)))
    }
}

/// Type-erased carrier, so a single connection can be bound to a transport
/// chosen at runtime.
pub struct DynTransport {
    inner: Box<dyn ErasedTransport>,
}

pub struct DynTx(Box<dyn ErasedTx>);

pub struct DynRx(Box<dyn ErasedRx>);

impl DynTransport {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self {
            inner: Box::new(transport),
        }
    }
}

impl Transport for DynTransport {
    type Tx = DynTx;
    type Rx = DynRx;

    fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.inner.set_cancellation_token(token);
    }

    fn split(self) -> (Self::Tx, Self::Rx) {
        self.inner.split()
    }
}

impl TransportTx for DynTx {
    fn write(&mut self, message: Message) -> impl Future<Output = Result<()>> + Send {
        self.0.write(message)
    }
}

impl TransportRx for DynRx {
    fn read(&mut self) -> impl Future<Output = Result<Message>> + Send {
        self.0.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallType, MethodId};

    #[test]
    fn test_frame_header_round_trip() {
        let header = Header::new(42, CallType::Request, MethodId::from_name("echo"));
        let (decoded, size) = decode_frame_header(encode_frame_header(header, 512));
        assert_eq!(decoded, header);
        assert_eq!(size, 512);
    }

    #[tokio::test]
    async fn test_dyn_transport_erases_a_concrete_carrier() {
        let (left, right) = crate::mailbox::pair();
        let mut erased = DynTransport::new(left);
        Transport::set_cancellation_token(&mut erased, CancellationToken::new());
        let (mut tx, _rx) = erased.split();

        let message = Message::new(
            Header::new(1, CallType::VoidRequest, MethodId::from_name("ping")),
            vec![1, 2, 3],
        );
        TransportTx::write(&mut tx, message.clone()).await.unwrap();

        let (_tx2, mut rx2) = right.split();
        assert_eq!(TransportRx::read(&mut rx2).await.unwrap(), message);
    }
}
