//! # duorpc — light-weight full-duplex RPC
//!
//! duorpc is a transport-agnostic RPC framework in which either endpoint of a
//! connection may act as caller and as server at the same time. An interface
//! is an ordinary trait; the `#[duorpc::interface]` macro derives the client
//! stubs and the server dispatch table from it, so both sides agree on method
//! identities and wire formats without manual message numbering.
//!
//! ## Features
//!
//! - **Full duplex**: overlapping calls in both directions over one carrier,
//!   multiplexed by call id
//! - **Binary codec**: a compact little-endian wire format with an
//!   extensibility hook (`impl Encode`/`Decode` by hand) and an optional
//!   serializer state threaded through every encoder and decoder
//! - **Pluggable transports**: TCP, local pipes and an in-process message
//!   carrier ship with the crate; anything implementing [`Transport`] works
//! - **Async/Await**: built on tokio; fire-and-forget methods return without
//!   waiting for the peer
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use duorpc::{Connection, Result};
//!
//! #[duorpc::interface]
//! pub trait Echo {
//!     async fn echo(&self, text: String) -> Result<String>;
//! }
//!
//! struct EchoImpl;
//!
//! impl Echo for EchoImpl {
//!     async fn echo(&self, text: String) -> Result<String> {
//!         Ok(text)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (client_transport, server_transport) = duorpc::mailbox::pair();
//!
//!     let server = Connection::with_dispatcher(std::sync::Arc::new(EchoImpl).export());
//!     server.start(server_transport)?;
//!
//!     let client = Connection::new();
//!     client.start(client_transport)?;
//!     println!("{}", client.echo("Rua!".to_string()).await?);
//!
//!     client.stop().await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

/// Procedural macro turning a trait declaration into a described RPC
/// interface: client stubs on [`Connection`], a server-side `export()`
/// building the dispatch table, and the `METHODS` description table.
pub use duorpc_macro::interface;

/// Derive macros for the wire codec: struct fields encode in declaration
/// order, enums as a u16 tag followed by the selected variant's fields.
pub use duorpc_macro::{Decode, Encode};

/// Error types and error handling utilities.
mod error;
pub use error::{Error, ErrorKind, Result};

/// Binary serialization: `Encode`/`Decode` traits, `Writer`/`Reader` and the
/// opaque serializer state.
mod codec;
pub use codec::{Decode, Encode, Reader, SerializerState, Writer};

/// Name-derived method identifiers.
mod method_id;
pub use method_id::{MethodId, fnv1a};

/// Message framing: header packing and call types.
mod msg;
pub use msg::{CALL_ID_MASK, CallType, Header, Message};

/// Interface descriptions produced by the `#[interface]` macro.
pub mod desc;
pub use desc::{MethodDesc, ReturnShape};

/// Server-side dispatch table.
mod dispatch;
pub use dispatch::{Dispatcher, MethodEntry};

/// Transport contract and the type-erased carrier facade.
mod transport;
pub use transport::{
    DynTransport, FRAME_HEADER_SIZE, Transport, TransportRx, TransportTx, decode_frame_header,
    encode_frame_header,
};

/// In-flight request accounting for the reader task.
mod tracker;

/// The connection engine.
mod connection;
pub use connection::{CapturedOn, Connection};

/// TCP carrier.
pub mod tcp;

/// Local pipe carrier.
#[cfg(unix)]
pub mod pipe;

/// In-process message carrier.
pub mod mailbox;
