//! Local pipe carrier over Unix domain sockets.
//!
//! Frames are the same extended header used by the TCP carrier. Reads and
//! writes are chunked in 64 KiB segments, the ceiling the original local-pipe
//! implementation had to respect per I/O operation; the chunking is invisible
//! above the transport.

use std::path::{Path, PathBuf};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, ErrorKind, Result},
    msg::Message,
    transport::{Transport, TransportRx, TransportTx, decode_frame_header, encode_frame_header},
};

/// Largest single read or write issued against the pipe.
pub const MAX_CHUNK: usize = 64 * 1024;

/// A connected local-pipe carrier.
#[derive(Debug)]
pub struct PipeTransport {
    stream: UnixStream,
    cancel: CancellationToken,
}

impl PipeTransport {
    /// # Errors
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| Error::new(ErrorKind::PipeConnectFailed, e.to_string()))?;
        Ok(Self::from_stream(stream))
    }

    #[must_use]
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            cancel: CancellationToken::new(),
        }
    }
}

impl Transport for PipeTransport {
    type Tx = PipeTx;
    type Rx = PipeRx;

    fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancel = token.child_token();
    }

    fn split(self) -> (Self::Tx, Self::Rx) {
        let (read_half, write_half) = self.stream.into_split();
        (
            PipeTx { stream: write_half },
            PipeRx {
                stream: read_half,
                cancel: self.cancel,
            },
        )
    }
}

pub struct PipeTx {
    stream: OwnedWriteHalf,
}

impl TransportTx for PipeTx {
    async fn write(&mut self, message: Message) -> Result<()> {
        let head = encode_frame_header(message.header, message.payload.len() as u32);
        self.stream
            .write_all(&head)
            .await
            .map_err(|e| Error::new(ErrorKind::PipeSendFailed, e.to_string()))?;

        for chunk in message.payload.chunks(MAX_CHUNK) {
            self.stream
                .write_all(chunk)
                .await
                .map_err(|e| Error::new(ErrorKind::PipeSendFailed, e.to_string()))?;
        }
        Ok(())
    }
}

pub struct PipeRx {
    stream: OwnedReadHalf,
    cancel: CancellationToken,
}

impl PipeRx {
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::kind(ErrorKind::Cancelled)),
            read = self.stream.read_exact(buf) => {
                read.map(|_| ()).map_err(|e| Error::new(ErrorKind::PipeRecvFailed, e.to_string()))
            }
        }
    }
}

impl TransportRx for PipeRx {
    async fn read(&mut self) -> Result<Message> {
        let mut head = [0u8; crate::transport::FRAME_HEADER_SIZE];
        self.read_exact(&mut head).await?;
        let (header, payload_size) = decode_frame_header(head);

        let mut payload = vec![0u8; payload_size as usize];
        for chunk in payload.chunks_mut(MAX_CHUNK) {
            self.read_exact(chunk).await?;
        }
        Ok(Message::new(header, payload))
    }
}

/// Accepts inbound pipe carriers. The socket file is removed when the
/// listener is dropped.
#[derive(Debug)]
pub struct PipeListener {
    inner: tokio::net::UnixListener,
    path: PathBuf,
}

impl PipeListener {
    /// # Errors
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = tokio::net::UnixListener::bind(&path)
            .map_err(|e| Error::new(ErrorKind::PipeBindFailed, e.to_string()))?;
        Ok(Self { inner, path })
    }

    /// Waits for the next client and wraps it into a transport.
    ///
    /// # Errors
    pub async fn accept(&self) -> Result<PipeTransport> {
        let (stream, _addr) = self
            .inner
            .accept()
            .await
            .map_err(|e| Error::new(ErrorKind::PipeConnectFailed, e.to_string()))?;
        Ok(PipeTransport::from_stream(stream))
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
