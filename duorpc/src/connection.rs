use std::{
    any::Any,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use dashmap::DashMap;
use foldhash::fast::RandomState;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    Dispatcher, MethodId,
    codec::{Reader, SerializerState, Writer},
    error::{Error, ErrorKind, Result},
    msg::{CALL_ID_MASK, CallType, Header, Message},
    tracker::RequestTracker,
    transport::{Transport, TransportRx, TransportTx},
};

/// Phase in which a connection error was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturedOn {
    Send,
    Receive,
    Stop,
}

type ErrorHook = Box<dyn FnOnce(Error, CapturedOn) + Send + 'static>;

#[derive(Default)]
struct ErrorSlot {
    hook: Option<ErrorHook>,
    captured: Option<(Error, CapturedOn)>,
}

struct Active {
    cancel: CancellationToken,
    write_tx: mpsc::UnboundedSender<Message>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

struct Shared {
    dispatcher: Option<Dispatcher>,
    serializer_state: Option<SerializerState>,
    pending: DashMap<u32, oneshot::Sender<Result<Vec<u8>>>, RandomState>,
    next_call_id: AtomicU32,
    error: Mutex<ErrorSlot>,
    active: Mutex<Option<Active>>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// A full-duplex RPC endpoint bound to one transport.
///
/// Client stubs generated by `#[duorpc::interface]` are implemented directly
/// on `Connection`, so any connection can issue calls; attaching a
/// [`Dispatcher`] additionally lets it serve inbound requests. Both roles run
/// over the same message loop and may overlap freely.
///
/// Lifecycle: idle on construction, running after [`Connection::start`],
/// stopped after [`Connection::stop`] (which is idempotent and leaves the
/// connection restartable). Dropping a running connection cancels its tasks
/// without joining them.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a caller-only connection. Inbound requests fail with
    /// `InvalidArgument`.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a connection that also serves requests through `dispatcher`.
    #[must_use]
    pub fn with_dispatcher(dispatcher: Dispatcher) -> Self {
        Self::build(Some(dispatcher))
    }

    fn build(dispatcher: Option<Dispatcher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                dispatcher,
                serializer_state: None,
                pending: DashMap::default(),
                next_call_id: AtomicU32::new(0),
                error: Mutex::default(),
                active: Mutex::default(),
                lifecycle: tokio::sync::Mutex::default(),
            }),
        }
    }

    /// Attaches the serializer state threaded through every [`Writer`] and
    /// [`Reader`] this connection creates. Must be called before the
    /// connection is started.
    ///
    /// # Panics
    ///
    /// Panics if called on a connection that has already been started.
    #[must_use]
    pub fn serializer_state<S: Any + Send + Sync>(mut self, state: S) -> Self {
        let shared = Arc::get_mut(&mut self.shared)
            .expect("serializer state must be installed before start");
        shared.serializer_state = Some(Arc::new(state));
        self
    }

    /// Installs the transport and spawns the reader and writer tasks.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` if the connection is already running.
    pub fn start<T: Transport>(&self, mut transport: T) -> Result<()> {
        let mut active = self.shared.active.lock().unwrap();
        if active.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "connection already running".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        transport.set_cancellation_token(cancel.clone());
        let (tx_half, rx_half) = transport.split();

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(writer_loop(
            tx_half,
            write_rx,
            cancel.clone(),
            Arc::clone(&self.shared),
        ));
        let reader_task = tokio::spawn(reader_loop(
            rx_half,
            cancel.clone(),
            Arc::clone(&self.shared),
            write_tx.clone(),
        ));

        *active = Some(Active {
            cancel,
            write_tx,
            writer_task,
            reader_task,
        });
        Ok(())
    }

    /// Stops the connection: reports `Aborted` to the error hook, cancels
    /// both tasks, joins them, fails every pending call with `Cancelled` and
    /// releases the transport.
    ///
    /// Idempotent; a concurrent second call returns once the first has
    /// completed. The connection can be started again afterwards.
    pub async fn stop(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let Some(active) = self.shared.active.lock().unwrap().take() else {
            return;
        };

        self.shared
            .report_error(Error::kind(ErrorKind::Aborted), CapturedOn::Stop);
        active.cancel.cancel();
        let _ = active.writer_task.await;
        let _ = active.reader_task.await;
        self.shared.fail_pending();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            self.shared.active.lock().unwrap().as_ref(),
            Some(active) if !active.cancel.is_cancelled()
        )
    }

    /// Installs the error hook.
    ///
    /// The hook fires at most once, on a background task, with the error and
    /// the phase it was captured in. If an error was already captured before
    /// installation the hook fires immediately. After it has fired a new hook
    /// may be installed.
    pub fn on_error<F>(&self, hook: F)
    where
        F: FnOnce(Error, CapturedOn) + Send + 'static,
    {
        let mut slot = self.shared.error.lock().unwrap();
        if let Some((error, on)) = slot.captured.take() {
            drop(slot);
            hook(error, on);
        } else {
            slot.hook = Some(Box::new(hook));
        }
    }

    /// Removes a previously installed error hook.
    pub fn clear_error_hook(&self) {
        self.shared.error.lock().unwrap().hook = None;
    }

    /// Creates a [`Writer`] carrying this connection's serializer state.
    /// Used by generated client stubs to encode argument tuples.
    #[must_use]
    pub fn writer(&self) -> Writer {
        Writer::with_state(self.shared.serializer_state.clone())
    }

    /// Creates a [`Reader`] over a reply payload, carrying this connection's
    /// serializer state.
    #[must_use]
    pub fn reader<'a>(&'a self, payload: &'a [u8]) -> Reader<'a> {
        Reader::with_state(payload, self.shared.serializer_state.as_ref())
    }

    /// Issues an awaited call: allocates a call id, registers a pending-call
    /// slot, enqueues a `Request` and waits for the matching reply payload.
    ///
    /// # Errors
    ///
    /// Fails with `Cancelled` if the connection is not running or stops while
    /// the call is pending, or with the peer's error on a `ResponseError`.
    pub async fn call(&self, method: MethodId, payload: Vec<u8>) -> Result<Vec<u8>> {
        let (cancel, write_tx) = self.shared.handles()?;

        let call_id = self.shared.next_call_id.fetch_add(1, Ordering::Relaxed) & CALL_ID_MASK;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.insert(call_id, reply_tx);

        let message = Message::new(Header::new(call_id, CallType::Request, method), payload);
        if write_tx.send(message).is_err() {
            self.shared.pending.remove(&call_id);
            return Err(Error::kind(ErrorKind::Cancelled));
        }

        tokio::select! {
            () = cancel.cancelled() => {
                self.shared.pending.remove(&call_id);
                Err(Error::kind(ErrorKind::Cancelled))
            }
            reply = reply_rx => reply.unwrap_or_else(|_| Err(Error::kind(ErrorKind::Cancelled))),
        }
    }

    /// Issues a fire-and-forget call. Returns as soon as the message is
    /// enqueued; delivery is not acknowledged and no reply will ever arrive.
    ///
    /// # Errors
    ///
    /// Fails with `Cancelled` if the connection is not running.
    pub fn void_call(&self, method: MethodId, payload: Vec<u8>) -> Result<()> {
        let (_, write_tx) = self.shared.handles()?;
        let call_id = self.shared.next_call_id.fetch_add(1, Ordering::Relaxed) & CALL_ID_MASK;
        let message = Message::new(Header::new(call_id, CallType::VoidRequest, method), payload);
        write_tx
            .send(message)
            .map_err(|_| Error::kind(ErrorKind::Cancelled))
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Tasks hold their own Arc to the shared state; cancelling is enough
        // to unwind them, and dropping pending slots cancels their callers.
        if let Ok(mut active) = self.shared.active.lock()
            && let Some(active) = active.take()
        {
            active.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("running", &self.is_running())
            .field("server", &self.shared.dispatcher.is_some())
            .finish()
    }
}

impl Shared {
    fn handles(&self) -> Result<(CancellationToken, mpsc::UnboundedSender<Message>)> {
        match self.active.lock().unwrap().as_ref() {
            Some(active) if !active.cancel.is_cancelled() => {
                Ok((active.cancel.clone(), active.write_tx.clone()))
            }
            _ => Err(Error::kind(ErrorKind::Cancelled)),
        }
    }

    fn report_error(&self, error: Error, on: CapturedOn) {
        let mut slot = self.error.lock().unwrap();
        if let Some(hook) = slot.hook.take() {
            drop(slot);
            tokio::spawn(async move { hook(error, on) });
        } else {
            slot.captured = Some((error, on));
        }
    }

    fn fail_pending(&self) {
        let ids: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, reply_tx)) = self.pending.remove(&id) {
                let _ = reply_tx.send(Err(Error::kind(ErrorKind::Cancelled)));
            }
        }
    }

    /// Resolves the pending call matching a `Response`/`ResponseError`.
    fn complete_call(&self, message: Message) {
        let Some((_, reply_tx)) = self.pending.remove(&message.header.call_id) else {
            tracing::warn!("no pending call for id {}", message.header.call_id);
            return;
        };

        let reply = if message.header.call_type == CallType::ResponseError {
            match <[u8; 4]>::try_from(message.payload.as_slice()) {
                Ok(code) => Err(Error::from_wire_code(u32::from_le_bytes(code))),
                Err(_) => Err(Error::new(
                    ErrorKind::InvocationFailed,
                    format!("malformed error payload of {} bytes", message.payload.len()),
                )),
            }
        } else {
            Ok(message.payload)
        };
        let _ = reply_tx.send(reply);
    }

    /// Runs a fire-and-forget request synchronously. Failures are logged and
    /// never produce a reply.
    fn handle_void_request(&self, message: Message) {
        let result = match &self.dispatcher {
            Some(dispatcher) => dispatcher.void_dispatch(
                message.header.method_id,
                message.payload,
                self.serializer_state.clone(),
            ),
            None => Err(Error::kind(ErrorKind::InvalidArgument)),
        };
        if let Err(error) = result {
            tracing::warn!("void request {} failed: {error}", message.header.method_id);
        }
    }
}

async fn writer_loop(
    mut tx: impl TransportTx,
    mut queue: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
) {
    loop {
        // Cancellation wins over further queue traffic once stop is under way.
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = tx.write(message) => result,
        };
        if let Err(error) = result {
            cancel.cancel();
            shared.report_error(error, CapturedOn::Send);
            break;
        }
    }
}

async fn reader_loop(
    mut rx: impl TransportRx,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    write_tx: mpsc::UnboundedSender<Message>,
) {
    let (tracker, reader_guard) = RequestTracker::start();

    loop {
        // On a clean stop the cancellation must win over the carrier's own
        // cancelled read, which is not a transport failure worth reporting.
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = rx.read() => match result {
                Ok(message) => message,
                Err(error) => {
                    cancel.cancel();
                    shared.report_error(error, CapturedOn::Receive);
                    break;
                }
            },
        };

        match message.header.call_type {
            CallType::Response | CallType::ResponseError => shared.complete_call(message),
            CallType::VoidRequest => shared.handle_void_request(message),
            CallType::Request => {
                let guard = tracker.track();
                let shared = Arc::clone(&shared);
                let cancel = cancel.clone();
                let write_tx = write_tx.clone();
                tokio::spawn(async move {
                    handle_request(message, &shared, &cancel, &write_tx).await;
                    drop(guard);
                });
            }
        }
    }

    // The reader may only return once every spawned handler has finished.
    drop(reader_guard);
    tracker.drained().await;
}

async fn handle_request(
    message: Message,
    shared: &Shared,
    cancel: &CancellationToken,
    write_tx: &mpsc::UnboundedSender<Message>,
) {
    let Header {
        call_id, method_id, ..
    } = message.header;

    let invoke = async {
        match &shared.dispatcher {
            Some(dispatcher) => {
                dispatcher
                    .dispatch(method_id, message.payload, shared.serializer_state.clone())
                    .await
            }
            None => Err(Error::kind(ErrorKind::InvalidArgument)),
        }
    };
    let result = tokio::select! {
        biased;
        // Cancellation between dispatch and send drops the reply.
        () = cancel.cancelled() => return,
        result = invoke => result,
    };

    let reply = match result {
        Ok(payload) => Message::new(Header::new(call_id, CallType::Response, method_id), payload),
        Err(error) => Message::new(
            Header::new(call_id, CallType::ResponseError, method_id),
            error.wire_code().to_le_bytes().to_vec(),
        ),
    };
    let _ = write_tx.send(reply);
}
