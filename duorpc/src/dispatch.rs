use futures::future::BoxFuture;

use crate::{
    MethodId, SerializerState,
    error::{Error, ErrorKind, Result},
};

type CallFn =
    Box<dyn Fn(Vec<u8>, Option<SerializerState>) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;
type OnewayFn = Box<dyn Fn(Vec<u8>, Option<SerializerState>) -> Result<()> + Send + Sync>;

enum Handler {
    /// Awaited invocation producing an encoded reply payload.
    Call(CallFn),
    /// Synchronous fire-and-forget invocation; never produces a reply.
    Oneway(OnewayFn),
}

/// One dispatch-table slot, produced by the `export()` fn that
/// `#[duorpc::interface]` generates.
pub struct MethodEntry {
    id: MethodId,
    name: &'static str,
    handler: Handler,
}

impl MethodEntry {
    #[must_use]
    pub fn call(id: MethodId, name: &'static str, handler: CallFn) -> Self {
        Self {
            id,
            name,
            handler: Handler::Call(handler),
        }
    }

    #[must_use]
    pub fn oneway(id: MethodId, name: &'static str, handler: OnewayFn) -> Self {
        Self {
            id,
            name,
            handler: Handler::Oneway(handler),
        }
    }
}

/// Server-side method table: entries sorted by method identifier and binary
/// searched per request.
pub struct Dispatcher {
    entries: Vec<MethodEntry>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(mut entries: Vec<MethodEntry>) -> Self {
        entries.sort_by_key(|e| e.id);
        debug_assert!(
            entries.windows(2).all(|w| w[0].id != w[1].id),
            "duplicate method identifier in dispatch table"
        );
        Self { entries }
    }

    pub fn method_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|e| e.name)
    }

    fn find(&self, id: MethodId) -> Result<&MethodEntry> {
        self.entries
            .binary_search_by_key(&id, |e| e.id)
            .map(|index| &self.entries[index])
            .map_err(|_| Error::new(ErrorKind::NotImplemented, format!("unknown method id {id}")))
    }

    /// Handles a `Request`: decodes the argument tuple, invokes the
    /// implementation and returns the encoded reply payload.
    ///
    /// A fire-and-forget method addressed through a `Request` is not invoked;
    /// the reply is an empty payload.
    ///
    /// # Errors
    pub async fn dispatch(
        &self,
        id: MethodId,
        payload: Vec<u8>,
        state: Option<SerializerState>,
    ) -> Result<Vec<u8>> {
        match &self.find(id)?.handler {
            Handler::Call(handler) => handler(payload, state).await,
            Handler::Oneway(_) => Ok(Vec::new()),
        }
    }

    /// Handles a `VoidRequest`: decodes and invokes synchronously. An awaited
    /// method addressed through a `VoidRequest` is a no-op.
    ///
    /// # Errors
    pub fn void_dispatch(
        &self,
        id: MethodId,
        payload: Vec<u8>,
        state: Option<SerializerState>,
    ) -> Result<()> {
        match &self.find(id)?.handler {
            Handler::Oneway(handler) => handler(payload, state),
            Handler::Call(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("methods", &self.entries.iter().map(|e| e.name).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;
    use crate::{Decode, Encode, Reader, Writer};

    fn echo_entry() -> MethodEntry {
        MethodEntry::call(
            MethodId::from_name("echo"),
            "echo",
            Box::new(|payload, state| {
                Box::pin(async move {
                    let mut r = Reader::with_state(&payload, state.as_ref());
                    let text = String::decode(&mut r)?;
                    let mut w = Writer::with_state(state.clone());
                    text.encode(&mut w);
                    Ok(w.into_payload())
                })
            }),
        )
    }

    fn counter_entry(counter: Arc<AtomicU32>) -> MethodEntry {
        MethodEntry::oneway(
            MethodId::from_name("bump"),
            "bump",
            Box::new(move |payload, _state| {
                let mut r = Reader::new(&payload);
                counter.fetch_add(u32::decode(&mut r)?, Ordering::AcqRel);
                Ok(())
            }),
        )
    }

    #[tokio::test]
    async fn test_dispatch_by_id() {
        let counter = Arc::new(AtomicU32::new(0));
        let dispatcher = Dispatcher::new(vec![echo_entry(), counter_entry(counter.clone())]);

        let mut w = Writer::new();
        "rua".encode(&mut w);
        let reply = dispatcher
            .dispatch(MethodId::from_name("echo"), w.into_payload(), None)
            .await
            .unwrap();
        let mut r = Reader::new(&reply);
        assert_eq!(String::decode(&mut r).unwrap(), "rua");

        let mut w = Writer::new();
        3u32.encode(&mut w);
        dispatcher
            .void_dispatch(MethodId::from_name("bump"), w.into_payload(), None)
            .unwrap();
        assert_eq!(counter.load(Ordering::Acquire), 3);
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_implemented() {
        let dispatcher = Dispatcher::new(vec![echo_entry()]);
        let err = dispatcher
            .dispatch(MethodId::from_name("missing"), Vec::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotImplemented);

        let err = dispatcher
            .void_dispatch(MethodId::from_name("missing"), Vec::new(), None)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotImplemented);
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_inert() {
        let counter = Arc::new(AtomicU32::new(0));
        let dispatcher = Dispatcher::new(vec![echo_entry(), counter_entry(counter.clone())]);

        // A oneway method reached by an awaited call replies empty without
        // running; an awaited method reached by a void call does nothing.
        let mut w = Writer::new();
        7u32.encode(&mut w);
        let reply = dispatcher
            .dispatch(MethodId::from_name("bump"), w.into_payload(), None)
            .await
            .unwrap();
        assert!(reply.is_empty());
        assert_eq!(counter.load(Ordering::Acquire), 0);

        dispatcher
            .void_dispatch(MethodId::from_name("echo"), Vec::new(), None)
            .unwrap();
    }
}
