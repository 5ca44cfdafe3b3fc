//! RPC transport and correlator over a reliable, ordered byte stream.
//!
//! One [`IpcTransport`] owns one peer connection. Outbound packets funnel
//! through a writer task; a reader task decodes newline-delimited JSON and
//! routes responses to their pending calls and inbound calls to the
//! handler table supplied at attach time. In production the stream is a
//! worker process's stdin/stdout; tests drive it over `tokio::io::duplex`.
//!
//! Calls are fully independent: ordering is guaranteed only within a
//! call/response pair, and inbound calls are dispatched on their own tasks
//! so handlers must not assume serialization.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::{Pin, pin};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, warn};

use crate::wire::{CALLBACK_ID_CEILING, CallPacket, ErrorPayload, Packet, ResponsePacket};

/// Error a call settles with. `Timeout` is deliberately distinct from
/// `Remote`: the peer never answered vs. the peer's handler failed.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("call `{name}` timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
    #[error("peer failed `{name}`: {message}")]
    Remote {
        name: String,
        message: String,
        stack: Option<String>,
    },
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Applied to every `call` that does not pass its own timeout.
    pub default_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, ErrorPayload>> + Send>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Per-transport table of inbound-call handlers, keyed by a closed method
/// enum. An explicit record passed at construction, never a global.
pub struct HandlerTable<M> {
    handlers: HashMap<M, Handler>,
}

impl<M: Eq + Hash> HandlerTable<M> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn on<F, Fut>(mut self, method: M, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorPayload>> + Send + 'static,
    {
        self.handlers
            .insert(method, Arc::new(move |payload| Box::pin(handler(payload))));
        self
    }
}

impl<M: Eq + Hash> Default for HandlerTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// One live connection to a peer. Cheap to clone; all clones share the
/// same pending-call table and callback-id counter.
#[derive(Clone)]
pub struct IpcTransport {
    outbound: mpsc::UnboundedSender<Packet>,
    pending: Arc<DashMap<u32, oneshot::Sender<ResponsePacket>>>,
    next_id: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
    on_closed: Arc<Notify>,
    default_timeout: Duration,
}

impl IpcTransport {
    /// Wire up a transport over `reader`/`writer` and start its IO tasks.
    /// The tasks end when the stream does (peer exit, EOF) or on a
    /// malformed packet; either way every pending call is rejected.
    pub fn attach<R, W, M>(
        reader: R,
        writer: W,
        handlers: HandlerTable<M>,
        options: TransportOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        M: FromStr + Eq + Hash + Send + Sync + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Packet>();
        let transport = Self {
            outbound,
            pending: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU32::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
            on_closed: Arc::new(Notify::new()),
            default_timeout: options.default_timeout,
        };

        tokio::spawn(write_loop(writer, outbound_rx));
        tokio::spawn(read_loop(reader, handlers, transport.clone()));

        transport
    }

    /// Send `name` and suspend until the peer answers or the default
    /// timeout expires. Resolves with exactly the payload the remote
    /// handler returned, exactly once.
    pub async fn call(&self, name: impl Into<String>, payload: Value) -> Result<Value, CallError> {
        self.call_with_timeout(name, payload, self.default_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        name: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let name = name.into();
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::Closed);
        }

        let id = self.allocate_callback_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let packet = Packet::Call(CallPacket::call(name.clone(), payload, id));
        if self.outbound.send(packet).is_err() {
            self.pending.remove(&id);
            return Err(CallError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            // the peer never answered; drop the pending slot so a late
            // response finds nothing and is discarded
            Err(_) => {
                self.pending.remove(&id);
                Err(CallError::Timeout { name, timeout })
            }
            // transport went away and rejected everything in flight
            Ok(Err(_)) => Err(CallError::Closed),
            Ok(Ok(response)) => {
                if response.success {
                    Ok(response.payload)
                } else {
                    let error = ErrorPayload::from_value(&response.payload);
                    Err(CallError::Remote {
                        name,
                        message: error.message,
                        stack: error.stack,
                    })
                }
            }
        }
    }

    /// Fire-and-forget: no callback id, no pending call, no result beyond
    /// transport-level failure.
    pub fn call_no_reply(&self, name: impl Into<String>, payload: Value) -> Result<(), CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::Closed);
        }
        let packet = Packet::Call(CallPacket::notification(name, payload));
        self.outbound.send(packet).map_err(|_| CallError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection is gone (peer exit, EOF, malformed
    /// stream). Immediately if it already is.
    pub async fn closed(&self) {
        let mut notified = pin!(self.on_closed.notified());
        notified.as_mut().enable();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }

    /// Ids live in 1..=2^28 and wrap back to 1 past the ceiling. Reuse
    /// after wraparound assumes all earlier ids have long since settled.
    fn allocate_callback_id(&self) -> u32 {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(if n >= CALLBACK_ID_CEILING { 1 } else { n + 1 })
            })
            .unwrap_or(1)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // dropping the senders rejects every in-flight call
        self.pending.clear();
        self.on_closed.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn set_next_callback_id(&self, id: u32) {
        self.next_id.store(id, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

async fn write_loop<W>(writer: W, mut rx: mpsc::UnboundedReceiver<Packet>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer = BufWriter::new(writer);
    while let Some(packet) = rx.recv().await {
        let line = match serde_json::to_string(&packet) {
            Ok(line) => line,
            Err(err) => {
                warn!("dropping unserializable packet: {err}");
                continue;
            }
        };
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if writer.write_all(b"\n").await.is_err() || writer.flush().await.is_err() {
            break;
        }
    }
}

async fn read_loop<R, M>(reader: R, handlers: HandlerTable<M>, transport: IpcTransport)
where
    R: AsyncRead + Unpin + Send + 'static,
    M: FromStr + Eq + Hash + Send + Sync + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Packet>(line) {
                    Ok(Packet::Response(response)) => dispatch_response(&transport, response),
                    Ok(Packet::Call(call)) => dispatch_call(&transport, &handlers, call),
                    Err(err) => {
                        warn!("malformed packet from peer, dropping connection: {err}");
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("transport read error: {err}");
                break;
            }
        }
    }
    transport.mark_closed();
}

fn dispatch_response(transport: &IpcTransport, response: ResponsePacket) {
    // a zero id cannot have been allocated; this is protocol misuse
    if response.callback_id == 0 {
        warn!("response without a callback id, not dispatched");
        return;
    }
    match transport.pending.remove(&response.callback_id) {
        Some((_, tx)) => {
            // the receiver may have timed out in the meantime; that is fine
            let _ = tx.send(response);
        }
        None => debug!(
            "late or unknown response for callback {}, discarded",
            response.callback_id
        ),
    }
}

fn dispatch_call<M>(transport: &IpcTransport, handlers: &HandlerTable<M>, call: CallPacket)
where
    M: FromStr + Eq + Hash + Send + Sync + 'static,
{
    let handler = M::from_str(&call.name)
        .ok()
        .and_then(|method| handlers.handlers.get(&method).cloned());

    let Some(handler) = handler else {
        // unknown command: answer if a reply was expected, otherwise log
        match call.callback_id {
            Some(id) => {
                let error = ErrorPayload::new(format!("unknown command `{}`", call.name));
                let _ = transport
                    .outbound
                    .send(Packet::Response(ResponsePacket::fail(id, error)));
            }
            None => warn!("notification for unknown command `{}`", call.name),
        }
        return;
    };

    let outbound = transport.outbound.clone();
    tokio::spawn(async move {
        // run the handler on its own task so a panic is contained and
        // serialized instead of tearing the transport down
        let result = match tokio::spawn(handler(call.payload)).await {
            Ok(result) => result,
            Err(join) => Err(ErrorPayload::new(format!("handler panicked: {join}"))),
        };
        if let Some(id) = call.callback_id {
            let response = match result {
                Ok(payload) => ResponsePacket::ok(id, payload),
                Err(error) => ResponsePacket::fail(id, error),
            };
            let _ = outbound.send(Packet::Response(response));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strum_macros::{AsRefStr, Display, EnumString};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex, split};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
    #[strum(serialize_all = "camelCase")]
    enum TestMethod {
        Echo,
        Fail,
        Slow,
        Note,
    }

    fn peer_handlers() -> HandlerTable<TestMethod> {
        HandlerTable::new()
            .on(TestMethod::Echo, |payload| async move { Ok(payload) })
            .on(TestMethod::Fail, |_| async move {
                Err(ErrorPayload::with_stack("it broke", "fail at peer"))
            })
            .on(TestMethod::Slow, |payload| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(payload)
            })
    }

    /// Two transports talking over an in-memory pipe.
    fn pair(
        handlers_a: HandlerTable<TestMethod>,
        handlers_b: HandlerTable<TestMethod>,
    ) -> (IpcTransport, IpcTransport) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        let opts = TransportOptions {
            default_timeout: Duration::from_secs(5),
        };
        (
            IpcTransport::attach(ar, aw, handlers_a, opts.clone()),
            IpcTransport::attach(br, bw, handlers_b, opts),
        )
    }

    /// A transport whose peer end is driven by hand, line by line.
    fn raw_pair() -> (IpcTransport, DuplexStream) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = split(a);
        let transport = IpcTransport::attach(
            ar,
            aw,
            HandlerTable::<TestMethod>::new(),
            TransportOptions {
                default_timeout: Duration::from_secs(5),
            },
        );
        (transport, b)
    }

    #[tokio::test]
    async fn call_resolves_with_the_handlers_payload() {
        let (host, _module) = pair(HandlerTable::new(), peer_handlers());
        let result = host
            .call(TestMethod::Echo.as_ref(), json!({"x": 42}))
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 42}));
        assert_eq!(host.pending_len(), 0);
    }

    #[tokio::test]
    async fn remote_failure_keeps_message_and_stack() {
        let (host, _module) = pair(HandlerTable::new(), peer_handlers());
        let err = host
            .call(TestMethod::Fail.as_ref(), Value::Null)
            .await
            .unwrap_err();
        match err {
            CallError::Remote {
                message, stack, ..
            } => {
                assert_eq!(message, "it broke");
                assert_eq!(stack.as_deref(), Some("fail at peer"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_rejects_after_the_timeout() {
        let (host, _module) = pair(HandlerTable::new(), peer_handlers());
        let err = host
            .call_with_timeout(
                TestMethod::Slow.as_ref(),
                Value::Null,
                Duration::from_millis(250),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout { .. }));
        // the pending slot is gone, so the eventual answer will be dropped
        assert_eq!(host.pending_len(), 0);
    }

    // companion task: read three calls, answer them out of order (c, a, b)
    async fn answer_out_of_order(peer: DuplexStream) {
        let (r, mut w) = split(peer);
        let mut lines = BufReader::new(r).lines();
        let mut calls = Vec::new();
        while calls.len() < 3 {
            let line = lines.next_line().await.unwrap().unwrap();
            if let Packet::Call(call) = serde_json::from_str(&line).unwrap() {
                calls.push(call);
            }
        }
        for index in [2usize, 0, 1] {
            let call = &calls[index];
            let response =
                ResponsePacket::ok(call.callback_id.unwrap(), call.payload.clone());
            let line = serde_json::to_string(&Packet::Response(response)).unwrap();
            w.write_all(line.as_bytes()).await.unwrap();
            w.write_all(b"\n").await.unwrap();
        }
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_own_callers() {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = split(a);
        let host = IpcTransport::attach(
            ar,
            aw,
            HandlerTable::<TestMethod>::new(),
            TransportOptions::default(),
        );
        tokio::spawn(answer_out_of_order(b));

        let (ra, rb, rc) = tokio::join!(
            host.call(TestMethod::Echo.as_ref(), json!("a")),
            host.call(TestMethod::Echo.as_ref(), json!("b")),
            host.call(TestMethod::Echo.as_ref(), json!("c")),
        );
        assert_eq!(ra.unwrap(), json!("a"));
        assert_eq!(rb.unwrap(), json!("b"));
        assert_eq!(rc.unwrap(), json!("c"));
    }

    #[tokio::test]
    async fn unknown_command_gets_a_synthesized_failure() {
        let (host, _module) = pair(HandlerTable::new(), peer_handlers());
        let err = host.call("noSuchThing", Value::Null).await.unwrap_err();
        match err {
            CallError::Remote { message, .. } => {
                assert!(message.contains("unknown command"), "got: {message}")
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_callback_id_is_logged_not_dispatched() {
        let (host, mut peer) = raw_pair();

        // park one real call so the pending table is non-empty
        let pending_call = tokio::spawn({
            let host = host.clone();
            async move { host.call(TestMethod::Echo.as_ref(), json!("keep")).await }
        });

        // wait for the call to hit the wire, then inject the bogus response
        let (r, mut w) = split(&mut peer);
        let mut lines = BufReader::new(r).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let call: Packet = serde_json::from_str(&line).unwrap();
        let id = match call {
            Packet::Call(c) => c.callback_id.unwrap(),
            _ => unreachable!(),
        };

        let bogus = serde_json::to_string(&Packet::Response(ResponsePacket::ok(0, json!("?"))))
            .unwrap();
        w.write_all(bogus.as_bytes()).await.unwrap();
        w.write_all(b"\n").await.unwrap();

        // the real call still resolves normally afterwards
        let good = serde_json::to_string(&Packet::Response(ResponsePacket::ok(id, json!("keep"))))
            .unwrap();
        w.write_all(good.as_bytes()).await.unwrap();
        w.write_all(b"\n").await.unwrap();

        assert_eq!(pending_call.await.unwrap().unwrap(), json!("keep"));
    }

    #[tokio::test]
    async fn fire_and_forget_creates_no_pending_call() {
        let (host, module) = pair(
            HandlerTable::new(),
            HandlerTable::new().on(TestMethod::Note, |_| async move { Ok(Value::Null) }),
        );
        host.call_no_reply(TestMethod::Note.as_ref(), json!({"n": 1}))
            .unwrap();
        assert_eq!(host.pending_len(), 0);
        drop(module);
    }

    #[tokio::test]
    async fn callback_ids_wrap_past_the_ceiling() {
        let (host, _module) = pair(HandlerTable::new(), peer_handlers());
        host.set_next_callback_id(CALLBACK_ID_CEILING - 1);

        for _ in 0..3 {
            let out = host.call(TestMethod::Echo.as_ref(), json!("w")).await;
            assert_eq!(out.unwrap(), json!("w"));
        }
        // counter moved through the ceiling and back into low ids
        assert!(host.next_id.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn peer_disappearing_rejects_in_flight_calls() {
        let (host, peer) = raw_pair();
        let call = tokio::spawn({
            let host = host.clone();
            async move { host.call(TestMethod::Echo.as_ref(), Value::Null).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(peer);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::Closed));
        host.closed().await;
        assert!(host.is_closed());
    }
}
