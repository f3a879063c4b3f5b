//! msgpack-RPC session with the host.
//!
//! The session owns request-id allocation and the pending-response table.
//! Its read loop runs on the I/O runtime: responses are routed back to
//! whoever is waiting, requests and notifications from the host are pushed
//! onto the [`EventSource`] consumed by the run loop's listener thread.
//!
//! The listener thread [`EventSource::pump`]s events. A blocking request
//! made from that thread keeps dispatching host events until its reply
//! arrives, so the host may call back into us while evaluating it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, OnceLock};

use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{Message, MessageBuffer, RpcMessage};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Read buffer size for the host connection.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Inbound call from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// The host waits for a reply to `msgid`.
    Request {
        /// Correlation id to answer with.
        msgid: u64,
        /// Procedure name and arguments.
        message: Message,
    },
    /// Fire-and-forget call.
    Notification(Message),
}

impl HostEvent {
    /// The message carried by this event.
    pub fn message(&self) -> &Message {
        match self {
            HostEvent::Request { message, .. } => message,
            HostEvent::Notification(message) => message,
        }
    }
}

/// What the read loop hands to the event source.
enum Inbound {
    Event(HostEvent),
    /// Reply to a request made from the pumping thread.
    Reply { msgid: u64, result: Result<Value> },
}

/// Blocking stream of [`HostEvent`]s; ends when the host disconnects.
pub struct EventSource {
    rx: mpsc::UnboundedReceiver<Inbound>,
    session: Arc<SessionInner>,
}

impl EventSource {
    /// Block until the next event. `None` once the host is gone.
    ///
    /// Must be called from a plain thread, not from async code.
    pub fn next_blocking(&mut self) -> Option<HostEvent> {
        loop {
            match self.rx.blocking_recv()? {
                Inbound::Event(event) => return Some(event),
                Inbound::Reply { msgid, .. } => stray_reply(msgid),
            }
        }
    }

    /// Await the next event.
    pub async fn next(&mut self) -> Option<HostEvent> {
        loop {
            match self.rx.recv().await? {
                Inbound::Event(event) => return Some(event),
                Inbound::Reply { msgid, .. } => stray_reply(msgid),
            }
        }
    }

    /// Feed every event to `dispatch` on the current thread until the host
    /// disconnects.
    ///
    /// [`Session::request_blocking`] called from inside `dispatch` keeps
    /// dispatching host events (nested requests included) until its own
    /// reply arrives. Must be called from a plain thread.
    pub fn pump<F>(self, dispatch: F)
    where
        F: Fn(HostEvent) + 'static,
    {
        let EventSource { rx, session } = self;
        PUMP.with(|cell| {
            *cell.borrow_mut() = Some(Pump {
                session,
                rx,
                stash: HashMap::new(),
                dispatch: Rc::new(dispatch),
            })
        });

        loop {
            match Pump::step(None) {
                Step::Event(dispatch, event) => dispatch(event),
                Step::Reply(_) => {}
                Step::Closed => break,
            }
        }

        PUMP.with(|cell| cell.borrow_mut().take());
    }
}

fn stray_reply(msgid: u64) {
    tracing::debug!(msgid, "reply arrived outside the event pump");
}

thread_local! {
    static PUMP: RefCell<Option<Pump>> = const { RefCell::new(None) };
}

/// Event source installed on the thread running [`EventSource::pump`].
struct Pump {
    session: Arc<SessionInner>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    /// Replies that arrived while a deeper request was waiting.
    stash: HashMap<u64, Result<Value>>,
    dispatch: Rc<dyn Fn(HostEvent)>,
}

enum Step {
    Event(Rc<dyn Fn(HostEvent)>, HostEvent),
    Reply(Result<Value>),
    Closed,
}

impl Pump {
    /// Whether this thread pumps events for `session`.
    fn is_pumping(session: &Arc<SessionInner>) -> bool {
        PUMP.with(|cell| {
            cell.try_borrow()
                .map(|pump| {
                    pump.as_ref()
                        .is_some_and(|pump| Arc::ptr_eq(&pump.session, session))
                })
                .unwrap_or(false)
        })
    }

    /// Take the next thing to act on: the reply to `want` or an event.
    ///
    /// The pump is only borrowed while receiving, so dispatching the
    /// returned event may step again.
    fn step(want: Option<u64>) -> Step {
        PUMP.with(|cell| {
            let mut slot = cell.borrow_mut();
            let Some(pump) = slot.as_mut() else {
                return Step::Closed;
            };
            if let Some(result) = want.and_then(|msgid| pump.stash.remove(&msgid)) {
                return Step::Reply(result);
            }
            loop {
                match pump.rx.blocking_recv() {
                    None => return Step::Closed,
                    Some(Inbound::Event(event)) => {
                        return Step::Event(pump.dispatch.clone(), event)
                    }
                    Some(Inbound::Reply { msgid, result }) if want == Some(msgid) => {
                        return Step::Reply(result)
                    }
                    Some(Inbound::Reply { msgid, result }) => {
                        pump.stash.insert(msgid, result);
                    }
                }
            }
        })
    }

    /// Dispatch events until the reply to `msgid` arrives.
    fn wait_reply(msgid: u64) -> Result<Value> {
        loop {
            match Pump::step(Some(msgid)) {
                Step::Reply(result) => return result,
                Step::Event(dispatch, event) => dispatch(event),
                Step::Closed => return Err(BridgeError::ConnectionClosed),
            }
        }
    }
}

/// Where a response goes once it arrives.
enum ResponseSlot {
    Async(oneshot::Sender<Result<Value>>),
    Blocking(std_mpsc::SyncSender<Result<Value>>),
    /// Routed through the event source to the pumping thread.
    Pumped,
}

impl ResponseSlot {
    fn fill(self, msgid: u64, result: Result<Value>, events: &mpsc::UnboundedSender<Inbound>) {
        match self {
            ResponseSlot::Async(tx) => {
                let _ = tx.send(result);
            }
            ResponseSlot::Blocking(tx) => {
                let _ = tx.send(result);
            }
            ResponseSlot::Pumped => {
                let _ = events.send(Inbound::Reply { msgid, result });
            }
        }
    }
}

/// State of the host connection.
#[derive(Debug, Clone, PartialEq)]
enum Link {
    Open,
    /// The host closed the stream.
    Eof,
    /// The read loop stopped on an error.
    Failed(String),
}

struct SessionInner {
    writer: WriterHandle,
    pending: parking_lot::Mutex<HashMap<u64, ResponseSlot>>,
    next_id: AtomicU64,
    channel: OnceLock<i64>,
    link: watch::Sender<Link>,
}

impl SessionInner {
    fn close(&self, link: Link, events: &mpsc::UnboundedSender<Inbound>) {
        let slots: Vec<_> = {
            let mut pending = self.pending.lock();
            self.link.send_replace(link);
            pending.drain().collect()
        };
        for (msgid, slot) in slots {
            slot.fill(msgid, Err(BridgeError::ConnectionClosed), events);
        }
    }
}

/// Cloneable handle to the host connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start the read loop and writer task for a connected stream.
    ///
    /// Both tasks are spawned on `runtime`, which must outlive the session.
    pub fn spawn<R, W>(reader: R, writer: W, runtime: &Handle) -> (Session, EventSource)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, _writer_task) = spawn_writer_task(writer, runtime);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link, _) = watch::channel(Link::Open);

        let session = Session {
            inner: Arc::new(SessionInner {
                writer,
                pending: parking_lot::Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                channel: OnceLock::new(),
                link,
            }),
        };

        let inner = session.inner.clone();
        runtime.spawn(async move {
            let link = match read_loop(reader, &inner, &events_tx).await {
                Ok(()) => Link::Eof,
                Err(e) => {
                    tracing::error!(error = %e, "host read loop failed");
                    Link::Failed(e.to_string())
                }
            };
            inner.close(link, &events_tx);
            tracing::debug!("host connection closed");
        });

        let events = EventSource {
            rx: events_rx,
            session: session.inner.clone(),
        };
        (session, events)
    }

    fn register_slot(&self, slot: ResponseSlot) -> Result<u64> {
        let mut pending = self.inner.pending.lock();
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }
        let msgid = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        pending.insert(msgid, slot);
        Ok(msgid)
    }

    fn send_request(&self, msgid: u64, method: &str, params: Vec<Value>) -> Result<()> {
        let message = RpcMessage::Request {
            msgid,
            method: method.to_string(),
            params,
        };
        self.inner.writer.send(message).map_err(|e| {
            self.inner.pending.lock().remove(&msgid);
            e
        })
    }

    /// Call a host method and await the result.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let msgid = self.register_slot(ResponseSlot::Async(tx))?;
        self.send_request(msgid, method, params)?;
        rx.await.unwrap_or(Err(BridgeError::ConnectionClosed))
    }

    /// Call a host method and block the current thread for the result.
    ///
    /// Safe from plain threads and from bodies running on the host
    /// execution thread: the response is delivered by the I/O runtime. On
    /// the thread pumping this session's events, host events are
    /// dispatched while waiting.
    pub fn request_blocking(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        if Pump::is_pumping(&self.inner) {
            let msgid = self.register_slot(ResponseSlot::Pumped)?;
            self.send_request(msgid, method, params)?;
            return Pump::wait_reply(msgid);
        }

        let (tx, rx) = std_mpsc::sync_channel(1);
        let msgid = self.register_slot(ResponseSlot::Blocking(tx))?;
        self.send_request(msgid, method, params)?;
        rx.recv().unwrap_or(Err(BridgeError::ConnectionClosed))
    }

    /// Send a notification to the host.
    pub fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        self.inner.writer.send(RpcMessage::Notification {
            method: method.to_string(),
            params,
        })
    }

    /// Answer a request the host sent us.
    pub fn respond(&self, msgid: u64, result: std::result::Result<Value, String>) -> Result<()> {
        let (error, result) = match result {
            Ok(value) => (Value::Nil, value),
            Err(message) => (Value::from(message), Value::Nil),
        };
        self.inner.writer.send(RpcMessage::Response {
            msgid,
            error,
            result,
        })
    }

    /// Announce this client and learn our channel id.
    pub async fn handshake(&self, config: &BridgeConfig) -> Result<i64> {
        let (major, minor, patch) = config.version;
        self.notify(
            "nvim_set_client_info",
            vec![
                Value::from(config.client_name.as_str()),
                Value::Map(vec![
                    (Value::from("major"), Value::from(major)),
                    (Value::from("minor"), Value::from(minor)),
                    (Value::from("patch"), Value::from(patch)),
                ]),
                Value::from("remote"),
                Value::Map(vec![]),
                Value::Map(vec![]),
            ],
        )?;

        let info = self.request("nvim_get_api_info", vec![]).await?;
        let chan = info
            .as_array()
            .and_then(|items| items.first())
            .and_then(Value::as_i64)
            .ok_or_else(|| BridgeError::Protocol(format!("unexpected api info: {}", info)))?;

        let _ = self.inner.channel.set(chan);
        tracing::debug!(chan, "handshake complete");
        Ok(chan)
    }

    /// Channel id assigned by the host, known after [`Session::handshake`].
    pub fn channel(&self) -> Option<i64> {
        self.inner.channel.get().copied()
    }

    /// Whether the host connection has ended.
    pub fn is_closed(&self) -> bool {
        *self.inner.link.borrow() != Link::Open
    }

    /// Resolve once the host connection has ended.
    ///
    /// `Ok` if the host closed the stream, [`BridgeError::Shutdown`] if the
    /// read loop failed (malformed message, oversized message, I/O error).
    pub async fn closed(&self) -> Result<()> {
        let mut rx = self.inner.link.subscribe();
        let link = match rx.wait_for(|link| *link != Link::Open).await {
            Ok(link) => (*link).clone(),
            Err(_) => Link::Eof,
        };
        match link {
            Link::Failed(reason) => Err(BridgeError::Shutdown(format!(
                "host connection failed: {}",
                reason
            ))),
            _ => Ok(()),
        }
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

/// Main read loop - decodes messages and routes them.
async fn read_loop<R>(
    mut reader: R,
    inner: &SessionInner,
    events: &mpsc::UnboundedSender<Inbound>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = MessageBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await? {
            0 => return Ok(()),
            n => n,
        };

        for message in buffer.push(&buf[..n])? {
            route(message, inner, events);
        }
    }
}

fn route(message: RpcMessage, inner: &SessionInner, events: &mpsc::UnboundedSender<Inbound>) {
    let event = match message {
        RpcMessage::Response {
            msgid,
            error,
            result,
        } => {
            let slot = inner.pending.lock().remove(&msgid);
            match slot {
                Some(slot) if error.is_nil() => slot.fill(msgid, Ok(result), events),
                Some(slot) => slot.fill(
                    msgid,
                    Err(BridgeError::Host(host_error_text(&error))),
                    events,
                ),
                None => {
                    tracing::warn!(msgid, %error, %result, "unexpected response message");
                }
            }
            return;
        }
        RpcMessage::Request {
            msgid,
            method,
            params,
        } => HostEvent::Request {
            msgid,
            message: Message::from_params(method, params),
        },
        RpcMessage::Notification { method, params } => {
            HostEvent::Notification(Message::from_params(method, params))
        }
    };

    if events.send(Inbound::Event(event)).is_err() {
        tracing::debug!("event source dropped, discarding host event");
    }
}

/// Host errors arrive as `[type, message]`; keep only the message.
fn host_error_text(error: &Value) -> String {
    match error {
        Value::Array(items) if items.len() == 2 => match items[1].as_str() {
            Some(text) => text.to_string(),
            None => items[1].to_string(),
        },
        Value::String(s) => s.as_str().map(str::to_string).unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}
