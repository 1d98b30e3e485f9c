//! Command/reply channel to a worker process.
//!
//! The wire carries length-prefixed JSON blobs: a little-endian `u32`
//! length followed by exactly that many bytes. Replies are correlated to
//! requests by a process-wide never-zero id; a 1 Hz sweeper completes
//! waiters whose command timeout expired.

use crate::messages::Request;
use async_executor::Executor;
use async_fs::File;
use async_io::Timer;
use futures_lite::io::{AsyncReadExt, AsyncWriteExt};
use log::*;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Frames over this size violate the protocol and kill the worker.
pub(crate) const PAYLOAD_MAX_LEN: usize = 1024 * 1024;

/// Command ids are unique within the whole process and never zero.
static NEXT_REQUEST_ID: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(1));

fn next_request_id() -> u32 {
    loop {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Error of a worker request.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum RequestError {
    /// The worker is gone; every in-flight command of a dying worker ends
    /// up here.
    #[error("worker channel closed")]
    ChannelClosed,
    /// No reply within the configured command timeout.
    #[error("request timed out")]
    TimedOut,
    /// Serialized command exceeds the frame size limit.
    #[error("request message is too long")]
    MessageTooLong,
    /// The worker answered with an error reply.
    #[error("worker error [kind:{kind}]: {reason}")]
    Response { kind: String, reason: String },
    /// The worker reply did not deserialize into the expected shape.
    #[error("failed to parse worker response: {error}")]
    FailedToParse { error: String },
}

/// Messages the channel surfaces besides replies and notifications:
/// worker log lines (tagged `D`/`W`/`E`/`X`) and unparseable garbage.
#[derive(Debug)]
pub(crate) enum InternalMessage {
    Debug(String),
    Warn(String),
    Error(String),
    Dump(String),
    Unexpected(Vec<u8>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChannelReceiveMessage {
    ResponseError {
        id: u32,
        error: String,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    ResponseSuccess {
        id: u32,
        accepted: bool,
        #[serde(default)]
        data: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Notification {
        event: String,
        target_id: String,
        #[serde(default)]
        data: Option<Value>,
    },
}

#[derive(Serialize)]
struct RequestMessage<'a, R: Serialize> {
    id: u32,
    method: &'static str,
    #[serde(flatten)]
    request: &'a R,
}

struct PendingRequest {
    sender: async_oneshot::Sender<Result<Option<Value>, RequestError>>,
    expires_at: Instant,
}

type NotificationCallback = Arc<dyn Fn(Value) + Send + Sync + 'static>;

struct Subscriptions {
    by_target: HashMap<String, Vec<(usize, NotificationCallback)>>,
}

/// Removes its notification subscription when dropped.
pub(crate) struct SubscriptionHandler {
    subscriptions: Weak<Mutex<Subscriptions>>,
    target_id: String,
    id: usize,
}

impl Drop for SubscriptionHandler {
    fn drop(&mut self) {
        if let Some(subscriptions) = self.subscriptions.upgrade() {
            let mut subscriptions = subscriptions.lock();
            if let Some(callbacks) = subscriptions.by_target.get_mut(&self.target_id) {
                callbacks.retain(|(id, _)| *id != self.id);
                if callbacks.is_empty() {
                    subscriptions.by_target.remove(&self.target_id);
                }
            }
        }
    }
}

struct Inner {
    sender: async_channel::Sender<Vec<u8>>,
    internal_message_receiver: async_channel::Receiver<InternalMessage>,
    requests: Mutex<HashMap<u32, PendingRequest>>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    next_subscription_id: AtomicUsize,
    request_timeout: Duration,
    closed: AtomicBool,
    violation_handler: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.sender.close();
            let requests: Vec<_> = {
                let mut requests = self.requests.lock();
                requests.drain().collect()
            };
            for (_id, pending) in requests {
                let mut sender = pending.sender;
                let _ = sender.send(Err(RequestError::ChannelClosed));
            }
        }
    }

    fn report_violation(&self) {
        if let Some(callback) = self.violation_handler.lock().take() {
            callback();
        }
        self.close();
    }
}

/// The command/reply channel of a single worker; cheap to clone.
#[derive(Clone)]
pub(crate) struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub(super) fn new(
        executor: Arc<Executor<'static>>,
        mut reader: File,
        mut writer: File,
        request_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = async_channel::unbounded::<Vec<u8>>();
        let (internal_message_sender, internal_message_receiver) = async_channel::unbounded();

        let inner = Arc::new(Inner {
            sender,
            internal_message_receiver,
            requests: Mutex::new(HashMap::new()),
            subscriptions: Arc::new(Mutex::new(Subscriptions {
                by_target: HashMap::new(),
            })),
            next_subscription_id: AtomicUsize::new(0),
            request_timeout,
            closed: AtomicBool::new(false),
            violation_handler: Mutex::new(None),
        });

        // Writer task: outbound frames, length prefix first.
        executor
            .spawn(async move {
                while let Ok(message) = receiver.recv().await {
                    let len = (message.len() as u32).to_le_bytes();
                    if writer.write_all(&len).await.is_err()
                        || writer.write_all(&message).await.is_err()
                    {
                        break;
                    }
                    let _ = writer.flush().await;
                }
            })
            .detach();

        // Reader task: replies, notifications and worker log lines.
        {
            let inner_weak = Arc::downgrade(&inner);
            executor
                .spawn(async move {
                    let mut len_bytes = [0u8; 4];
                    let mut buffer = Vec::new();
                    loop {
                        if reader.read_exact(&mut len_bytes).await.is_err() {
                            break;
                        }
                        let length = u32::from_le_bytes(len_bytes) as usize;
                        let inner = match inner_weak.upgrade() {
                            Some(inner) => inner,
                            None => break,
                        };
                        if length > PAYLOAD_MAX_LEN {
                            error!("channel frame length {} exceeds the limit", length);
                            inner.report_violation();
                            break;
                        }
                        buffer.resize(length, 0);
                        if reader.read_exact(&mut buffer).await.is_err() {
                            break;
                        }

                        match buffer.first() {
                            Some(b'{') => {
                                if !process_json_message(&inner, &buffer) {
                                    inner.report_violation();
                                    break;
                                }
                            }
                            Some(b'D') => {
                                let _ = internal_message_sender
                                    .try_send(InternalMessage::Debug(tail_string(&buffer)));
                            }
                            Some(b'W') => {
                                let _ = internal_message_sender
                                    .try_send(InternalMessage::Warn(tail_string(&buffer)));
                            }
                            Some(b'E') => {
                                let _ = internal_message_sender
                                    .try_send(InternalMessage::Error(tail_string(&buffer)));
                            }
                            Some(b'X') => {
                                let _ = internal_message_sender
                                    .try_send(InternalMessage::Dump(tail_string(&buffer)));
                            }
                            _ => {
                                let _ = internal_message_sender
                                    .try_send(InternalMessage::Unexpected(buffer.clone()));
                                inner.report_violation();
                                break;
                            }
                        }
                    }

                    if let Some(inner) = inner_weak.upgrade() {
                        inner.close();
                    }
                })
                .detach();
        }

        // Sweeper: once a second expire requests older than the command
        // timeout.
        {
            let inner_weak = Arc::downgrade(&inner);
            executor
                .spawn(async move {
                    loop {
                        Timer::after(Duration::from_secs(1)).await;
                        let inner = match inner_weak.upgrade() {
                            Some(inner) => inner,
                            None => break,
                        };
                        if inner.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        let now = Instant::now();
                        let expired: Vec<(u32, PendingRequest)> = {
                            let mut requests = inner.requests.lock();
                            let expired_ids: Vec<u32> = requests
                                .iter()
                                .filter(|(_, pending)| pending.expires_at <= now)
                                .map(|(id, _)| *id)
                                .collect();
                            expired_ids
                                .into_iter()
                                .filter_map(|id| requests.remove(&id).map(|pending| (id, pending)))
                                .collect()
                        };
                        for (id, pending) in expired {
                            warn!("request {} timed out", id);
                            let mut sender = pending.sender;
                            let _ = sender.send(Err(RequestError::TimedOut));
                        }
                    }
                })
                .detach();
        }

        Self { inner }
    }

    pub(crate) fn get_internal_message_receiver(&self) -> async_channel::Receiver<InternalMessage> {
        self.inner.internal_message_receiver.clone()
    }

    /// Registers the callback run on the first protocol violation; the
    /// worker object uses this to kill the misbehaving child.
    pub(crate) fn on_protocol_violation<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.inner.violation_handler.lock().replace(Box::new(callback));
    }

    /// Sends a command and waits for the correlated reply.
    pub(crate) async fn request<R>(&self, request: R) -> Result<R::Response, RequestError>
    where
        R: Request,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RequestError::ChannelClosed);
        }

        let id = next_request_id();
        let method = request.as_method();

        debug!("request() [method:{}, id:{}]", method, id);

        let message = serde_json::to_vec(&RequestMessage {
            id,
            method,
            request: &request,
        })
        .expect("requests serialize to JSON");
        if message.len() > PAYLOAD_MAX_LEN {
            return Err(RequestError::MessageTooLong);
        }

        let (result_sender, result_receiver) = async_oneshot::oneshot();
        self.inner.requests.lock().insert(
            id,
            PendingRequest {
                sender: result_sender,
                expires_at: Instant::now() + self.inner.request_timeout,
            },
        );

        if self.inner.sender.send(message).await.is_err() {
            self.inner.requests.lock().remove(&id);
            return Err(RequestError::ChannelClosed);
        }

        let data = result_receiver
            .await
            .map_err(|_| RequestError::ChannelClosed)??;

        serde_json::from_value(data.unwrap_or(Value::Null)).map_err(|error| {
            RequestError::FailedToParse {
                error: error.to_string(),
            }
        })
    }

    /// Subscribes to notifications targeted at `target_id`; the
    /// subscription lives as long as the returned handler.
    pub(crate) fn subscribe_to_notifications<F>(
        &self,
        target_id: String,
        callback: F,
    ) -> SubscriptionHandler
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .lock()
            .by_target
            .entry(target_id.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        SubscriptionHandler {
            subscriptions: Arc::downgrade(&self.inner.subscriptions),
            target_id,
            id,
        }
    }

    /// Completes every in-flight request with `ChannelClosed` and rejects
    /// new ones; called when the worker exits.
    pub(crate) fn close(&self) {
        self.inner.close();
    }

    #[cfg(test)]
    pub(crate) fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

fn tail_string(buffer: &[u8]) -> String {
    String::from_utf8_lossy(&buffer[1..]).into_owned()
}

/// Returns false when the message violates the protocol.
fn process_json_message(inner: &Arc<Inner>, buffer: &[u8]) -> bool {
    let message: ChannelReceiveMessage = match serde_json::from_slice(buffer) {
        Ok(message) => message,
        Err(error) => {
            error!(
                "unparseable channel message: {} [{}]",
                error,
                String::from_utf8_lossy(buffer),
            );
            return false;
        }
    };

    match message {
        ChannelReceiveMessage::ResponseSuccess { id, accepted, data } => {
            if !accepted {
                error!("response for request {} not accepted", id);
                return false;
            }
            if let Some(pending) = inner.requests.lock().remove(&id) {
                let mut sender = pending.sender;
                let _ = sender.send(Ok(data));
            } else {
                // Reply for a request already swept out; ignored.
                debug!("response for unknown request {}", id);
            }
        }
        ChannelReceiveMessage::ResponseError { id, error, reason } => {
            if let Some(pending) = inner.requests.lock().remove(&id) {
                let mut sender = pending.sender;
                let _ = sender.send(Err(RequestError::Response {
                    kind: error,
                    reason,
                }));
            } else {
                debug!("error response for unknown request {}", id);
            }
        }
        ChannelReceiveMessage::Notification {
            event,
            target_id,
            data,
        } => {
            let callbacks: Vec<NotificationCallback> = {
                let subscriptions = inner.subscriptions.lock();
                subscriptions
                    .by_target
                    .get(&target_id)
                    .map(|callbacks| {
                        callbacks
                            .iter()
                            .map(|(_, callback)| Arc::clone(callback))
                            .collect()
                    })
                    .unwrap_or_default()
            };
            let notification = serde_json::json!({
                "event": event,
                "targetId": target_id,
                "data": data,
            });
            for callback in callbacks {
                callback(notification.clone());
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_never_zero() {
        for _ in 0..1000 {
            assert_ne!(next_request_id(), 0);
        }
    }
}
