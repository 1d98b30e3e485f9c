//! Payload channel to a worker process.
//!
//! Carries binary payloads next to the JSON command channel. Every payload
//! message is two consecutive length-prefixed frames: a JSON descriptor
//! first, then the opaque payload bytes. Any other interleaving is a
//! protocol violation and kills the worker.

use crate::messages::PayloadNotification;
use crate::worker::channel::PAYLOAD_MAX_LEN;
use async_executor::Executor;
use async_fs::File;
use bytes::Bytes;
use futures_lite::io::{AsyncReadExt, AsyncWriteExt};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Error of a payload-channel notification.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum NotificationError {
    #[error("worker payload channel closed")]
    ChannelClosed,
    #[error("notification message is too long")]
    MessageTooLong,
    #[error("payload is too long")]
    PayloadTooLong,
    #[error("operation requires a direct transport")]
    RequiredDirectTransport,
}

/// A worker payload notification: parsed descriptor plus the binary half.
#[derive(Debug, Clone)]
pub(crate) struct NotificationMessage {
    pub(crate) message: Value,
    pub(crate) payload: Bytes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationDescriptor {
    event: String,
    target_id: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Serialize)]
struct NotificationMessageOut<'a, N: Serialize> {
    event: &'static str,
    #[serde(flatten)]
    notification: &'a N,
}

type PayloadCallback = Arc<dyn Fn(NotificationMessage) + Send + Sync + 'static>;

struct Subscriptions {
    by_target: HashMap<String, Vec<(usize, PayloadCallback)>>,
    catch_all: Vec<(usize, PayloadCallback)>,
}

/// Removes its payload subscription when dropped.
pub(crate) struct PayloadSubscriptionHandler {
    subscriptions: Weak<Mutex<Subscriptions>>,
    target_id: Option<String>,
    id: usize,
}

impl Drop for PayloadSubscriptionHandler {
    fn drop(&mut self) {
        if let Some(subscriptions) = self.subscriptions.upgrade() {
            let mut subscriptions = subscriptions.lock();
            match &self.target_id {
                Some(target_id) => {
                    if let Some(callbacks) = subscriptions.by_target.get_mut(target_id) {
                        callbacks.retain(|(id, _)| *id != self.id);
                        if callbacks.is_empty() {
                            subscriptions.by_target.remove(target_id);
                        }
                    }
                }
                None => {
                    subscriptions.catch_all.retain(|(id, _)| *id != self.id);
                }
            }
        }
    }
}

struct Inner {
    sender: async_channel::Sender<Vec<Vec<u8>>>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    next_subscription_id: AtomicUsize,
    closed: AtomicBool,
    violation_handler: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.sender.close();
        }
    }

    fn report_violation(&self) {
        if let Some(callback) = self.violation_handler.lock().take() {
            callback();
        }
        self.close();
    }
}

/// The payload channel of a single worker; cheap to clone.
#[derive(Clone)]
pub(crate) struct PayloadChannel {
    inner: Arc<Inner>,
}

impl PayloadChannel {
    pub(super) fn new(executor: Arc<Executor<'static>>, mut reader: File, mut writer: File) -> Self {
        let (sender, receiver) = async_channel::unbounded::<Vec<Vec<u8>>>();

        let inner = Arc::new(Inner {
            sender,
            subscriptions: Arc::new(Mutex::new(Subscriptions {
                by_target: HashMap::new(),
                catch_all: Vec::new(),
            })),
            next_subscription_id: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            violation_handler: Mutex::new(None),
        });

        // Writer task: descriptor and payload frames are queued together so
        // pairs are never interleaved.
        executor
            .spawn(async move {
                'outer: while let Ok(frames) = receiver.recv().await {
                    for frame in frames {
                        let len = (frame.len() as u32).to_le_bytes();
                        if writer.write_all(&len).await.is_err()
                            || writer.write_all(&frame).await.is_err()
                        {
                            break 'outer;
                        }
                    }
                    let _ = writer.flush().await;
                }
            })
            .detach();

        // Reader task: descriptor-first, binary-second state machine.
        {
            let inner_weak = Arc::downgrade(&inner);
            executor
                .spawn(async move {
                    let mut len_bytes = [0u8; 4];
                    let mut buffer = Vec::new();
                    let mut pending_descriptor: Option<NotificationDescriptor> = None;
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
                            error!("payload channel frame length {} exceeds the limit", length);
                            inner.report_violation();
                            break;
                        }
                        buffer.resize(length, 0);
                        if reader.read_exact(&mut buffer).await.is_err() {
                            break;
                        }

                        match pending_descriptor.take() {
                            None => {
                                // Expecting a JSON descriptor.
                                match serde_json::from_slice::<NotificationDescriptor>(&buffer) {
                                    Ok(descriptor) => {
                                        pending_descriptor = Some(descriptor);
                                    }
                                    Err(error) => {
                                        error!(
                                            "expected payload descriptor, got garbage: {}",
                                            error,
                                        );
                                        inner.report_violation();
                                        break;
                                    }
                                }
                            }
                            Some(descriptor) => {
                                let payload = Bytes::copy_from_slice(&buffer);
                                dispatch(&inner, descriptor, payload);
                            }
                        }
                    }

                    if let Some(inner) = inner_weak.upgrade() {
                        inner.close();
                    }
                })
                .detach();
        }

        Self { inner }
    }

    pub(crate) fn on_protocol_violation<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.inner.violation_handler.lock().replace(Box::new(callback));
    }

    /// Sends a payload notification: descriptor frame then payload frame.
    pub(crate) async fn notify<N>(
        &self,
        notification: N,
        payload: Bytes,
    ) -> Result<(), NotificationError>
    where
        N: PayloadNotification,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NotificationError::ChannelClosed);
        }

        let message = serde_json::to_vec(&NotificationMessageOut {
            event: notification.as_event(),
            notification: &notification,
        })
        .expect("notifications serialize to JSON");
        if message.len() > PAYLOAD_MAX_LEN {
            return Err(NotificationError::MessageTooLong);
        }
        if payload.len() > PAYLOAD_MAX_LEN {
            return Err(NotificationError::PayloadTooLong);
        }

        self.inner
            .sender
            .send(vec![message, payload.to_vec()])
            .await
            .map_err(|_| NotificationError::ChannelClosed)
    }

    /// Subscribes to payload notifications targeted at `target_id`.
    pub(crate) fn subscribe_to_notifications<F>(
        &self,
        target_id: String,
        callback: F,
    ) -> PayloadSubscriptionHandler
    where
        F: Fn(NotificationMessage) + Send + Sync + 'static,
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

        PayloadSubscriptionHandler {
            subscriptions: Arc::downgrade(&self.inner.subscriptions),
            target_id: Some(target_id),
            id,
        }
    }

    /// Subscribes to every payload notification of this worker regardless
    /// of target.
    pub(crate) fn subscribe_to_all<F>(&self, callback: F) -> PayloadSubscriptionHandler
    where
        F: Fn(NotificationMessage) + Send + Sync + 'static,
    {
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .lock()
            .catch_all
            .push((id, Arc::new(callback)));

        PayloadSubscriptionHandler {
            subscriptions: Arc::downgrade(&self.inner.subscriptions),
            target_id: None,
            id,
        }
    }

    pub(crate) fn close(&self) {
        self.inner.close();
    }
}

fn dispatch(inner: &Arc<Inner>, descriptor: NotificationDescriptor, payload: Bytes) {
    let message = serde_json::json!({
        "event": descriptor.event,
        "targetId": descriptor.target_id,
        "data": descriptor.data,
    });
    let notification = NotificationMessage { message, payload };

    let callbacks: Vec<PayloadCallback> = {
        let subscriptions = inner.subscriptions.lock();
        subscriptions
            .by_target
            .get(&descriptor.target_id)
            .map(|callbacks| callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    };
    for callback in callbacks {
        callback(notification.clone());
    }

    let catch_all: Vec<PayloadCallback> = {
        let subscriptions = inner.subscriptions.lock();
        subscriptions
            .catch_all
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect()
    };
    for callback in catch_all {
        callback(notification.clone());
    }
}
