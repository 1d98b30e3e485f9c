//! Ordered fan-out of worker and domain events.
//!
//! All events flow through a single consumer task, so handlers run
//! serially and observe events for any given resource in emit order and
//! never on the I/O tasks.

use crate::registry::ResourceId;
use async_executor::Executor;
use log::*;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Catalog of control-plane events.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EventKind {
    WorkerLaunched,
    WorkerShutdown,
    RouterCreated,
    RouterClosed,
    TransportCreated,
    TransportUpdated,
    TransportClosed,
    TransportIceStateChange,
    TransportIceSelectedTupleChange,
    TransportDtlsStateChange,
    TransportSctpStateChange,
    TransportTuple,
    TransportRtcpTuple,
    ProducerCreated,
    ProducerClosed,
    ProducerPause,
    ProducerResume,
    ProducerVideoOrientationChange,
    ConsumerCreated,
    ConsumerClosed,
    ConsumerPause,
    ConsumerResume,
    ConsumerProducerPause,
    ConsumerProducerResume,
    ConsumerLayersChange,
    /// Producer or consumer score update.
    ResourceScore,
    ObserverCreated,
    ObserverPaused,
    ObserverResumed,
    ObserverClosed,
    AudioObserverVolumes,
    AudioObserverSilence,
    ActiveSpeaker,
    RoomCreated,
    RoomClosed,
    RoomMemberJoin,
    RoomMemberLeft,
    RoomMemberMute,
    RoomRecordingOn,
    RoomRecordingOff,
    /// Binary frame from a worker paired with its JSON descriptor.
    Payload,
}

/// A single delivered event.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub resource_id: ResourceId,
    pub data: Option<Value>,
}

/// Registration handle; pass back to [`EventBus::unregister`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct EventHandlerId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

struct Inner {
    handlers: Mutex<Vec<(EventHandlerId, Handler)>>,
    next_handler_id: AtomicU64,
    sender: async_channel::Sender<Event>,
}

/// Cheap-to-clone handle to the process-wide event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub(crate) fn new(executor: &Arc<Executor<'static>>) -> Self {
        let (sender, receiver) = async_channel::unbounded::<Event>();
        let inner = Arc::new(Inner {
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            sender,
        });

        {
            let inner_weak = Arc::downgrade(&inner);
            executor
                .spawn(async move {
                    while let Ok(event) = receiver.recv().await {
                        let inner = match inner_weak.upgrade() {
                            Some(inner) => inner,
                            None => break,
                        };
                        // Snapshot so handlers may deregister (even
                        // themselves) during dispatch.
                        let handlers: Vec<Handler> = inner
                            .handlers
                            .lock()
                            .iter()
                            .map(|(_, handler)| Arc::clone(handler))
                            .collect();
                        for handler in handlers {
                            handler(&event);
                        }
                    }
                })
                .detach();
        }

        Self { inner }
    }

    /// Registers a handler for every event; returns an id usable for
    /// deregistration.
    pub fn register<F>(&self, handler: F) -> EventHandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = EventHandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    pub fn unregister(&self, id: EventHandlerId) {
        self.inner
            .handlers
            .lock()
            .retain(|(handler_id, _)| *handler_id != id);
    }

    /// Queues an event for ordered delivery.
    pub fn emit(&self, kind: EventKind, resource_id: ResourceId, data: Option<Value>) {
        let event = Event {
            kind,
            resource_id,
            data,
        };
        if self.inner.sender.try_send(event).is_err() {
            warn!("event bus queue closed, dropping {:?}", kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future;
    use std::time::Duration;

    fn executor_with_thread() -> Arc<Executor<'static>> {
        let executor = Arc::new(Executor::new());
        {
            let executor = Arc::clone(&executor);
            std::thread::spawn(move || {
                future::block_on(executor.run(futures_lite::future::pending::<()>()));
            });
        }
        executor
    }

    #[test]
    fn events_are_delivered_in_order() {
        let executor = executor_with_thread();
        let bus = EventBus::new(&executor);

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            bus.register(move |event| {
                seen.lock().push(event.kind);
            });
        }

        let id = ResourceId::invalid();
        bus.emit(EventKind::ProducerCreated, id, None);
        bus.emit(EventKind::ProducerPause, id, None);
        bus.emit(EventKind::ProducerClosed, id, None);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            *seen.lock(),
            vec![
                EventKind::ProducerCreated,
                EventKind::ProducerPause,
                EventKind::ProducerClosed,
            ],
        );
    }

    #[test]
    fn deregistration_during_dispatch_is_safe() {
        let executor = executor_with_thread();
        let bus = EventBus::new(&executor);

        let counter = Arc::new(Mutex::new(0u32));
        let registration: Arc<Mutex<Option<EventHandlerId>>> = Arc::new(Mutex::new(None));
        let id = {
            let counter = Arc::clone(&counter);
            let registration = Arc::clone(&registration);
            let bus_clone = bus.clone();
            bus.register(move |_event| {
                *counter.lock() += 1;
                if let Some(id) = registration.lock().take() {
                    bus_clone.unregister(id);
                }
            })
        };
        registration.lock().replace(id);

        let resource = ResourceId::invalid();
        bus.emit(EventKind::RoomCreated, resource, None);
        bus.emit(EventKind::RoomClosed, resource, None);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(*counter.lock(), 1);
    }
}
