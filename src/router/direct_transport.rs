//! Direct transport: no network endpoint. Lets the host application
//! inject and receive data messages through the worker's payload channel.

use crate::consumer::{Consumer, ConsumerOptions};
use crate::data_consumer::{DataConsumer, DataConsumerOptions, DataConsumerType};
use crate::data_producer::{DataProducer, DataProducerOptions, DataProducerType};
use crate::data_structures::{AppData, TransportInternal};
use crate::events::EventKind;
use crate::messages::TransportCloseRequest;
use crate::producer::{Producer, ProducerOptions};
use crate::registry::{ResourceId, WeakResource};
use crate::router::transport::{
    ConsumeDataError, ConsumeError, ProduceDataError, ProduceError, Transport, TransportGeneric,
    TransportChildId, TransportId, TransportImpl, TransportState, TransportTraceEventData,
    TransportTraceEventType,
};
use crate::router::{Router, RouterId};
use crate::worker::{Channel, PayloadChannel, RequestError, SubscriptionHandler};
use async_executor::Executor;
use async_trait::async_trait;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Direct transport creation options.
#[derive(Debug)]
#[non_exhaustive]
pub struct DirectTransportOptions {
    /// Maximum allowed size for messages sent over this transport.
    /// Default 262144.
    pub max_message_size: u32,
    /// Custom application data.
    pub app_data: AppData,
}

impl Default for DirectTransportOptions {
    fn default() -> Self {
        Self {
            max_message_size: 262_144,
            app_data: AppData::default(),
        }
    }
}

/// State of a direct transport as reported by the worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct DirectTransportData {
    #[serde(default)]
    pub direct: bool,
    #[serde(default)]
    pub max_message_size: u32,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct DirectTransportDump {
    pub id: TransportId,
    pub direct: bool,
    pub max_message_size: u32,
    pub trace_event_types: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectTransportStat {
    // `type` field is present in worker, but ignored here
    pub transport_id: TransportId,
    pub timestamp: u64,
    pub bytes_received: usize,
    pub recv_bitrate: u32,
    pub bytes_sent: usize,
    pub send_bitrate: u32,
    pub rtp_bytes_received: usize,
    pub rtp_recv_bitrate: u32,
    pub rtp_bytes_sent: usize,
    pub rtp_send_bitrate: u32,
}

#[derive(Default)]
struct Handlers {
    trace: Bag<Box<dyn Fn(&TransportTraceEventData) + Send + Sync>>,
    closed: BagOnce<Box<dyn FnOnce() + Send>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", content = "data")]
enum Notification {
    Trace(TransportTraceEventData),
}

struct Inner {
    id: TransportId,
    local_id: ResourceId,
    state: TransportState,
    data: DirectTransportData,
    app_data: AppData,
    router: Router,
    handlers: Arc<Handlers>,
    closed: AtomicBool,
    _subscription_handler: Mutex<Option<SubscriptionHandler>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close(true, true);
    }
}

impl Inner {
    fn close(&self, send_request: bool, unregister_from_router: bool) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close() [id:{}]", self.id);

            self.router.registry().unregister(self.local_id);
            self.state.close_children();
            self.handlers.closed.call_simple();
            self.router
                .event_bus()
                .emit(EventKind::TransportClosed, self.local_id, None);

            if unregister_from_router {
                self.router.unregister_transport(self.id);
            }

            if send_request {
                let channel = self.router.worker().channel().clone();
                let request = TransportCloseRequest {
                    internal: TransportInternal {
                        router_id: self.router.id(),
                        transport_id: self.id,
                    },
                };
                self.router
                    .executor()
                    .spawn(async move {
                        if let Err(error) = channel.request(request).await {
                            error!("transport closing failed: {}", error);
                        }
                    })
                    .detach();
            }
        }
    }
}

/// A direct transport.
#[derive(Clone)]
pub struct DirectTransport {
    inner: Arc<Inner>,
}

/// Weak handle to a direct transport.
#[derive(Clone)]
pub struct WeakDirectTransport {
    inner: Weak<Inner>,
}

impl WeakDirectTransport {
    pub fn upgrade(&self) -> Option<DirectTransport> {
        self.inner.upgrade().map(|inner| DirectTransport { inner })
    }
}

impl DirectTransport {
    pub(crate) fn new(
        id: TransportId,
        data: DirectTransportData,
        app_data: AppData,
        router: Router,
    ) -> Self {
        debug!("new()");

        let handlers = Arc::<Handlers>::default();
        let registry = router.registry().clone();
        let inner = Arc::new_cyclic(|inner_weak: &Weak<Inner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::DirectTransport(WeakDirectTransport {
                    inner: inner_weak.clone(),
                }),
            );
            Inner {
                id,
                local_id,
                state: TransportState::new(0),
                data,
                app_data,
                router,
                handlers,
                closed: AtomicBool::new(false),
                _subscription_handler: Mutex::new(None),
            }
        });
        let transport = Self { inner };

        let subscription_handler = {
            let handlers = Arc::clone(&transport.inner.handlers);
            transport.inner.router.worker().channel().subscribe_to_notifications(
                id.to_string(),
                move |notification| match serde_json::from_value::<Notification>(notification) {
                    Ok(Notification::Trace(trace_event_data)) => {
                        handlers.trace.call(|callback| {
                            callback(&trace_event_data);
                        });
                    }
                    Err(error) => {
                        error!("failed to parse transport notification: {}", error);
                    }
                },
            )
        };
        transport
            .inner
            ._subscription_handler
            .lock()
            .replace(subscription_handler);

        transport.notify_created();

        transport
    }

    /// Maximum size of messages sent over this transport.
    pub fn max_message_size(&self) -> u32 {
        self.inner.data.max_message_size
    }

    pub fn on_trace<F: Fn(&TransportTraceEventData) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.trace.add(Box::new(callback))
    }

    pub(crate) fn close_from_router(&self) {
        self.inner.close(false, false);
    }

    pub fn downgrade(&self) -> WeakDirectTransport {
        WeakDirectTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn id(&self) -> TransportId {
        self.inner.id
    }

    fn local_id(&self) -> ResourceId {
        self.inner.local_id
    }

    fn router_id(&self) -> RouterId {
        self.inner.router.id()
    }

    fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn produce(&self, producer_options: ProducerOptions) -> Result<Producer, ProduceError> {
        debug!("produce()");

        self.produce_impl(producer_options).await
    }

    async fn consume(&self, consumer_options: ConsumerOptions) -> Result<Consumer, ConsumeError> {
        debug!("consume()");

        self.consume_impl(consumer_options).await
    }

    async fn produce_data(
        &self,
        data_producer_options: DataProducerOptions,
    ) -> Result<DataProducer, ProduceDataError> {
        debug!("produce_data()");

        self.produce_data_impl(DataProducerType::Direct, data_producer_options)
            .await
    }

    async fn consume_data(
        &self,
        data_consumer_options: DataConsumerOptions,
    ) -> Result<DataConsumer, ConsumeDataError> {
        debug!("consume_data()");

        self.consume_data_impl(DataConsumerType::Direct, data_consumer_options)
            .await
    }

    async fn set_max_incoming_bitrate(&self, _bitrate: u32) -> Result<(), RequestError> {
        // There is no network path to shape on a direct transport.
        Ok(())
    }

    async fn enable_trace_event(
        &self,
        types: Vec<TransportTraceEventType>,
    ) -> Result<(), RequestError> {
        debug!("enable_trace_event()");

        self.enable_trace_event_impl(types).await
    }

    fn on_closed(&self, callback: Box<dyn FnOnce() + Send>) -> HandlerId {
        self.inner.handlers.closed.add(callback)
    }

    fn remove_child(&self, child_id: TransportChildId) {
        self.inner.state.remove_child(child_id);
    }

    fn close(&self) {
        self.inner.close(true, true);
    }
}

#[async_trait]
impl TransportGeneric<DirectTransportDump, DirectTransportStat> for DirectTransport {
    async fn dump(&self) -> Result<DirectTransportDump, RequestError> {
        debug!("dump()");

        self.dump_impl().await
    }

    async fn get_stats(&self) -> Result<Vec<DirectTransportStat>, RequestError> {
        debug!("get_stats()");

        self.get_stats_impl().await
    }
}

impl TransportImpl<DirectTransportDump, DirectTransportStat> for DirectTransport {
    fn router(&self) -> &Router {
        &self.inner.router
    }

    fn channel(&self) -> &Channel {
        self.inner.router.worker().channel()
    }

    fn payload_channel(&self) -> &PayloadChannel {
        self.inner.router.worker().payload_channel()
    }

    fn executor(&self) -> &Arc<Executor<'static>> {
        self.inner.router.executor()
    }

    fn state(&self) -> &TransportState {
        &self.inner.state
    }

    fn direct(&self) -> bool {
        true
    }
}
