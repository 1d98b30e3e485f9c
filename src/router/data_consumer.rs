//! A data consumer represents data messages forwarded from a data
//! producer to an endpoint, over SCTP or directly into the host process.

use crate::data_structures::{AppData, DataConsumerInternal, WebRtcMessage};
use crate::data_producer::{DataProducer, DataProducerId, WeakDataProducer};
use crate::events::EventKind;
use crate::messages::{
    DataConsumerCloseRequest, DataConsumerDumpRequest, DataConsumerGetBufferedAmountRequest,
    DataConsumerGetStatsRequest, DataConsumerSetBufferedAmountLowThresholdData,
    DataConsumerSetBufferedAmountLowThresholdRequest,
};
use crate::registry::{ResourceId, WeakResource};
use crate::router::transport::{Transport, TransportChildId, TransportId};
use crate::router::Router;
use crate::sctp_parameters::SctpStreamParameters;
use crate::worker::{
    Channel, NotificationMessage, PayloadChannel, PayloadSubscriptionHandler, RequestError,
    SubscriptionHandler,
};
use async_executor::Executor;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

uuid_based_wrapper_type!(
    /// Data consumer identifier.
    DataConsumerId
);

/// Data consumer options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct DataConsumerOptions {
    /// The data producer to consume.
    pub data_producer_id: DataProducerId,
    /// Override ordered delivery of the producer's stream parameters.
    pub ordered: Option<bool>,
    /// Override the packet lifetime of the producer's stream parameters.
    pub max_packet_life_time: Option<u16>,
    /// Override the retransmit count of the producer's stream parameters.
    pub max_retransmits: Option<u16>,
    /// Custom application data.
    pub app_data: AppData,
}

impl DataConsumerOptions {
    pub fn new(data_producer_id: DataProducerId) -> Self {
        Self {
            data_producer_id,
            ordered: None,
            max_packet_life_time: None,
            max_retransmits: None,
            app_data: AppData::default(),
        }
    }
}

/// Data consumer type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataConsumerType {
    /// Messages are delivered over SCTP.
    Sctp,
    /// Messages are delivered directly to the host process.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
#[non_exhaustive]
pub struct DataConsumerDump {
    pub id: DataConsumerId,
    pub data_producer_id: DataProducerId,
    pub r#type: DataConsumerType,
    pub label: String,
    pub protocol: String,
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    pub buffered_amount_low_threshold: u32,
}

/// RTC statistics of the data consumer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DataConsumerStat {
    // `type` field is present in worker, but ignored here
    pub timestamp: u64,
    pub label: String,
    pub protocol: String,
    pub messages_sent: usize,
    pub bytes_sent: usize,
    pub buffered_amount: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum Notification {
    DataProducerClose,
    SctpSendBufferFull,
    BufferedAmountLow,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
enum PayloadNotification {
    Message { ppid: u32 },
}

#[derive(Default)]
struct Handlers {
    message: Bag<Box<dyn Fn(&WebRtcMessage) + Send + Sync>>,
    sctp_send_buffer_full: Bag<Box<dyn Fn() + Send + Sync>>,
    buffered_amount_low: Bag<Box<dyn Fn() + Send + Sync>>,
    data_producer_close: BagOnce<Box<dyn FnOnce() + Send>>,
    transport_close: BagOnce<Box<dyn FnOnce() + Send>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: DataConsumerId,
    local_id: ResourceId,
    data_producer_id: DataProducerId,
    #[allow(dead_code)]
    data_producer: WeakDataProducer,
    r#type: DataConsumerType,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    executor: Arc<Executor<'static>>,
    channel: Channel,
    #[allow(dead_code)]
    payload_channel: PayloadChannel,
    handlers: Arc<Handlers>,
    app_data: AppData,
    transport: Arc<dyn Transport>,
    router: Router,
    closed: AtomicBool,
    _subscription_handler: Mutex<Option<SubscriptionHandler>>,
    _payload_subscription_handler: Mutex<Option<PayloadSubscriptionHandler>>,
    _on_transport_close_handler: Mutex<Option<HandlerId>>,
    _on_data_producer_close_handler: Mutex<Option<HandlerId>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close(true, true);
    }
}

impl Inner {
    fn close(&self, send_request: bool, remove_from_transport: bool) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close() [id:{}]", self.id);

            self.router.registry().unregister(self.local_id);
            self.handlers.close.call_simple();
            self.router
                .event_bus()
                .emit(EventKind::ConsumerClosed, self.local_id, None);

            if remove_from_transport {
                self.transport
                    .remove_child(TransportChildId::DataConsumer(self.id));
            }

            if send_request {
                let channel = self.channel.clone();
                let request = DataConsumerCloseRequest {
                    internal: DataConsumerInternal {
                        router_id: self.transport.router_id(),
                        transport_id: self.transport.id(),
                        data_producer_id: self.data_producer_id,
                        data_consumer_id: self.id,
                    },
                };
                let transport = Arc::clone(&self.transport);
                self.executor
                    .spawn(async move {
                        if let Err(error) = channel.request(request).await {
                            error!("data consumer closing failed: {}", error);
                        }

                        drop(transport);
                    })
                    .detach();
            }
        }
    }
}

/// A data consumer; an outbound data channel on a transport.
#[derive(Clone)]
pub struct DataConsumer {
    inner: Arc<Inner>,
}

/// Weak handle to a data consumer.
#[derive(Clone)]
pub struct WeakDataConsumer {
    inner: Weak<Inner>,
}

impl WeakDataConsumer {
    pub fn upgrade(&self) -> Option<DataConsumer> {
        self.inner.upgrade().map(|inner| DataConsumer { inner })
    }
}

impl DataConsumer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: DataConsumerId,
        r#type: DataConsumerType,
        sctp_stream_parameters: Option<SctpStreamParameters>,
        label: String,
        protocol: String,
        data_producer: DataProducer,
        executor: Arc<Executor<'static>>,
        channel: Channel,
        payload_channel: PayloadChannel,
        app_data: AppData,
        transport: Arc<dyn Transport>,
        router: Router,
    ) -> Self {
        debug!("new()");

        let handlers = Arc::<Handlers>::default();
        let registry = router.registry().clone();
        let data_producer_id = data_producer.id();

        let inner = Arc::new_cyclic(|inner_weak: &Weak<Inner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::DataConsumer(WeakDataConsumer {
                    inner: inner_weak.clone(),
                }),
            );
            Inner {
                id,
                local_id,
                data_producer_id,
                data_producer: data_producer.downgrade(),
                r#type,
                sctp_stream_parameters,
                label,
                protocol,
                executor,
                channel,
                payload_channel,
                handlers,
                app_data,
                transport,
                router,
                closed: AtomicBool::new(false),
                _subscription_handler: Mutex::new(None),
                _payload_subscription_handler: Mutex::new(None),
                _on_transport_close_handler: Mutex::new(None),
                _on_data_producer_close_handler: Mutex::new(None),
            }
        });
        let data_consumer = Self { inner };

        let subscription_handler = {
            let handlers = Arc::clone(&data_consumer.inner.handlers);
            let inner_weak = Arc::downgrade(&data_consumer.inner);
            data_consumer.inner.channel.subscribe_to_notifications(
                id.to_string(),
                move |notification| match serde_json::from_value::<Notification>(notification) {
                    Ok(notification) => match notification {
                        Notification::DataProducerClose => {
                            handlers.data_producer_close.call_simple();
                            if let Some(inner) = inner_weak.upgrade() {
                                inner.close(false, true);
                            }
                        }
                        Notification::SctpSendBufferFull => {
                            handlers.sctp_send_buffer_full.call_simple();
                        }
                        Notification::BufferedAmountLow => {
                            handlers.buffered_amount_low.call_simple();
                        }
                    },
                    Err(error) => {
                        error!("failed to parse data consumer notification: {}", error);
                    }
                },
            )
        };
        data_consumer
            .inner
            ._subscription_handler
            .lock()
            .replace(subscription_handler);

        let payload_subscription_handler = {
            let handlers = Arc::clone(&data_consumer.inner.handlers);
            data_consumer
                .inner
                .payload_channel
                .subscribe_to_notifications(id.to_string(), move |notification| {
                    let NotificationMessage { message, payload } = notification;
                    match serde_json::from_value::<PayloadNotification>(message) {
                        Ok(PayloadNotification::Message { ppid }) => {
                            match WebRtcMessage::new(ppid, payload) {
                                Ok(message) => {
                                    handlers.message.call(|callback| {
                                        callback(&message);
                                    });
                                }
                                Err(ppid) => {
                                    error!("unsupported ppid {} in data message", ppid);
                                }
                            }
                        }
                        Err(error) => {
                            error!(
                                "failed to parse data consumer payload notification: {}",
                                error,
                            );
                        }
                    }
                })
        };
        data_consumer
            .inner
            ._payload_subscription_handler
            .lock()
            .replace(payload_subscription_handler);

        let on_transport_close_handler = {
            let inner_weak = Arc::downgrade(&data_consumer.inner);
            data_consumer.inner.transport.on_closed(Box::new(move || {
                if let Some(inner) = inner_weak.upgrade() {
                    inner.handlers.transport_close.call_simple();
                    inner.close(false, false);
                }
            }))
        };
        data_consumer
            .inner
            ._on_transport_close_handler
            .lock()
            .replace(on_transport_close_handler);

        // Local back-edge: closing the data producer closes its consumers.
        let on_data_producer_close_handler = {
            let inner_weak = Arc::downgrade(&data_consumer.inner);
            data_producer.on_close(move || {
                if let Some(inner) = inner_weak.upgrade() {
                    inner.handlers.data_producer_close.call_simple();
                    inner.close(false, true);
                }
            })
        };
        data_consumer
            .inner
            ._on_data_producer_close_handler
            .lock()
            .replace(on_data_producer_close_handler);

        data_consumer.inner.router.event_bus().emit(
            EventKind::ConsumerCreated,
            data_consumer.inner.local_id,
            None,
        );

        data_consumer
    }

    /// Data consumer id.
    pub fn id(&self) -> DataConsumerId {
        self.inner.id
    }

    /// Local resource id.
    pub fn local_id(&self) -> ResourceId {
        self.inner.local_id
    }

    /// Id of the data producer feeding this data consumer.
    pub fn data_producer_id(&self) -> DataProducerId {
        self.inner.data_producer_id
    }

    /// Id of the transport carrying this data consumer.
    pub fn transport_id(&self) -> TransportId {
        self.inner.transport.id()
    }

    /// The type of the data consumer.
    pub fn r#type(&self) -> DataConsumerType {
        self.inner.r#type
    }

    /// SCTP stream parameters; present for SCTP data consumers.
    pub fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters> {
        self.inner.sctp_stream_parameters
    }

    /// Data channel label.
    pub fn label(&self) -> &String {
        &self.inner.label
    }

    /// Data channel sub-protocol.
    pub fn protocol(&self) -> &String {
        &self.inner.protocol
    }

    /// Custom application data.
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    /// Whether the data consumer is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Dump data consumer state.
    #[doc(hidden)]
    pub async fn dump(&self) -> Result<DataConsumerDump, RequestError> {
        debug!("dump()");

        self.inner
            .channel
            .request(DataConsumerDumpRequest {
                internal: self.get_internal(),
            })
            .await
    }

    /// Data consumer statistics.
    pub async fn get_stats(&self) -> Result<Vec<DataConsumerStat>, RequestError> {
        debug!("get_stats()");

        self.inner
            .channel
            .request(DataConsumerGetStatsRequest {
                internal: self.get_internal(),
            })
            .await
    }

    /// Number of bytes queued in the worker for this data consumer.
    pub async fn get_buffered_amount(&self) -> Result<u32, RequestError> {
        debug!("get_buffered_amount()");

        let response = self
            .inner
            .channel
            .request(DataConsumerGetBufferedAmountRequest {
                internal: self.get_internal(),
            })
            .await?;

        Ok(response.buffered_amount)
    }

    /// Threshold below which the buffered-amount-low notification fires.
    pub async fn set_buffered_amount_low_threshold(
        &self,
        threshold: u32,
    ) -> Result<(), RequestError> {
        debug!("set_buffered_amount_low_threshold() [threshold:{}]", threshold);

        self.inner
            .channel
            .request(DataConsumerSetBufferedAmountLowThresholdRequest {
                internal: self.get_internal(),
                data: DataConsumerSetBufferedAmountLowThresholdData { threshold },
            })
            .await
    }

    /// Callback called for every message delivered to this data consumer.
    ///
    /// Only available on direct transports.
    pub fn on_message<F: Fn(&WebRtcMessage) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.message.add(Box::new(callback))
    }

    /// Callback called when the worker SCTP send buffer is full.
    pub fn on_sctp_send_buffer_full<F: Fn() + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .sctp_send_buffer_full
            .add(Box::new(callback))
    }

    /// Callback called when the buffered amount drops below the configured
    /// threshold.
    pub fn on_buffered_amount_low<F: Fn() + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .buffered_amount_low
            .add(Box::new(callback))
    }

    /// Callback called when the data producer feeding this consumer is
    /// closed; the data consumer itself closes too.
    pub fn on_data_producer_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner
            .handlers
            .data_producer_close
            .add(Box::new(callback))
    }

    /// Callback called when the transport this data consumer belongs to is
    /// closed; the data consumer itself closes too.
    pub fn on_transport_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.transport_close.add(Box::new(callback))
    }

    /// Callback called when the data consumer is closed for whatever
    /// reason.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    /// Close the data consumer.
    pub fn close(&self) {
        self.inner.close(true, true);
    }

    pub(crate) fn close_from_transport(&self) {
        self.inner.close(false, false);
    }

    pub fn downgrade(&self) -> WeakDataConsumer {
        WeakDataConsumer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn get_internal(&self) -> DataConsumerInternal {
        DataConsumerInternal {
            router_id: self.inner.transport.router_id(),
            transport_id: self.inner.transport.id(),
            data_producer_id: self.inner.data_producer_id,
            data_consumer_id: self.inner.id,
        }
    }
}
