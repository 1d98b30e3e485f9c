//! A data producer represents an endpoint injecting data messages into a
//! router, either over SCTP (a data channel) or directly from the host
//! process through a direct transport.

use crate::data_structures::{AppData, DataProducerInternal, WebRtcMessage};
use crate::events::EventKind;
use crate::messages::{
    DataProducerCloseRequest, DataProducerDumpRequest, DataProducerGetStatsRequest,
    DataProducerSendData, DataProducerSendNotification,
};
use crate::registry::{ResourceId, WeakResource};
use crate::router::transport::{Transport, TransportChildId, TransportId};
use crate::router::Router;
use crate::sctp_parameters::SctpStreamParameters;
use crate::worker::{Channel, NotificationError, PayloadChannel, RequestError};
use async_executor::Executor;
use event_listener_primitives::{BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

uuid_based_wrapper_type!(
    /// Data producer identifier.
    DataProducerId
);

/// Data producer options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct DataProducerOptions {
    /// SCTP parameters defining how the endpoint sends the data; required
    /// for SCTP data producers, forbidden on direct transports.
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    /// A label distinguishing this data channel from others.
    pub label: String,
    /// Sub-protocol of this data channel.
    pub protocol: String,
    /// Custom application data.
    pub app_data: AppData,
}

impl DataProducerOptions {
    /// For SCTP transports.
    pub fn new_sctp(sctp_stream_parameters: SctpStreamParameters) -> Self {
        Self {
            sctp_stream_parameters: Some(sctp_stream_parameters),
            label: String::new(),
            protocol: String::new(),
            app_data: AppData::default(),
        }
    }

    /// For direct transports.
    pub fn new_direct() -> Self {
        Self {
            sctp_stream_parameters: None,
            label: String::new(),
            protocol: String::new(),
            app_data: AppData::default(),
        }
    }
}

/// Data producer type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataProducerType {
    /// The endpoint sends messages over SCTP.
    Sctp,
    /// Messages are sent directly from the host process.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
#[non_exhaustive]
pub struct DataProducerDump {
    pub id: DataProducerId,
    pub r#type: DataProducerType,
    pub label: String,
    pub protocol: String,
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
}

/// RTC statistics of the data producer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DataProducerStat {
    // `type` field is present in worker, but ignored here
    pub timestamp: u64,
    pub label: String,
    pub protocol: String,
    pub messages_received: usize,
    pub bytes_received: usize,
}

#[derive(Default)]
struct Handlers {
    transport_close: BagOnce<Box<dyn FnOnce() + Send>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: DataProducerId,
    local_id: ResourceId,
    r#type: DataProducerType,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    direct: bool,
    executor: Arc<Executor<'static>>,
    channel: Channel,
    payload_channel: PayloadChannel,
    handlers: Arc<Handlers>,
    app_data: AppData,
    transport: Arc<dyn Transport>,
    router: Router,
    closed: AtomicBool,
    _on_transport_close_handler: Mutex<Option<HandlerId>>,
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
                .emit(EventKind::ProducerClosed, self.local_id, None);

            if remove_from_transport {
                self.transport
                    .remove_child(TransportChildId::DataProducer(self.id));
            }

            if send_request {
                let channel = self.channel.clone();
                let request = DataProducerCloseRequest {
                    internal: DataProducerInternal {
                        router_id: self.transport.router_id(),
                        transport_id: self.transport.id(),
                        data_producer_id: self.id,
                    },
                };
                let transport = Arc::clone(&self.transport);
                self.executor
                    .spawn(async move {
                        if let Err(error) = channel.request(request).await {
                            error!("data producer closing failed: {}", error);
                        }

                        drop(transport);
                    })
                    .detach();
            }
        }
    }
}

/// A data producer; an inbound data channel on a transport.
#[derive(Clone)]
pub struct DataProducer {
    inner: Arc<Inner>,
}

/// Weak handle to a data producer.
#[derive(Clone)]
pub struct WeakDataProducer {
    inner: Weak<Inner>,
}

impl WeakDataProducer {
    pub fn upgrade(&self) -> Option<DataProducer> {
        self.inner.upgrade().map(|inner| DataProducer { inner })
    }
}

impl DataProducer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: DataProducerId,
        r#type: DataProducerType,
        sctp_stream_parameters: Option<SctpStreamParameters>,
        label: String,
        protocol: String,
        executor: Arc<Executor<'static>>,
        channel: Channel,
        payload_channel: PayloadChannel,
        app_data: AppData,
        transport: Arc<dyn Transport>,
        router: Router,
        direct: bool,
    ) -> Self {
        debug!("new()");

        let handlers = Arc::<Handlers>::default();
        let registry = router.registry().clone();

        let inner = Arc::new_cyclic(|inner_weak: &Weak<Inner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::DataProducer(WeakDataProducer {
                    inner: inner_weak.clone(),
                }),
            );
            Inner {
                id,
                local_id,
                r#type,
                sctp_stream_parameters,
                label,
                protocol,
                direct,
                executor,
                channel,
                payload_channel,
                handlers,
                app_data,
                transport,
                router,
                closed: AtomicBool::new(false),
                _on_transport_close_handler: Mutex::new(None),
            }
        });
        let data_producer = Self { inner };

        let on_transport_close_handler = {
            let inner_weak = Arc::downgrade(&data_producer.inner);
            data_producer.inner.transport.on_closed(Box::new(move || {
                if let Some(inner) = inner_weak.upgrade() {
                    inner.handlers.transport_close.call_simple();
                    inner.close(false, false);
                }
            }))
        };
        data_producer
            .inner
            ._on_transport_close_handler
            .lock()
            .replace(on_transport_close_handler);

        data_producer.inner.router.event_bus().emit(
            EventKind::ProducerCreated,
            data_producer.inner.local_id,
            None,
        );

        data_producer
    }

    /// Data producer id.
    pub fn id(&self) -> DataProducerId {
        self.inner.id
    }

    /// Local resource id.
    pub fn local_id(&self) -> ResourceId {
        self.inner.local_id
    }

    /// Id of the transport carrying this data producer.
    pub fn transport_id(&self) -> TransportId {
        self.inner.transport.id()
    }

    /// The type of the data producer.
    pub fn r#type(&self) -> DataProducerType {
        self.inner.r#type
    }

    /// SCTP stream parameters; present for SCTP data producers.
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

    /// Whether the data producer is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Dump data producer state.
    #[doc(hidden)]
    pub async fn dump(&self) -> Result<DataProducerDump, RequestError> {
        debug!("dump()");

        self.inner
            .channel
            .request(DataProducerDumpRequest {
                internal: self.get_internal(),
            })
            .await
    }

    /// Data producer statistics.
    pub async fn get_stats(&self) -> Result<Vec<DataProducerStat>, RequestError> {
        debug!("get_stats()");

        self.inner
            .channel
            .request(DataProducerGetStatsRequest {
                internal: self.get_internal(),
            })
            .await
    }

    /// Sends a message through this data producer.
    ///
    /// Only supported on direct transports; the message travels over the
    /// worker's payload channel with a PPID derived from its kind.
    pub async fn send(&self, message: WebRtcMessage) -> Result<(), NotificationError> {
        if !self.inner.direct {
            return Err(NotificationError::RequiredDirectTransport);
        }

        let (ppid, payload) = message.into_ppid_and_payload();

        self.inner
            .payload_channel
            .notify(
                DataProducerSendNotification {
                    internal: self.get_internal(),
                    data: DataProducerSendData { ppid: ppid as u32 },
                },
                payload,
            )
            .await
    }

    /// Callback called when the transport this data producer belongs to is
    /// closed; the data producer itself closes too.
    pub fn on_transport_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.transport_close.add(Box::new(callback))
    }

    /// Callback called when the data producer is closed for whatever
    /// reason.
    ///
    /// The callback is invoked in place if the data producer is already
    /// closed.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    /// Close the data producer.
    pub fn close(&self) {
        self.inner.close(true, true);
    }

    pub(crate) fn close_from_transport(&self) {
        self.inner.close(false, false);
    }

    pub fn downgrade(&self) -> WeakDataProducer {
        WeakDataProducer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn get_internal(&self) -> DataProducerInternal {
        DataProducerInternal {
            router_id: self.inner.transport.router_id(),
            transport_id: self.inner.transport.id(),
            data_producer_id: self.inner.id,
        }
    }
}
