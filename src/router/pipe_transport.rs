//! Pipe transport: router-to-router tunnel. Wired for completeness; the
//! room domain does not create these.

use crate::consumer::{Consumer, ConsumerOptions};
use crate::data_consumer::{DataConsumer, DataConsumerOptions, DataConsumerType};
use crate::data_producer::{DataProducer, DataProducerOptions, DataProducerType};
use crate::data_structures::{AppData, SctpState, TransportInternal, TransportListenIp, TransportTuple};
use crate::events::EventKind;
use crate::messages::{
    TransportCloseRequest, TransportConnectPipeData, TransportConnectPipeRequest,
};
use crate::producer::{Producer, ProducerOptions};
use crate::registry::{ResourceId, WeakResource};
use crate::router::transport::{
    ConsumeDataError, ConsumeError, ProduceDataError, ProduceError, Transport, TransportGeneric,
    TransportChildId, TransportId, TransportImpl, TransportState, TransportTraceEventData,
    TransportTraceEventType,
};
use crate::router::{Router, RouterId};
use crate::sctp_parameters::{NumSctpStreams, SctpParameters};
use crate::srtp_parameters::SrtpParameters;
use crate::worker::{Channel, PayloadChannel, RequestError, SubscriptionHandler};
use async_executor::Executor;
use async_trait::async_trait;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Pipe transport creation options.
#[derive(Debug)]
#[non_exhaustive]
pub struct PipeTransportOptions {
    /// Listening IP.
    pub listen_ip: TransportListenIp,
    /// Create an SCTP association. Default false.
    pub enable_sctp: bool,
    /// SCTP streams number.
    pub num_sctp_streams: NumSctpStreams,
    /// Maximum allowed size for SCTP messages. Default 268435456.
    pub max_sctp_message_size: u32,
    /// Maximum SCTP send buffer. Default 268435456.
    pub sctp_send_buffer_size: u32,
    /// Forward RTX streams through the pipe. Default false.
    pub enable_rtx: bool,
    /// Protect the pipe with SRTP. Default false.
    pub enable_srtp: bool,
    /// Custom application data.
    pub app_data: AppData,
}

impl PipeTransportOptions {
    pub fn new(listen_ip: TransportListenIp) -> Self {
        Self {
            listen_ip,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: 268_435_456,
            sctp_send_buffer_size: 268_435_456,
            enable_rtx: false,
            enable_srtp: false,
            app_data: AppData::default(),
        }
    }
}

/// Negotiated state of a pipe transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct PipeTransportData {
    pub tuple: TransportTuple,
    pub sctp_parameters: Option<SctpParameters>,
    pub sctp_state: Option<SctpState>,
    pub rtx: bool,
    pub srtp_parameters: Option<SrtpParameters>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct PipeTransportDump {
    pub id: TransportId,
    pub direct: bool,
    pub tuple: TransportTuple,
    pub sctp_parameters: Option<SctpParameters>,
    pub sctp_state: Option<SctpState>,
    pub rtx: bool,
    pub srtp_parameters: Option<SrtpParameters>,
    pub trace_event_types: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeTransportStat {
    // `type` field is present in worker, but ignored here
    pub transport_id: TransportId,
    pub timestamp: u64,
    pub sctp_state: Option<SctpState>,
    pub bytes_received: usize,
    pub recv_bitrate: u32,
    pub bytes_sent: usize,
    pub send_bitrate: u32,
    pub rtp_bytes_received: usize,
    pub rtp_recv_bitrate: u32,
    pub rtp_bytes_sent: usize,
    pub rtp_send_bitrate: u32,
    pub rtx_bytes_received: usize,
    pub rtx_recv_bitrate: u32,
    pub rtx_bytes_sent: usize,
    pub rtx_send_bitrate: u32,
    pub probation_bytes_sent: usize,
    pub probation_send_bitrate: u32,
    pub tuple: TransportTuple,
}

/// Remote pipe endpoint supplied on `connect()`.
#[derive(Debug)]
pub struct PipeTransportRemoteParameters {
    /// Remote IP.
    pub ip: IpAddr,
    /// Remote port.
    pub port: u16,
    /// Remote SRTP keying material when SRTP is enabled.
    pub srtp_parameters: Option<SrtpParameters>,
}

#[derive(Default)]
struct Handlers {
    sctp_state_change: Bag<Box<dyn Fn(SctpState) + Send + Sync>>,
    trace: Bag<Box<dyn Fn(&TransportTraceEventData) + Send + Sync>>,
    closed: BagOnce<Box<dyn FnOnce() + Send>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", content = "data")]
enum Notification {
    #[serde(rename_all = "camelCase")]
    SctpStateChange {
        sctp_state: SctpState,
    },
    Trace(TransportTraceEventData),
}

struct Inner {
    id: TransportId,
    local_id: ResourceId,
    state: TransportState,
    data: Mutex<PipeTransportData>,
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

/// A pipe transport.
#[derive(Clone)]
pub struct PipeTransport {
    inner: Arc<Inner>,
}

/// Weak handle to a pipe transport.
#[derive(Clone)]
pub struct WeakPipeTransport {
    inner: Weak<Inner>,
}

impl WeakPipeTransport {
    pub fn upgrade(&self) -> Option<PipeTransport> {
        self.inner.upgrade().map(|inner| PipeTransport { inner })
    }
}

impl PipeTransport {
    pub(crate) fn new(
        id: TransportId,
        data: PipeTransportData,
        sctp_max_slots: u16,
        app_data: AppData,
        router: Router,
    ) -> Self {
        debug!("new()");

        let handlers = Arc::<Handlers>::default();
        let registry = router.registry().clone();
        let inner = Arc::new_cyclic(|inner_weak: &Weak<Inner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::PipeTransport(WeakPipeTransport {
                    inner: inner_weak.clone(),
                }),
            );
            Inner {
                id,
                local_id,
                state: TransportState::new(sctp_max_slots),
                data: Mutex::new(data),
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
            let inner_weak = Arc::downgrade(&transport.inner);
            let event_bus = transport.inner.router.event_bus().clone();
            let local_id = transport.inner.local_id;
            transport.inner.router.worker().channel().subscribe_to_notifications(
                id.to_string(),
                move |notification| match serde_json::from_value::<Notification>(notification) {
                    Ok(notification) => match notification {
                        Notification::SctpStateChange { sctp_state } => {
                            if let Some(inner) = inner_weak.upgrade() {
                                inner.data.lock().sctp_state = Some(sctp_state);
                            }
                            handlers.sctp_state_change.call(|callback| {
                                callback(sctp_state);
                            });
                            event_bus.emit(
                                EventKind::TransportSctpStateChange,
                                local_id,
                                serde_json::to_value(sctp_state).ok(),
                            );
                        }
                        Notification::Trace(trace_event_data) => {
                            handlers.trace.call(|callback| {
                                callback(&trace_event_data);
                            });
                        }
                    },
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

    /// Local tuple of the pipe.
    pub fn tuple(&self) -> TransportTuple {
        self.inner.data.lock().tuple
    }

    /// Negotiated SCTP parameters, if SCTP was enabled.
    pub fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.inner.data.lock().sctp_parameters
    }

    /// Local SRTP parameters when SRTP is enabled.
    pub fn srtp_parameters(&self) -> Option<SrtpParameters> {
        self.inner.data.lock().srtp_parameters.clone()
    }

    /// Provide the transport with the remote pipe endpoint.
    pub async fn connect(
        &self,
        remote_parameters: PipeTransportRemoteParameters,
    ) -> Result<(), RequestError> {
        debug!("connect()");

        let response = self
            .inner
            .router
            .worker()
            .channel()
            .request(TransportConnectPipeRequest {
                internal: self.get_internal(),
                data: TransportConnectPipeData {
                    ip: remote_parameters.ip,
                    port: remote_parameters.port,
                    srtp_parameters: remote_parameters.srtp_parameters,
                },
            })
            .await?;

        self.inner.data.lock().tuple = response.tuple;
        self.inner.router.event_bus().emit(
            EventKind::TransportUpdated,
            self.inner.local_id,
            None,
        );

        Ok(())
    }

    pub fn on_sctp_state_change<F: Fn(SctpState) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .sctp_state_change
            .add(Box::new(callback))
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

    pub fn downgrade(&self) -> WeakPipeTransport {
        WeakPipeTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
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

        self.produce_data_impl(DataProducerType::Sctp, data_producer_options)
            .await
    }

    async fn consume_data(
        &self,
        data_consumer_options: DataConsumerOptions,
    ) -> Result<DataConsumer, ConsumeDataError> {
        debug!("consume_data()");

        self.consume_data_impl(DataConsumerType::Sctp, data_consumer_options)
            .await
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), RequestError> {
        debug!("set_max_incoming_bitrate() [bitrate:{}]", bitrate);

        self.set_max_incoming_bitrate_impl(bitrate).await
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
impl TransportGeneric<PipeTransportDump, PipeTransportStat> for PipeTransport {
    async fn dump(&self) -> Result<PipeTransportDump, RequestError> {
        debug!("dump()");

        self.dump_impl().await
    }

    async fn get_stats(&self) -> Result<Vec<PipeTransportStat>, RequestError> {
        debug!("get_stats()");

        self.get_stats_impl().await
    }
}

impl TransportImpl<PipeTransportDump, PipeTransportStat> for PipeTransport {
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
}
