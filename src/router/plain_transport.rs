//! Plain transport: RTP over plain UDP, optionally SRTP-protected. Used
//! for gateways, recorders and other non-WebRTC endpoints.

use crate::consumer::{Consumer, ConsumerOptions};
use crate::data_consumer::{DataConsumer, DataConsumerOptions, DataConsumerType};
use crate::data_producer::{DataProducer, DataProducerOptions, DataProducerType};
use crate::data_structures::{AppData, SctpState, TransportInternal, TransportListenIp, TransportTuple};
use crate::events::EventKind;
use crate::messages::{
    TransportCloseRequest, TransportConnectPlainData, TransportConnectPlainRequest,
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
use crate::srtp_parameters::{SrtpCryptoSuite, SrtpParameters};
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

/// Plain transport creation options.
#[derive(Debug)]
#[non_exhaustive]
pub struct PlainTransportOptions {
    /// Listening IP.
    pub listen_ip: TransportListenIp,
    /// Use RTCP-mux (RTP and RTCP in the same port). Default true.
    pub rtcp_mux: bool,
    /// Learn the remote address from the first received packet instead of
    /// `connect()`. Default false.
    pub comedia: bool,
    /// Create an SCTP association. Default false.
    pub enable_sctp: bool,
    /// SCTP streams number.
    pub num_sctp_streams: NumSctpStreams,
    /// Maximum allowed size for SCTP messages. Default 262144.
    pub max_sctp_message_size: u32,
    /// Maximum SCTP send buffer. Default 262144.
    pub sctp_send_buffer_size: u32,
    /// Protect RTP with SRTP. Default false.
    pub enable_srtp: bool,
    /// Crypto suite used when SRTP is enabled.
    pub srtp_crypto_suite: SrtpCryptoSuite,
    /// Custom application data.
    pub app_data: AppData,
}

impl PlainTransportOptions {
    pub fn new(listen_ip: TransportListenIp) -> Self {
        Self {
            listen_ip,
            rtcp_mux: true,
            comedia: false,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: 262_144,
            sctp_send_buffer_size: 262_144,
            enable_srtp: false,
            srtp_crypto_suite: SrtpCryptoSuite::default(),
            app_data: AppData::default(),
        }
    }
}

/// Negotiated state of a plain transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct PlainTransportData {
    pub rtcp_mux: bool,
    pub comedia: bool,
    pub tuple: Option<TransportTuple>,
    pub rtcp_tuple: Option<TransportTuple>,
    pub sctp_parameters: Option<SctpParameters>,
    pub sctp_state: Option<SctpState>,
    pub srtp_parameters: Option<SrtpParameters>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct PlainTransportDump {
    pub id: TransportId,
    pub direct: bool,
    pub rtcp_mux: bool,
    pub comedia: bool,
    pub tuple: Option<TransportTuple>,
    pub rtcp_tuple: Option<TransportTuple>,
    pub sctp_parameters: Option<SctpParameters>,
    pub sctp_state: Option<SctpState>,
    pub srtp_parameters: Option<SrtpParameters>,
    pub trace_event_types: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportStat {
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
    pub rtcp_mux: bool,
    pub comedia: bool,
    pub tuple: Option<TransportTuple>,
    pub rtcp_tuple: Option<TransportTuple>,
}

/// Remote endpoint supplied on `connect()`.
#[derive(Debug, Default)]
pub struct PlainTransportRemoteParameters {
    /// Remote IP; unset with comedia.
    pub ip: Option<IpAddr>,
    /// Remote RTP port.
    pub port: Option<u16>,
    /// Remote RTCP port when RTCP-mux is off.
    pub rtcp_port: Option<u16>,
    /// Remote SRTP keying material when SRTP is enabled.
    pub srtp_parameters: Option<SrtpParameters>,
}

#[derive(Default)]
struct Handlers {
    tuple: Bag<Box<dyn Fn(&TransportTuple) + Send + Sync>>,
    rtcp_tuple: Bag<Box<dyn Fn(&TransportTuple) + Send + Sync>>,
    sctp_state_change: Bag<Box<dyn Fn(SctpState) + Send + Sync>>,
    trace: Bag<Box<dyn Fn(&TransportTraceEventData) + Send + Sync>>,
    closed: BagOnce<Box<dyn FnOnce() + Send>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", content = "data")]
enum Notification {
    Tuple {
        tuple: TransportTuple,
    },
    #[serde(rename = "rtcptuple", rename_all = "camelCase")]
    RtcpTuple {
        rtcp_tuple: TransportTuple,
    },
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
    data: Mutex<PlainTransportData>,
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

/// A plain transport.
#[derive(Clone)]
pub struct PlainTransport {
    inner: Arc<Inner>,
}

/// Weak handle to a plain transport.
#[derive(Clone)]
pub struct WeakPlainTransport {
    inner: Weak<Inner>,
}

impl WeakPlainTransport {
    pub fn upgrade(&self) -> Option<PlainTransport> {
        self.inner.upgrade().map(|inner| PlainTransport { inner })
    }
}

impl PlainTransport {
    pub(crate) fn new(
        id: TransportId,
        data: PlainTransportData,
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
                WeakResource::PlainTransport(WeakPlainTransport {
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
                        Notification::Tuple { tuple } => {
                            if let Some(inner) = inner_weak.upgrade() {
                                inner.data.lock().tuple = Some(tuple);
                            }
                            handlers.tuple.call(|callback| {
                                callback(&tuple);
                            });
                            event_bus.emit(
                                EventKind::TransportTuple,
                                local_id,
                                serde_json::to_value(tuple).ok(),
                            );
                        }
                        Notification::RtcpTuple { rtcp_tuple } => {
                            if let Some(inner) = inner_weak.upgrade() {
                                inner.data.lock().rtcp_tuple = Some(rtcp_tuple);
                            }
                            handlers.rtcp_tuple.call(|callback| {
                                callback(&rtcp_tuple);
                            });
                            event_bus.emit(
                                EventKind::TransportRtcpTuple,
                                local_id,
                                serde_json::to_value(rtcp_tuple).ok(),
                            );
                        }
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

    /// Local RTP tuple.
    pub fn tuple(&self) -> Option<TransportTuple> {
        self.inner.data.lock().tuple
    }

    /// Local RTCP tuple when RTCP-mux is off.
    pub fn rtcp_tuple(&self) -> Option<TransportTuple> {
        self.inner.data.lock().rtcp_tuple
    }

    /// Negotiated SCTP parameters, if SCTP was enabled.
    pub fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.inner.data.lock().sctp_parameters
    }

    /// Current SCTP state.
    pub fn sctp_state(&self) -> Option<SctpState> {
        self.inner.data.lock().sctp_state
    }

    /// Local SRTP parameters when SRTP is enabled.
    pub fn srtp_parameters(&self) -> Option<SrtpParameters> {
        self.inner.data.lock().srtp_parameters.clone()
    }

    /// Provide the transport with the remote endpoint.
    pub async fn connect(
        &self,
        remote_parameters: PlainTransportRemoteParameters,
    ) -> Result<(), RequestError> {
        debug!("connect()");

        let response = self
            .inner
            .router
            .worker()
            .channel()
            .request(TransportConnectPlainRequest {
                internal: self.get_internal(),
                data: TransportConnectPlainData {
                    ip: remote_parameters.ip,
                    port: remote_parameters.port,
                    rtcp_port: remote_parameters.rtcp_port,
                    srtp_parameters: remote_parameters.srtp_parameters,
                },
            })
            .await?;

        {
            let mut data = self.inner.data.lock();
            if response.tuple.is_some() {
                data.tuple = response.tuple;
            }
            if response.rtcp_tuple.is_some() {
                data.rtcp_tuple = response.rtcp_tuple;
            }
            if response.srtp_parameters.is_some() {
                data.srtp_parameters = response.srtp_parameters;
            }
        }
        self.inner.router.event_bus().emit(
            EventKind::TransportUpdated,
            self.inner.local_id,
            None,
        );

        Ok(())
    }

    pub fn on_tuple<F: Fn(&TransportTuple) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.tuple.add(Box::new(callback))
    }

    pub fn on_rtcp_tuple<F: Fn(&TransportTuple) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.rtcp_tuple.add(Box::new(callback))
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

    pub fn downgrade(&self) -> WeakPlainTransport {
        WeakPlainTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for PlainTransport {
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
impl TransportGeneric<PlainTransportDump, PlainTransportStat> for PlainTransport {
    async fn dump(&self) -> Result<PlainTransportDump, RequestError> {
        debug!("dump()");

        self.dump_impl().await
    }

    async fn get_stats(&self) -> Result<Vec<PlainTransportStat>, RequestError> {
        debug!("get_stats()");

        self.get_stats_impl().await
    }
}

impl TransportImpl<PlainTransportDump, PlainTransportStat> for PlainTransport {
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
