//! WebRTC transport: ICE + DTLS (+ optional SCTP) endpoint for browsers
//! and other WebRTC clients.

use crate::consumer::{Consumer, ConsumerId, ConsumerOptions};
use crate::data_consumer::{DataConsumer, DataConsumerId, DataConsumerOptions, DataConsumerType};
use crate::data_producer::{DataProducer, DataProducerId, DataProducerOptions, DataProducerType};
use crate::data_structures::{
    AppData, DtlsParameters, DtlsState, IceCandidate, IceParameters, IceRole, IceState, SctpState,
    TransportInternal, TransportListenIp, TransportTuple,
};
use crate::events::EventKind;
use crate::messages::{
    TransportCloseRequest, TransportConnectWebRtcData, TransportConnectWebRtcRequest,
    TransportRestartIceRequest,
};
use crate::producer::{Producer, ProducerId, ProducerOptions};
use crate::registry::{ResourceId, WeakResource};
use crate::router::transport::{
    ConsumeDataError, ConsumeError, ProduceDataError, ProduceError, Transport, TransportChildId,
    TransportGeneric, TransportImpl, TransportState, TransportTraceEventData,
    TransportTraceEventType,
};
use crate::router::{Router, RouterId};
use crate::sctp_parameters::{NumSctpStreams, SctpParameters};
use crate::worker::{Channel, PayloadChannel, RequestError, SubscriptionHandler};
use crate::router::transport::TransportId;
use async_executor::Executor;
use async_trait::async_trait;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Non-empty list of listen IPs, first one preferred.
#[derive(Debug, Serialize, Clone)]
pub struct TransportListenIps(Vec<TransportListenIp>);

impl TransportListenIps {
    pub fn new(listen_ip: TransportListenIp) -> Self {
        Self(vec![listen_ip])
    }

    pub fn add(mut self, listen_ip: TransportListenIp) -> Self {
        self.0.push(listen_ip);
        self
    }
}

impl Deref for TransportListenIps {
    type Target = Vec<TransportListenIp>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Error, Debug)]
#[error("Empty list of listen IPs provided, should have at least one element")]
pub struct EmptyListError;

impl TryFrom<Vec<TransportListenIp>> for TransportListenIps {
    type Error = EmptyListError;

    fn try_from(listen_ips: Vec<TransportListenIp>) -> Result<Self, Self::Error> {
        if listen_ips.is_empty() {
            Err(EmptyListError)
        } else {
            Ok(Self(listen_ips))
        }
    }
}

/// WebRTC transport creation options.
#[derive(Debug)]
#[non_exhaustive]
pub struct WebRtcTransportOptions {
    /// Listening IP address or addresses, in order of preference.
    pub listen_ips: TransportListenIps,
    /// Listen in UDP. Default true.
    pub enable_udp: bool,
    /// Listen in TCP. Default false.
    pub enable_tcp: bool,
    /// Prefer UDP. Default false.
    pub prefer_udp: bool,
    /// Prefer TCP. Default false.
    pub prefer_tcp: bool,
    /// Initial available outgoing bitrate (bps). Default 600000.
    pub initial_available_outgoing_bitrate: u32,
    /// Create an SCTP association. Default false.
    pub enable_sctp: bool,
    /// SCTP streams number.
    pub num_sctp_streams: NumSctpStreams,
    /// Maximum allowed size for SCTP messages sent by data producers.
    /// Default 262144.
    pub max_sctp_message_size: u32,
    /// Maximum SCTP send buffer used by data consumers. Default 262144.
    pub sctp_send_buffer_size: u32,
    /// Custom application data.
    pub app_data: AppData,
}

impl WebRtcTransportOptions {
    pub fn new(listen_ips: TransportListenIps) -> Self {
        Self {
            listen_ips,
            enable_udp: true,
            enable_tcp: false,
            prefer_udp: false,
            prefer_tcp: false,
            initial_available_outgoing_bitrate: 600_000,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: 262_144,
            sctp_send_buffer_size: 262_144,
            app_data: AppData::default(),
        }
    }
}

/// Negotiated state of a WebRTC transport as reported by the worker; the
/// mutable parts are updated from state-change notifications.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct WebRtcTransportData {
    pub ice_role: IceRole,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub ice_state: IceState,
    pub ice_selected_tuple: Option<TransportTuple>,
    pub dtls_parameters: DtlsParameters,
    pub dtls_state: DtlsState,
    pub dtls_remote_cert: Option<String>,
    pub sctp_parameters: Option<SctpParameters>,
    pub sctp_state: Option<SctpState>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct WebRtcTransportDump {
    pub id: TransportId,
    pub direct: bool,
    pub producer_ids: Vec<ProducerId>,
    pub consumer_ids: Vec<ConsumerId>,
    pub data_producer_ids: Vec<DataProducerId>,
    pub data_consumer_ids: Vec<DataConsumerId>,
    pub map_ssrc_consumer_id: HashMap<String, ConsumerId>,
    pub map_rtx_ssrc_consumer_id: HashMap<String, ConsumerId>,
    pub max_message_size: usize,
    pub sctp_parameters: Option<SctpParameters>,
    pub trace_event_types: String,
    pub dtls_parameters: DtlsParameters,
    pub dtls_state: DtlsState,
    pub ice_candidates: Vec<IceCandidate>,
    pub ice_parameters: IceParameters,
    pub ice_role: IceRole,
    pub ice_state: IceState,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportStat {
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
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_outgoing_bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_incoming_bitrate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_incoming_bitrate: Option<u32>,
    pub ice_role: IceRole,
    pub ice_state: IceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_selected_tuple: Option<TransportTuple>,
    pub dtls_state: DtlsState,
}

/// Remote parameters supplied by the client on `connect()`.
pub struct WebRtcTransportRemoteParameters {
    pub dtls_parameters: DtlsParameters,
}

#[derive(Default)]
struct Handlers {
    ice_state_change: Bag<Box<dyn Fn(IceState) + Send + Sync>>,
    ice_selected_tuple_change: Bag<Box<dyn Fn(&TransportTuple) + Send + Sync>>,
    dtls_state_change: Bag<Box<dyn Fn(DtlsState) + Send + Sync>>,
    sctp_state_change: Bag<Box<dyn Fn(SctpState) + Send + Sync>>,
    trace: Bag<Box<dyn Fn(&TransportTraceEventData) + Send + Sync>>,
    closed: BagOnce<Box<dyn FnOnce() + Send>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", content = "data")]
enum Notification {
    #[serde(rename_all = "camelCase")]
    IceStateChange {
        ice_state: IceState,
    },
    #[serde(rename_all = "camelCase")]
    IceSelectedTupleChange {
        ice_selected_tuple: TransportTuple,
    },
    #[serde(rename_all = "camelCase")]
    DtlsStateChange {
        dtls_state: DtlsState,
        dtls_remote_cert: Option<String>,
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
    data: Mutex<WebRtcTransportData>,
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

/// A WebRTC transport.
#[derive(Clone)]
pub struct WebRtcTransport {
    inner: Arc<Inner>,
}

/// Weak handle to a WebRTC transport.
#[derive(Clone)]
pub struct WeakWebRtcTransport {
    inner: Weak<Inner>,
}

impl WeakWebRtcTransport {
    pub fn upgrade(&self) -> Option<WebRtcTransport> {
        self.inner.upgrade().map(|inner| WebRtcTransport { inner })
    }
}

impl WebRtcTransport {
    pub(crate) fn new(
        id: TransportId,
        data: WebRtcTransportData,
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
                WeakResource::WebRtcTransport(WeakWebRtcTransport {
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
                        Notification::IceStateChange { ice_state } => {
                            if let Some(inner) = inner_weak.upgrade() {
                                inner.data.lock().ice_state = ice_state;
                            }
                            handlers.ice_state_change.call(|callback| {
                                callback(ice_state);
                            });
                            event_bus.emit(
                                EventKind::TransportIceStateChange,
                                local_id,
                                serde_json::to_value(ice_state).ok(),
                            );
                        }
                        Notification::IceSelectedTupleChange { ice_selected_tuple } => {
                            if let Some(inner) = inner_weak.upgrade() {
                                inner.data.lock().ice_selected_tuple = Some(ice_selected_tuple);
                            }
                            handlers.ice_selected_tuple_change.call(|callback| {
                                callback(&ice_selected_tuple);
                            });
                            event_bus.emit(
                                EventKind::TransportIceSelectedTupleChange,
                                local_id,
                                serde_json::to_value(ice_selected_tuple).ok(),
                            );
                        }
                        Notification::DtlsStateChange {
                            dtls_state,
                            dtls_remote_cert,
                        } => {
                            if let Some(inner) = inner_weak.upgrade() {
                                let mut data = inner.data.lock();
                                data.dtls_state = dtls_state;
                                if dtls_remote_cert.is_some() {
                                    data.dtls_remote_cert = dtls_remote_cert;
                                }
                            }
                            handlers.dtls_state_change.call(|callback| {
                                callback(dtls_state);
                            });
                            event_bus.emit(
                                EventKind::TransportDtlsStateChange,
                                local_id,
                                serde_json::to_value(dtls_state).ok(),
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

    /// ICE role of the transport.
    pub fn ice_role(&self) -> IceRole {
        self.inner.data.lock().ice_role
    }

    /// ICE parameters to hand to the client.
    pub fn ice_parameters(&self) -> IceParameters {
        self.inner.data.lock().ice_parameters.clone()
    }

    /// ICE candidates to hand to the client.
    pub fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.inner.data.lock().ice_candidates.clone()
    }

    /// Current ICE state.
    pub fn ice_state(&self) -> IceState {
        self.inner.data.lock().ice_state
    }

    /// Selected ICE tuple, once connectivity checks succeeded.
    pub fn ice_selected_tuple(&self) -> Option<TransportTuple> {
        self.inner.data.lock().ice_selected_tuple
    }

    /// Local DTLS parameters to hand to the client.
    pub fn dtls_parameters(&self) -> DtlsParameters {
        self.inner.data.lock().dtls_parameters.clone()
    }

    /// Current DTLS state.
    pub fn dtls_state(&self) -> DtlsState {
        self.inner.data.lock().dtls_state
    }

    /// Negotiated SCTP parameters, if SCTP was enabled.
    pub fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.inner.data.lock().sctp_parameters
    }

    /// Current SCTP state.
    pub fn sctp_state(&self) -> Option<SctpState> {
        self.inner.data.lock().sctp_state
    }

    /// Provide the transport with the remote DTLS parameters.
    pub async fn connect(
        &self,
        remote_parameters: WebRtcTransportRemoteParameters,
    ) -> Result<(), RequestError> {
        debug!("connect()");

        let response = self
            .inner
            .router
            .worker()
            .channel()
            .request(TransportConnectWebRtcRequest {
                internal: self.get_internal(),
                data: TransportConnectWebRtcData {
                    dtls_parameters: remote_parameters.dtls_parameters,
                },
            })
            .await?;

        self.inner.data.lock().dtls_parameters.role = response.dtls_local_role;
        self.inner.router.event_bus().emit(
            EventKind::TransportUpdated,
            self.inner.local_id,
            None,
        );

        Ok(())
    }

    /// Restart ICE, returning fresh ICE parameters for the client.
    pub async fn restart_ice(&self) -> Result<IceParameters, RequestError> {
        debug!("restart_ice()");

        let response = self
            .inner
            .router
            .worker()
            .channel()
            .request(TransportRestartIceRequest {
                internal: self.get_internal(),
            })
            .await?;

        self.inner.data.lock().ice_parameters = response.ice_parameters.clone();
        self.inner.router.event_bus().emit(
            EventKind::TransportUpdated,
            self.inner.local_id,
            None,
        );

        Ok(response.ice_parameters)
    }

    pub fn on_ice_state_change<F: Fn(IceState) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.ice_state_change.add(Box::new(callback))
    }

    pub fn on_ice_selected_tuple_change<F: Fn(&TransportTuple) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .ice_selected_tuple_change
            .add(Box::new(callback))
    }

    pub fn on_dtls_state_change<F: Fn(DtlsState) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .dtls_state_change
            .add(Box::new(callback))
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

    pub fn downgrade(&self) -> WeakWebRtcTransport {
        WeakWebRtcTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
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
impl TransportGeneric<WebRtcTransportDump, WebRtcTransportStat> for WebRtcTransport {
    async fn dump(&self) -> Result<WebRtcTransportDump, RequestError> {
        debug!("dump()");

        self.dump_impl().await
    }

    async fn get_stats(&self) -> Result<Vec<WebRtcTransportStat>, RequestError> {
        debug!("get_stats()");

        self.get_stats_impl().await
    }
}

impl TransportImpl<WebRtcTransportDump, WebRtcTransportStat> for WebRtcTransport {
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
