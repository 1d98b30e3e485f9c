//! A router is a logical media session inside a worker. It owns transports
//! and RTP observers, optionally backs a room, and brokers consumers onto
//! producers.

pub mod consumer;
pub mod data_consumer;
pub mod data_producer;
pub mod direct_transport;
pub mod pipe_transport;
pub mod plain_transport;
pub mod producer;
pub mod rtp_observer;
pub mod transport;
pub mod webrtc_transport;

use crate::data_structures::{AppData, RouterInternal, RtpObserverInternal, TransportInternal};
use crate::events::{EventBus, EventKind};
use crate::messages::{
    RouterCloseRequest, RouterCreateActiveSpeakerObserverData,
    RouterCreateActiveSpeakerObserverRequest, RouterCreateAudioLevelObserverData,
    RouterCreateAudioLevelObserverRequest, RouterCreateDirectTransportData,
    RouterCreateDirectTransportRequest, RouterCreatePipeTransportData,
    RouterCreatePipeTransportRequest, RouterCreatePlainTransportData,
    RouterCreatePlainTransportRequest, RouterCreateWebrtcTransportData,
    RouterCreateWebrtcTransportRequest, RouterDumpRequest,
};
use crate::ortc;
use crate::registry::{Registry, Resource, ResourceId, WeakResource};
use crate::rtp_parameters::{RtpCapabilities, RtpCodecCapability};
use crate::worker::{RequestError, Worker};
use async_executor::Executor;
use direct_transport::{DirectTransport, DirectTransportOptions};
use event_listener_primitives::{BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use pipe_transport::{PipeTransport, PipeTransportOptions};
use plain_transport::{PlainTransport, PlainTransportOptions};
use producer::ProducerId;
use rtp_observer::{
    ActiveSpeakerObserver, ActiveSpeakerObserverOptions, AudioLevelObserver,
    AudioLevelObserverOptions, RtpObserverId,
};
use serde::{Deserialize, Serialize};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use transport::{Transport, TransportId, SCTP_STREAMS_MAX};
use webrtc_transport::{WebRtcTransport, WebRtcTransportOptions};

uuid_based_wrapper_type!(
    /// Router identifier.
    RouterId
);

/// Router creation options.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct RouterOptions {
    /// Codecs the router will be able to route; matched against the
    /// supported-capabilities table.
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Custom application data.
    pub app_data: AppData,
}

impl RouterOptions {
    pub fn new(media_codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            media_codecs,
            app_data: AppData::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct RouterDump {
    pub id: RouterId,
    pub transport_ids: Vec<TransportId>,
    pub rtp_observer_ids: Vec<RtpObserverId>,
}

/// Error creating a transport or observer on a router.
#[derive(Debug, Error)]
pub enum CreateTransportError {
    #[error("request to worker failed: {0}")]
    Request(RequestError),
    /// The worker reported an SCTP stream count outside the allowed
    /// bounds; treated as a protocol violation.
    #[error("worker reported invalid SCTP stream count {0}")]
    InvalidSctpStreamCount(u16),
}

enum WeakAnyTransport {
    WebRtc(webrtc_transport::WeakWebRtcTransport),
    Plain(plain_transport::WeakPlainTransport),
    Pipe(pipe_transport::WeakPipeTransport),
    Direct(direct_transport::WeakDirectTransport),
}

impl WeakAnyTransport {
    fn close_from_router(&self) {
        match self {
            WeakAnyTransport::WebRtc(weak) => {
                if let Some(transport) = weak.upgrade() {
                    transport.close_from_router();
                }
            }
            WeakAnyTransport::Plain(weak) => {
                if let Some(transport) = weak.upgrade() {
                    transport.close_from_router();
                }
            }
            WeakAnyTransport::Pipe(weak) => {
                if let Some(transport) = weak.upgrade() {
                    transport.close_from_router();
                }
            }
            WeakAnyTransport::Direct(weak) => {
                if let Some(transport) = weak.upgrade() {
                    transport.close_from_router();
                }
            }
        }
    }
}

enum WeakAnyObserver {
    AudioLevel(rtp_observer::WeakAudioLevelObserver),
    ActiveSpeaker(rtp_observer::WeakActiveSpeakerObserver),
}

impl WeakAnyObserver {
    fn close_from_router(&self) {
        match self {
            WeakAnyObserver::AudioLevel(weak) => {
                if let Some(observer) = weak.upgrade() {
                    observer.close_from_router();
                }
            }
            WeakAnyObserver::ActiveSpeaker(weak) => {
                if let Some(observer) = weak.upgrade() {
                    observer.close_from_router();
                }
            }
        }
    }
}

#[derive(Default)]
struct Handlers {
    closed: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: RouterId,
    local_id: ResourceId,
    rtp_capabilities: RtpCapabilities,
    app_data: AppData,
    worker: Worker,
    transports: Mutex<Vec<WeakAnyTransport>>,
    rtp_observers: Mutex<Vec<WeakAnyObserver>>,
    /// Closes the room bound to this router, if any; installed by the
    /// room domain.
    room_closer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    handlers: Handlers,
    closed: AtomicBool,
    _worker_dead_handler: Mutex<Option<HandlerId>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close(true);
    }
}

impl Inner {
    /// Tears the router down: room first, then transports and observers
    /// in reverse creation order, then the router itself.
    fn close(&self, send_request: bool) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close() [id:{}]", self.id);

            self.worker.registry().unregister(self.local_id);

            if let Some(room_closer) = self.room_closer.lock().take() {
                room_closer();
            }

            let transports = mem::take(&mut *self.transports.lock());
            for transport in transports.iter().rev() {
                transport.close_from_router();
            }

            let rtp_observers = mem::take(&mut *self.rtp_observers.lock());
            for observer in rtp_observers.iter().rev() {
                observer.close_from_router();
            }

            self.handlers.closed.call_simple();
            self.worker
                .event_bus()
                .emit(EventKind::RouterClosed, self.local_id, None);

            if send_request {
                let channel = self.worker.channel().clone();
                let request = RouterCloseRequest {
                    internal: RouterInternal { router_id: self.id },
                };
                self.worker
                    .executor()
                    .spawn(async move {
                        if let Err(error) = channel.request(request).await {
                            error!("router closing failed: {}", error);
                        }
                    })
                    .detach();
            }

            self.worker.adjust_load_score(-1);
        }
    }
}

/// A router; the unit a room's media is switched through.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

/// Weak handle to a router.
#[derive(Clone)]
pub struct WeakRouter {
    inner: Weak<Inner>,
}

impl WeakRouter {
    pub fn upgrade(&self) -> Option<Router> {
        self.inner.upgrade().map(|inner| Router { inner })
    }
}

impl Router {
    pub(crate) fn new(
        id: RouterId,
        rtp_capabilities: RtpCapabilities,
        app_data: AppData,
        worker: Worker,
    ) -> Self {
        debug!("new()");

        let registry = worker.registry().clone();
        let inner = Arc::new_cyclic(|inner_weak: &Weak<Inner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::Router(WeakRouter {
                    inner: inner_weak.clone(),
                }),
            );
            Inner {
                id,
                local_id,
                rtp_capabilities,
                app_data,
                worker,
                transports: Mutex::new(Vec::new()),
                rtp_observers: Mutex::new(Vec::new()),
                room_closer: Mutex::new(None),
                handlers: Handlers::default(),
                closed: AtomicBool::new(false),
                _worker_dead_handler: Mutex::new(None),
            }
        });
        let router = Self { inner };

        // A dying worker takes all its routers with it; pending commands
        // already completed with an error at that point, so nothing is
        // sent.
        {
            let inner_weak = Arc::downgrade(&router.inner);
            let handler_id = router.inner.worker.on_dead(move |_exit_status| {
                if let Some(inner) = inner_weak.upgrade() {
                    inner.close(false);
                }
            });
            router
                .inner
                ._worker_dead_handler
                .lock()
                .replace(handler_id);
        }

        router.inner.worker.adjust_load_score(1);
        router
            .inner
            .worker
            .event_bus()
            .emit(EventKind::RouterCreated, router.inner.local_id, None);

        router
    }

    /// Router id.
    pub fn id(&self) -> RouterId {
        self.inner.id
    }

    /// Local resource id.
    pub fn local_id(&self) -> ResourceId {
        self.inner.local_id
    }

    /// The worker this router lives on.
    pub fn worker(&self) -> &Worker {
        &self.inner.worker
    }

    /// RTP capabilities negotiated for this router.
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.inner.rtp_capabilities
    }

    /// App custom data.
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    /// Whether the router is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn registry(&self) -> &Registry {
        self.inner.worker.registry()
    }

    pub(crate) fn event_bus(&self) -> &EventBus {
        self.inner.worker.event_bus()
    }

    pub(crate) fn executor(&self) -> &Arc<Executor<'static>> {
        self.inner.worker.executor()
    }

    /// Installs the callback closing the room bound to this router; ran
    /// first on router close.
    pub(crate) fn set_room_closer<F: FnOnce() + Send + 'static>(&self, callback: F) {
        self.inner.room_closer.lock().replace(Box::new(callback));
    }

    pub(crate) fn clear_room_closer(&self) {
        self.inner.room_closer.lock().take();
    }

    /// Dump router state.
    #[doc(hidden)]
    pub async fn dump(&self) -> Result<RouterDump, RequestError> {
        debug!("dump()");

        self.inner
            .worker
            .channel()
            .request(RouterDumpRequest {
                internal: RouterInternal { router_id: self.inner.id },
            })
            .await
    }

    /// Whether an endpoint with the given capabilities can consume the
    /// given producer.
    pub fn can_consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        match self.registry().get_by_uuid(&uuid::Uuid::from(*producer_id)) {
            Some(Resource::Producer(producer)) => {
                ortc::can_consume(producer.consumable_rtp_parameters(), rtp_capabilities)
            }
            _ => false,
        }
    }

    /// Create a WebRTC transport.
    pub async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<WebRtcTransport, CreateTransportError> {
        debug!("create_webrtc_transport()");

        let transport_id = TransportId::new();
        let data = self
            .inner
            .worker
            .channel()
            .request(RouterCreateWebrtcTransportRequest {
                internal: TransportInternal {
                    router_id: self.inner.id,
                    transport_id,
                },
                data: RouterCreateWebrtcTransportData {
                    listen_ips: options.listen_ips.to_vec(),
                    enable_udp: options.enable_udp,
                    enable_tcp: options.enable_tcp,
                    prefer_udp: options.prefer_udp,
                    prefer_tcp: options.prefer_tcp,
                    initial_available_outgoing_bitrate: options
                        .initial_available_outgoing_bitrate,
                    enable_sctp: options.enable_sctp,
                    num_sctp_streams: options.num_sctp_streams,
                    max_sctp_message_size: options.max_sctp_message_size,
                    sctp_send_buffer_size: options.sctp_send_buffer_size,
                    is_data_channel: true,
                },
            })
            .await
            .map_err(CreateTransportError::Request)?;

        let sctp_max_slots = validate_sctp_slots(
            data.sctp_parameters.as_ref().map(|sctp| sctp.mis),
        )?;

        let transport = WebRtcTransport::new(
            transport_id,
            data,
            sctp_max_slots,
            options.app_data,
            self.clone(),
        );
        self.inner
            .transports
            .lock()
            .push(WeakAnyTransport::WebRtc(transport.downgrade()));

        Ok(transport)
    }

    /// Create a plain (RTP over UDP) transport.
    pub async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<PlainTransport, CreateTransportError> {
        debug!("create_plain_transport()");

        let transport_id = TransportId::new();
        let data = self
            .inner
            .worker
            .channel()
            .request(RouterCreatePlainTransportRequest {
                internal: TransportInternal {
                    router_id: self.inner.id,
                    transport_id,
                },
                data: RouterCreatePlainTransportData {
                    listen_ip: options.listen_ip,
                    rtcp_mux: options.rtcp_mux,
                    comedia: options.comedia,
                    enable_sctp: options.enable_sctp,
                    num_sctp_streams: options.num_sctp_streams,
                    max_sctp_message_size: options.max_sctp_message_size,
                    sctp_send_buffer_size: options.sctp_send_buffer_size,
                    enable_srtp: options.enable_srtp,
                    srtp_crypto_suite: options.srtp_crypto_suite,
                    is_data_channel: false,
                },
            })
            .await
            .map_err(CreateTransportError::Request)?;

        let sctp_max_slots = validate_sctp_slots(
            data.sctp_parameters.as_ref().map(|sctp| sctp.mis),
        )?;

        let transport = PlainTransport::new(
            transport_id,
            data,
            sctp_max_slots,
            options.app_data,
            self.clone(),
        );
        self.inner
            .transports
            .lock()
            .push(WeakAnyTransport::Plain(transport.downgrade()));

        Ok(transport)
    }

    /// Create a pipe transport for router-to-router tunnels.
    pub async fn create_pipe_transport(
        &self,
        options: PipeTransportOptions,
    ) -> Result<PipeTransport, CreateTransportError> {
        debug!("create_pipe_transport()");

        let transport_id = TransportId::new();
        let data = self
            .inner
            .worker
            .channel()
            .request(RouterCreatePipeTransportRequest {
                internal: TransportInternal {
                    router_id: self.inner.id,
                    transport_id,
                },
                data: RouterCreatePipeTransportData {
                    listen_ip: options.listen_ip,
                    enable_sctp: options.enable_sctp,
                    num_sctp_streams: options.num_sctp_streams,
                    max_sctp_message_size: options.max_sctp_message_size,
                    sctp_send_buffer_size: options.sctp_send_buffer_size,
                    enable_rtx: options.enable_rtx,
                    enable_srtp: options.enable_srtp,
                    is_data_channel: false,
                },
            })
            .await
            .map_err(CreateTransportError::Request)?;

        let sctp_max_slots = validate_sctp_slots(
            data.sctp_parameters.as_ref().map(|sctp| sctp.mis),
        )?;

        let transport = PipeTransport::new(
            transport_id,
            data,
            sctp_max_slots,
            options.app_data,
            self.clone(),
        );
        self.inner
            .transports
            .lock()
            .push(WeakAnyTransport::Pipe(transport.downgrade()));

        Ok(transport)
    }

    /// Create a direct (in-process) transport.
    pub async fn create_direct_transport(
        &self,
        options: DirectTransportOptions,
    ) -> Result<DirectTransport, CreateTransportError> {
        debug!("create_direct_transport()");

        let transport_id = TransportId::new();
        let data = self
            .inner
            .worker
            .channel()
            .request(RouterCreateDirectTransportRequest {
                internal: TransportInternal {
                    router_id: self.inner.id,
                    transport_id,
                },
                data: RouterCreateDirectTransportData {
                    direct: true,
                    max_message_size: options.max_message_size,
                },
            })
            .await
            .map_err(CreateTransportError::Request)?;

        let transport =
            DirectTransport::new(transport_id, data, options.app_data, self.clone());
        self.inner
            .transports
            .lock()
            .push(WeakAnyTransport::Direct(transport.downgrade()));

        Ok(transport)
    }

    /// Create an audio level observer on this router.
    pub async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> Result<AudioLevelObserver, CreateTransportError> {
        debug!("create_audio_level_observer()");

        let rtp_observer_id = RtpObserverId::new();
        self.inner
            .worker
            .channel()
            .request(RouterCreateAudioLevelObserverRequest {
                internal: RtpObserverInternal {
                    router_id: self.inner.id,
                    rtp_observer_id,
                },
                data: RouterCreateAudioLevelObserverData {
                    max_entries: options.max_entries,
                    threshold: options.threshold,
                    interval: options.interval,
                },
            })
            .await
            .map_err(CreateTransportError::Request)?;

        let observer =
            AudioLevelObserver::new(rtp_observer_id, options.app_data, self.clone());
        self.inner
            .rtp_observers
            .lock()
            .push(WeakAnyObserver::AudioLevel(observer.downgrade()));

        Ok(observer)
    }

    /// Create an active speaker observer on this router.
    pub async fn create_active_speaker_observer(
        &self,
        options: ActiveSpeakerObserverOptions,
    ) -> Result<ActiveSpeakerObserver, CreateTransportError> {
        debug!("create_active_speaker_observer()");

        let rtp_observer_id = RtpObserverId::new();
        self.inner
            .worker
            .channel()
            .request(RouterCreateActiveSpeakerObserverRequest {
                internal: RtpObserverInternal {
                    router_id: self.inner.id,
                    rtp_observer_id,
                },
                data: RouterCreateActiveSpeakerObserverData {
                    interval: options.interval,
                },
            })
            .await
            .map_err(CreateTransportError::Request)?;

        let observer =
            ActiveSpeakerObserver::new(rtp_observer_id, options.app_data, self.clone());
        self.inner
            .rtp_observers
            .lock()
            .push(WeakAnyObserver::ActiveSpeaker(observer.downgrade()));

        Ok(observer)
    }

    /// Removes a transport from the child list; part of the transport's
    /// own close.
    pub(crate) fn unregister_transport(&self, id: TransportId) {
        self.inner.transports.lock().retain(|weak| {
            let live_id = match weak {
                WeakAnyTransport::WebRtc(weak) => weak.upgrade().map(|t| t.id()),
                WeakAnyTransport::Plain(weak) => weak.upgrade().map(|t| t.id()),
                WeakAnyTransport::Pipe(weak) => weak.upgrade().map(|t| t.id()),
                WeakAnyTransport::Direct(weak) => weak.upgrade().map(|t| t.id()),
            };
            match live_id {
                Some(live_id) => live_id != id,
                None => false,
            }
        });
    }

    /// Removes an observer from the child list; part of the observer's
    /// own close.
    pub(crate) fn unregister_rtp_observer(&self, id: RtpObserverId) {
        self.inner.rtp_observers.lock().retain(|weak| {
            let live_id = match weak {
                WeakAnyObserver::AudioLevel(weak) => weak.upgrade().map(|o| o.id()),
                WeakAnyObserver::ActiveSpeaker(weak) => weak.upgrade().map(|o| o.id()),
            };
            match live_id {
                Some(live_id) => live_id != id,
                None => false,
            }
        });
    }

    /// Callback called when the router is closed for whatever reason.
    pub fn on_closed<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.closed.add(Box::new(callback))
    }

    /// Close the router and everything on it.
    pub fn close(&self) {
        self.inner.close(true);
    }

    pub fn downgrade(&self) -> WeakRouter {
        WeakRouter {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

fn validate_sctp_slots(mis: Option<u16>) -> Result<u16, CreateTransportError> {
    match mis {
        Some(mis) if mis > SCTP_STREAMS_MAX => {
            Err(CreateTransportError::InvalidSctpStreamCount(mis))
        }
        Some(mis) => Ok(mis),
        None => Ok(0),
    }
}
