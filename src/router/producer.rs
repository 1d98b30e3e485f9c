//! A producer represents an audio or video stream injected into a router
//! by an endpoint through a transport.

use crate::data_structures::{AppData, EventDirection, ProducerInternal};
use crate::events::EventKind;
use crate::messages::{
    ProducerCloseRequest, ProducerDumpRequest, ProducerEnableTraceEventData,
    ProducerEnableTraceEventRequest, ProducerGetStatsRequest, ProducerPauseRequest,
    ProducerResumeRequest,
};
use crate::registry::{ResourceId, WeakResource};
use crate::router::transport::{Transport, TransportChildId, TransportId};
use crate::router::Router;
use crate::rtp_parameters::{MediaKind, MimeType, RtpParameters};
use crate::worker::{Channel, PayloadChannel, RequestError, SubscriptionHandler};
use async_executor::Executor;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

uuid_based_wrapper_type!(
    /// Producer identifier.
    ProducerId
);

/// Producer options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ProducerOptions {
    /// Media kind.
    pub kind: MediaKind,
    /// RTP parameters describing what the endpoint sends.
    pub rtp_parameters: RtpParameters,
    /// Whether the producer starts paused. Default false.
    pub paused: bool,
    /// Minimal interval between video key frame requests (ms).
    pub key_frame_request_delay: Option<u32>,
    /// Custom application data.
    pub app_data: AppData,
}

impl ProducerOptions {
    pub fn new(kind: MediaKind, rtp_parameters: RtpParameters) -> Self {
        Self {
            kind,
            rtp_parameters,
            paused: false,
            key_frame_request_delay: None,
            app_data: AppData::default(),
        }
    }
}

/// Producer type as determined by the worker from the RTP parameters.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    /// A single RTP stream without spatial or temporal layers.
    Simple,
    /// Multiple RTP streams, each with one or more temporal layers.
    Simulcast,
    /// A single RTP stream with spatial and temporal layers.
    #[serde(rename = "svc")]
    Svc,
}

/// Score of a single RTP stream of the producer.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerScore {
    /// SSRC of the stream.
    pub ssrc: u32,
    /// RID of the stream, when simulcast is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    /// Transmission quality from 0 (worst) to 10 (best).
    pub score: u8,
}

/// Camera orientation as signaled by the producing endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerVideoOrientation {
    pub camera: bool,
    pub flip: bool,
    pub rotation: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
#[non_exhaustive]
pub struct ProducerDump {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
    pub r#type: ProducerType,
    pub rtp_parameters: RtpParameters,
    pub trace_event_types: String,
}

/// RTC statistics of the producer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ProducerStat {
    // `type` field is present in worker, but ignored here
    pub timestamp: u64,
    pub ssrc: u32,
    pub rtx_ssrc: Option<u32>,
    pub rid: Option<String>,
    pub kind: MediaKind,
    pub mime_type: MimeType,
    pub packets_lost: u32,
    pub fraction_lost: u8,
    pub packets_discarded: usize,
    pub packets_retransmitted: usize,
    pub packets_repaired: usize,
    pub nack_count: usize,
    pub nack_packet_count: usize,
    pub pli_count: usize,
    pub fir_count: usize,
    pub score: u8,
    pub packet_count: usize,
    pub byte_count: usize,
    pub bitrate: u32,
    pub round_trip_time: Option<u32>,
}

/// Types of producer trace events.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerTraceEventType {
    /// RTP packet.
    RTP,
    /// RTP video keyframe packet.
    KeyFrame,
    /// RTCP NACK packet.
    NACK,
    /// RTCP PLI packet.
    PLI,
    /// RTCP FIR packet.
    FIR,
}

/// 'trace' event data.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProducerTraceEventData {
    RTP {
        timestamp: u64,
        direction: EventDirection,
        info: Value,
    },
    KeyFrame {
        timestamp: u64,
        direction: EventDirection,
        info: Value,
    },
    NACK {
        timestamp: u64,
        direction: EventDirection,
        info: Value,
    },
    PLI {
        timestamp: u64,
        direction: EventDirection,
        info: Value,
    },
    FIR {
        timestamp: u64,
        direction: EventDirection,
        info: Value,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", content = "data")]
enum Notification {
    Score(Vec<ProducerScore>),
    VideoOrientationChange(ProducerVideoOrientation),
    Trace(ProducerTraceEventData),
}

#[derive(Default)]
struct Handlers {
    pause: Bag<Box<dyn Fn() + Send + Sync>>,
    resume: Bag<Box<dyn Fn() + Send + Sync>>,
    score: Bag<Box<dyn Fn(&[ProducerScore]) + Send + Sync>>,
    video_orientation_change: Bag<Box<dyn Fn(ProducerVideoOrientation) + Send + Sync>>,
    trace: Bag<Box<dyn Fn(&ProducerTraceEventData) + Send + Sync>>,
    transport_close: BagOnce<Box<dyn FnOnce() + Send>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: ProducerId,
    local_id: ResourceId,
    kind: MediaKind,
    r#type: ProducerType,
    rtp_parameters: RtpParameters,
    consumable_rtp_parameters: RtpParameters,
    paused: Mutex<bool>,
    score: Arc<Mutex<Vec<ProducerScore>>>,
    executor: Arc<Executor<'static>>,
    channel: Channel,
    #[allow(dead_code)]
    payload_channel: PayloadChannel,
    handlers: Arc<Handlers>,
    app_data: AppData,
    transport: Arc<dyn Transport>,
    router: Router,
    direct: bool,
    closed: AtomicBool,
    _subscription_handler: Mutex<Option<SubscriptionHandler>>,
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
                    .remove_child(TransportChildId::Producer(self.id));
            }

            if send_request {
                let channel = self.channel.clone();
                let request = ProducerCloseRequest {
                    internal: ProducerInternal {
                        router_id: self.transport.router_id(),
                        transport_id: self.transport.id(),
                        producer_id: self.id,
                    },
                };
                let transport = Arc::clone(&self.transport);
                self.executor
                    .spawn(async move {
                        if let Err(error) = channel.request(request).await {
                            error!("producer closing failed: {}", error);
                        }

                        drop(transport);
                    })
                    .detach();
            }
        }
    }
}

/// A producer; an inbound media stream on a transport.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

/// Weak handle to a producer; used for the consumer back-edge.
#[derive(Clone)]
pub struct WeakProducer {
    inner: Weak<Inner>,
}

impl WeakProducer {
    pub fn upgrade(&self) -> Option<Producer> {
        self.inner.upgrade().map(|inner| Producer { inner })
    }
}

impl Producer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ProducerId,
        kind: MediaKind,
        r#type: ProducerType,
        rtp_parameters: RtpParameters,
        consumable_rtp_parameters: RtpParameters,
        paused: bool,
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
        let score = Arc::<Mutex<Vec<ProducerScore>>>::default();
        let registry = router.registry().clone();

        let inner = Arc::new_cyclic(|inner_weak: &Weak<Inner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::Producer(WeakProducer {
                    inner: inner_weak.clone(),
                }),
            );
            Inner {
                id,
                local_id,
                kind,
                r#type,
                rtp_parameters,
                consumable_rtp_parameters,
                paused: Mutex::new(paused),
                score: Arc::clone(&score),
                executor,
                channel,
                payload_channel,
                handlers,
                app_data,
                transport,
                router,
                direct,
                closed: AtomicBool::new(false),
                _subscription_handler: Mutex::new(None),
                _on_transport_close_handler: Mutex::new(None),
            }
        });
        let producer = Self { inner };

        let subscription_handler = {
            let handlers = Arc::clone(&producer.inner.handlers);
            let score = Arc::clone(&score);
            let event_bus = producer.inner.router.event_bus().clone();
            let local_id = producer.inner.local_id;
            producer.inner.channel.subscribe_to_notifications(
                id.to_string(),
                move |notification| match serde_json::from_value::<Notification>(notification) {
                    Ok(notification) => match notification {
                        Notification::Score(producer_score) => {
                            *score.lock() = producer_score.clone();
                            handlers.score.call(|callback| {
                                callback(&producer_score);
                            });
                            event_bus.emit(
                                EventKind::ResourceScore,
                                local_id,
                                serde_json::to_value(&producer_score).ok(),
                            );
                        }
                        Notification::VideoOrientationChange(orientation) => {
                            handlers.video_orientation_change.call(|callback| {
                                callback(orientation);
                            });
                            event_bus.emit(
                                EventKind::ProducerVideoOrientationChange,
                                local_id,
                                serde_json::to_value(orientation).ok(),
                            );
                        }
                        Notification::Trace(trace_event_data) => {
                            handlers.trace.call(|callback| {
                                callback(&trace_event_data);
                            });
                        }
                    },
                    Err(error) => {
                        error!("failed to parse producer notification: {}", error);
                    }
                },
            )
        };
        producer
            .inner
            ._subscription_handler
            .lock()
            .replace(subscription_handler);

        let on_transport_close_handler = {
            let inner_weak = Arc::downgrade(&producer.inner);
            producer.inner.transport.on_closed(Box::new(move || {
                if let Some(inner) = inner_weak.upgrade() {
                    inner.handlers.transport_close.call_simple();
                    inner.close(false, false);
                }
            }))
        };
        producer
            .inner
            ._on_transport_close_handler
            .lock()
            .replace(on_transport_close_handler);

        producer
            .inner
            .router
            .event_bus()
            .emit(EventKind::ProducerCreated, producer.inner.local_id, None);

        producer
    }

    /// Producer id.
    pub fn id(&self) -> ProducerId {
        self.inner.id
    }

    /// Local resource id.
    pub fn local_id(&self) -> ResourceId {
        self.inner.local_id
    }

    /// Id of the transport carrying this producer.
    pub fn transport_id(&self) -> TransportId {
        self.inner.transport.id()
    }

    /// Media kind.
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    /// Producer type.
    pub fn r#type(&self) -> ProducerType {
        self.inner.r#type
    }

    /// RTP parameters as supplied by the producing endpoint.
    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.inner.rtp_parameters
    }

    /// Router-internal parameters consumers are synthesized from.
    pub fn consumable_rtp_parameters(&self) -> &RtpParameters {
        &self.inner.consumable_rtp_parameters
    }

    /// Whether the producer is paused.
    pub fn paused(&self) -> bool {
        *self.inner.paused.lock()
    }

    /// Last reported per-stream scores.
    pub fn score(&self) -> Vec<ProducerScore> {
        self.inner.score.lock().clone()
    }

    /// Whether this producer lives on a direct transport.
    pub fn direct(&self) -> bool {
        self.inner.direct
    }

    /// Custom application data.
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    /// Whether the producer is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Dump producer state.
    #[doc(hidden)]
    pub async fn dump(&self) -> Result<ProducerDump, RequestError> {
        debug!("dump()");

        self.inner
            .channel
            .request(ProducerDumpRequest {
                internal: self.get_internal(),
            })
            .await
    }

    /// Producer statistics.
    pub async fn get_stats(&self) -> Result<Vec<ProducerStat>, RequestError> {
        debug!("get_stats()");

        self.inner
            .channel
            .request(ProducerGetStatsRequest {
                internal: self.get_internal(),
            })
            .await
    }

    /// Pauses the producer; no RTP is forwarded to its consumers.
    ///
    /// Idempotent: the pause event fires only on an actual state change.
    pub async fn pause(&self) -> Result<(), RequestError> {
        debug!("pause()");

        self.inner
            .channel
            .request(ProducerPauseRequest {
                internal: self.get_internal(),
            })
            .await?;

        let mut paused = self.inner.paused.lock();
        let was_paused = *paused;
        *paused = true;
        drop(paused);

        if !was_paused {
            self.inner.handlers.pause.call_simple();
            self.inner
                .router
                .event_bus()
                .emit(EventKind::ProducerPause, self.inner.local_id, None);
        }

        Ok(())
    }

    /// Resumes the producer.
    ///
    /// Idempotent: the resume event fires only on an actual state change.
    pub async fn resume(&self) -> Result<(), RequestError> {
        debug!("resume()");

        self.inner
            .channel
            .request(ProducerResumeRequest {
                internal: self.get_internal(),
            })
            .await?;

        let mut paused = self.inner.paused.lock();
        let was_paused = *paused;
        *paused = false;
        drop(paused);

        if was_paused {
            self.inner.handlers.resume.call_simple();
            self.inner
                .router
                .event_bus()
                .emit(EventKind::ProducerResume, self.inner.local_id, None);
        }

        Ok(())
    }

    /// Instructs the worker to emit trace events for this producer.
    pub async fn enable_trace_event(
        &self,
        types: Vec<ProducerTraceEventType>,
    ) -> Result<(), RequestError> {
        debug!("enable_trace_event()");

        self.inner
            .channel
            .request(ProducerEnableTraceEventRequest {
                internal: self.get_internal(),
                data: ProducerEnableTraceEventData { types },
            })
            .await
    }

    /// Callback called when the producer is paused.
    pub fn on_pause<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.pause.add(Box::new(callback))
    }

    /// Callback called when the producer is resumed.
    pub fn on_resume<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.resume.add(Box::new(callback))
    }

    /// Callback called when the producer score changes.
    pub fn on_score<F: Fn(&[ProducerScore]) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.score.add(Box::new(callback))
    }

    /// Callback called when the producing endpoint rotates its camera.
    pub fn on_video_orientation_change<F: Fn(ProducerVideoOrientation) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .video_orientation_change
            .add(Box::new(callback))
    }

    /// See [`Producer::enable_trace_event`].
    pub fn on_trace<F: Fn(&ProducerTraceEventData) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.trace.add(Box::new(callback))
    }

    /// Callback called when the transport this producer belongs to is
    /// closed; the producer itself is closed too.
    pub fn on_transport_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.transport_close.add(Box::new(callback))
    }

    /// Callback called when the producer is closed for whatever reason.
    ///
    /// The callback is invoked in place if the producer is already closed.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    /// Close the producer; every consumer bound to it closes first.
    pub fn close(&self) {
        self.inner.close(true, true);
    }

    pub(crate) fn close_from_transport(&self) {
        self.inner.close(false, false);
    }

    pub fn downgrade(&self) -> WeakProducer {
        WeakProducer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn get_internal(&self) -> ProducerInternal {
        ProducerInternal {
            router_id: self.inner.transport.router_id(),
            transport_id: self.inner.transport.id(),
            producer_id: self.inner.id,
        }
    }
}
