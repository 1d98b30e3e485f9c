//! A consumer represents a media stream forwarded from a producer to an
//! endpoint over a transport of the same router.

use crate::data_structures::{AppData, ConsumerInternal, EventDirection};
use crate::events::EventKind;
use crate::messages::{
    ConsumerCloseRequest, ConsumerDumpRequest, ConsumerEnableTraceEventData,
    ConsumerEnableTraceEventRequest, ConsumerGetStatsRequest, ConsumerPauseRequest,
    ConsumerRequestKeyFrameRequest, ConsumerResumeRequest, ConsumerSetPreferredLayersRequest,
    ConsumerSetPriorityData, ConsumerSetPriorityRequest,
};
use crate::producer::{Producer, ProducerId, ProducerStat, ProducerType, WeakProducer};
use crate::registry::{ResourceId, WeakResource};
use crate::router::transport::{Transport, TransportChildId, TransportId};
use crate::router::Router;
use crate::rtp_parameters::{MediaKind, MimeType, RtpCapabilities, RtpParameters};
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
    /// Consumer identifier.
    ConsumerId
);

/// Spatial and temporal layers of a consumer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    /// The spatial layer index (from 0 to N).
    pub spatial_layer: u8,
    /// The temporal layer index (from 0 to N).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal_layer: Option<u8>,
}

/// Score of the consumer and its producer.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerScore {
    /// Score of the RTP stream of the consumer (0-10).
    pub score: u8,
    /// Score of the currently selected RTP stream of the producer (0-10).
    pub producer_score: u8,
    /// Scores of all producer RTP streams, ordered by encoding.
    #[serde(default)]
    pub producer_scores: Vec<u8>,
}

/// Consumer options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConsumerOptions {
    /// The producer to consume.
    pub producer_id: ProducerId,
    /// RTP capabilities of the consuming endpoint.
    pub rtp_capabilities: RtpCapabilities,
    /// Whether the consumer starts paused.
    ///
    /// For video it is recommended to start paused and resume once the
    /// consuming endpoint created its local side, so the first key frame
    /// is not wasted on an endpoint that cannot render it yet.
    pub paused: bool,
    /// Preferred spatial and temporal layer for simulcast or SVC sources.
    /// Highest layers are selected when unset.
    pub preferred_layers: Option<ConsumerLayers>,
    /// Resume the worker-side consumer automatically when its producer
    /// resumes (checked against this consumer's own pause flag).
    pub resume_by_producer: bool,
    /// Custom application data.
    pub app_data: AppData,
}

impl ConsumerOptions {
    pub fn new(producer_id: ProducerId, rtp_capabilities: RtpCapabilities) -> Self {
        Self {
            producer_id,
            rtp_capabilities,
            paused: false,
            preferred_layers: None,
            resume_by_producer: false,
            app_data: AppData::default(),
        }
    }
}

/// Consumer type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    /// A single RTP stream without spatial or temporal layers.
    Simple,
    /// Layer selection over multiple producer RTP streams.
    Simulcast,
    /// Layer selection within a single layered RTP stream.
    #[serde(rename = "svc")]
    Svc,
}

impl From<ProducerType> for ConsumerType {
    fn from(producer_type: ProducerType) -> Self {
        match producer_type {
            ProducerType::Simple => ConsumerType::Simple,
            ProducerType::Simulcast => ConsumerType::Simulcast,
            ProducerType::Svc => ConsumerType::Svc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
#[non_exhaustive]
pub struct ConsumerDump {
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub paused: bool,
    pub producer_id: ProducerId,
    pub producer_paused: bool,
    pub priority: u8,
    pub rtp_parameters: RtpParameters,
    pub r#type: ConsumerType,
    pub trace_event_types: String,
}

/// RTC statistics of the consumer alone.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConsumerStat {
    // `type` field is present in worker, but ignored here
    pub timestamp: u64,
    pub ssrc: u32,
    pub rtx_ssrc: Option<u32>,
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

/// RTC statistics of the consumer, possibly with producer statistics.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConsumerStats {
    JustConsumer((ConsumerStat,)),
    WithProducer((ConsumerStat, ProducerStat)),
}

/// Types of consumer trace events.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerTraceEventType {
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
pub enum ConsumerTraceEventData {
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
    ProducerClose,
    ProducerPause,
    ProducerResume,
    Score(ConsumerScore),
    LayersChange(Option<ConsumerLayers>),
    Trace(ConsumerTraceEventData),
}

#[derive(Default)]
struct Handlers {
    pause: Bag<Box<dyn Fn() + Send + Sync>>,
    resume: Bag<Box<dyn Fn() + Send + Sync>>,
    producer_pause: Bag<Box<dyn Fn() + Send + Sync>>,
    producer_resume: Bag<Box<dyn Fn() + Send + Sync>>,
    score: Bag<Box<dyn Fn(&ConsumerScore) + Send + Sync>>,
    layers_change: Bag<Box<dyn Fn(&Option<ConsumerLayers>) + Send + Sync>>,
    trace: Bag<Box<dyn Fn(&ConsumerTraceEventData) + Send + Sync>>,
    producer_close: BagOnce<Box<dyn FnOnce() + Send>>,
    transport_close: BagOnce<Box<dyn FnOnce() + Send>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: ConsumerId,
    local_id: ResourceId,
    producer_id: ProducerId,
    producer: WeakProducer,
    kind: MediaKind,
    r#type: ConsumerType,
    rtp_parameters: RtpParameters,
    paused: Arc<Mutex<bool>>,
    producer_paused: Arc<Mutex<bool>>,
    priority: Mutex<u8>,
    score: Arc<Mutex<ConsumerScore>>,
    preferred_layers: Mutex<Option<ConsumerLayers>>,
    current_layers: Arc<Mutex<Option<ConsumerLayers>>>,
    resume_by_producer: bool,
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
    _on_transport_close_handler: Mutex<Option<HandlerId>>,
    _on_producer_close_handler: Mutex<Option<HandlerId>>,
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
                    .remove_child(TransportChildId::Consumer(self.id));
            }

            if send_request {
                let channel = self.channel.clone();
                let request = ConsumerCloseRequest {
                    internal: ConsumerInternal {
                        router_id: self.transport.router_id(),
                        transport_id: self.transport.id(),
                        consumer_id: self.id,
                        producer_id: self.producer_id,
                    },
                };
                let transport = Arc::clone(&self.transport);
                self.executor
                    .spawn(async move {
                        if let Err(error) = channel.request(request).await {
                            error!("consumer closing failed: {}", error);
                        }

                        drop(transport);
                    })
                    .detach();
            }
        }
    }
}

/// A consumer; an outbound media stream on a transport, fed by a producer.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

/// Weak handle to a consumer.
#[derive(Clone)]
pub struct WeakConsumer {
    inner: Weak<Inner>,
}

impl WeakConsumer {
    pub fn upgrade(&self) -> Option<Consumer> {
        self.inner.upgrade().map(|inner| Consumer { inner })
    }
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConsumerId,
        producer: Producer,
        kind: MediaKind,
        r#type: ConsumerType,
        rtp_parameters: RtpParameters,
        paused: bool,
        producer_paused: bool,
        score: ConsumerScore,
        preferred_layers: Option<ConsumerLayers>,
        resume_by_producer: bool,
        executor: Arc<Executor<'static>>,
        channel: Channel,
        payload_channel: PayloadChannel,
        app_data: AppData,
        transport: Arc<dyn Transport>,
        router: Router,
    ) -> Self {
        debug!("new()");

        let handlers = Arc::<Handlers>::default();
        let score = Arc::new(Mutex::new(score));
        let paused = Arc::new(Mutex::new(paused));
        let producer_paused = Arc::new(Mutex::new(producer_paused));
        let current_layers = Arc::<Mutex<Option<ConsumerLayers>>>::default();
        let registry = router.registry().clone();
        let producer_id = producer.id();

        let inner = Arc::new_cyclic(|inner_weak: &Weak<Inner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::Consumer(WeakConsumer {
                    inner: inner_weak.clone(),
                }),
            );
            Inner {
                id,
                local_id,
                producer_id,
                producer: producer.downgrade(),
                kind,
                r#type,
                rtp_parameters,
                paused: Arc::clone(&paused),
                producer_paused: Arc::clone(&producer_paused),
                priority: Mutex::new(1u8),
                score: Arc::clone(&score),
                preferred_layers: Mutex::new(preferred_layers),
                current_layers: Arc::clone(&current_layers),
                resume_by_producer,
                executor,
                channel,
                payload_channel,
                handlers,
                app_data,
                transport,
                router,
                closed: AtomicBool::new(false),
                _subscription_handler: Mutex::new(None),
                _on_transport_close_handler: Mutex::new(None),
                _on_producer_close_handler: Mutex::new(None),
            }
        });
        let consumer = Self { inner };

        let subscription_handler = {
            let handlers = Arc::clone(&consumer.inner.handlers);
            let paused = Arc::clone(&paused);
            let producer_paused = Arc::clone(&producer_paused);
            let score = Arc::clone(&score);
            let current_layers = Arc::clone(&current_layers);
            let inner_weak = Arc::downgrade(&consumer.inner);
            let event_bus = consumer.inner.router.event_bus().clone();
            let local_id = consumer.inner.local_id;
            consumer.inner.channel.subscribe_to_notifications(
                id.to_string(),
                move |notification| match serde_json::from_value::<Notification>(notification) {
                    Ok(notification) => match notification {
                        Notification::ProducerClose => {
                            handlers.producer_close.call_simple();
                            if let Some(inner) = inner_weak.upgrade() {
                                // The worker already removed the consumer
                                // together with its producer.
                                inner.close(false, true);
                            }
                        }
                        Notification::ProducerPause => {
                            let mut producer_paused = producer_paused.lock();
                            let was_paused = *paused.lock() || *producer_paused;
                            *producer_paused = true;
                            drop(producer_paused);

                            handlers.producer_pause.call_simple();
                            event_bus.emit(
                                EventKind::ConsumerProducerPause,
                                local_id,
                                None,
                            );

                            if !was_paused {
                                handlers.pause.call_simple();
                                event_bus.emit(EventKind::ConsumerPause, local_id, None);
                            }
                        }
                        Notification::ProducerResume => {
                            let mut producer_paused = producer_paused.lock();
                            let self_paused = *paused.lock();
                            let was_paused = self_paused || *producer_paused;
                            *producer_paused = false;
                            drop(producer_paused);

                            handlers.producer_resume.call_simple();
                            event_bus.emit(
                                EventKind::ConsumerProducerResume,
                                local_id,
                                None,
                            );

                            // The consumer's own pause flag gates the
                            // resume reaction.
                            if was_paused && !self_paused {
                                handlers.resume.call_simple();
                                event_bus.emit(EventKind::ConsumerResume, local_id, None);

                                if let Some(inner) = inner_weak.upgrade() {
                                    if inner.resume_by_producer {
                                        let channel = inner.channel.clone();
                                        let request = ConsumerResumeRequest {
                                            internal: ConsumerInternal {
                                                router_id: inner.transport.router_id(),
                                                transport_id: inner.transport.id(),
                                                consumer_id: inner.id,
                                                producer_id: inner.producer_id,
                                            },
                                        };
                                        inner
                                            .executor
                                            .spawn(async move {
                                                if let Err(error) =
                                                    channel.request(request).await
                                                {
                                                    error!(
                                                        "consumer resume by producer failed: {}",
                                                        error,
                                                    );
                                                }
                                            })
                                            .detach();
                                    }
                                }
                            }
                        }
                        Notification::Score(consumer_score) => {
                            *score.lock() = consumer_score.clone();
                            handlers.score.call(|callback| {
                                callback(&consumer_score);
                            });
                            event_bus.emit(
                                EventKind::ResourceScore,
                                local_id,
                                serde_json::to_value(&consumer_score).ok(),
                            );
                        }
                        Notification::LayersChange(consumer_layers) => {
                            *current_layers.lock() = consumer_layers;
                            handlers.layers_change.call(|callback| {
                                callback(&consumer_layers);
                            });
                            event_bus.emit(
                                EventKind::ConsumerLayersChange,
                                local_id,
                                serde_json::to_value(consumer_layers).ok(),
                            );
                        }
                        Notification::Trace(trace_event_data) => {
                            handlers.trace.call(|callback| {
                                callback(&trace_event_data);
                            });
                        }
                    },
                    Err(error) => {
                        error!("failed to parse consumer notification: {}", error);
                    }
                },
            )
        };
        consumer
            .inner
            ._subscription_handler
            .lock()
            .replace(subscription_handler);

        let on_transport_close_handler = {
            let inner_weak = Arc::downgrade(&consumer.inner);
            consumer.inner.transport.on_closed(Box::new(move || {
                if let Some(inner) = inner_weak.upgrade() {
                    inner.handlers.transport_close.call_simple();
                    inner.close(false, false);
                }
            }))
        };
        consumer
            .inner
            ._on_transport_close_handler
            .lock()
            .replace(on_transport_close_handler);

        // Local back-edge: closing the producer in this process closes the
        // consumer without waiting for the worker round trip.
        let on_producer_close_handler = {
            let inner_weak = Arc::downgrade(&consumer.inner);
            producer.on_close(move || {
                if let Some(inner) = inner_weak.upgrade() {
                    inner.handlers.producer_close.call_simple();
                    inner.close(false, true);
                }
            })
        };
        consumer
            .inner
            ._on_producer_close_handler
            .lock()
            .replace(on_producer_close_handler);

        consumer
            .inner
            .router
            .event_bus()
            .emit(EventKind::ConsumerCreated, consumer.inner.local_id, None);

        consumer
    }

    /// Consumer id.
    pub fn id(&self) -> ConsumerId {
        self.inner.id
    }

    /// Local resource id.
    pub fn local_id(&self) -> ResourceId {
        self.inner.local_id
    }

    /// Id of the producer feeding this consumer.
    pub fn producer_id(&self) -> ProducerId {
        self.inner.producer_id
    }

    /// The producer feeding this consumer, while it is alive.
    pub fn producer(&self) -> Option<Producer> {
        self.inner.producer.upgrade()
    }

    /// Id of the transport carrying this consumer.
    pub fn transport_id(&self) -> TransportId {
        self.inner.transport.id()
    }

    /// Media kind.
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    /// Consumer type.
    pub fn r#type(&self) -> ConsumerType {
        self.inner.r#type
    }

    /// RTP parameters synthesized for the consuming endpoint.
    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.inner.rtp_parameters
    }

    /// Whether the consumer itself is paused (its producer's pause state
    /// is tracked separately).
    pub fn paused(&self) -> bool {
        *self.inner.paused.lock()
    }

    /// Whether the producer feeding this consumer is paused.
    pub fn producer_paused(&self) -> bool {
        *self.inner.producer_paused.lock()
    }

    /// Consumer priority (see [`Consumer::set_priority`]).
    pub fn priority(&self) -> u8 {
        *self.inner.priority.lock()
    }

    /// Last reported score.
    pub fn score(&self) -> ConsumerScore {
        self.inner.score.lock().clone()
    }

    /// Preferred layers (see [`Consumer::set_preferred_layers`]).
    pub fn preferred_layers(&self) -> Option<ConsumerLayers> {
        *self.inner.preferred_layers.lock()
    }

    /// Currently transmitted layers; `None` when nothing is sent.
    pub fn current_layers(&self) -> Option<ConsumerLayers> {
        *self.inner.current_layers.lock()
    }

    /// Custom application data.
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    /// Whether the consumer is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Dump consumer state.
    #[doc(hidden)]
    pub async fn dump(&self) -> Result<ConsumerDump, RequestError> {
        debug!("dump()");

        self.inner
            .channel
            .request(ConsumerDumpRequest {
                internal: self.get_internal(),
            })
            .await
    }

    /// Consumer statistics.
    pub async fn get_stats(&self) -> Result<ConsumerStats, RequestError> {
        debug!("get_stats()");

        self.inner
            .channel
            .request(ConsumerGetStatsRequest {
                internal: self.get_internal(),
            })
            .await
    }

    /// Pauses the consumer; no RTP is sent to the consuming endpoint.
    pub async fn pause(&self) -> Result<(), RequestError> {
        debug!("pause()");

        self.inner
            .channel
            .request(ConsumerPauseRequest {
                internal: self.get_internal(),
            })
            .await?;

        let mut paused = self.inner.paused.lock();
        let was_paused = *paused || *self.inner.producer_paused.lock();
        *paused = true;
        drop(paused);

        if !was_paused {
            self.inner.handlers.pause.call_simple();
            self.inner
                .router
                .event_bus()
                .emit(EventKind::ConsumerPause, self.inner.local_id, None);
        }

        Ok(())
    }

    /// Resumes the consumer; RTP is sent again, unless its producer is
    /// paused.
    pub async fn resume(&self) -> Result<(), RequestError> {
        debug!("resume()");

        self.inner
            .channel
            .request(ConsumerResumeRequest {
                internal: self.get_internal(),
            })
            .await?;

        let mut paused = self.inner.paused.lock();
        let was_paused = *paused || *self.inner.producer_paused.lock();
        *paused = false;
        drop(paused);

        if was_paused {
            self.inner.handlers.resume.call_simple();
            self.inner
                .router
                .event_bus()
                .emit(EventKind::ConsumerResume, self.inner.local_id, None);
        }

        Ok(())
    }

    /// Sets the preferred (highest) layers to be sent to the consuming
    /// endpoint. Valid for simulcast and SVC consumers.
    pub async fn set_preferred_layers(
        &self,
        consumer_layers: ConsumerLayers,
    ) -> Result<(), RequestError> {
        debug!("set_preferred_layers()");

        let consumer_layers = self
            .inner
            .channel
            .request(ConsumerSetPreferredLayersRequest {
                internal: self.get_internal(),
                data: consumer_layers,
            })
            .await?;

        *self.inner.preferred_layers.lock() = consumer_layers;

        Ok(())
    }

    /// Sets the priority used when distributing the estimated outgoing
    /// bitrate among consumers.
    pub async fn set_priority(&self, priority: u8) -> Result<(), RequestError> {
        debug!("set_priority() [priority:{}]", priority);

        let response = self
            .inner
            .channel
            .request(ConsumerSetPriorityRequest {
                internal: self.get_internal(),
                data: ConsumerSetPriorityData { priority },
            })
            .await?;

        *self.inner.priority.lock() = response.priority;

        Ok(())
    }

    /// Resets the priority to its default value 1.
    pub async fn unset_priority(&self) -> Result<(), RequestError> {
        debug!("unset_priority()");

        let response = self
            .inner
            .channel
            .request(ConsumerSetPriorityRequest {
                internal: self.get_internal(),
                data: ConsumerSetPriorityData { priority: 1 },
            })
            .await?;

        *self.inner.priority.lock() = response.priority;

        Ok(())
    }

    /// Asks the producing endpoint for a key frame. Valid for video.
    pub async fn request_key_frame(&self) -> Result<(), RequestError> {
        debug!("request_key_frame()");

        self.inner
            .channel
            .request(ConsumerRequestKeyFrameRequest {
                internal: self.get_internal(),
            })
            .await
    }

    /// Instructs the worker to emit trace events for this consumer.
    pub async fn enable_trace_event(
        &self,
        types: Vec<ConsumerTraceEventType>,
    ) -> Result<(), RequestError> {
        debug!("enable_trace_event()");

        self.inner
            .channel
            .request(ConsumerEnableTraceEventRequest {
                internal: self.get_internal(),
                data: ConsumerEnableTraceEventData { types },
            })
            .await
    }

    /// Callback called when the consumer or its producer is paused and the
    /// consumer becomes effectively paused.
    pub fn on_pause<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.pause.add(Box::new(callback))
    }

    /// Callback called when the consumer or its producer is resumed and
    /// the consumer is no longer paused.
    pub fn on_resume<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.resume.add(Box::new(callback))
    }

    /// Callback called when the producer feeding this consumer pauses.
    pub fn on_producer_pause<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.producer_pause.add(Box::new(callback))
    }

    /// Callback called when the producer feeding this consumer resumes.
    pub fn on_producer_resume<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.producer_resume.add(Box::new(callback))
    }

    /// Callback called when the consumer score changes.
    pub fn on_score<F: Fn(&ConsumerScore) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.score.add(Box::new(callback))
    }

    /// Callback called when the transmitted layers change; simulcast and
    /// SVC consumers only.
    pub fn on_layers_change<F: Fn(&Option<ConsumerLayers>) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.layers_change.add(Box::new(callback))
    }

    /// See [`Consumer::enable_trace_event`].
    pub fn on_trace<F: Fn(&ConsumerTraceEventData) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.trace.add(Box::new(callback))
    }

    /// Callback called when the producer feeding this consumer is closed;
    /// the consumer itself closes too.
    pub fn on_producer_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.producer_close.add(Box::new(callback))
    }

    /// Callback called when the transport this consumer belongs to is
    /// closed; the consumer itself closes too.
    pub fn on_transport_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.transport_close.add(Box::new(callback))
    }

    /// Callback called when the consumer is closed for whatever reason.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    /// Close the consumer.
    pub fn close(&self) {
        self.inner.close(true, true);
    }

    pub(crate) fn close_from_transport(&self) {
        self.inner.close(false, false);
    }

    pub fn downgrade(&self) -> WeakConsumer {
        WeakConsumer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn get_internal(&self) -> ConsumerInternal {
        ConsumerInternal {
            router_id: self.inner.transport.router_id(),
            transport_id: self.inner.transport.id(),
            consumer_id: self.inner.id,
            producer_id: self.inner.producer_id,
        }
    }
}
