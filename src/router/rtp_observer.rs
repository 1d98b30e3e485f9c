//! RTP observers: router-scoped aggregators of per-producer audio
//! metrics.

use crate::data_structures::{AppData, RtpObserverInternal};
use crate::events::EventKind;
use crate::messages::{
    RtpObserverAddProducerRequest, RtpObserverAddRemoveProducerData, RtpObserverCloseRequest,
    RtpObserverPauseRequest, RtpObserverRemoveProducerRequest, RtpObserverResumeRequest,
};
use crate::producer::ProducerId;
use crate::registry::{ResourceId, WeakResource};
use crate::router::Router;
use crate::worker::{RequestError, SubscriptionHandler};
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

uuid_based_wrapper_type!(
    /// RTP observer identifier.
    RtpObserverId
);

/// Audio level observer creation options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AudioLevelObserverOptions {
    /// Maximum number of entries in a `volumes` event. Default 1.
    pub max_entries: u16,
    /// Minimum average volume (dBvo, negative) to be reported. Default -80.
    pub threshold: i8,
    /// Reporting interval in ms. Default 1000.
    pub interval: u16,
    /// Custom application data.
    pub app_data: AppData,
}

impl Default for AudioLevelObserverOptions {
    fn default() -> Self {
        Self {
            max_entries: 1,
            threshold: -80,
            interval: 1000,
            app_data: AppData::default(),
        }
    }
}

/// Active speaker observer creation options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ActiveSpeakerObserverOptions {
    /// Detection interval in ms. Default 300.
    pub interval: u16,
    /// Custom application data.
    pub app_data: AppData,
}

impl Default for ActiveSpeakerObserverOptions {
    fn default() -> Self {
        Self {
            interval: 300,
            app_data: AppData::default(),
        }
    }
}

/// One entry of a `volumes` event.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevelObserverVolume {
    /// Producer the volume belongs to.
    pub producer_id: ProducerId,
    /// Average volume in dBvo (negative, 0 is loudest).
    pub volume: i8,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", content = "data")]
enum AudioLevelNotification {
    Volumes(Vec<AudioLevelObserverVolume>),
    Silence,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DominantSpeaker {
    producer_id: ProducerId,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", content = "data")]
enum ActiveSpeakerNotification {
    DominantSpeaker(DominantSpeaker),
}

#[derive(Default)]
struct AudioLevelHandlers {
    volumes: Bag<Box<dyn Fn(&[AudioLevelObserverVolume]) + Send + Sync>>,
    silence: Bag<Box<dyn Fn() + Send + Sync>>,
    pause: Bag<Box<dyn Fn() + Send + Sync>>,
    resume: Bag<Box<dyn Fn() + Send + Sync>>,
    closed: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct AudioLevelInner {
    id: RtpObserverId,
    local_id: ResourceId,
    router: Router,
    producer_ids: Mutex<Vec<ProducerId>>,
    paused: AtomicBool,
    app_data: AppData,
    handlers: Arc<AudioLevelHandlers>,
    closed: AtomicBool,
    _subscription_handler: Mutex<Option<SubscriptionHandler>>,
}

impl Drop for AudioLevelInner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close(true, true);
    }
}

impl AudioLevelInner {
    fn close(&self, send_request: bool, unregister_from_router: bool) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close() [id:{}]", self.id);

            self.router.registry().unregister(self.local_id);
            self.handlers.closed.call_simple();
            self.router
                .event_bus()
                .emit(EventKind::ObserverClosed, self.local_id, None);

            if unregister_from_router {
                self.router.unregister_rtp_observer(self.id);
            }

            if send_request {
                let channel = self.router.worker().channel().clone();
                let request = RtpObserverCloseRequest {
                    internal: RtpObserverInternal {
                        router_id: self.router.id(),
                        rtp_observer_id: self.id,
                    },
                };
                self.router
                    .executor()
                    .spawn(async move {
                        if let Err(error) = channel.request(request).await {
                            error!("rtp observer closing failed: {}", error);
                        }
                    })
                    .detach();
            }
        }
    }
}

/// Observer reporting the loudest audio producers of a router.
#[derive(Clone)]
pub struct AudioLevelObserver {
    inner: Arc<AudioLevelInner>,
}

/// Weak handle to an audio level observer.
#[derive(Clone)]
pub struct WeakAudioLevelObserver {
    inner: Weak<AudioLevelInner>,
}

impl WeakAudioLevelObserver {
    pub fn upgrade(&self) -> Option<AudioLevelObserver> {
        self.inner.upgrade().map(|inner| AudioLevelObserver { inner })
    }
}

impl AudioLevelObserver {
    pub(crate) fn new(id: RtpObserverId, app_data: AppData, router: Router) -> Self {
        debug!("new()");

        let handlers = Arc::<AudioLevelHandlers>::default();
        let registry = router.registry().clone();
        let inner = Arc::new_cyclic(|inner_weak: &Weak<AudioLevelInner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::AudioLevelObserver(WeakAudioLevelObserver {
                    inner: inner_weak.clone(),
                }),
            );
            AudioLevelInner {
                id,
                local_id,
                router,
                producer_ids: Mutex::new(Vec::new()),
                paused: AtomicBool::new(false),
                app_data,
                handlers,
                closed: AtomicBool::new(false),
                _subscription_handler: Mutex::new(None),
            }
        });
        let observer = Self { inner };

        let subscription_handler = {
            let handlers = Arc::clone(&observer.inner.handlers);
            let event_bus = observer.inner.router.event_bus().clone();
            let local_id = observer.inner.local_id;
            observer.inner.router.worker().channel().subscribe_to_notifications(
                id.to_string(),
                move |notification| {
                    match serde_json::from_value::<AudioLevelNotification>(notification) {
                        Ok(AudioLevelNotification::Volumes(volumes)) => {
                            handlers.volumes.call(|callback| {
                                callback(&volumes);
                            });
                            event_bus.emit(
                                EventKind::AudioObserverVolumes,
                                local_id,
                                serde_json::to_value(&volumes).ok(),
                            );
                        }
                        Ok(AudioLevelNotification::Silence) => {
                            handlers.silence.call(|callback| {
                                callback();
                            });
                            event_bus.emit(EventKind::AudioObserverSilence, local_id, None);
                        }
                        Err(error) => {
                            error!("failed to parse observer notification: {}", error);
                        }
                    }
                },
            )
        };
        observer
            .inner
            ._subscription_handler
            .lock()
            .replace(subscription_handler);

        observer
            .inner
            .router
            .event_bus()
            .emit(EventKind::ObserverCreated, observer.inner.local_id, None);

        observer
    }

    /// Observer id.
    pub fn id(&self) -> RtpObserverId {
        self.inner.id
    }

    /// Local resource id.
    pub fn local_id(&self) -> ResourceId {
        self.inner.local_id
    }

    /// Producers currently bound to the observer.
    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.inner.producer_ids.lock().clone()
    }

    /// Whether the observer is paused.
    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Custom application data.
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    /// Whether the observer is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Starts watching the given producer.
    pub async fn add_producer(&self, producer_id: ProducerId) -> Result<(), RequestError> {
        debug!("add_producer() [producer_id:{}]", producer_id);

        self.inner
            .router
            .worker()
            .channel()
            .request(RtpObserverAddProducerRequest {
                internal: self.get_internal(),
                data: RtpObserverAddRemoveProducerData { producer_id },
            })
            .await?;

        self.inner.producer_ids.lock().push(producer_id);

        Ok(())
    }

    /// Stops watching the given producer.
    pub async fn remove_producer(&self, producer_id: ProducerId) -> Result<(), RequestError> {
        debug!("remove_producer() [producer_id:{}]", producer_id);

        self.inner
            .router
            .worker()
            .channel()
            .request(RtpObserverRemoveProducerRequest {
                internal: self.get_internal(),
                data: RtpObserverAddRemoveProducerData { producer_id },
            })
            .await?;

        self.inner
            .producer_ids
            .lock()
            .retain(|id| *id != producer_id);

        Ok(())
    }

    /// Pauses volume reporting.
    pub async fn pause(&self) -> Result<(), RequestError> {
        debug!("pause()");

        self.inner
            .router
            .worker()
            .channel()
            .request(RtpObserverPauseRequest {
                internal: self.get_internal(),
            })
            .await?;

        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            self.inner.handlers.pause.call_simple();
            self.inner
                .router
                .event_bus()
                .emit(EventKind::ObserverPaused, self.inner.local_id, None);
        }

        Ok(())
    }

    /// Resumes volume reporting.
    pub async fn resume(&self) -> Result<(), RequestError> {
        debug!("resume()");

        self.inner
            .router
            .worker()
            .channel()
            .request(RtpObserverResumeRequest {
                internal: self.get_internal(),
            })
            .await?;

        if self.inner.paused.swap(false, Ordering::SeqCst) {
            self.inner.handlers.resume.call_simple();
            self.inner
                .router
                .event_bus()
                .emit(EventKind::ObserverResumed, self.inner.local_id, None);
        }

        Ok(())
    }

    /// Callback called with the loudest producers every interval.
    pub fn on_volumes<F: Fn(&[AudioLevelObserverVolume]) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.volumes.add(Box::new(callback))
    }

    /// Callback called when no producer is above the threshold.
    pub fn on_silence<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.silence.add(Box::new(callback))
    }

    pub fn on_pause<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.pause.add(Box::new(callback))
    }

    pub fn on_resume<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.resume.add(Box::new(callback))
    }

    pub fn on_closed<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.closed.add(Box::new(callback))
    }

    /// Close the observer.
    pub fn close(&self) {
        self.inner.close(true, true);
    }

    pub(crate) fn close_from_router(&self) {
        self.inner.close(false, false);
    }

    pub fn downgrade(&self) -> WeakAudioLevelObserver {
        WeakAudioLevelObserver {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn get_internal(&self) -> RtpObserverInternal {
        RtpObserverInternal {
            router_id: self.inner.router.id(),
            rtp_observer_id: self.inner.id,
        }
    }
}

#[derive(Default)]
struct ActiveSpeakerHandlers {
    dominant_speaker: Bag<Box<dyn Fn(ProducerId) + Send + Sync>>,
    pause: Bag<Box<dyn Fn() + Send + Sync>>,
    resume: Bag<Box<dyn Fn() + Send + Sync>>,
    closed: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct ActiveSpeakerInner {
    id: RtpObserverId,
    local_id: ResourceId,
    router: Router,
    producer_ids: Mutex<Vec<ProducerId>>,
    paused: AtomicBool,
    app_data: AppData,
    handlers: Arc<ActiveSpeakerHandlers>,
    closed: AtomicBool,
    _subscription_handler: Mutex<Option<SubscriptionHandler>>,
}

impl Drop for ActiveSpeakerInner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close(true, true);
    }
}

impl ActiveSpeakerInner {
    fn close(&self, send_request: bool, unregister_from_router: bool) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close() [id:{}]", self.id);

            self.router.registry().unregister(self.local_id);
            self.handlers.closed.call_simple();
            self.router
                .event_bus()
                .emit(EventKind::ObserverClosed, self.local_id, None);

            if unregister_from_router {
                self.router.unregister_rtp_observer(self.id);
            }

            if send_request {
                let channel = self.router.worker().channel().clone();
                let request = RtpObserverCloseRequest {
                    internal: RtpObserverInternal {
                        router_id: self.router.id(),
                        rtp_observer_id: self.id,
                    },
                };
                self.router
                    .executor()
                    .spawn(async move {
                        if let Err(error) = channel.request(request).await {
                            error!("rtp observer closing failed: {}", error);
                        }
                    })
                    .detach();
            }
        }
    }
}

/// Observer reporting the dominant speaker of a router.
#[derive(Clone)]
pub struct ActiveSpeakerObserver {
    inner: Arc<ActiveSpeakerInner>,
}

/// Weak handle to an active speaker observer.
#[derive(Clone)]
pub struct WeakActiveSpeakerObserver {
    inner: Weak<ActiveSpeakerInner>,
}

impl WeakActiveSpeakerObserver {
    pub fn upgrade(&self) -> Option<ActiveSpeakerObserver> {
        self.inner
            .upgrade()
            .map(|inner| ActiveSpeakerObserver { inner })
    }
}

impl ActiveSpeakerObserver {
    pub(crate) fn new(id: RtpObserverId, app_data: AppData, router: Router) -> Self {
        debug!("new()");

        let handlers = Arc::<ActiveSpeakerHandlers>::default();
        let registry = router.registry().clone();
        let inner = Arc::new_cyclic(|inner_weak: &Weak<ActiveSpeakerInner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::ActiveSpeakerObserver(WeakActiveSpeakerObserver {
                    inner: inner_weak.clone(),
                }),
            );
            ActiveSpeakerInner {
                id,
                local_id,
                router,
                producer_ids: Mutex::new(Vec::new()),
                paused: AtomicBool::new(false),
                app_data,
                handlers,
                closed: AtomicBool::new(false),
                _subscription_handler: Mutex::new(None),
            }
        });
        let observer = Self { inner };

        let subscription_handler = {
            let handlers = Arc::clone(&observer.inner.handlers);
            let event_bus = observer.inner.router.event_bus().clone();
            let local_id = observer.inner.local_id;
            observer.inner.router.worker().channel().subscribe_to_notifications(
                id.to_string(),
                move |notification| {
                    match serde_json::from_value::<ActiveSpeakerNotification>(notification) {
                        Ok(ActiveSpeakerNotification::DominantSpeaker(dominant_speaker)) => {
                            handlers.dominant_speaker.call(|callback| {
                                callback(dominant_speaker.producer_id);
                            });
                            event_bus.emit(
                                EventKind::ActiveSpeaker,
                                local_id,
                                serde_json::to_value(dominant_speaker.producer_id).ok(),
                            );
                        }
                        Err(error) => {
                            error!("failed to parse observer notification: {}", error);
                        }
                    }
                },
            )
        };
        observer
            .inner
            ._subscription_handler
            .lock()
            .replace(subscription_handler);

        observer
            .inner
            .router
            .event_bus()
            .emit(EventKind::ObserverCreated, observer.inner.local_id, None);

        observer
    }

    /// Observer id.
    pub fn id(&self) -> RtpObserverId {
        self.inner.id
    }

    /// Local resource id.
    pub fn local_id(&self) -> ResourceId {
        self.inner.local_id
    }

    /// Whether the observer is paused.
    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Custom application data.
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    /// Whether the observer is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Starts watching the given producer.
    pub async fn add_producer(&self, producer_id: ProducerId) -> Result<(), RequestError> {
        debug!("add_producer() [producer_id:{}]", producer_id);

        self.inner
            .router
            .worker()
            .channel()
            .request(RtpObserverAddProducerRequest {
                internal: self.get_internal(),
                data: RtpObserverAddRemoveProducerData { producer_id },
            })
            .await?;

        self.inner.producer_ids.lock().push(producer_id);

        Ok(())
    }

    /// Stops watching the given producer.
    pub async fn remove_producer(&self, producer_id: ProducerId) -> Result<(), RequestError> {
        debug!("remove_producer() [producer_id:{}]", producer_id);

        self.inner
            .router
            .worker()
            .channel()
            .request(RtpObserverRemoveProducerRequest {
                internal: self.get_internal(),
                data: RtpObserverAddRemoveProducerData { producer_id },
            })
            .await?;

        self.inner
            .producer_ids
            .lock()
            .retain(|id| *id != producer_id);

        Ok(())
    }

    /// Pauses dominant speaker detection.
    pub async fn pause(&self) -> Result<(), RequestError> {
        debug!("pause()");

        self.inner
            .router
            .worker()
            .channel()
            .request(RtpObserverPauseRequest {
                internal: self.get_internal(),
            })
            .await?;

        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            self.inner.handlers.pause.call_simple();
            self.inner
                .router
                .event_bus()
                .emit(EventKind::ObserverPaused, self.inner.local_id, None);
        }

        Ok(())
    }

    /// Resumes dominant speaker detection.
    pub async fn resume(&self) -> Result<(), RequestError> {
        debug!("resume()");

        self.inner
            .router
            .worker()
            .channel()
            .request(RtpObserverResumeRequest {
                internal: self.get_internal(),
            })
            .await?;

        if self.inner.paused.swap(false, Ordering::SeqCst) {
            self.inner.handlers.resume.call_simple();
            self.inner
                .router
                .event_bus()
                .emit(EventKind::ObserverResumed, self.inner.local_id, None);
        }

        Ok(())
    }

    /// Callback called when the dominant speaker changes.
    pub fn on_dominant_speaker<F: Fn(ProducerId) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.dominant_speaker.add(Box::new(callback))
    }

    pub fn on_pause<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.pause.add(Box::new(callback))
    }

    pub fn on_resume<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.resume.add(Box::new(callback))
    }

    pub fn on_closed<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.closed.add(Box::new(callback))
    }

    /// Close the observer.
    pub fn close(&self) {
        self.inner.close(true, true);
    }

    pub(crate) fn close_from_router(&self) {
        self.inner.close(false, false);
    }

    pub fn downgrade(&self) -> WeakActiveSpeakerObserver {
        WeakActiveSpeakerObserver {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn get_internal(&self) -> RtpObserverInternal {
        RtpObserverInternal {
            router_id: self.inner.router.id(),
            rtp_observer_id: self.inner.id,
        }
    }
}
