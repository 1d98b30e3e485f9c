//! Process-wide resource registry.
//!
//! Every live resource is reachable both by its local id and by its uuid
//! (the identifier the worker and persistent storage speak). The registry
//! holds weak handles only; ownership stays with the parent → child
//! object graph and a lookup of a closed resource simply misses.

use crate::consumer::Consumer;
use crate::data_consumer::DataConsumer;
use crate::data_producer::DataProducer;
use crate::direct_transport::DirectTransport;
use crate::pipe_transport::PipeTransport;
use crate::plain_transport::PlainTransport;
use crate::producer::Producer;
use crate::room::member::RoomMember;
use crate::room::Room;
use crate::router::Router;
use crate::rtp_observer::{ActiveSpeakerObserver, AudioLevelObserver};
use crate::webrtc_transport::WebRtcTransport;
use crate::worker::Worker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Local identifier of a resource, unique within this process.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ResourceId(u32);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ResourceId {
    /// Id that never resolves; used where an event carries no resource.
    pub fn invalid() -> Self {
        Self(0)
    }
}

/// Strong handle to any registered resource kind.
#[derive(Clone)]
pub enum Resource {
    Worker(Worker),
    Router(Router),
    WebRtcTransport(WebRtcTransport),
    PlainTransport(PlainTransport),
    PipeTransport(PipeTransport),
    DirectTransport(DirectTransport),
    Producer(Producer),
    Consumer(Consumer),
    DataProducer(DataProducer),
    DataConsumer(DataConsumer),
    AudioLevelObserver(AudioLevelObserver),
    ActiveSpeakerObserver(ActiveSpeakerObserver),
    Room(Room),
    RoomMember(RoomMember),
}

/// Weak counterpart of [`Resource`] stored inside the registry.
pub(crate) enum WeakResource {
    Worker(crate::worker::WeakWorker),
    Router(crate::router::WeakRouter),
    WebRtcTransport(crate::webrtc_transport::WeakWebRtcTransport),
    PlainTransport(crate::plain_transport::WeakPlainTransport),
    PipeTransport(crate::pipe_transport::WeakPipeTransport),
    DirectTransport(crate::direct_transport::WeakDirectTransport),
    Producer(crate::producer::WeakProducer),
    Consumer(crate::consumer::WeakConsumer),
    DataProducer(crate::data_producer::WeakDataProducer),
    DataConsumer(crate::data_consumer::WeakDataConsumer),
    AudioLevelObserver(crate::rtp_observer::WeakAudioLevelObserver),
    ActiveSpeakerObserver(crate::rtp_observer::WeakActiveSpeakerObserver),
    Room(crate::room::WeakRoom),
    RoomMember(crate::room::member::WeakRoomMember),
}

impl WeakResource {
    fn upgrade(&self) -> Option<Resource> {
        match self {
            WeakResource::Worker(weak) => weak.upgrade().map(Resource::Worker),
            WeakResource::Router(weak) => weak.upgrade().map(Resource::Router),
            WeakResource::WebRtcTransport(weak) => weak.upgrade().map(Resource::WebRtcTransport),
            WeakResource::PlainTransport(weak) => weak.upgrade().map(Resource::PlainTransport),
            WeakResource::PipeTransport(weak) => weak.upgrade().map(Resource::PipeTransport),
            WeakResource::DirectTransport(weak) => weak.upgrade().map(Resource::DirectTransport),
            WeakResource::Producer(weak) => weak.upgrade().map(Resource::Producer),
            WeakResource::Consumer(weak) => weak.upgrade().map(Resource::Consumer),
            WeakResource::DataProducer(weak) => weak.upgrade().map(Resource::DataProducer),
            WeakResource::DataConsumer(weak) => weak.upgrade().map(Resource::DataConsumer),
            WeakResource::AudioLevelObserver(weak) => {
                weak.upgrade().map(Resource::AudioLevelObserver)
            }
            WeakResource::ActiveSpeakerObserver(weak) => {
                weak.upgrade().map(Resource::ActiveSpeakerObserver)
            }
            WeakResource::Room(weak) => weak.upgrade().map(Resource::Room),
            WeakResource::RoomMember(weak) => weak.upgrade().map(Resource::RoomMember),
        }
    }
}

struct Maps {
    by_id: HashMap<ResourceId, (Uuid, WeakResource)>,
    by_uuid: HashMap<Uuid, ResourceId>,
    next_id: u32,
}

/// Cheap-to-clone handle to the process-wide registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<Maps>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Maps {
                by_id: HashMap::new(),
                by_uuid: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    /// Registers a resource under a freshly allocated local id.
    ///
    /// Ids are monotonic; after wrap-around ids still held by live
    /// resources are skipped.
    pub(crate) fn register(&self, uuid: Uuid, resource: WeakResource) -> ResourceId {
        let mut maps = self.inner.lock();
        let id = loop {
            let candidate = maps.next_id;
            maps.next_id = maps.next_id.wrapping_add(1);
            if candidate != 0 && !maps.by_id.contains_key(&ResourceId(candidate)) {
                break ResourceId(candidate);
            }
        };
        maps.by_id.insert(id, (uuid, resource));
        maps.by_uuid.insert(uuid, id);
        id
    }

    /// Removes a resource; the first step of every close.
    pub(crate) fn unregister(&self, id: ResourceId) {
        let mut maps = self.inner.lock();
        if let Some((uuid, _)) = maps.by_id.remove(&id) {
            maps.by_uuid.remove(&uuid);
        }
    }

    /// Looks a live resource up by local id.
    pub fn get(&self, id: ResourceId) -> Option<Resource> {
        let maps = self.inner.lock();
        maps.by_id.get(&id).and_then(|(_, weak)| weak.upgrade())
    }

    /// Looks a live resource up by uuid.
    pub fn get_by_uuid(&self, uuid: &Uuid) -> Option<Resource> {
        let maps = self.inner.lock();
        maps.by_uuid
            .get(uuid)
            .and_then(|id| maps.by_id.get(id))
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// Resolves a uuid to a local id without touching the resource.
    pub fn resolve_uuid(&self, uuid: &Uuid) -> Option<ResourceId> {
        self.inner.lock().by_uuid.get(uuid).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
