//! A member of a room: one participant bound to a WebSocket session,
//! holding the transports, producers and consumers it created.

use crate::consumer::{Consumer, ConsumerId};
use crate::data_consumer::DataConsumer;
use crate::data_producer::DataProducer;
use crate::events::EventBus;
use crate::producer::{Producer, ProducerId};
use crate::registry::{Registry, ResourceId, WeakResource};
use crate::room::WeakRoom;
use crate::router::transport::TransportId;
use crate::rtp_parameters::RtpCapabilities;
use crate::webrtc_transport::WebRtcTransport;
use bitflags::bitflags;
use event_listener_primitives::{BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

uuid_based_wrapper_type!(
    /// Room member identifier.
    MemberId
);

bitflags! {
    /// Flags attached to a member's resource refs; transports carry their
    /// direction.
    pub struct MemberResourceFlags: u32 {
        const RECV = 0b0001;
        const SEND = 0b0010;
    }
}

/// A resource created by (and owned by) a member.
#[derive(Clone)]
pub enum MemberResource {
    Transport(WebRtcTransport),
    Producer(Producer),
    Consumer(Consumer),
    DataProducer(DataProducer),
    DataConsumer(DataConsumer),
}

impl MemberResource {
    fn close(&self) {
        match self {
            MemberResource::Transport(transport) => {
                crate::transport::Transport::close(transport)
            }
            MemberResource::Producer(producer) => producer.close(),
            MemberResource::Consumer(consumer) => consumer.close(),
            MemberResource::DataProducer(data_producer) => data_producer.close(),
            MemberResource::DataConsumer(data_consumer) => data_consumer.close(),
        }
    }
}

#[derive(Default)]
struct Handlers {
    closed: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: MemberId,
    local_id: ResourceId,
    wsid: u64,
    user_id: String,
    name: Mutex<String>,
    rtp_capabilities: Mutex<Option<RtpCapabilities>>,
    room: WeakRoom,
    resources: Mutex<Vec<(MemberResourceFlags, MemberResource)>>,
    registry: Registry,
    #[allow(dead_code)]
    event_bus: EventBus,
    handlers: Handlers,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close();
    }
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close() [id:{}]", self.id);

            self.registry.unregister(self.local_id);

            // Close everything the member created, newest first. Removal
            // from this list never frees a resource by itself, close does.
            let resources = {
                let mut resources = self.resources.lock();
                std::mem::take(&mut *resources)
            };
            for (_, resource) in resources.iter().rev() {
                resource.close();
            }

            self.handlers.closed.call_simple();
        }
    }
}

/// A live participant of a room.
#[derive(Clone)]
pub struct RoomMember {
    inner: Arc<Inner>,
}

/// Weak handle to a room member.
#[derive(Clone)]
pub struct WeakRoomMember {
    inner: Weak<Inner>,
}

impl WeakRoomMember {
    pub fn upgrade(&self) -> Option<RoomMember> {
        self.inner.upgrade().map(|inner| RoomMember { inner })
    }
}

impl RoomMember {
    pub(crate) fn new(
        wsid: u64,
        user_id: String,
        name: String,
        rtp_capabilities: Option<RtpCapabilities>,
        room: WeakRoom,
        registry: Registry,
        event_bus: EventBus,
    ) -> Self {
        debug!("new()");

        let id = MemberId::new();
        let inner = Arc::new_cyclic(|inner_weak: &Weak<Inner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::RoomMember(WeakRoomMember {
                    inner: inner_weak.clone(),
                }),
            );
            Inner {
                id,
                local_id,
                wsid,
                user_id,
                name: Mutex::new(name),
                rtp_capabilities: Mutex::new(rtp_capabilities),
                room,
                resources: Mutex::new(Vec::new()),
                registry: registry.clone(),
                event_bus,
                handlers: Handlers::default(),
                closed: AtomicBool::new(false),
            }
        });

        Self { inner }
    }

    /// Member id.
    pub fn id(&self) -> MemberId {
        self.inner.id
    }

    /// Local resource id.
    pub fn local_id(&self) -> ResourceId {
        self.inner.local_id
    }

    /// WebSocket session id this member is bound to.
    pub fn wsid(&self) -> u64 {
        self.inner.wsid
    }

    /// User behind this member.
    pub fn user_id(&self) -> &String {
        &self.inner.user_id
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    pub fn set_name(&self, name: String) {
        *self.inner.name.lock() = name;
    }

    /// RTP capabilities of the member's device.
    pub fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.inner.rtp_capabilities.lock().clone()
    }

    pub fn set_rtp_capabilities(&self, rtp_capabilities: RtpCapabilities) {
        self.inner
            .rtp_capabilities
            .lock()
            .replace(rtp_capabilities);
    }

    /// The room this member belongs to, while it is alive.
    pub fn room(&self) -> Option<crate::room::Room> {
        self.inner.room.upgrade()
    }

    /// Whether the member is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Remembers a resource the member created.
    pub fn add_resource(&self, flags: MemberResourceFlags, resource: MemberResource) {
        self.inner.resources.lock().push((flags, resource));
    }

    /// The member's sending transport, if any.
    pub fn send_transport(&self) -> Option<WebRtcTransport> {
        self.transport_by_flags(MemberResourceFlags::SEND)
    }

    /// The member's receiving transport, if any.
    pub fn recv_transport(&self) -> Option<WebRtcTransport> {
        self.transport_by_flags(MemberResourceFlags::RECV)
    }

    fn transport_by_flags(&self, wanted: MemberResourceFlags) -> Option<WebRtcTransport> {
        self.inner
            .resources
            .lock()
            .iter()
            .find_map(|(flags, resource)| match resource {
                MemberResource::Transport(transport) if flags.contains(wanted) => {
                    Some(transport.clone())
                }
                _ => None,
            })
    }

    /// Transport lookup by id across the member's refs.
    pub fn transport(&self, id: TransportId) -> Option<WebRtcTransport> {
        self.inner
            .resources
            .lock()
            .iter()
            .find_map(|(_, resource)| match resource {
                MemberResource::Transport(transport)
                    if crate::transport::Transport::id(transport) == id =>
                {
                    Some(transport.clone())
                }
                _ => None,
            })
    }

    /// Producer lookup by id across the member's refs.
    pub fn producer(&self, id: ProducerId) -> Option<Producer> {
        self.inner
            .resources
            .lock()
            .iter()
            .find_map(|(_, resource)| match resource {
                MemberResource::Producer(producer) if producer.id() == id => {
                    Some(producer.clone())
                }
                _ => None,
            })
    }

    /// Consumer lookup by id across the member's refs.
    pub fn consumer(&self, id: ConsumerId) -> Option<Consumer> {
        self.inner
            .resources
            .lock()
            .iter()
            .find_map(|(_, resource)| match resource {
                MemberResource::Consumer(consumer) if consumer.id() == id => {
                    Some(consumer.clone())
                }
                _ => None,
            })
    }

    /// All live consumers of this member.
    pub fn consumers(&self) -> Vec<Consumer> {
        self.inner
            .resources
            .lock()
            .iter()
            .filter_map(|(_, resource)| match resource {
                MemberResource::Consumer(consumer) if !consumer.closed() => {
                    Some(consumer.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// All live producers of this member.
    pub fn producers(&self) -> Vec<Producer> {
        self.inner
            .resources
            .lock()
            .iter()
            .filter_map(|(_, resource)| match resource {
                MemberResource::Producer(producer) if !producer.closed() => {
                    Some(producer.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Drops a single resource ref; a pure notification step, the
    /// resource is freed by its own close.
    pub fn forget_producer(&self, id: ProducerId) {
        self.inner
            .resources
            .lock()
            .retain(|(_, resource)| match resource {
                MemberResource::Producer(producer) => producer.id() != id,
                _ => true,
            });
    }

    /// Callback called when the member is closed for whatever reason.
    pub fn on_closed<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.closed.add(Box::new(callback))
    }

    /// Close the member and every resource it owns.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn downgrade(&self) -> WeakRoomMember {
        WeakRoomMember {
            inner: Arc::downgrade(&self.inner),
        }
    }
}
