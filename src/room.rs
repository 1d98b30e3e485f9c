//! The room domain: rooms bound 1:1 to routers, their members, chat and
//! persistent history.

pub mod chat;
pub mod history;
pub mod member;

use crate::events::{EventBus, EventKind};
use crate::kv::{Kv, KvError};
use crate::registry::{Registry, ResourceId, WeakResource};
use crate::room::history::RoomHistory;
use crate::room::member::{MemberId, RoomMember};
use crate::router::{CreateTransportError, Router};
use crate::rtp_observer::{AudioLevelObserver, AudioLevelObserverOptions};
use crate::rtp_parameters::{
    MimeTypeAudio, MimeTypeVideo, RtpCapabilities, RtpCodecCapability,
    RtpCodecParametersParameters,
};
use crate::worker::{CreateRouterError, WorkerSettings};
use crate::worker_manager::WorkerManager;
use crate::router::RouterOptions;
use async_io::Timer;
use bitflags::bitflags;
use event_listener_primitives::{BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

uuid_based_wrapper_type!(
    /// Room identifier; stable across sessions of the same room.
    RoomId
);

bitflags! {
    /// Behavior flags of a room.
    pub struct RoomFlags: u32 {
        /// Peer-to-peer meeting; every member produces and sees everyone.
        const MEETING = 0b0001;
        /// Broadcast; only the owner produces.
        const WEBINAR = 0b0010;
        /// Membership events and member lists are visible only between
        /// the owner and each member.
        const LIGHT = 0b0100;
        /// Attach an audio-level observer at creation.
        const ALO = 0b1000;
    }
}

/// Room creation options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RoomOptions {
    /// Reuse a stable room uuid; prior sessions under the same uuid are
    /// archived. A fresh uuid is generated when unset.
    pub uuid: Option<RoomId>,
    /// Display name.
    pub name: String,
    /// Behavior flags.
    pub flags: RoomFlags,
    /// Grace period after the last member leaves before the room closes.
    pub idle_timeout: Duration,
}

impl RoomOptions {
    pub fn new(name: String) -> Self {
        Self {
            uuid: None,
            name,
            flags: RoomFlags::MEETING,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Error of room creation or membership operations.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("failed to spawn worker: {0}")]
    WorkerSpawn(io::Error),
    #[error("failed to create router: {0}")]
    CreateRouter(CreateRouterError),
    #[error("failed to create observer: {0}")]
    CreateObserver(CreateTransportError),
    #[error("persistence failure: {0}")]
    Kv(#[from] KvError),
    #[error("room is closed")]
    Closed,
}

#[derive(Default)]
struct Handlers {
    closed: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: RoomId,
    /// Session id; changes on every re-creation of the same room uuid.
    cid: Uuid,
    local_id: ResourceId,
    name: Mutex<String>,
    flags: RoomFlags,
    owner_user_id: String,
    router: Router,
    members: Mutex<Vec<RoomMember>>,
    audio_observer: Mutex<Option<AudioLevelObserver>>,
    recording: AtomicBool,
    whiteboard_link: Mutex<Option<String>>,
    history: RoomHistory,
    idle_timeout: Duration,
    /// Bumped on every membership change; an idle-close timer fires only
    /// when the epoch it captured is still current.
    idle_epoch: AtomicU64,
    on_empty_closed: Mutex<Option<Box<dyn FnOnce(RoomId) + Send>>>,
    handlers: Handlers,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close(false);
    }
}

impl Inner {
    fn close(&self, from_router: bool) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close() [id:{}]", self.id);

            self.router.registry().unregister(self.local_id);

            let members = {
                let mut members = self.members.lock();
                std::mem::take(&mut *members)
            };
            for member in members.iter().rev() {
                member.close();
            }

            self.audio_observer.lock().take();

            {
                let history = self.history.clone();
                let uuid = self.id.to_string();
                self.router
                    .executor()
                    .spawn(async move {
                        if let Err(error) = history.record_closed(&uuid).await {
                            error!("recording room close failed: {}", error);
                        }
                    })
                    .detach();
            }

            self.handlers.closed.call_simple();
            self.router
                .event_bus()
                .emit(EventKind::RoomClosed, self.local_id, None);

            if let Some(on_empty_closed) = self.on_empty_closed.lock().take() {
                on_empty_closed(self.id);
            }

            if !from_router {
                self.router.clear_room_closer();
                self.router.close();
            }
        }
    }
}

/// A room; the unit of access control and persistent history on top of a
/// router.
#[derive(Clone)]
pub struct Room {
    inner: Arc<Inner>,
}

/// Weak handle to a room.
#[derive(Clone)]
pub struct WeakRoom {
    inner: Weak<Inner>,
}

impl WeakRoom {
    pub fn upgrade(&self) -> Option<Room> {
        self.inner.upgrade().map(|inner| Room { inner })
    }
}

impl Room {
    fn new(
        id: RoomId,
        cid: Uuid,
        options: RoomOptions,
        owner_user_id: String,
        router: Router,
        history: RoomHistory,
        on_empty_closed: Box<dyn FnOnce(RoomId) + Send>,
    ) -> Self {
        debug!("new() [id:{}]", id);

        let registry = router.registry().clone();
        let inner = Arc::new_cyclic(|inner_weak: &Weak<Inner>| {
            let local_id = registry.register(
                id.into(),
                WeakResource::Room(WeakRoom {
                    inner: inner_weak.clone(),
                }),
            );
            Inner {
                id,
                cid,
                local_id,
                name: Mutex::new(options.name),
                flags: options.flags,
                owner_user_id,
                router,
                members: Mutex::new(Vec::new()),
                audio_observer: Mutex::new(None),
                recording: AtomicBool::new(false),
                whiteboard_link: Mutex::new(None),
                history,
                idle_timeout: options.idle_timeout,
                idle_epoch: AtomicU64::new(0),
                on_empty_closed: Mutex::new(Some(on_empty_closed)),
                handlers: Handlers::default(),
                closed: AtomicBool::new(false),
            }
        });
        let room = Self { inner };

        // Router teardown takes the room with it, before the transports.
        {
            let room_weak = room.downgrade();
            room.inner.router.set_room_closer(move || {
                if let Some(room) = room_weak.upgrade() {
                    room.inner.close(true);
                }
            });
        }

        room.inner
            .router
            .event_bus()
            .emit(EventKind::RoomCreated, room.inner.local_id, None);

        room
    }

    /// Room uuid.
    pub fn id(&self) -> RoomId {
        self.inner.id
    }

    /// Session id of this room instance.
    pub fn cid(&self) -> Uuid {
        self.inner.cid
    }

    /// Local resource id.
    pub fn local_id(&self) -> ResourceId {
        self.inner.local_id
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.inner.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.inner.name.lock() = name;
    }

    /// Behavior flags.
    pub fn flags(&self) -> RoomFlags {
        self.inner.flags
    }

    /// User id of the room owner; the first member that joined. Does not
    /// change when the owner leaves.
    pub fn owner_user_id(&self) -> &String {
        &self.inner.owner_user_id
    }

    /// The router carrying this room's media.
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// The audio level observer, when the room was created with
    /// [`RoomFlags::ALO`].
    pub fn audio_observer(&self) -> Option<AudioLevelObserver> {
        self.inner.audio_observer.lock().clone()
    }

    /// Whether recording is on.
    pub fn recording(&self) -> bool {
        self.inner.recording.load(Ordering::SeqCst)
    }

    /// Whiteboard link, once opened.
    pub fn whiteboard_link(&self) -> Option<String> {
        self.inner.whiteboard_link.lock().clone()
    }

    pub(crate) fn history(&self) -> &RoomHistory {
        &self.inner.history
    }

    /// Whether the room is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Live members.
    pub fn members(&self) -> Vec<RoomMember> {
        self.inner.members.lock().clone()
    }

    /// Member lookup by member id.
    pub fn member(&self, id: MemberId) -> Option<RoomMember> {
        self.inner
            .members
            .lock()
            .iter()
            .find(|member| member.id() == id)
            .cloned()
    }

    /// Member lookup by user id.
    pub fn member_of_user(&self, user_id: &str) -> Option<RoomMember> {
        self.inner
            .members
            .lock()
            .iter()
            .find(|member| member.user_id() == user_id)
            .cloned()
    }

    /// Members a given member may see.
    ///
    /// In a LIGHT room everyone sees the owner and the owner sees
    /// everyone; otherwise every member sees every member.
    pub fn visible_members(&self, viewer: &RoomMember) -> Vec<RoomMember> {
        let members = self.inner.members.lock();
        if self.inner.flags.contains(RoomFlags::LIGHT)
            && viewer.user_id() != &self.inner.owner_user_id
        {
            members
                .iter()
                .filter(|member| {
                    member.user_id() == viewer.user_id()
                        || member.user_id() == &self.inner.owner_user_id
                })
                .cloned()
                .collect()
        } else {
            members.iter().cloned().collect()
        }
    }

    /// Whether a member may open a sending transport.
    pub fn may_produce(&self, member: &RoomMember) -> bool {
        !self.inner.flags.contains(RoomFlags::WEBINAR)
            || member.user_id() == &self.inner.owner_user_id
    }

    /// Adds a member for the given user.
    ///
    /// At most one live member exists per user: a rejoin closes the prior
    /// member first. A pending idle-close is cancelled.
    pub async fn join(
        &self,
        wsid: u64,
        user_id: String,
        name: String,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> Result<RoomMember, RoomError> {
        if self.closed() {
            return Err(RoomError::Closed);
        }

        debug!("join() [room:{}, user:{}]", self.inner.id, user_id);

        self.inner.idle_epoch.fetch_add(1, Ordering::SeqCst);

        let prior = {
            let members = self.inner.members.lock();
            members
                .iter()
                .find(|member| member.user_id() == &user_id)
                .cloned()
        };
        if let Some(prior) = prior {
            self.leave(prior.id()).await?;
        }

        let member = RoomMember::new(
            wsid,
            user_id,
            name,
            rtp_capabilities,
            self.downgrade(),
            self.inner.router.registry().clone(),
            self.inner.router.event_bus().clone(),
        );
        self.inner.members.lock().push(member.clone());

        self.inner
            .history
            .record_join(
                &self.inner.id.to_string(),
                &self.inner.cid.to_string(),
                member.user_id(),
                &member.id().to_string(),
                &member.name(),
            )
            .await?;

        self.inner.router.event_bus().emit(
            EventKind::RoomMemberJoin,
            self.inner.local_id,
            Some(json!({
                "memberId": member.id().to_string(),
                "userId": member.user_id(),
                "name": member.name(),
            })),
        );

        Ok(member)
    }

    /// Removes a member; when the room becomes empty an idle grace timer
    /// starts and closes it unless somebody rejoins.
    pub async fn leave(&self, member_id: MemberId) -> Result<(), RoomError> {
        let member = {
            let mut members = self.inner.members.lock();
            let position = members.iter().position(|member| member.id() == member_id);
            position.map(|position| members.remove(position))
        };
        let member = match member {
            Some(member) => member,
            None => return Ok(()),
        };

        debug!("leave() [room:{}, user:{}]", self.inner.id, member.user_id());

        self.inner
            .history
            .record_leave(
                &self.inner.id.to_string(),
                member.user_id(),
                &member.name(),
            )
            .await?;

        self.inner.router.event_bus().emit(
            EventKind::RoomMemberLeft,
            self.inner.local_id,
            Some(json!({
                "memberId": member.id().to_string(),
                "userId": member.user_id(),
            })),
        );

        member.close();

        if self.inner.members.lock().is_empty() && !self.closed() {
            self.schedule_idle_close();
        }

        Ok(())
    }

    fn schedule_idle_close(&self) {
        let epoch = self.inner.idle_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let idle_timeout = self.inner.idle_timeout;
        let room_weak = self.downgrade();
        self.inner
            .router
            .executor()
            .spawn(async move {
                Timer::after(idle_timeout).await;
                if let Some(room) = room_weak.upgrade() {
                    let unchanged = room.inner.idle_epoch.load(Ordering::SeqCst) == epoch;
                    if unchanged && room.inner.members.lock().is_empty() {
                        info!("closing idle room [id:{}]", room.inner.id);
                        room.close();
                    }
                }
            })
            .detach();
    }

    /// Flips the recording flag, persisting and signaling the change.
    pub async fn set_recording(&self, recording: bool) -> Result<(), RoomError> {
        let prior = self.inner.recording.swap(recording, Ordering::SeqCst);
        if prior == recording {
            return Ok(());
        }

        self.inner
            .history
            .record_recording(&self.inner.id.to_string(), recording)
            .await?;

        let kind = if recording {
            EventKind::RoomRecordingOn
        } else {
            EventKind::RoomRecordingOff
        };
        self.inner
            .router
            .event_bus()
            .emit(kind, self.inner.local_id, None);

        Ok(())
    }

    /// Records the whiteboard link; only the first open of a session is
    /// logged.
    pub async fn open_whiteboard(
        &self,
        member_name: &str,
        link: &str,
    ) -> Result<bool, RoomError> {
        {
            let mut whiteboard_link = self.inner.whiteboard_link.lock();
            if whiteboard_link.is_some() {
                return Ok(false);
            }
            whiteboard_link.replace(link.to_string());
        }

        self.inner
            .history
            .record_whiteboard(
                &self.inner.id.to_string(),
                &self.inner.cid.to_string(),
                member_name,
                link,
            )
            .await?;

        Ok(true)
    }

    pub(crate) fn attach_audio_observer(&self, observer: AudioLevelObserver) {
        self.inner.audio_observer.lock().replace(observer);
    }

    /// Callback called when the room is closed for whatever reason.
    pub fn on_closed<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.closed.add(Box::new(callback))
    }

    /// Close the room, its members and its router.
    pub fn close(&self) {
        self.inner.close(false);
    }

    pub fn downgrade(&self) -> WeakRoom {
        WeakRoom {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Media codecs offered to every room router.
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("useinbandfec", 1u32.into()),
                ("usedtx", 1u32.into()),
            ]),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::new(),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("packetization-mode", 1u32.into()),
                ("level-asymmetry-allowed", 1u32.into()),
            ]),
            rtcp_feedback: vec![],
        },
    ]
}

struct RoomsInner {
    worker_manager: WorkerManager,
    history: RoomHistory,
    media_codecs: Vec<RtpCodecCapability>,
    rooms: Mutex<HashMap<RoomId, Room>>,
}

/// Directory of live rooms; creates them on demand and forgets them when
/// they close.
#[derive(Clone)]
pub struct Rooms {
    inner: Arc<RoomsInner>,
}

impl Rooms {
    pub fn new(worker_manager: WorkerManager, kv: Arc<dyn Kv>) -> Self {
        Self::with_media_codecs(worker_manager, kv, default_media_codecs())
    }

    pub fn with_media_codecs(
        worker_manager: WorkerManager,
        kv: Arc<dyn Kv>,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Self {
        Self {
            inner: Arc::new(RoomsInner {
                worker_manager,
                history: RoomHistory::new(kv),
                media_codecs,
                rooms: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn history(&self) -> &RoomHistory {
        &self.inner.history
    }

    pub(crate) fn registry(&self) -> &Registry {
        self.inner.worker_manager.registry()
    }

    pub(crate) fn event_bus(&self) -> &EventBus {
        self.inner.worker_manager.event_bus()
    }

    /// Live room lookup.
    pub fn get(&self, id: RoomId) -> Option<Room> {
        self.inner.rooms.lock().get(&id).cloned()
    }

    /// Number of live rooms.
    pub fn len(&self) -> usize {
        self.inner.rooms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the live room with the requested uuid, or creates a fresh
    /// session: a worker is selected, a router created, the history
    /// document written (archiving any prior session) and the optional
    /// audio-level observer attached.
    pub async fn get_or_create(
        &self,
        options: RoomOptions,
        owner_user_id: &str,
    ) -> Result<Room, RoomError> {
        let id = options.uuid.unwrap_or_else(RoomId::new);
        if let Some(room) = self.get(id) {
            return Ok(room);
        }

        let worker = self
            .inner
            .worker_manager
            .acquire_worker(WorkerSettings::default())
            .await
            .map_err(RoomError::WorkerSpawn)?;
        let router = worker
            .create_router(RouterOptions::new(self.inner.media_codecs.clone()))
            .await
            .map_err(RoomError::CreateRouter)?;

        let cid = Uuid::new_v4();
        self.inner
            .history
            .create_room_doc(
                &id.to_string(),
                &cid.to_string(),
                &options.name,
                owner_user_id,
            )
            .await?;

        let flags = options.flags;
        let room = Room::new(
            id,
            cid,
            options,
            owner_user_id.to_string(),
            router,
            self.inner.history.clone(),
            {
                let rooms_weak = Arc::downgrade(&self.inner);
                Box::new(move |id| {
                    if let Some(rooms) = rooms_weak.upgrade() {
                        rooms.rooms.lock().remove(&id);
                    }
                })
            },
        );

        if flags.contains(RoomFlags::ALO) {
            let observer = room
                .router()
                .create_audio_level_observer(AudioLevelObserverOptions::default())
                .await
                .map_err(RoomError::CreateObserver)?;
            room.attach_audio_observer(observer);
        }

        self.inner.rooms.lock().insert(id, room.clone());

        {
            let history = self.inner.history.clone();
            let count = self.len() as i64;
            self.inner
                .worker_manager
                .executor()
                .spawn(async move {
                    let _ = history.record_gauge("rooms", count).await;
                })
                .detach();
        }

        Ok(room)
    }
}
