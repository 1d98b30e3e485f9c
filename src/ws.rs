//! WebSocket command layer.
//!
//! The WebSocket server framework itself stays outside this crate; the
//! host calls [`WsServer::on_open`] when a connection is accepted,
//! [`WsServer::on_message`] for every text frame and
//! [`WsServer::on_close`] when the connection goes away, and provides a
//! [`WsSocket`] for writing frames back.

pub mod dispatcher;
pub mod tickets;

use crate::data_structures::TransportListenIp;
use crate::kv::{collections, Kv};
use crate::room::member::RoomMember;
use crate::room::{Room, Rooms};
use crate::worker_manager::WorkerManager;
use log::*;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Writer side of one WebSocket connection, provided by the host server.
pub trait WsSocket: Send + Sync {
    /// Queues a text frame for delivery.
    fn write(&self, text: &str);

    /// Closes the connection.
    fn close(&self);
}

/// Configuration of the WebSocket command layer.
#[derive(Debug, Clone)]
pub struct WsServerOptions {
    /// Listen IP handed to WebRTC transports created for members.
    pub listen_ip: TransportListenIp,
    /// Lifetime of unredeemed tickets.
    pub ticket_ttl: Duration,
}

impl Default for WsServerOptions {
    fn default() -> Self {
        Self {
            listen_ip: TransportListenIp {
                ip: IpAddr::from([127, 0, 0, 1]),
                announced_ip: None,
            },
            ticket_ttl: Duration::from_secs(60),
        }
    }
}

struct WsSessionInner {
    wsid: u64,
    socket: Arc<dyn WsSocket>,
    session_id: Mutex<Option<String>>,
    user_id: Mutex<Option<String>>,
    user_name: Mutex<String>,
    room: Mutex<Option<Room>>,
    member: Mutex<Option<RoomMember>>,
}

/// One live WebSocket connection and what it is bound to.
#[derive(Clone)]
pub struct WsSession {
    inner: Arc<WsSessionInner>,
}

impl WsSession {
    fn new(wsid: u64, socket: Arc<dyn WsSocket>) -> Self {
        Self {
            inner: Arc::new(WsSessionInner {
                wsid,
                socket,
                session_id: Mutex::new(None),
                user_id: Mutex::new(None),
                user_name: Mutex::new(String::new()),
                room: Mutex::new(None),
                member: Mutex::new(None),
            }),
        }
    }

    pub fn wsid(&self) -> u64 {
        self.inner.wsid
    }

    /// Whether the ticket handshake completed.
    pub fn bound(&self) -> bool {
        self.inner.session_id.lock().is_some()
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.user_id.lock().clone()
    }

    pub fn user_name(&self) -> String {
        self.inner.user_name.lock().clone()
    }

    pub(crate) fn set_user_name(&self, name: String) {
        *self.inner.user_name.lock() = name;
    }

    pub fn room(&self) -> Option<Room> {
        self.inner.room.lock().clone()
    }

    pub fn member(&self) -> Option<RoomMember> {
        self.inner.member.lock().clone()
    }

    pub(crate) fn enter_room(&self, room: Room, member: RoomMember) {
        self.inner.room.lock().replace(room);
        self.inner.member.lock().replace(member);
    }

    pub(crate) fn leave_room(&self) -> (Option<Room>, Option<RoomMember>) {
        (self.inner.room.lock().take(), self.inner.member.lock().take())
    }

    /// Sends a JSON frame to this connection.
    pub fn send(&self, value: &Value) {
        match serde_json::to_string(value) {
            Ok(text) => self.inner.socket.write(&text),
            Err(error) => error!("failed to serialize outgoing frame: {}", error),
        }
    }

    fn close_socket(&self) {
        self.inner.socket.close();
    }
}

struct WsServerInner {
    kv: Arc<dyn Kv>,
    rooms: Rooms,
    options: WsServerOptions,
    sessions: Mutex<HashMap<u64, WsSession>>,
    next_wsid: AtomicU64,
}

/// Entry point of the WebSocket command layer.
#[derive(Clone)]
pub struct WsServer {
    inner: Arc<WsServerInner>,
}

impl WsServer {
    pub fn new(worker_manager: &WorkerManager, kv: Arc<dyn Kv>) -> Self {
        Self::with_options(worker_manager, kv, WsServerOptions::default())
    }

    pub fn with_options(
        worker_manager: &WorkerManager,
        kv: Arc<dyn Kv>,
        options: WsServerOptions,
    ) -> Self {
        let rooms = Rooms::new(worker_manager.clone(), Arc::clone(&kv));
        Self {
            inner: Arc::new(WsServerInner {
                kv,
                rooms,
                options,
                sessions: Mutex::new(HashMap::new()),
                next_wsid: AtomicU64::new(1),
            }),
        }
    }

    pub fn rooms(&self) -> &Rooms {
        &self.inner.rooms
    }

    pub(crate) fn kv(&self) -> &Arc<dyn Kv> {
        &self.inner.kv
    }

    pub(crate) fn options(&self) -> &WsServerOptions {
        &self.inner.options
    }

    /// Issues a WebSocket ticket for an authenticated session; the host
    /// routes `GET /ws/ticket` here.
    pub async fn issue_ticket(
        &self,
        session_id: &str,
    ) -> Result<String, crate::kv::KvError> {
        tickets::issue_ticket(&self.inner.kv, session_id).await
    }

    /// Expires stale tickets; the host calls this periodically.
    pub async fn sweep_tickets(&self) -> Result<usize, crate::kv::KvError> {
        tickets::sweep_tickets(&self.inner.kv, self.inner.options.ticket_ttl).await
    }

    /// Registers an accepted connection and returns its wsid.
    pub fn on_open(&self, socket: Arc<dyn WsSocket>) -> u64 {
        let wsid = self.inner.next_wsid.fetch_add(1, Ordering::Relaxed);
        let session = WsSession::new(wsid, socket);
        self.inner.sessions.lock().insert(wsid, session);
        debug!("connection opened [wsid:{}]", wsid);
        wsid
    }

    /// Handles one inbound text frame.
    ///
    /// The first frame of a connection must be exactly the 36-character
    /// ticket; everything after is a JSON command.
    pub async fn on_message(&self, wsid: u64, frame: &str) {
        let session = match self.session(wsid) {
            Some(session) => session,
            None => return,
        };

        if !session.bound() {
            self.bind_session(&session, frame).await;
            return;
        }

        dispatcher::dispatch(self, &session, frame).await;
    }

    /// Handles a closing connection: the member leaves its room.
    pub async fn on_close(&self, wsid: u64) {
        let session = {
            let mut sessions = self.inner.sessions.lock();
            sessions.remove(&wsid)
        };
        if let Some(session) = session {
            debug!("connection closed [wsid:{}]", wsid);
            dispatcher::leave_current_room(self, &session).await;
        }
    }

    pub(crate) fn session(&self, wsid: u64) -> Option<WsSession> {
        self.inner.sessions.lock().get(&wsid).cloned()
    }

    /// Sends a frame to the session a member is bound to.
    pub(crate) fn send_to_member(&self, member: &RoomMember, value: &Value) {
        if let Some(session) = self.session(member.wsid()) {
            session.send(value);
        }
    }

    async fn bind_session(&self, session: &WsSession, frame: &str) {
        match tickets::redeem_ticket(&self.inner.kv, frame.trim()).await {
            Ok(session_id) => {
                debug!("session bound [wsid:{}]", session.wsid());

                // Resolve the session to a user; sessions without a user
                // profile fall back to the session id itself.
                let session_doc = self
                    .inner
                    .kv
                    .get(collections::SESSIONS, &session_id)
                    .await
                    .ok()
                    .flatten();
                let user_id = session_doc
                    .as_ref()
                    .and_then(|doc| doc.get("user"))
                    .and_then(Value::as_str)
                    .unwrap_or(&session_id)
                    .to_string();
                let user_name = session_doc
                    .as_ref()
                    .and_then(|doc| doc.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or(&user_id)
                    .to_string();

                session.inner.session_id.lock().replace(session_id);
                session.inner.user_id.lock().replace(user_id);
                *session.inner.user_name.lock() = user_name;
            }
            Err(error) => {
                warn!(
                    "ticket handshake failed [wsid:{}]: {}",
                    session.wsid(),
                    error,
                );
                session.close_socket();
                self.inner.sessions.lock().remove(&session.wsid());
            }
        }
    }
}
