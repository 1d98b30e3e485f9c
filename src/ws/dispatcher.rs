//! Dispatch of WebSocket commands.
//!
//! Frames are JSON objects `{cmd, hook?, ...}`; the response mirrors the
//! caller's `hook`, failures produce `{error, hook?}` with a stable token
//! vocabulary.

use crate::consumer::{ConsumerId, ConsumerLayers, ConsumerOptions};
use crate::data_structures::DtlsParameters;
use crate::events::EventKind;
use crate::kv::collections;
use crate::producer::{Producer, ProducerId, ProducerOptions};
use crate::room::chat::sanitize_message;
use crate::room::history::now_ms;
use crate::room::member::{MemberResource, MemberResourceFlags, RoomMember};
use crate::room::{Room, RoomFlags, RoomId, RoomOptions};
use crate::router::transport::{Transport, TransportId};
use crate::rtp_parameters::{MediaKind, RtpCapabilities, RtpParameters};
use crate::webrtc_transport::{
    TransportListenIps, WebRtcTransport, WebRtcTransportOptions, WebRtcTransportRemoteParameters,
};
use crate::ws::{WsServer, WsSession};
use log::*;
use serde_json::{json, Map, Value};
use std::str::FromStr;
use thiserror::Error;

/// Command failure surfaced to the client.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("room not found")]
    RoomNotFound,
    #[error("not a room member")]
    NotARoomMember,
    #[error("insufficient permissions")]
    InsufficientPermissions,
    #[error("invalid input")]
    InvalidInput,
    #[error("unspecified error")]
    Unspecified,
}

impl WsError {
    fn token(&self) -> &'static str {
        match self {
            WsError::RoomNotFound => "error.room_not_found",
            WsError::NotARoomMember => "error.not_a_room_member",
            WsError::InsufficientPermissions => "error.insufficient_permissions",
            WsError::InvalidInput => "error.invalid_input",
            WsError::Unspecified => "error.unspecified",
        }
    }
}

impl From<crate::kv::KvError> for WsError {
    fn from(_: crate::kv::KvError) -> Self {
        WsError::Unspecified
    }
}

impl From<crate::room::RoomError> for WsError {
    fn from(error: crate::room::RoomError) -> Self {
        match error {
            crate::room::RoomError::Closed => WsError::RoomNotFound,
            _ => WsError::Unspecified,
        }
    }
}

impl From<crate::worker::RequestError> for WsError {
    fn from(_: crate::worker::RequestError) -> Self {
        WsError::Unspecified
    }
}

/// Entry point for one command frame.
pub(crate) async fn dispatch(server: &WsServer, session: &WsSession, frame: &str) {
    let payload: Value = match serde_json::from_str(frame) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => {
            warn!("unparseable frame [wsid:{}]", session.wsid());
            return;
        }
    };
    let hook = payload
        .get("hook")
        .and_then(Value::as_str)
        .map(str::to_string);
    let cmd = match payload.get("cmd").and_then(Value::as_str) {
        Some(cmd) => cmd.to_string(),
        None => {
            reply_error(session, &hook, &WsError::InvalidInput);
            return;
        }
    };

    match handle_command(server, session, &cmd, &payload).await {
        Ok(response) => {
            let mut response = match response {
                Some(Value::Object(map)) => map,
                Some(_) | None => Map::new(),
            };
            if let Some(hook) = hook {
                response.insert("hook".to_string(), Value::String(hook));
            }
            session.send(&Value::Object(response));
        }
        Err(error) => {
            debug!("command {} failed [wsid:{}]: {}", cmd, session.wsid(), error);
            reply_error(session, &hook, &error);
        }
    }
}

fn reply_error(session: &WsSession, hook: &Option<String>, error: &WsError) {
    let mut response = Map::new();
    response.insert(
        "error".to_string(),
        Value::String(error.token().to_string()),
    );
    if let Some(hook) = hook {
        response.insert("hook".to_string(), Value::String(hook.clone()));
    }
    session.send(&Value::Object(response));
}

async fn handle_command(
    server: &WsServer,
    session: &WsSession,
    cmd: &str,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    match cmd {
        "ping" => Ok(Some(json!({ "pong": true }))),
        "room_create" => room_create(server, session, payload).await,
        "room_join" => room_join(server, session, payload).await,
        "room_leave" => {
            leave_current_room(server, session).await;
            Ok(None)
        }
        "room_message" => room_message(server, session, payload).await,
        "room_messages" => room_messages(server, session).await,
        "room_info_get" => room_info_get(server, session, payload).await,
        "room_info_set" => room_info_set(server, session, payload).await,
        "rtp_capabilities" => rtp_capabilities(session),
        "transports_init" => transports_init(server, session, payload).await,
        "transport_connect" => transport_connect(session, payload).await,
        "transport_produce" => transport_produce(server, session, payload).await,
        "transport_restart_ice" => transport_restart_ice(session, payload).await,
        "producer_close" => producer_close(session, payload),
        "producer_pause" => producer_pause(session, payload).await,
        "producer_resume" => producer_resume(session, payload).await,
        "consumer_pause" => consumer_pause(session, payload).await,
        "consumer_resume" => consumer_resume(session, payload).await,
        "consumer_set_priority" => consumer_set_priority(session, payload).await,
        "consumer_set_preferred_layers" => {
            consumer_set_preferred_layers(session, payload).await
        }
        "acquire_room_streams" => acquire_room_streams(server, session).await,
        "member_info_set" => member_info_set(server, session, payload).await,
        "recording" => recording(server, session, payload).await,
        "whiteboard_open" => whiteboard_open(server, session).await,
        "history_rooms_remove" => history_rooms_remove(server, session, payload).await,
        _ => {
            debug!("unknown command {} [wsid:{}]", cmd, session.wsid());
            Err(WsError::InvalidInput)
        }
    }
}

fn require_user(session: &WsSession) -> Result<String, WsError> {
    session.user_id().ok_or(WsError::Unspecified)
}

fn require_room_member(session: &WsSession) -> Result<(Room, RoomMember), WsError> {
    let room = session.room().ok_or(WsError::NotARoomMember)?;
    let member = session.member().ok_or(WsError::NotARoomMember)?;
    if room.closed() || member.closed() {
        return Err(WsError::NotARoomMember);
    }
    Ok((room, member))
}

fn parse_id<T: FromStr>(payload: &Value, field: &str) -> Result<T, WsError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .and_then(|value| T::from_str(value).ok())
        .ok_or(WsError::InvalidInput)
}

fn member_description(room: &Room, member: &RoomMember) -> Value {
    json!({
        "uuid": member.id().to_string(),
        "userId": member.user_id(),
        "name": member.name(),
        "owner": member.user_id() == room.owner_user_id(),
    })
}

fn room_description(room: &Room, member: &RoomMember) -> Value {
    let members: Vec<Value> = room
        .visible_members(member)
        .iter()
        .map(|visible| member_description(room, visible))
        .collect();
    json!({
        "room": {
            "uuid": room.id().to_string(),
            "cid": room.cid().to_string(),
            "name": room.name(),
            "owner": room.owner_user_id(),
            "flags": {
                "meeting": room.flags().contains(RoomFlags::MEETING),
                "webinar": room.flags().contains(RoomFlags::WEBINAR),
                "light": room.flags().contains(RoomFlags::LIGHT),
                "alo": room.flags().contains(RoomFlags::ALO),
            },
            "recording": room.recording(),
            "whiteboard": room.whiteboard_link(),
        },
        "member": member.id().to_string(),
        "members": members,
    })
}

/// Sends a frame to every member the sender is allowed to see, except the
/// sender itself.
fn broadcast(server: &WsServer, room: &Room, from: &RoomMember, value: &Value) {
    for member in room.visible_members(from) {
        if member.id() != from.id() {
            server.send_to_member(&member, value);
        }
    }
}

/// Membership gauge: persisted as a `{t, g, l}` sample and pushed to the
/// room owner as an unsolicited `GAUGE` frame.
async fn publish_member_gauge(server: &WsServer, room: &Room) {
    let level = room.members().len() as i64;
    if let Err(error) = server
        .rooms()
        .history()
        .record_gauge("room_members", level)
        .await
    {
        warn!("recording gauge failed: {}", error);
    }
    if let Some(owner) = room.member_of_user(room.owner_user_id()) {
        server.send_to_member(
            &owner,
            &json!({
                "cmd": "GAUGE",
                "t": now_ms(),
                "g": "room_members",
                "l": level,
            }),
        );
    }
}

/// Room leave shared by the command, the socket close path and rejoins.
pub(crate) async fn leave_current_room(server: &WsServer, session: &WsSession) {
    let (room, member) = session.leave_room();
    if let (Some(room), Some(member)) = (room, member) {
        let notification = json!({
            "cmd": "room_member_left",
            "member": member.id().to_string(),
            "userId": member.user_id(),
        });
        broadcast(server, &room, &member, &notification);

        if let Err(error) = room.leave(member.id()).await {
            error!("room leave failed: {}", error);
        }

        publish_member_gauge(server, &room).await;
    }
}

async fn room_create(
    server: &WsServer,
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let user_id = require_user(session)?;

    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("room")
        .to_string();
    let mut options = RoomOptions::new(name);
    if let Some(uuid) = payload.get("uuid").and_then(Value::as_str) {
        options.uuid = Some(RoomId::from_str(uuid).map_err(|_| WsError::InvalidInput)?);
    }
    if payload.get("webinar").and_then(Value::as_bool).unwrap_or(false) {
        options.flags = RoomFlags::WEBINAR;
    }
    if payload.get("light").and_then(Value::as_bool).unwrap_or(false) {
        options.flags |= RoomFlags::LIGHT;
    }
    if payload.get("alo").and_then(Value::as_bool).unwrap_or(false) {
        options.flags |= RoomFlags::ALO;
    }

    let room = server
        .rooms()
        .get_or_create(options, &user_id)
        .await?;

    join_room(server, session, room).await
}

async fn room_join(
    server: &WsServer,
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let room_id: RoomId = parse_id(payload, "uuid")?;
    let room = server.rooms().get(room_id).ok_or(WsError::RoomNotFound)?;

    join_room(server, session, room).await
}

async fn join_room(
    server: &WsServer,
    session: &WsSession,
    room: Room,
) -> Result<Option<Value>, WsError> {
    let user_id = require_user(session)?;

    // Leaving any previous room first keeps one member per connection.
    leave_current_room(server, session).await;

    let member = room
        .join(session.wsid(), user_id, session.user_name(), None)
        .await?;
    session.enter_room(room.clone(), member.clone());

    let notification = json!({
        "cmd": "room_member_join",
        "member": member_description(&room, &member),
    });
    broadcast(server, &room, &member, &notification);

    publish_member_gauge(server, &room).await;

    Ok(Some(room_description(&room, &member)))
}

async fn room_message(
    server: &WsServer,
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let (room, member) = require_room_member(session)?;
    let message = payload.get("message").ok_or(WsError::InvalidInput)?;
    let recipient = payload
        .get("recipient")
        .and_then(Value::as_str)
        .map(str::to_string);

    let html = sanitize_message(message);

    room.history()
        .record_message(
            &room.id().to_string(),
            member.user_id(),
            &member.name(),
            recipient.as_deref(),
            &html,
        )
        .await?;

    let frame = json!({
        "cmd": "message",
        "message": [
            "message",
            now_ms(),
            member.user_id(),
            member.name(),
            recipient,
            html,
        ],
    });

    match payload.get("recipient").and_then(Value::as_str) {
        Some(recipient_user_id) => {
            if let Some(recipient_member) = room.member_of_user(recipient_user_id) {
                server.send_to_member(&recipient_member, &frame);
            }
            session.send(&frame);
        }
        None => {
            broadcast(server, &room, &member, &frame);
            session.send(&frame);
        }
    }

    Ok(None)
}

async fn room_messages(
    server: &WsServer,
    session: &WsSession,
) -> Result<Option<Value>, WsError> {
    let (room, _member) = require_room_member(session)?;
    let messages = server
        .rooms()
        .history()
        .room_messages(&room.id().to_string())
        .await?;
    Ok(Some(json!({ "messages": messages })))
}

async fn room_info_get(
    server: &WsServer,
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let uuid = match payload.get("uuid").and_then(Value::as_str) {
        Some(uuid) => uuid.to_string(),
        None => {
            let (room, _member) = require_room_member(session)?;
            room.id().to_string()
        }
    };

    let mut doc = server
        .rooms()
        .history()
        .room_doc(&uuid)
        .await?
        .ok_or(WsError::RoomNotFound)?;
    if let Some(doc) = doc.as_object_mut() {
        doc.remove("events");
    }
    Ok(Some(json!({ "info": doc })))
}

async fn room_info_set(
    server: &WsServer,
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let (room, member) = require_room_member(session)?;
    if member.user_id() != room.owner_user_id() {
        return Err(WsError::InsufficientPermissions);
    }
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .ok_or(WsError::InvalidInput)?;

    let old_name = room.name();
    room.set_name(name.to_string());
    room.history()
        .rename(&room.id().to_string(), &old_name, name)
        .await?;

    let frame = json!({ "cmd": "room_info", "name": name });
    broadcast(server, &room, &member, &frame);

    Ok(Some(json!({ "name": name })))
}

fn rtp_capabilities(session: &WsSession) -> Result<Option<Value>, WsError> {
    let (room, _member) = require_room_member(session)?;
    let capabilities = serde_json::to_value(room.router().rtp_capabilities())
        .map_err(|_| WsError::Unspecified)?;
    Ok(Some(json!({ "rtpCapabilities": capabilities })))
}

fn transport_description(transport: &WebRtcTransport) -> Value {
    json!({
        "id": Transport::id(transport).to_string(),
        "iceParameters": transport.ice_parameters(),
        "iceCandidates": transport.ice_candidates(),
        "dtlsParameters": transport.dtls_parameters(),
        "sctpParameters": transport.sctp_parameters(),
    })
}

async fn transports_init(
    server: &WsServer,
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let (room, member) = require_room_member(session)?;

    if let Some(capabilities) = payload.get("rtpCapabilities") {
        let capabilities: RtpCapabilities = serde_json::from_value(capabilities.clone())
            .map_err(|_| WsError::InvalidInput)?;
        member.set_rtp_capabilities(capabilities);
    }

    let listen_ips = TransportListenIps::new(server.options().listen_ip);

    let recv_transport = room
        .router()
        .create_webrtc_transport(WebRtcTransportOptions::new(listen_ips.clone()))
        .await
        .map_err(|_| WsError::Unspecified)?;
    member.add_resource(
        MemberResourceFlags::RECV,
        MemberResource::Transport(recv_transport.clone()),
    );

    let mut response = json!({
        "recv": transport_description(&recv_transport),
    });

    // Webinars keep non-owner members receive-only.
    if room.may_produce(&member) {
        let send_transport = room
            .router()
            .create_webrtc_transport(WebRtcTransportOptions::new(listen_ips))
            .await
            .map_err(|_| WsError::Unspecified)?;
        member.add_resource(
            MemberResourceFlags::SEND,
            MemberResource::Transport(send_transport.clone()),
        );
        response["send"] = transport_description(&send_transport);
    }

    Ok(Some(response))
}

async fn transport_connect(
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let (_room, member) = require_room_member(session)?;
    let transport_id: TransportId = parse_id(payload, "id")?;
    let transport = member.transport(transport_id).ok_or(WsError::InvalidInput)?;

    let dtls_parameters: DtlsParameters = payload
        .get("dtlsParameters")
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .ok_or(WsError::InvalidInput)?;

    transport
        .connect(WebRtcTransportRemoteParameters { dtls_parameters })
        .await?;

    Ok(None)
}

async fn transport_produce(
    server: &WsServer,
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let (room, member) = require_room_member(session)?;
    if !room.may_produce(&member) {
        return Err(WsError::InsufficientPermissions);
    }
    let transport = member.send_transport().ok_or(WsError::InvalidInput)?;

    let kind: MediaKind = payload
        .get("kind")
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .ok_or(WsError::InvalidInput)?;
    let rtp_parameters: RtpParameters = payload
        .get("rtpParameters")
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .ok_or(WsError::InvalidInput)?;

    let producer = transport
        .produce(ProducerOptions::new(kind, rtp_parameters))
        .await
        .map_err(|error| {
            debug!("produce failed: {}", error);
            WsError::InvalidInput
        })?;
    member.add_resource(
        MemberResourceFlags::empty(),
        MemberResource::Producer(producer.clone()),
    );

    if kind == MediaKind::Audio {
        if let Some(observer) = room.audio_observer() {
            if let Err(error) = observer.add_producer(producer.id()).await {
                warn!("binding producer to audio observer failed: {}", error);
            }
        }
    }

    // Members that already negotiated capabilities get the new stream
    // pushed as an unsolicited consumer frame right away.
    for other in room.visible_members(&member) {
        if other.id() == member.id() {
            continue;
        }
        if let Some(frame) =
            consume_for_member(&room, &other, &producer, member.id().to_string()).await
        {
            server.send_to_member(&other, &frame);
        }
    }

    let frame = json!({
        "cmd": "room_streams_changed",
        "member": member.id().to_string(),
    });
    broadcast(server, &room, &member, &frame);

    Ok(Some(json!({ "id": producer.id().to_string() })))
}

/// Creates a consumer of `producer` on `viewer`'s receiving transport and
/// returns the unsolicited `consumer` frame for it; `None` when the
/// viewer cannot consume the stream (yet).
async fn consume_for_member(
    room: &Room,
    viewer: &RoomMember,
    producer: &Producer,
    producer_member_id: String,
) -> Option<Value> {
    let rtp_capabilities = viewer.rtp_capabilities()?;
    let recv_transport = viewer.recv_transport()?;
    if !room.router().can_consume(&producer.id(), &rtp_capabilities) {
        return None;
    }

    let mut options = ConsumerOptions::new(producer.id(), rtp_capabilities);
    options.paused = true;
    options.resume_by_producer = true;
    let consumer = match recv_transport.consume(options).await {
        Ok(consumer) => consumer,
        Err(error) => {
            warn!("consume failed: {}", error);
            return None;
        }
    };
    viewer.add_resource(
        MemberResourceFlags::empty(),
        MemberResource::Consumer(consumer.clone()),
    );

    Some(json!({
        "cmd": "consumer",
        "id": consumer.id().to_string(),
        "producerId": producer.id().to_string(),
        "memberId": producer_member_id,
        "kind": consumer.kind(),
        "type": consumer.r#type(),
        "rtpParameters": consumer.rtp_parameters(),
        "paused": consumer.paused(),
        "producerPaused": consumer.producer_paused(),
    }))
}

async fn transport_restart_ice(
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let (_room, member) = require_room_member(session)?;
    let transport = match payload.get("id").and_then(Value::as_str) {
        Some(id) => {
            let transport_id =
                TransportId::from_str(id).map_err(|_| WsError::InvalidInput)?;
            member.transport(transport_id).ok_or(WsError::InvalidInput)?
        }
        None => member.send_transport().ok_or(WsError::InvalidInput)?,
    };

    let ice_parameters = transport.restart_ice().await?;
    Ok(Some(json!({ "iceParameters": ice_parameters })))
}

fn find_producer(session: &WsSession, payload: &Value) -> Result<Producer, WsError> {
    let (_room, member) = require_room_member(session)?;
    let producer_id: ProducerId = parse_id(payload, "id")?;
    member.producer(producer_id).ok_or(WsError::InvalidInput)
}

fn producer_close(session: &WsSession, payload: &Value) -> Result<Option<Value>, WsError> {
    let producer = find_producer(session, payload)?;
    let (_room, member) = require_room_member(session)?;
    producer.close();
    member.forget_producer(producer.id());
    Ok(None)
}

async fn producer_pause(
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let producer = find_producer(session, payload)?;
    producer.pause().await?;
    Ok(None)
}

async fn producer_resume(
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let producer = find_producer(session, payload)?;
    producer.resume().await?;
    Ok(None)
}

fn find_consumer(
    session: &WsSession,
    payload: &Value,
) -> Result<crate::consumer::Consumer, WsError> {
    let (_room, member) = require_room_member(session)?;
    let consumer_id: ConsumerId = parse_id(payload, "id")?;
    member.consumer(consumer_id).ok_or(WsError::InvalidInput)
}

async fn consumer_pause(
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let consumer = find_consumer(session, payload)?;
    consumer.pause().await?;
    Ok(None)
}

async fn consumer_resume(
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let consumer = find_consumer(session, payload)?;
    consumer.resume().await?;
    Ok(None)
}

async fn consumer_set_priority(
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let consumer = find_consumer(session, payload)?;
    let priority = payload
        .get("priority")
        .and_then(Value::as_u64)
        .map(|priority| priority.min(255) as u8)
        .unwrap_or(1);
    consumer.set_priority(priority.max(1)).await?;
    Ok(None)
}

async fn consumer_set_preferred_layers(
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let consumer = find_consumer(session, payload)?;
    let spatial_layer = payload
        .get("spatialLayer")
        .and_then(Value::as_u64)
        .ok_or(WsError::InvalidInput)? as u8;
    let temporal_layer = payload
        .get("temporalLayer")
        .and_then(Value::as_u64)
        .map(|layer| layer as u8);
    consumer
        .set_preferred_layers(ConsumerLayers {
            spatial_layer,
            temporal_layer,
        })
        .await?;
    Ok(None)
}

async fn acquire_room_streams(
    server: &WsServer,
    session: &WsSession,
) -> Result<Option<Value>, WsError> {
    let (room, member) = require_room_member(session)?;
    let rtp_capabilities = member.rtp_capabilities().ok_or(WsError::InvalidInput)?;
    let recv_transport = member.recv_transport().ok_or(WsError::InvalidInput)?;

    // Producers this member already consumes.
    let consumed: Vec<ProducerId> = member
        .consumers()
        .iter()
        .map(|consumer| consumer.producer_id())
        .collect();

    let mut consumers = Vec::new();
    for other in room.visible_members(&member) {
        if other.id() == member.id() {
            continue;
        }
        for producer in other.producers() {
            if consumed.contains(&producer.id()) {
                continue;
            }
            if !room.router().can_consume(&producer.id(), &rtp_capabilities) {
                continue;
            }

            let mut options = ConsumerOptions::new(producer.id(), rtp_capabilities.clone());
            options.paused = true;
            options.resume_by_producer = true;
            let consumer = match recv_transport.consume(options).await {
                Ok(consumer) => consumer,
                Err(error) => {
                    warn!("consume failed: {}", error);
                    continue;
                }
            };
            member.add_resource(
                MemberResourceFlags::empty(),
                MemberResource::Consumer(consumer.clone()),
            );

            consumers.push(json!({
                "id": consumer.id().to_string(),
                "producerId": producer.id().to_string(),
                "memberId": other.id().to_string(),
                "kind": consumer.kind(),
                "type": consumer.r#type(),
                "rtpParameters": consumer.rtp_parameters(),
                "paused": consumer.paused(),
                "producerPaused": consumer.producer_paused(),
            }));
        }
    }

    Ok(Some(json!({ "consumers": consumers })))
}

async fn member_info_set(
    server: &WsServer,
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let (room, member) = require_room_member(session)?;

    if let Some(name) = payload.get("name").and_then(Value::as_str) {
        member.set_name(name.to_string());
        session.set_user_name(name.to_string());
        server
            .kv()
            .patch(
                collections::USERS,
                member.user_id(),
                json!({ "name": name }),
            )
            .await?;

        let frame = json!({
            "cmd": "member_info",
            "member": member.id().to_string(),
            "name": name,
        });
        broadcast(server, &room, &member, &frame);
    }

    if let Some(muted) = payload.get("muted").and_then(Value::as_bool) {
        server.rooms().event_bus().emit(
            EventKind::RoomMemberMute,
            member.local_id(),
            Some(json!({ "muted": muted })),
        );
        let frame = json!({
            "cmd": "member_mute",
            "member": member.id().to_string(),
            "muted": muted,
        });
        broadcast(server, &room, &member, &frame);
    }

    Ok(None)
}

async fn recording(
    server: &WsServer,
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let (room, member) = require_room_member(session)?;
    if member.user_id() != room.owner_user_id() {
        return Err(WsError::InsufficientPermissions);
    }
    let on = payload
        .get("on")
        .and_then(Value::as_bool)
        .ok_or(WsError::InvalidInput)?;

    room.set_recording(on).await?;

    let frame = json!({ "cmd": "recording", "on": on });
    broadcast(server, &room, &member, &frame);

    Ok(Some(json!({ "on": on })))
}

async fn whiteboard_open(
    server: &WsServer,
    session: &WsSession,
) -> Result<Option<Value>, WsError> {
    let (room, member) = require_room_member(session)?;

    let link = format!("/whiteboard/{}", room.cid());
    let first_open = room.open_whiteboard(&member.name(), &link).await?;

    if first_open {
        let frame = json!({
            "cmd": "whiteboard",
            "member": member.id().to_string(),
            "link": link,
        });
        broadcast(server, &room, &member, &frame);
    }

    Ok(Some(json!({ "link": link })))
}

async fn history_rooms_remove(
    server: &WsServer,
    session: &WsSession,
    payload: &Value,
) -> Result<Option<Value>, WsError> {
    let user_id = require_user(session)?;
    let uuids: Vec<String> = payload
        .get("uuids")
        .and_then(Value::as_array)
        .map(|uuids| {
            uuids
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or(WsError::InvalidInput)?;

    server
        .rooms()
        .history()
        .remove_rooms(&user_id, &uuids)
        .await?;

    Ok(None)
}
