//! Persistent room history: one `rooms` document per room session with an
//! append-only events log, plus `joins` rows and gauge samples.

use crate::kv::{collections, Kv, KvError};
use log::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch; the timestamp format of the events
/// log.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle to the persistent side of the room domain.
#[derive(Clone)]
pub struct RoomHistory {
    kv: Arc<dyn Kv>,
}

impl RoomHistory {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    pub(crate) fn kv(&self) -> &Arc<dyn Kv> {
        &self.kv
    }

    /// Creates the document of a new room session.
    ///
    /// When a room with the same uuid existed before, its document is
    /// archived first: uuid and cid swap places and the document is
    /// flagged as a past session, preserving cross-session history.
    pub async fn create_room_doc(
        &self,
        uuid: &str,
        cid: &str,
        name: &str,
        owner: &str,
    ) -> Result<(), KvError> {
        if let Some(mut prior) = self.kv.get(collections::ROOMS, uuid).await? {
            let prior_cid = prior
                .get("cid")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if let Some(doc) = prior.as_object_mut() {
                doc.insert("uuid".to_string(), Value::String(prior_cid.clone()));
                doc.insert("cid".to_string(), Value::String(uuid.to_string()));
                doc.insert("session".to_string(), Value::Bool(true));
            }
            if prior_cid.is_empty() {
                warn!("archiving room document without cid [uuid:{}]", uuid);
            } else {
                self.kv.put(collections::ROOMS, &prior_cid, prior).await?;
            }
        }

        self.kv
            .put(
                collections::ROOMS,
                uuid,
                json!({
                    "uuid": uuid,
                    "cid": cid,
                    "name": name,
                    "owner": owner,
                    "ctime": now_ms(),
                    "session": false,
                    "events": [["created", now_ms()]],
                }),
            )
            .await
    }

    /// Appends one event row to the room's events log.
    pub async fn append_event(&self, uuid: &str, event: Value) -> Result<(), KvError> {
        if let Some(mut doc) = self.kv.get(collections::ROOMS, uuid).await? {
            if let Some(events) = doc.get_mut("events").and_then(Value::as_array_mut) {
                events.push(event);
            }
            self.kv.put(collections::ROOMS, uuid, doc).await?;
        } else {
            warn!("appending event to missing room document [uuid:{}]", uuid);
        }
        Ok(())
    }

    pub async fn rename(&self, uuid: &str, old_name: &str, new_name: &str) -> Result<(), KvError> {
        self.kv
            .patch(collections::ROOMS, uuid, json!({ "name": new_name }))
            .await?;
        self.append_event(uuid, json!(["renamed", now_ms(), old_name, new_name]))
            .await
    }

    /// Records a user joining: events row plus the `joins` row keyed
    /// `<user_id>:<cid>`.
    pub async fn record_join(
        &self,
        uuid: &str,
        cid: &str,
        user_id: &str,
        member_uuid: &str,
        member_name: &str,
    ) -> Result<(), KvError> {
        self.append_event(
            uuid,
            json!(["joined", now_ms(), user_id, member_uuid, member_name]),
        )
        .await?;
        let key = format!("{}:{}", user_id, cid);
        self.kv
            .put(
                collections::JOINS,
                &key,
                json!({ "k": key, "ts": now_ms() }),
            )
            .await
    }

    pub async fn record_leave(
        &self,
        uuid: &str,
        user_id: &str,
        member_name: &str,
    ) -> Result<(), KvError> {
        self.append_event(uuid, json!(["left", now_ms(), user_id, member_name]))
            .await
    }

    pub async fn record_message(
        &self,
        uuid: &str,
        user_id: &str,
        member_name: &str,
        recipient_user_id: Option<&str>,
        message_html: &str,
    ) -> Result<(), KvError> {
        self.append_event(
            uuid,
            json!([
                "message",
                now_ms(),
                user_id,
                member_name,
                recipient_user_id,
                message_html,
            ]),
        )
        .await
    }

    pub async fn record_recording(&self, uuid: &str, recording: bool) -> Result<(), KvError> {
        let tag = if recording { "recstart" } else { "recstop" };
        self.append_event(uuid, json!([tag, now_ms()])).await
    }

    /// Records the first whiteboard open of a session.
    pub async fn record_whiteboard(
        &self,
        uuid: &str,
        cid: &str,
        member_name: &str,
        link: &str,
    ) -> Result<(), KvError> {
        self.append_event(uuid, json!(["whiteboard", now_ms(), member_name, link]))
            .await?;
        self.kv
            .put(
                collections::WHITEBOARDS,
                cid,
                json!({ "cid": cid, "link": link }),
            )
            .await
    }

    pub async fn record_closed(&self, uuid: &str) -> Result<(), KvError> {
        self.append_event(uuid, json!(["closed", now_ms()])).await
    }

    /// The room document, if any.
    pub async fn room_doc(&self, uuid: &str) -> Result<Option<Value>, KvError> {
        self.kv.get(collections::ROOMS, uuid).await
    }

    /// Message rows of the room's events log.
    pub async fn room_messages(&self, uuid: &str) -> Result<Vec<Value>, KvError> {
        Ok(self
            .kv
            .get(collections::ROOMS, uuid)
            .await?
            .and_then(|doc| doc.get("events").cloned())
            .and_then(|events| events.as_array().cloned())
            .map(|events| {
                events
                    .into_iter()
                    .filter(|event| {
                        event
                            .get(0)
                            .and_then(Value::as_str)
                            .map(|tag| tag == "message")
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Room documents (current and archived sessions) owned by a user.
    pub async fn rooms_of_owner(&self, owner: &str) -> Result<Vec<Value>, KvError> {
        Ok(self
            .kv
            .list(collections::ROOMS)
            .await?
            .into_iter()
            .filter(|doc| {
                doc.get("owner")
                    .and_then(Value::as_str)
                    .map(|doc_owner| doc_owner == owner)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Removes room documents owned by a user together with their `joins`
    /// rows.
    pub async fn remove_rooms(&self, owner: &str, uuids: &[String]) -> Result<(), KvError> {
        for uuid in uuids {
            let doc = match self.kv.get(collections::ROOMS, uuid).await? {
                Some(doc) => doc,
                None => continue,
            };
            let doc_owner = doc.get("owner").and_then(Value::as_str).unwrap_or_default();
            if doc_owner != owner {
                continue;
            }
            let cid = doc.get("cid").and_then(Value::as_str).unwrap_or_default();
            self.kv.del(collections::ROOMS, uuid).await?;

            let join_suffix = format!(":{}", cid);
            let joins = self.kv.list(collections::JOINS).await?;
            for join in joins {
                if let Some(key) = join.get("k").and_then(Value::as_str) {
                    if key.ends_with(&join_suffix) {
                        self.kv.del(collections::JOINS, key).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stores one `{t, g, l}` gauge sample.
    pub async fn record_gauge(&self, gauge: &str, level: i64) -> Result<(), KvError> {
        let t = now_ms();
        self.kv
            .put(
                collections::GAUGES,
                &format!("{}:{}", t, gauge),
                json!({ "t": t, "g": gauge, "l": level }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;
    use futures_lite::future;

    #[test]
    fn same_uuid_recreation_archives_prior_session() {
        future::block_on(async {
            let history = RoomHistory::new(Arc::new(MemKv::new()));
            history
                .create_room_doc("room-uuid", "cid-1", "standup", "alice")
                .await
                .unwrap();
            history
                .append_event("room-uuid", json!(["closed", 1u64]))
                .await
                .unwrap();

            history
                .create_room_doc("room-uuid", "cid-2", "standup", "alice")
                .await
                .unwrap();

            // Fresh document under the room uuid, new cid.
            let fresh = history.room_doc("room-uuid").await.unwrap().unwrap();
            assert_eq!(fresh["cid"], "cid-2");
            assert_eq!(fresh["session"], false);
            assert_eq!(fresh["events"].as_array().unwrap().len(), 1);

            // Archived document under the old cid, uuid/cid swapped.
            let archived = history.room_doc("cid-1").await.unwrap().unwrap();
            assert_eq!(archived["uuid"], "cid-1");
            assert_eq!(archived["cid"], "room-uuid");
            assert_eq!(archived["session"], true);
        });
    }

    #[test]
    fn join_leave_log_shape() {
        future::block_on(async {
            let history = RoomHistory::new(Arc::new(MemKv::new()));
            history
                .create_room_doc("x", "cid", "room x", "u1")
                .await
                .unwrap();
            history
                .record_join("x", "cid", "u1", "m1", "U1")
                .await
                .unwrap();
            history
                .record_join("x", "cid", "u2", "m2", "U2")
                .await
                .unwrap();
            history.record_leave("x", "u2", "U2").await.unwrap();
            history.record_closed("x").await.unwrap();

            let doc = history.room_doc("x").await.unwrap().unwrap();
            let events = doc["events"].as_array().unwrap();
            let tags: Vec<&str> = events
                .iter()
                .map(|event| event[0].as_str().unwrap())
                .collect();
            assert_eq!(tags, vec!["created", "joined", "joined", "left", "closed"]);

            assert_eq!(events[1][2], "u1");
            assert_eq!(events[1][3], "m1");
            assert_eq!(events[1][4], "U1");
            assert_eq!(events[3][2], "u2");
            assert_eq!(events[3][3], "U2");

            // Timestamps are monotonic.
            let timestamps: Vec<u64> = events
                .iter()
                .map(|event| event[1].as_u64().unwrap())
                .collect();
            let mut sorted = timestamps.clone();
            sorted.sort_unstable();
            assert_eq!(timestamps, sorted);

            // The joins row is keyed by user and session id.
            let joins = history.kv().list(collections::JOINS).await.unwrap();
            assert_eq!(joins.len(), 2);
            assert!(joins
                .iter()
                .any(|row| row["k"].as_str() == Some("u1:cid")));
        });
    }
}
