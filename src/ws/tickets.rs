//! Single-use tickets binding an authenticated HTTP session to a
//! WebSocket connection.
//!
//! `GET /ws/ticket` (served by the host HTTP layer) calls
//! [`issue_ticket`]; the first frame of the WebSocket connection must be
//! exactly the ticket, which [`redeem_ticket`] resolves back to the
//! session id while deleting the row, so a second use fails.

use crate::kv::{collections, Kv, KvError};
use crate::room::history::now_ms;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Length of a ticket: the textual form of a v4 uuid.
pub const TICKET_LEN: usize = 36;

/// Error of ticket redemption.
#[derive(Debug, Error)]
pub enum TicketError {
    /// The ticket does not exist (never issued, expired or already used).
    #[error("unknown ticket id")]
    UnknownTicketId,
    #[error("persistence failure: {0}")]
    Kv(#[from] KvError),
}

/// Issues a fresh ticket bound to the given session id.
pub async fn issue_ticket(kv: &Arc<dyn Kv>, session_id: &str) -> Result<String, KvError> {
    let ticket = Uuid::new_v4().to_string();
    kv.put(
        collections::TICKETS,
        &ticket,
        json!({
            "name": ticket,
            "sid": session_id,
            "ts": now_ms(),
        }),
    )
    .await?;
    Ok(ticket)
}

/// Resolves a ticket back to its session id, consuming it.
pub async fn redeem_ticket(kv: &Arc<dyn Kv>, ticket: &str) -> Result<String, TicketError> {
    if ticket.len() != TICKET_LEN || Uuid::from_str(ticket).is_err() {
        return Err(TicketError::UnknownTicketId);
    }

    let row = kv
        .get(collections::TICKETS, ticket)
        .await?
        .ok_or(TicketError::UnknownTicketId)?;
    kv.del(collections::TICKETS, ticket).await?;

    row.get("sid")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(TicketError::UnknownTicketId)
}

/// Deletes tickets older than `ttl`; returns how many were removed.
pub async fn sweep_tickets(kv: &Arc<dyn Kv>, ttl: Duration) -> Result<usize, KvError> {
    let deadline = now_ms().saturating_sub(ttl.as_millis() as u64);
    let rows = kv.list(collections::TICKETS).await?;
    let mut removed = 0;
    for row in rows {
        let ts = row.get("ts").and_then(Value::as_u64).unwrap_or(0);
        if ts < deadline {
            if let Some(name) = row.get("name").and_then(Value::as_str) {
                kv.del(collections::TICKETS, name).await?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;
    use futures_lite::future;

    #[test]
    fn ticket_binds_session_exactly_once() {
        future::block_on(async {
            let kv: Arc<dyn Kv> = Arc::new(MemKv::new());
            let ticket = issue_ticket(&kv, "session-1").await.unwrap();
            assert_eq!(ticket.len(), TICKET_LEN);

            let session_id = redeem_ticket(&kv, &ticket).await.unwrap();
            assert_eq!(session_id, "session-1");

            // A second use fails.
            assert!(matches!(
                redeem_ticket(&kv, &ticket).await,
                Err(TicketError::UnknownTicketId),
            ));
        });
    }

    #[test]
    fn malformed_tickets_are_rejected() {
        future::block_on(async {
            let kv: Arc<dyn Kv> = Arc::new(MemKv::new());
            assert!(matches!(
                redeem_ticket(&kv, "not-a-ticket").await,
                Err(TicketError::UnknownTicketId),
            ));
            assert!(matches!(
                redeem_ticket(&kv, "").await,
                Err(TicketError::UnknownTicketId),
            ));
        });
    }

    #[test]
    fn sweeper_removes_stale_tickets() {
        future::block_on(async {
            let kv: Arc<dyn Kv> = Arc::new(MemKv::new());
            let _ticket = issue_ticket(&kv, "session-1").await.unwrap();

            // Nothing is old enough yet.
            assert_eq!(
                sweep_tickets(&kv, Duration::from_secs(60)).await.unwrap(),
                0,
            );
            // With a zero TTL everything goes.
            std::thread::sleep(Duration::from_millis(5));
            assert_eq!(sweep_tickets(&kv, Duration::from_secs(0)).await.unwrap(), 1);
        });
    }
}
