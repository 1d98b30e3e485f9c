mod ws_session {
    use futures_lite::future;
    use mediahub::kv::{collections, Kv, MemKv};
    use mediahub::worker_manager::WorkerManager;
    use mediahub::ws::{WsServer, WsSocket};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct MockSocket {
        frames: Mutex<Vec<Value>>,
        closed: AtomicBool,
    }

    impl MockSocket {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        fn last_frame(&self) -> Option<Value> {
            self.frames.lock().last().cloned()
        }

        fn closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl WsSocket for MockSocket {
        fn write(&self, text: &str) {
            if let Ok(value) = serde_json::from_str(text) {
                self.frames.lock().push(value);
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn server_with_kv() -> (WsServer, Arc<dyn Kv>) {
        let worker_manager = WorkerManager::new("/nonexistent/sfu-worker".into());
        let kv: Arc<dyn Kv> = Arc::new(MemKv::new());
        let server = WsServer::new(&worker_manager, Arc::clone(&kv));
        (server, kv)
    }

    async fn seed_session(kv: &Arc<dyn Kv>, session_id: &str, user: &str, name: &str) {
        kv.put(
            collections::SESSIONS,
            session_id,
            json!({ "user": user, "name": name }),
        )
        .await
        .unwrap();
    }

    #[test]
    fn ticket_handshake_binds_session_once() {
        future::block_on(async {
            let (server, kv) = server_with_kv();
            seed_session(&kv, "sid-1", "alice", "Alice").await;

            let ticket = server.issue_ticket("sid-1").await.unwrap();

            let socket = MockSocket::new();
            let wsid = server.on_open(socket.clone());
            server.on_message(wsid, &ticket).await;
            assert!(!socket.closed());

            // The session now responds to commands.
            server
                .on_message(wsid, &json!({"cmd": "ping", "hook": "h1"}).to_string())
                .await;
            assert_eq!(
                socket.last_frame(),
                Some(json!({"pong": true, "hook": "h1"})),
            );

            // A second connection presenting the same ticket is refused.
            let second = MockSocket::new();
            let second_wsid = server.on_open(second.clone());
            server.on_message(second_wsid, &ticket).await;
            assert!(second.closed());
        });
    }

    #[test]
    fn garbage_first_frame_closes_the_connection() {
        future::block_on(async {
            let (server, _kv) = server_with_kv();

            let socket = MockSocket::new();
            let wsid = server.on_open(socket.clone());
            server.on_message(wsid, "definitely-not-a-ticket").await;
            assert!(socket.closed());
        });
    }

    #[test]
    fn commands_fail_with_stable_error_tokens() {
        future::block_on(async {
            let (server, kv) = server_with_kv();
            seed_session(&kv, "sid-1", "alice", "Alice").await;
            let ticket = server.issue_ticket("sid-1").await.unwrap();

            let socket = MockSocket::new();
            let wsid = server.on_open(socket.clone());
            server.on_message(wsid, &ticket).await;

            // Unknown room.
            server
                .on_message(
                    wsid,
                    &json!({
                        "cmd": "room_join",
                        "uuid": "e58ed763-928c-4155-bee9-fdbaaadc15f3",
                        "hook": "j",
                    })
                    .to_string(),
                )
                .await;
            assert_eq!(
                socket.last_frame(),
                Some(json!({"error": "error.room_not_found", "hook": "j"})),
            );

            // Commands that require membership.
            server
                .on_message(wsid, &json!({"cmd": "rtp_capabilities"}).to_string())
                .await;
            assert_eq!(
                socket.last_frame(),
                Some(json!({"error": "error.not_a_room_member"})),
            );

            // Malformed input.
            server
                .on_message(wsid, &json!({"cmd": "room_join"}).to_string())
                .await;
            assert_eq!(
                socket.last_frame(),
                Some(json!({"error": "error.invalid_input"})),
            );

            // Unknown command.
            server
                .on_message(wsid, &json!({"cmd": "no_such_command"}).to_string())
                .await;
            assert_eq!(
                socket.last_frame(),
                Some(json!({"error": "error.invalid_input"})),
            );
        });
    }

    #[test]
    fn history_rooms_remove_only_touches_owned_rooms() {
        future::block_on(async {
            let (server, kv) = server_with_kv();
            seed_session(&kv, "sid-1", "alice", "Alice").await;
            let ticket = server.issue_ticket("sid-1").await.unwrap();

            // Two room documents: one owned by alice, one by bob.
            server
                .rooms()
                .history()
                .create_room_doc("room-a", "cid-a", "alice's", "alice")
                .await
                .unwrap();
            server
                .rooms()
                .history()
                .create_room_doc("room-b", "cid-b", "bob's", "bob")
                .await
                .unwrap();

            let socket = MockSocket::new();
            let wsid = server.on_open(socket.clone());
            server.on_message(wsid, &ticket).await;

            server
                .on_message(
                    wsid,
                    &json!({
                        "cmd": "history_rooms_remove",
                        "uuids": ["room-a", "room-b"],
                    })
                    .to_string(),
                )
                .await;

            let history = server.rooms().history();
            assert!(history.room_doc("room-a").await.unwrap().is_none());
            assert!(history.room_doc("room-b").await.unwrap().is_some());
        });
    }

    #[test]
    fn room_info_get_reads_persisted_documents() {
        future::block_on(async {
            let (server, kv) = server_with_kv();
            seed_session(&kv, "sid-1", "alice", "Alice").await;
            let ticket = server.issue_ticket("sid-1").await.unwrap();

            server
                .rooms()
                .history()
                .create_room_doc("room-a", "cid-a", "standup", "alice")
                .await
                .unwrap();

            let socket = MockSocket::new();
            let wsid = server.on_open(socket.clone());
            server.on_message(wsid, &ticket).await;

            server
                .on_message(
                    wsid,
                    &json!({"cmd": "room_info_get", "uuid": "room-a"}).to_string(),
                )
                .await;

            let frame = socket.last_frame().unwrap();
            assert_eq!(frame["info"]["name"], "standup");
            assert_eq!(frame["info"]["owner"], "alice");
            // The events log stays server-side.
            assert!(frame["info"].get("events").is_none());
        });
    }
}
