//! Full-stack exercise against a real SFU worker binary.
//!
//! Requires `MEDIAHUB_WORKER_BIN` to point at the worker executable;
//! without it the test is a no-op so plain `cargo test` stays green on
//! machines without the worker installed.

mod media_stack {
    use futures_lite::future;
    use mediahub::data_structures::TransportListenIp;
    use mediahub::prelude::*;
    use mediahub::transport::TransportGeneric;
    use serde_json::json;
    use std::env;
    use std::num::{NonZeroU32, NonZeroU8};
    use std::path::PathBuf;

    fn init() {
        let mut builder = env_logger::builder();
        if env::var(env_logger::DEFAULT_FILTER_ENV).is_err() {
            builder.filter_level(log::LevelFilter::Off);
        }
        let _ = builder.is_test(true).try_init();
    }

    fn worker_binary() -> Option<PathBuf> {
        match env::var("MEDIAHUB_WORKER_BIN") {
            Ok(path) => Some(path.into()),
            Err(_) => {
                eprintln!("MEDIAHUB_WORKER_BIN not set, skipping");
                None
            }
        }
    }

    fn media_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::from([("useinbandfec", 1u32.into())]),
                rtcp_feedback: vec![],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::new(),
                rtcp_feedback: vec![],
            },
        ]
    }

    #[test]
    fn produce_and_consume_over_webrtc_transport() {
        init();

        let worker_binary = match worker_binary() {
            Some(worker_binary) => worker_binary,
            None => return,
        };

        future::block_on(async move {
            let worker_manager = WorkerManager::new(worker_binary);
            let worker = worker_manager
                .create_worker(WorkerSettings::default())
                .await
                .expect("failed to create worker");

            let router = worker
                .create_router(RouterOptions::new(media_codecs()))
                .await
                .expect("failed to create router");

            let transport = router
                .create_webrtc_transport(WebRtcTransportOptions::new(TransportListenIps::new(
                    TransportListenIp {
                        ip: "127.0.0.1".parse().unwrap(),
                        announced_ip: None,
                    },
                )))
                .await
                .expect("failed to create transport");

            let producer = transport
                .produce(ProducerOptions::new(
                    MediaKind::Audio,
                    serde_json::from_value(json!({
                        "mid": "0",
                        "codecs": [{
                            "mimeType": "audio/opus",
                            "payloadType": 111,
                            "clockRate": 48000,
                            "channels": 2,
                            "parameters": {"useinbandfec": 1},
                            "rtcpFeedback": [],
                        }],
                        "headerExtensions": [],
                        "encodings": [{"ssrc": 222222222}],
                        "rtcp": {"cname": "qwerty"},
                    }))
                    .unwrap(),
                ))
                .await
                .expect("failed to produce");

            assert!(!producer.paused());
            assert_eq!(producer.kind(), MediaKind::Audio);

            let consumer = transport
                .consume(ConsumerOptions::new(
                    producer.id(),
                    router.rtp_capabilities().clone(),
                ))
                .await
                .expect("failed to consume");

            assert_eq!(consumer.producer_id(), producer.id());
            let ssrc = consumer.rtp_parameters().encodings[0].ssrc.unwrap();
            assert!((100_000_000..1_000_000_000).contains(&ssrc));

            let stats = transport.get_stats().await.expect("failed to get stats");
            assert!(!stats.is_empty());

            producer.pause().await.expect("failed to pause");
            assert!(producer.paused());
            producer.pause().await.expect("pause is idempotent");
            assert!(producer.paused());

            router.close();
        });
    }
}
