//! Re-exports of the types most embeddings need.

pub use crate::consumer::{Consumer, ConsumerId, ConsumerLayers, ConsumerOptions};
pub use crate::data_consumer::{DataConsumer, DataConsumerId, DataConsumerOptions};
pub use crate::data_producer::{DataProducer, DataProducerId, DataProducerOptions};
pub use crate::data_structures::{
    AppData, DtlsParameters, IceCandidate, IceParameters, TransportListenIp, WebRtcMessage,
};
pub use crate::direct_transport::{DirectTransport, DirectTransportOptions};
pub use crate::events::{Event, EventBus, EventHandlerId, EventKind};
pub use crate::kv::{Kv, KvError, MemKv};
pub use crate::plain_transport::{PlainTransport, PlainTransportOptions};
pub use crate::producer::{Producer, ProducerId, ProducerOptions};
pub use crate::registry::{Registry, Resource, ResourceId};
pub use crate::room::member::{MemberId, MemberResource, MemberResourceFlags, RoomMember};
pub use crate::room::{Room, RoomFlags, RoomId, RoomOptions, Rooms};
pub use crate::router::{Router, RouterId, RouterOptions};
pub use crate::rtp_observer::{
    ActiveSpeakerObserver, ActiveSpeakerObserverOptions, AudioLevelObserver,
    AudioLevelObserverOptions,
};
pub use crate::rtp_parameters::{
    MediaKind, MimeTypeAudio, MimeTypeVideo, RtcpFeedback, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpCodecParametersParameters, RtpParameters,
};
pub use crate::sctp_parameters::{NumSctpStreams, SctpStreamParameters};
pub use crate::transport::{Transport, TransportGeneric, TransportId};
pub use crate::webrtc_transport::{
    TransportListenIps, WebRtcTransport, WebRtcTransportOptions,
    WebRtcTransportRemoteParameters,
};
pub use crate::worker::{Worker, WorkerId, WorkerLogLevel, WorkerLogTag, WorkerSettings};
pub use crate::worker_manager::{WorkerManager, WorkerPoolSettings};
pub use crate::ws::{WsServer, WsServerOptions, WsSession, WsSocket};
