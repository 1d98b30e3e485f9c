//! Data structures shared between multiple modules and the worker wire
//! protocol.

use crate::consumer::ConsumerId;
use crate::data_consumer::DataConsumerId;
use crate::data_producer::DataProducerId;
use crate::producer::ProducerId;
use crate::router::RouterId;
use crate::rtp_observer::RtpObserverId;
use crate::transport::TransportId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::any::Any;
use std::net::IpAddr;
use std::sync::Arc;

/// Container for arbitrary data attached to a resource by the application.
///
/// The control plane never looks inside, it is carried around for the
/// caller's convenience.
#[derive(Clone)]
pub struct AppData(Arc<dyn Any + Send + Sync>);

impl std::fmt::Debug for AppData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppData").finish_non_exhaustive()
    }
}

impl Default for AppData {
    fn default() -> Self {
        Self(Arc::new(()))
    }
}

impl AppData {
    pub fn new<T: Any + Send + Sync>(app_data: T) -> Self {
        Self(Arc::new(app_data))
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

/// Listening IP with an optional announced IP (useful when the server sits
/// behind NAT).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportListenIp {
    pub ip: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<IpAddr>,
}

/// Identity of a resource as the worker sees it; sent as `internal` on every
/// command targeting the resource.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouterInternal {
    pub(crate) router_id: RouterId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportInternal {
    pub(crate) router_id: RouterId,
    pub(crate) transport_id: TransportId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProducerInternal {
    pub(crate) router_id: RouterId,
    pub(crate) transport_id: TransportId,
    pub(crate) producer_id: ProducerId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConsumerInternal {
    pub(crate) router_id: RouterId,
    pub(crate) transport_id: TransportId,
    pub(crate) consumer_id: ConsumerId,
    pub(crate) producer_id: ProducerId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DataProducerInternal {
    pub(crate) router_id: RouterId,
    pub(crate) transport_id: TransportId,
    pub(crate) data_producer_id: DataProducerId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DataConsumerInternal {
    pub(crate) router_id: RouterId,
    pub(crate) transport_id: TransportId,
    pub(crate) data_producer_id: DataProducerId,
    pub(crate) data_consumer_id: DataConsumerId,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RtpObserverInternal {
    pub(crate) router_id: RouterId,
    pub(crate) rtp_observer_id: RtpObserverId,
}

/// ICE role of the transport; the worker is always the controlled side.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceRole {
    Controlled,
    Controlling,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_lite: Option<bool>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceCandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceCandidateTcpType {
    Passive,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: IpAddr,
    pub protocol: TransportProtocol,
    pub port: u16,
    pub r#type: IceCandidateType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<IceCandidateTcpType>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Connected,
    Completed,
    Disconnected,
    Closed,
}

/// Local/remote endpoint pair reported by the worker for a transport.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TransportTuple {
    #[serde(rename_all = "camelCase")]
    WithRemote {
        local_ip: IpAddr,
        local_port: u16,
        remote_ip: IpAddr,
        remote_port: u16,
        protocol: TransportProtocol,
    },
    #[serde(rename_all = "camelCase")]
    LocalOnly {
        local_ip: IpAddr,
        local_port: u16,
        protocol: TransportProtocol,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

/// Hash function used for a DTLS certificate fingerprint.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub enum FingerprintAlgorithm {
    #[serde(rename = "sha-1")]
    Sha1,
    #[serde(rename = "sha-224")]
    Sha224,
    #[serde(rename = "sha-256")]
    Sha256,
    #[serde(rename = "sha-384")]
    Sha384,
    #[serde(rename = "sha-512")]
    Sha512,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct DtlsFingerprint {
    pub algorithm: FingerprintAlgorithm,
    pub value: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SctpState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Direction of a `trace` event.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventDirection {
    In,
    Out,
}

/// SCTP payload protocol identifiers used by WebRTC data channels,
/// RFC 8831 section 8.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize_repr, Serialize_repr)]
#[repr(u32)]
pub enum WebRtcMessagePpid {
    String = 51,
    Binary = 53,
    StringEmpty = 56,
    BinaryEmpty = 57,
}

/// A message transferred over a data channel.
///
/// Empty messages cannot be represented on the wire, so they are sent as a
/// single space (string) or a single zero byte (binary) under dedicated
/// PPIDs and reconstructed as empty on the receiving side.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WebRtcMessage {
    String(String),
    Binary(Bytes),
    EmptyString,
    EmptyBinary,
}

impl WebRtcMessage {
    pub(crate) fn into_ppid_and_payload(self) -> (WebRtcMessagePpid, Bytes) {
        match self {
            WebRtcMessage::String(string) => (WebRtcMessagePpid::String, Bytes::from(string)),
            WebRtcMessage::Binary(binary) => (WebRtcMessagePpid::Binary, binary),
            WebRtcMessage::EmptyString => {
                (WebRtcMessagePpid::StringEmpty, Bytes::from_static(b" "))
            }
            WebRtcMessage::EmptyBinary => {
                (WebRtcMessagePpid::BinaryEmpty, Bytes::from_static(&[0u8]))
            }
        }
    }

    pub(crate) fn new(ppid: u32, payload: Bytes) -> Result<Self, u32> {
        match ppid {
            51 => Ok(WebRtcMessage::String(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
            53 => Ok(WebRtcMessage::Binary(payload)),
            56 => Ok(WebRtcMessage::EmptyString),
            57 => Ok(WebRtcMessage::EmptyBinary),
            ppid => Err(ppid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ppid_selection_follows_rfc_8831() {
        let (ppid, payload) = WebRtcMessage::String("hi".to_string()).into_ppid_and_payload();
        assert_eq!(ppid, WebRtcMessagePpid::String);
        assert_eq!(payload, Bytes::from_static(b"hi"));

        let (ppid, _) =
            WebRtcMessage::Binary(Bytes::from_static(b"\x01\x02")).into_ppid_and_payload();
        assert_eq!(ppid, WebRtcMessagePpid::Binary);

        let (ppid, payload) = WebRtcMessage::EmptyString.into_ppid_and_payload();
        assert_eq!(ppid, WebRtcMessagePpid::StringEmpty);
        assert_eq!(payload, Bytes::from_static(b" "));

        let (ppid, payload) = WebRtcMessage::EmptyBinary.into_ppid_and_payload();
        assert_eq!(ppid, WebRtcMessagePpid::BinaryEmpty);
        assert_eq!(payload, Bytes::from_static(&[0u8]));
    }

    #[test]
    fn message_reconstruction_round_trips_empties() {
        assert_eq!(
            WebRtcMessage::new(56, Bytes::from_static(b" ")),
            Ok(WebRtcMessage::EmptyString)
        );
        assert_eq!(
            WebRtcMessage::new(57, Bytes::from_static(&[0u8])),
            Ok(WebRtcMessage::EmptyBinary)
        );
        assert_eq!(WebRtcMessage::new(99, Bytes::new()), Err(99));
    }
}
