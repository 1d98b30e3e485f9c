//! Typed RTP capabilities and parameters.
//!
//! These structs model what the control plane and endpoints can send and
//! receive at the media level. The wire representation (towards both the
//! worker and WebSocket clients) is JSON in camelCase; everything is kept
//! strongly typed on this side of the boundary.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::iter::FromIterator;
use std::num::{NonZeroU32, NonZeroU8};

/// Media kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Known audio MIME types.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum MimeTypeAudio {
    #[serde(rename = "audio/opus")]
    Opus,
    #[serde(rename = "audio/PCMU")]
    Pcmu,
    #[serde(rename = "audio/PCMA")]
    Pcma,
    #[serde(rename = "audio/G722")]
    G722,
    #[serde(rename = "audio/CN")]
    Cn,
    #[serde(rename = "audio/telephone-event")]
    TelephoneEvent,
}

/// Known video MIME types.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum MimeTypeVideo {
    #[serde(rename = "video/VP8")]
    Vp8,
    #[serde(rename = "video/VP9")]
    Vp9,
    #[serde(rename = "video/H264")]
    H264,
    #[serde(rename = "video/H265")]
    H265,
    #[serde(rename = "video/rtx")]
    Rtx,
}

/// Audio or video MIME type.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MimeType {
    Audio(MimeTypeAudio),
    Video(MimeTypeVideo),
}

impl MimeType {
    pub fn kind(&self) -> MediaKind {
        match self {
            MimeType::Audio(_) => MediaKind::Audio,
            MimeType::Video(_) => MediaKind::Video,
        }
    }
}

/// Transport-layer or codec-specific RTCP feedback.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RtcpFeedback {
    Nack,
    NackPli,
    CcmFir,
    GoogRemb,
    TransportCc,
}

impl RtcpFeedback {
    fn type_and_parameter(&self) -> (&'static str, &'static str) {
        match self {
            RtcpFeedback::Nack => ("nack", ""),
            RtcpFeedback::NackPli => ("nack", "pli"),
            RtcpFeedback::CcmFir => ("ccm", "fir"),
            RtcpFeedback::GoogRemb => ("goog-remb", ""),
            RtcpFeedback::TransportCc => ("transport-cc", ""),
        }
    }
}

impl Serialize for RtcpFeedback {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let (r#type, parameter) = self.type_and_parameter();
        let mut state = serializer.serialize_struct("RtcpFeedback", 2)?;
        state.serialize_field("type", r#type)?;
        state.serialize_field("parameter", parameter)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for RtcpFeedback {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            r#type: String,
            #[serde(default)]
            parameter: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let parameter = raw.parameter.as_deref().unwrap_or("");
        match (raw.r#type.as_str(), parameter) {
            ("nack", "") => Ok(RtcpFeedback::Nack),
            ("nack", "pli") => Ok(RtcpFeedback::NackPli),
            ("ccm", "fir") => Ok(RtcpFeedback::CcmFir),
            ("goog-remb", "") => Ok(RtcpFeedback::GoogRemb),
            ("transport-cc", "") => Ok(RtcpFeedback::TransportCc),
            (r#type, parameter) => Err(serde::de::Error::custom(format!(
                "unsupported rtcp feedback {}/{}",
                r#type, parameter,
            ))),
        }
    }
}

/// Value of a codec parameter: either a string or an unsigned integer.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RtpCodecParametersParametersValue {
    String(String),
    Number(u32),
}

impl From<&str> for RtpCodecParametersParametersValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<u32> for RtpCodecParametersParametersValue {
    fn from(value: u32) -> Self {
        Self::Number(value)
    }
}

/// Codec-specific parameters (`packetization-mode`, `profile-level-id`,
/// `apt`, `useinbandfec`, ...).
#[derive(Debug, Default, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RtpCodecParametersParameters(
    BTreeMap<Cow<'static, str>, RtpCodecParametersParametersValue>,
);

impl<const N: usize> From<[(&'static str, RtpCodecParametersParametersValue); N]>
    for RtpCodecParametersParameters
{
    fn from(array: [(&'static str, RtpCodecParametersParametersValue); N]) -> Self {
        array.iter().cloned().collect()
    }
}

impl FromIterator<(&'static str, RtpCodecParametersParametersValue)>
    for RtpCodecParametersParameters
{
    fn from_iter<T: IntoIterator<Item = (&'static str, RtpCodecParametersParametersValue)>>(
        iter: T,
    ) -> Self {
        let mut parameters = Self::default();
        for (key, value) in iter {
            parameters.insert(key, value);
        }
        parameters
    }
}

impl RtpCodecParametersParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        K: Into<Cow<'static, str>>,
        V: Into<RtpCodecParametersParametersValue>,
    {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&RtpCodecParametersParametersValue> {
        self.0.get(key)
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&Cow<'static, str>, &RtpCodecParametersParametersValue)> {
        self.0.iter()
    }

    /// Numeric parameter lookup with a default, as used by codec matching
    /// (`packetization-mode` is treated as 0 when absent).
    pub(crate) fn number_or(&self, key: &str, default: u32) -> u32 {
        match self.get(key) {
            Some(RtpCodecParametersParametersValue::Number(number)) => *number,
            _ => default,
        }
    }
}

fn default_channels() -> NonZeroU8 {
    NonZeroU8::new(1).unwrap()
}

fn default_true() -> bool {
    true
}

/// Capability of a codec: what can be received for it.
///
/// Exactly one entry exists per supported combination of critical
/// parameters; `preferred_payload_type` is reserved when the router
/// capabilities are built.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RtpCodecCapability {
    #[serde(rename_all = "camelCase")]
    Audio {
        mime_type: MimeTypeAudio,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred_payload_type: Option<u8>,
        clock_rate: NonZeroU32,
        #[serde(default = "default_channels")]
        channels: NonZeroU8,
        #[serde(default)]
        parameters: RtpCodecParametersParameters,
        #[serde(default)]
        rtcp_feedback: Vec<RtcpFeedback>,
    },
    #[serde(rename_all = "camelCase")]
    Video {
        mime_type: MimeTypeVideo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preferred_payload_type: Option<u8>,
        clock_rate: NonZeroU32,
        #[serde(default)]
        parameters: RtpCodecParametersParameters,
        #[serde(default)]
        rtcp_feedback: Vec<RtcpFeedback>,
    },
}

impl RtpCodecCapability {
    pub fn mime_type(&self) -> MimeType {
        match self {
            Self::Audio { mime_type, .. } => MimeType::Audio(*mime_type),
            Self::Video { mime_type, .. } => MimeType::Video(*mime_type),
        }
    }

    pub fn preferred_payload_type(&self) -> Option<u8> {
        match self {
            Self::Audio {
                preferred_payload_type,
                ..
            }
            | Self::Video {
                preferred_payload_type,
                ..
            } => *preferred_payload_type,
        }
    }

    pub(crate) fn set_preferred_payload_type(&mut self, payload_type: u8) {
        match self {
            Self::Audio {
                preferred_payload_type,
                ..
            }
            | Self::Video {
                preferred_payload_type,
                ..
            } => *preferred_payload_type = Some(payload_type),
        }
    }

    pub fn clock_rate(&self) -> NonZeroU32 {
        match self {
            Self::Audio { clock_rate, .. } | Self::Video { clock_rate, .. } => *clock_rate,
        }
    }

    pub fn parameters(&self) -> &RtpCodecParametersParameters {
        match self {
            Self::Audio { parameters, .. } | Self::Video { parameters, .. } => parameters,
        }
    }

    pub(crate) fn parameters_mut(&mut self) -> &mut RtpCodecParametersParameters {
        match self {
            Self::Audio { parameters, .. } | Self::Video { parameters, .. } => parameters,
        }
    }

    pub fn rtcp_feedback(&self) -> &Vec<RtcpFeedback> {
        match self {
            Self::Audio { rtcp_feedback, .. } | Self::Video { rtcp_feedback, .. } => rtcp_feedback,
        }
    }

    pub(crate) fn set_rtcp_feedback(&mut self, feedback: Vec<RtcpFeedback>) {
        match self {
            Self::Audio { rtcp_feedback, .. } | Self::Video { rtcp_feedback, .. } => {
                *rtcp_feedback = feedback;
            }
        }
    }

    pub(crate) fn is_rtx(&self) -> bool {
        matches!(
            self,
            Self::Video {
                mime_type: MimeTypeVideo::Rtx,
                ..
            }
        )
    }
}

/// Direction of an RTP header extension.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RtpHeaderExtensionDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Default for RtpHeaderExtensionDirection {
    fn default() -> Self {
        Self::SendRecv
    }
}

/// URI of an RTP header extension, RFC 5285.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum RtpHeaderExtensionUri {
    Mid,
    RtpStreamId,
    RepairedRtpStreamId,
    AbsSendTime,
    TransportWideCcDraft01,
    AudioLevel,
    VideoOrientation,
    TimeOffset,
    Unknown(String),
}

impl RtpHeaderExtensionUri {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Mid => "urn:ietf:params:rtp-hdrext:sdes:mid",
            Self::RtpStreamId => "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
            Self::RepairedRtpStreamId => "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
            Self::AbsSendTime => "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
            Self::TransportWideCcDraft01 => {
                "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01"
            }
            Self::AudioLevel => "urn:ietf:params:rtp-hdrext:ssrc-audio-level",
            Self::VideoOrientation => "urn:3gpp:video-orientation",
            Self::TimeOffset => "urn:ietf:params:rtp-hdrext:toffset",
            Self::Unknown(uri) => uri.as_str(),
        }
    }

    fn from_string(uri: String) -> Self {
        match uri.as_str() {
            "urn:ietf:params:rtp-hdrext:sdes:mid" => Self::Mid,
            "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id" => Self::RtpStreamId,
            "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id" => Self::RepairedRtpStreamId,
            "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time" => Self::AbsSendTime,
            "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01" => {
                Self::TransportWideCcDraft01
            }
            "urn:ietf:params:rtp-hdrext:ssrc-audio-level" => Self::AudioLevel,
            "urn:3gpp:video-orientation" => Self::VideoOrientation,
            "urn:ietf:params:rtp-hdrext:toffset" => Self::TimeOffset,
            _ => Self::Unknown(uri),
        }
    }
}

impl Serialize for RtpHeaderExtensionUri {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RtpHeaderExtensionUri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Self::from_string(String::deserialize(deserializer)?))
    }
}

/// A supported RTP header extension within RTP capabilities.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    /// Media kind this extension applies to; `None` means any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    pub uri: RtpHeaderExtensionUri,
    pub preferred_id: u16,
    #[serde(default)]
    pub preferred_encrypt: bool,
    #[serde(default)]
    pub direction: RtpHeaderExtensionDirection,
}

/// What an endpoint (or the router itself) can receive at media level.
#[derive(Debug, Default, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

/// Codec settings within RTP parameters.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RtpCodecParameters {
    #[serde(rename_all = "camelCase")]
    Audio {
        mime_type: MimeTypeAudio,
        payload_type: u8,
        clock_rate: NonZeroU32,
        #[serde(default = "default_channels")]
        channels: NonZeroU8,
        #[serde(default)]
        parameters: RtpCodecParametersParameters,
        #[serde(default)]
        rtcp_feedback: Vec<RtcpFeedback>,
    },
    #[serde(rename_all = "camelCase")]
    Video {
        mime_type: MimeTypeVideo,
        payload_type: u8,
        clock_rate: NonZeroU32,
        #[serde(default)]
        parameters: RtpCodecParametersParameters,
        #[serde(default)]
        rtcp_feedback: Vec<RtcpFeedback>,
    },
}

impl RtpCodecParameters {
    pub fn mime_type(&self) -> MimeType {
        match self {
            Self::Audio { mime_type, .. } => MimeType::Audio(*mime_type),
            Self::Video { mime_type, .. } => MimeType::Video(*mime_type),
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            Self::Audio { payload_type, .. } | Self::Video { payload_type, .. } => *payload_type,
        }
    }

    pub fn parameters(&self) -> &RtpCodecParametersParameters {
        match self {
            Self::Audio { parameters, .. } | Self::Video { parameters, .. } => parameters,
        }
    }

    pub fn rtcp_feedback(&self) -> &Vec<RtcpFeedback> {
        match self {
            Self::Audio { rtcp_feedback, .. } | Self::Video { rtcp_feedback, .. } => rtcp_feedback,
        }
    }

    pub(crate) fn rtcp_feedback_mut(&mut self) -> &mut Vec<RtcpFeedback> {
        match self {
            Self::Audio { rtcp_feedback, .. } | Self::Video { rtcp_feedback, .. } => rtcp_feedback,
        }
    }

    pub(crate) fn is_rtx(&self) -> bool {
        matches!(
            self,
            Self::Video {
                mime_type: MimeTypeVideo::Rtx,
                ..
            }
        )
    }
}

/// RTX stream information attached to an encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct RtpEncodingParametersRtx {
    pub ssrc: u32,
}

/// An encoding: a media RTP stream and its associated RTX stream, if any.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtpEncodingParametersRtx>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtx: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
}

/// RTCP settings within RTP parameters.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    /// Whether reduced size RTCP (RFC 5506) is used. Default true.
    #[serde(default = "default_true")]
    pub reduced_size: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux: Option<bool>,
}

impl Default for RtcpParameters {
    fn default() -> Self {
        Self {
            cname: None,
            reduced_size: true,
            mux: None,
        }
    }
}

/// An RTP header extension in use within RTP parameters.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    pub uri: RtpHeaderExtensionUri,
    pub id: u16,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub parameters: RtpCodecParametersParameters,
}

/// RTP parameters of a stream as sent by an endpoint (producer side) or as
/// synthesized for an endpoint (consumer side).
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn codec_capability_deserializes_with_defaults() {
        let codec: RtpCodecCapability = serde_json::from_value(json!({
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
        }))
        .unwrap();

        match codec {
            RtpCodecCapability::Audio { channels, .. } => {
                assert_eq!(channels.get(), 1);
            }
            _ => panic!("expected audio codec"),
        }
    }

    #[test]
    fn rtcp_feedback_wire_shape() {
        let fb: RtcpFeedback = serde_json::from_value(json!({"type": "nack"})).unwrap();
        assert_eq!(fb, RtcpFeedback::Nack);
        let fb: RtcpFeedback =
            serde_json::from_value(json!({"type": "nack", "parameter": "pli"})).unwrap();
        assert_eq!(fb, RtcpFeedback::NackPli);
        assert_eq!(
            serde_json::to_value(&RtcpFeedback::TransportCc).unwrap(),
            json!({"type": "transport-cc", "parameter": ""}),
        );
    }

    #[test]
    fn header_extension_uri_keeps_unknown_values() {
        let uri: RtpHeaderExtensionUri =
            serde_json::from_value(json!("urn:example:custom")).unwrap();
        assert_eq!(
            uri,
            RtpHeaderExtensionUri::Unknown("urn:example:custom".to_string()),
        );
        assert_eq!(serde_json::to_value(&uri).unwrap(), json!("urn:example:custom"));
    }

    #[test]
    fn rtx_codec_is_recognized() {
        let codec: RtpCodecParameters = serde_json::from_value(json!({
            "mimeType": "video/rtx",
            "payloadType": 97,
            "clockRate": 90000,
            "parameters": {"apt": 96},
        }))
        .unwrap();
        assert!(codec.is_rtx());
        assert_eq!(codec.parameters().number_or("apt", 0), 96);
    }
}
