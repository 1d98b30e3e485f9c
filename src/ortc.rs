//! RTP capability engine: router capability generation, codec matching,
//! producer parameter mapping and consumer parameter synthesis.

use crate::rtp_parameters::{
    MediaKind, MimeType, MimeTypeVideo, RtcpFeedback, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpCodecParametersParameters, RtpEncodingParameters,
    RtpEncodingParametersRtx, RtpHeaderExtensionDirection, RtpHeaderExtensionUri, RtpParameters,
};
use crate::scalability_modes::parse_scalability_mode;
use crate::supported_rtp_capabilities;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::num::{NonZeroU32, NonZeroU8};
use thiserror::Error;

/// Dynamic payload types reserved for router codecs, consumed front to
/// back. Freed types are not returned to the pool.
const DYNAMIC_PAYLOAD_TYPES: [u8; 32] = [
    100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111, 112, 113, 114, 115, 116, 117, 118,
    119, 120, 121, 122, 123, 124, 125, 126, 127, 96, 97, 98, 99,
];

/// Error caused by invalid router media codec configuration.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RouterRtpCapabilitiesError {
    /// The dynamic payload type pool was exhausted.
    #[error("cannot allocate more dynamic payload types")]
    TooManyDynamicPayloads,
}

/// Error caused by producer RTP parameters not matching router capabilities.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RtpParametersMappingError {
    #[error("unsupported codec [mime type:{mime_type:?}, payload type:{payload_type}]")]
    UnsupportedCodec {
        mime_type: MimeType,
        payload_type: u8,
    },
    #[error("no RTX codec for codec payload type {payload_type}")]
    UnsupportedRtxCodec { payload_type: u8 },
    #[error("missing media codec found for RTX payload type {payload_type}")]
    MissingMediaCodecForRtx { payload_type: u8 },
}

/// Error caused by consumer capabilities not matching the producer.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConsumerRtpParametersError {
    /// The endpoint cannot receive any of the producer's media codecs.
    #[error("invalid consumer RTP capabilities: no compatible media codecs")]
    InvalidCapabilities,
}

/// Per-producer mapping between the endpoint's payload types/SSRCs and the
/// router-internal ones; sent to the worker with `transport.produce`.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RtpMapping {
    pub(crate) codecs: Vec<RtpMappingCodec>,
    pub(crate) encodings: Vec<RtpMappingEncoding>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RtpMappingCodec {
    pub(crate) payload_type: u8,
    pub(crate) mapped_payload_type: u8,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RtpMappingEncoding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) ssrc: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) rid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) scalability_mode: Option<String>,
    pub(crate) mapped_ssrc: u32,
}

/// Common view used by the codec matching predicate.
struct CodecToMatch<'a> {
    mime_type: MimeType,
    clock_rate: NonZeroU32,
    channels: Option<NonZeroU8>,
    parameters: &'a RtpCodecParametersParameters,
}

impl<'a> From<&'a RtpCodecCapability> for CodecToMatch<'a> {
    fn from(codec: &'a RtpCodecCapability) -> Self {
        Self {
            mime_type: codec.mime_type(),
            clock_rate: codec.clock_rate(),
            channels: match codec {
                RtpCodecCapability::Audio { channels, .. } => Some(*channels),
                RtpCodecCapability::Video { .. } => None,
            },
            parameters: codec.parameters(),
        }
    }
}

impl<'a> From<&'a RtpCodecParameters> for CodecToMatch<'a> {
    fn from(codec: &'a RtpCodecParameters) -> Self {
        Self {
            mime_type: codec.mime_type(),
            clock_rate: match codec {
                RtpCodecParameters::Audio { clock_rate, .. }
                | RtpCodecParameters::Video { clock_rate, .. } => *clock_rate,
            },
            channels: match codec {
                RtpCodecParameters::Audio { channels, .. } => Some(*channels),
                RtpCodecParameters::Video { .. } => None,
            },
            parameters: codec.parameters(),
        }
    }
}

/// Codec matching predicate: MIME type (case-insensitive by construction),
/// clock rate, channels for audio (missing counts as 1) and, for H264, the
/// integer `packetization-mode` parameter (missing counts as 0).
fn match_codecs(codec_a: &CodecToMatch<'_>, codec_b: &CodecToMatch<'_>) -> bool {
    if codec_a.mime_type != codec_b.mime_type {
        return false;
    }
    if codec_a.clock_rate != codec_b.clock_rate {
        return false;
    }
    if codec_a.mime_type.kind() == MediaKind::Audio {
        let channels_a = codec_a.channels.map(|channels| channels.get()).unwrap_or(1);
        let channels_b = codec_b.channels.map(|channels| channels.get()).unwrap_or(1);
        if channels_a != channels_b {
            return false;
        }
    }
    if codec_a.mime_type == MimeType::Video(MimeTypeVideo::H264) {
        let pm_a = codec_a.parameters.number_or("packetization-mode", 0);
        let pm_b = codec_b.parameters.number_or("packetization-mode", 0);
        if pm_a != pm_b {
            return false;
        }
    }

    true
}

fn generate_ssrc() -> u32 {
    100_000_000 + fastrand::u32(0..900_000_000)
}

/// Builds router RTP capabilities from the user-supplied media codecs.
///
/// Each user codec is matched against the supported-capabilities table;
/// the supported codec is cloned, the user codec merged over it and a
/// dynamic payload type reserved. Every resulting video codec gets a
/// paired `video/rtx` codec with `parameters.apt` pointing back at it.
/// User codecs with no supported counterpart are skipped.
pub(crate) fn generate_router_rtp_capabilities(
    media_codecs: Vec<RtpCodecCapability>,
) -> Result<RtpCapabilities, RouterRtpCapabilitiesError> {
    let supported = supported_rtp_capabilities::get_supported_rtp_capabilities();

    let mut dynamic_payload_types: VecDeque<u8> = DYNAMIC_PAYLOAD_TYPES.iter().copied().collect();
    let mut codecs = Vec::new();

    for media_codec in media_codecs {
        let matched_supported_codec = supported
            .codecs
            .iter()
            .find(|supported_codec| {
                match_codecs(&(&media_codec).into(), &(*supported_codec).into())
            });
        let matched_supported_codec = match matched_supported_codec {
            Some(codec) => codec,
            None => {
                continue;
            }
        };

        let mut codec = matched_supported_codec.clone();
        for (key, value) in media_codec.parameters().iter() {
            codec.parameters_mut().insert(key.clone(), value.clone());
        }
        if !media_codec.rtcp_feedback().is_empty() {
            codec.set_rtcp_feedback(media_codec.rtcp_feedback().clone());
        }

        let payload_type = match media_codec.preferred_payload_type() {
            Some(preferred_payload_type) => {
                dynamic_payload_types.retain(|pt| *pt != preferred_payload_type);
                preferred_payload_type
            }
            None => match codec.preferred_payload_type() {
                Some(preferred_payload_type) => preferred_payload_type,
                None => dynamic_payload_types
                    .pop_front()
                    .ok_or(RouterRtpCapabilitiesError::TooManyDynamicPayloads)?,
            },
        };
        codec.set_preferred_payload_type(payload_type);

        let is_video = codec.mime_type().kind() == MediaKind::Video;
        let clock_rate = codec.clock_rate();
        codecs.push(codec);

        if is_video {
            let rtx_payload_type = dynamic_payload_types
                .pop_front()
                .ok_or(RouterRtpCapabilitiesError::TooManyDynamicPayloads)?;
            codecs.push(RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Rtx,
                preferred_payload_type: Some(rtx_payload_type),
                clock_rate,
                parameters: RtpCodecParametersParameters::from([(
                    "apt",
                    u32::from(payload_type).into(),
                )]),
                rtcp_feedback: vec![],
            });
        }
    }

    Ok(RtpCapabilities {
        codecs,
        header_extensions: supported.header_extensions,
    })
}

/// Maps the producer's payload types and SSRCs onto router-internal ones.
pub(crate) fn get_producer_rtp_parameters_mapping(
    rtp_parameters: &RtpParameters,
    rtp_capabilities: &RtpCapabilities,
) -> Result<RtpMapping, RtpParametersMappingError> {
    let mut rtp_mapping = RtpMapping::default();

    for codec in &rtp_parameters.codecs {
        if codec.is_rtx() {
            continue;
        }

        let matched_cap_codec = rtp_capabilities
            .codecs
            .iter()
            .find(|cap_codec| match_codecs(&codec.into(), &(*cap_codec).into()))
            .ok_or(RtpParametersMappingError::UnsupportedCodec {
                mime_type: codec.mime_type(),
                payload_type: codec.payload_type(),
            })?;

        rtp_mapping.codecs.push(RtpMappingCodec {
            payload_type: codec.payload_type(),
            mapped_payload_type: matched_cap_codec
                .preferred_payload_type()
                .expect("router capabilities carry preferred payload types"),
        });
    }

    for codec in &rtp_parameters.codecs {
        if !codec.is_rtx() {
            continue;
        }

        let apt = codec.parameters().number_or("apt", 0) as u8;
        let associated = rtp_mapping
            .codecs
            .iter()
            .find(|entry| entry.payload_type == apt)
            .ok_or(RtpParametersMappingError::MissingMediaCodecForRtx {
                payload_type: codec.payload_type(),
            })?;

        let cap_rtx_exists = rtp_capabilities.codecs.iter().any(|cap_codec| {
            cap_codec.is_rtx()
                && cap_codec.parameters().number_or("apt", 0) as u8 == associated.mapped_payload_type
        });
        if !cap_rtx_exists {
            return Err(RtpParametersMappingError::UnsupportedRtxCodec {
                payload_type: codec.payload_type(),
            });
        }

        rtp_mapping.codecs.push(RtpMappingCodec {
            payload_type: codec.payload_type(),
            mapped_payload_type: rtp_capabilities
                .codecs
                .iter()
                .find(|cap_codec| {
                    cap_codec.is_rtx()
                        && cap_codec.parameters().number_or("apt", 0) as u8
                            == associated.mapped_payload_type
                })
                .and_then(|cap_codec| cap_codec.preferred_payload_type())
                .expect("existence checked above"),
        });
    }

    if rtp_parameters.encodings.is_empty() {
        rtp_mapping.encodings.push(RtpMappingEncoding {
            ssrc: None,
            rid: None,
            scalability_mode: None,
            mapped_ssrc: generate_ssrc(),
        });
    } else {
        for encoding in &rtp_parameters.encodings {
            rtp_mapping.encodings.push(RtpMappingEncoding {
                ssrc: encoding.ssrc,
                rid: encoding.rid.clone(),
                scalability_mode: encoding.scalability_mode.clone(),
                mapped_ssrc: generate_ssrc(),
            });
        }
    }

    Ok(rtp_mapping)
}

/// Derives the router-internal RTP parameters all consumers of a producer
/// are synthesized from.
pub(crate) fn get_consumable_rtp_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
    rtp_capabilities: &RtpCapabilities,
    rtp_mapping: &RtpMapping,
) -> RtpParameters {
    let mut consumable_params = RtpParameters::default();

    for codec in &rtp_parameters.codecs {
        if codec.is_rtx() {
            continue;
        }

        let consumable_codec_pt = rtp_mapping
            .codecs
            .iter()
            .find(|entry| entry.payload_type == codec.payload_type())
            .map(|entry| entry.mapped_payload_type)
            .expect("mapping covers every media codec");

        let matched_cap_codec = rtp_capabilities
            .codecs
            .iter()
            .find(|cap_codec| cap_codec.preferred_payload_type() == Some(consumable_codec_pt))
            .expect("mapped payload types come from router capabilities");

        let consumable_codec = match matched_cap_codec {
            RtpCodecCapability::Audio {
                mime_type,
                clock_rate,
                channels,
                rtcp_feedback,
                ..
            } => RtpCodecParameters::Audio {
                mime_type: *mime_type,
                payload_type: consumable_codec_pt,
                clock_rate: *clock_rate,
                channels: *channels,
                // Keep the producer codec parameters.
                parameters: codec.parameters().clone(),
                rtcp_feedback: rtcp_feedback.clone(),
            },
            RtpCodecCapability::Video {
                mime_type,
                clock_rate,
                rtcp_feedback,
                ..
            } => RtpCodecParameters::Video {
                mime_type: *mime_type,
                payload_type: consumable_codec_pt,
                clock_rate: *clock_rate,
                parameters: codec.parameters().clone(),
                rtcp_feedback: rtcp_feedback.clone(),
            },
        };
        consumable_params.codecs.push(consumable_codec);

        let consumable_cap_rtx_codec = rtp_capabilities.codecs.iter().find(|cap_rtx_codec| {
            cap_rtx_codec.is_rtx()
                && cap_rtx_codec.parameters().number_or("apt", 0) as u8 == consumable_codec_pt
        });
        if let Some(cap_rtx_codec) = consumable_cap_rtx_codec {
            consumable_params.codecs.push(RtpCodecParameters::Video {
                mime_type: MimeTypeVideo::Rtx,
                payload_type: cap_rtx_codec
                    .preferred_payload_type()
                    .expect("router capabilities carry preferred payload types"),
                clock_rate: cap_rtx_codec.clock_rate(),
                parameters: cap_rtx_codec.parameters().clone(),
                rtcp_feedback: vec![],
            });
        }
    }

    for cap_ext in &rtp_capabilities.header_extensions {
        if cap_ext.kind != Some(kind)
            || (cap_ext.direction != RtpHeaderExtensionDirection::SendRecv
                && cap_ext.direction != RtpHeaderExtensionDirection::SendOnly)
        {
            continue;
        }
        consumable_params.header_extensions.push(
            crate::rtp_parameters::RtpHeaderExtensionParameters {
                uri: cap_ext.uri.clone(),
                id: cap_ext.preferred_id,
                encrypt: cap_ext.preferred_encrypt,
                parameters: RtpCodecParametersParameters::default(),
            },
        );
    }

    for (encoding, mapped) in rtp_parameters.encodings.iter().zip(&rtp_mapping.encodings) {
        consumable_params.encodings.push(RtpEncodingParameters {
            ssrc: Some(mapped.mapped_ssrc),
            rid: None,
            codec_payload_type: None,
            rtx: None,
            dtx: encoding.dtx,
            scalability_mode: encoding.scalability_mode.clone(),
            scale_resolution_down_by: None,
            max_bitrate: encoding.max_bitrate,
        });
    }
    if consumable_params.encodings.is_empty() {
        if let Some(mapped) = rtp_mapping.encodings.first() {
            consumable_params.encodings.push(RtpEncodingParameters {
                ssrc: Some(mapped.mapped_ssrc),
                ..RtpEncodingParameters::default()
            });
        }
    }

    consumable_params.rtcp = crate::rtp_parameters::RtcpParameters {
        cname: rtp_parameters.rtcp.cname.clone(),
        reduced_size: true,
        mux: Some(true),
    };

    consumable_params
}

/// Whether an endpoint with the given capabilities can consume the
/// producer described by `consumable_rtp_parameters`.
pub(crate) fn can_consume(
    consumable_rtp_parameters: &RtpParameters,
    rtp_capabilities: &RtpCapabilities,
) -> bool {
    consumable_rtp_parameters.codecs.iter().any(|codec| {
        !codec.is_rtx()
            && rtp_capabilities
                .codecs
                .iter()
                .any(|cap_codec| {
                    !cap_codec.is_rtx() && match_codecs(&codec.into(), &cap_codec.into())
                })
    })
}

/// Synthesizes the RTP parameters of a consumer from the producer's
/// consumable parameters and the consuming endpoint's capabilities.
///
/// The returned parameters carry no `mid`; the owning transport assigns
/// one when the consumer is created.
pub(crate) fn get_consumer_rtp_parameters(
    consumable_rtp_parameters: &RtpParameters,
    rtp_capabilities: &RtpCapabilities,
) -> Result<RtpParameters, ConsumerRtpParametersError> {
    let mut consumer_params = RtpParameters {
        rtcp: consumable_rtp_parameters.rtcp.clone(),
        ..RtpParameters::default()
    };

    let mut rtx_supported = false;

    for codec in &consumable_rtp_parameters.codecs {
        let matched_cap_codec = rtp_capabilities
            .codecs
            .iter()
            .find(|cap_codec| match_codecs(&codec.into(), &(*cap_codec).into()));
        if let Some(cap_codec) = matched_cap_codec {
            let mut codec = codec.clone();
            *codec.rtcp_feedback_mut() = cap_codec.rtcp_feedback().clone();
            consumer_params.codecs.push(codec);
        }
    }

    // Drop RTX codecs whose `apt` has no counterpart in the matched list.
    let payload_types: Vec<u8> = consumer_params
        .codecs
        .iter()
        .map(|codec| codec.payload_type())
        .collect();
    consumer_params.codecs.retain(|codec| {
        if !codec.is_rtx() {
            return true;
        }
        let apt = codec.parameters().number_or("apt", 0) as u8;
        let associated = payload_types.contains(&apt);
        if associated {
            rtx_supported = true;
        }
        associated
    });

    if consumer_params.codecs.iter().all(|codec| codec.is_rtx()) {
        return Err(ConsumerRtpParametersError::InvalidCapabilities);
    }

    for ext in &consumable_rtp_parameters.header_extensions {
        let supported_by_endpoint = rtp_capabilities
            .header_extensions
            .iter()
            .any(|cap_ext| cap_ext.preferred_id == ext.id && cap_ext.uri == ext.uri);
        if supported_by_endpoint {
            consumer_params.header_extensions.push(ext.clone());
        }
    }

    // Reduce codecs' RTCP feedback: transport-wide CC wins over REMB.
    let have_transport_cc = consumer_params
        .header_extensions
        .iter()
        .any(|ext| ext.uri == RtpHeaderExtensionUri::TransportWideCcDraft01);
    let have_abs_send_time = consumer_params
        .header_extensions
        .iter()
        .any(|ext| ext.uri == RtpHeaderExtensionUri::AbsSendTime);
    for codec in &mut consumer_params.codecs {
        codec.rtcp_feedback_mut().retain(|fb| {
            if have_transport_cc {
                *fb != RtcpFeedback::GoogRemb
            } else if have_abs_send_time {
                *fb != RtcpFeedback::TransportCc
            } else {
                *fb != RtcpFeedback::GoogRemb && *fb != RtcpFeedback::TransportCc
            }
        });
    }

    let mut consumer_encoding = RtpEncodingParameters {
        ssrc: Some(generate_ssrc()),
        ..RtpEncodingParameters::default()
    };
    if rtx_supported {
        consumer_encoding.rtx = Some(RtpEncodingParametersRtx {
            ssrc: generate_ssrc(),
        });
    }

    // All consumable encodings are assumed to carry the same scalability
    // mode; with simulcast the spatial layer count is the encoding count.
    let mut scalability_mode = consumable_rtp_parameters
        .encodings
        .iter()
        .find_map(|encoding| encoding.scalability_mode.clone());
    if consumable_rtp_parameters.encodings.len() > 1 {
        let temporal_layers =
            parse_scalability_mode(scalability_mode.as_deref()).temporal_layers;
        scalability_mode = Some(format!(
            "S{}T{}",
            consumable_rtp_parameters.encodings.len(),
            temporal_layers,
        ));
    }
    consumer_encoding.scalability_mode = scalability_mode;

    let max_encoding_max_bitrate = consumable_rtp_parameters
        .encodings
        .iter()
        .filter_map(|encoding| encoding.max_bitrate)
        .max();
    consumer_encoding.max_bitrate = max_encoding_max_bitrate;

    consumer_params.encodings.push(consumer_encoding);

    Ok(consumer_params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp_parameters::{MimeTypeAudio, RtpHeaderExtension};
    use serde_json::json;

    fn opus_consumable_rtp_parameters() -> RtpParameters {
        serde_json::from_value(json!({
            "codecs": [{
                "mimeType": "audio/opus",
                "payloadType": 100,
                "clockRate": 48000,
                "channels": 2,
                "parameters": {"useinbandfec": 1, "usedtx": 1},
                "rtcpFeedback": [],
            }],
            "headerExtensions": [],
            "encodings": [{"ssrc": 123456789}],
            "rtcp": {"cname": "qwerty", "reducedSize": true, "mux": true},
        }))
        .unwrap()
    }

    #[test]
    fn router_capabilities_pair_video_codecs_with_rtx() {
        let caps = generate_router_rtp_capabilities(vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::new(),
                rtcp_feedback: vec![],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::new(),
                rtcp_feedback: vec![],
            },
        ])
        .unwrap();

        for codec in caps.codecs.iter().filter(|codec| {
            codec.mime_type().kind() == MediaKind::Video && !codec.is_rtx()
        }) {
            let payload_type = codec.preferred_payload_type().unwrap();
            let rtx = caps.codecs.iter().find(|rtx_codec| {
                rtx_codec.is_rtx()
                    && rtx_codec.parameters().number_or("apt", 0) == u32::from(payload_type)
            });
            assert!(rtx.is_some(), "video codec without paired RTX codec");
        }
    }

    #[test]
    fn router_capabilities_pool_exhaustion() {
        // Each H264 codec consumes two payload types (media + RTX); 17 of
        // them exceed the 32-entry pool.
        let media_codecs: Vec<RtpCodecCapability> = (0..17)
            .map(|_| RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::from([(
                    "packetization-mode",
                    1u32.into(),
                )]),
                rtcp_feedback: vec![],
            })
            .collect();

        assert_eq!(
            generate_router_rtp_capabilities(media_codecs),
            Err(RouterRtpCapabilitiesError::TooManyDynamicPayloads),
        );
    }

    #[test]
    fn consumer_parameters_synthesis() {
        let consumable = opus_consumable_rtp_parameters();
        let caps: RtpCapabilities = serde_json::from_value(json!({
            "codecs": [{
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2,
                "rtcpFeedback": [{"type": "transport-cc"}],
            }],
            "headerExtensions": [],
        }))
        .unwrap();

        let params = get_consumer_rtp_parameters(&consumable, &caps).unwrap();

        assert_eq!(params.codecs.len(), 1);
        assert_eq!(params.codecs[0].payload_type(), 100);
        assert_eq!(
            params.codecs[0].rtcp_feedback(),
            &vec![RtcpFeedback::TransportCc],
        );
        match &params.codecs[0] {
            RtpCodecParameters::Audio { channels, .. } => assert_eq!(channels.get(), 2),
            _ => panic!("expected audio codec"),
        }
        assert_eq!(params.encodings.len(), 1);
        let ssrc = params.encodings[0].ssrc.unwrap();
        assert!((100_000_000..1_000_000_000).contains(&ssrc));
        assert_eq!(params.rtcp, consumable.rtcp);
    }

    #[test]
    fn consumer_parameters_rejection_on_kind_mismatch() {
        let consumable = opus_consumable_rtp_parameters();
        let caps: RtpCapabilities = serde_json::from_value(json!({
            "codecs": [{
                "kind": "video",
                "mimeType": "video/H264",
                "preferredPayloadType": 103,
                "clockRate": 90000,
                "parameters": {"packetization-mode": 1},
            }],
            "headerExtensions": [],
        }))
        .unwrap();

        assert_eq!(
            get_consumer_rtp_parameters(&consumable, &caps),
            Err(ConsumerRtpParametersError::InvalidCapabilities),
        );
    }

    #[test]
    fn simulcast_scalability_mode_is_synthesized() {
        let consumable: RtpParameters = serde_json::from_value(json!({
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 101,
                "clockRate": 90000,
                "rtcpFeedback": [],
            }],
            "headerExtensions": [],
            "encodings": [
                {"ssrc": 111111111, "scalabilityMode": "S1T3", "maxBitrate": 100000},
                {"ssrc": 222222222, "scalabilityMode": "S1T3", "maxBitrate": 500000},
                {"ssrc": 333333333, "scalabilityMode": "S1T3", "maxBitrate": 1200000},
            ],
            "rtcp": {"reducedSize": true},
        }))
        .unwrap();
        let caps: RtpCapabilities = serde_json::from_value(json!({
            "codecs": [{
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000,
            }],
            "headerExtensions": [],
        }))
        .unwrap();

        let params = get_consumer_rtp_parameters(&consumable, &caps).unwrap();
        let encoding = &params.encodings[0];
        assert_eq!(encoding.scalability_mode.as_deref(), Some("S3T3"));
        assert_eq!(encoding.max_bitrate, Some(1_200_000));
    }

    #[test]
    fn rtcp_feedback_reduction_prefers_transport_cc() {
        let mut consumable = opus_consumable_rtp_parameters();
        *consumable.codecs[0].rtcp_feedback_mut() =
            vec![RtcpFeedback::TransportCc, RtcpFeedback::GoogRemb];
        consumable.header_extensions = vec![crate::rtp_parameters::RtpHeaderExtensionParameters {
            uri: RtpHeaderExtensionUri::TransportWideCcDraft01,
            id: 5,
            encrypt: false,
            parameters: RtpCodecParametersParameters::default(),
        }];

        let caps: RtpCapabilities = serde_json::from_value(json!({
            "codecs": [{
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2,
                "rtcpFeedback": [
                    {"type": "transport-cc"},
                    {"type": "goog-remb"},
                ],
            }],
            "headerExtensions": [{
                "kind": "audio",
                "uri": "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
                "preferredId": 5,
                "preferredEncrypt": false,
                "direction": "recvonly",
            }],
        }))
        .unwrap();

        let params = get_consumer_rtp_parameters(&consumable, &caps).unwrap();
        assert_eq!(
            params.codecs[0].rtcp_feedback(),
            &vec![RtcpFeedback::TransportCc],
        );
    }

    #[test]
    fn can_consume_requires_matching_media_codec() {
        let consumable = opus_consumable_rtp_parameters();
        let matching: RtpCapabilities = serde_json::from_value(json!({
            "codecs": [{
                "kind": "audio",
                "mimeType": "audio/opus",
                "clockRate": 48000,
                "channels": 2,
            }],
        }))
        .unwrap();
        let mismatching = RtpCapabilities {
            codecs: vec![],
            header_extensions: Vec::<RtpHeaderExtension>::new(),
        };

        assert!(can_consume(&consumable, &matching));
        assert!(!can_consume(&consumable, &mismatching));
    }
}
