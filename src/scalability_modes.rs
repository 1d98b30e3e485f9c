//! Parsing of `scalabilityMode` strings (webrtc-svc), e.g. `L3T2` or
//! `S2T3_KEY`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static SCALABILITY_MODE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[LS](\d+)T(\d+)(_KEY)?").unwrap());

/// Layer structure of an encoding.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalabilityMode {
    pub spatial_layers: u8,
    pub temporal_layers: u8,
    pub ksvc: bool,
}

impl Default for ScalabilityMode {
    fn default() -> Self {
        Self {
            spatial_layers: 1,
            temporal_layers: 1,
            ksvc: false,
        }
    }
}

/// Parses a scalability mode string; anything unparseable yields the
/// default single-layer mode.
pub fn parse_scalability_mode(scalability_mode: Option<&str>) -> ScalabilityMode {
    scalability_mode
        .and_then(|scalability_mode| {
            SCALABILITY_MODE_REGEX
                .captures(scalability_mode)
                .map(|captures| ScalabilityMode {
                    spatial_layers: captures[1].parse().unwrap_or(1),
                    temporal_layers: captures[2].parse().unwrap_or(1),
                    ksvc: captures.get(3).is_some(),
                })
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_svc_modes() {
        assert_eq!(
            parse_scalability_mode(Some("L3T2")),
            ScalabilityMode {
                spatial_layers: 3,
                temporal_layers: 2,
                ksvc: false,
            },
        );
        assert_eq!(
            parse_scalability_mode(Some("S2T3_KEY")),
            ScalabilityMode {
                spatial_layers: 2,
                temporal_layers: 3,
                ksvc: true,
            },
        );
    }

    #[test]
    fn falls_back_to_single_layer() {
        assert_eq!(parse_scalability_mode(None), ScalabilityMode::default());
        assert_eq!(
            parse_scalability_mode(Some("invalid")),
            ScalabilityMode::default(),
        );
    }
}
