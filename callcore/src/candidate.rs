//! Network-reachability candidates (ICE trickle).

use crate::session::PartyRole;
use serde::{Deserialize, Serialize};

/// A single ICE candidate produced by or destined for a peer connection.
///
/// The format follows RFC 8445; `candidate` is the attribute value as it
/// appears in SDP, e.g. `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    /// SDP media stream identification (e.g., "0" for audio)
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }

    /// Candidate type parsed from the `typ` token, if present.
    pub fn candidate_type(&self) -> Option<CandidateType> {
        let mut tokens = self.candidate.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "typ" {
                return tokens.next().and_then(|t| t.parse().ok());
            }
        }
        None
    }

    /// Identity used to recognise the same descriptor observed twice.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.candidate.trim(),
            self.sdp_mid.as_deref().unwrap_or(""),
            self.sdp_m_line_index
                .map(|i| i.to_string())
                .unwrap_or_default()
        )
    }
}

/// ICE candidate type (RFC 8445).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    /// Server reflexive (STUN) candidate
    ServerReflexive,
    PeerReflexive,
    /// Relay (TURN) candidate
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl std::str::FromStr for CandidateType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            _ => Err(()),
        }
    }
}

/// A candidate as stored in the session's ordered candidate log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Arrival sequence within the session, assigned by the channel.
    pub seq: u64,
    /// Which party produced the candidate.
    pub origin: PartyRole,
    pub candidate: IceCandidate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_candidate_builder() {
        let candidate = IceCandidate::new("candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0)
            .with_username_fragment("abc123");

        assert!(candidate.candidate.starts_with("candidate:"));
        assert_eq!(candidate.sdp_mid, Some("0".to_string()));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert_eq!(candidate.username_fragment, Some("abc123".to_string()));
        assert_eq!(candidate.candidate_type(), Some(CandidateType::Host));
    }

    #[test]
    fn test_candidate_type_parsing() {
        assert_eq!("host".parse(), Ok(CandidateType::Host));
        assert_eq!("SRFLX".parse(), Ok(CandidateType::ServerReflexive));
        assert_eq!("prflx".parse(), Ok(CandidateType::PeerReflexive));
        assert_eq!("relay".parse(), Ok(CandidateType::Relay));
        assert!("unknown".parse::<CandidateType>().is_err());
        assert_eq!(CandidateType::ServerReflexive.as_str(), "srflx");
    }

    #[test]
    fn test_dedupe_key_ignores_ufrag_and_padding() {
        let a = IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 5000 typ host").with_sdp_mid("0");
        let b = IceCandidate::new(" candidate:1 1 UDP 1 10.0.0.1 5000 typ host ")
            .with_sdp_mid("0")
            .with_username_fragment("x");
        let c = IceCandidate::new("candidate:1 1 UDP 1 10.0.0.1 5000 typ host").with_sdp_mid("1");

        assert_eq!(a.dedupe_key(), b.dedupe_key());
        assert_ne!(a.dedupe_key(), c.dedupe_key());
    }

    #[test]
    fn test_candidate_serializes_browser_field_names() {
        let json = serde_json::to_value(IceCandidate::new("candidate:x").with_sdp_m_line_index(1))
            .unwrap();
        assert_eq!(json["sdpMLineIndex"], 1);
        assert!(json["sdpMid"].is_null());
    }
}
