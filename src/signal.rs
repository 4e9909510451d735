//! Session description encoding for the signaling exchange.
//!
//! A description travels as base64 over its JSON form, the same thing the
//! browser produces with `btoa(JSON.stringify(pc.localDescription))`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding a remote signal
#[derive(Error, Debug)]
pub enum MalformedSignalError {
    #[error("Empty session description")]
    Empty,

    #[error("Session description is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Session description is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Offer or answer, as exchanged with the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Number of `a=candidate:` lines carried in the SDP
    pub fn candidate_count(&self) -> usize {
        self.sdp
            .lines()
            .filter(|line| line.trim_start().starts_with("a=candidate:"))
            .count()
    }
}

/// Encode a description into a single transport-safe line.
pub fn encode(description: &SessionDescription) -> String {
    // Serializing a struct of a plain enum and a String cannot fail.
    let json = serde_json::to_vec(description).unwrap_or_default();
    STANDARD.encode(json)
}

/// Decode a description produced by [`encode`] or by a browser.
pub fn decode(input: &str) -> Result<SessionDescription, MalformedSignalError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(MalformedSignalError::Empty);
    }

    let json = STANDARD.decode(input)?;
    Ok(serde_json::from_slice(&json)?)
}
