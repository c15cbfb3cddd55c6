//! Manual signaling: offer/answer messages exchanged out of band
//!
//! The user copies the offer from the sender to the receiver and the answer
//! back. The `sdp` field carries a JSON session description naming the
//! sender's reachable addresses and, in the answer, the receiver's token.

use super::TransferError;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Ceiling on address gathering before the offer is emitted
pub const GATHER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Offer,
    Answer,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalType::Offer => write!(f, "offer"),
            SignalType::Answer => write!(f, "answer"),
        }
    }
}

/// The blob a user pastes between devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub sdp: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub candidates: Vec<SocketAddr>,
}

impl SignalMessage {
    pub fn new(kind: SignalType, description: &SessionDescription) -> Result<Self, TransferError> {
        Ok(Self {
            kind,
            sdp: serde_json::to_string(description)?,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn to_json(&self) -> Result<String, TransferError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a pasted message and check it is the expected kind
    pub fn parse(text: &str, expected: SignalType) -> Result<Self, TransferError> {
        let message: SignalMessage = serde_json::from_str(text.trim())
            .map_err(|e| TransferError::Signal(format!("not a signal message: {}", e)))?;

        if message.kind != expected {
            return Err(TransferError::Signal(format!(
                "expected an {}, got an {}",
                expected, message.kind
            )));
        }
        Ok(message)
    }

    pub fn description(&self) -> Result<SessionDescription, TransferError> {
        serde_json::from_str(&self.sdp)
            .map_err(|e| TransferError::Signal(format!("invalid session description: {}", e)))
    }
}

/// Outbound LAN address, found by routing a UDP socket (no packet is sent)
pub async fn detect_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    let ip = socket.local_addr().ok()?.ip();

    if ip.is_loopback() || ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}

/// Addresses a receiver may dial for `port`: LAN first, loopback last
pub async fn gather_candidates(port: u16, limit: Duration) -> Vec<SocketAddr> {
    let mut candidates = Vec::new();

    match tokio::time::timeout(limit, detect_local_ip()).await {
        Ok(Some(ip)) => candidates.push(SocketAddr::new(ip, port)),
        Ok(None) => log::debug!("No LAN address detected, offering loopback only"),
        Err(_) => log::warn!("Address gathering timed out, proceeding with available candidates"),
    }

    candidates.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn description() -> SessionDescription {
        SessionDescription {
            session_id: "s-1".to_string(),
            token: None,
            candidates: vec!["127.0.0.1:4000".parse().unwrap()],
        }
    }

    #[test]
    fn test_signal_message_shape() {
        let message = SignalMessage::new(SignalType::Offer, &description()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "offer");
        assert!(value["sdp"].is_string());
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_parse_roundtrips_description() {
        let message = SignalMessage::new(SignalType::Answer, &description()).unwrap();
        let parsed = SignalMessage::parse(&message.to_json().unwrap(), SignalType::Answer).unwrap();
        assert_eq!(parsed.description().unwrap(), description());
    }

    #[test]
    fn test_parse_rejects_wrong_kind() {
        let message = SignalMessage::new(SignalType::Offer, &description()).unwrap();
        let err = SignalMessage::parse(&message.to_json().unwrap(), SignalType::Answer).unwrap_err();
        assert!(err.to_string().contains("expected an answer"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            SignalMessage::parse("hello", SignalType::Offer),
            Err(TransferError::Signal(_))
        ));

        let bad_sdp = SignalMessage {
            kind: SignalType::Offer,
            sdp: "{".to_string(),
            timestamp: 0,
        };
        assert!(bad_sdp.description().is_err());
    }

    #[tokio::test]
    async fn test_candidates_always_include_loopback() {
        let candidates = gather_candidates(4567, Duration::from_secs(2)).await;
        let last = candidates.last().unwrap();
        assert!(last.ip().is_loopback());
        assert!(candidates.iter().all(|c| c.port() == 4567));
    }
}
