//! Relayed signaling packets.
//!
//! Every packet is a JSON array `[typeTag, ...fields]`, encrypted before it
//! is published. Broadcast packets drive presence; signaling packets travel
//! on private topics and drive negotiation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::AerodropError;
use super::identity::{DeviceTag, Identity};

/// Type tags, first element of every packet.
pub mod tags {
    pub const HELLO: &str = "👋";
    pub const WELCOME: &str = "😄";
    pub const LEAVE: &str = "🍃";

    pub const REQUEST: &str = "\u{1F54A}\u{FE0F}";
    pub const RESPONSE: &str = "🥰";
    pub const BUSY: &str = "🙅";
    pub const OFFER: &str = "🙋";
    pub const ANSWER: &str = "💃";
    pub const CANDIDATE: &str = "🤝";
    pub const RESALT: &str = "🧂";
}

// ---------------------------------------------------------------------------
// Broadcast packets (presence)
// ---------------------------------------------------------------------------

/// Self-description carried by `Hello` and `Welcome`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub id: Identity,
    pub name: String,
    pub device: DeviceTag,
    /// Sender's join time in ms. `None` when the field was not numeric.
    pub joined_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastPacket {
    Hello(Announcement),
    Welcome(Announcement),
    Leave(Identity),
}

impl BroadcastPacket {
    pub fn sender(&self) -> &Identity {
        match self {
            Self::Hello(a) | Self::Welcome(a) => &a.id,
            Self::Leave(id) => id,
        }
    }

    pub fn encode(&self) -> String {
        let value = match self {
            Self::Hello(a) => announcement_json(tags::HELLO, a),
            Self::Welcome(a) => announcement_json(tags::WELCOME, a),
            Self::Leave(id) => json!([tags::LEAVE, id.as_str()]),
        };
        value.to_string()
    }

    pub fn decode(data: &str) -> Result<Self, AerodropError> {
        let fields = parse_array(data)?;
        let (tag, rest) = split_tag(&fields)?;
        match tag {
            tags::HELLO => Ok(Self::Hello(announcement(rest)?)),
            tags::WELCOME => Ok(Self::Welcome(announcement(rest)?)),
            tags::LEAVE => Ok(Self::Leave(identity_field(rest, 0)?)),
            other => Err(AerodropError::violation(format!("unknown broadcast tag {other:?}"))),
        }
    }
}

fn announcement_json(tag: &str, a: &Announcement) -> Value {
    json!([tag, a.id.as_str(), a.name, a.device.as_str(), a.joined_at])
}

fn announcement(rest: &[Value]) -> Result<Announcement, AerodropError> {
    let id = identity_field(rest, 0)?;
    let name = string_field(rest, 1, "name")?;
    if name.is_empty() {
        return Err(AerodropError::violation("empty peer name"));
    }
    let device = string_field(rest, 2, "device tag")?;
    let device = DeviceTag::parse(device)
        .ok_or_else(|| AerodropError::violation(format!("unknown device tag {device:?}")))?;
    let joined_at = rest.get(3).and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    });

    Ok(Announcement {
        id,
        name: name.to_owned(),
        device,
        joined_at,
    })
}

// ---------------------------------------------------------------------------
// Signaling packets (negotiation)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged in `Offer`/`Answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// One network-path candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingPacket {
    Request(Identity),
    Response(Identity),
    /// Sent instead of `Response` by a peer that is negotiating with someone else.
    Busy(Identity),
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    /// Ask the receiver to put its salt in its next envelope. `reply` marks
    /// the answer, which is never answered again.
    Resalt { id: Identity, reply: bool },
}

impl SignalingPacket {
    pub fn encode(&self) -> String {
        let value = match self {
            Self::Request(id) => json!([tags::REQUEST, id.as_str()]),
            Self::Response(id) => json!([tags::RESPONSE, id.as_str()]),
            Self::Busy(id) => json!([tags::BUSY, id.as_str()]),
            Self::Offer(desc) => json!([tags::OFFER, desc]),
            Self::Answer(desc) => json!([tags::ANSWER, desc]),
            Self::Candidate(c) => json!([tags::CANDIDATE, c]),
            Self::Resalt { id, reply } => json!([tags::RESALT, id.as_str(), reply]),
        };
        value.to_string()
    }

    pub fn decode(data: &str) -> Result<Self, AerodropError> {
        let fields = parse_array(data)?;
        let (tag, rest) = split_tag(&fields)?;
        match tag {
            tags::REQUEST => Ok(Self::Request(identity_field(rest, 0)?)),
            tags::RESPONSE => Ok(Self::Response(identity_field(rest, 0)?)),
            tags::BUSY => Ok(Self::Busy(identity_field(rest, 0)?)),
            tags::OFFER => Ok(Self::Offer(object_field(rest, "offer")?)),
            tags::ANSWER => Ok(Self::Answer(object_field(rest, "answer")?)),
            tags::CANDIDATE => Ok(Self::Candidate(object_field(rest, "candidate")?)),
            tags::RESALT => Ok(Self::Resalt {
                id: identity_field(rest, 0)?,
                reply: rest.get(1).and_then(Value::as_bool).unwrap_or(false),
            }),
            other => Err(AerodropError::violation(format!("unknown signaling tag {other:?}"))),
        }
    }
}

/// Type tag of a packet without decoding the rest of it.
pub fn peek_tag(data: &str) -> Option<String> {
    let fields: Vec<Value> = serde_json::from_str(data).ok()?;
    fields.first()?.as_str().map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn parse_array(data: &str) -> Result<Vec<Value>, AerodropError> {
    serde_json::from_str(data)
        .map_err(|e| AerodropError::violation(format!("packet is not a JSON array: {e}")))
}

fn split_tag(fields: &[Value]) -> Result<(&str, &[Value]), AerodropError> {
    let (tag, rest) = fields
        .split_first()
        .ok_or_else(|| AerodropError::violation("empty packet"))?;
    let tag = tag
        .as_str()
        .ok_or_else(|| AerodropError::violation("type tag is not a string"))?;
    Ok((tag, rest))
}

fn string_field<'a>(rest: &'a [Value], index: usize, what: &str) -> Result<&'a str, AerodropError> {
    rest.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| AerodropError::violation(format!("missing {what}")))
}

fn identity_field(rest: &[Value], index: usize) -> Result<Identity, AerodropError> {
    let raw = string_field(rest, index, "identity")?;
    Identity::parse(raw).ok_or_else(|| AerodropError::violation(format!("invalid identity {raw:?}")))
}

fn object_field<T: DeserializeOwned>(rest: &[Value], what: &str) -> Result<T, AerodropError> {
    let value = rest
        .first()
        .cloned()
        .ok_or_else(|| AerodropError::violation(format!("missing {what}")))?;
    serde_json::from_value(value).map_err(|e| AerodropError::violation(format!("bad {what}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(id: &Identity) -> Announcement {
        Announcement {
            id: id.clone(),
            name: "Brave Otter".into(),
            device: DeviceTag::Mobile,
            joined_at: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn hello_wire_shape() {
        let id = Identity::generate();
        let encoded = BroadcastPacket::Hello(announcement(&id)).encode();
        let raw: Vec<Value> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(raw[0], "👋");
        assert_eq!(raw[1], id.as_str());
        assert_eq!(raw[3], "mobile");
        assert_eq!(raw[4], 1_700_000_000_000u64);

        assert_eq!(
            BroadcastPacket::decode(&encoded).unwrap(),
            BroadcastPacket::Hello(announcement(&id))
        );
    }

    #[test]
    fn leave_carries_only_the_identity() {
        let id = Identity::generate();
        let encoded = BroadcastPacket::Leave(id.clone()).encode();
        assert_eq!(encoded, format!("[\"🍃\",\"{id}\"]"));
        assert_eq!(BroadcastPacket::decode(&encoded).unwrap().sender(), &id);
    }

    #[test]
    fn non_numeric_join_time_is_tolerated() {
        let id = Identity::generate();
        let data = json!(["😄", id.as_str(), "Otter", "desktop", "yesterday"]).to_string();
        match BroadcastPacket::decode(&data).unwrap() {
            BroadcastPacket::Welcome(a) => assert_eq!(a.joined_at, None),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_broadcasts_are_violations() {
        let id = Identity::generate();
        let cases = [
            "not json".to_string(),
            "[]".to_string(),
            json!([42, id.as_str()]).to_string(),
            json!(["🦆", id.as_str()]).to_string(),
            json!(["👋", id.as_str()]).to_string(),
            json!(["👋", id.as_str(), "", "mobile", 1]).to_string(),
            json!(["👋", id.as_str(), "Otter", "toaster", 1]).to_string(),
            json!(["👋", "short", "Otter", "mobile", 1]).to_string(),
        ];
        for case in cases {
            assert!(
                matches!(BroadcastPacket::decode(&case), Err(AerodropError::ProtocolViolation(_))),
                "{case} should be rejected"
            );
        }
    }

    #[test]
    fn offer_and_candidate_use_browser_field_names() {
        let offer = SignalingPacket::Offer(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".into(),
        });
        let raw: Vec<Value> = serde_json::from_str(&offer.encode()).unwrap();
        assert_eq!(raw[1]["type"], "offer");

        let candidate = SignalingPacket::Candidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        });
        let raw: Vec<Value> = serde_json::from_str(&candidate.encode()).unwrap();
        assert_eq!(raw[0], "🤝");
        assert_eq!(raw[1]["sdpMid"], "0");
        assert_eq!(raw[1]["sdpMLineIndex"], 0);
        assert!(raw[1].get("usernameFragment").is_none());
        assert_eq!(SignalingPacket::decode(&candidate.encode()).unwrap(), candidate);
    }

    #[test]
    fn request_tag_keeps_variation_selector() {
        let id = Identity::generate();
        let data = json!(["🕊\u{fe0f}", id.as_str()]).to_string();
        assert_eq!(SignalingPacket::decode(&data).unwrap(), SignalingPacket::Request(id));
    }

    #[test]
    fn resalt_reply_flag_defaults_to_request() {
        let id = Identity::generate();
        let data = json!(["🧂", id.as_str()]).to_string();
        assert_eq!(
            SignalingPacket::decode(&data).unwrap(),
            SignalingPacket::Resalt { id, reply: false }
        );
        assert_eq!(peek_tag(&data).as_deref(), Some(tags::RESALT));
    }

    #[test]
    fn offer_without_description_is_violation() {
        let err = SignalingPacket::decode(r#"["🙋"]"#).unwrap_err();
        assert!(matches!(err, AerodropError::ProtocolViolation(_)));
        let err = SignalingPacket::decode(r#"["🙋", {"type": "bogus", "sdp": ""}]"#).unwrap_err();
        assert!(matches!(err, AerodropError::ProtocolViolation(_)));
    }
}
