//! Wire shapes for the room signaling protocol peers use to find each other
//! and exchange session descriptions before any file bytes move.
//!
//! Only the message shapes live here. Room bookkeeping and the socket
//! transport belong to whichever server relays these events.

use serde::{Deserialize, Serialize};

/// Kind of device a peer announces when joining a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Mobile,
    Pc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    pub id: String,
    pub device: DeviceType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerId {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberList {
    pub initialization: Vec<RoomMember>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub origin: String,
    pub target: String,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub origin: String,
    pub target: String,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcePayload {
    pub origin: String,
    pub target: String,
    pub ice: IceCandidate,
}

/// Events a peer sends to the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    JoinRoom(RoomMember),
    LeaveRoom(PeerId),
    SendOffer(OfferPayload),
    SendAnswer(AnswerPayload),
    SendIce(IcePayload),
}

/// Events the signaling server pushes to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    JoinedRoom(RoomMember),
    JoinedMember(MemberList),
    LeftRoom(PeerId),
    ForwardOffer(OfferPayload),
    ForwardAnswer(AnswerPayload),
    ForwardIce(IcePayload),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => "JOIN_ROOM",
            ClientEvent::LeaveRoom(_) => "LEAVE_ROOM",
            ClientEvent::SendOffer(_) => "SEND_OFFER",
            ClientEvent::SendAnswer(_) => "SEND_ANSWER",
            ClientEvent::SendIce(_) => "SEND_ICE",
        }
    }

    /// Peer the event is addressed to, for the events a server relays.
    pub fn target(&self) -> Option<&str> {
        match self {
            ClientEvent::SendOffer(payload) => Some(&payload.target),
            ClientEvent::SendAnswer(payload) => Some(&payload.target),
            ClientEvent::SendIce(payload) => Some(&payload.target),
            ClientEvent::JoinRoom(_) | ClientEvent::LeaveRoom(_) => None,
        }
    }

    /// The event a relaying server delivers to `target()` for this event.
    /// Room membership events have no one-to-one forward.
    pub fn into_forward(self) -> Option<ServerEvent> {
        match self {
            ClientEvent::SendOffer(payload) => Some(ServerEvent::ForwardOffer(payload)),
            ClientEvent::SendAnswer(payload) => Some(ServerEvent::ForwardAnswer(payload)),
            ClientEvent::SendIce(payload) => Some(ServerEvent::ForwardIce(payload)),
            ClientEvent::JoinRoom(_) | ClientEvent::LeaveRoom(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::JoinedRoom(_) => "JOINED_ROOM",
            ServerEvent::JoinedMember(_) => "JOINED_MEMBER",
            ServerEvent::LeftRoom(_) => "LEFT_ROOM",
            ServerEvent::ForwardOffer(_) => "FORWARD_OFFER",
            ServerEvent::ForwardAnswer(_) => "FORWARD_ANSWER",
            ServerEvent::ForwardIce(_) => "FORWARD_ICE",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
