//! Agent IPC wire protocol
//!
//! JSON text frames shaped `{"messageType": <int>, "content": {"type":
//! <int>, "data": <object|null>}}`. `messageType` and `content.type` are
//! small closed enumerations; `content.type` sub-enumerates intent per
//! direction, so it stays a raw integer in the envelope and is interpreted
//! against the direction-specific enum inside each handler.

use serde::{Deserialize, Serialize};

/// Top-level message discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    /// agent→bridge: agent-initiated action
    ClientRequest = 0,
    /// agent→bridge: reply to a prior bridge request
    ClientResponse = 1,
    /// bridge→agent: bridge-initiated action
    ServerRequest = 2,
    /// bridge→agent: reply to a prior agent request
    ServerResponse = 3,
    /// either direction: diagnostic/passthrough, logged only
    ApiMessage = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ClientRequest),
            1 => Ok(Self::ClientResponse),
            2 => Ok(Self::ServerRequest),
            3 => Ok(Self::ServerResponse),
            4 => Ok(Self::ApiMessage),
            other => Err(format!("unknown messageType {}", other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

/// Intents an agent may initiate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRequestType {
    /// Registration announcement carrying the agent's username
    Connected = 0,
    /// Publish straight to the broker, bypassing the addon registry
    PublishMessage = 1,
}

impl TryFrom<u8> for ClientRequestType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Connected),
            1 => Ok(Self::PublishMessage),
            other => Err(format!("unknown client request type {}", other)),
        }
    }
}

/// Intents the bridge may initiate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRequestType {
    Ping = 0,
    ShowMessage = 1,
    ShowNotification = 2,
    AddonRequest = 3,
}

impl TryFrom<u8> for ServerRequestType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::ShowMessage),
            2 => Ok(Self::ShowNotification),
            3 => Ok(Self::AddonRequest),
            other => Err(format!("unknown server request type {}", other)),
        }
    }
}

/// Replies an agent may send to a prior bridge request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientResponseType {
    Ping = 0,
    AddonResponse = 1,
}

impl TryFrom<u8> for ClientResponseType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::AddonResponse),
            other => Err(format!("unknown client response type {}", other)),
        }
    }
}

/// Wire-level message wrapper; transient parse result, never persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "messageType")]
    pub message_type: MessageType,
    pub content: EnvelopeContent,
}

/// Intent + open structured payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeContent {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    /// Build a bridge-initiated request.
    pub fn server_request(kind: ServerRequestType, data: Option<serde_json::Value>) -> Self {
        Self {
            message_type: MessageType::ServerRequest,
            content: EnvelopeContent {
                kind: kind as u8,
                data,
            },
        }
    }

    /// Build a bridge reply to an agent request.
    pub fn server_response(kind: u8, data: Option<serde_json::Value>) -> Self {
        Self {
            message_type: MessageType::ServerResponse,
            content: EnvelopeContent { kind, data },
        }
    }
}

/// `CONNECTED` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedData {
    pub username: String,
}

/// `PUBLISH_MESSAGE` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishMessageData {
    pub topic: String,
    pub payload: String,
}

/// `SHOW_MESSAGE` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowMessageData {
    pub title: String,
    pub message: String,
}

/// `SHOW_NOTIFICATION` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShowNotificationData {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub launch_params: Option<String>,
}

/// `ADDON_REQUEST` payload (bridge→agent)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonRequestData {
    pub addon_id: String,
    pub data: serde_json::Value,
}

/// `ADDON_RESPONSE` payload (agent→bridge)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonResponseData {
    pub addon_id: String,
    pub data: serde_json::Value,
}
