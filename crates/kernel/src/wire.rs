//! Framing and signing of kernel protocol messages.
//!
//! Every message travels as a multipart sequence:
//!
//! ```text
//! [identities...] <IDS|MSG> signature header parent_header metadata content [buffers...]
//! ```
//!
//! The signature is an HMAC over the four serialized JSON parts, in that
//! order, keyed with the connection file's shared key.

use std::fmt;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const DELIMITER: &[u8] = b"<IDS|MSG>";
pub const PROTOCOL_VERSION: &str = "5.0";

const HMAC_SHA256: &str = "hmac-sha256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unsupported signature scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("signing key was rejected")]
    InvalidKey,
    #[error("message has no delimiter frame")]
    MissingDelimiter,
    #[error("message has {0} frames after the delimiter, expected at least 5")]
    Truncated(usize),
    #[error("malformed message part: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message part is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("cannot send an empty multipart message")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureScheme {
    HmacSha256,
    Unsupported(String),
}

impl SignatureScheme {
    pub fn parse(scheme: &str) -> Self {
        if scheme == HMAC_SHA256 {
            Self::HmacSha256
        } else {
            Self::Unsupported(scheme.to_string())
        }
    }
}

/// Signs outgoing messages with the kernel's shared key.
#[derive(Clone)]
pub struct Signer {
    scheme: SignatureScheme,
    key: Vec<u8>,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(scheme: &str, key: &str) -> Self {
        Self {
            scheme: SignatureScheme::parse(scheme),
            key: key.as_bytes().to_vec(),
        }
    }

    pub fn scheme(&self) -> &SignatureScheme {
        &self.scheme
    }

    pub fn try_sign(
        &self,
        header: &[u8],
        parent_header: &[u8],
        metadata: &[u8],
        content: &[u8],
    ) -> Result<String, ProtocolError> {
        let mut mac = self.mac()?;
        mac.update(header);
        mac.update(parent_header);
        mac.update(metadata);
        mac.update(content);

        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Signs the four serialized parts. An unsupported scheme yields an empty
    /// signature, which kernels running without authentication accept.
    pub fn sign(&self, header: &str, parent_header: &str, metadata: &str, content: &str) -> String {
        self.try_sign(
            header.as_bytes(),
            parent_header.as_bytes(),
            metadata.as_bytes(),
            content.as_bytes(),
        )
        .unwrap_or_else(|e| {
            warn!(error = %e, "sending message without a signature");
            String::new()
        })
    }

    pub fn verify(&self, parts: &[Bytes; 4], signature: &[u8]) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        for part in parts {
            mac.update(part);
        }

        mac.verify_slice(&expected).is_ok()
    }

    fn mac(&self) -> Result<HmacSha256, ProtocolError> {
        match &self.scheme {
            SignatureScheme::HmacSha256 => {
                HmacSha256::new_from_slice(&self.key).map_err(|_| ProtocolError::InvalidKey)
            }
            SignatureScheme::Unsupported(scheme) => {
                Err(ProtocolError::UnsupportedScheme(scheme.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub username: String,
    pub session: String,
    pub msg_type: String,
    pub version: String,
}

impl Header {
    pub fn new(msg_type: &str, session: &str, username: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            session: session.to_string(),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    /// Header of the request this message answers, `{}` for a fresh request.
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
}

impl Message {
    pub fn request(header: Header, content: Value) -> Self {
        Self {
            header,
            parent_header: json!({}),
            metadata: json!({}),
            content,
        }
    }

    pub fn reply(parent: &Header, header: Header, content: Value) -> Result<Self, ProtocolError> {
        Ok(Self {
            header,
            parent_header: serde_json::to_value(parent)?,
            metadata: json!({}),
            content,
        })
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }

    /// Serializes into the six frames sent on the wire.
    pub fn to_frames(&self, signer: &Signer) -> Result<Vec<Bytes>, ProtocolError> {
        let header = serde_json::to_string(&self.header)?;
        let parent_header = serde_json::to_string(&self.parent_header)?;
        let metadata = serde_json::to_string(&self.metadata)?;
        let content = serde_json::to_string(&self.content)?;
        let signature = signer.sign(&header, &parent_header, &metadata, &content);

        Ok(vec![
            Bytes::from_static(DELIMITER),
            Bytes::from(signature),
            Bytes::from(header),
            Bytes::from(parent_header),
            Bytes::from(metadata),
            Bytes::from(content),
        ])
    }

    pub fn from_frames(frames: Vec<Bytes>) -> Result<Self, ProtocolError> {
        Envelope::parse(frames)?.decode()
    }
}

/// A received multipart message split at its delimiter, not yet decoded.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Routing identities or pub/sub topics preceding the delimiter.
    pub identities: Vec<Bytes>,
    pub signature: Bytes,
    pub parts: [Bytes; 4],
}

impl Envelope {
    pub fn parse(mut frames: Vec<Bytes>) -> Result<Self, ProtocolError> {
        let at = frames
            .iter()
            .position(|frame| frame.as_ref() == DELIMITER)
            .ok_or(ProtocolError::MissingDelimiter)?;
        let rest = frames.split_off(at);
        if rest.len() < 6 {
            return Err(ProtocolError::Truncated(rest.len() - 1));
        }

        Ok(Self {
            identities: frames,
            signature: rest[1].clone(),
            parts: [
                rest[2].clone(),
                rest[3].clone(),
                rest[4].clone(),
                rest[5].clone(),
            ],
        })
    }

    pub fn verify(&self, signer: &Signer) -> bool {
        signer.verify(&self.parts, &self.signature)
    }

    pub fn decode(&self) -> Result<Message, ProtocolError> {
        let [header, parent_header, metadata, content] = &self.parts;

        Ok(Message {
            header: serde_json::from_str(std::str::from_utf8(header)?)?,
            parent_header: serde_json::from_str(std::str::from_utf8(parent_header)?)?,
            metadata: serde_json::from_str(std::str::from_utf8(metadata)?)?,
            content: serde_json::from_str(std::str::from_utf8(content)?)?,
        })
    }
}
