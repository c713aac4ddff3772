//! Routing headers carried on client-originated messages.
//!
//! The monitor re-routes by these headers, never by parsing the routing key
//! string back apart.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::{validate_identifier, RoutingError};

/// Header table attached to a published message.
pub type MessageHeaders = BTreeMap<String, String>;

/// Header name for the sender's room.
pub const ROOM_HEADER: &str = "room";
/// Header name for the sender's client id.
pub const CLIENT_HEADER: &str = "client";
/// Header name for the client action.
pub const ACTION_HEADER: &str = "action";

/// Why a delivery's routing headers could not be used.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// A required header is absent.
    #[error("missing routing header {0:?}")]
    Missing(&'static str),
    /// A header is present but cannot be spliced into a routing key.
    #[error(transparent)]
    Malformed(#[from] RoutingError),
}

/// `{room, client, action}` metadata for one client message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHeaders {
    /// Room the sender is in.
    pub room: String,
    /// Sender's client id.
    pub client: String,
    /// Action named in the client payload.
    pub action: String,
}

impl RoutingHeaders {
    /// Build headers for a client message.
    pub fn new(room: impl Into<String>, client: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            client: client.into(),
            action: action.into(),
        }
    }

    /// Encode into a header table.
    #[must_use]
    pub fn to_headers(&self) -> MessageHeaders {
        let mut headers = MessageHeaders::new();
        let _ = headers.insert(ROOM_HEADER.to_owned(), self.room.clone());
        let _ = headers.insert(CLIENT_HEADER.to_owned(), self.client.clone());
        let _ = headers.insert(ACTION_HEADER.to_owned(), self.action.clone());
        headers
    }

    /// Decode and validate from a header table.
    ///
    /// Extra headers are ignored. Each of the three fields must be present
    /// and be a valid routing identifier.
    pub fn from_headers(headers: &MessageHeaders) -> Result<Self, HeaderError> {
        let field = |name: &'static str| -> Result<String, HeaderError> {
            let value = headers.get(name).ok_or(HeaderError::Missing(name))?;
            let _ = validate_identifier(name, value)?;
            Ok(value.clone())
        };
        Ok(Self {
            room: field(ROOM_HEADER)?,
            client: field(CLIENT_HEADER)?,
            action: field(ACTION_HEADER)?,
        })
    }
}
