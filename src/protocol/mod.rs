//! Wire protocol shared by clients, agents and the server.
//!
//! - [`message`]: protobuf envelope types ([`Request`], [`Response`])
//! - [`fields`]: numeric field codes and typed field access
//! - [`verbs`]: command names
//!
//! Frames on every socket are length-prefixed protobuf messages.

pub mod fields;
pub mod message;
pub mod verbs;

use bytes::Bytes;
use prost::Message;

pub use fields::{first_item, visit_fields, FieldNumber};
pub use message::{
    field, response, ErrorReply, Field, Item, ItemList, KeyValue, Request, Response, StringArray,
    StringMap,
};

use crate::error::{JobdError, Result};

/// Version used by structured commands. Version 0 marks the simple
/// command set (currently only PING).
pub const PROTOCOL_VERSION: u32 = 1;

/// A decoded request together with the exact bytes it arrived as.
///
/// The raw bytes are what gets journaled, so replay sees precisely what the
/// original caller sent.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub request: Request,
    pub raw: Bytes,
}

impl Envelope {
    pub fn decode(raw: Bytes) -> Result<Self> {
        let request = Request::decode(raw.clone())
            .map_err(|e| JobdError::Decode(format!("invalid request frame: {}", e)))?;
        Ok(Self { request, raw })
    }

    pub fn from_request(request: Request) -> Self {
        let raw = Bytes::from(request.encode_to_vec());
        Self { request, raw }
    }

    pub fn verb(&self) -> &str {
        &self.request.command
    }
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            version: PROTOCOL_VERSION,
            ..Default::default()
        }
    }

    /// A request with a single item of fields.
    pub fn with_item(command: impl Into<String>, item: Item) -> Self {
        let mut request = Self::new(command);
        request.items.push(item);
        request
    }
}

impl Response {
    pub fn simple(text: impl Into<String>) -> Self {
        Self {
            revision: 0,
            body: Some(response::Body::Simple(text.into())),
        }
    }

    pub fn map(item: Item) -> Self {
        Self {
            revision: 0,
            body: Some(response::Body::Map(item)),
        }
    }

    pub fn array(items: Vec<Item>) -> Self {
        Self {
            revision: 0,
            body: Some(response::Body::Array(ItemList { items })),
        }
    }

    pub fn error(err: &JobdError) -> Self {
        Self {
            revision: 0,
            body: Some(response::Body::Error(ErrorReply {
                category: err.category().to_string(),
                detail: err.to_string(),
            })),
        }
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, Some(response::Body::Error(_)))
    }

    /// Error category, if this is an error reply.
    pub fn error_category(&self) -> Option<&str> {
        match &self.body {
            Some(response::Body::Error(e)) => Some(e.category.as_str()),
            _ => None,
        }
    }

    /// Error detail text, if this is an error reply.
    pub fn error_detail(&self) -> Option<&str> {
        match &self.body {
            Some(response::Body::Error(e)) => Some(e.detail.as_str()),
            _ => None,
        }
    }

    pub fn as_simple(&self) -> Option<&str> {
        match &self.body {
            Some(response::Body::Simple(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Item> {
        match &self.body {
            Some(response::Body::Map(item)) => Some(item),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Item]> {
        match &self.body {
            Some(response::Body::Array(list)) => Some(&list.items),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }
}
