//! Wire envelope types.
//!
//! Requests and responses are protobuf messages framed with a length prefix.
//! The same `Request` shape carries client commands, agent events and the
//! directives the server sends to agents.

/// A command: its verb, protocol version, the client's revision, an optional
/// job id and one or more items of typed fields.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(string, tag = "1")]
    pub command: String,

    #[prost(uint32, tag = "2")]
    pub version: u32,

    #[prost(uint64, tag = "3")]
    pub revision: u64,

    #[prost(uint64, tag = "4")]
    pub jobid: u64,

    #[prost(message, repeated, tag = "5")]
    pub items: Vec<Item>,
}

/// An ordered list of typed fields.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Item {
    #[prost(message, repeated, tag = "1")]
    pub fields: Vec<Field>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Field {
    /// Stable numeric code, see [`FieldNumber`](super::FieldNumber).
    #[prost(uint32, tag = "1")]
    pub number: u32,

    #[prost(oneof = "field::Value", tags = "2, 3, 4, 5, 6, 7")]
    pub value: Option<field::Value>,
}

pub mod field {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(string, tag = "2")]
        Str(String),
        #[prost(int64, tag = "3")]
        Int(i64),
        #[prost(bool, tag = "4")]
        Bool(bool),
        #[prost(message, tag = "5")]
        StrArray(super::StringArray),
        #[prost(message, tag = "6")]
        StrMap(super::StringMap),
        #[prost(bytes = "vec", tag = "7")]
        Blob(Vec<u8>),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StringArray {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StringMap {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<KeyValue>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct KeyValue {
    #[prost(string, tag = "1")]
    pub key: String,

    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    /// Revision of the object the command touched, 0 if none.
    #[prost(uint64, tag = "1")]
    pub revision: u64,

    #[prost(oneof = "response::Body", tags = "2, 3, 4, 5")]
    pub body: Option<response::Body>,
}

pub mod response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(string, tag = "2")]
        Simple(String),
        #[prost(message, tag = "3")]
        Error(super::ErrorReply),
        #[prost(message, tag = "4")]
        Map(super::Item),
        #[prost(message, tag = "5")]
        Array(super::ItemList),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorReply {
    #[prost(string, tag = "1")]
    pub category: String,

    #[prost(string, tag = "2")]
    pub detail: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ItemList {
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<Item>,
}
