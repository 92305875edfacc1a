use bytes::Bytes;

/// One successfully applied mutating command, as it arrived on the wire.
#[derive(Clone, PartialEq, prost::Message)]
pub struct JournalRecord {
    /// Acting uid. 0 for agent-originated events.
    #[prost(uint32, tag = "1")]
    pub uid: u32,

    #[prost(string, tag = "2")]
    pub command: String,

    /// Verbatim request frame.
    #[prost(bytes = "bytes", tag = "3")]
    pub request: Bytes,

    /// Job the command touched, 0 if none.
    #[prost(uint64, tag = "4")]
    pub jobid: u64,

    /// Job revision after the command.
    #[prost(uint64, tag = "5")]
    pub revision: u64,

    /// Server clock (unix seconds) when the command ran.
    #[prost(int64, tag = "6")]
    pub timestamp: i64,
}
