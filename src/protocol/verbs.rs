// Client commands
pub const JOB_ADD: &str = "JOB_ADD";
pub const JOB_GET: &str = "JOB_GET";
pub const JOB_MOD: &str = "JOB_MOD";
pub const JOB_DEL: &str = "JOB_DEL";
pub const JOB_SIG: &str = "JOB_SIG";
pub const QUEUE_ADD: &str = "QUEUE_ADD";
pub const QUEUE_GET: &str = "QUEUE_GET";
pub const QUEUE_MOD: &str = "QUEUE_MOD";
pub const QUEUE_DEL: &str = "QUEUE_DEL";
pub const RESOURCE_ADD: &str = "RESOURCE_ADD";
pub const RESOURCE_GET: &str = "RESOURCE_GET";
pub const RESOURCE_MOD: &str = "RESOURCE_MOD";
pub const RESOURCE_DEL: &str = "RESOURCE_DEL";
pub const TAG_SET: &str = "TAG_SET";
pub const TAG_DEL: &str = "TAG_DEL";
pub const STATS: &str = "STATS";
pub const AGENT_GET: &str = "AGENT_GET";

// Simple (version 0) commands
pub const PING: &str = "PING";

// Agent -> server
pub const JOB_STARTED: &str = "JOB_STARTED";
pub const JOB_COMPLETED: &str = "JOB_COMPLETED";
pub const AGENT_LOGIN: &str = "AGENT_LOGIN";
pub const RECON: &str = "RECON";
pub const AUTH: &str = "AUTH";
pub const PROXY_CONN: &str = "PROXY_CONN";
pub const PROXY_CLOSE: &str = "PROXY_CLOSE";

// Issued by the server itself
pub const JOB_RELEASE: &str = "JOB_RELEASE";

// Server -> agent
pub const RECON_REQ: &str = "RECON_REQ";
pub const AUTH_CHALLENGE: &str = "AUTH_CHALLENGE";
pub const START_JOB: &str = "START_JOB";
pub const RECON_COMPLETE: &str = "RECON_COMPLETE";
pub const SIG_JOB: &str = "SIG_JOB";

// Both directions
pub const PROXY_DATA: &str = "PROXY_DATA";
