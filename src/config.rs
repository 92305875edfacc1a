use std::net::SocketAddr;
use std::path::PathBuf;

/// Journal location and durability settings.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Append-only file holding every successful mutating command.
    pub path: PathBuf,
    /// Call `fsync` after each flush. Slower, but survives power loss.
    pub fsync: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/jobd/journal"),
            fsync: false,
        }
    }
}

/// Maps system groups onto command permissions.
///
/// A user holds a permission if any of their groups appears in the
/// corresponding list. uid 0 bypasses these checks entirely.
#[derive(Debug, Clone)]
pub struct PermissionConfig {
    pub read_groups: Vec<u32>,
    pub write_groups: Vec<u32>,
    pub queue_groups: Vec<u32>,
    pub setuid_groups: Vec<u32>,
    /// How long a loaded permission set is trusted before it is reloaded.
    pub cache_ttl_secs: u64,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            read_groups: Vec::new(),
            write_groups: Vec::new(),
            queue_groups: Vec::new(),
            setuid_groups: Vec::new(),
            cache_ttl_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityRange {
    pub min: i64,
    pub max: i64,
    pub default: i64,
}

impl Default for PriorityRange {
    fn default() -> Self {
        Self {
            min: 0,
            max: 1000,
            default: 100,
        }
    }
}

impl PriorityRange {
    pub fn contains(&self, priority: i64) -> bool {
        priority >= self.min && priority <= self.max
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unix socket clients connect to. The peer uid identifies the caller.
    pub client_socket: PathBuf,
    /// TCP address agents connect to.
    pub agent_listen_addr: SocketAddr,
    pub journal: JournalConfig,
    pub permissions: PermissionConfig,
    pub priority: PriorityRange,
    /// Queue used when a submission names none. A queue flagged as default
    /// at runtime takes precedence.
    pub default_queue: Option<String>,
    /// Reject every journaled command with a READONLY error.
    pub readonly: bool,
    /// Shared secret agents must present after AGENT_LOGIN. None disables
    /// the challenge.
    pub agent_secret: Option<String>,
    pub max_jobs: usize,
    pub schedule_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            client_socket: PathBuf::from("/run/jobd/jobd.sock"),
            agent_listen_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            journal: JournalConfig::default(),
            permissions: PermissionConfig::default(),
            priority: PriorityRange::default(),
            default_queue: None,
            readonly: false,
            agent_secret: None,
            max_jobs: 100_000,
            schedule_interval_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn new(client_socket: PathBuf, journal_path: PathBuf) -> Self {
        Self {
            client_socket,
            journal: JournalConfig {
                path: journal_path,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_default_queue(mut self, name: impl Into<String>) -> Self {
        self.default_queue = Some(name.into());
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }
}
