use clap::{Parser, ValueEnum};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use jobd::auth::SystemUsers;
use jobd::client::Client;
use jobd::config::{JournalConfig, PermissionConfig, PriorityRange, ServerConfig};
use jobd::journal::FileJournal;
use jobd::node::Node;
use jobd::protocol::{field, verbs, Field, FieldNumber, Item, KeyValue, Request, Response};
use jobd::scheduler::JobState;
use jobd::server::Server;
use jobd::shutdown::install_shutdown_handler;

const DEFAULT_SOCKET: &str = "/run/jobd/jobd.sock";

#[derive(Parser, Debug)]
#[command(name = "jobd")]
#[command(version)]
#[command(about = "Batch job scheduler with a replayable command journal")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler server
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Job tag commands
    Tag {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TagCommands,
    },

    /// Show job counts
    Stats {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Unix socket clients connect to
    #[arg(long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Address agents connect to
    #[arg(long, default_value = "0.0.0.0:7000")]
    agent_addr: SocketAddr,

    /// Journal file
    #[arg(long, default_value = "/var/lib/jobd/journal")]
    journal: PathBuf,

    /// fsync the journal after every record
    #[arg(long)]
    fsync: bool,

    /// Queue used when a job names none
    #[arg(long)]
    default_queue: Option<String>,

    /// Refuse every command that would change state
    #[arg(long)]
    readonly: bool,

    /// Shared secret agents must answer the login challenge with
    #[arg(long)]
    agent_secret: Option<String>,

    /// Maximum number of live jobs
    #[arg(long, default_value = "100000")]
    max_jobs: usize,

    /// How often pending jobs are dispatched, in milliseconds
    #[arg(long, default_value = "1000")]
    schedule_interval_ms: u64,

    /// Group ids allowed to read (comma-separated)
    #[arg(long, value_delimiter = ',')]
    read_groups: Vec<u32>,

    /// Group ids allowed to submit and change jobs (comma-separated)
    #[arg(long, value_delimiter = ',')]
    write_groups: Vec<u32>,

    /// Group ids allowed to manage queues (comma-separated)
    #[arg(long, value_delimiter = ',')]
    queue_groups: Vec<u32>,

    /// Group ids allowed to submit jobs as other users (comma-separated)
    #[arg(long, value_delimiter = ',')]
    setuid_groups: Vec<u32>,

    /// Lowest accepted job priority
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    min_priority: i64,

    /// Highest accepted job priority
    #[arg(long, default_value = "1000", allow_negative_numbers = true)]
    max_priority: i64,

    /// Priority given to jobs that do not set one
    #[arg(long, default_value = "100", allow_negative_numbers = true)]
    default_priority: i64,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server socket
    #[arg(long, short = 's', default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job
    Add {
        /// Job name
        name: String,

        #[command(flatten)]
        fields: JobFields,
    },
    /// Show one job, or every job matching the filters
    Get {
        /// Job id
        id: Option<u64>,

        /// Queue name or glob
        #[arg(long, short = 'q')]
        queue: Option<String>,

        /// Job name or glob
        #[arg(long, short = 'n')]
        name: Option<String>,

        /// Owner uid
        #[arg(long)]
        uid: Option<u32>,

        /// Only jobs in these states (comma-separated)
        #[arg(long, value_delimiter = ',')]
        state: Vec<StateArg>,

        /// Only jobs with this tag, as KEY=VALUE (value may be a glob)
        #[arg(long = "tag", value_parser = parse_key_value)]
        tags: Vec<(String, String)>,
    },
    /// Change a job that is not running
    Mod {
        /// Job id
        id: u64,

        /// New job name
        #[arg(long)]
        name: Option<String>,

        /// Release a held job
        #[arg(long, conflicts_with = "held")]
        release: bool,

        /// Re-queue a finished job
        #[arg(long)]
        restart: bool,

        #[command(flatten)]
        fields: JobFields,
    },
    /// Delete a job
    Del {
        /// Job id
        id: u64,
    },
    /// Send a signal to a running job (0 checks whether it is running)
    Sig {
        /// Job id
        id: u64,

        /// Signal number
        #[arg(long, default_value = "15")]
        signal: i32,
    },
}

/// Fields shared by `job add` and `job mod`.
#[derive(Parser, Debug)]
struct JobFields {
    /// Queue to run on
    #[arg(long, short = 'q')]
    queue: Option<String>,

    /// Run as this uid
    #[arg(long)]
    uid: Option<u32>,

    #[arg(long, allow_negative_numbers = true)]
    priority: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    nice: Option<i64>,

    /// Do not run before this unix time
    #[arg(long)]
    defer: Option<i64>,

    /// Hold the job until released
    #[arg(long)]
    held: bool,

    #[arg(long)]
    shell: Option<String>,

    #[arg(long)]
    stdout: Option<String>,

    #[arg(long)]
    stderr: Option<String>,

    /// Command run before the job
    #[arg(long)]
    pre: Option<String>,

    /// Command run after the job
    #[arg(long)]
    post: Option<String>,

    #[arg(long)]
    wrapper: Option<String>,

    /// Resource requirement NAME[:COUNT], repeatable
    #[arg(long = "resource", short = 'r')]
    resources: Vec<String>,

    /// Environment entry NAME=VALUE, repeatable
    #[arg(long = "env", short = 'e')]
    envs: Vec<String>,

    /// Tag KEY=VALUE, repeatable
    #[arg(long = "tag", short = 't', value_parser = parse_key_value)]
    tags: Vec<(String, String)>,

    /// Job arguments
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateArg {
    Deferred,
    Holding,
    Pending,
    Running,
    Completed,
    Exited,
}

impl From<StateArg> for JobState {
    fn from(state: StateArg) -> Self {
        match state {
            StateArg::Deferred => JobState::Deferred,
            StateArg::Holding => JobState::Holding,
            StateArg::Pending => JobState::Pending,
            StateArg::Running => JobState::Running,
            StateArg::Completed => JobState::Completed,
            StateArg::Exited => JobState::Exited,
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum TagCommands {
    /// Set a tag on a job
    Set { id: u64, key: String, value: String },
    /// Remove a tag from a job
    Del { id: u64, key: String },
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn tag_map(tags: Vec<(String, String)>) -> Vec<KeyValue> {
    tags.into_iter().map(|(k, v)| KeyValue::new(k, v)).collect()
}

impl JobFields {
    fn push_into(self, item: &mut Item, adding: bool) {
        let strings = [
            (FieldNumber::QueueName, self.queue),
            (FieldNumber::Shell, self.shell),
            (FieldNumber::Stdout, self.stdout),
            (FieldNumber::Stderr, self.stderr),
            (FieldNumber::PreCmd, self.pre),
            (FieldNumber::PostCmd, self.post),
            (FieldNumber::Wrapper, self.wrapper),
        ];
        for (number, value) in strings {
            if let Some(value) = value {
                item.push(Field::string(number, value));
            }
        }
        if let Some(uid) = self.uid {
            item.push(Field::int(FieldNumber::Uid, i64::from(uid)));
        }
        for (number, value) in [
            (FieldNumber::Priority, self.priority),
            (FieldNumber::Nice, self.nice),
            (FieldNumber::DeferTime, self.defer),
        ] {
            if let Some(value) = value {
                item.push(Field::int(number, value));
            }
        }
        if adding && self.held {
            item.push(Field::boolean(FieldNumber::Hold, true));
        }
        // On modify an empty list would clear the field, so only send what
        // was given.
        if adding || !self.resources.is_empty() {
            item.push(Field::string_array(FieldNumber::Resources, self.resources));
        }
        if adding || !self.envs.is_empty() {
            item.push(Field::string_array(FieldNumber::Envs, self.envs));
        }
        if adding || !self.args.is_empty() {
            item.push(Field::string_array(FieldNumber::Args, self.args));
        }
        if adding || !self.tags.is_empty() {
            item.push(Field::string_map(FieldNumber::Tags, tag_map(self.tags)));
        }
    }
}

fn field_json(field: &Field) -> Value {
    let number = field.field_number();
    match &field.value {
        Some(field::Value::Int(state)) if number == Some(FieldNumber::State) => {
            let name = u32::try_from(*state)
                .ok()
                .and_then(JobState::from_mask)
                .map(|s| s.to_string())
                .unwrap_or_else(|| state.to_string());
            Value::String(name)
        }
        Some(field::Value::Str(s)) => json!(s),
        Some(field::Value::Int(i)) => json!(i),
        Some(field::Value::Bool(b)) => json!(b),
        Some(field::Value::StrArray(a)) => json!(a.values),
        Some(field::Value::StrMap(m)) => {
            let map: Map<String, Value> = m
                .entries
                .iter()
                .map(|kv| (kv.key.clone(), json!(kv.value)))
                .collect();
            Value::Object(map)
        }
        Some(field::Value::Blob(b)) => json!(b.len()),
        None => Value::Null,
    }
}

fn item_json(item: &Item) -> Value {
    let map: Map<String, Value> = item
        .fields
        .iter()
        .map(|f| {
            let name = f
                .field_number()
                .map(|n| n.name().to_lowercase())
                .unwrap_or_else(|| f.number.to_string());
            (name, field_json(f))
        })
        .collect();
    Value::Object(map)
}

fn response_json(response: &Response) -> Value {
    if let Some(text) = response.as_simple() {
        json!({ "result": text })
    } else if let Some(item) = response.as_map() {
        item_json(item)
    } else if let Some(items) = response.as_array() {
        Value::Array(items.iter().map(item_json).collect())
    } else {
        Value::Null
    }
}

fn cell(item: &Item, number: FieldNumber) -> String {
    match item.get(number).map(field_json) {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    }
}

fn print_jobs(items: &[Item]) {
    if items.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!(
        "{:<8} {:<20} {:<12} {:<10} {:<8} {:<6}",
        "JOB ID", "NAME", "QUEUE", "STATE", "PRIO", "EXIT"
    );
    println!("{}", "-".repeat(68));
    for item in items {
        println!(
            "{:<8} {:<20} {:<12} {:<10} {:<8} {:<6}",
            cell(item, FieldNumber::JobId),
            cell(item, FieldNumber::JobName),
            cell(item, FieldNumber::QueueName),
            cell(item, FieldNumber::State),
            cell(item, FieldNumber::Priority),
            cell(item, FieldNumber::ExitCode),
        );
    }
}

fn print_response(response: &Response, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&response_json(response))?);
        }
        OutputFormat::Table => {
            if let Some(text) = response.as_simple() {
                println!("{}", text);
            } else if let Some(item) = response.as_map() {
                for field in &item.fields {
                    let name = field.field_number().map(FieldNumber::name).unwrap_or("?");
                    let value = match field_json(field) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    println!("{:<22} {}", name, value);
                }
            } else if let Some(items) = response.as_array() {
                print_jobs(items);
            }
        }
    }
    Ok(())
}

async fn call(client: &ClientArgs, request: Request) -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = Client::connect(&client.socket).await?;
    match conn.call_ok(request).await {
        Ok(response) => print_response(&response, &client.output),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn job_request(command: JobCommands) -> Request {
    match command {
        JobCommands::Add { name, fields } => {
            let mut item = Item::new().with(Field::string(FieldNumber::JobName, name));
            fields.push_into(&mut item, true);
            Request::with_item(verbs::JOB_ADD, item)
        }
        JobCommands::Get {
            id,
            queue,
            name,
            uid,
            state,
            tags,
        } => {
            let mut item = Item::new();
            if let Some(id) = id {
                item.push(Field::int(FieldNumber::JobId, id as i64));
            }
            if let Some(queue) = queue {
                item.push(Field::string(FieldNumber::QueueName, queue));
            }
            if let Some(name) = name {
                item.push(Field::string(FieldNumber::JobName, name));
            }
            if let Some(uid) = uid {
                item.push(Field::int(FieldNumber::Uid, i64::from(uid)));
            }
            let mask = state
                .into_iter()
                .fold(0, |mask, s| mask | JobState::from(s).mask());
            if mask != 0 {
                item.push(Field::int(FieldNumber::State, i64::from(mask)));
            }
            if !tags.is_empty() {
                item.push(Field::string_map(FieldNumber::Tags, tag_map(tags)));
            }
            Request::with_item(verbs::JOB_GET, item)
        }
        JobCommands::Mod {
            id,
            name,
            release,
            restart,
            fields,
        } => {
            let mut item = Item::new().with(Field::int(FieldNumber::JobId, id as i64));
            if let Some(name) = name {
                item.push(Field::string(FieldNumber::JobName, name));
            }
            if fields.held || release {
                item.push(Field::boolean(FieldNumber::Hold, fields.held));
            }
            if restart {
                item.push(Field::boolean(FieldNumber::Restart, true));
            }
            fields.push_into(&mut item, false);
            Request::with_item(verbs::JOB_MOD, item)
        }
        JobCommands::Del { id } => Request::with_item(
            verbs::JOB_DEL,
            Item::new().with(Field::int(FieldNumber::JobId, id as i64)),
        ),
        JobCommands::Sig { id, signal } => Request::with_item(
            verbs::JOB_SIG,
            Item::new()
                .with(Field::int(FieldNumber::JobId, id as i64))
                .with(Field::int(FieldNumber::Signal, i64::from(signal))),
        ),
    }
}

fn tag_request(command: TagCommands) -> Request {
    match command {
        TagCommands::Set { id, key, value } => Request::with_item(
            verbs::TAG_SET,
            Item::new()
                .with(Field::int(FieldNumber::JobId, id as i64))
                .with(Field::string(FieldNumber::TagKey, key))
                .with(Field::string(FieldNumber::TagValue, value)),
        ),
        TagCommands::Del { id, key } => Request::with_item(
            verbs::TAG_DEL,
            Item::new()
                .with(Field::int(FieldNumber::JobId, id as i64))
                .with(Field::string(FieldNumber::TagKey, key)),
        ),
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig {
        client_socket: args.socket,
        agent_listen_addr: args.agent_addr,
        journal: JournalConfig {
            path: args.journal,
            fsync: args.fsync,
        },
        permissions: PermissionConfig {
            read_groups: args.read_groups,
            write_groups: args.write_groups,
            queue_groups: args.queue_groups,
            setuid_groups: args.setuid_groups,
            ..PermissionConfig::default()
        },
        priority: PriorityRange {
            min: args.min_priority,
            max: args.max_priority,
            default: args.default_priority,
        },
        default_queue: args.default_queue,
        readonly: args.readonly,
        agent_secret: args.agent_secret,
        max_jobs: args.max_jobs,
        schedule_interval_ms: args.schedule_interval_ms,
    };

    if !config.priority.contains(config.priority.default) {
        return Err(format!(
            "default priority {} is outside {}..={}",
            config.priority.default, config.priority.min, config.priority.max
        )
        .into());
    }

    tracing::info!(
        socket = %config.client_socket.display(),
        agent_addr = %config.agent_listen_addr,
        journal = %config.journal.path.display(),
        readonly = config.readonly,
        "Starting jobd"
    );

    let journal = FileJournal::open(&config.journal)?;
    let mut server = Server::new(&config, Box::new(SystemUsers), Box::new(journal));
    if let Err(e) = server.recover() {
        tracing::error!(error = %e, "Journal replay failed, refusing to start");
        std::process::exit(2);
    }

    let shutdown = install_shutdown_handler()?;
    Node::new(config, server).run(shutdown).await?;
    tracing::info!("jobd stopped");
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Job { client, command } => call(&client, job_request(command)).await?,
        Commands::Tag { client, command } => call(&client, tag_request(command)).await?,
        Commands::Stats { client } => call(&client, Request::new(verbs::STATS)).await?,
    }

    Ok(())
}
