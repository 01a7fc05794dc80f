use anyhow::bail;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `tutor-stream-server` binary.
///
/// These settings control worker concurrency, cancellation latency, history
/// bounds and the LLM endpoint. All values are parsed from CLI arguments or
/// environment variables (a `.env` file is loaded first), with defaults
/// suitable for a single-node deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tutor-stream-server",
    version,
    about = "A WebSocket service streaming cancellable LLM responses"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8050"))]
    pub server_addr: String,

    /// Number of worker tasks that receive jobs from the queue.
    ///
    /// Jobs are distributed round-robin across workers.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 2)]
    pub num_workers: usize,

    /// Number of jobs a single worker runs concurrently.
    ///
    /// Additional jobs handed to a busy worker stay `pending` until a slot
    /// frees up.
    ///
    /// Environment variable: `JOBS_PER_WORKER`
    #[arg(long, env = "JOBS_PER_WORKER", default_value_t = 4)]
    pub jobs_per_worker: usize,

    /// Capacity of each worker's inbound job channel.
    ///
    /// Environment variable: `WORK_QUEUE_CAPACITY`
    #[arg(long, env = "WORK_QUEUE_CAPACITY", default_value_t = 64)]
    pub work_queue_capacity: usize,

    /// Poll interval of the stop-listener, in milliseconds.
    ///
    /// Bounds how long a worker may take to observe a stop command while it
    /// is waiting on the control channel.
    ///
    /// Environment variable: `STOP_POLL_INTERVAL_MS`
    #[arg(long, env = "STOP_POLL_INTERVAL_MS", default_value_t = 10)]
    pub stop_poll_interval_ms: u64,

    /// Maximum number of history entries kept per conversation.
    ///
    /// One entry is one user or assistant turn, so the value must be even.
    ///
    /// Environment variable: `HISTORY_TURNS`
    #[arg(long, env = "HISTORY_TURNS", default_value_t = 10)]
    pub history_turns: usize,

    /// Enables multi-turn conversations keyed by `conversation_id`.
    ///
    /// Environment variable: `MULTI_TURN`
    #[arg(long, env = "MULTI_TURN", default_value_t = true, action = clap::ArgAction::Set)]
    pub multi_turn: bool,

    /// Seconds a conversation may go unused before its history is dropped.
    ///
    /// Environment variable: `CONVERSATION_IDLE_SECS`
    #[arg(long, env = "CONVERSATION_IDLE_SECS", default_value_t = 3600)]
    pub conversation_idle_secs: u64,

    /// How long a finished job's state stays queryable, in seconds.
    ///
    /// Environment variable: `STATUS_RETENTION_SECS`
    #[arg(long, env = "STATUS_RETENTION_SECS", default_value_t = 300)]
    pub status_retention_secs: u64,

    /// Seconds a relay waits for the next event before giving up on a job.
    /// `0` waits forever.
    ///
    /// Environment variable: `RELAY_IDLE_TIMEOUT_SECS`
    #[arg(long, env = "RELAY_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub relay_idle_timeout_secs: u64,

    /// Capacity of each connection's outbound message queue.
    ///
    /// Environment variable: `OUTBOUND_BUFFER_SIZE`
    #[arg(long, env = "OUTBOUND_BUFFER_SIZE", default_value_t = 64)]
    pub outbound_buffer_size: usize,

    /// Seconds to wait for in-flight jobs to finish during shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,

    /// Model requested from the chat completions endpoint.
    ///
    /// Environment variable: `MODEL_NAME`
    #[arg(long, env = "MODEL_NAME", default_value_t = String::from("deepseek-r1:1.5b"))]
    pub model_name: String,

    /// Base URL of an OpenAI-compatible API, including the `/v1` suffix.
    ///
    /// Environment variable: `OPENAI_API_BASE`
    #[arg(long, env = "OPENAI_API_BASE", default_value_t = String::from("http://localhost:11434/v1"))]
    pub openai_api_base: String,

    /// API key sent as a bearer token. Local servers usually ignore it.
    ///
    /// Environment variable: `OPENAI_API_KEY`
    #[arg(long, env = "OPENAI_API_KEY", default_value_t = String::from("ollama"), hide_env_values = true)]
    pub openai_api_key: String,

    /// System prompt for single-turn questions.
    ///
    /// Environment variable: `SYSTEM_PROMPT`
    #[arg(long, env = "SYSTEM_PROMPT")]
    pub system_prompt: Option<String>,

    /// System prompt for follow-up questions within a conversation.
    ///
    /// Environment variable: `FOLLOWUP_SYSTEM_PROMPT`
    #[arg(long, env = "FOLLOWUP_SYSTEM_PROMPT")]
    pub followup_system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub num_workers: usize,
    pub jobs_per_worker: usize,
    pub work_queue_capacity: usize,
    pub stop_poll_interval: Duration,
    pub history_turns: usize,
    pub multi_turn: bool,
    pub conversation_idle: Duration,
    pub status_retention: Duration,
    pub relay_idle_timeout: Option<Duration>,
    pub outbound_buffer_size: usize,
    pub shutdown_timeout: Duration,
    pub llm: LlmConfig,
    pub prompt: PromptConfig,
}

#[derive(Clone)]
pub struct LlmConfig {
    pub model_name: String,
    pub api_base: String,
    pub api_key: String,
}

// Keeps the key out of the startup log.
impl core::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("model_name", &self.model_name)
            .field("api_base", &self.api_base)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptConfig {
    pub system: Option<String>,
    pub followup_system: Option<String>,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.jobs_per_worker == 0 {
            bail!("JOBS_PER_WORKER must be greater than 0");
        }

        if args.work_queue_capacity == 0 {
            bail!("WORK_QUEUE_CAPACITY must be greater than 0");
        }

        if args.outbound_buffer_size == 0 {
            bail!("OUTBOUND_BUFFER_SIZE must be greater than 0");
        }

        if !(1..=1000).contains(&args.stop_poll_interval_ms) {
            bail!(
                "STOP_POLL_INTERVAL_MS ({}) must be between 1 and 1000",
                args.stop_poll_interval_ms
            );
        }

        if args.history_turns == 0 || args.history_turns % 2 != 0 {
            bail!(
                "HISTORY_TURNS ({}) must be a positive even number",
                args.history_turns
            );
        }

        if args.conversation_idle_secs == 0 {
            bail!("CONVERSATION_IDLE_SECS must be greater than 0");
        }

        if args.openai_api_base.trim().is_empty() {
            bail!("OPENAI_API_BASE must not be empty");
        }

        let relay_idle_timeout = match args.relay_idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            server_addr: args.server_addr,
            num_workers: args.num_workers,
            jobs_per_worker: args.jobs_per_worker,
            work_queue_capacity: args.work_queue_capacity,
            stop_poll_interval: Duration::from_millis(args.stop_poll_interval_ms),
            history_turns: args.history_turns,
            multi_turn: args.multi_turn,
            conversation_idle: Duration::from_secs(args.conversation_idle_secs),
            status_retention: Duration::from_secs(args.status_retention_secs),
            relay_idle_timeout,
            outbound_buffer_size: args.outbound_buffer_size,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            llm: LlmConfig {
                model_name: args.model_name,
                api_base: args.openai_api_base.trim_end_matches('/').to_string(),
                api_key: args.openai_api_key,
            },
            prompt: PromptConfig {
                system: args.system_prompt,
                followup_system: args.followup_system_prompt,
            },
        })
    }
}

#[cfg(test)]
impl ServerConfig {
    /// Small, fast settings for in-process tests.
    pub fn for_tests() -> Self {
        Self {
            server_addr: "127.0.0.1:0".to_string(),
            num_workers: 2,
            jobs_per_worker: 4,
            work_queue_capacity: 16,
            stop_poll_interval: Duration::from_millis(10),
            history_turns: 10,
            multi_turn: true,
            conversation_idle: Duration::from_secs(3600),
            status_retention: Duration::from_secs(60),
            relay_idle_timeout: Some(Duration::from_secs(5)),
            outbound_buffer_size: 64,
            shutdown_timeout: Duration::from_secs(1),
            llm: LlmConfig {
                model_name: "test-model".to_string(),
                api_base: "http://127.0.0.1:9/v1".to_string(),
                api_key: "test".to_string(),
            },
            prompt: PromptConfig::default(),
        }
    }
}
