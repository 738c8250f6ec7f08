use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::time::Duration;
use durastream::CoordinatorConfig;
use std::path::PathBuf;

/// Story told by the built-in scripted producer when `STORY_PATH` is unset.
const DEFAULT_STORY: &str = "Deep beneath the Misty Hills, where no lantern had burned for a \
hundred years, the goblins of Gloomhollow kept a secret. Every night, when the moon rose fat \
and yellow, they gathered around a cracked stone bowl and whispered into it. The bowl never \
answered. Not until the night a small goblin named Pim, who had been told to stay in bed, \
crept down the tunnel and heard something whisper back.";

/// Where stream chunks are persisted.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Append-only JSON-lines log on disk. Survives restarts.
    File,
    /// Process memory. Everything is lost on exit.
    Memory,
}

/// Runtime configuration for the `durastream-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), with defaults that match a local React
/// development setup.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "durastream-server",
    version,
    about = "Streams durable, resumable event logs over Server-Sent Events"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:3001"))]
    pub server_addr: String,

    /// Chunk storage backend.
    ///
    /// Environment variable: `STORAGE`
    #[arg(long, env = "STORAGE", value_enum, default_value_t = StorageKind::File)]
    pub storage: StorageKind,

    /// Path of the chunk log when `STORAGE=file`.
    ///
    /// Environment variable: `DATA_PATH`
    #[arg(long, env = "DATA_PATH", default_value = "data/stream_data.jsonl")]
    pub data_path: PathBuf,

    /// How often a tailing subscriber re-reads the store, in milliseconds.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Frames buffered per subscription before the server waits on the
    /// client.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,

    /// Events buffered per producer run. Subscribers that fall further
    /// behind resynchronize from the store.
    ///
    /// Environment variable: `BROADCAST_CAPACITY`
    #[arg(long, env = "BROADCAST_CAPACITY", default_value_t = 256)]
    pub broadcast_capacity: usize,

    /// Seconds a frame may wait for a slow client before the subscription
    /// is dropped.
    ///
    /// Environment variable: `SEND_TIMEOUT_SECS`
    #[arg(long, env = "SEND_TIMEOUT_SECS", default_value_t = 30)]
    pub send_timeout_secs: u64,

    /// Maximum lifetime of one subscription in seconds. `0` is unbounded.
    ///
    /// Environment variable: `MAX_SUBSCRIPTION_SECS`
    #[arg(long, env = "MAX_SUBSCRIPTION_SECS", default_value_t = 0)]
    pub max_subscription_secs: u64,

    /// Interval between SSE keep-alive comments, in seconds.
    ///
    /// Environment variable: `KEEP_ALIVE_SECS`
    #[arg(long, env = "KEEP_ALIVE_SECS", default_value_t = 15)]
    pub keep_alive_secs: u64,

    /// Seconds to wait for active producer runs during shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Comma-separated CORS origins. `*` allows any origin.
    ///
    /// Environment variable: `ALLOWED_ORIGINS`
    #[arg(
        long,
        env = "ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// Text file the scripted producer tells. Defaults to a built-in story.
    ///
    /// Environment variable: `STORY_PATH`
    #[arg(long, env = "STORY_PATH")]
    pub story_path: Option<PathBuf>,

    /// Words per produced fragment.
    ///
    /// Environment variable: `WORDS_PER_FRAGMENT`
    #[arg(long, env = "WORDS_PER_FRAGMENT", default_value_t = 1)]
    pub words_per_fragment: usize,

    /// Delay before each produced fragment, in milliseconds.
    ///
    /// Environment variable: `FRAGMENT_DELAY_MS`
    #[arg(long, env = "FRAGMENT_DELAY_MS", default_value_t = 100)]
    pub fragment_delay_ms: u64,

    /// Longest accepted stream id, in bytes.
    ///
    /// Environment variable: `MAX_STREAM_ID_LEN`
    #[arg(long, env = "MAX_STREAM_ID_LEN", default_value_t = 128)]
    pub max_stream_id_len: usize,
}

/// CORS policy for the HTTP routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub storage: StorageKind,
    pub data_path: PathBuf,
    pub coordinator: CoordinatorConfig,
    pub keep_alive: Duration,
    pub shutdown_timeout: Duration,
    pub allowed_origins: AllowedOrigins,
    pub story: String,
    pub words_per_fragment: usize,
    pub fragment_delay: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }
        if args.broadcast_capacity == 0 {
            bail!("BROADCAST_CAPACITY must be greater than 0");
        }
        if args.poll_interval_ms == 0 {
            bail!("POLL_INTERVAL_MS must be greater than 0");
        }
        if args.send_timeout_secs == 0 {
            bail!("SEND_TIMEOUT_SECS must be greater than 0");
        }
        if args.keep_alive_secs == 0 {
            bail!("KEEP_ALIVE_SECS must be greater than 0");
        }
        if args.words_per_fragment == 0 {
            bail!("WORDS_PER_FRAGMENT must be greater than 0");
        }
        if args.max_stream_id_len == 0 {
            bail!("MAX_STREAM_ID_LEN must be greater than 0");
        }

        let allowed_origins = parse_origins(args.allowed_origins)?;

        let story = match &args.story_path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read STORY_PATH `{}`", path.display()))?,
            None => DEFAULT_STORY.to_string(),
        };

        let coordinator = CoordinatorConfig {
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            stream_buffer_size: args.stream_buffer_size,
            broadcast_capacity: args.broadcast_capacity,
            send_timeout: Duration::from_secs(args.send_timeout_secs),
            max_subscription_lifetime: (args.max_subscription_secs > 0)
                .then(|| Duration::from_secs(args.max_subscription_secs)),
            max_stream_id_len: args.max_stream_id_len,
        };

        Ok(Self {
            server_addr: args.server_addr,
            storage: args.storage,
            data_path: args.data_path,
            coordinator,
            keep_alive: Duration::from_secs(args.keep_alive_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            allowed_origins,
            story,
            words_per_fragment: args.words_per_fragment,
            fragment_delay: Duration::from_millis(args.fragment_delay_ms),
        })
    }
}

fn parse_origins(raw: Vec<String>) -> anyhow::Result<AllowedOrigins> {
    let origins: Vec<String> = raw
        .into_iter()
        .map(|origin| origin.trim().to_string())
        .filter(|origin| !origin.is_empty())
        .collect();

    if origins.iter().any(|origin| origin == "*") {
        return Ok(AllowedOrigins::Any);
    }
    if origins.is_empty() {
        bail!("ALLOWED_ORIGINS must name at least one origin or `*`");
    }
    Ok(AllowedOrigins::List(origins))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = std::iter::once("durastream-server").chain(args.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_match_local_dev_setup() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.server_addr, "0.0.0.0:3001");
        assert_eq!(config.storage, StorageKind::File);
        assert_eq!(
            config.allowed_origins,
            AllowedOrigins::List(vec!["http://localhost:3000".to_string()])
        );
        assert_eq!(config.coordinator.poll_interval, Duration::from_secs(1));
        assert_eq!(config.coordinator.max_subscription_lifetime, None);
        assert!(!config.story.is_empty());
    }

    #[test]
    fn nonzero_lifetime_bounds_subscriptions() {
        let config = parse(&["--max-subscription-secs", "30"]).unwrap();
        assert_eq!(
            config.coordinator.max_subscription_lifetime,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn wildcard_origin_allows_any() {
        let config = parse(&["--allowed-origins", "http://a.test,*"]).unwrap();
        assert_eq!(config.allowed_origins, AllowedOrigins::Any);

        let config = parse(&["--allowed-origins", "http://a.test, http://b.test"]).unwrap();
        assert_eq!(
            config.allowed_origins,
            AllowedOrigins::List(vec!["http://a.test".to_string(), "http://b.test".to_string()])
        );
    }

    #[test]
    fn rejects_zero_sizes() {
        assert!(parse(&["--stream-buffer-size", "0"]).is_err());
        assert!(parse(&["--broadcast-capacity", "0"]).is_err());
        assert!(parse(&["--words-per-fragment", "0"]).is_err());
    }

    #[test]
    fn story_is_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("story.txt");
        std::fs::write(&path, "Once upon a time").unwrap();

        let config = parse(&["--story-path", path.to_str().unwrap()]).unwrap();
        assert_eq!(config.story, "Once upon a time");

        assert!(parse(&["--story-path", "/definitely/not/here.txt"]).is_err());
    }
}
