use anyhow::bail;
use clap::Parser;

/// Runtime configuration for the `lmtp-server` binary.
///
/// These settings control batching, polling cadence, and model-retention
/// policy for the scheduling engine. All values are parsed from CLI
/// arguments or environment variables, with reasonable defaults suitable
/// for local development against the bundled demo backend.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "lmtp-server",
    version,
    about = "A scheduling and batching engine for token-streaming LLM backends"
)]
pub struct CliArgs {
    /// Upper bound on the number of calls collected into one batch, on top
    /// of whatever the loaded backend reports via `ModelBackend::max_batch_size`.
    /// The effective cap is `min(this, backend.max_batch_size())`.
    ///
    /// Environment variable: `MAX_BATCH_SIZE`
    ///
    /// Default: `64`
    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = 64)]
    pub max_batch_size: usize,

    /// How long a worker waits after its first call of a round before
    /// closing the batch and dispatching it to the backend.
    ///
    /// Environment variable: `COLLECTION_WINDOW_MS`
    ///
    /// Default: `100`
    #[arg(long, env = "COLLECTION_WINDOW_MS", default_value_t = 100)]
    pub collection_window_ms: u64,

    /// How long a worker sleeps between polls of an empty queue before
    /// checking again for new calls.
    ///
    /// Environment variable: `IDLE_SLEEP_MS`
    ///
    /// Default: `10`
    #[arg(long, env = "IDLE_SLEEP_MS", default_value_t = 10)]
    pub idle_sleep_ms: u64,

    /// How often a session's output loop polls its inbound queue for
    /// payloads to forward to the transport.
    ///
    /// Environment variable: `OUTPUT_POLL_MS`
    ///
    /// Default: `10`
    #[arg(long, env = "OUTPUT_POLL_MS", default_value_t = 10)]
    pub output_poll_ms: u64,

    /// Number of most-recently-used schedulers the registry keeps alive
    /// even once their call queues are empty, so a model doesn't pay a
    /// fresh load cost on every idle gap.
    ///
    /// Environment variable: `RETENTION_MIN_LOADED`
    ///
    /// Default: `2`
    #[arg(long, env = "RETENTION_MIN_LOADED", default_value_t = 2)]
    pub retention_min_loaded: usize,

    /// Size of the sliding window (in `(timestamp, batch_size)` samples)
    /// the rolling rate estimator keeps for `tok_s` and `avg_batch_size`.
    ///
    /// Environment variable: `RATE_WINDOW_SAMPLES`
    ///
    /// Default: `100`
    #[arg(long, env = "RATE_WINDOW_SAMPLES", default_value_t = 100)]
    pub rate_window_samples: usize,

    /// Restrict every session on this server to models already resident in
    /// the registry; refuse to load new ones on demand.
    ///
    /// Environment variable: `STATIC_SESSION`
    ///
    /// Default: `false`
    #[arg(long, env = "STATIC_SESSION", default_value_t = false)]
    pub static_session: bool,

    /// Exempt this server's schedulers from the registry's idle garbage
    /// collection, keeping every loaded model resident for the process
    /// lifetime regardless of `retention_min_loaded`.
    ///
    /// Environment variable: `LONGRUNNING_SESSION`
    ///
    /// Default: `false`
    #[arg(long, env = "LONGRUNNING_SESSION", default_value_t = false)]
    pub longrunning_session: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_batch_size: usize,
    pub collection_window_ms: u64,
    pub idle_sleep_ms: u64,
    pub output_poll_ms: u64,
    pub retention_min_loaded: usize,
    pub rate_window_samples: usize,
    pub static_session: bool,
    pub longrunning_session: bool,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_batch_size == 0 {
            bail!("MAX_BATCH_SIZE must be greater than 0");
        }

        if args.rate_window_samples == 0 {
            bail!("RATE_WINDOW_SAMPLES must be greater than 0");
        }

        Ok(Self {
            max_batch_size: args.max_batch_size,
            collection_window_ms: args.collection_window_ms,
            idle_sleep_ms: args.idle_sleep_ms,
            output_poll_ms: args.output_poll_ms,
            retention_min_loaded: args.retention_min_loaded,
            rate_window_samples: args.rate_window_samples,
            static_session: args.static_session,
            longrunning_session: args.longrunning_session,
        })
    }
}
