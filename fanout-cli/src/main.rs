//! Command line front end for fan-out batches.
//!
//! `fanout users` fetches user records over HTTP, `fanout simulate` runs a batch against an
//! in-memory fetcher with configurable failures and delays.

use std::fmt::Debug;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use fanout::config::{FailurePolicy, FanOutConfig, MergeStrategy};
use fanout::error::FetchError;
use fanout::fan_out::FanOut;
use fanout::fetcher::memory::MemoryFetcher;
use fanout::types::{AggregateResult, FetchOutcome, OutcomeKind};
use fanout_config::{LoadConfigError, load_config};
use fanout_telemetry::tracing::init_tracing;
use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};

use crate::http::HttpFetcher;

mod http;

const DEFAULT_USERS_BASE_URL: &str = "https://api.github.com/users";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch user records by login or id.
    Users {
        /// Comma separated identifiers.
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<String>,

        /// Base URL the identifiers are appended to.
        #[arg(long, default_value = DEFAULT_USERS_BASE_URL)]
        base_url: String,

        /// Timeout of a single HTTP request, in milliseconds.
        #[arg(long, default_value_t = 10_000)]
        request_timeout_ms: u64,
    },
    /// Run a batch against an in-memory fetcher.
    Simulate {
        /// Number of items in the batch.
        #[arg(long, default_value_t = 20)]
        items: u32,

        /// Make every k-th item fail. Zero disables failures.
        #[arg(long, default_value_t = 0)]
        fail_every: u32,

        /// Upper bound of the random delay of each fetch, in milliseconds.
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,
    },
}

/// Flags taking precedence over the loaded configuration.
#[derive(Args, Debug)]
struct ConfigOverrides {
    /// Maximum number of fetches running at the same time.
    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    /// Deadline of a single fetch, in milliseconds.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// How outcomes are merged into the aggregate.
    #[arg(long, global = true, value_enum)]
    strategy: Option<StrategyArg>,

    /// Leave failed items out of the aggregate.
    #[arg(long, global = true)]
    drop_failures: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    Serialized,
    Locked,
    Structured,
}

impl From<StrategyArg> for MergeStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Serialized => MergeStrategy::Serialized,
            StrategyArg::Locked => MergeStrategy::Locked,
            StrategyArg::Structured => MergeStrategy::Structured,
        }
    }
}

impl ConfigOverrides {
    fn apply(&self, mut config: FanOutConfig) -> FanOutConfig {
        if let Some(max_concurrency) = self.max_concurrency {
            config.max_concurrency = max_concurrency;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.item_timeout_ms = Some(timeout_ms);
        }
        if let Some(strategy) = self.strategy {
            config.merge_strategy = strategy.into();
        }
        if self.drop_failures {
            config.failure_policy = FailurePolicy::Drop;
        }

        config
    }
}

/// User record as served by the users endpoint.
#[derive(Debug, Deserialize)]
struct User {
    id: u64,
    login: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(env!("CARGO_CRATE_NAME"))?;

    let cli = Cli::parse();
    let config = cli.overrides.apply(load_fan_out_config()?);
    config.validate().context("invalid fan-out configuration")?;

    match cli.command {
        Command::Users {
            ids,
            base_url,
            request_timeout_ms,
        } => {
            let fetcher: HttpFetcher<User> =
                HttpFetcher::new(&base_url, Duration::from_millis(request_timeout_ms))?;
            let fan_out = FanOut::new(config, fetcher);

            let result = fan_out.fetch_all(ids).await?;
            print_result(&result, |user| format!("{} (id {})", user.login, user.id));
        }
        Command::Simulate {
            items,
            fail_every,
            delay_ms,
        } => {
            let fetcher = simulated_fetcher(items, fail_every, delay_ms);
            let fan_out = FanOut::new(config, fetcher);

            let result = fan_out.fetch_all(0..items).await?;
            print_result(&result, |value| value.clone());
        }
    }

    Ok(())
}

/// Loads the configuration from `./configuration`, or the defaults when there is none.
fn load_fan_out_config() -> anyhow::Result<FanOutConfig> {
    match load_config::<FanOutConfig>() {
        Ok(config) => Ok(config),
        Err(LoadConfigError::MissingConfigurationDirectory(path)) => {
            warn!(path = %path.display(), "no configuration directory, using defaults");
            Ok(FanOutConfig::default())
        }
        Err(err) => Err(err).context("failed to load fan-out configuration"),
    }
}

fn simulated_fetcher(items: u32, fail_every: u32, delay_ms: u64) -> MemoryFetcher<u32, String> {
    let mut rng = rand::thread_rng();
    let mut fetcher = MemoryFetcher::new();

    for item in 0..items {
        fetcher = if fail_every > 0 && (item + 1) % fail_every == 0 {
            fetcher.with_failure(item, FetchError::UnexpectedStatus(503))
        } else {
            fetcher.with_success(item, format!("payload-{item}"))
        };

        let delay = Duration::from_millis(rng.gen_range(0..=delay_ms));
        fetcher = fetcher.with_delay(&item, delay);
    }

    fetcher
}

fn print_result<I, T, D>(result: &AggregateResult<I, T>, describe: D)
where
    I: Debug,
    D: Fn(&T) -> String,
{
    for entry in result.entries() {
        let line = match &entry.outcome {
            FetchOutcome::Success(value) => format!("ok        {}", describe(value)),
            FetchOutcome::Failure(err) => format!("failed    {err}"),
            FetchOutcome::Cancelled => "cancelled".to_owned(),
        };
        println!("[{:>4}] {:?}: {line}", entry.index, entry.item);
    }

    info!(
        requested = result.requested(),
        succeeded = result.count(OutcomeKind::Success),
        failed = result.count(OutcomeKind::Failure),
        dropped_failures = result.dropped_failures(),
        "batch finished"
    );
}
