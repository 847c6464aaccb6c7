use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use change_sync::{Binding, ChannelSpec, SyncConfig};
use clap::Parser;
use url::Url;

use crate::realtime::RealtimeConfig;

#[derive(Debug, Parser)]
#[command(
    name = "shipwatch",
    author,
    version,
    about = "Live shipment worklist fed by Postgres change events"
)]
pub struct Cli {
    /// Project base URL; the realtime endpoint defaults to `<url>/realtime/v1`.
    #[arg(long, env = "SHIPWATCH_SUPABASE_URL")]
    pub supabase_url: String,

    /// Explicit realtime endpoint, overriding the one derived from the project URL.
    #[arg(long, env = "SHIPWATCH_REALTIME_URL")]
    pub realtime_url: Option<String>,

    /// Public API key sent with the socket and snapshot requests.
    #[arg(long, env = "SHIPWATCH_API_KEY")]
    pub api_key: String,

    /// User access token forwarded in the channel join.
    #[arg(long, env = "SHIPWATCH_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    /// Worklist snapshot endpoint.
    #[arg(
        long,
        env = "SHIPWATCH_SNAPSHOT_URL",
        default_value = "http://127.0.0.1:3000/api/worklist"
    )]
    pub snapshot_url: String,

    #[arg(long, env = "SHIPWATCH_CHANNEL", default_value = "kpi:shipments")]
    pub channel: String,

    /// `namespace.table[:event[:filter]]`; repeat for several bindings.
    #[arg(long = "binding", default_values_t = vec!["public.shipments:*".to_string()])]
    pub bindings: Vec<String>,

    /// Use the constrained-client debounce window.
    #[arg(long, default_value_t = false)]
    pub constrained: bool,

    #[arg(long)]
    pub debounce_ms: Option<u64>,

    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    #[arg(long)]
    pub initial_retry_ms: Option<u64>,

    #[arg(long)]
    pub max_retry_ms: Option<u64>,

    /// Release the realtime channel while hidden.
    #[arg(long, default_value_t = false)]
    pub release_when_hidden: bool,

    #[arg(long, env = "SHIPWATCH_LOG", default_value = "info")]
    pub log_filter: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub sync: SyncConfig,
    pub realtime: RealtimeConfig,
    pub snapshot_url: Url,
    pub api_key: String,
    pub channel: ChannelSpec,
    pub log_filter: String,
}

impl TryFrom<Cli> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let mut sync = if cli.constrained {
            SyncConfig {
                debounce: SyncConfig::constrained().debounce,
                ..SyncConfig::from_env()
            }
        } else {
            SyncConfig::from_env()
        };
        let millis = Duration::from_millis;
        if let Some(ms) = cli.debounce_ms {
            sync.debounce = millis(ms);
        }
        if let Some(ms) = cli.poll_interval_ms {
            sync.poll_interval = millis(ms);
        }
        if let Some(ms) = cli.initial_retry_ms {
            sync.initial_retry_delay = millis(ms);
        }
        if let Some(ms) = cli.max_retry_ms {
            sync.max_retry_delay = millis(ms);
        }
        sync.release_channel_when_hidden |= cli.release_when_hidden;

        let endpoint = match &cli.realtime_url {
            Some(raw) => {
                Url::parse(raw).with_context(|| format!("invalid realtime url: {raw}"))?
            }
            None => {
                let base = Url::parse(&cli.supabase_url)
                    .with_context(|| format!("invalid project url: {}", cli.supabase_url))?;
                let path = format!("{}/realtime/v1", base.path().trim_end_matches('/'));
                let mut endpoint = base;
                endpoint.set_path(&path);
                endpoint
            }
        };
        let snapshot_url = Url::parse(&cli.snapshot_url)
            .with_context(|| format!("invalid snapshot url: {}", cli.snapshot_url))?;

        if cli.bindings.is_empty() {
            return Err(anyhow!("at least one --binding is required"));
        }
        let bindings = cli
            .bindings
            .iter()
            .map(|raw| raw.parse::<Binding>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AppConfig {
            sync: sync.normalized(),
            realtime: RealtimeConfig::new(endpoint, cli.api_key.clone())
                .with_access_token(cli.access_token),
            snapshot_url,
            api_key: cli.api_key,
            channel: ChannelSpec::new(cli.channel, bindings),
            log_filter: cli.log_filter,
        })
    }
}
