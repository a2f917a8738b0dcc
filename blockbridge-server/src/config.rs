use std::time::Duration;

use anyhow::{bail, Result};
use blockbridge_core::Config;

use crate::auth::AuthConfig;
use crate::cli::ServeArgs;
use crate::ratelimit::RateLimitConfig;

/// Runtime configuration derived from `blockbridge.yml` plus CLI/env.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub listen_addr: String,
    pub api_key: String,
    pub webhook_secret: Option<String>,
    pub sweep_interval: Duration,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub core: Config,
}

impl ServeConfig {
    pub fn from_args(args: &ServeArgs, core: Config) -> Result<Self> {
        let Some(api_key) = args.notion_api_key.clone().filter(|k| !k.is_empty()) else {
            bail!("NOTION_API_KEY is not set; pass --notion-api-key or export it");
        };
        if args.sweep_secs == 0 {
            bail!("--sweep-secs must be at least 1");
        }

        let auth = AuthConfig {
            secret: args.api_secret.clone(),
            expected_aud: args.auth_audience.clone(),
            require_auth: args.require_auth,
        };

        let rate_limit = RateLimitConfig {
            burst: args.rate_burst,
            refill_rate: args.rate_per_sec,
            enabled: args.rate_limit,
        };

        Ok(Self {
            listen_addr: args
                .listen_addr
                .clone()
                .unwrap_or_else(|| core.server.listen_addr.clone()),
            api_key,
            webhook_secret: args.webhook_secret.clone().filter(|s| !s.is_empty()),
            sweep_interval: Duration::from_secs(args.sweep_secs),
            auth,
            rate_limit,
            core,
        })
    }
}
