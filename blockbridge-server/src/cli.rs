use clap::{ArgAction, Args};

/// Flags for `blockbridge serve`. Secrets come from the environment so they
/// never have to live in `blockbridge.yml`.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Listen address for the HTTP endpoints (overrides `server.listen_addr`)
    #[arg(long, env = "BLOCKBRIDGE_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Integration token used for remote API calls
    #[arg(long, env = "NOTION_API_KEY", hide_env_values = true)]
    pub notion_api_key: Option<String>,

    /// Shared secret for `X-Notion-Signature` verification.
    /// Without it, webhook signatures are not checked.
    #[arg(long, env = "NOTION_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// How often the consumer sweeps the queue even without webhook traffic
    #[arg(long, env = "BLOCKBRIDGE_SWEEP_SECS", default_value_t = 30)]
    pub sweep_secs: u64,

    // ─────────────────────────────────────────────────────────────────────────
    // Auth options
    // ─────────────────────────────────────────────────────────────────────────

    /// Secret for verifying API bearer tokens (HS256).
    #[arg(long, env = "BLOCKBRIDGE_API_SECRET", hide_env_values = true)]
    pub api_secret: Option<String>,

    /// Reject trigger requests that carry no token.
    #[arg(long, env = "BLOCKBRIDGE_REQUIRE_AUTH", default_value_t = false, action = ArgAction::Set)]
    pub require_auth: bool,

    /// Expected JWT audience claim (optional).
    #[arg(long, env = "BLOCKBRIDGE_AUTH_AUDIENCE")]
    pub auth_audience: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate limiting options
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable rate limiting for sync triggers.
    #[arg(long, env = "BLOCKBRIDGE_RATE_LIMIT", default_value_t = true, action = ArgAction::Set)]
    pub rate_limit: bool,

    /// Maximum burst size for rate limiting.
    #[arg(long, env = "BLOCKBRIDGE_RATE_BURST", default_value_t = 10)]
    pub rate_burst: u32,

    /// Sustained requests per second for rate limiting.
    #[arg(long, env = "BLOCKBRIDGE_RATE_PER_SEC", default_value_t = 1.0)]
    pub rate_per_sec: f64,
}
