/// Realm reported in WWW-Authenticate challenges on 401 responses
pub const AUTH_REALM: &str = "CCGate API";

/// Path prefix that is stripped before forwarding to an upstream
pub const ANTHROPIC_PREFIX: &str = "/anthropic";

/// Anthropic messages endpoint on the upstream (used by the OpenAI front-end)
pub const MESSAGES_PATH: &str = "/v1/messages";

/// Interval between health-probe rounds
pub const HEALTH_PROBE_INTERVAL_SECS: u64 = 30;

/// Default per-upstream health-check path
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Default per-probe timeout in seconds
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 5;

/// Default upstream request timeout in seconds (server.proxy.timeout)
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 300;

/// Default max_tokens injected into translated OpenAI requests
pub const DEFAULT_OPENAI_MAX_TOKENS: u32 = 4096;

/// Stable User-Agent sent upstream by the OpenAI front-end
/// (browser-identifying headers are scrubbed before forwarding)
pub const OPENAI_FORWARD_USER_AGENT: &str =
    concat!("ccgate-openai-compat/", env!("CARGO_PKG_VERSION"));

/// Root directory of the per-tenant usage tree
pub const USAGE_DATA_DIR: &str = "data/usage";

/// Cap on buffered request bodies (16 MiB)
pub const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;
