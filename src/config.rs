use std::path::PathBuf;
use std::time::Duration;

/// Service configuration, constructed once from the environment and threaded
/// through every component as an explicit dependency. Credentials and the
/// token cache live on the instances built from it, never in process-wide
/// keyed maps.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,

    /// OAuth2 password-grant endpoint of the credit provider.
    pub provider_auth_url: String,
    /// Base URL of the credit provider API.
    pub provider_api_url: String,
    pub provider_username: String,
    pub provider_password: String,
    pub provider_client_id: String,
    pub provider_audience: String,

    /// Base URL of the CRM integration API.
    pub crm_api_url: String,
    /// Static CRM API key (the CRM does not use the token flow).
    pub crm_api_key: String,
    pub crm_queue_id: i64,
    /// Pipelines scanned when looking an opportunity up by CPF; placement is
    /// not guaranteed to a single pipeline.
    pub crm_lookup_pipelines: Vec<i64>,
    /// Pipeline and stage an approved outcome is written back to.
    pub crm_approved_pipeline: i64,
    pub crm_approved_stage: i64,

    /// Flat JSON file backing the approved-offer cache.
    pub cache_file: PathBuf,

    /// Interval between term status polls.
    pub poll_interval: Duration,
    /// Overall budget of one poll loop.
    pub poll_timeout: Duration,
    /// Hard budget for a single status call; hitting it aborts the poll early.
    pub status_call_timeout: Duration,
    /// Request-level guard on the flow endpoint, independent of the poll
    /// budget.
    pub request_timeout: Duration,
    /// Settle time after authorizing an existing term before re-reading it.
    pub authorize_settle_delay: Duration,
    /// Settle time before verifying a CRM stage change took effect.
    pub crm_verify_delay: Duration,

    /// Concurrent flow cap for batch runs.
    pub batch_fan_out: usize,
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .map_err(|_| anyhow::anyhow!("{} environment variable required", name))
        .and_then(|value| {
            if value.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            Ok(value)
        })
}

fn required_url(name: &str) -> anyhow::Result<String> {
    required(name).and_then(|url| {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("{} must start with http:// or https://", name);
        }
        Ok(url)
    })
}

fn duration_ms(name: &str, default_ms: u64) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| anyhow::anyhow!("{} must be a duration in milliseconds", name)),
        Err(_) => Ok(Duration::from_millis(default_ms)),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            provider_auth_url: required_url("PROVIDER_AUTH_URL")?,
            provider_api_url: required_url("PROVIDER_API_URL")?,
            provider_username: required("PROVIDER_USERNAME")?,
            provider_password: required("PROVIDER_PASSWORD")?,
            provider_client_id: required("PROVIDER_CLIENT_ID")?,
            provider_audience: required("PROVIDER_AUDIENCE")?,
            crm_api_url: required_url("CRM_API_URL")?,
            crm_api_key: required("CRM_API_KEY")?,
            crm_queue_id: std::env::var("CRM_QUEUE_ID")
                .unwrap_or_else(|_| "25".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CRM_QUEUE_ID must be an integer"))?,
            crm_lookup_pipelines: std::env::var("CRM_LOOKUP_PIPELINES")
                .unwrap_or_else(|_| "1,3,4".to_string())
                .split(',')
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| anyhow::anyhow!("CRM_LOOKUP_PIPELINES must be integers"))
                })
                .collect::<anyhow::Result<Vec<i64>>>()?,
            crm_approved_pipeline: std::env::var("CRM_APPROVED_PIPELINE")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CRM_APPROVED_PIPELINE must be an integer"))?,
            crm_approved_stage: std::env::var("CRM_APPROVED_STAGE")
                .unwrap_or_else(|_| "21".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CRM_APPROVED_STAGE must be an integer"))?,
            cache_file: std::env::var("CACHE_FILE")
                .unwrap_or_else(|_| "data/approved-offers.json".to_string())
                .into(),
            poll_interval: duration_ms("POLL_INTERVAL_MS", 10_000)?,
            poll_timeout: duration_ms("POLL_TIMEOUT_MS", 300_000)?,
            status_call_timeout: duration_ms("STATUS_CALL_TIMEOUT_MS", 30_000)?,
            request_timeout: duration_ms("REQUEST_TIMEOUT_MS", 300_000)?,
            authorize_settle_delay: duration_ms("AUTHORIZE_SETTLE_DELAY_MS", 3_000)?,
            crm_verify_delay: duration_ms("CRM_VERIFY_DELAY_MS", 2_000)?,
            batch_fan_out: std::env::var("BATCH_FAN_OUT")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("BATCH_FAN_OUT must be a positive integer"))?,
        };

        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Provider API URL: {}", config.provider_api_url);
        tracing::debug!("CRM API URL: {}", config.crm_api_url);
        tracing::debug!("Cache file: {}", config.cache_file.display());
        tracing::debug!("Server port: {}", config.port);

        Ok(config)
    }
}
