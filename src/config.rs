use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub rpc: RpcConfig,
    pub explorer: ExplorerConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub factories: Vec<FactoryConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    #[serde(default)]
    pub prices: PricesConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default = "default_run_log_path")]
    pub run_log_path: String,
}

fn default_run_log_path() -> String {
    "poolflow-runs.log".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    pub url: String,
    #[serde(default = "default_rpc_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_rpc_chunk_size")]
    pub chunk_size: u64,
}

fn default_rpc_min_interval_ms() -> u64 {
    200
}

fn default_max_attempts() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_rpc_chunk_size() -> u64 {
    25
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExplorerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_explorer_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_explorer_chunk_size")]
    pub chunk_size: u64,
}

fn default_explorer_min_interval_ms() -> u64 {
    500
}

fn default_explorer_chunk_size() -> u64 {
    2_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_window_size")]
    pub window_size: u64,
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,
    #[serde(default = "default_max_concurrent_targets")]
    pub max_concurrent_targets: usize,
    #[serde(default = "default_quick_scan_window")]
    pub quick_scan_window: u64,
    #[serde(default = "default_quick_scan_top_n")]
    pub quick_scan_top_n: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            confirmation_depth: default_confirmation_depth(),
            checkpoint_interval: default_checkpoint_interval(),
            write_batch_size: default_write_batch_size(),
            max_concurrent_targets: default_max_concurrent_targets(),
            quick_scan_window: default_quick_scan_window(),
            quick_scan_top_n: default_quick_scan_top_n(),
        }
    }
}

fn default_window_size() -> u64 {
    500
}

fn default_confirmation_depth() -> u64 {
    16
}

fn default_checkpoint_interval() -> u64 {
    10
}

fn default_write_batch_size() -> usize {
    500
}

fn default_max_concurrent_targets() -> usize {
    6
}

fn default_quick_scan_window() -> u64 {
    10_000
}

fn default_quick_scan_top_n() -> usize {
    50
}

/// One tracked DEX deployment: the factory emitting PoolCreated and the
/// position manager emitting position Transfer events.
#[derive(Debug, Deserialize, Clone)]
pub struct FactoryConfig {
    pub name: String,
    pub factory: String,
    pub position_manager: String,
    pub genesis_block: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    pub symbol: String,
    pub address: String,
    pub decimals: u8,
    #[serde(default)]
    pub stable: bool,
    /// Identifier understood by the price oracle (e.g. a CoinGecko id).
    pub oracle_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricesConfig {
    #[serde(default = "default_oracle_url")]
    pub oracle_url: String,
    #[serde(default = "default_price_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_price_cache_cap")]
    pub cache_cap: usize,
    #[serde(default = "default_explorer_min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for PricesConfig {
    fn default() -> Self {
        Self {
            oracle_url: default_oracle_url(),
            ttl_secs: default_price_ttl_secs(),
            cache_cap: default_price_cache_cap(),
            min_interval_ms: default_explorer_min_interval_ms(),
        }
    }
}

fn default_oracle_url() -> String {
    "https://api.coingecko.com/api/v3".to_string()
}

fn default_price_ttl_secs() -> u64 {
    60
}

fn default_price_cache_cap() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_job_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_job_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_min_tvl_usd")]
    pub min_tvl_usd: f64,
    #[serde(default = "default_vesting_period_months")]
    pub vesting_period_months: f64,
    #[serde(default = "default_early_claim_penalty")]
    pub early_claim_penalty: f64,
    /// Base URL of the reward API; the position token id is appended.
    pub reward_api_url: Option<String>,
    /// Symbol of the token rewards are denominated in. Must be in the
    /// token registry for the vesting job to price it.
    pub reward_token: Option<String>,
    pub incentives_csv_path: Option<String>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            limit: default_job_limit(),
            offset: 0,
            concurrency: default_job_concurrency(),
            min_tvl_usd: default_min_tvl_usd(),
            vesting_period_months: default_vesting_period_months(),
            early_claim_penalty: default_early_claim_penalty(),
            reward_api_url: None,
            reward_token: None,
            incentives_csv_path: None,
        }
    }
}

fn default_job_limit() -> i64 {
    200
}

fn default_job_concurrency() -> usize {
    10
}

fn default_min_tvl_usd() -> f64 {
    1.0
}

fn default_vesting_period_months() -> f64 {
    12.0
}

fn default_early_claim_penalty() -> f64 {
    0.5
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.scan.window_size == 0 {
            return Err(eyre::eyre!("scan.window_size must be greater than zero"));
        }
        if self.factories.is_empty() {
            return Err(eyre::eyre!("At least one factory must be configured"));
        }
        for factory in &self.factories {
            for (label, address) in [
                ("factory", &factory.factory),
                ("position_manager", &factory.position_manager),
            ] {
                if !is_hex_address(address) {
                    return Err(eyre::eyre!(
                        "Invalid {} address '{}' for '{}'",
                        label,
                        address,
                        factory.name
                    ));
                }
            }
        }
        for token in &self.tokens {
            if !is_hex_address(&token.address) {
                return Err(eyre::eyre!(
                    "Invalid token address '{}' for {}",
                    token.address,
                    token.symbol
                ));
            }
        }
        Ok(())
    }
}

fn is_hex_address(s: &str) -> bool {
    s.starts_with("0x") && s.len() == 42 && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}
