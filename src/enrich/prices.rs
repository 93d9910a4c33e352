use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use alloy::primitives::Address;
use sqlx::PgPool;
use tokio::time::Instant;

use crate::client::{RateLimitedClient, DEFAULT_RETRYABLE_STATUSES};
use crate::config::{PricesConfig, TokenConfig};

/// Where a price came from. PoolRatio is an estimate from stored swap
/// state and must never be treated as authoritative downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Oracle,
    StableHeuristic,
    PoolRatio,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Oracle => "oracle",
            PriceSource::StableHeuristic => "stable_heuristic",
            PriceSource::PoolRatio => "pool_ratio",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PricePoint {
    pub price_usd: f64,
    pub source: PriceSource,
    fetched_at: Instant,
}

/// A token the pipeline knows how to value.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
    pub stable: bool,
    pub oracle_id: Option<String>,
}

/// USD price lookups with a capped TTL cache. Miss resolution order:
/// primary oracle, stablecoin heuristic, pool-ratio estimate. A token
/// that falls through every tier is an error, never a silent zero.
pub struct PriceService {
    client: RateLimitedClient,
    oracle_url: String,
    ttl: Duration,
    cache_cap: usize,
    by_address: HashMap<Address, TokenInfo>,
    by_symbol: HashMap<String, Address>,
    cache: Mutex<HashMap<Address, PricePoint>>,
}

impl PriceService {
    pub fn new(
        config: &PricesConfig,
        tokens: &[TokenConfig],
    ) -> eyre::Result<Self> {
        let client = RateLimitedClient::new(
            Duration::from_millis(config.min_interval_ms),
            3,
            Duration::from_secs(30),
        )?;

        let mut by_address = HashMap::new();
        let mut by_symbol = HashMap::new();
        for token in tokens {
            let address = Address::from_str(&token.address)
                .map_err(|e| eyre::eyre!("Bad token address '{}': {}", token.address, e))?;
            by_symbol.insert(token.symbol.to_uppercase(), address);
            by_address.insert(
                address,
                TokenInfo {
                    symbol: token.symbol.clone(),
                    address,
                    decimals: token.decimals,
                    stable: token.stable,
                    oracle_id: token.oracle_id.clone(),
                },
            );
        }

        Ok(Self {
            client,
            oracle_url: config.oracle_url.trim_end_matches('/').to_string(),
            ttl: Duration::from_secs(config.ttl_secs),
            cache_cap: config.cache_cap.max(1),
            by_address,
            by_symbol,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn token(&self, address: &Address) -> Option<&TokenInfo> {
        self.by_address.get(address)
    }

    pub fn token_by_symbol(&self, symbol: &str) -> Option<&TokenInfo> {
        self.by_symbol
            .get(&symbol.to_uppercase())
            .and_then(|address| self.by_address.get(address))
    }

    /// Resolve a USD price for a registered token, walking the fallback
    /// tiers on a cache miss.
    pub async fn price_usd(&self, db: &PgPool, address: Address) -> eyre::Result<PricePoint> {
        let token = self
            .by_address
            .get(&address)
            .ok_or_else(|| eyre::eyre!("Token {} is not in the registry", address))?;

        if let Some(cached) = self.cache_get(&address) {
            return Ok(cached);
        }

        // Tier 1: primary oracle.
        match self.oracle_price(token).await {
            Ok(Some(price)) => return Ok(self.cache_put(address, price, PriceSource::Oracle)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    token = %token.symbol,
                    error = %e,
                    "Oracle price lookup failed, falling back"
                );
            }
        }

        // Tier 2: recognized stables are pinned to $1.00.
        if token.stable {
            return Ok(self.cache_put(address, 1.0, PriceSource::StableHeuristic));
        }

        // Tier 3: estimate from the latest stored swap against a
        // stable-quoted pool.
        if let Some(price) = self.pool_ratio_price(db, token).await? {
            tracing::warn!(
                token = %token.symbol,
                price,
                "Using low-confidence pool-ratio price estimate"
            );
            return Ok(self.cache_put(address, price, PriceSource::PoolRatio));
        }

        Err(eyre::eyre!(
            "No price available for {} ({})",
            token.symbol,
            address
        ))
    }

    async fn oracle_price(&self, token: &TokenInfo) -> eyre::Result<Option<f64>> {
        let Some(oracle_id) = &token.oracle_id else {
            return Ok(None);
        };

        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd",
            self.oracle_url, oracle_id
        );
        let description = format!("oracle price {}", oracle_id);
        let response = self
            .client
            .execute(
                move |http| http.get(&url).header("Accept", "application/json"),
                &description,
                DEFAULT_RETRYABLE_STATUSES,
            )
            .await?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| eyre::eyre!("Oracle returned malformed JSON: {}", e))?;

        Ok(body
            .get(oracle_id)
            .and_then(|entry| entry.get("usd"))
            .and_then(|price| price.as_f64())
            .filter(|price| *price > 0.0))
    }

    async fn pool_ratio_price(
        &self,
        db: &PgPool,
        token: &TokenInfo,
    ) -> eyre::Result<Option<f64>> {
        let rows: Vec<(Vec<u8>, Vec<u8>, String)> = sqlx::query_as(
            "SELECT p.token0, p.token1, e.sqrt_price_x96::TEXT
             FROM pool_events e
             JOIN pools p ON p.address = e.pool
             WHERE e.event_type = 'swap'
               AND e.sqrt_price_x96 IS NOT NULL
               AND (p.token0 = $1 OR p.token1 = $1)
             ORDER BY e.block_number DESC, e.log_index DESC
             LIMIT 10",
        )
        .bind(token.address.as_slice())
        .fetch_all(db)
        .await?;

        for (token0, token1, sqrt_price) in rows {
            let is_token0 = token0 == token.address.as_slice();
            let other = if is_token0 { &token1 } else { &token0 };
            let Ok(other_address) = Address::try_from(other.as_slice()) else {
                continue;
            };
            let Some(other_info) = self.by_address.get(&other_address) else {
                continue;
            };
            if !other_info.stable {
                continue;
            }

            let Ok(sqrt_price) = sqrt_price.parse::<f64>() else {
                continue;
            };
            let (decimals0, decimals1) = if is_token0 {
                (token.decimals, other_info.decimals)
            } else {
                (other_info.decimals, token.decimals)
            };
            let price_1_per_0 = sqrt_price_x96_to_price(sqrt_price, decimals0, decimals1);
            if price_1_per_0 <= 0.0 || !price_1_per_0.is_finite() {
                continue;
            }

            let price = if is_token0 {
                price_1_per_0
            } else {
                1.0 / price_1_per_0
            };
            return Ok(Some(price));
        }

        Ok(None)
    }

    fn cache_get(&self, address: &Address) -> Option<PricePoint> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let point = cache.get(address)?;
        if point.fetched_at.elapsed() < self.ttl {
            Some(point.clone())
        } else {
            None
        }
    }

    fn cache_put(&self, address: Address, price_usd: f64, source: PriceSource) -> PricePoint {
        let point = PricePoint {
            price_usd,
            source,
            fetched_at: Instant::now(),
        };
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());

        if cache.len() >= self.cache_cap && !cache.contains_key(&address) {
            // Evict expired entries first, then the stalest.
            let ttl = self.ttl;
            cache.retain(|_, p| p.fetched_at.elapsed() < ttl);
            if cache.len() >= self.cache_cap {
                if let Some(oldest) = cache
                    .iter()
                    .min_by_key(|(_, p)| p.fetched_at)
                    .map(|(k, _)| *k)
                {
                    cache.remove(&oldest);
                }
            }
        }

        cache.insert(address, point.clone());
        point
    }
}

/// Uniswap-style sqrtPriceX96 → token1-per-token0 price, adjusted for
/// decimals. Good enough for a flagged estimate; not for accounting.
pub fn sqrt_price_x96_to_price(sqrt_price_x96: f64, decimals0: u8, decimals1: u8) -> f64 {
    let q96 = 2f64.powi(96);
    let ratio = (sqrt_price_x96 / q96).powi(2);
    ratio * 10f64.powi(decimals0 as i32 - decimals1 as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(tokens: Vec<TokenConfig>) -> PriceService {
        let config = PricesConfig {
            oracle_url: "https://oracle.invalid".to_string(),
            ttl_secs: 60,
            cache_cap: 2,
            min_interval_ms: 1,
        };
        PriceService::new(&config, &tokens).unwrap()
    }

    fn token(symbol: &str, address_byte: u8, stable: bool) -> TokenConfig {
        TokenConfig {
            symbol: symbol.to_string(),
            address: format!("0x{}", hex::encode([address_byte; 20])),
            decimals: 6,
            stable,
            oracle_id: None,
        }
    }

    #[test]
    fn test_sqrt_price_identity() {
        let q96 = 2f64.powi(96);
        let price = sqrt_price_x96_to_price(q96, 18, 18);
        assert!((price - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_sqrt_price_decimal_adjustment() {
        // Equal raw ratio, but token0 has 12 more decimals: one whole
        // token0 is worth 10^12 more raw token1 units.
        let q96 = 2f64.powi(96);
        let price = sqrt_price_x96_to_price(q96, 18, 6);
        assert!((price - 1e12).abs() / 1e12 < 1e-9);
    }

    #[test]
    fn test_symbol_lookup_is_case_insensitive() {
        let service = service(vec![token("USDC", 0x01, true)]);
        assert!(service.token_by_symbol("usdc").is_some());
        assert!(service.token_by_symbol("USDC").is_some());
        assert!(service.token_by_symbol("WETH").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_until_ttl_expires() {
        let service = service(vec![token("USDC", 0x01, true)]);
        let address = Address::repeat_byte(0x01);

        service.cache_put(address, 1.0, PriceSource::StableHeuristic);
        assert!(service.cache_get(&address).is_some());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(service.cache_get(&address).is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(service.cache_get(&address).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_cap_evicts_stalest() {
        let service = service(vec![
            token("A", 0x01, true),
            token("B", 0x02, true),
            token("C", 0x03, true),
        ]);

        service.cache_put(Address::repeat_byte(0x01), 1.0, PriceSource::Oracle);
        tokio::time::advance(Duration::from_secs(1)).await;
        service.cache_put(Address::repeat_byte(0x02), 2.0, PriceSource::Oracle);
        tokio::time::advance(Duration::from_secs(1)).await;

        // Cap is 2: inserting a third evicts the stalest (A).
        service.cache_put(Address::repeat_byte(0x03), 3.0, PriceSource::Oracle);
        assert!(service.cache_get(&Address::repeat_byte(0x01)).is_none());
        assert!(service.cache_get(&Address::repeat_byte(0x02)).is_some());
        assert!(service.cache_get(&Address::repeat_byte(0x03)).is_some());
    }

    #[test]
    fn test_price_source_tags() {
        assert_eq!(PriceSource::Oracle.as_str(), "oracle");
        assert_eq!(PriceSource::StableHeuristic.as_str(), "stable_heuristic");
        assert_eq!(PriceSource::PoolRatio.as_str(), "pool_ratio");
    }
}
