pub mod apr;
pub mod attribution;
pub mod flows;
pub mod prices;
pub mod vesting;

use bigdecimal::{BigDecimal, ToPrimitive};

/// Pagination and fan-out bounds shared by every enrichment job.
#[derive(Debug, Clone, Copy)]
pub struct JobArgs {
    pub limit: i64,
    pub offset: i64,
    pub concurrency: usize,
}

impl JobArgs {
    pub fn new(limit: i64, offset: i64, concurrency: usize) -> Self {
        Self {
            limit: limit.max(1),
            offset: offset.max(0),
            concurrency: concurrency.clamp(1, 12),
        }
    }
}

/// Per-job outcome counters, logged at the end of each run.
#[derive(Debug, Default, Clone, Copy)]
pub struct JobStats {
    pub processed: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Raw on-chain integer amount → USD, given token decimals and a unit
/// price.
pub fn token_amount_usd(amount: &BigDecimal, decimals: u8, price_usd: f64) -> f64 {
    let raw = amount.to_f64().unwrap_or(0.0);
    raw / 10f64.powi(decimals as i32) * price_usd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_token_amount_usd() {
        let amount = BigDecimal::from_str("1500000").unwrap();
        let usd = token_amount_usd(&amount, 6, 1.0);
        assert!((usd - 1.5).abs() < 1e-9);

        let amount = BigDecimal::from_str("2000000000000000000").unwrap();
        let usd = token_amount_usd(&amount, 18, 3500.0);
        assert!((usd - 7000.0).abs() < 1e-6);
    }

    #[test]
    fn test_job_args_clamped() {
        let args = JobArgs::new(0, -5, 50);
        assert_eq!(args.limit, 1);
        assert_eq!(args.offset, 0);
        assert_eq!(args.concurrency, 12);

        let args = JobArgs::new(100, 10, 0);
        assert_eq!(args.concurrency, 1);
    }
}
