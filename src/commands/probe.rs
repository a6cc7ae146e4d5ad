//! Probe command - drive the MEXC client through a circuit breaker

use anyhow::Result;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use trading_guard::common::BreakerRegistry;
use trading_guard::ingress::Rejection;
use trading_guard::mexc::MexcClient;
use trading_guard::Config;

pub fn run(config: &Config, symbol: String, attempts: u32, interval_ms: u64) -> Result<()> {
    info!(
        "Probing MEXC {} for {} ({} attempts, {}ms apart)",
        config.exchange.base_url, symbol, attempts, interval_ms
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let registry = BreakerRegistry::new(config.breaker_config());
        let client = MexcClient::new(config.exchange_config(), registry.get_or_create("mexc"))?;

        for attempt in 1..=attempts {
            if attempt > 1 {
                sleep(Duration::from_millis(interval_ms)).await;
            }

            match client.get_price(&symbol).await {
                Ok(ticker) => println!("  #{:<3} {} = {}", attempt, ticker.symbol, ticker.price),
                Err(e) => match e.circuit_open() {
                    Some(open) => {
                        let rejection = Rejection::from_circuit_open(open);
                        println!("  #{:<3} rejected ({}): {}", attempt, rejection.status, open);
                    }
                    None => {
                        warn!("MEXC call failed: {}", e);
                        println!("  #{:<3} failed: {}", attempt, e);
                    }
                },
            }
        }

        println!("\n{}", serde_json::to_string_pretty(&registry.statuses())?);
        Ok::<_, anyhow::Error>(())
    })
}
