//! Rate limit commands - consume, inspect and reset keys against the
//! configured store

use anyhow::Result;
use tracing::info;
use trading_guard::common::{RateLimiter, DEFAULT_CLASS};
use trading_guard::ingress::Rejection;
use trading_guard::Config;

/// Limiter for `class`, built over the configured store
async fn build_limiter(config: &Config, class: &str) -> Result<RateLimiter> {
    let store = config.build_store().await?;
    let limiters = config.limiters(store)?;
    let limiter = limiters.limiter(class).map_err(|e| {
        let known: Vec<_> = std::iter::once(DEFAULT_CLASS)
            .chain(limiters.classes())
            .collect();
        anyhow::anyhow!("{} (configured classes: {})", e, known.join(", "))
    })?;
    Ok(limiter.clone())
}

pub fn consume(
    config: &Config,
    class: String,
    key: String,
    route: Option<String>,
    cost: Option<u32>,
    times: u32,
) -> Result<()> {
    let cost = cost.unwrap_or_else(|| {
        route
            .as_deref()
            .map(|r| config.route_costs.cost_for(r))
            .unwrap_or(config.route_costs.default_cost)
    });
    info!("Consuming {} point(s) for '{}' in class '{}' x{}", cost, key, class, times);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let limiter = build_limiter(config, &class).await?;

        println!("\n{}", "=".repeat(60));
        println!(
            "RATE LIMIT [{}]: {} points / {}s ({} store)",
            class,
            limiter.points(),
            limiter.config().window_seconds,
            limiter.backend()
        );
        println!("{}\n", "=".repeat(60));

        let mut allowed = 0;
        for i in 1..=times {
            let result = limiter.consume(&key, cost).await?;
            if result.is_allowed() {
                allowed += 1;
                println!(
                    "  #{:<3} ALLOWED  remaining={:<4} resets in {}ms",
                    i, result.remaining_points, result.ms_before_next_window
                );
            } else {
                println!(
                    "  #{:<3} DENIED   remaining={:<4} retry in {}s{}",
                    i,
                    result.remaining_points,
                    result.retry_after_secs(),
                    if result.degraded { " (store unavailable)" } else { "" }
                );
                if let Some(rejection) = Rejection::from_quota(&result) {
                    for (name, value) in &rejection.headers {
                        println!("        {}: {}", name, value);
                    }
                }
            }
        }

        println!("\n  Allowed {}/{} requests", allowed, times);
        Ok::<_, anyhow::Error>(())
    })
}

pub fn status(config: &Config, class: String, key: String) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let limiter = build_limiter(config, &class).await?;
        match limiter.status(&key).await? {
            Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
            None => println!(
                "No active window for '{}' ({} of {} points available)",
                key,
                limiter.points(),
                limiter.points()
            ),
        }
        Ok::<_, anyhow::Error>(())
    })
}

pub fn reset(config: &Config, class: String, key: String) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let limiter = build_limiter(config, &class).await?;
        limiter.reset(&key).await?;
        println!("Reset rate limit window for '{}' in class '{}'", key, class);
        Ok::<_, anyhow::Error>(())
    })
}
