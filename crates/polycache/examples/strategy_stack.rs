//! Strategy Stack Example
//!
//! Composes a rate limiter, a circuit breaker, and a cache around one
//! function. The first strategy in the stack is outermost, so requests
//! are rate-checked before the breaker and the cache ever see them.

use polycache::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let backend = Arc::new(MemoryBackend::with_defaults());
    let signature = FnSignature::new("report").param("region");

    let strategies: Vec<Arc<dyn Strategy<String>>> = vec![
        Arc::new(
            RateLimiter::builder(backend.clone(), signature.clone(), 3, Duration::from_secs(2))
                .build()?,
        ),
        Arc::new(
            CircuitBreaker::builder(backend.clone(), signature.clone())
                .threshold(5)
                .cooldown(Duration::from_secs(10))
                .build()?,
        ),
        Arc::new(SimpleCache::<String, _>::builder(backend, signature, "5m").build()?),
    ];

    let compute = wrap_fn(|args: CallArgs| async move {
        println!("  → building report for {}", args.positionals().join(","));
        Ok("42 widgets sold".to_string())
    });
    let guarded = stack(&strategies, compute);

    println!("=== Strategy Stack Demo ===\n");
    println!("Limit is 3 calls per 2s; the cache absorbs repeats.\n");

    for attempt in 1..=5 {
        match guarded(CallArgs::new().positional("emea")).await {
            Ok(report) => println!("✓ attempt {attempt}: {report}"),
            Err(err) if err.is_rejection() => {
                println!("✗ attempt {attempt}: rejected ({err})");
            }
            Err(err) => return Err(err),
        }
    }

    println!("\n⏳ Waiting for the rate window to roll over...\n");
    tokio::time::sleep(Duration::from_millis(2100)).await;

    let report = guarded(CallArgs::new().positional("emea")).await?;
    println!("✓ after the window: {report} (served from cache, no recompute)");

    Ok(())
}
