//! Soft Expiration Example
//!
//! Demonstrates the two lives of a soft-cached value: within the soft
//! window calls are served from cache; past it the function recomputes,
//! and if the recomputation fails the stale value covers for it.

use polycache::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug)]
struct UpstreamDown;

impl std::fmt::Display for UpstreamDown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("upstream is down")
    }
}

impl std::error::Error for UpstreamDown {}

#[tokio::main]
async fn main() -> Result<()> {
    let backend = Arc::new(MemoryBackend::with_defaults());
    let cache = SoftCache::<String, _>::builder(
        backend,
        FnSignature::new("quote").param("symbol"),
        "30s",
    )
    .soft_ttl(Duration::from_secs(1))
    .build()?;

    let upstream_down = Arc::new(AtomicBool::new(false));
    let fetch = {
        let upstream_down = upstream_down.clone();
        wrap_fn(move |args: CallArgs| {
            let upstream_down = upstream_down.clone();
            async move {
                if upstream_down.load(Ordering::SeqCst) {
                    return Err(CacheError::computation(UpstreamDown));
                }
                println!("  → fetching {} from upstream", args.positionals().join(","));
                Ok("142.50".to_string())
            }
        })
    };
    let cached = cache.wrap(fetch);

    println!("=== Soft Expiration Demo ===\n");

    let quote = cached(CallArgs::new().positional("ACME")).await?;
    println!("T+0s: computed {quote}");

    let quote = cached(CallArgs::new().positional("ACME")).await?;
    println!("T+0s: soft hit {quote} (within the 1s window)");

    println!("\n⏳ Waiting for the soft window to pass...\n");
    tokio::time::sleep(Duration::from_millis(1200)).await;
    upstream_down.store(true, Ordering::SeqCst);

    // The recompute fails, but the entry is still physically live.
    let quote = cached(CallArgs::new().positional("ACME")).await?;
    println!("T+1.2s: upstream down, served stale {quote}");

    Ok(())
}
