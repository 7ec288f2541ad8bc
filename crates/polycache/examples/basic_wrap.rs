//! Basic Function Wrapping Example
//!
//! Wraps an async lookup in a plain TTL cache and shows the
//! miss-then-hit flow through a detection sink.

use polycache::prelude::*;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let backend = Arc::new(MemoryBackend::with_defaults());
    let sink = Arc::new(MemorySink::new());

    let cache = SimpleCache::<String, _>::builder(
        backend,
        FnSignature::new("user_name").param("id"),
        "10m",
    )
    .prefix("users")
    .sink(sink.clone())
    .build()?;

    let fetch = wrap_fn(|args: CallArgs| async move {
        println!("  → computing for id={}", args.positionals().join(","));
        Ok(format!("user-{}", args.positionals().join(",")))
    });
    let cached = cache.wrap(fetch);

    println!("=== Basic Wrap Demo ===\n");

    let first = cached(CallArgs::new().positional(42)).await?;
    println!("first call:  {first}");

    let second = cached(CallArgs::new().positional(42)).await?;
    println!("second call: {second} (served from cache)\n");

    for event in sink.events() {
        println!(
            "✓ {} {} → {}",
            event.strategy,
            event.key,
            event.outcome.as_str()
        );
    }

    Ok(())
}
