//! Concurrent fetches with a per-request timeout and success/failure tallies.
//!
//! Run with: cargo run --example concurrent_fetch

use std::time::Duration;

use pipewright::prelude::*;

const URLS: &[&str] = &[
    "https://httpbin.org/anything/hi",
    "https://httpbin.org/anything/hello",
    "https://httpbin.org/anything/page",
    "https://httpbin.org/anything/example",
    "https://httpbin.org/anything/birthday",
    "https://httpbin.org/anything/greeter",
];

const REQUEST_TIMEOUT: Duration = Duration::from_millis(150);

/// Stands in for an HTTP GET. Latency grows with the path length, and one
/// path always answers with an error.
async fn http_get(ctx: &Context, url: &'static str) -> Result<String> {
    let path = url.rsplit('/').next().unwrap_or_default();
    let latency = Duration::from_millis(20 * path.len() as u64);

    ctx.with_timeout(REQUEST_TIMEOUT)
        .run(tokio::time::sleep(latency))
        .await?;
    if path == "page" {
        return Err(Error::custom(format!("{url}: 503 service unavailable")));
    }
    Ok(format!("{{\"url\": \"{url}\"}}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let result = Pipeline::source(iter_source(URLS.iter().copied()), StageConfig::new("urls"))
        .stage(
            map_fn(|ctx: Context, url: &'static str| async move {
                let body = http_get(&ctx, url).await?;
                Ok::<_, Error>((url, body))
            }),
            StageConfig::new("fetch").workers(URLS.len()),
        )
        .sink(
            sink_fn(|_ctx, (url, body): (&'static str, String)| async move {
                println!("SUCCESS: {url} with data: {body}");
                Ok(())
            }),
            StageConfig::new("print"),
        )
        .run(&Context::background())
        .await;

    for error in &result.errors {
        let kind = if error.is_deadline_exceeded() { "TIMED OUT" } else { "FAILED" };
        println!("{kind}: {error}");
    }
    println!("total url: {}", URLS.len());
    println!("total success: {}", result.items_processed);
    println!("total failure: {}", result.failed_items);
    println!("execution: {:?}", result.elapsed);
    Ok(())
}
