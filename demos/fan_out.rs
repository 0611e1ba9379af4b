//! Fan-out: a bounded pool of consumers competing for jobs from one stream.
//!
//! Run with: cargo run --example fan_out

use std::time::{Duration, Instant};

use pipewright::prelude::*;

const WORKERS: usize = 5;

const EMAILS: &[&str] = &[
    "jason.miller93@example.com",
    "emily.sanders42@example.org",
    "kevin.torres87@example.net",
    "sophia.wilson18@example.com",
    "liam.johnson55@example.org",
    "olivia.brown23@example.net",
    "ethan.martinez67@example.com",
    "ava.garcia12@example.org",
    "noah.anderson99@example.net",
    "isabella.thomas31@example.com",
    "mason.jackson73@example.org",
    "mia.white88@example.net",
    "logan.harris04@example.com",
    "amelia.martin29@example.org",
    "lucas.thompson16@example.net",
];

/// Stands in for a remote call per email
async fn notify(ctx: &Context, email: &str) -> Result<()> {
    ctx.run(tokio::time::sleep(Duration::from_millis(20 * (email.len() as u64 % 5 + 1))))
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let start = Instant::now();
    let ctx = Context::background();
    let (jobs, stream) = channel(0);

    let consumers = Dispatcher::new("notify", WORKERS).run(&ctx, stream, {
        let ctx = ctx.clone();
        move |delivery: Delivery<&'static str>| {
            let ctx = ctx.clone();
            async move {
                println!("worker: {} processing {}", delivery.worker, delivery.item);
                if notify(&ctx, delivery.item).await.is_ok() {
                    println!("{} processed successfully", delivery.item);
                }
                Flow::Continue
            }
        }
    });

    for email in EMAILS {
        jobs.send(&ctx, *email).await?;
    }
    jobs.close()?;

    let report = consumers.join().await;
    println!("\n{} jobs handled, execution: {:?}", report.handled, start.elapsed());
    Ok(())
}
