//! Task groups: serial vs concurrent timing, then deadline-bound tasks whose
//! failures are collected without blocking any task.
//!
//! Run with: cargo run --example task_timeout

use std::time::{Duration, Instant};

use pipewright::prelude::*;

async fn greet(ctx: &Context, name: &str) -> Result<()> {
    println!("Hi: {name}");
    ctx.run(tokio::time::sleep(Duration::from_millis(300))).await
}

/// Six calls to a slow service; the whole job needs about 600ms
async fn long_running_task(ctx: Context, job: &'static str) -> Result<()> {
    println!("starting: {job}");
    for service in 1..=6 {
        ctx.run(tokio::time::sleep(Duration::from_millis(100))).await?;
        println!("{job}: service-{service} done");
    }
    println!("finished: {job}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let ctx = Context::background();
    let names = ["Alex", "Kosim", "John", "Diana"];

    let serial = Instant::now();
    for name in names {
        greet(&ctx, name).await?;
    }
    println!("Serial execution: {:?}\n", serial.elapsed());

    let concurrent = Instant::now();
    let mut group = TaskGroup::new(&ctx);
    for name in names {
        group.spawn(move |ctx| async move { greet(&ctx, name).await });
    }
    group.wait_result().await?;
    println!("Concurrent execution: {:?}\n", concurrent.elapsed());

    let start = Instant::now();
    let mut group = TaskGroup::new(&ctx).with_task_timeout(Duration::from_millis(400));
    group.spawn(|ctx| long_running_task(ctx, "job-1"));
    group.spawn_with_timeout(|ctx| long_running_task(ctx, "job-2"), Duration::from_secs(1));

    for error in group.wait().await {
        let kind = if error.is_deadline_exceeded() { "timed out" } else { "failed" };
        println!("{kind}: {error}");
    }
    println!("execution: {:?}", start.elapsed());
    Ok(())
}
