//! Worker pool: buffered jobs, three workers, a result stream.
//!
//! Run with: cargo run --example worker_pool

use std::time::Duration;

use pipewright::prelude::*;

const WORDS: &[&str] = &[
    "testing",
    "goal",
    "journey",
    "acceptance",
    "anger",
    "flexible",
    "terror",
    "max",
];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Capacity equals the job count, so publishing never waits on the workers.
    let jobs = WORDS.len();
    let results = CollectSink::new();

    let result = Pipeline::source(iter_source(WORDS.iter().copied()), StageConfig::new("jobs").buffer_capacity(jobs))
        .stage(
            processor_fn(|ctx: Context, word: &'static str| async move {
                println!("processing to convert: {word}");
                ctx.run(tokio::time::sleep(Duration::from_millis(250))).await?;
                Ok::<_, Error>(Some(word.to_uppercase()))
            }),
            StageConfig::new("upper").workers(3).buffer_capacity(jobs),
        )
        .sink(results.clone(), StageConfig::new("results"))
        .run(&Context::background())
        .await;

    for word in results.take().await {
        println!("result: {word}");
    }
    println!("execution: {:?}", result.elapsed);
    result.into_result().map(|_| ())
}
