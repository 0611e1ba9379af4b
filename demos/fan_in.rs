//! Fan-in: three CSV readers merged into one stream.
//!
//! Run with: cargo run --example fan_in

use pipewright::prelude::*;

const CSV1: &str = "\
email,saving_amount,debt_amount
alice.johnson@example.com,7845.22,1200.00
bob.smith@example.com,2350.10,540.75
carol.lee@example.com,12350.00,9823.55
david.brown@example.com,475.65,0.00
emily.white@example.com,9400.33,2500.00";

const CSV2: &str = "\
email,saving_amount,debt_amount
peter.turner@example.com,15800.22,1100.00
quinn.baker@example.com,7200.80,3500.25
rachel.morris@example.com,5200.90,220.10
sam.carter@example.com,630.40,100.00";

const CSV3: &str = "\
email,saving_amount,debt_amount
ella.henderson@example.com,13200.50,7200.00
freddie.morgan@example.com,450.75,100.50
george.clark@example.com,8900.00,3100.10";

#[derive(Debug)]
struct Account {
    email: String,
    saving: f64,
    net_worth: f64,
}

fn parse_account(row: &str) -> Result<Account> {
    let cols: Vec<&str> = row.split(',').collect();
    let [email, saving, debt] = cols.as_slice() else {
        return Err(Error::custom(format!("expected 3 columns in {row:?}")));
    };
    let saving: f64 = saving.parse().map_err(Error::external)?;
    let debt: f64 = debt.parse().map_err(Error::external)?;
    Ok(Account {
        email: email.to_string(),
        saving,
        net_worth: saving - debt,
    })
}

fn reader(name: &str, csv: &'static str) -> PipelineBuilder<Account> {
    let rows = csv.lines().filter(|l| !l.is_empty() && !l.starts_with("email"));
    Pipeline::source(iter_source(rows), StageConfig::new(name))
        .stage(TryMapProcessor::new(parse_account), StageConfig::new(format!("{name}-parse")))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let result = reader("csv1", CSV1)
        .merge([reader("csv2", CSV2), reader("csv3", CSV3)], StageConfig::new("merge"))
        .sink(
            sink_fn(|_ctx, account: Account| async move {
                println!(
                    "output: {} saving: {:.2} but has networth {:.2}",
                    account.email, account.saving, account.net_worth
                );
                Ok(())
            }),
            StageConfig::new("print"),
        )
        .run(&Context::background())
        .await;

    println!("\n{} accounts, execution: {:?}", result.items_processed, result.elapsed);
    result.into_result().map(|_| ())
}
