//! A staged pipeline over CSV rows: parse, keep verified adults, then run a
//! slow background check on a pool of workers under a run deadline.
//!
//! Run with: cargo run --example csv_pipeline

use std::time::Duration;

use pipewright::prelude::*;

const LEGAL_AGE: i32 = 25;
const CURRENT_YEAR: i32 = 2025;

const CSV: &str = "\
name,born_year,wallet_amount,is_verified
Alice Johnson,1985,1543.27,True
Bob Smith,1992,328.90,False
Carol Lee,1978,8732.45,True
David Brown,2000,54.12,False
Emily White,1995,1200.00,True
Frank Green,1982,5023.88,False
Grace Hall,1988,764.00,True
Henry Young,1975,927.56,False
Ivy King,1999,405.75,True
Jack Turner,1983,7801.50,True
Karen Scott,1990,124.20,False
Leo Adams,2002,58.33,True
Mia Baker,1998,349.99,False
Noah Carter,1993,10500.00,True
Olivia Diaz,1981,679.45,False
Paul Evans,2021,2374.00,True
Quinn Foster,1996,95.50,False
Ruby Garcia,1989,4250.75,True
Samuel Harris,1984,not-a-number,False
Tina Johnson,2001,3023.15,True
";

#[derive(Debug, Clone)]
struct Person {
    name: String,
    born_year: i32,
    wallet: f64,
    verified: bool,
}

fn parse_row(row: &str) -> Result<Person> {
    let cols: Vec<&str> = row.split(',').collect();
    let [name, born_year, wallet, verified] = cols[..] else {
        return Err(Error::custom(format!("expected 4 columns in {row:?}")));
    };
    Ok(Person {
        name: name.to_string(),
        born_year: born_year.parse().map_err(Error::external)?,
        wallet: wallet.parse().map_err(Error::external)?,
        verified: verified == "True",
    })
}

/// Stands in for a remote background-check call that honours the context
async fn background_check(ctx: &Context, person: &Person) -> Result<()> {
    ctx.run(tokio::time::sleep(Duration::from_millis(40 + person.name.len() as u64)))
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let rows: Vec<String> = CSV.lines().skip(1).filter(|l| !l.is_empty()).map(String::from).collect();
    let checked = CollectSink::new();

    let result = Pipeline::source(VecSource::new(rows), StageConfig::new("read"))
        .stage(TryMapProcessor::new(|row: String| parse_row(&row)), StageConfig::new("parse"))
        .stage(
            filter_fn(|p: &Person| p.verified && CURRENT_YEAR - p.born_year >= LEGAL_AGE),
            StageConfig::new("verified-adults"),
        )
        .stage(
            processor_fn(|ctx: Context, person: Person| async move {
                background_check(&ctx, &person).await?;
                Ok::<_, Error>(Some(person))
            }),
            StageConfig::new("background-check").workers(4),
        )
        .name("csv")
        .deadline(Duration::from_secs(2))
        .sink(checked.clone(), StageConfig::new("collect"))
        .run(&Context::background())
        .await;

    for person in checked.take().await {
        println!("{} (born {}) holds {:.2}", person.name, person.born_year, person.wallet);
    }
    for error in &result.errors {
        println!("skipped: {error}");
    }
    println!(
        "\n{}: {} processed, {} failed, execution: {:?}",
        result.outcome(),
        result.items_processed,
        result.failed_items,
        result.elapsed
    );
    Ok(())
}
