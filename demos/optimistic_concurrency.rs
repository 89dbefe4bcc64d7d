//! Demonstrates optimistic concurrency control for handling concurrent writes.
//!
//! Two writers load the same inventory item, both decide on a reservation and
//! both try to save. The second save names a version that is no longer
//! current and is rejected; the writer reloads and tries again.
//!
//! Run with: `cargo run --example optimistic_concurrency`

use chronicle::{
    Aggregate, AggregateError, Command, CommandContext, CommandHandler, EventBus, EventStore,
    Repository, RepositoryError, store::inmemory,
};
use serde_json::json;

// =============================================================================
// Aggregate
// =============================================================================

fn inventory_item() -> Aggregate<u64> {
    Aggregate::builder("inventory", 0_u64)
        .command(
            "restock",
            CommandHandler::from_fn(|ctx, cmd| {
                ctx.publish("restocked", json!({ "quantity": cmd.data["quantity"] }))?;
                Ok(())
            }),
        )
        .command(
            "reserve",
            CommandHandler::from_fn(|ctx: &mut CommandContext<u64>, cmd| {
                let quantity = cmd.data["quantity"].as_u64().unwrap_or(0);
                let available = *ctx.state();
                if quantity > available {
                    return Err(AggregateError::domain(format!(
                        "insufficient stock: requested {quantity}, available {available}"
                    )));
                }
                ctx.publish("reserved", json!({ "quantity": quantity }))?;
                Ok(())
            }),
        )
        .reducer("restocked", |available, event| {
            available + event.field("quantity").as_u64().unwrap_or(0)
        })
        .reducer("reserved", |available, event| {
            available.saturating_sub(event.field("quantity").as_u64().unwrap_or(0))
        })
        .build()
}

fn reserve(quantity: u64) -> Command {
    Command::new("reserve", json!({ "quantity": quantity }))
}

type InventoryRepo = Repository<u64, chronicle::aggregate::NoCodec, inmemory::Store>;

// =============================================================================
// Example Parts
// =============================================================================

/// Part 1: two writers race on the same version.
async fn part1_conflict(
    repo: &InventoryRepo,
    item_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("PART 1: Conflict detection\n");

    let first = repo.get_by_id(item_id).await?;
    let second = repo.get_by_id(item_id).await?;
    println!(
        "1. Both writers loaded version {} with {} available",
        first.version, first.state
    );

    let first_events = repo.aggregate().apply_command(&first, &reserve(20)).await?;
    repo.save(item_id, first_events, first.version, None).await?;
    println!("2. First writer reserved 20 units");

    let second_events = repo.aggregate().apply_command(&second, &reserve(10)).await?;
    match repo.save(item_id, second_events, second.version, None).await {
        Err(RepositoryError::Concurrency(conflict)) => {
            println!("3. Second writer rejected: {conflict}\n");
        }
        Ok(_) => println!("3. Second writer unexpectedly succeeded\n"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Part 2: reload and retry until the save goes through.
async fn part2_retry(
    repo: &InventoryRepo,
    item_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("PART 2: Retry on conflict\n");

    let mut attempts = 0;
    loop {
        attempts += 1;
        match repo.execute(item_id, &reserve(10)).await {
            Ok(_) => break,
            Err(e) if e.as_conflict().is_some() && attempts < 3 => {
                println!("   attempt {attempts} conflicted, reloading");
            }
            Err(e) => return Err(e.into()),
        }
    }
    let item = repo.get_by_id(item_id).await?;
    println!(
        "4. Reserved 10 units after {attempts} attempt(s), {} available (100 - 20 - 10)\n",
        item.state
    );
    Ok(())
}

/// Part 3: business rules run against fresh state.
async fn part3_business_rules(repo: &InventoryRepo, item_id: &str) {
    println!("PART 3: Business rules with optimistic concurrency\n");

    match repo.execute(item_id, &reserve(500)).await {
        Err(RepositoryError::Aggregate(e)) => println!("5. Correctly rejected: {e}"),
        Ok(_) => println!("5. Unexpectedly succeeded!"),
        Err(e) => println!("5. Error: {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let events = EventStore::new(inmemory::Store::new(), EventBus::new());
    let repo = Repository::new(inventory_item(), events);

    let item_id = "SKU-001";
    repo.execute(item_id, &Command::new("restock", json!({ "quantity": 100 })))
        .await?;

    part1_conflict(&repo, item_id).await?;
    part2_retry(&repo, item_id).await?;
    part3_business_rules(&repo, item_id).await;
    Ok(())
}
