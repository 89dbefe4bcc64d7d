//! A bank account aggregate on a file-backed log, with a live projection.
//!
//! Run with: `cargo run --example quickstart`
//! Add `RUST_LOG=chronicle_core=debug` to watch the engine work.

use std::collections::BTreeMap;

use chronicle::{
    Aggregate, AggregateError, AggregateEvent, Command, CommandContext, CommandHandler, EventBus,
    EventStore, Projection, ReadModel, Repository, position::FilePositionStore, projection::BoxError,
    store::file::FileStore,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Account {
    owner: String,
    balance: i64,
}

fn amount_of(value: &serde_json::Value) -> i64 {
    value["amount"].as_i64().unwrap_or(0)
}

fn account() -> Aggregate<Account> {
    Aggregate::builder("account", Account::default())
        .command(
            "open",
            CommandHandler::from_fn(|ctx, cmd| {
                if ctx.exists() {
                    return Err(AggregateError::domain("account already open"));
                }
                ctx.publish("opened", json!({ "owner": cmd.data["owner"] }))?;
                Ok(())
            }),
        )
        .command(
            "deposit",
            CommandHandler::from_fn(|ctx, cmd| {
                let amount = amount_of(&cmd.data);
                if amount <= 0 {
                    return Err(AggregateError::domain("amount must be positive"));
                }
                ctx.publish("deposited", json!({ "amount": amount }))?;
                Ok(())
            }),
        )
        .command(
            "withdraw",
            CommandHandler::from_fn(|ctx: &mut CommandContext<Account>, cmd| {
                let amount = amount_of(&cmd.data);
                if amount > ctx.state().balance {
                    return Err(AggregateError::domain("insufficient funds"));
                }
                ctx.publish("withdrawn", json!({ "amount": amount }))?;
                Ok(())
            }),
        )
        .reducer("opened", |account: &Account, event| Account {
            owner: event.field("owner").as_str().unwrap_or_default().to_string(),
            ..account.clone()
        })
        .reducer("deposited", |account: &Account, event| Account {
            balance: account.balance + event.field("amount").as_i64().unwrap_or(0),
            ..account.clone()
        })
        .reducer("withdrawn", |account: &Account, event| Account {
            balance: account.balance - event.field("amount").as_i64().unwrap_or(0),
            ..account.clone()
        })
        .build()
}

#[derive(Debug, Default)]
struct Balances {
    by_owner: BTreeMap<String, i64>,
    owners: BTreeMap<String, String>,
}

impl ReadModel for Balances {
    async fn reset(&mut self) -> Result<(), BoxError> {
        self.by_owner.clear();
        self.owners.clear();
        Ok(())
    }
}

impl Balances {
    fn owner_of(&self, event: &AggregateEvent) -> Result<String, BoxError> {
        self.owners
            .get(&event.aggregate.id)
            .cloned()
            .ok_or_else(|| format!("no owner for account {}", event.aggregate.id).into())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let events = EventStore::new(
        FileStore::new(dir.path().join("events.jsonl")),
        EventBus::new(),
    );
    let accounts = Repository::new(account(), events.clone());

    let projection = Projection::builder("balances", Balances::default())
        .on("account.opened", |balances, event| {
            let owner = event.event.field("owner").as_str().unwrap_or_default();
            balances
                .owners
                .insert(event.aggregate.id.clone(), owner.to_string());
            balances.by_owner.entry(owner.to_string()).or_insert(0);
            Ok(())
        })
        .on("account.deposited", |balances, event| {
            let owner = balances.owner_of(event)?;
            let amount = event.event.field("amount").as_i64().unwrap_or(0);
            *balances.by_owner.entry(owner).or_insert(0) += amount;
            Ok(())
        })
        .on("account.withdrawn", |balances, event| {
            let owner = balances.owner_of(event)?;
            let amount = event.event.field("amount").as_i64().unwrap_or(0);
            *balances.by_owner.entry(owner).or_insert(0) -= amount;
            Ok(())
        })
        .build(events.clone(), FilePositionStore::new(dir.path().join("positions")));
    let handle = projection.start().await?;
    info!(position = handle.position(), "balances projection is live");

    let ada = accounts.next_id();
    let grace = accounts.next_id();
    accounts
        .execute(&ada, &Command::new("open", json!({ "owner": "ada" })))
        .await?;
    accounts
        .execute(&grace, &Command::new("open", json!({ "owner": "grace" })))
        .await?;
    accounts
        .execute(&ada, &Command::new("deposit", json!({ "amount": 100 })))
        .await?;
    accounts
        .execute(&grace, &Command::new("deposit", json!({ "amount": 40 })))
        .await?;
    let saved = accounts
        .execute(&ada, &Command::new("withdraw", json!({ "amount": 30 })))
        .await?;

    match accounts
        .execute(&grace, &Command::new("withdraw", json!({ "amount": 500 })))
        .await
    {
        Err(e) => warn!(error = %e, "grace cannot withdraw 500"),
        Ok(_) => println!("unexpectedly withdrew 500"),
    }

    let last_id = saved.last().map_or(0, |event| event.id);
    handle.wait_for(last_id).await?;
    info!(last_id, "projection caught up");
    {
        let balances = handle.model().read().await;
        for (owner, balance) in &balances.by_owner {
            println!("{owner}: {balance}");
        }
        assert_eq!(balances.by_owner.get("ada"), Some(&70));
        assert_eq!(balances.by_owner.get("grace"), Some(&40));
    }

    let ada_state = accounts.get_by_id(&ada).await?;
    println!(
        "ada's account is at version {} with balance {}",
        ada_state.version, ada_state.state.balance
    );

    handle.stop().await?;
    Ok(())
}
