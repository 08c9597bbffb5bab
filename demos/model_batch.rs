//! Seed two models in one batch and print the aggregated outcome.
//!
//! Run with: cargo run --example model_batch

use std::sync::Arc;

use modelchain::chain::{Batch, ChainConfig, Operation};
use modelchain::model::{MemoryAdapter, ModelClass, StorageAdapter};
use modelchain::chain::metrics;
use modelchain::telemetry;
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init("info,modelchain=debug");

    let adapter = Arc::new(MemoryAdapter::new());
    let users = ModelClass::new("User", adapter.clone())
        .require("email")
        .into_capability();
    let posts = ModelClass::new("Post", adapter.clone())
        .require("title")
        .into_capability();

    let mut batch = Batch::with_config(ChainConfig::new().with_label("demo_seed"));
    batch
        .call_with(users.clone(), "create", json!({"id": "ada", "email": "ada@example.com"}))
        .call_with(users.clone(), "create", json!({"id": "bob"}))
        .call_with(posts.clone(), "create", json!({"title": "Engines", "author": "ada"}))
        .call_with(posts, "frobnicate", json!({}))
        .register(
            Operation::call(users, "count").on_complete(|_, result| {
                println!("users counted mid-batch: {:?}", result);
            }),
        );

    match batch.finish().await? {
        None => println!("all operations succeeded"),
        Some(errors) => {
            println!("{} operation error(s):", errors.len());
            for error in errors {
                println!("  - {}", error);
            }
        }
    }

    println!("users stored: {}", adapter.count("User").await?);
    println!("posts stored: {}", adapter.count("Post").await?);
    println!("\n{}", metrics::export());
    Ok(())
}
