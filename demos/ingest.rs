//! Minimal end-to-end walkthrough: ingest a day of readings, query a few
//! aggregations, stream an auxiliary export through the async pipeline.
//!
//! Run with `cargo run --example ingest`.

use anyhow::Result;
use serde_json::{json, Map, Value};
use tracing::info;

use chronolithdb::{EngineConfig, TimeSeriesEngine};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let engine = TimeSeriesEngine::open(EngineConfig::default()).await?;

    // One reading every ten minutes for the last six hours.
    let now = chrono::Utc::now().timestamp_millis();
    for step in 0..36 {
        let at = now - step * 10 * 60 * 1000;
        let value = 20.0 + (step % 7) as f64 * 0.8;
        engine.write_point_at("temperature", value, at)?;
    }
    engine.flush()?;

    let start = now - 6 * 3_600_000;
    for key in ["average", "min", "max", "trend", "percentile_90"] {
        let out = engine.query(start, now, key)?;
        info!(key, result = %out.to_json(), "aggregation");
    }
    info!(stats = ?engine.database_stats(), "vitals");

    // Stream a large export without starving the event loop.
    let mut export = Map::new();
    export.insert("source".into(), json!("demo"));
    export.insert(
        "samples".into(),
        Value::Array((0..500).map(|i| json!(i)).collect()),
    );
    let done = engine
        .pipeline()
        .write_object("demo_export.ndj".into(), &export)?;
    done.await??;
    info!("export streamed");

    engine.pipeline().wait_idle().await;
    engine.close()?;
    Ok(())
}
