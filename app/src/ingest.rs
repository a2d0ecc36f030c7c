use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use fleet_core::{BrokerConfig, DuckDbStore, ingest_payload};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport::{self, Inbound, Transport};

const QUEUE_DEPTH: usize = 4096;
const REPORT_EVERY: u64 = 1000;

/// Drains `rx` into the store on a blocking thread. Returns the number of
/// points written once the sending side is gone.
pub fn spawn_writer(
    store: Arc<Mutex<DuckDbStore>>,
    measurement: String,
    mut rx: mpsc::Receiver<Inbound>,
) -> JoinHandle<u64> {
    tokio::task::spawn_blocking(move || {
        let mut written = 0u64;
        while let Some(inbound) = rx.blocking_recv() {
            let Ok(guard) = store.lock() else {
                error!("store lock poisoned, ingest stopped");
                break;
            };
            match ingest_payload(&guard, &measurement, &inbound.payload, inbound.received_at) {
                Ok(point) => {
                    written += 1;
                    debug!(id = ?point.text("id"), time = %point.time, "point stored");
                    if written % REPORT_EVERY == 0 {
                        info!("ingested {written} points into '{measurement}'");
                    }
                }
                Err(err) => warn!("dropping message: {err}"),
            }
        }
        written
    })
}

/// Subscribes on `broker.topic` and stores every message until shutdown.
pub async fn run(
    transport: Transport,
    broker: BrokerConfig,
    store: Arc<Mutex<DuckDbStore>>,
    measurement: String,
    shutdown: watch::Receiver<bool>,
) -> Result<u64> {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let writer = spawn_writer(store, measurement.clone(), rx);

    let listened = transport::subscribe(transport, &broker, tx, shutdown).await;
    let written = writer.await.context("ingest writer task")?;
    listened?;

    info!(written, measurement = %measurement, "ingest stopped");
    Ok(written)
}
