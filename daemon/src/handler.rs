use crate::Engine;
use pkgbuilderd_common::config::{IDLE_DELAY, WORKER_DELAY};
use pkgbuilderd_common::errors::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

/// Take one transaction off the queue and run it. Returns false if the
/// queue was empty.
pub async fn work(engine: &Engine) -> Result<bool> {
    let Some(tnum) = engine.status.next_transaction()? else {
        return Ok(false);
    };
    let txn = engine.run_transaction(tnum).await?;
    debug!("Transaction {} done, builds: {:?}", txn.tnum, txn.builds);
    Ok(true)
}

pub async fn run_worker_loop(engine: Arc<Engine>, worker: usize) -> Result<()> {
    info!("Transaction worker #{} started", worker);
    loop {
        match work(&engine).await {
            Ok(true) => time::sleep(Duration::from_secs(WORKER_DELAY)).await,
            Ok(false) => {
                trace!("Worker #{}: no pending transactions, sleeping for {}s", worker, IDLE_DELAY);
                time::sleep(Duration::from_secs(IDLE_DELAY)).await;
            }
            Err(err) => {
                error!("Worker #{}: unexpected error, sleeping for {}s: {:#}", worker, IDLE_DELAY, err);
                time::sleep(Duration::from_secs(IDLE_DELAY)).await;
            }
        }
    }
}

/// Start the configured number of transaction workers and wait for them.
pub async fn run_workers(engine: Arc<Engine>) -> Result<()> {
    let count = engine.config.workers.transactions();
    info!("Starting {} transaction worker(s)", count);

    let mut handles = Vec::new();
    for worker in 1..=count {
        handles.push(tokio::spawn(run_worker_loop(engine.clone(), worker)));
    }

    for handle in handles {
        handle.await
            .context("Worker task panicked")??;
    }
    Ok(())
}
