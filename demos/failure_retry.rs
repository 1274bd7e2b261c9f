use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use steadyq::{
    async_trait, Backoff, EnqueueOptions, Handler, JobRecord, MemoryStore, Queue, WorkerBuilder,
};

/// Fails twice, then succeeds, to show the backoff schedule in the logs.
struct FlakyHandler {
    calls: AtomicU32,
}

#[async_trait]
impl Handler for FlakyHandler {
    async fn handle(&self, job: &JobRecord) -> anyhow::Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        println!("[flaky] attempt {n} for job {}", job.id);
        if n <= 2 {
            anyhow::bail!("simulated failure");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let queue = Arc::new(Queue::new(MemoryStore::new()));
    let id = queue
        .enqueue(
            EnqueueOptions::new("flaky", serde_json::json!({}))
                .max_retries(5)
                .backoff(Backoff::new(500, 2)),
        )
        .await?;
    println!("enqueued {id}");

    let worker = WorkerBuilder::new(
        Arc::clone(&queue),
        "flaky",
        Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
        }),
    )
    .poll_interval(Duration::from_millis(200))
    .build();

    // drive the job to completion with single-shot invocations
    loop {
        worker.run_once().await?;
        let status = queue.status(&id).await?.expect("record retained");
        if status.state.is_terminal() {
            println!("final state: {:?} after {} attempts", status.state, status.attempts);
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    Ok(())
}
