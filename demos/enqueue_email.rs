use steadyq::{EnqueueOptions, Queue, RedisStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let store = RedisStore::connect("redis://127.0.0.1:6379").await?;
    let queue = Queue::new(store);

    // repeat submissions with the same idempotency key resolve to one job
    let opts = EnqueueOptions::new(
        "email",
        serde_json::json!({"to": "a@example.com", "template": "welcome"}),
    )
    .priority(10)
    .idempotency_key("welcome-a@example.com");

    let first = queue.enqueue(opts.clone()).await?;
    let second = queue.enqueue(opts).await?;
    println!("enqueued {first}, duplicate resolved to {second}");

    let status = queue.status(&first).await?;
    println!("status: {status:?}");

    let stats = queue.stats("email").await?;
    println!("stats: {stats:?}");

    Ok(())
}
