//! 内存传输上的完整往返：发布 → 管道 → 处理器 → 确认
//!
//! 运行：`RUST_LOG=debug cargo run -p pubsub-core --example inmemory_roundtrip`
//!
use async_trait::async_trait;
use pubsub_core::bus::{BusOptions, EventBus};
use pubsub_core::codec::JsonCodec;
use pubsub_core::failure::RequeuePolicy;
use pubsub_core::handler::{EventHandler, HandlerManifest, MessageContext};
use pubsub_core::pipeline::{Deduplicate, LogErrors, Pipeline, Timeout};
use pubsub_core::retry::{Backoff, RetryPolicy};
use pubsub_core::transport::InMemoryTransport;
use pubsub_macros::event;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[event(event_type = "account")]
struct AccountEvent {
    account_id: String,
}

#[event(event_type = "account.deposited", extends = AccountEvent)]
struct Deposited {
    account_id: String,
    amount: i64,
}

struct BalanceProjector {
    balance: Arc<AtomicI64>,
}

#[async_trait]
impl EventHandler<Deposited> for BalanceProjector {
    async fn handle(&self, ctx: &MessageContext, event: &Deposited) -> anyhow::Result<()> {
        if event.amount <= 0 {
            anyhow::bail!("invalid deposit {} for {}", event.amount, event.account_id);
        }
        let total = self.balance.fetch_add(event.amount, Ordering::SeqCst) + event.amount;
        tracing::info!(
            message_id = ctx.message_id(),
            account = %event.account_id,
            total,
            "balance updated"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let transport = InMemoryTransport::new();
    let balance = Arc::new(AtomicI64::new(0));

    let projector_balance = balance.clone();
    let manifest = HandlerManifest::new().handler::<Deposited, BalanceProjector, _>(move || {
        BalanceProjector {
            balance: projector_balance.clone(),
        }
    });

    let pipeline = Pipeline::new()
        .with(LogErrors::propagate())
        .with(Deduplicate::new(Duration::from_secs(60)))
        .with(Timeout::new(Duration::from_secs(2)));

    let options = BusOptions::builder()
        .retry(RetryPolicy::new(3, Backoff::fixed(Duration::from_millis(10))))
        .failure_handler(Arc::new(RequeuePolicy))
        .build();

    let bus = EventBus::<AccountEvent, JsonCodec>::builder()
        .transport(Arc::new(transport.clone()))
        .handlers(manifest)
        .pipeline(pipeline)
        .options(options)
        .build();

    let subscription = bus
        .subscribe::<Deposited, BalanceProjector>("balances", "account.deposited")
        .await?;

    // 前两次发布失败，由重试策略兜底
    transport.fail_next_publishes(2);

    let deposits = vec![
        Deposited {
            account_id: "acc-1".into(),
            amount: 100,
        },
        Deposited {
            account_id: "acc-1".into(),
            amount: 50,
        },
        Deposited {
            account_id: "acc-1".into(),
            amount: -5,
        },
    ];
    bus.publish_all(&deposits, "account.deposited", None).await?;

    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.acked() + transport.rejected() < deposits.len() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    tracing::info!(
        balance = balance.load(Ordering::SeqCst),
        acked = transport.acked(),
        requeued = transport.requeued(),
        rejected = transport.rejected(),
        "round trip finished"
    );

    bus.unsubscribe(&subscription).await;
    bus.shutdown().await;
    Ok(())
}
