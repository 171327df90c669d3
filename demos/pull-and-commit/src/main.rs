//! Pull-and-commit demo binary.
//!
//! # Purpose
//! Demonstrates a streaming subscriber whose callback records each message
//! in a transactional store, retrying commits that abort on write conflicts.
//!
//! # Notes
//! The message source and the store both live in this process. The store
//! uses optimistic concurrency, so concurrent callbacks touching the same
//! customer abort and go through the runner's backoff.
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use courier_subscriber::{
    InProcessSource, ReceivedMessage, StreamSubscriber, SubscriberConfig, SubscriptionPath,
};
use courier_txn::{
    BatchDmlResult, CommitResult, ExecutorError, Mutation, ResultSet, RetryConfig, Row,
    Statement, StatusCode, TransactionError, TransactionExecutor, TransactionId,
    TransactionRunner,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

#[derive(Parser, Debug)]
#[command(about = "Pull messages and commit one transaction per message")]
struct Args {
    /// Number of messages to publish.
    #[arg(long, default_value_t = 24)]
    messages: usize,
    /// Number of distinct customers the messages are spread over.
    #[arg(long, default_value_t = 3)]
    customers: usize,
    /// Subscriber YAML config; overrides the demo defaults.
    #[arg(long)]
    subscriber_config: Option<String>,
    /// Retry YAML config; overrides the demo defaults.
    #[arg(long)]
    retry_config: Option<String>,
}

#[derive(Default)]
struct Ledger {
    version: u64,
    next_transaction: u64,
    // Version observed when each open transaction began.
    open: HashMap<String, u64>,
    totals: BTreeMap<String, i64>,
}

/// In-memory store that aborts a commit when another commit landed first.
#[derive(Default)]
struct LedgerExecutor {
    ledger: Mutex<Ledger>,
    conflicts: AtomicUsize,
}

impl LedgerExecutor {
    fn totals(&self) -> BTreeMap<String, i64> {
        self.ledger.lock().totals.clone()
    }
}

#[async_trait]
impl TransactionExecutor for LedgerExecutor {
    async fn begin(&self) -> Result<TransactionId, ExecutorError> {
        let mut ledger = self.ledger.lock();
        ledger.next_transaction += 1;
        let id = format!("ledger-{}", ledger.next_transaction);
        let version = ledger.version;
        ledger.open.insert(id.clone(), version);
        Ok(TransactionId::new(id))
    }

    async fn execute_sql(
        &self,
        _transaction: &TransactionId,
        statement: &Statement,
        _seqno: u64,
    ) -> Result<ResultSet, ExecutorError> {
        let customer = statement
            .params
            .get("customer")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::new(StatusCode::InvalidArgument, "missing @customer"))?;
        let ledger = self.ledger.lock();
        let rows = ledger
            .totals
            .get(customer)
            .map(|total| {
                let mut row = Row::new();
                row.insert("customer".to_string(), json!(customer));
                row.insert("total".to_string(), json!(total));
                vec![row]
            })
            .unwrap_or_default();
        Ok(ResultSet {
            rows,
            row_count: None,
        })
    }

    async fn execute_batch_dml(
        &self,
        _transaction: &TransactionId,
        _statements: &[Statement],
        _seqno: u64,
    ) -> Result<BatchDmlResult, ExecutorError> {
        Err(ExecutorError::new(
            StatusCode::FailedPrecondition,
            "ledger does not accept DML",
        ))
    }

    async fn commit(
        &self,
        transaction: &TransactionId,
        mutations: Vec<Mutation>,
    ) -> Result<CommitResult, ExecutorError> {
        let mut ledger = self.ledger.lock();
        let began_at = ledger
            .open
            .remove(transaction.as_str())
            .ok_or_else(|| ExecutorError::new(StatusCode::NotFound, "unknown transaction"))?;
        if began_at != ledger.version {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(ExecutorError::aborted("write conflict on totals")
                .with_metadata(json!({"retryDelay": {"nanos": 20_000_000}})));
        }
        for mutation in mutations {
            if let Mutation::InsertOrUpdate { rows, .. } = mutation {
                for row in rows {
                    let customer = row.get("customer").and_then(Value::as_str);
                    let total = row.get("total").and_then(Value::as_i64);
                    if let (Some(customer), Some(total)) = (customer, total) {
                        ledger.totals.insert(customer.to_string(), total);
                    }
                }
            }
        }
        ledger.version += 1;
        Ok(CommitResult {
            commit_timestamp: SystemTime::now(),
        })
    }

    async fn rollback(&self, transaction: &TransactionId) -> Result<(), ExecutorError> {
        self.ledger.lock().open.remove(transaction.as_str());
        Ok(())
    }
}

async fn record(runner: &TransactionRunner, customer: String) -> Result<i64, TransactionError> {
    let committed = runner
        .run_with_default_timeout(|tx| {
            let customer = customer.clone();
            async move {
                let current = tx
                    .execute_query(
                        Statement::new("SELECT total FROM totals WHERE customer = @customer")
                            .with_param("customer", customer.clone()),
                    )
                    .await?
                    .rows
                    .first()
                    .and_then(|row| row.get("total"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let mut row = Row::new();
                row.insert("customer".to_string(), json!(customer));
                row.insert("total".to_string(), json!(current + 1));
                tx.insert_or_update("totals", vec![row]);
                Ok(current + 1)
            }
        })
        .await?;
    if committed.attempts > 1 {
        tracing::info!(%customer, attempts = committed.attempts, "commit needed retries");
    }
    Ok(committed.value)
}

async fn run_demo(args: Args) -> Result<()> {
    println!("== Courier Pull-and-Commit Demo ==");
    println!("Goal: settle each pulled message only after its transaction commits.");

    println!("Step 1/5: loading configuration.");
    let subscriber_config = match args.subscriber_config.as_deref() {
        Some(path) => SubscriberConfig::from_env_or_yaml(Some(path))?,
        None => SubscriberConfig {
            streams: 2,
            workers: 4,
            flush_interval_ms: 20,
            ..SubscriberConfig::default()
        },
    };
    let retry_config = match args.retry_config.as_deref() {
        Some(path) => RetryConfig::from_env_or_yaml(Some(path))?,
        None => RetryConfig {
            base_delay_ms: 10,
            multiplier: 1.3,
            timeout_secs: 30,
        },
    };

    println!("Step 2/5: publishing {} messages.", args.messages);
    let customers = args.customers.max(1);
    let source = InProcessSource::with_max_batch(4);
    for n in 0..args.messages {
        let mut attributes = BTreeMap::new();
        attributes.insert("customer".to_string(), format!("customer-{}", n % customers));
        source.publish_with_attributes(Bytes::from(format!("order-{n}")), attributes);
    }

    println!("Step 3/5: starting the subscriber.");
    let executor = Arc::new(LedgerExecutor::default());
    let runner = Arc::new(TransactionRunner::new(executor.clone()).with_config(retry_config));
    let runtime = tokio::runtime::Handle::current();
    let subscription = SubscriptionPath::new("projects/demo/subscriptions/orders")?;
    let handle = StreamSubscriber::new(
        subscription,
        Arc::new(source.clone()),
        Arc::new(source.clone()),
    )
    .with_config(subscriber_config)
    .start(move |message: ReceivedMessage| {
        let Some(customer) = message.attributes().get("customer").cloned() else {
            tracing::warn!(message_id = message.message_id(), "message without customer");
            message.ack();
            return;
        };
        match runtime.block_on(record(&runner, customer)) {
            Ok(_) => message.ack(),
            Err(err) => {
                tracing::warn!(message_id = message.message_id(), error = %err, "commit failed");
                message.nack();
            }
        }
    })
    .context("start subscriber")?;

    println!("Step 4/5: waiting for every message to be acknowledged.");
    let expected = args.messages;
    tokio::time::timeout(Duration::from_secs(30), async {
        while source.acked_count() < expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("messages were not all acknowledged in time")?;
    handle.shutdown().await.context("shutdown subscriber")?;

    println!("Step 5/5: results.");
    for (customer, total) in executor.totals() {
        println!("  {customer}: {total}");
    }
    println!(
        "  aborted commits retried: {}",
        executor.conflicts.load(Ordering::Relaxed)
    );
    println!("Demo complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    run_demo(Args::parse()).await
}
