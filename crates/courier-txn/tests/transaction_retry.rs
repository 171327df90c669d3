use courier_test_harness::{ExecutorCall, ManualClock, ScriptedExecutor};
use courier_txn::{
    BatchDmlResult, ExecutorError, Mutation, RetryHint, Row, StatusCode, Statement,
    TransactionError, TransactionRunner,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn runner(executor: &Arc<ScriptedExecutor>, clock: &Arc<ManualClock>) -> TransactionRunner {
    TransactionRunner::new(executor.clone()).with_clock(clock.clone())
}

fn user_row(id: i64, name: &str) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), json!(id));
    row.insert("name".to_string(), json!(name));
    row
}

fn aborted_with(metadata: serde_json::Value) -> ExecutorError {
    ExecutorError::aborted("aborted").with_metadata(metadata)
}

#[tokio::test]
async fn retries_aborted_commit_without_hint() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_next_commit(ExecutorError::aborted("aborted"));

    let committed = runner(&executor, &clock)
        .run_with_timeout(
            |tx| async move {
                let results = tx.execute_query("SELECT * FROM users").await?;
                Ok(results.rows.len())
            },
            Duration::from_secs(120),
        )
        .await
        .expect("commit");

    assert_eq!(committed.attempts, 2);
    assert_eq!(clock.sleeps(), vec![Duration::from_millis(1300)]);
    assert_eq!(executor.begin_count(), 2);
    assert_eq!(executor.rollback_count(), 0);
}

#[tokio::test]
async fn honors_retry_delay_seconds() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_next_commit(aborted_with(json!({"retryDelay": {"seconds": 60}})));

    runner(&executor, &clock)
        .run_with_timeout(|_tx| async move { Ok(()) }, Duration::from_secs(120))
        .await
        .expect("commit");

    assert_eq!(clock.sleeps(), vec![Duration::from_secs(60)]);
}

#[tokio::test]
async fn honors_retry_delay_seconds_and_nanos() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_next_commit(aborted_with(
        json!({"retryDelay": {"seconds": 123, "nanos": 456000000}}),
    ));

    runner(&executor, &clock)
        .run_with_timeout(|_tx| async move { Ok(()) }, Duration::from_secs(300))
        .await
        .expect("commit");

    assert_eq!(clock.sleeps(), vec![Duration::new(123, 456_000_000)]);
}

#[tokio::test]
async fn retries_multiple_aborts_mixing_backoff_and_hints() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_next_commit(ExecutorError::aborted("aborted"));
    executor.fail_next_commit(aborted_with(json!({"retryDelay": {"seconds": 30}})));

    let committed = runner(&executor, &clock)
        .run_with_timeout(|_tx| async move { Ok("done") }, Duration::from_secs(120))
        .await
        .expect("commit");

    assert_eq!(committed.value, "done");
    assert_eq!(committed.attempts, 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(1300), Duration::from_secs(30)]
    );
}

#[tokio::test]
async fn retries_with_incremental_backoff_until_deadline() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_every_commit(ExecutorError::aborted("aborted"));
    let deadline = clock.start() + Duration::from_secs(8);

    let err = runner(&executor, &clock)
        .run(
            |tx| async move {
                tx.execute_query("SELECT * FROM users").await?;
                Ok(())
            },
            deadline,
        )
        .await
        .expect_err("deadline");

    assert_eq!(
        clock.sleeps(),
        vec![
            Duration::from_nanos(1_300_000_000),
            Duration::from_nanos(1_690_000_000),
            Duration::from_nanos(2_197_000_000),
            Duration::from_nanos(2_856_100_000),
        ]
    );
    match err {
        TransactionError::DeadlineExceeded {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 4);
            assert!(last_error.is_some_and(|err| err.is_aborted()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.begin_count(), 4);
}

#[tokio::test]
async fn abort_after_deadline_fails_without_sleeping() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_every_commit(aborted_with(json!({"retryDelay": {"seconds": 60}})));
    let deadline = clock.start() + Duration::from_secs(1);

    let err = runner(&executor, &clock)
        .run(
            |_tx| {
                let clock = clock.clone();
                async move {
                    // Slow work: the attempt finishes well past the deadline.
                    clock.advance(Duration::from_secs(5));
                    Ok(())
                }
            },
            deadline,
        )
        .await
        .expect_err("deadline");

    assert!(clock.sleeps().is_empty(), "slept: {:?}", clock.sleeps());
    match err {
        TransactionError::DeadlineExceeded {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 1);
            let last_error = last_error.expect("last error");
            assert_eq!(last_error.retry_hint(), RetryHint::Seconds(60));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.begin_count(), 1);
}

#[tokio::test]
async fn past_deadline_fails_without_starting_a_transaction() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    let deadline = clock.start();
    clock.advance(Duration::from_millis(1));

    let err = runner(&executor, &clock)
        .run(|_tx| async move { Ok(()) }, deadline)
        .await
        .expect_err("deadline");

    assert!(matches!(
        err,
        TransactionError::DeadlineExceeded {
            attempts: 0,
            last_error: None
        }
    ));
    assert_eq!(executor.begin_count(), 0);
}

#[tokio::test]
async fn sequence_numbers_continue_across_attempts() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_next_commit(ExecutorError::aborted("aborted"));

    runner(&executor, &clock)
        .run_with_timeout(
            |tx| async move {
                tx.execute_update("UPDATE users SET active = true").await?;
                tx.batch_update(vec![
                    Statement::new("UPDATE users SET a = 1"),
                    Statement::new("UPDATE users SET b = 2"),
                ])
                .await?;
                tx.execute_update("UPDATE users SET active = false").await?;
                Ok(())
            },
            Duration::from_secs(120),
        )
        .await
        .expect("commit");

    assert_eq!(executor.seqnos(), vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn aborted_statement_inside_work_is_retried() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_next_sql(aborted_with(json!({"retryDelay": "2.5s"})));

    let committed = runner(&executor, &clock)
        .run_with_timeout(
            |tx| async move {
                tx.execute_query("SELECT 1").await?;
                Ok(tx.attempt())
            },
            Duration::from_secs(120),
        )
        .await
        .expect("commit");

    assert_eq!(committed.value, 2);
    assert_eq!(clock.sleeps(), vec![Duration::from_millis(2500)]);
    // The aborted attempt never reached commit.
    assert_eq!(executor.commits().len(), 1);
}

#[tokio::test]
async fn swallowed_abort_still_retries() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_next_sql(ExecutorError::aborted("aborted"));

    let committed = runner(&executor, &clock)
        .run_with_timeout(
            |tx| async move {
                let _ = tx.execute_query("SELECT 1").await;
                Ok(())
            },
            Duration::from_secs(120),
        )
        .await
        .expect("commit");

    assert_eq!(committed.attempts, 2);
    assert_eq!(executor.commits().len(), 1);
}

#[tokio::test]
async fn non_aborted_commit_error_rolls_back_and_propagates() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_next_commit(ExecutorError::new(StatusCode::FailedPrecondition, "constraint"));

    let err = runner(&executor, &clock)
        .run_with_timeout(|_tx| async move { Ok(()) }, Duration::from_secs(120))
        .await
        .expect_err("fatal");

    assert!(matches!(
        err,
        TransactionError::Other(ExecutorError {
            code: StatusCode::FailedPrecondition,
            ..
        })
    ));
    assert_eq!(executor.rollback_count(), 1);
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn work_error_rolls_back_even_when_rollback_fails() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_rollbacks(ExecutorError::new(StatusCode::Unavailable, "gone"));

    let err = runner(&executor, &clock)
        .run_with_timeout(
            |_tx| async move { Err::<(), _>(anyhow::anyhow!("invalid input").into()) },
            Duration::from_secs(120),
        )
        .await
        .expect_err("work error");

    assert!(matches!(err, TransactionError::Work(_)));
    assert_eq!(executor.rollback_count(), 1);
    assert!(executor.commits().is_empty());
}

#[tokio::test]
async fn aborted_begin_is_retried() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.fail_next_begin(ExecutorError::aborted("session busy"));

    let committed = runner(&executor, &clock)
        .run_with_timeout(|_tx| async move { Ok(()) }, Duration::from_secs(120))
        .await
        .expect("commit");
    assert_eq!(committed.attempts, 2);
    assert_eq!(executor.rollback_count(), 0);
}

#[tokio::test]
async fn mutations_are_buffered_until_commit() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());

    runner(&executor, &clock)
        .run_with_timeout(
            |tx| async move {
                tx.insert("users", vec![user_row(1, "ada")]);
                tx.update("users", vec![user_row(2, "grace")]);
                tx.insert_or_update("users", vec![user_row(3, "alan")]);
                tx.replace("users", vec![user_row(4, "edsger")]);
                tx.delete("users", vec![json!(5)]);
                assert_eq!(tx.pending_mutations(), 5);
                Ok(())
            },
            Duration::from_secs(120),
        )
        .await
        .expect("commit");

    let commits = executor.commits();
    assert_eq!(commits.len(), 1);
    let (transaction, mutations) = &commits[0];
    assert_eq!(transaction.as_str(), "tx-1");
    let tables: Vec<&str> = mutations.iter().map(Mutation::table).collect();
    assert_eq!(tables, vec!["users"; 5]);
    assert!(matches!(mutations[4], Mutation::Delete { .. }));
}

#[tokio::test]
async fn batch_update_reports_partial_row_counts() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    executor.push_batch_result(BatchDmlResult {
        row_counts: vec![1],
        status: Some(ExecutorError::new(StatusCode::InvalidArgument, "bad column")),
    });

    let err = runner(&executor, &clock)
        .run_with_timeout(
            |tx| async move {
                tx.batch_update(vec![
                    Statement::new("UPDATE users SET a = 1"),
                    Statement::new("UPDATE users SET nope = 2"),
                ])
                .await?;
                Ok(())
            },
            Duration::from_secs(120),
        )
        .await
        .expect_err("batch failure");

    match err {
        TransactionError::BatchUpdate { row_counts, source } => {
            assert_eq!(row_counts, vec![1]);
            assert_eq!(source.code, StatusCode::InvalidArgument);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(executor.rollback_count(), 1);
}

#[tokio::test]
async fn empty_batch_update_is_rejected() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());

    let err = runner(&executor, &clock)
        .run_with_timeout(
            |tx| async move {
                tx.batch_update(Vec::new()).await?;
                Ok(())
            },
            Duration::from_secs(120),
        )
        .await
        .expect_err("empty batch");
    assert!(matches!(err, TransactionError::EmptyBatch));
    assert!(
        !executor
            .calls()
            .iter()
            .any(|call| matches!(call, ExecutorCall::BatchDml { .. }))
    );
}

#[tokio::test]
async fn aborted_error_returned_by_work_carries_hint() {
    let executor = Arc::new(ScriptedExecutor::new());
    let clock = Arc::new(ManualClock::new());
    let failed_once = Arc::new(std::sync::atomic::AtomicBool::new(false));

    runner(&executor, &clock)
        .run_with_timeout(
            {
                let failed_once = failed_once.clone();
                move |_tx| {
                    let failed_once = failed_once.clone();
                    async move {
                        if !failed_once.swap(true, std::sync::atomic::Ordering::SeqCst) {
                            return Err(TransactionError::aborted("app conflict", RetryHint::Seconds(7)));
                        }
                        Ok(())
                    }
                }
            },
            Duration::from_secs(120),
        )
        .await
        .expect("commit");
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(7)]);
}
