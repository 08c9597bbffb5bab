//! Batch Orchestration Tests
//!
//! Fan-out, join, exactly-once finalization and error aggregation across
//! success, failure, setup-fault and callback-style members.

use modelchain::chain::{
    Arity, Batch, Capability, ChainConfig, DispatchMode, Failure, Member, Methods, Operation,
    OperationError, Responder, SetupFault, member_fn,
};
use modelchain::ChainError;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_test::{assert_err, assert_ok};

fn other(msg: &str) -> OperationError {
    OperationError::Other(msg.to_string())
}

fn message(arg: &Option<Value>) -> String {
    arg.as_ref()
        .and_then(Value::as_str)
        .unwrap_or("failed")
        .to_string()
}

/// Capability with members covering every completion shape
fn ops() -> Arc<dyn Capability> {
    Arc::new(
        Methods::new("Ops")
            .member("ok", |arg| async move { Ok(arg) })
            .member("fail", |arg| async move {
                Err(Failure::Single(OperationError::Other(message(&arg))))
            })
            .member("fail_many", |_| async {
                Err(Failure::Many(vec![
                    OperationError::Other("E1".into()),
                    OperationError::Other("E2".into()),
                ]))
            })
            .member("sleep_fail", |arg| async move {
                let ms = arg.as_ref().and_then(|v| v["ms"].as_u64()).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let msg = arg
                    .as_ref()
                    .and_then(|v| v["msg"].as_str())
                    .unwrap_or("slept")
                    .to_string();
                Err(Failure::Single(OperationError::Other(msg)))
            })
            .member("panic", |arg| async move {
                if arg.is_none() {
                    panic!("storage exploded");
                }
                Ok(arg)
            })
            .bind(
                "strict",
                Arc::new(Arity::required(member_fn(|arg| async move { Ok(arg) }))),
            )
            .callback("sync_cb", |arg, done: Responder| done.ok(arg))
            .callback("thread_cb", |_arg, done: Responder| {
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(10));
                    done.fail(OperationError::Storage("disk".into()));
                });
            })
            .callback("lost_cb", |_arg, done: Responder| drop(done)),
    )
}

/// Run a batch and also count how many times the final handler fires
async fn run_counted(batch: Batch) -> (Option<Vec<OperationError>>, Arc<AtomicUsize>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let seen = fired.clone();
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));

    assert_ok!(batch.run(move |errors| {
        seen.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(errors);
        }
    }));

    let errors = rx.await.expect("final handler should fire");
    // Give any stray second firing a chance to show up
    tokio::time::sleep(Duration::from_millis(20)).await;
    (errors, fired)
}

#[tokio::test]
async fn test_zero_operations_complete_immediately() {
    let fired = Arc::new(AtomicUsize::new(0));
    let seen = fired.clone();

    let progress = assert_ok!(Batch::new().run(move |errors| {
        assert!(errors.is_none());
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    // Fired before run returned
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(progress.total(), 0);
    assert!(progress.is_terminated());
}

#[tokio::test]
async fn test_three_successes_report_no_error_once() {
    let target = ops();
    let mut batch = Batch::new();
    for i in 0..3 {
        batch.call_with(target.clone(), "ok", json!(i));
    }

    let (errors, fired) = run_counted(batch).await;
    assert_eq!(errors, None);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_single_failure_in_the_middle() {
    let target = ops();
    let mut batch = Batch::new();
    batch
        .call(target.clone(), "ok")
        .call_with(target.clone(), "fail", json!("E"))
        .call(target, "ok");

    let errors = batch.finish().await.unwrap();
    assert_eq!(errors, Some(vec![other("E")]));
}

#[tokio::test]
async fn test_error_sequence_is_flattened() {
    let target = ops();
    let mut batch = Batch::new();
    batch.call(target.clone(), "fail_many").call(target, "ok");

    let errors = batch.finish().await.unwrap();
    assert_eq!(errors, Some(vec![other("E1"), other("E2")]));
}

#[tokio::test]
async fn test_errors_follow_completion_order() {
    // "held" cannot finish until the "fast" operation's handler releases it
    let (release, held) = oneshot::channel::<()>();
    let held = Arc::new(Mutex::new(Some(held)));
    let gated: Arc<dyn Capability> = Arc::new(Methods::new("Held").member("wait", move |_| {
        let held = held.clone();
        async move {
            let gate = held.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Err(Failure::Single(OperationError::Other("held".into())))
        }
    }));

    let mut batch = Batch::new();
    batch.call(gated, "wait").register(
        Operation::call(ops(), "fail")
            .argument(json!("fast"))
            .on_complete(move |_, _| {
                let _ = release.send(());
            }),
    );

    let errors = batch.finish().await.unwrap();
    assert_eq!(errors, Some(vec![other("fast"), other("held")]));
}

#[tokio::test]
async fn test_final_handler_waits_for_every_operation() {
    let target = ops();
    let completed = Arc::new(AtomicUsize::new(0));
    let mut batch = Batch::new();

    for ms in [5u64, 30, 60] {
        let completed = completed.clone();
        batch.register(
            Operation::call(target.clone(), "sleep_fail")
                .argument(json!({"ms": ms}))
                .on_complete(move |_, _| {
                    completed.fetch_add(1, Ordering::SeqCst);
                }),
        );
    }

    let observed = Arc::new(AtomicUsize::new(usize::MAX));
    let observed_in_handler = observed.clone();
    let completed_in_handler = completed.clone();
    let (tx, rx) = oneshot::channel();

    let progress = assert_ok!(batch.run(move |errors| {
        observed_in_handler.store(completed_in_handler.load(Ordering::SeqCst), Ordering::SeqCst);
        let _ = tx.send(errors.map(|e| e.len()));
    }));
    assert!(progress.is_running());

    assert_eq!(rx.await.unwrap(), Some(3));
    assert_eq!(observed.load(Ordering::SeqCst), 3);
    assert_eq!(progress.finished(), 3);
    assert_eq!(progress.error_count(), 3);
    assert!(progress.is_terminated());
    assert!(!progress.is_running());
}

#[tokio::test]
async fn test_per_operation_handlers_fire_once_before_final() {
    let target = ops();
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut batch = Batch::new();

    for (i, member) in ["ok", "fail", "sync_cb", "fail_many"].into_iter().enumerate() {
        let log = log.clone();
        batch.register(
            Operation::call(target.clone(), member)
                .argument(json!(format!("arg{}", i)))
                .on_complete(move |error, result| {
                    let tag = match (error, result) {
                        (Some(f), _) => format!("{}:err{}", i, f.len()),
                        (None, Some(_)) => format!("{}:ok", i),
                        (None, None) => format!("{}:empty", i),
                    };
                    log.lock().unwrap().push(tag);
                }),
        );
    }

    let final_log = log.clone();
    let (tx, rx) = oneshot::channel();
    assert_ok!(batch.run(move |errors| {
        final_log.lock().unwrap().push("final".to_string());
        let _ = tx.send(errors);
    }));

    let errors = rx.await.unwrap().unwrap();
    assert_eq!(errors.len(), 3);

    let mut entries = log.lock().unwrap().clone();
    assert_eq!(entries.pop(), Some("final".to_string()));
    entries.sort();
    assert_eq!(entries, vec!["0:ok", "1:err1", "2:ok", "3:err2"]);
}

#[tokio::test]
async fn test_setup_faults_are_excluded_and_do_not_block() {
    let target = ops();
    let dispatched_after_fault = Arc::new(AtomicUsize::new(0));
    let flag = dispatched_after_fault.clone();

    let mut batch = Batch::new();
    batch
        .call(target.clone(), "ok")
        .call(target.clone(), "no_such_member")
        .call(target.clone(), "strict")
        .register(
            Operation::call(target.clone(), "fail")
                .argument(json!("late"))
                .on_complete(move |_, _| {
                    flag.fetch_add(1, Ordering::SeqCst);
                }),
        );
    assert_eq!(batch.len(), 4);

    let (tx, rx) = oneshot::channel();
    let progress = assert_ok!(batch.run(move |errors| {
        let _ = tx.send(errors);
    }));
    assert_eq!(progress.total(), 2);

    let errors = rx.await.unwrap();
    assert_eq!(errors, Some(vec![other("late")]));
    assert_eq!(dispatched_after_fault.load(Ordering::SeqCst), 1);
    assert_eq!(progress.finished(), 2);
}

#[tokio::test]
async fn test_all_setup_faults_behave_like_empty_batch() {
    let target = ops();
    let mut batch = Batch::new();
    batch.call(target.clone(), "missing").call(target, "strict");

    let fired = Arc::new(AtomicUsize::new(0));
    let seen = fired.clone();
    let progress = assert_ok!(batch.run(move |errors| {
        assert!(errors.is_none());
        seen.fetch_add(1, Ordering::SeqCst);
    }));

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(progress.total(), 0);
}

#[tokio::test]
async fn test_invalid_registrations_leave_batch_unchanged() {
    let mut batch = Batch::new();
    batch
        .register(Operation::new())
        .register(Operation::new().member("ok"))
        .register(Operation::new().target(ops()))
        .register(Operation::call(ops(), ""));
    assert_eq!(batch.len(), 0);

    assert_err!(batch.try_register(Operation::new().member("ok")));
    assert_eq!(batch.finish().await.unwrap(), None);
}

#[tokio::test]
async fn test_callback_members() {
    let target = ops();
    let mut batch = Batch::new();
    batch
        .call_with(target.clone(), "sync_cb", json!("now"))
        .call(target.clone(), "thread_cb")
        .call(target, "lost_cb");

    let errors = batch.finish().await.unwrap().unwrap();
    assert_eq!(errors.len(), 2);
    assert!(errors.contains(&OperationError::Storage("disk".into())));
    assert!(errors.contains(&OperationError::Abandoned {
        member: "lost_cb".into()
    }));
}

#[tokio::test]
async fn test_panicking_member_is_reported_not_hung() {
    let target = ops();
    let mut batch = Batch::new();
    batch.call(target.clone(), "panic").call(target, "ok");

    let errors = batch.finish().await.unwrap();
    assert_eq!(
        errors,
        Some(vec![OperationError::Panicked {
            member: "panic".into(),
            message: "storage exploded".into()
        }])
    );
}

#[tokio::test]
async fn test_panicking_completion_handler_does_not_stall_batch() {
    for mode in [DispatchMode::Spawn, DispatchMode::Cooperative] {
        let target = ops();
        let slow_handled = Arc::new(AtomicUsize::new(0));
        let counter = slow_handled.clone();

        let mut batch = Batch::with_config(ChainConfig::new().with_dispatch(mode));
        batch
            .register(
                Operation::call(target.clone(), "fail")
                    .argument(json!("fast"))
                    .on_complete(|_, _| panic!("handler exploded")),
            )
            .register(
                Operation::call(target, "sleep_fail")
                    .argument(json!({"ms": 20, "msg": "slow"}))
                    .on_complete(move |_, _| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
            );

        let (errors, fired) = run_counted(batch).await;
        let mut errors = errors.unwrap();
        errors.sort_by_key(|e| e.to_string());
        assert_eq!(errors, vec![other("fast"), other("slow")]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(slow_handled.load(Ordering::SeqCst), 1);
    }
}

/// Capability whose member lookup panics
struct Unstable;

impl Capability for Unstable {
    fn name(&self) -> &str {
        "Unstable"
    }

    fn resolve(&self, member: &str) -> Result<Arc<dyn Member>, SetupFault> {
        panic!("lookup of {} exploded", member)
    }
}

#[tokio::test]
async fn test_panicking_lookup_is_a_setup_fault() {
    let target = ops();
    let mut batch = Batch::new();
    batch
        .call(target.clone(), "ok")
        .call(Arc::new(Unstable), "anything")
        .call(target, "ok");

    let (tx, rx) = oneshot::channel();
    let progress = assert_ok!(batch.run(move |errors| {
        let _ = tx.send(errors);
    }));
    assert_eq!(progress.total(), 2);
    assert_eq!(rx.await.unwrap(), None);
}

#[tokio::test]
async fn test_cooperative_dispatch_matches_spawn() {
    let target = ops();
    let build = |mode: DispatchMode| {
        let mut batch = Batch::with_config(ChainConfig::new().with_label("parity").with_dispatch(mode));
        batch
            .call(target.clone(), "ok")
            .call(target.clone(), "fail_many")
            .call(target.clone(), "missing")
            .call_with(target.clone(), "fail", json!("E"));
        batch
    };

    let mut spawned = build(DispatchMode::Spawn).finish().await.unwrap().unwrap();
    let mut cooperative = build(DispatchMode::Cooperative).finish().await.unwrap().unwrap();
    spawned.sort_by_key(|e| e.to_string());
    cooperative.sort_by_key(|e| e.to_string());
    assert_eq!(spawned, cooperative);
    assert_eq!(spawned.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_completions_fire_once() {
    let gate = Arc::new(tokio::sync::Barrier::new(64));
    let gated: Arc<dyn Capability> = {
        let gate = gate.clone();
        Arc::new(Methods::new("Gated").member("go", move |arg| {
            let gate = gate.clone();
            async move {
                gate.wait().await;
                match arg {
                    Some(Value::Bool(true)) => Err(Failure::Single(OperationError::Other("odd".into()))),
                    _ => Ok(None),
                }
            }
        }))
    };

    let mut batch = Batch::new();
    for i in 0..64 {
        batch.call_with(gated.clone(), "go", json!(i % 2 == 1));
    }

    let (errors, fired) = run_counted(batch).await;
    assert_eq!(errors.map(|e| e.len()), Some(32));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_run_outside_runtime_is_rejected() {
    let mut batch = Batch::new();
    batch.call(ops(), "ok");
    let result = batch.run(|_| {});
    assert!(matches!(result, Err(ChainError::NoRuntime)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_aggregate_length_matches_failures(
        plan in proptest::collection::vec(0u8..3, 0..16)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let target = ops();
        let mut batch = Batch::with_config(ChainConfig::new().with_label("prop"));
        let mut expected = 0usize;
        for step in &plan {
            match step {
                0 => { batch.call(target.clone(), "ok"); }
                1 => { batch.call_with(target.clone(), "fail", json!("x")); expected += 1; }
                _ => { batch.call(target.clone(), "fail_many"); expected += 2; }
            }
        }

        let errors = rt.block_on(batch.finish()).unwrap();
        prop_assert_eq!(errors.map_or(0, |e| e.len()), expected);
    }
}
