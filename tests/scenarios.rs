//! End-to-end scenarios driving the public API the way a host application
//! would: build a workflow, bind it to a foundry, forge it through a smith.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use workflow_forge::{
    ConditionalOperation, DataStrategy, FnOperation, ForEachOperation, ForgeError, ForgeOptions,
    Foundry, InMemoryPersistenceProvider, Middleware, Next, Operation, PersistenceMiddleware,
    PersistenceOptions, Smith, Value, Workflow,
};

fn noop_cancel() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn happy_path_with_output_chaining_and_conditional_branch() {
    let smith = Smith::new(ForgeOptions::builder().enable_output_chaining(true).build().unwrap()).unwrap();
    let foundry = Foundry::new("checkout");

    let validate = Arc::new(FnOperation::new("validate", |input, _f, _c| async move {
        let total = input["total"].as_i64().unwrap_or(0);
        Ok(Value::from(serde_json::json!({ "total": total, "valid": total > 0 })))
    }));
    let apply_discount = ConditionalOperation::new(
        "apply_discount_if_large_order",
        |input, _foundry| input["total"].as_i64().unwrap_or(0) > 100,
        Arc::new(FnOperation::new("apply_discount", |input, _f, _c| async move {
            let total = input["total"].as_i64().unwrap_or(0);
            Ok(Value::from(serde_json::json!({ "total": total - 10 })))
        })),
        Some(Arc::new(FnOperation::new("keep_total", |input, _f, _c| async move { Ok(input) }))),
    );

    let workflow = Workflow::builder("checkout")
        .add_operation(validate)
        .add_operation(Arc::new(apply_discount))
        .build();

    let result = smith
        .forge(
            workflow,
            &foundry,
            Value::from(serde_json::json!({ "total": 150 })),
            &noop_cancel(),
        )
        .await
        .unwrap();

    assert_eq!(result["total"], Value::from(140));
}

#[tokio::test]
async fn compensation_unwinds_completed_steps_in_reverse_order() {
    let smith = Smith::new(ForgeOptions::default()).unwrap();
    let foundry = Foundry::new("order");
    let log = Arc::new(Mutex::new(Vec::new()));

    let step = |name: &'static str, log: Arc<Mutex<Vec<String>>>, fail: bool| -> Arc<dyn Operation> {
        let fwd_log = log.clone();
        let comp_log = log.clone();
        let op = FnOperation::new(name, move |i, _f, _c| {
            let fwd_log = fwd_log.clone();
            async move {
                fwd_log.lock().push(format!("forward:{name}"));
                if fail {
                    Err(ForgeError::NotFound(format!("{name} unavailable")))
                } else {
                    Ok(i)
                }
            }
        })
        .with_compensate(move |_o, _f, _c| {
            let comp_log = comp_log.clone();
            async move {
                comp_log.lock().push(format!("compensate:{name}"));
                Ok(())
            }
        });
        Arc::new(op)
    };

    let workflow = Workflow::builder("reserve_charge_ship")
        .add_operation(step("reserve_inventory", log.clone(), false))
        .add_operation(step("charge_card", log.clone(), false))
        .add_operation(step("dispatch_shipment", log.clone(), true))
        .build();

    let err = smith
        .forge(workflow, &foundry, Value::Null, &noop_cancel())
        .await
        .unwrap_err();

    assert!(matches!(err, ForgeError::OperationFailure { .. }));
    assert_eq!(
        *log.lock(),
        vec![
            "forward:reserve_inventory",
            "forward:charge_card",
            "forward:dispatch_shipment",
            "compensate:charge_card",
            "compensate:reserve_inventory",
        ]
    );
}

#[tokio::test]
async fn a_resumed_run_skips_operations_already_completed_before_restart() {
    let provider = Arc::new(InMemoryPersistenceProvider::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let build_workflow = || {
        let c = calls.clone();
        Workflow::builder("billing")
            .add_operation(Arc::new(FnOperation::new("charge_card", move |i, _f, _c| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(i)
                }
            })))
            .build()
    };

    // First attempt crashes mid-run: only the first of two steps ever runs.
    let first_foundry = Foundry::new("billing-instance");
    first_foundry
        .add_middleware(Arc::new(
            PersistenceMiddleware::new(provider.clone(), PersistenceOptions::default()).unwrap(),
        ))
        .unwrap();
    let smith = Smith::new(ForgeOptions::default()).unwrap();
    smith
        .forge(build_workflow(), &first_foundry, Value::from(1), &noop_cancel())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A fresh process rebuilds the foundry and restores the snapshot before
    // forging the (re-)built workflow again.
    let second_foundry = Foundry::new("billing-instance");
    let persistence =
        PersistenceMiddleware::new(provider.clone(), PersistenceOptions::default()).unwrap();
    let workflow = build_workflow();
    let restored = persistence.restore(&second_foundry, workflow.id).await.unwrap();
    assert!(restored);
    second_foundry
        .add_middleware(Arc::new(
            PersistenceMiddleware::new(provider.clone(), PersistenceOptions::default()).unwrap(),
        ))
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let e = events.clone();
    second_foundry.on_operation_event(move |ev| e.lock().push(format!("{ev:?}")));

    smith
        .forge(workflow, &second_foundry, Value::from(1), &noop_cancel())
        .await
        .unwrap();

    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "resumed run must not re-invoke the already-completed operation"
    );
    assert!(
        events.lock().is_empty(),
        "resumed run must not emit OperationStarted/OperationCompleted for a skipped step"
    );
}

struct TagMiddleware {
    tag: &'static str,
    order: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Middleware for TagMiddleware {
    async fn execute(
        &self,
        _operation: &dyn Operation,
        _foundry: &Foundry,
        input: Value,
        next: Next<'_>,
        _cancel: &CancellationToken,
    ) -> workflow_forge::Result<Value> {
        self.order.lock().push(self.tag);
        next.call(input).await
    }
}

#[tokio::test]
async fn middleware_added_first_wraps_outermost() {
    let foundry = Foundry::new("wrapped");
    let order = Arc::new(Mutex::new(Vec::new()));
    foundry
        .add_middleware(Arc::new(TagMiddleware { tag: "auth", order: order.clone() }))
        .unwrap();
    foundry
        .add_middleware(Arc::new(TagMiddleware { tag: "metrics", order: order.clone() }))
        .unwrap();

    let workflow = Workflow::builder("single_step")
        .add_operation(Arc::new(FnOperation::new("noop", |i, _f, _c| async move { Ok(i) })))
        .build();

    let smith = Smith::new(ForgeOptions::default()).unwrap();
    smith
        .forge(workflow, &foundry, Value::Null, &noop_cancel())
        .await
        .unwrap();

    assert_eq!(*order.lock(), vec!["auth", "metrics"]);
}

#[tokio::test]
async fn for_each_split_enforces_arity_and_respects_concurrency_cap() {
    let foundry = Foundry::new("fanout");
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));

    let make_child = |in_flight: Arc<AtomicUsize>, max_in_flight: Arc<AtomicUsize>| {
        Arc::new(FnOperation::new("charge_item", move |i, _f, _c| {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            }
        })) as Arc<dyn Operation>
    };

    let children = vec![
        make_child(in_flight.clone(), max_in_flight.clone()),
        make_child(in_flight.clone(), max_in_flight.clone()),
        make_child(in_flight.clone(), max_in_flight.clone()),
        make_child(in_flight.clone(), max_in_flight.clone()),
    ];
    let for_each = ForEachOperation::new("charge_all_items", children)
        .with_strategy(DataStrategy::Split)
        .with_concurrency(2);

    let workflow = Workflow::builder("fanout").add_operation(Arc::new(for_each)).build();
    let smith = Smith::new(ForgeOptions::default()).unwrap();

    let ok = smith
        .forge(
            workflow,
            &foundry,
            Value::from(vec![1, 2, 3, 4]),
            &noop_cancel(),
        )
        .await
        .unwrap();
    assert_eq!(ok.as_array().unwrap().len(), 4);
    assert!(max_in_flight.load(Ordering::SeqCst) <= 2);

    // A second run with a mismatched element count fails before any child runs.
    let bad_foundry = Foundry::new("fanout-bad");
    let bad_children = vec![
        make_child(in_flight.clone(), max_in_flight.clone()),
        make_child(in_flight.clone(), max_in_flight.clone()),
    ];
    let bad_for_each = ForEachOperation::new("charge_all_items", bad_children)
        .with_strategy(DataStrategy::Split);
    let bad_workflow = Workflow::builder("fanout_bad")
        .add_operation(Arc::new(bad_for_each))
        .build();
    let err = smith
        .forge(bad_workflow, &bad_foundry, Value::from(vec![1, 2, 3]), &noop_cancel())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ForgeError::OperationFailure { .. }
    ));
}

#[tokio::test]
async fn recovery_coordinator_retries_a_failing_resume_with_backoff() {
    use std::collections::HashMap;
    use uuid::Uuid;
    use workflow_forge::{RecoveryCoordinator, RetryPolicy, Snapshot};

    let provider = Arc::new(InMemoryPersistenceProvider::new());
    {
        use workflow_forge::PersistenceProvider;
        provider
            .save(&Snapshot {
                foundry_key: "abandoned-run".into(),
                workflow_key: "billing".into(),
                execution_id: Uuid::new_v4(),
                properties: HashMap::new(),
                completed_operation_indices: vec![],
                version: 1,
            })
            .await
            .unwrap();
    }

    let coordinator = RecoveryCoordinator::new(
        provider,
        RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        },
        Arc::new(workflow_forge::NullLogger),
    )
    .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    let outcomes = coordinator
        .recover_all(&noop_cancel(), move |_snapshot| {
            let a = a.clone();
            async move {
                let n = a.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ForgeError::NotFound("downstream still unavailable".into()))
                } else {
                    Ok(Value::from("recovered"))
                }
            }
        })
        .await;

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].result.is_ok());
    assert_eq!(outcomes[0].attempts, 3);
}
