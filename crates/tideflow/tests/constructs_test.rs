use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tideflow::{
    handler, ChunkError, CollectMode, EventData, Flow, FlowError, ForEachOptions, KeyRef,
    TriggerKind, Value, WhenMode,
};

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

async fn passthrough(data: EventData) -> Result<Value, ChunkError> {
    Ok(data.into_value())
}

fn label(text: &'static str) -> impl Fn(EventData) -> futures::future::BoxFuture<'static, Result<Value, ChunkError>> {
    use futures::FutureExt;
    move |_data: EventData| async move { Ok(Value::from(text)) }.boxed()
}

#[tokio::test]
async fn conditional_takes_the_first_matching_case() {
    init_tracing();
    let flow = Flow::new();
    flow.to(passthrough)
        .unwrap()
        .if_eq("hot")
        .unwrap()
        .to(label("fire"))
        .unwrap()
        .elif_eq("cold")
        .unwrap()
        .to(label("ice"))
        .unwrap()
        .else_cond()
        .unwrap()
        .to(label("mild"))
        .unwrap()
        .end_cond()
        .unwrap()
        .end()
        .unwrap();

    assert_eq!(flow.start("hot").await.unwrap(), Value::from("fire"));
    assert_eq!(flow.start("cold").await.unwrap(), Value::from("ice"));
    assert_eq!(flow.start("lukewarm").await.unwrap(), Value::from("mild"));
}

#[tokio::test]
async fn predicate_cases_evaluate_in_declaration_order() {
    init_tracing();
    let flow = Flow::new();
    flow.to(passthrough)
        .unwrap()
        .if_cond(|data: &EventData| data.value().as_f64().is_some_and(|n| n > 10.0))
        .unwrap()
        .to(label("big"))
        .unwrap()
        .elif_cond(|data: &EventData| data.value().as_f64().is_some_and(|n| n > 5.0))
        .unwrap()
        .to(label("medium"))
        .unwrap()
        .end_cond()
        .unwrap()
        .end()
        .unwrap();

    // 20 satisfies both predicates; only the first case fires.
    assert_eq!(flow.start(20i64).await.unwrap(), Value::from("big"));
    assert_eq!(flow.start(7i64).await.unwrap(), Value::from("medium"));
}

#[tokio::test]
async fn conditional_without_else_short_circuits_silently() {
    init_tracing();
    let flow = Flow::new();
    flow.to(passthrough)
        .unwrap()
        .if_eq("known")
        .unwrap()
        .to(label("seen"))
        .unwrap()
        .end_cond()
        .unwrap()
        .end()
        .unwrap();

    match flow.start("unknown").await {
        Err(FlowError::NoResult) => {}
        other => panic!("expected NoResult, got {other:?}"),
    }
}

#[tokio::test]
async fn collect_joins_slots_in_declaration_order() {
    init_tracing();
    let flow = Flow::new();
    flow.to(|data: EventData| async move {
        data.emit("a", 1i64).await;
        data.emit("b", 2i64).await;
        Ok(Value::Null)
    })
    .unwrap();
    flow.when_event("a")
        .collect("pair", "left", CollectMode::And)
        .unwrap()
        .to(passthrough)
        .unwrap()
        .end()
        .unwrap();
    flow.when_event("b")
        .collect("pair", "right", CollectMode::And)
        .unwrap();

    let result = flow.start(Value::Null).await.unwrap();
    assert_eq!(result.keys(), vec!["left", "right"]);
    assert_eq!(result.get("left"), Some(&Value::from(1i64)));
    assert_eq!(result.get("right"), Some(&Value::from(2i64)));
}

#[tokio::test]
async fn filled_then_empty_collect_keeps_loop_rounds_apart() {
    init_tracing();
    let flow = Flow::new();
    flow.to(|data: EventData| async move {
        for i in 0..2i64 {
            data.emit("a", i).await;
            data.emit("b", i * 10).await;
        }
        Ok(Value::Null)
    })
    .unwrap();
    flow.when_event("a")
        .collect("cycle", "x", CollectMode::FilledThenEmpty)
        .unwrap()
        .to(|data: EventData| async move {
            data.append_flow_data("rounds", data.value().clone()).await;
            Ok(Value::Null)
        })
        .unwrap();
    flow.when_event("b")
        .collect("cycle", "y", CollectMode::FilledThenEmpty)
        .unwrap();

    let mut stream = flow.get_runtime_stream(Value::Null, None).unwrap();
    while stream.next().await.is_some() {}

    let rounds = flow.get_flow_data("rounds").unwrap();
    let rounds = rounds.as_array().unwrap();
    assert_eq!(rounds.len(), 2);
    assert_eq!(rounds[0].get("x"), Some(&Value::from(0i64)));
    assert_eq!(rounds[0].get("y"), Some(&Value::from(0i64)));
    assert_eq!(rounds[1].get("x"), Some(&Value::from(1i64)));
    assert_eq!(rounds[1].get("y"), Some(&Value::from(10i64)));
}

#[tokio::test]
async fn and_collect_ignores_refills_after_firing() {
    init_tracing();
    let flow = Flow::new();
    flow.to(|data: EventData| async move {
        data.emit("a", 1i64).await;
        data.emit("b", 2i64).await;
        // A second round must not re-fire an And group.
        data.emit("a", 3i64).await;
        data.emit("b", 4i64).await;
        Ok(Value::Null)
    })
    .unwrap();
    flow.when_event("a")
        .collect("once", "x", CollectMode::And)
        .unwrap()
        .to(|data: EventData| async move {
            data.append_flow_data("fired", data.value().clone()).await;
            Ok(Value::Null)
        })
        .unwrap();
    flow.when_event("b")
        .collect("once", "y", CollectMode::And)
        .unwrap();

    let mut stream = flow.get_runtime_stream(Value::Null, None).unwrap();
    while stream.next().await.is_some() {}

    let fired = flow.get_flow_data("fired").unwrap();
    assert_eq!(fired.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn when_and_fires_once_per_full_round_and_rearms() {
    init_tracing();
    let flow = Flow::new();
    flow.when(
        vec![
            KeyRef {
                kind: TriggerKind::RuntimeData,
                key: "a".to_string(),
            },
            KeyRef {
                kind: TriggerKind::RuntimeData,
                key: "b".to_string(),
            },
        ],
        WhenMode::And,
    )
    .to(|data: EventData| async move {
        data.append_flow_data("fired", data.value().clone()).await;
        Ok(Value::Null)
    })
    .unwrap();

    let execution = flow.create_execution();
    execution.clone().set_runtime_data("a", 1i64).await;
    execution.clone().set_runtime_data("b", 2i64).await;
    // Re-armed: one changed key alone must not fire again.
    execution.clone().set_runtime_data("a", 3i64).await;

    let fired = flow.get_flow_data("fired").unwrap();
    assert_eq!(fired.as_array().unwrap().len(), 1);
    assert_eq!(fired.as_array().unwrap()[0].get("a"), Some(&Value::from(1i64)));
    assert_eq!(fired.as_array().unwrap()[0].get("b"), Some(&Value::from(2i64)));

    execution.clone().set_runtime_data("b", 4i64).await;
    let fired = flow.get_flow_data("fired").unwrap();
    assert_eq!(fired.as_array().unwrap().len(), 2);
    assert_eq!(fired.as_array().unwrap()[1].get("a"), Some(&Value::from(3i64)));
    assert_eq!(fired.as_array().unwrap()[1].get("b"), Some(&Value::from(4i64)));
}

#[tokio::test]
async fn when_or_reports_kind_key_and_value() {
    init_tracing();
    let flow = Flow::new();
    flow.when(
        vec![KeyRef {
            kind: TriggerKind::RuntimeData,
            key: "watched".to_string(),
        }],
        WhenMode::Or,
    )
    .to(passthrough)
    .unwrap()
    .end()
    .unwrap();

    let execution = flow.create_execution();
    execution.clone().set_runtime_data("watched", 5i64).await;

    let fired = execution.try_result().unwrap().unwrap();
    assert_eq!(fired.get("kind"), Some(&Value::from("runtime_data")));
    assert_eq!(fired.get("key"), Some(&Value::from("watched")));
    assert_eq!(fired.get("value"), Some(&Value::from(5i64)));
}

#[tokio::test]
async fn when_simple_or_passes_the_raw_value() {
    init_tracing();
    let flow = Flow::new();
    flow.when(
        vec![KeyRef {
            kind: TriggerKind::RuntimeData,
            key: "watched".to_string(),
        }],
        WhenMode::SimpleOr,
    )
    .to(passthrough)
    .unwrap()
    .end()
    .unwrap();

    let execution = flow.create_execution();
    execution.clone().set_runtime_data("watched", "plain").await;
    assert_eq!(
        execution.try_result().unwrap().unwrap(),
        Value::from("plain")
    );
}

#[tokio::test]
async fn batch_joins_branches_by_declaration_order() {
    init_tracing();
    let flow = Flow::new();
    flow.to(passthrough)
        .unwrap()
        .batch(
            vec![
                (
                    "double",
                    handler(|data: EventData| async move {
                        Ok(Value::from(data.value().as_f64().unwrap_or(0.0) * 2.0))
                    }),
                ),
                (
                    "triple",
                    handler(|data: EventData| async move {
                        Ok(Value::from(data.value().as_f64().unwrap_or(0.0) * 3.0))
                    }),
                ),
                ("tag", handler(|_data: EventData| async move { Ok(Value::from("n")) })),
            ],
            None,
        )
        .unwrap()
        .end()
        .unwrap();

    let result = flow.start(4i64).await.unwrap();
    assert_eq!(result.keys(), vec!["double", "triple", "tag"]);
    assert_eq!(result.get("double"), Some(&Value::from(8.0)));
    assert_eq!(result.get("triple"), Some(&Value::from(12.0)));
    assert_eq!(result.get("tag"), Some(&Value::from("n")));
}

#[tokio::test]
async fn batch_respects_its_concurrency_cap() {
    init_tracing();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tracked = |name: &'static str| {
        let active = active.clone();
        let peak = peak.clone();
        handler(move |_data: EventData| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::from(name))
            }
        })
    };

    let flow = Flow::new();
    flow.to(passthrough)
        .unwrap()
        .batch(
            vec![
                ("a", tracked("a")),
                ("b", tracked("b")),
                ("c", tracked("c")),
                ("d", tracked("d")),
            ],
            Some(2),
        )
        .unwrap()
        .end()
        .unwrap();

    let result = flow.start(Value::Null).await.unwrap();
    assert_eq!(result.keys(), vec!["a", "b", "c", "d"]);
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak was {}", peak.load(Ordering::SeqCst));
}

#[tokio::test]
async fn for_each_sorted_is_stable_under_skewed_delays() {
    init_tracing();
    let flow = Flow::new();
    flow.to(passthrough)
        .unwrap()
        .for_each_with(ForEachOptions {
            with_index: true,
            concurrency: None,
        })
        .unwrap()
        .to(|data: EventData| async move {
            let pair = data.value().as_array().unwrap_or(&[]).to_vec();
            let index = pair[0].as_f64().unwrap_or(0.0) as u64;
            let element = pair[1].as_f64().unwrap_or(0.0);
            // Earlier elements finish later.
            tokio::time::sleep(Duration::from_millis(80 - index * 40)).await;
            Ok(Value::from(element * 10.0))
        })
        .unwrap()
        .end_for_each_sorted()
        .unwrap()
        .end()
        .unwrap();

    let input = Value::Array(vec![Value::from(1i64), Value::from(2i64), Value::from(3i64)]);
    let result = flow.start(input).await.unwrap();
    assert_eq!(
        result,
        Value::Array(vec![Value::from(10.0), Value::from(20.0), Value::from(30.0)])
    );
}

#[tokio::test]
async fn for_each_unsorted_joins_in_completion_order() {
    init_tracing();
    let flow = Flow::new();
    flow.to(passthrough)
        .unwrap()
        .for_each_with(ForEachOptions {
            with_index: true,
            concurrency: None,
        })
        .unwrap()
        .to(|data: EventData| async move {
            let pair = data.value().as_array().unwrap_or(&[]).to_vec();
            let index = pair[0].as_f64().unwrap_or(0.0) as u64;
            tokio::time::sleep(Duration::from_millis(index * 60)).await;
            Ok(pair[1].clone())
        })
        .unwrap()
        .end_for_each()
        .unwrap()
        .end()
        .unwrap();

    let input = Value::Array(vec![Value::from("slowest"), Value::from("middle"), Value::from("last")]);
    let result = flow.start(input).await.unwrap();
    // Delays grow with the index, so completion order equals element order
    // here; the point is that nothing re-sorts them.
    assert_eq!(
        result,
        Value::Array(vec![Value::from("slowest"), Value::from("middle"), Value::from("last")])
    );
}

#[tokio::test]
async fn for_each_respects_its_concurrency_cap() {
    init_tracing();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let flow = Flow::new();
    let body_active = active.clone();
    let body_peak = peak.clone();
    flow.to(passthrough)
        .unwrap()
        .for_each_with(ForEachOptions {
            with_index: false,
            concurrency: Some(2),
        })
        .unwrap()
        .to(move |data: EventData| {
            let active = body_active.clone();
            let peak = body_peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(data.into_value())
            }
        })
        .unwrap()
        .end_for_each_sorted()
        .unwrap()
        .end()
        .unwrap();

    let input = Value::Array((0..6i64).map(Value::from).collect());
    let result = flow.start(input.clone()).await.unwrap();
    assert_eq!(result, input);
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak was {}", peak.load(Ordering::SeqCst));
}

#[tokio::test]
async fn for_each_over_an_empty_array_joins_immediately() {
    init_tracing();
    let flow = Flow::new();
    flow.to(passthrough)
        .unwrap()
        .for_each()
        .unwrap()
        .to(|_data: EventData| async move { Ok(Value::from("never")) })
        .unwrap()
        .end_for_each()
        .unwrap()
        .end()
        .unwrap();

    let result = flow.start(Value::Array(Vec::new())).await.unwrap();
    assert_eq!(result, Value::Array(Vec::new()));
}

#[tokio::test]
async fn for_each_treats_a_single_value_as_one_element() {
    init_tracing();
    let flow = Flow::new();
    flow.to(passthrough)
        .unwrap()
        .for_each()
        .unwrap()
        .to(|data: EventData| async move {
            Ok(Value::from(data.value().as_f64().unwrap_or(0.0) + 1.0))
        })
        .unwrap()
        .end_for_each()
        .unwrap()
        .end()
        .unwrap();

    let result = flow.start(5i64).await.unwrap();
    assert_eq!(result, Value::Array(vec![Value::from(6.0)]));
}

#[tokio::test]
async fn nested_for_each_keeps_rounds_apart() {
    init_tracing();
    let flow = Flow::new();
    flow.to(passthrough)
        .unwrap()
        .for_each()
        .unwrap()
        .for_each()
        .unwrap()
        .to(|data: EventData| async move {
            Ok(Value::from(data.value().as_f64().unwrap_or(0.0) + 1.0))
        })
        .unwrap()
        .end_for_each_sorted()
        .unwrap()
        .end_for_each_sorted()
        .unwrap()
        .end()
        .unwrap();

    let input = Value::Array(vec![
        Value::Array(vec![Value::from(1i64), Value::from(2i64)]),
        Value::Array(vec![Value::from(3i64)]),
    ]);
    let result = flow.start(input).await.unwrap();
    assert_eq!(
        result,
        Value::Array(vec![
            Value::Array(vec![Value::from(2.0), Value::from(3.0)]),
            Value::Array(vec![Value::from(4.0)]),
        ])
    );
}
