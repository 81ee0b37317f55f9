use tideflow::{handler, BuildError, ChunkError, CollectMode, EventData, Flow, Value};

async fn passthrough(data: EventData) -> Result<Value, ChunkError> {
    Ok(data.into_value())
}

fn build_err<T>(outcome: Result<T, BuildError>) -> BuildError {
    match outcome {
        Err(error) => error,
        Ok(_) => panic!("expected a build error"),
    }
}

#[test]
fn duplicate_chunk_names_are_rejected() {
    let flow = Flow::new();
    flow.chunk("stage", passthrough).unwrap();
    assert_eq!(
        build_err(flow.chunk("stage", passthrough)),
        BuildError::DuplicateChunk("stage".to_string())
    );
}

#[test]
fn end_inside_an_open_scope_is_rejected() {
    let flow = Flow::new();
    let open = flow.to(passthrough).unwrap().for_each().unwrap();
    assert_eq!(
        build_err(open.end()),
        BuildError::UnclosedScope {
            call: "end",
            scope: "for_each",
        }
    );
}

#[test]
fn terminators_must_match_their_opener() {
    let flow = Flow::new();
    let open = flow.to(passthrough).unwrap().for_each().unwrap();
    assert_eq!(
        build_err(open.end_match()),
        BuildError::UnbalancedScope {
            opener: "match_case",
            closer: "end_match",
        }
    );

    let bare = flow.when_event("x");
    assert_eq!(
        build_err(bare.end_for_each()),
        BuildError::UnbalancedScope {
            opener: "for_each",
            closer: "end_for_each",
        }
    );
}

#[test]
fn a_case_needs_an_open_conditional() {
    let flow = Flow::new();
    let process = flow.to(passthrough).unwrap();
    assert_eq!(
        build_err(process.case("x")),
        BuildError::UnbalancedScope {
            opener: "match_case",
            closer: "case",
        }
    );
}

#[test]
fn chaining_before_the_first_case_is_rejected() {
    let flow = Flow::new();
    let open = flow.to(passthrough).unwrap().match_case().unwrap();
    match build_err(open.to(passthrough)) {
        BuildError::InvalidCall { call: "to", .. } => {}
        other => panic!("expected InvalidCall, got {other:?}"),
    }
}

#[test]
fn a_second_else_is_rejected() {
    let flow = Flow::new();
    let open = flow
        .to(passthrough)
        .unwrap()
        .match_case()
        .unwrap()
        .case_else()
        .unwrap();
    match build_err(open.case_else()) {
        BuildError::InvalidCall {
            call: "case_else", ..
        } => {}
        other => panic!("expected InvalidCall, got {other:?}"),
    }
}

#[test]
fn cases_after_else_are_rejected() {
    let flow = Flow::new();
    let open = flow
        .to(passthrough)
        .unwrap()
        .match_case()
        .unwrap()
        .case_else()
        .unwrap();
    match build_err(open.case("late")) {
        BuildError::InvalidCall { call: "case", .. } => {}
        other => panic!("expected InvalidCall, got {other:?}"),
    }
}

#[test]
fn collect_modes_must_agree_within_a_group() {
    let flow = Flow::new();
    flow.when_event("a")
        .collect("mixed", "x", CollectMode::And)
        .unwrap();
    assert_eq!(
        build_err(
            flow.when_event("b")
                .collect("mixed", "y", CollectMode::FilledThenEmpty)
        ),
        BuildError::CollectModeConflict("mixed".to_string())
    );
}

#[test]
fn duplicate_collect_slots_are_rejected() {
    let flow = Flow::new();
    flow.when_event("a")
        .collect("pair", "x", CollectMode::And)
        .unwrap();
    assert_eq!(
        build_err(flow.when_event("b").collect("pair", "x", CollectMode::And)),
        BuildError::DuplicateSlot {
            group: "pair".to_string(),
            slot: "x".to_string(),
        }
    );
}

#[test]
fn duplicate_batch_branches_are_rejected() {
    let flow = Flow::new();
    let outcome = flow.to(passthrough).unwrap().batch(
        vec![
            ("same", handler(|_d: EventData| async move { Ok(Value::Null) })),
            ("same", handler(|_d: EventData| async move { Ok(Value::Null) })),
        ],
        None,
    );
    assert_eq!(
        build_err(outcome),
        BuildError::DuplicateBranch("same".to_string())
    );
}
