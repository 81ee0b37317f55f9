use tideflow::{
    BluePrintSnapshot, BuildError, ChunkError, EventData, Flow, FlowError, HandlerBundle, Value,
};

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

async fn upper(data: EventData) -> Result<Value, ChunkError> {
    Ok(Value::from(
        data.value().as_str().unwrap_or("").to_uppercase(),
    ))
}

async fn exclaim(data: EventData) -> Result<Value, ChunkError> {
    Ok(Value::from(format!(
        "{}!",
        data.value().as_str().unwrap_or("")
    )))
}

fn build_pipeline() -> Flow {
    let flow = Flow::named("pipeline");
    let shout = flow.chunk("upper", upper).unwrap();
    let finish = flow.chunk("exclaim", exclaim).unwrap();
    flow.to_chunk(&shout)
        .unwrap()
        .to_chunk(&finish)
        .unwrap()
        .end()
        .unwrap();
    flow
}

fn bundle() -> HandlerBundle {
    HandlerBundle::new()
        .with_handler("upper", upper)
        .with_handler("exclaim", exclaim)
}

#[tokio::test]
async fn a_flat_snapshot_round_trips_behavior() {
    init_tracing();
    let flow = build_pipeline();
    assert_eq!(flow.start("hi").await.unwrap(), Value::from("HI!"));

    let json = flow.save_blue_print().to_flat_json().unwrap();
    let snapshot = BluePrintSnapshot::from_flat_json(&json).unwrap();
    let loaded = Flow::load_blue_print(&snapshot, &bundle()).unwrap();

    assert_eq!(loaded.name(), "pipeline");
    assert_eq!(loaded.start("hi").await.unwrap(), Value::from("HI!"));
}

#[tokio::test]
async fn a_nested_snapshot_round_trips_behavior() {
    init_tracing();
    let flow = build_pipeline();

    let json = flow.save_blue_print().to_nested_json().unwrap();
    let snapshot = BluePrintSnapshot::from_nested_json(&json).unwrap();
    let loaded = Flow::load_blue_print(&snapshot, &bundle()).unwrap();

    assert_eq!(loaded.start("ok").await.unwrap(), Value::from("OK!"));
}

#[tokio::test]
async fn the_two_formats_describe_the_same_topology() {
    init_tracing();
    let snapshot = build_pipeline().save_blue_print();
    let flat = BluePrintSnapshot::from_flat_json(&snapshot.to_flat_json().unwrap()).unwrap();
    let nested = BluePrintSnapshot::from_nested_json(&snapshot.to_nested_json().unwrap()).unwrap();
    assert_eq!(flat, nested);
}

#[test]
fn loading_without_a_handler_fails_fast() {
    init_tracing();
    let snapshot = build_pipeline().save_blue_print();
    let incomplete = HandlerBundle::new().with_handler("upper", upper);
    match Flow::load_blue_print(&snapshot, &incomplete) {
        Err(BuildError::MissingHandler(name)) => assert_eq!(name, "exclaim"),
        Err(other) => panic!("expected MissingHandler, got {other:?}"),
        Ok(_) => panic!("expected MissingHandler, got a flow"),
    }
}

#[test]
fn a_corrupt_snapshot_fails_validation() {
    init_tracing();
    let mut snapshot = build_pipeline().save_blue_print();
    snapshot.chunks.retain(|name| name != "exclaim");
    let json = snapshot.to_flat_json().unwrap();
    match BluePrintSnapshot::from_flat_json(&json) {
        Err(FlowError::Build(BuildError::UnknownChunk(name))) => assert_eq!(name, "exclaim"),
        other => panic!("expected UnknownChunk, got {other:?}"),
    }
}

#[tokio::test]
async fn an_in_process_copy_can_be_extended_without_leaking_back() {
    init_tracing();
    let base = Flow::named("base");
    let shout = base.chunk("upper", upper).unwrap();
    base.to_chunk(&shout).unwrap();

    let specialized = base.copy();
    specialized
        .when_chunk(&shout)
        .to(exclaim)
        .unwrap()
        .end()
        .unwrap();

    assert_eq!(specialized.start("hi").await.unwrap(), Value::from("HI!"));
    // The base blueprint was not touched by the overlay.
    match base.start("hi").await {
        Err(FlowError::NoResult) => {}
        other => panic!("expected NoResult on the base flow, got {other:?}"),
    }
}

#[test]
fn snapshots_render_to_mermaid() {
    init_tracing();
    let snapshot = build_pipeline().save_blue_print();
    let rendered = tidecore::to_mermaid(&snapshot);
    assert!(rendered.starts_with("flowchart TD"));
    assert!(rendered.contains("chunk:upper"));
    assert!(rendered.contains("chunk:exclaim"));
}
