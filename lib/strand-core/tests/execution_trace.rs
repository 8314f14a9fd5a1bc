use strand_core::{trace::TraceKind, Io, Outcome, Resource, Runtime, RuntimeConfiguration};
use tokio::runtime::Handle;

// -- Test infrastructure ------------------------------------------------------------------------------------------

fn traced_runtime(capacity: usize) -> Runtime {
    let config = RuntimeConfiguration::default()
        .with_tracing(true)
        .with_trace_buffer_capacity(capacity);
    Runtime::from_handle(Handle::current(), config)
}

// -- Tests --------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn trace_records_each_map() {
    let runtime = traced_runtime(16);

    let program = Io::pure(0).map(|v| v + 1).map(|v| v * 2).flat_map(|_| Io::trace());
    let trace = runtime.run(program).await.succeeded().unwrap();

    assert_eq!(trace.count_of(TraceKind::Map), 2);
    assert_eq!(trace.count_of(TraceKind::Bind), 1);
    assert_eq!(trace.count_of(TraceKind::Pure), 1);
    assert!(trace
        .frames()
        .iter()
        .all(|frame| frame.location().file().ends_with("execution_trace.rs")));
}

#[tokio::test]
async fn trace_is_empty_when_disabled() {
    let runtime = Runtime::try_current().unwrap();

    let program = Io::pure(0).map(|v| v + 1).flat_map(|_| Io::trace());
    let trace = runtime.run(program).await.succeeded().unwrap();

    assert!(trace.frames().is_empty());
    assert_eq!(trace.captured(), 0);
}

#[tokio::test]
async fn buffer_keeps_the_most_recent_frames() {
    let runtime = traced_runtime(4);

    let program = (0..10)
        .fold(Io::pure(0u32), |io, _| io.map(|v| v + 1))
        .flat_map(|_| Io::trace());
    let trace = runtime.run(program).await.succeeded().unwrap();

    assert_eq!(trace.frames().len(), 4);
    assert_eq!(trace.captured(), 12);
    assert_eq!(trace.omitted(), 8);
    assert_eq!(trace.count_of(TraceKind::Map), 3);
    assert_eq!(trace.frames().last().map(|frame| frame.kind()), Some(TraceKind::Bind));
}

#[tokio::test]
async fn finished_fiber_exposes_its_trace() {
    let runtime = traced_runtime(16);

    let resource = Resource::make(Io::pure(5), |_| Io::unit());
    let fiber = runtime.spawn(resource.use_(|v| Io::delay(move || v * 2)));

    let outcome = runtime.run(fiber.join()).await;
    assert!(matches!(outcome, Outcome::Succeeded(Outcome::Succeeded(10))));

    let trace = fiber.trace().unwrap();
    assert_eq!(trace.count_of(TraceKind::Acquire), 1);
    assert_eq!(trace.count_of(TraceKind::Release), 1);
    assert_eq!(trace.count_of(TraceKind::Delay), 1);
}

#[tokio::test]
async fn spawned_fiber_trace_counts_only_its_own_frames() {
    let runtime = traced_runtime(16);

    let fiber = runtime.spawn(Io::pure(0).map(|v| v + 1).map(|v| v + 1));
    let outcome = runtime.run(fiber.join()).await;
    assert!(matches!(outcome, Outcome::Succeeded(Outcome::Succeeded(2))));

    let trace = fiber.trace().unwrap();
    assert_eq!(trace.captured(), 3);
    assert_eq!(trace.omitted(), 0);
    assert_eq!(trace.count_of(TraceKind::Map), 2);
    assert_eq!(trace.count_of(TraceKind::Pure), 1);
}
