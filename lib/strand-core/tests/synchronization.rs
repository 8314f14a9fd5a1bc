use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use strand_core::{sync::DeferredError, Deferred, Io, Outcome, Runtime, Supervisor};

// -- Test infrastructure ------------------------------------------------------------------------------------------

type Events = Arc<Mutex<Vec<&'static str>>>;

fn mark(events: &Events, event: &'static str) -> Io<()> {
    let events = Arc::clone(events);
    Io::delay(move || events.lock().unwrap().push(event))
}

// -- Tests --------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn every_getter_observes_the_single_value() {
    let runtime = Runtime::try_current().unwrap();
    let deferred = Deferred::<u64>::new();

    let getters = (0..8).map(|_| runtime.spawn(deferred.get())).collect::<Vec<_>>();
    let outcome = runtime.run(Io::cede().then(deferred.complete(42))).await;
    assert!(outcome.is_succeeded());

    for getter in getters {
        assert!(matches!(
            runtime.run(getter.join()).await,
            Outcome::Succeeded(Outcome::Succeeded(42))
        ));
    }

    match runtime.run(deferred.complete(7)).await {
        Outcome::Errored(e) => assert!(matches!(e.downcast_ref::<DeferredError>(), Some(DeferredError::AlreadySet))),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(matches!(runtime.run(deferred.get()).await, Outcome::Succeeded(42)));
}

#[tokio::test]
async fn racing_writers_have_exactly_one_winner() {
    let runtime = Runtime::try_current().unwrap();
    let deferred = Deferred::<usize>::new();

    let writers = (0..16).map(|n| deferred.try_complete(n)).collect::<Vec<_>>();
    let outcome = runtime.run(Io::par_sequence(writers)).await;

    let wins = outcome.succeeded().unwrap().into_iter().filter(|won| *won).count();
    assert_eq!(wins, 1);
    assert!(matches!(runtime.run(deferred.try_get()).await, Outcome::Succeeded(Some(_))));
}

#[tokio::test]
async fn canceled_getter_does_not_receive_the_value() {
    let runtime = Runtime::try_current().unwrap();
    let deferred = Deferred::<u64>::new();

    let getter = runtime.spawn(deferred.get());
    let outcome = runtime
        .run(Io::cede().then(getter.cancel()).then(deferred.complete(1)).then(getter.join()))
        .await;
    assert!(matches!(outcome, Outcome::Succeeded(Outcome::Canceled)));
}

#[tokio::test(start_paused = true)]
async fn scope_exit_cancels_running_children_and_keeps_finished_ones() {
    let runtime = Runtime::try_current().unwrap();
    let events = Events::default();
    let slow_started = Deferred::new();

    let slow_events = Arc::clone(&events);
    let program = Supervisor::scope()
        .use_(move |supervisor| {
            let again = supervisor.clone();
            supervisor.supervise(Io::pure(1u32)).flat_map(move |quick| {
                let slow = slow_started
                    .complete(())
                    .then(Io::<u32>::never())
                    .on_cancel(mark(&slow_events, "slow canceled"))
                    .guarantee(mark(&slow_events, "slow finalized"));
                quick
                    .join()
                    .then(again.supervise(slow))
                    .flat_map(move |slow| slow_started.get().map(move |_| (quick, slow, again)))
            })
        })
        .flat_map(|(quick, slow, supervisor)| {
            quick
                .join()
                .both(slow.join())
                .map(move |outcomes| (outcomes, supervisor.active_count()))
        });

    let ((quick, slow), active) = runtime.run(program).await.succeeded().unwrap();
    assert!(matches!(quick, Outcome::Succeeded(1)));
    assert!(slow.is_canceled());
    assert_eq!(active, 0);
    assert_eq!(*events.lock().unwrap(), vec!["slow canceled", "slow finalized"]);
}

#[tokio::test(start_paused = true)]
async fn scope_exit_waits_for_every_child_to_unwind() {
    let runtime = Runtime::try_current().unwrap();
    let events = Events::default();

    let children = Arc::clone(&events);
    let program = Supervisor::scope().use_(move |supervisor| {
        let mut started = Vec::new();
        let mut supervised = Vec::new();
        for label in ["first", "second", "third"] {
            let running = Deferred::new();
            let finalizer = Io::sleep(Duration::from_millis(100)).then(mark(&children, label));
            let child = running.complete(()).then(Io::<()>::never()).on_cancel(finalizer);
            supervised.push(supervisor.supervise(child));
            started.push(running.get());
        }
        Io::par_sequence(supervised).then(Io::par_sequence_discard(started))
    });

    let start = tokio::time::Instant::now();
    assert!(runtime.run(program).await.is_succeeded());

    // Finalizers run concurrently, and the scope waits for all of them.
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_millis(200));
    let mut finished = events.lock().unwrap().clone();
    finished.sort_unstable();
    assert_eq!(finished, vec!["first", "second", "third"]);
}
