//! Integration tests for the dispatcher over thread workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::Context as _;
use serde_json::json;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;
use tracing_subscriber::registry::LookupSpan;

use taskpool::demo::{self, Calc};
use taskpool::{
    Component, ComponentRegistry, DispatchError, PoolStats, SlotReuse, Strategy, TaskDispatcher,
    TerminationPolicy, TerminationReason,
};

fn calc_pool(workers: usize) -> TaskDispatcher {
    TaskDispatcher::new(Strategy::threads(workers, demo::registry), demo::registry())
}

/// Poll pool stats until `done` holds.
async fn wait_for(dispatcher: &TaskDispatcher, done: impl Fn(&PoolStats) -> bool) -> PoolStats {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let stats = dispatcher.stats().await.unwrap();
            if done(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pool did not reach the expected state")
}

#[tokio::test]
async fn test_plus_and_async_plus() {
    let dispatcher = calc_pool(2);
    dispatcher.start().unwrap();

    let sum: i64 = dispatcher
        .run_task::<Calc, _>("plus", (3, 4))
        .unwrap()
        .decode()
        .await
        .unwrap();
    assert_eq!(sum, 7);

    let sum = dispatcher
        .run_task::<Calc, _>("async_plus", (5, 7))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(sum, json!(12));

    dispatcher.terminate();
}

#[tokio::test]
async fn test_method_error_is_reconstructed() {
    let dispatcher = calc_pool(1);
    dispatcher.start().unwrap();

    let err = dispatcher
        .run_task::<Calc, _>("throw_error", ())
        .unwrap()
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "test error");
    assert_eq!(err.task_error().unwrap().message, "test error");
    assert!(!err.is_crash());

    // The worker survives a failing method
    let sum = dispatcher.run_task::<Calc, _>("plus", (1, 1)).unwrap().await.unwrap();
    assert_eq!(sum, json!(2));

    dispatcher.terminate();
}

#[tokio::test]
async fn test_unknown_method_and_bad_arguments() {
    let dispatcher = calc_pool(1);
    dispatcher.start().unwrap();

    let err = dispatcher
        .run_task::<Calc, _>("divide", (1, 2))
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("divide"));

    let err = dispatcher
        .run_task::<Calc, _>("plus", "three")
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Invalid arguments"));

    dispatcher.terminate();
}

#[tokio::test]
async fn test_unregistered_type_fails_synchronously() {
    struct PlainObject;

    let dispatcher = calc_pool(1);
    dispatcher.start().unwrap();
    let before = wait_for(&dispatcher, |s| s.idle == 1).await;

    let err = dispatcher
        .run_task::<PlainObject, _>("plus", (1, 2))
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotAComponent(_)));
    assert_eq!(err.to_string(), "PlainObject is not a registered component");

    // No slot was taken and no task was counted
    let after = dispatcher.stats().await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.worker_count, 1);
    assert_eq!(after.idle, 1);
    assert_eq!(after.busy, 0);
    assert_eq!(after.pending, 0);
    assert_eq!(after.completed + after.failed, 0);

    dispatcher.terminate();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_call_waits_for_the_only_worker() {
    let dispatcher = calc_pool(1);
    dispatcher.start().unwrap();
    wait_for(&dispatcher, |s| s.idle == 1).await;

    let first = dispatcher
        .run_task::<Calc, _>("slow_plus", (1, 2, 200))
        .unwrap();
    let second = dispatcher.run_task::<Calc, _>("plus", (3, 4)).unwrap();

    let stats = dispatcher.stats().await.unwrap();
    assert_eq!(stats.busy, 1);
    assert_eq!(stats.pending, 1);

    let order = Arc::new(Mutex::new(Vec::new()));
    let awaiters: Vec<_> = [second, first]
        .into_iter()
        .map(|task| {
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let value: i64 = task.decode().await.unwrap();
                order.lock().unwrap().push(value);
            })
        })
        .collect();
    for awaiter in awaiters {
        awaiter.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![3, 7]);
    dispatcher.terminate();
}

static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
static MAX_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

struct Probe;

fn probe_registry() -> ComponentRegistry {
    demo::registry().with(Component::new("probe", || Probe).async_method(
        "work",
        |_: Arc<Probe>, (i,): (usize,)| async move {
            let now = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
            MAX_IN_FLIGHT.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
            anyhow::Ok(i)
        },
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hundred_tasks_on_four_workers() {
    let dispatcher = TaskDispatcher::new(Strategy::threads(4, probe_registry), probe_registry());
    dispatcher.start().unwrap();

    let tasks: Vec<_> = (0..100)
        .map(|i| dispatcher.run_task::<Probe, _>("work", (i,)).unwrap())
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), json!(i));
    }

    let max = MAX_IN_FLIGHT.load(Ordering::SeqCst);
    assert!((1..=4).contains(&max), "saw {} tasks in flight", max);

    let stats = dispatcher.stats().await.unwrap();
    assert_eq!(stats.completed, 100);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.worker_count, 4);

    dispatcher.terminate();
}

#[tokio::test]
async fn test_tasks_submitted_before_ready_are_buffered() {
    let dispatcher = calc_pool(2);
    dispatcher.start().unwrap();

    // Submitted immediately, before any worker has signalled ready
    let tasks: Vec<_> = (0..10)
        .map(|i| dispatcher.run_task::<Calc, _>("plus", (i, i)).unwrap())
        .collect();
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), json!(2 * i));
    }

    dispatcher.terminate();
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
    let dispatcher = calc_pool(2);
    dispatcher.start().unwrap();

    let err = dispatcher
        .run_task::<Calc, _>("crash", ())
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.is_crash());
    match err {
        DispatchError::WorkerCrashed { reason, .. } => {
            assert_eq!(
                reason,
                TerminationReason::Panicked("calc worker crashed on purpose".into())
            );
        }
        other => panic!("expected crash, got {other:?}"),
    }

    let tasks: Vec<_> = (0..10)
        .map(|i| dispatcher.run_task::<Calc, _>("plus", (i, 1)).unwrap())
        .collect();
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), json!(i + 1));
    }

    let stats = wait_for(&dispatcher, |s| s.worker_count == 2 && s.starting == 0).await;
    assert_eq!(stats.crashed, 1);
    assert_eq!(stats.respawned, 1);

    dispatcher.terminate();
}

#[tokio::test]
async fn test_terminate_never_fails() {
    let dispatcher = calc_pool(2);
    dispatcher.terminate();
    assert!(matches!(dispatcher.start(), Err(DispatchError::Terminated)));

    let dispatcher = calc_pool(2);
    dispatcher.start().unwrap();
    dispatcher.terminate();
    dispatcher.terminate();

    let err = dispatcher.run_task::<Calc, _>("plus", (1, 2)).unwrap_err();
    assert!(matches!(err, DispatchError::Terminated));
}

#[tokio::test]
async fn test_reject_policy_settles_everything() {
    let dispatcher = calc_pool(1);
    dispatcher.start().unwrap();
    wait_for(&dispatcher, |s| s.idle == 1).await;

    let running = dispatcher
        .run_task::<Calc, _>("slow_plus", (1, 1, 2_000))
        .unwrap();
    let queued = dispatcher.run_task::<Calc, _>("plus", (2, 2)).unwrap();
    wait_for(&dispatcher, |s| s.busy == 1 && s.pending == 1).await;

    dispatcher.terminate();

    let outcome = tokio::time::timeout(Duration::from_secs(1), async {
        (running.await, queued.await)
    })
    .await
    .expect("terminate should settle unsettled tasks promptly");
    assert!(matches!(outcome.0, Err(DispatchError::Terminated)));
    assert!(matches!(outcome.1, Err(DispatchError::Terminated)));
}

#[tokio::test]
async fn test_drain_policy_finishes_accepted_tasks() {
    let strategy =
        Strategy::threads(1, demo::registry).with_termination_policy(TerminationPolicy::Drain);
    let dispatcher = TaskDispatcher::new(strategy, demo::registry());
    dispatcher.start().unwrap();

    let tasks: Vec<_> = (0..3)
        .map(|i| {
            dispatcher
                .run_task::<Calc, _>("slow_plus", (i, 10, 20))
                .unwrap()
        })
        .collect();
    dispatcher.terminate();
    assert!(matches!(
        dispatcher.run_task::<Calc, _>("plus", (1, 1)),
        Err(DispatchError::Terminated)
    ));

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), json!(i + 10));
    }

    // Workers exit once the drain completes
    wait_for(&dispatcher, |s| s.worker_count == 0).await;
}

#[tokio::test]
async fn test_abandon_policy_leaves_tasks_pending() {
    let strategy =
        Strategy::threads(1, demo::registry).with_termination_policy(TerminationPolicy::Abandon);
    let dispatcher = TaskDispatcher::new(strategy, demo::registry());
    dispatcher.start().unwrap();

    let mut running = dispatcher
        .run_task::<Calc, _>("slow_plus", (1, 1, 200))
        .unwrap();
    let mut queued = dispatcher.run_task::<Calc, _>("plus", (2, 2)).unwrap();
    dispatcher.terminate();

    let waited = tokio::time::timeout(Duration::from_millis(400), &mut running).await;
    assert!(waited.is_err(), "abandoned task should stay pending");
    let waited = tokio::time::timeout(Duration::from_millis(50), &mut queued).await;
    assert!(waited.is_err(), "abandoned task should stay pending");

    // Dropping the last handle shuts the coordinator down
    drop(dispatcher);
    assert!(matches!(running.await, Err(DispatchError::Terminated)));
    assert!(matches!(queued.await, Err(DispatchError::Terminated)));
}

#[tokio::test]
async fn test_task_timeout_replaces_worker() {
    let strategy =
        Strategy::threads(1, demo::registry).with_task_timeout(Duration::from_millis(100));
    let dispatcher = TaskDispatcher::new(strategy, demo::registry());
    dispatcher.start().unwrap();

    let err = dispatcher
        .run_task::<Calc, _>("slow_plus", (1, 1, 5_000))
        .unwrap()
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::TimedOut(d) if d == Duration::from_millis(100)));

    let sum = dispatcher.run_task::<Calc, _>("plus", (3, 4)).unwrap().await.unwrap();
    assert_eq!(sum, json!(7));

    let stats = dispatcher.stats().await.unwrap();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.worker_count, 1);

    dispatcher.terminate();
}

async fn sequential_workers(reuse: SlotReuse) -> Vec<String> {
    let strategy = Strategy::threads(3, demo::registry).with_slot_reuse(reuse);
    let dispatcher = TaskDispatcher::new(strategy, demo::registry());
    dispatcher.start().unwrap();
    wait_for(&dispatcher, |s| s.idle == 3).await;

    let mut seen = Vec::new();
    for _ in 0..6 {
        let who: String = dispatcher
            .run_task::<Calc, _>("whoami", ())
            .unwrap()
            .decode()
            .await
            .unwrap();
        seen.push(who);
    }
    dispatcher.terminate();
    seen
}

#[tokio::test]
async fn test_most_recent_reuse_keeps_one_worker_hot() {
    let mut seen = sequential_workers(SlotReuse::MostRecent).await;
    seen.dedup();
    assert_eq!(seen.len(), 1, "expected a single worker, saw {seen:?}");
}

#[tokio::test]
async fn test_least_recent_reuse_rotates() {
    let seen = sequential_workers(SlotReuse::LeastRecent).await;
    let mut distinct = seen.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 3, "expected rotation, saw {seen:?}");
    assert_eq!(seen[0], seen[3]);
}

struct Relay {
    dispatcher: Arc<OnceLock<TaskDispatcher>>,
}

fn relay_registry(dispatcher: Arc<OnceLock<TaskDispatcher>>) -> ComponentRegistry {
    demo::registry().with(
        Component::new("relay", move || Relay {
            dispatcher: Arc::clone(&dispatcher),
        })
        .async_method("plus_times_ten", |relay: Arc<Relay>, (a, b): (i64, i64)| async move {
            let dispatcher = relay
                .dispatcher
                .get()
                .cloned()
                .context("dispatcher not wired")?;
            let sum: i64 = dispatcher.run_task::<Calc, _>("plus", (a, b))?.decode().await?;
            anyhow::Ok(sum * 10)
        }),
    )
}

#[tokio::test]
async fn test_call_from_inside_a_worker_runs_in_place() {
    let slot = Arc::new(OnceLock::new());
    let factory_slot = Arc::clone(&slot);
    let strategy = Strategy::threads(1, move || relay_registry(Arc::clone(&factory_slot)));
    let dispatcher = TaskDispatcher::new(strategy, relay_registry(Arc::clone(&slot)));
    slot.set(dispatcher.clone()).unwrap();
    dispatcher.start().unwrap();

    // One worker: a nested call routed through the pool would wait forever
    let value = tokio::time::timeout(
        Duration::from_secs(5),
        dispatcher
            .run_task_by_id("relay", "plus_times_ten", (2, 3))
            .unwrap(),
    )
    .await
    .expect("nested call deadlocked")
    .unwrap();
    assert_eq!(value, json!(50));

    dispatcher.terminate();
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

/// Records the span names around every "Task completed" event.
struct CompletionSpans(Arc<Mutex<Vec<String>>>);

impl<S> Layer<S> for CompletionSpans
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if visitor.0 != "Task completed" {
            return;
        }
        if let Some(scope) = ctx.event_scope(event) {
            let mut seen = self.0.lock().unwrap();
            seen.extend(scope.from_root().map(|span| span.name().to_string()));
        }
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_completion_is_logged_in_callers_span() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::registry().with(CompletionSpans(Arc::clone(&seen)));
    let _guard = tracing::subscriber::set_default(subscriber);

    let dispatcher = calc_pool(1);
    dispatcher.start().unwrap();

    let request = tracing::info_span!("client_request", id = 42);
    let task = request
        .in_scope(|| dispatcher.run_task::<Calc, _>("plus", (1, 2)))
        .unwrap();
    drop(request);
    assert_eq!(task.await.unwrap(), json!(3));
    dispatcher.terminate();

    assert!(
        seen.lock().unwrap().iter().any(|name| name == "client_request"),
        "completion was not logged inside the caller's span"
    );
}
