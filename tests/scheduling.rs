mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tsumiki::{CollectingMetric, EngineError, ExecutionParameters, TaskErrorKind, Value};

use crate::common::{Fixture, build, id, int, text};

fn sleep(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

#[test]
fn test_wait_cycle_is_a_deadlock() {
    let fixture = Fixture::new();
    let metric = Arc::new(CollectingMetric::new());

    let tasks = fixture.tasks.clone();
    fixture.tasks.define("root", move |ctx, _| Ok(ctx.run_task(id("a"), tasks.factory("a", Value::Null))?));
    let tasks = fixture.tasks.clone();
    fixture.tasks.define("a", move |ctx, _| Ok(ctx.run_task(id("b"), tasks.factory("b", Value::Null))?));
    let tasks = fixture.tasks.clone();
    fixture.tasks.define("b", move |ctx, _| Ok(ctx.run_task(id("a"), tasks.factory("a", Value::Null))?));

    let engine = fixture.engine().with_metric(metric.clone());
    let report = build(&engine, vec![(id("root"), fixture.tasks.factory("root", Value::Null))]);

    let error = report.result(&id("root")).unwrap().as_ref().unwrap_err();
    assert_eq!(error.kind(), TaskErrorKind::Deadlock);
    assert!(report.deadlocked.contains(&id("a")));
    assert!(report.deadlocked.contains(&id("b")));
    assert_eq!(metric.deadlocks().len(), 1);
}

#[test]
fn test_slow_producer_is_not_a_deadlock() {
    let fixture = Fixture::new();
    let tasks = fixture.tasks.clone();
    fixture.tasks.define("consumer", move |ctx, _| {
        let slow = ctx.start_task(id("slow"), tasks.factory("slow", Value::Null))?;
        let also = ctx.start_task(id("also"), tasks.factory("also", Value::Null))?;
        Ok(Value::Array(vec![slow.get()?, also.get()?]))
    });
    let tasks = fixture.tasks.clone();
    fixture.tasks.define("also", move |ctx, _| {
        sleep(20);
        Ok(ctx.run_task(id("slow"), tasks.factory("slow", Value::Null))?)
    });
    fixture.tasks.define("slow", |_, _| {
        sleep(300);
        Ok(text("done"))
    });

    let report = build(&fixture.engine(), vec![(id("consumer"), fixture.tasks.factory("consumer", Value::Null))]);

    assert!(report.is_successful(), "{:?}", report.failed);
    assert!(report.deadlocked.is_empty());
    assert_eq!(report.output(&id("consumer")), Some(&Value::Array(vec![text("done"), text("done")])));
}

#[test]
fn test_waiting_for_unstarted_task_is_illegal() {
    let fixture = Fixture::new();
    fixture.tasks.define("lonely", |ctx, _| {
        let by_id = ctx.get_task_result(&id("ghost")).unwrap_err();
        assert!(by_id.is_illegal_operation());
        Ok(ctx.get_task_future(&id("ghost")).get()?)
    });

    let report = build(&fixture.engine(), vec![(id("lonely"), fixture.tasks.factory("lonely", Value::Null))]);
    let error = report.result(&id("lonely")).unwrap().as_ref().unwrap_err();
    assert!(error.is_illegal_operation());
    assert!(error.to_string().contains("ghost"));
}

#[test]
fn test_waiting_for_unrelated_sibling_is_illegal() {
    let fixture = Fixture::new();
    let tasks = fixture.tasks.clone();
    fixture.tasks.define("parent", move |ctx, _| {
        let slow = ctx.start_task(id("slow"), tasks.factory("slow", Value::Null))?;
        let peeker = ctx.start_task(id("peeker"), tasks.factory("peeker", Value::Null))?;
        let peeked = peeker.get();
        slow.get()?;
        Ok(peeked?)
    });
    fixture.tasks.define("peeker", |ctx, _| Ok(ctx.get_task_result(&id("slow"))?));
    fixture.tasks.define("slow", |_, _| {
        sleep(300);
        Ok(Value::Null)
    });

    let report = build(&fixture.engine(), vec![(id("parent"), fixture.tasks.factory("parent", Value::Null))]);
    assert!(report.result(&id("parent")).unwrap().as_ref().unwrap_err().is_illegal_operation());
    assert!(report.failed.contains_key(&id("peeker")));
    assert!(!report.failed.contains_key(&id("slow")));
}

#[test]
fn test_finished_sibling_may_be_read() {
    let fixture = Fixture::new();
    let tasks = fixture.tasks.clone();
    fixture.tasks.define("parent", move |ctx, _| {
        ctx.run_task(id("first"), tasks.factory("first", int(1)))?;
        Ok(ctx.run_task(id("second"), tasks.factory("second", Value::Null))?)
    });
    fixture.tasks.define("first", |_, state| Ok(state.clone()));
    fixture.tasks.define("second", |ctx, _| Ok(ctx.get_task_result(&id("first"))?));

    let report = build(&fixture.engine(), vec![(id("parent"), fixture.tasks.factory("parent", Value::Null))]);
    assert_eq!(report.output(&id("parent")), Some(&int(1)));
}

#[test]
fn test_producer_missing_from_build_is_not_a_deadlock() {
    let fixture = Fixture::new();
    let metric = Arc::new(CollectingMetric::new());
    let tasks = fixture.tasks.clone();
    fixture.tasks.define("parent", move |ctx, _| {
        ctx.run_task(id("first"), tasks.factory("first", int(1)))?;
        Ok(ctx.run_task(id("second"), tasks.factory("second", Value::Null))?)
    });
    fixture.tasks.define("first", |_, state| Ok(state.clone()));
    fixture.tasks.define("second", |ctx, _| Ok(ctx.get_task_result(&id("first"))?));

    build(&fixture.engine(), vec![(id("parent"), fixture.tasks.factory("parent", Value::Null))]);

    let engine = fixture.engine().with_metric(metric.clone());
    let report = build(&engine, vec![(id("second"), fixture.tasks.factory("second", Value::Null))]);

    assert!(report.was_executed(&id("second")));
    assert!(report.deadlocked.is_empty());
    assert!(metric.deadlocks().is_empty());
    let error = report.result(&id("second")).unwrap().as_ref().unwrap_err();
    assert!(error.is_illegal_operation());
}

#[test]
fn test_waiting_for_itself_is_illegal() {
    let fixture = Fixture::new();
    fixture.tasks.define("selfish", |ctx, _| Ok(ctx.get_task_future(ctx.task_id()).get()?));

    let report = build(&fixture.engine(), vec![(id("selfish"), fixture.tasks.factory("selfish", Value::Null))]);
    assert!(report.result(&id("selfish")).unwrap().as_ref().unwrap_err().is_illegal_operation());
}

#[test]
fn test_short_task_may_not_wait_for_full_task() {
    let fixture = Fixture::new();
    let tasks = fixture.tasks.clone();
    fixture.tasks.define_short("quick", move |ctx, _| {
        Ok(ctx.run_task(id("heavy"), tasks.factory("heavy", Value::Null))?)
    });
    fixture.tasks.define("heavy", |_, _| {
        sleep(200);
        Ok(Value::Null)
    });

    let report = build(&fixture.engine(), vec![(id("quick"), fixture.tasks.factory("quick", Value::Null))]);
    assert!(report.result(&id("quick")).unwrap().as_ref().unwrap_err().is_illegal_operation());
    assert!(report.executed.contains_key(&id("heavy")));
}

#[test]
fn test_short_task_may_wait_for_short_task() {
    let fixture = Fixture::new();
    let tasks = fixture.tasks.clone();
    fixture.tasks.define_short("outer", move |ctx, _| {
        Ok(ctx.run_task(id("inner"), tasks.factory("inner", int(5)))?)
    });
    fixture.tasks.define_short("inner", |_, state| Ok(state.clone()));

    let report = build(&fixture.engine(), vec![(id("outer"), fixture.tasks.factory("outer", Value::Null))]);
    assert_eq!(report.output(&id("outer")), Some(&int(5)));
}

#[test]
fn test_waiting_across_roots_is_illegal() {
    let fixture = Fixture::new();
    fixture.tasks.define("left", |ctx, _| {
        sleep(100);
        Ok(ctx.get_task_future(&id("right")).get()?)
    });
    fixture.tasks.define("right", |_, _| {
        sleep(600);
        Ok(Value::Null)
    });

    let report = build(
        &fixture.engine(),
        vec![
            (id("left"), fixture.tasks.factory("left", Value::Null)),
            (id("right"), fixture.tasks.factory("right", Value::Null)),
        ],
    );

    assert!(report.result(&id("left")).unwrap().as_ref().unwrap_err().is_illegal_operation());
    assert!(report.result(&id("right")).unwrap().is_ok());
}

#[test]
fn test_aborted_execution_keeps_every_error() {
    let fixture = Fixture::new();
    fixture.tasks.define("aborting", |ctx, _| {
        ctx.abort_execution(anyhow::anyhow!("first problem"));
        ctx.abort_execution(anyhow::anyhow!("second problem"));
        Ok(text("ignored"))
    });

    let report = build(&fixture.engine(), vec![(id("aborting"), fixture.tasks.factory("aborting", Value::Null))]);
    let error = report.result(&id("aborting")).unwrap().as_ref().unwrap_err();

    assert_eq!(error.kind(), TaskErrorKind::Execution);
    assert!(error.to_string().contains("first problem"));
    assert_eq!(error.suppressed().len(), 1);
}

#[test]
fn test_panicking_body_fails_the_task() {
    let fixture = Fixture::new();
    fixture.tasks.define("panicky", |_, _| panic!("exploded"));

    let report = build(&fixture.engine(), vec![(id("panicky"), fixture.tasks.factory("panicky", Value::Null))]);
    let error = report.result(&id("panicky")).unwrap().as_ref().unwrap_err();
    assert!(error.to_string().contains("exploded"));
}

#[test]
fn test_standard_io_lock_misuse() {
    let fixture = Fixture::new();
    fixture.tasks.define("printer", |ctx, _| {
        assert!(ctx.release_standard_io_lock().unwrap_err().is_illegal_operation());

        ctx.acquire_standard_io_lock()?;
        assert!(ctx.acquire_standard_io_lock().unwrap_err().is_illegal_operation());
        ctx.println("held");
        ctx.release_standard_io_lock()?;
        Ok(Value::Null)
    });
    fixture.tasks.define("forgetful", |ctx, _| {
        ctx.acquire_standard_io_lock()?;
        Ok(Value::Null)
    });

    let report = build(
        &fixture.engine(),
        vec![
            (id("printer"), fixture.tasks.factory("printer", Value::Null)),
            (id("forgetful"), fixture.tasks.factory("forgetful", Value::Null)),
        ],
    );

    assert!(report.result(&id("printer")).unwrap().is_ok());
    let forgot = report.result(&id("forgetful")).unwrap().as_ref().unwrap_err();
    assert!(forgot.is_illegal_operation());
}

#[test]
fn test_waiting_while_holding_standard_io_is_illegal() {
    let fixture = Fixture::new();
    let tasks = fixture.tasks.clone();
    fixture.tasks.define("holder", move |ctx, _| {
        let child = ctx.start_task(id("child"), tasks.factory("child", Value::Null))?;
        ctx.acquire_standard_io_lock()?;
        let waited = child.get();
        ctx.release_standard_io_lock()?;
        Ok(waited?)
    });
    fixture.tasks.define("child", |_, _| {
        sleep(100);
        Ok(Value::Null)
    });

    let report = build(&fixture.engine(), vec![(id("holder"), fixture.tasks.factory("holder", Value::Null))]);
    assert!(report.result(&id("holder")).unwrap().as_ref().unwrap_err().is_illegal_operation());
}

#[test]
fn test_tokens_bound_concurrency() {
    let fixture = Fixture::new();
    let running = Arc::new(AtomicUsize::new(0));
    let most = Arc::new(AtomicUsize::new(0));

    let tasks = fixture.tasks.clone();
    fixture.tasks.define("spread", move |ctx, _| {
        let futures = (0..6)
            .map(|n| ctx.start_task(id(&format!("work-{n}")), tasks.factory("work", int(n))))
            .collect::<Result<Vec<_>, _>>()?;
        for future in futures {
            future.get()?;
        }
        Ok(Value::Null)
    });
    let (count, peak) = (running.clone(), most.clone());
    fixture.tasks.define_with_tokens("work", 1, move |_, state| {
        let now = count.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        sleep(50);
        count.fetch_sub(1, Ordering::SeqCst);
        Ok(state.clone())
    });
    fixture.tasks.define_with_tokens("greedy", 5, |_, _| Ok(text("alone")));

    let engine = fixture.engine_with(fixture.config().with_token_count(2));
    let report = build(
        &engine,
        vec![
            (id("spread"), fixture.tasks.factory("spread", Value::Null)),
            (id("greedy"), fixture.tasks.factory("greedy", Value::Null)),
        ],
    );

    assert!(report.is_successful(), "{:?}", report.failed);
    assert!(most.load(Ordering::SeqCst) <= 2);
    assert!(engine.tokens().peak() <= 5);
    assert_eq!(engine.tokens().allocated(), 0);
    assert_eq!(report.output(&id("greedy")), Some(&text("alone")));
}

#[test]
fn test_cancel_stops_the_build() {
    let fixture = Fixture::new();
    fixture.tasks.define("endless", |ctx, _| {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !ctx.is_cancelled() && Instant::now() < deadline {
            sleep(10);
        }
        anyhow::bail!("stopped")
    });

    let engine = fixture.engine();
    let report = thread::scope(|scope| {
        let running = scope.spawn(|| build(&engine, vec![(id("endless"), fixture.tasks.factory("endless", Value::Null))]));
        sleep(100);
        engine.cancel();
        running.join().unwrap()
    });

    assert!(!report.is_successful());
    assert!(report.abandoned.is_empty());
}

#[test]
fn test_concurrent_execute_is_rejected() {
    let fixture = Fixture::new();
    fixture.tasks.define("slow", |_, _| {
        sleep(300);
        Ok(Value::Null)
    });

    let engine = fixture.engine();
    thread::scope(|scope| {
        let running = scope.spawn(|| build(&engine, vec![(id("slow"), fixture.tasks.factory("slow", Value::Null))]));
        sleep(50);
        let second = engine.execute(
            vec![(id("slow"), fixture.tasks.factory("slow", Value::Null))],
            ExecutionParameters::new(),
        );
        assert!(matches!(second, Err(EngineError::Busy)));
        assert!(running.join().unwrap().is_successful());
    });
}
