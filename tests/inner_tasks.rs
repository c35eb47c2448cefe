mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tsumiki::{
    InnerTask, InnerTaskFactory, InnerTaskParameters, InvokeCount, PropertySelector, TaskErrorKind, Value,
    inner_task_fn, to_value,
};

use crate::common::{Fixture, build, id, int};

/// Squares the duplicate index, failing on the indices listed in `fail_on`.
#[derive(Serialize, Deserialize)]
struct Square {
    fail_on: Vec<usize>,
}

impl InnerTaskFactory for Square {
    fn tag(&self) -> &'static str {
        "square"
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        to_value(self)
    }

    fn create_task(&self) -> Box<dyn InnerTask> {
        let fail_on = self.fail_on.clone();
        inner_task_fn(move |ctx| {
            let index = ctx.index();
            if fail_on.contains(&index) {
                anyhow::bail!("duplicate {index} refused");
            }
            Ok(int((index * index) as u64))
        })
    }
}

/// Counts duplicates as they start and as they finish.
struct Counted {
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl InnerTaskFactory for Counted {
    fn tag(&self) -> &'static str {
        "counted"
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    fn create_task(&self) -> Box<dyn InnerTask> {
        let started = self.started.clone();
        let finished = self.finished.clone();
        inner_task_fn(move |_| {
            started.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
    }
}

fn integers(values: impl IntoIterator<Item = Value>) -> Vec<u64> {
    let mut integers: Vec<u64> = values
        .into_iter()
        .map(|value| value.as_integer().and_then(|n| u64::try_from(n).ok()).unwrap())
        .collect();
    integers.sort();
    integers
}

#[test]
fn test_duplicates_run_locally() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let parameters = InnerTaskParameters::new()
            .with_duplication_predicate(InvokeCount::new(5))
            .with_max_local_parallelism(2);
        let results = ctx.start_inner_task(Arc::new(Square { fail_on: vec![] }), parameters)?;

        let mut outputs = Vec::new();
        while let Some(result) = results.get_next()? {
            assert_eq!(result.environment, "local");
            outputs.push(result.outcome?);
        }
        Ok(Value::Array(outputs))
    });

    let report = build(&fixture.engine(), vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);
    let Some(Value::Array(outputs)) = report.output(&id("owner")) else {
        panic!("owner failed: {:?}", report.failed);
    };
    assert_eq!(integers(outputs.clone()), [0, 1, 4, 9, 16]);
}

#[test]
fn test_single_invocation_without_predicate() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let results = ctx.start_inner_task(Arc::new(Square { fail_on: vec![] }), InnerTaskParameters::new())?;
        let outputs: Vec<Value> = results.filter_map(|result| result.outcome.ok()).collect();
        Ok(Value::Array(outputs))
    });

    let report = build(&fixture.engine(), vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);
    assert_eq!(report.output(&id("owner")), Some(&Value::Array(vec![int(0)])));
}

#[test]
fn test_duplicate_failures_are_reported_individually() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let parameters = InnerTaskParameters::new().with_duplication_predicate(InvokeCount::new(4));
        let results = ctx.start_inner_task(Arc::new(Square { fail_on: vec![1, 3] }), parameters)?;

        let (mut succeeded, mut failed) = (Vec::new(), 0);
        while let Some(result) = results.get_next()? {
            match result.outcome {
                Ok(value) => succeeded.push(value),
                Err(e) => {
                    assert!(e.to_string().contains("refused"));
                    failed += 1;
                }
            }
        }
        assert_eq!(failed, 2);
        Ok(Value::Array(succeeded))
    });

    let report = build(&fixture.engine(), vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);
    let Some(Value::Array(outputs)) = report.output(&id("owner")) else {
        panic!("owner failed: {:?}", report.failed);
    };
    assert_eq!(integers(outputs.clone()), [0, 4]);
}

#[test]
fn test_cancellable_duplication_stops() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let parameters = InnerTaskParameters::new()
            .with_duplication_predicate(|| true)
            .with_duplication_cancellable(true)
            .with_max_local_parallelism(2);
        let results = ctx.start_inner_task(Arc::new(Square { fail_on: vec![] }), parameters)?;

        let mut count = 0;
        while let Some(result) = results.get_next()? {
            result.outcome?;
            count += 1;
            if count == 3 {
                results.cancel_duplication_optionally();
            }
        }
        Ok(int(count))
    });

    let report = build(&fixture.engine(), vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);
    let count = report.output(&id("owner")).and_then(Value::as_integer).map(u64::try_from);
    let count = count.unwrap().unwrap();
    assert!((3..=5).contains(&count), "{count} duplicates delivered");
}

#[test]
fn test_non_cancellable_duplication_ignores_cancel() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let parameters = InnerTaskParameters::new().with_duplication_predicate(InvokeCount::new(4));
        let results = ctx.start_inner_task(Arc::new(Square { fail_on: vec![] }), parameters)?;

        let mut count = 0;
        while let Some(result) = results.get_next()? {
            result.outcome?;
            results.cancel_duplication_optionally();
            count += 1;
        }
        Ok(int(count))
    });

    let report = build(&fixture.engine(), vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);
    assert_eq!(report.output(&id("owner")), Some(&int(4)));
}

#[test]
fn test_running_duplicates_finish_with_their_task() {
    let fixture = Fixture::new();
    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let (s, f) = (started.clone(), finished.clone());
    fixture.tasks.define("owner", move |ctx, _| {
        let factory = Counted {
            started: s.clone(),
            finished: f.clone(),
        };
        let parameters = InnerTaskParameters::new()
            .with_duplication_predicate(InvokeCount::new(3))
            .with_max_local_parallelism(1);
        ctx.start_inner_task(Arc::new(factory), parameters)?;
        thread::sleep(Duration::from_millis(50));
        Ok(Value::Null)
    });

    let report = build(&fixture.engine(), vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);

    assert!(report.is_successful(), "{:?}", report.failed);
    assert!(started.load(Ordering::SeqCst) >= 1);
    assert_eq!(started.load(Ordering::SeqCst), finished.load(Ordering::SeqCst));
}

#[test]
fn test_unsuitable_environment_fails_the_task() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let selector = PropertySelector::new().require("gpu", Value::Bool(true));
        let parameters = InnerTaskParameters::new().with_environment_selector(Arc::new(selector));
        ctx.start_inner_task(Arc::new(Square { fail_on: vec![] }), parameters)?;
        Ok(Value::Null)
    });

    let report = build(&fixture.engine(), vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);
    let error = report.result(&id("owner")).unwrap().as_ref().unwrap_err();
    assert_eq!(error.kind(), TaskErrorKind::EnvironmentSelection);
}

#[test]
fn test_local_environment_property_selects_local() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let selector = PropertySelector::new().require("gpu", Value::Bool(true));
        let parameters = InnerTaskParameters::new().with_environment_selector(Arc::new(selector));
        let results = ctx.start_inner_task(Arc::new(Square { fail_on: vec![] }), parameters)?;
        let outputs: Vec<Value> = results.filter_map(|result| result.outcome.ok()).collect();
        Ok(Value::Array(outputs))
    });

    let config = fixture.config().with_property("gpu", Value::Bool(true));
    let report = build(
        &fixture.engine_with(config),
        vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))],
    );
    assert_eq!(report.output(&id("owner")), Some(&Value::Array(vec![int(0)])));
}
