mod common;

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tsumiki::cluster::protocol::{PROTOCOL_VERSION, Request, Response, read_frame, write_frame};
use tsumiki::{
    BuildEngine, ClusterConnection, ClusterServer, CodecRegistry, EnvironmentProperties, InnerTask, InnerTaskFactory,
    InnerTaskParameters, InvokeCount, PropertySelector, TaskContext, TaskErrorKind, Value, inner_task_fn, to_value,
};

use crate::common::{Fixture, build, id, int};

#[derive(Serialize, Deserialize)]
struct Cube;

impl InnerTaskFactory for Cube {
    fn tag(&self) -> &'static str {
        "cube"
    }

    fn snapshot(&self) -> anyhow::Result<Value> {
        to_value(self)
    }

    fn create_task(&self) -> Box<dyn InnerTask> {
        inner_task_fn(|ctx| {
            let index = ctx.index() as u64;
            Ok(Value::Array(vec![
                Value::Text(ctx.environment_name().to_owned()),
                int(index * index * index),
            ]))
        })
    }
}

/// Starts a real remote publishing `gpu = true`.
fn remote(capacity: usize) -> SocketAddr {
    let mut registry = CodecRegistry::new();
    registry.register_inner_factory::<Cube>("cube");
    let environment = EnvironmentProperties::new().with("gpu", Value::Bool(true));
    let server = Arc::new(ClusterServer::new("remote-a", environment, registry, capacity));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    server.serve(listener);
    address
}

/// A remote that completes the handshake and negotiation, then hangs up on
/// the first duplicate it is asked to run.
fn vanishing_remote(environment: EnvironmentProperties) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();

    std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = stream.try_clone().unwrap();
        let mut writer = stream;

        while let Ok(Some(request)) = read_frame::<_, Request>(&mut reader) {
            let response = match request {
                Request::Hello { .. } => Response::Welcome {
                    version: PROTOCOL_VERSION,
                    name: "remote-b".into(),
                    environment: environment.clone(),
                    capacity: 1,
                },
                Request::Negotiate { call, requested } => Response::Negotiated {
                    call,
                    accepted: requested.min(1),
                },
                _ => break,
            };
            write_frame(&mut writer, &response).unwrap();
        }
    });

    address
}

/// Runs four duplicates and returns `[environment, cube]` pairs sorted by
/// cube, failing on the first failed duplicate.
fn collect_cubes(ctx: &TaskContext, parameters: InnerTaskParameters) -> anyhow::Result<Value> {
    let parameters = parameters.with_duplication_predicate(InvokeCount::new(4));
    let results = ctx.start_inner_task(Arc::new(Cube), parameters)?;

    let mut outputs = Vec::new();
    while let Some(result) = results.get_next()? {
        outputs.push(result.outcome?);
    }
    outputs.sort_by_key(|pair| pair.as_array().and_then(|pair| pair[1].as_integer()).map(i128::from));
    Ok(Value::Array(outputs))
}

fn environments(output: &Value) -> Vec<String> {
    let pairs = output.as_array().unwrap();
    pairs.iter().map(|pair| pair.as_array().unwrap()[0].as_text().unwrap().to_owned()).collect()
}

fn cubes(output: &Value) -> Vec<Value> {
    let pairs = output.as_array().unwrap();
    pairs.iter().map(|pair| pair.as_array().unwrap()[1].clone()).collect()
}

fn engine_with_remote(fixture: &Fixture, address: SocketAddr) -> BuildEngine {
    let mut engine = fixture.engine();
    engine.add_invoker(Arc::new(ClusterConnection::connect(address).unwrap()));
    engine
}

#[test]
fn test_duplicates_run_on_selected_remote() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let selector = PropertySelector::new().require("gpu", Value::Bool(true));
        let parameters = InnerTaskParameters::new()
            .with_environment_selector(Arc::new(selector))
            .with_cluster_duplicate_factor(2);
        collect_cubes(ctx, parameters)
    });

    let engine = engine_with_remote(&fixture, remote(2));
    let report = build(&engine, vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);

    let output = report.output(&id("owner")).unwrap_or_else(|| panic!("{:?}", report.failed));
    assert_eq!(environments(output), ["remote-a"; 4]);
    assert_eq!(cubes(output), [int(0), int(1), int(8), int(27)]);
}

#[test]
fn test_cluster_and_local_share_duplicates() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let parameters = InnerTaskParameters::new()
            .with_cluster_duplicate_factor(1)
            .with_max_local_parallelism(1);
        collect_cubes(ctx, parameters)
    });

    let engine = engine_with_remote(&fixture, remote(1));
    let report = build(&engine, vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);

    let output = report.output(&id("owner")).unwrap_or_else(|| panic!("{:?}", report.failed));
    assert_eq!(cubes(output), [int(0), int(1), int(8), int(27)]);
    assert!(
        environments(output)
            .iter()
            .all(|name| name == "local" || name == "remote-a")
    );
}

#[test]
fn test_zero_factor_keeps_work_local() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| collect_cubes(ctx, InnerTaskParameters::new()));

    let engine = engine_with_remote(&fixture, remote(2));
    let report = build(&engine, vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);

    let output = report.output(&id("owner")).unwrap_or_else(|| panic!("{:?}", report.failed));
    assert_eq!(environments(output), ["local"; 4]);
}

#[test]
fn test_lost_remote_falls_back_to_local() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let parameters = InnerTaskParameters::new()
            .with_cluster_duplicate_factor(1)
            .with_max_local_parallelism(1);
        collect_cubes(ctx, parameters)
    });

    let engine = engine_with_remote(&fixture, vanishing_remote(EnvironmentProperties::new()));
    let report = build(&engine, vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);

    let output = report.output(&id("owner")).unwrap_or_else(|| panic!("{:?}", report.failed));
    assert_eq!(environments(output), ["local"; 4]);
    assert_eq!(cubes(output), [int(0), int(1), int(8), int(27)]);
}

#[test]
fn test_lost_remote_fails_cluster_only_work() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let parameters = InnerTaskParameters::new()
            .with_cluster_duplicate_factor(1)
            .with_allow_local(false);
        collect_cubes(ctx, parameters)
    });

    let engine = engine_with_remote(&fixture, vanishing_remote(EnvironmentProperties::new()));
    let report = build(&engine, vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);

    let error = report.result(&id("owner")).unwrap().as_ref().unwrap_err();
    assert_eq!(error.kind(), TaskErrorKind::Cluster);
    assert!(error.to_string().contains("remote-b"));
}

#[test]
fn test_no_environment_at_all_is_a_selection_failure() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let parameters = InnerTaskParameters::new()
            .with_cluster_duplicate_factor(1)
            .with_allow_local(false);
        collect_cubes(ctx, parameters)
    });

    let report = build(&fixture.engine(), vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);

    let error = report.result(&id("owner")).unwrap().as_ref().unwrap_err();
    assert_eq!(error.kind(), TaskErrorKind::EnvironmentSelection);
}

#[test]
fn test_lost_remote_does_not_fall_back_to_rejected_local() {
    let fixture = Fixture::new();
    fixture.tasks.define("owner", |ctx, _| {
        let selector = PropertySelector::new().require("gpu", Value::Bool(true));
        let parameters = InnerTaskParameters::new()
            .with_environment_selector(Arc::new(selector))
            .with_cluster_duplicate_factor(1);
        collect_cubes(ctx, parameters)
    });

    let gpu = EnvironmentProperties::new().with("gpu", Value::Bool(true));
    let engine = engine_with_remote(&fixture, vanishing_remote(gpu));
    let report = build(&engine, vec![(id("owner"), fixture.tasks.factory("owner", Value::Null))]);

    let error = report.result(&id("owner")).unwrap().as_ref().unwrap_err();
    assert_eq!(error.kind(), TaskErrorKind::Cluster);
    assert!(error.to_string().contains("remote-b"));
}

