#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod cluster;
mod codec;
mod config;
mod content;
mod core;
mod detector;
mod engine;
mod environment;
mod error;
#[cfg(feature = "logging")]
pub mod logging;
mod metric;
mod task;

pub use crate::cluster::{ClusterConnection, ClusterServer, RemoteOutcome, TaskInvoker};
pub use crate::codec::{CodecRegistry, DescriptorCodec, Snapshot};
pub use crate::config::{ENV_TOKEN_COUNT, ENV_WORKER_THREADS, EngineConfig};
pub use crate::content::{ContentDescriptor, ContentProvider, FileKind, FileState, FingerprintPolicy, LocalFiles};
pub use crate::core::{BuildStamp, Hash32, TaskIdentifier, Value, from_value, to_value};
pub use crate::detector::{AlwaysChanged, EqualityDetector, NeverChanged, TaskOutputChangeDetector};
pub use crate::engine::{
    BuildEngine, BuildReport, ComputationToken, InnerTaskContext, InnerTaskParameters, InnerTaskResult,
    InnerTaskResults, RerunReason, TaskContext, TaskDependencyFuture, TaskFuture, TokenPool,
};
pub use crate::environment::{
    EnvironmentProperties, EnvironmentProperty, EnvironmentSelection, EnvironmentSelector, EnvironmentValue,
    ExecutionParameter, ExecutionParameters, ExecutionProperty, PropertyOutcome, PropertySelector, Qualifiers,
    select,
};
pub use crate::error::*;
pub use crate::metric::{BuildMetric, CollectingMetric};
pub use crate::task::{
    Capabilities, DuplicationPredicate, InnerTask, InnerTaskFactory, InvokeCount, Task, TaskFactory, inner_task_fn,
    task_fn,
};
