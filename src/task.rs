use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::Value;
use crate::engine::{InnerTaskContext, TaskContext};
use crate::environment::EnvironmentSelector;

/// What the scheduler may assume about a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Short tasks run inline on the thread that started them. They may only
    /// wait for other short tasks or for tasks which already finished.
    pub short: bool,
}

impl Capabilities {
    pub fn short() -> Self {
        Self { short: true }
    }
}

/// Serializable, structurally comparable description of a unit of work.
///
/// The factory is persisted through its [`snapshot`](TaskFactory::snapshot)
/// under its [`tag`](TaskFactory::tag). Two factories are equal when both the
/// tag and the snapshot are equal, and equality between builds is one of the
/// preconditions of reusing a previous result. To let the engine restart
/// unchanged children on its own, register a codec for the tag in the
/// [`CodecRegistry`](crate::CodecRegistry).
pub trait TaskFactory: Send + Sync + 'static {
    fn tag(&self) -> &'static str;

    fn snapshot(&self) -> anyhow::Result<Value>;

    fn create_task(&self) -> Box<dyn Task>;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Number of computation tokens the task body holds while it runs.
    fn requested_tokens(&self) -> usize {
        0
    }

    fn environment_selector(&self) -> Option<Arc<dyn EnvironmentSelector>> {
        None
    }
}

/// The body of a task.
pub trait Task: Send {
    fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<Value>;
}

impl<F> Task for F
where
    F: FnMut(&TaskContext) -> anyhow::Result<Value> + Send,
{
    fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<Value> {
        self(ctx)
    }
}

/// Boxes a closure as a task body.
pub fn task_fn<F>(body: F) -> Box<dyn Task>
where
    F: FnMut(&TaskContext) -> anyhow::Result<Value> + Send + 'static,
{
    Box::new(body)
}

/// Description of duplicable work started from inside a task. Remote
/// environments rebuild the factory from its snapshot.
pub trait InnerTaskFactory: Send + Sync + 'static {
    fn tag(&self) -> &'static str;

    fn snapshot(&self) -> anyhow::Result<Value>;

    fn create_task(&self) -> Box<dyn InnerTask>;

    fn requested_tokens(&self) -> usize {
        1
    }
}

pub trait InnerTask: Send {
    fn run(&mut self, ctx: &InnerTaskContext) -> anyhow::Result<Value>;
}

impl<F> InnerTask for F
where
    F: FnMut(&InnerTaskContext) -> anyhow::Result<Value> + Send,
{
    fn run(&mut self, ctx: &InnerTaskContext) -> anyhow::Result<Value> {
        self(ctx)
    }
}

/// Boxes a closure as an inner task body.
pub fn inner_task_fn<F>(body: F) -> Box<dyn InnerTask>
where
    F: FnMut(&InnerTaskContext) -> anyhow::Result<Value> + Send + 'static,
{
    Box::new(body)
}

/// Asked before every duplicate is started. Calls are serialized.
pub trait DuplicationPredicate: Send + Sync {
    fn should_invoke_once_more(&self) -> anyhow::Result<bool>;
}

impl<F> DuplicationPredicate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn should_invoke_once_more(&self) -> anyhow::Result<bool> {
        Ok(self())
    }
}

/// Allows a fixed number of invocations.
#[derive(Debug)]
pub struct InvokeCount {
    remaining: AtomicUsize,
}

impl InvokeCount {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
        }
    }
}

impl DuplicationPredicate for InvokeCount {
    fn should_invoke_once_more(&self) -> anyhow::Result<bool> {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Ok(previous.is_ok())
    }
}
