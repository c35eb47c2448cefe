//! Decides whether a previously executed task can keep its result.

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;

use crate::codec::Snapshot;
use crate::content::{ContentDescriptor, FileKind};
use crate::core::TaskIdentifier;
use crate::engine::runner::Execution;
use crate::engine::scheduler::{FinishedTask, Starter, WaitPurpose, Waiter};
use crate::engine::store::{Dependency, RecordedFailure, StoredTask, TaskOutputDependency};
use crate::environment::PropertyOutcome;
use crate::task::TaskFactory;

/// Why a task body is executed instead of reusing its previous result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RerunReason {
    /// No previous result exists.
    New,
    FactoryChanged,
    /// The previous execution failed.
    PreviousFailure,
    /// The previous output could not be deserialized.
    OutputLoadFailed,
    InputFile(Utf8PathBuf),
    OutputFile(Utf8PathBuf),
    /// The set of files matched by a wildcard pattern changed.
    Addition(String),
    /// An environment property changed, tagged with the property kind.
    Environment(String),
    Execution(String),
    /// A property inspected by the environment selector changed.
    Qualifier(String),
    TaskOutput(TaskIdentifier),
    /// The recorded factory of a child could not be restored.
    ChildFactory(TaskIdentifier),
}

impl fmt::Display for RerunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RerunReason::New => f.write_str("new task"),
            RerunReason::FactoryChanged => f.write_str("factory changed"),
            RerunReason::PreviousFailure => f.write_str("previous execution failed"),
            RerunReason::OutputLoadFailed => f.write_str("previous output could not be loaded"),
            RerunReason::InputFile(path) => write!(f, "input file '{path}' changed"),
            RerunReason::OutputFile(path) => write!(f, "output file '{path}' changed"),
            RerunReason::Addition(pattern) => write!(f, "files matching '{pattern}' changed"),
            RerunReason::Environment(tag) => write!(f, "environment property '{tag}' changed"),
            RerunReason::Execution(tag) => write!(f, "execution property '{tag}' changed"),
            RerunReason::Qualifier(name) => write!(f, "environment qualifier '{name}' changed"),
            RerunReason::TaskOutput(id) => write!(f, "output of task '{id}' changed"),
            RerunReason::ChildFactory(id) => write!(f, "factory of child task '{id}' could not be restored"),
        }
    }
}

pub(crate) enum Decision {
    Reuse,
    Rerun(RerunReason),
}

impl Execution {
    /// Compares the previous execution of a task with the current state.
    ///
    /// Direct children of a task whose own dependencies are unchanged are
    /// started again with their recorded factories, so that their deltas are
    /// checked even though nobody runs the parent body. They are started
    /// before waiting on a producer that only a descendant would start.
    pub(crate) fn decide(
        self: &Arc<Self>,
        waiter: &Waiter,
        id: &TaskIdentifier,
        snapshot: &Snapshot,
        previous: &StoredTask,
    ) -> Decision {
        let record = &previous.record;

        if record.factory != *snapshot {
            return Decision::Rerun(RerunReason::FactoryChanged);
        }
        if record.flags.output_load_failed {
            self.note_load_failure(id);
            return Decision::Rerun(RerunReason::OutputLoadFailed);
        }
        if let Some(RecordedFailure::Execution(_)) = record.failure {
            return Decision::Rerun(RerunReason::PreviousFailure);
        }

        if let Some(reason) = self.changed_files(&record.dependencies) {
            return Decision::Rerun(reason);
        }
        if let Some(reason) = self.changed_own_dependency(&record.dependencies) {
            return Decision::Rerun(reason);
        }

        let mut children = Vec::with_capacity(record.children.len());
        for (child, factory) in &record.children {
            match self.registry.decode_factory(factory) {
                Ok(decoded) => children.push((child, decoded, factory)),
                Err(e) => {
                    tracing::debug!(%child, "Couldn't restore child factory: {e}");
                    return Decision::Rerun(RerunReason::ChildFactory(child.clone()));
                }
            }
        }

        let mut restarted = false;
        for dependency in &record.dependencies {
            let Dependency::TaskOutput { task, dependency } = dependency else {
                continue;
            };

            let key = self.key_of(task);
            if !self.is_started(key) {
                let child = children.iter().find(|(child, _, _)| *child == task);
                match child {
                    Some((child, factory, snapshot)) => {
                        self.start_implicitly(waiter, child, factory.clone(), snapshot);
                    }
                    None if !self.previous.contains_key(task) => {
                        return Decision::Rerun(RerunReason::TaskOutput(task.clone()));
                    }
                    // the producer may sit deeper in the recorded subtree
                    None if !restarted => {
                        self.restart_children(waiter, &children);
                        restarted = true;
                    }
                    None => {}
                }
            }

            let changed = match self.wait_for(Some(waiter), key, WaitPurpose::Delta) {
                Ok(current) => self.is_output_changed(dependency, &current),
                Err(e) => {
                    tracing::debug!(%task, "Producer unavailable for delta check: {e}");
                    true
                }
            };
            if changed {
                return Decision::Rerun(RerunReason::TaskOutput(task.clone()));
            }
        }

        if !restarted {
            self.restart_children(waiter, &children);
        }

        Decision::Reuse
    }

    fn restart_children(
        self: &Arc<Self>,
        waiter: &Waiter,
        children: &[(&TaskIdentifier, Arc<dyn TaskFactory>, &Snapshot)],
    ) {
        for (child, factory, snapshot) in children {
            self.start_implicitly(waiter, child, factory.clone(), snapshot);
        }
    }

    fn start_implicitly(
        self: &Arc<Self>,
        waiter: &Waiter,
        child: &TaskIdentifier,
        factory: Arc<dyn TaskFactory>,
        snapshot: &Snapshot,
    ) {
        if let Err(e) = self.start(Starter::Implicit(waiter.key), child, factory, snapshot.clone()) {
            tracing::warn!(%child, "Couldn't restart child task: {e}");
        }
    }

    fn changed_files(&self, dependencies: &[Dependency]) -> Option<RerunReason> {
        dependencies.par_iter().find_map_any(|dependency| match dependency {
            Dependency::InputFile { path, descriptor } => self
                .is_file_changed(path, descriptor)
                .then(|| RerunReason::InputFile(path.clone())),
            Dependency::OutputFile { path, descriptor } => self
                .is_file_changed(path, descriptor)
                .then(|| RerunReason::OutputFile(path.clone())),
            _ => None,
        })
    }

    fn changed_own_dependency(&self, dependencies: &[Dependency]) -> Option<RerunReason> {
        for dependency in dependencies {
            match dependency {
                Dependency::Addition { pattern, matched } => {
                    let changed = match self.files.collect(pattern) {
                        Ok(current) => current != *matched,
                        Err(_) => true,
                    };
                    if changed {
                        return Some(RerunReason::Addition(pattern.clone()));
                    }
                }
                Dependency::Environment { property, outcome } => {
                    let current = self.environment_outcome(property);
                    if is_property_changed(outcome, &current) {
                        return Some(RerunReason::Environment(property.tag.clone()));
                    }
                }
                Dependency::Execution { property, outcome } => {
                    let current = self.execution_outcome(property);
                    if is_property_changed(outcome, &current) {
                        return Some(RerunReason::Execution(property.tag.clone()));
                    }
                }
                _ => {}
            }
        }

        for dependency in dependencies {
            if let Dependency::Qualifier { name, value } = dependency
                && self.environment.get(name) != value.as_ref()
            {
                return Some(RerunReason::Qualifier(name.clone()));
            }
        }

        None
    }

    fn is_file_changed(&self, path: &Utf8Path, stored: &ContentDescriptor) -> bool {
        let state = match self.files.state(path) {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!(%path, "Couldn't read file state: {e}");
                return true;
            }
        };

        match stored {
            ContentDescriptor::DontCare => false,
            descriptor if descriptor.is_presence_class() => descriptor.observe(&state) != *descriptor,
            ContentDescriptor::Attributes { .. } => ContentDescriptor::attributes_of(&state) != *stored,
            ContentDescriptor::Hash(hash) => match state.kind {
                FileKind::File => !matches!(self.files.digest(path), Ok(Some(current)) if current == *hash),
                _ => true,
            },
            ContentDescriptor::Custom { tag, state } => match self.registry.descriptor(tag) {
                Ok(codec) => codec.is_changed(path, state, self.files.as_ref()).unwrap_or(true),
                Err(_) => true,
            },
            _ => true,
        }
    }

    /// Whether the result a consumer saw differs from the producer's current
    /// one, as far as the consumer cares.
    pub(crate) fn is_output_changed(&self, dependency: &TaskOutputDependency, current: &FinishedTask) -> bool {
        if current.stamp == dependency.stamp {
            return false;
        }

        let output = match &current.result {
            Ok(output) => output,
            Err(_) => return true,
        };

        if let Some(detector) = &dependency.self_detector
            && let Ok(detector) = self.registry.decode_detector(detector)
            && !detector.is_changed(output)
        {
            return false;
        }

        if dependency.detectors.is_empty() {
            return true;
        }

        dependency
            .detectors
            .iter()
            .any(|snapshot| match self.registry.decode_detector(snapshot) {
                Ok(detector) => detector.is_changed(output),
                Err(e) => {
                    tracing::debug!("Couldn't restore change detector: {e}");
                    true
                }
            })
    }
}

fn is_property_changed(recorded: &PropertyOutcome, current: &PropertyOutcome) -> bool {
    match recorded {
        PropertyOutcome::Failed(_) => true,
        PropertyOutcome::Value(_) => recorded != current,
    }
}
