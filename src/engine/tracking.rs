use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;

use crate::codec::Snapshot;
use crate::content::ContentDescriptor;
use crate::core::{BuildStamp, TaskIdentifier, Value};
use crate::detector::EqualityDetector;
use crate::engine::scheduler::FinishedTask;
use crate::engine::store::{Dependency, TaskOutputDependency};
use crate::environment::PropertyOutcome;

/// How a task used one producer's output.
#[derive(Default)]
struct TaskRead {
    stamp: Option<BuildStamp>,
    self_detector: Option<Snapshot>,
    seen: Option<Value>,
    /// Read without narrowing, so any difference in the output matters.
    full: bool,
    detectors: Vec<Snapshot>,
}

/// Collects the dependencies a running task reports.
#[derive(Default)]
pub(crate) struct DependencyCollector {
    inputs: BTreeMap<Utf8PathBuf, ContentDescriptor>,
    outputs: BTreeMap<Utf8PathBuf, ContentDescriptor>,
    additions: BTreeMap<String, BTreeSet<Utf8PathBuf>>,
    environment: Vec<(Snapshot, PropertyOutcome)>,
    execution: Vec<(Snapshot, PropertyOutcome)>,
    qualifiers: BTreeMap<String, Option<Value>>,
    tasks: BTreeMap<TaskIdentifier, TaskRead>,
}

/// A property was reported twice with different values.
#[derive(Debug)]
pub(crate) struct Conflict;

impl DependencyCollector {
    pub(crate) fn input_file(&mut self, path: Utf8PathBuf, descriptor: ContentDescriptor) {
        self.inputs.insert(path, descriptor);
    }

    pub(crate) fn output_file(&mut self, path: Utf8PathBuf, descriptor: ContentDescriptor) {
        self.outputs.insert(path, descriptor);
    }

    pub(crate) fn addition(&mut self, pattern: String, matched: BTreeSet<Utf8PathBuf>) {
        self.additions.insert(pattern, matched);
    }

    pub(crate) fn environment(&mut self, property: Snapshot, outcome: PropertyOutcome) -> Result<(), Conflict> {
        insert_property(&mut self.environment, property, outcome)
    }

    pub(crate) fn execution(&mut self, property: Snapshot, outcome: PropertyOutcome) -> Result<(), Conflict> {
        insert_property(&mut self.execution, property, outcome)
    }

    pub(crate) fn qualifiers(&mut self, qualifiers: impl IntoIterator<Item = (String, Option<Value>)>) {
        self.qualifiers.extend(qualifiers);
    }

    /// Records that the task looked at `finished`. A `full` read depends on
    /// the whole output.
    pub(crate) fn task_read(&mut self, finished: &FinishedTask, full: bool) {
        let read = self.tasks.entry(finished.id.clone()).or_default();
        read.stamp = Some(finished.stamp);
        read.self_detector = finished.self_detector.clone();
        read.seen = finished.result.as_ref().ok().cloned();
        read.full |= full;
    }

    pub(crate) fn task_detector(&mut self, id: &TaskIdentifier, detector: Snapshot) {
        self.tasks.entry(id.clone()).or_default().detectors.push(detector);
    }

    pub(crate) fn finish(self) -> Vec<Dependency> {
        let mut dependencies = Vec::new();

        dependencies.extend(
            self.inputs
                .into_iter()
                .map(|(path, descriptor)| Dependency::InputFile { path, descriptor }),
        );
        dependencies.extend(
            self.outputs
                .into_iter()
                .map(|(path, descriptor)| Dependency::OutputFile { path, descriptor }),
        );
        dependencies.extend(
            self.additions
                .into_iter()
                .map(|(pattern, matched)| Dependency::Addition { pattern, matched }),
        );
        dependencies.extend(
            self.environment
                .into_iter()
                .map(|(property, outcome)| Dependency::Environment { property, outcome }),
        );
        dependencies.extend(
            self.execution
                .into_iter()
                .map(|(property, outcome)| Dependency::Execution { property, outcome }),
        );
        dependencies.extend(
            self.qualifiers
                .into_iter()
                .map(|(name, value)| Dependency::Qualifier { name, value }),
        );

        for (task, read) in self.tasks {
            // detectors on a result that was never read have nothing to compare
            let Some(stamp) = read.stamp else {
                continue;
            };

            let detectors = if read.full || read.detectors.is_empty() {
                match read.seen.map(equality) {
                    Some(Some(snapshot)) => vec![snapshot],
                    _ => vec![],
                }
            } else {
                read.detectors
            };

            dependencies.push(Dependency::TaskOutput {
                task,
                dependency: TaskOutputDependency {
                    stamp,
                    self_detector: read.self_detector,
                    detectors,
                },
            });
        }

        dependencies
    }
}

fn equality(seen: Value) -> Option<Snapshot> {
    Snapshot::of_detector(&EqualityDetector::new(seen)).ok()
}

fn insert_property(
    into: &mut Vec<(Snapshot, PropertyOutcome)>,
    property: Snapshot,
    outcome: PropertyOutcome,
) -> Result<(), Conflict> {
    match into.iter().find(|(known, _)| *known == property) {
        Some((_, known)) if *known == outcome => Ok(()),
        Some(_) => Err(Conflict),
        None => {
            into.push((property, outcome));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::AlwaysChanged;
    use crate::error::TaskError;

    fn finished(name: &str, output: Result<Value, TaskError>) -> FinishedTask {
        FinishedTask {
            id: TaskIdentifier::new(name),
            result: output,
            stamp: BuildStamp(4),
            self_detector: None,
            reused: false,
        }
    }

    fn task_dependency(dependencies: &[Dependency]) -> &TaskOutputDependency {
        dependencies
            .iter()
            .find_map(|dep| match dep {
                Dependency::TaskOutput { dependency, .. } => Some(dependency),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_plain_read_depends_on_equality() {
        let mut collector = DependencyCollector::default();
        collector.task_read(&finished("a", Ok(Value::Text("x".into()))), true);

        let dependencies = collector.finish();
        let dependency = task_dependency(&dependencies);
        assert_eq!(dependency.stamp, BuildStamp(4));
        assert_eq!(dependency.detectors.len(), 1);
        assert_eq!(dependency.detectors[0].tag, EqualityDetector::TAG);
    }

    #[test]
    fn test_custom_detectors_replace_equality() {
        let producer = finished("a", Ok(Value::Text("x".into())));
        let custom = Snapshot::of_detector(&AlwaysChanged).unwrap();

        let mut collector = DependencyCollector::default();
        collector.task_detector(&producer.id, custom.clone());
        collector.task_read(&producer, false);

        let dependencies = collector.finish();
        assert_eq!(task_dependency(&dependencies).detectors, vec![custom]);
    }

    #[test]
    fn test_failed_producer_has_no_detectors() {
        let mut collector = DependencyCollector::default();
        collector.task_read(&finished("a", Err(TaskError::Cancelled)), true);

        let dependencies = collector.finish();
        assert!(task_dependency(&dependencies).detectors.is_empty());
    }

    #[test]
    fn test_detector_without_read_is_dropped() {
        let mut collector = DependencyCollector::default();
        collector.task_detector(&TaskIdentifier::new("a"), Snapshot::of_detector(&AlwaysChanged).unwrap());
        assert!(collector.finish().is_empty());
    }

    #[test]
    fn test_conflicting_property_reports() {
        let property = Snapshot {
            tag: "p".into(),
            state: Value::Null,
        };
        let one = PropertyOutcome::Value(Value::Integer(1.into()));
        let two = PropertyOutcome::Value(Value::Integer(2.into()));

        let mut collector = DependencyCollector::default();
        assert!(collector.environment(property.clone(), one.clone()).is_ok());
        assert!(collector.environment(property.clone(), one).is_ok());
        assert!(collector.environment(property, two).is_err());
    }
}
