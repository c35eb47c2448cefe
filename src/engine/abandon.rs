//! Reconciles the records of one execution with the previous database.
//!
//! A recorded task which was not touched in this execution stays alive while
//! at least one of its recorded creators was not touched either. A creator
//! that ran again (or was reused, which restarts its children) and did not
//! start the task any more no longer holds it. Tasks left without a creator
//! are abandoned: their output files inside the build directory are deleted
//! and their records are dropped. Roots are never abandoned implicitly.

use std::collections::{BTreeSet, HashMap};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;

use crate::core::TaskIdentifier;
use crate::engine::runner::Execution;
use crate::engine::scheduler::SlotSummary;
use crate::engine::store::{Database, Dependency, StoredTask};

pub(crate) struct Reconciled {
    pub database: Database,
    pub abandoned: Vec<TaskIdentifier>,
}

impl Execution {
    /// Builds the database to persist after this execution. Abandonment only
    /// happens when `successful`; otherwise untouched records are carried
    /// over unchanged.
    pub(crate) fn reconcile(&self, summaries: &[SlotSummary], successful: bool) -> Reconciled {
        let live: BTreeSet<&TaskIdentifier> = summaries.iter().map(|summary| &summary.id).collect();

        let abandoned = match successful {
            true => self.find_abandoned(&live),
            false => BTreeSet::new(),
        };

        let mut tasks = HashMap::with_capacity(self.previous.len() + summaries.len());

        for (id, stored) in &self.previous {
            if live.contains(id) || abandoned.contains(id) {
                continue;
            }
            let mut stored = stored.clone();
            stored
                .record
                .created_by
                .retain(|creator| !live.contains(creator) && !abandoned.contains(creator));
            tasks.insert(id.clone(), stored);
        }

        for summary in summaries {
            let previous = self.previous.get(&summary.id);

            let Some(mut record) = self.records.get(&summary.id).map(|entry| entry.value().clone()) else {
                // finished without being evaluated, only possible after a cancel
                if let Some(previous) = previous {
                    tasks.insert(summary.id.clone(), previous.clone());
                }
                continue;
            };

            let mut created_by = summary.starters.clone();
            if let Some(previous) = previous {
                created_by.extend(
                    previous
                        .record
                        .created_by
                        .iter()
                        .filter(|creator| !live.contains(*creator) && !abandoned.contains(*creator))
                        .cloned(),
                );
            }
            record.created_by = created_by;
            record.root = summary.root || previous.is_some_and(|previous| previous.record.root);

            let output = summary.finished.result.as_ref().ok().cloned();
            tasks.insert(summary.id.clone(), StoredTask { record, output });
        }

        if !abandoned.is_empty() {
            self.delete_outputs(&abandoned);
        }
        for id in &abandoned {
            tracing::info!(%id, "Task abandoned");
            self.metric.task_abandoned(id);
        }

        Reconciled {
            database: Database {
                build_counter: self.stamp.0,
                tasks,
            },
            abandoned: abandoned.into_iter().collect(),
        }
    }

    /// Untouched, non-root tasks whose every recorded creator was touched or
    /// abandoned, to a fixpoint.
    fn find_abandoned(&self, live: &BTreeSet<&TaskIdentifier>) -> BTreeSet<TaskIdentifier> {
        let candidates: Vec<(&TaskIdentifier, &StoredTask)> = self
            .previous
            .iter()
            .filter(|(id, stored)| !live.contains(id) && !stored.record.root)
            .collect();

        let mut abandoned = BTreeSet::new();
        loop {
            let before = abandoned.len();
            for (id, stored) in &candidates {
                if abandoned.contains(*id) {
                    continue;
                }
                let held = stored.record.created_by.iter().any(|creator| {
                    !live.contains(creator) && !abandoned.contains(creator) && self.previous.contains_key(creator)
                });
                if !held {
                    abandoned.insert((*id).clone());
                }
            }
            if abandoned.len() == before {
                break;
            }
        }
        abandoned
    }

    /// Deletes the recorded output files of abandoned tasks that lie strictly
    /// inside the build directory. Both sides are compared in the content
    /// provider's normalized form.
    fn delete_outputs(&self, abandoned: &BTreeSet<TaskIdentifier>) {
        let build_directory = self.files.normalize(&self.config.build_directory);
        let paths: Vec<&Utf8PathBuf> = abandoned
            .iter()
            .filter_map(|id| self.previous.get(id))
            .flat_map(|stored| stored.record.dependencies.iter())
            .filter_map(|dependency| match dependency {
                Dependency::OutputFile { path, .. } => Some(path),
                _ => None,
            })
            .filter(|path| is_inside(&self.files.normalize(path), &build_directory))
            .collect();

        paths.par_iter().for_each(|path| {
            tracing::debug!(%path, "Deleting output of abandoned task");
            if let Err(e) = self.files.delete(path) {
                tracing::warn!(%path, "Couldn't delete abandoned output: {e}");
            }
        });
    }
}

fn is_inside(path: &Utf8Path, directory: &Utf8Path) -> bool {
    path != directory && path.starts_with(directory)
}
