//! In-memory index of paths, resources and pending tasks.
//!
//! The catalog is rebuilt from durable state when the environment opens and
//! kept current by applying each committed batch. Resource contents are not
//! held here; drivers serve them on demand.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::mutation::Mutation;
use crate::scope::TxnScope;
use crate::types::{Listing, ResourceId, ResourcePath, TaskId};

/// Path, resource and task index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    paths: BTreeMap<ResourcePath, ResourceId>,
    resources: HashMap<ResourceId, BTreeSet<ResourcePath>>,
    tasks: HashMap<ResourceId, BTreeSet<u64>>,
}

impl Catalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one mutation. Replaying the same batch always yields the same catalog.
    pub fn apply(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::CreateResource { id } => {
                self.resources.entry(*id).or_default();
            }
            Mutation::PutContents { .. } => {}
            Mutation::LinkPath { path, id } => {
                if let Some(previous) = self.paths.insert(path.clone(), *id) {
                    if let Some(paths) = self.resources.get_mut(&previous) {
                        paths.remove(path);
                    }
                }
                self.resources.entry(*id).or_default().insert(path.clone());
            }
            Mutation::UnlinkPath { path, .. } => {
                if let Some(id) = self.paths.remove(path) {
                    if let Some(paths) = self.resources.get_mut(&id) {
                        paths.remove(path);
                    }
                }
            }
            Mutation::DeleteResource { id } => {
                if let Some(paths) = self.resources.remove(id) {
                    for path in paths {
                        self.paths.remove(&path);
                    }
                }
                self.tasks.remove(id);
            }
            Mutation::PutTask { task } => {
                self.tasks.entry(task.resource_id).or_default().insert(task.task);
            }
            Mutation::DeleteTask { task } => {
                if let Some(tasks) = self.tasks.get_mut(&task.resource_id) {
                    tasks.remove(&task.task);
                    if tasks.is_empty() {
                        self.tasks.remove(&task.resource_id);
                    }
                }
            }
        }
    }

    /// Applies a batch in order.
    pub fn apply_all<'a>(&mut self, batch: impl IntoIterator<Item = &'a Mutation>) {
        for mutation in batch {
            self.apply(mutation);
        }
    }

    /// Resource linked at `path`.
    pub fn resource_id(&self, path: &ResourcePath) -> Option<ResourceId> {
        self.paths.get(path).copied()
    }

    /// True if `id` exists.
    pub fn contains(&self, id: ResourceId) -> bool {
        self.resources.contains_key(&id)
    }

    /// Paths linked to `id`.
    pub fn paths_of(&self, id: ResourceId) -> impl Iterator<Item = &ResourcePath> {
        self.resources.get(&id).into_iter().flatten()
    }

    /// Listings matching `path`, wildcard-aware, in path order.
    pub fn list(&self, path: &ResourcePath) -> Vec<Listing> {
        if !path.is_wildcard() {
            return self
                .resource_id(path)
                .map(|resource_id| Listing {
                    path: path.clone(),
                    resource_id,
                })
                .into_iter()
                .collect();
        }
        self.paths
            .iter()
            .filter(|(candidate, _)| path.matches(candidate))
            .map(|(path, id)| Listing {
                path: path.clone(),
                resource_id: *id,
            })
            .collect()
    }

    /// Pending tasks of `id`.
    pub fn tasks(&self, id: ResourceId) -> Vec<TaskId> {
        self.tasks
            .get(&id)
            .into_iter()
            .flatten()
            .map(|task| TaskId::new(id, *task))
            .collect()
    }

    /// True if `task` is pending.
    pub fn has_task(&self, task: TaskId) -> bool {
        self.tasks
            .get(&task.resource_id)
            .is_some_and(|tasks| tasks.contains(&task.task))
    }

    /// Number of resources.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Number of linked paths.
    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// All resource ids.
    pub fn resource_ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.resources.keys().copied()
    }

    /// Copy of the part of the catalog visible to `scope`.
    ///
    /// Covered resources keep their full path sets, so unlinking inside the
    /// scope can tell whether a path outside it still holds the resource.
    pub fn extract(&self, scope: &TxnScope) -> Catalog {
        if scope.is_all() {
            return self.clone();
        }

        let mut ids: BTreeSet<ResourceId> = scope
            .resources()
            .iter()
            .copied()
            .filter(|id| self.contains(*id))
            .collect();
        for scope_path in scope.paths() {
            if scope_path.is_wildcard() {
                ids.extend(
                    self.paths
                        .iter()
                        .filter(|(path, _)| scope_path.matches(path))
                        .map(|(_, id)| *id),
                );
            } else if let Some(id) = self.resource_id(scope_path) {
                ids.insert(id);
            }
        }

        let mut extracted = Catalog::new();
        for id in ids {
            let paths = self.resources.get(&id).cloned().unwrap_or_default();
            for path in &paths {
                extracted.paths.insert(path.clone(), id);
            }
            extracted.resources.insert(id, paths);
            if let Some(tasks) = self.tasks.get(&id) {
                extracted.tasks.insert(id, tasks.clone());
            }
        }
        extracted
    }

    /// Extra mutations needed so no resource is left without a path.
    ///
    /// Two transactions scoped to different paths of one resource may each
    /// unlink "the other" path. Evaluated against the committed catalog just
    /// before a batch is persisted, this adds the task and resource deletes
    /// for any resource the batch leaves unreachable.
    pub fn orphans(&self, batch: &[Mutation]) -> Vec<Mutation> {
        let unlinked: BTreeSet<ResourceId> = batch
            .iter()
            .filter_map(|m| match m {
                Mutation::UnlinkPath { id, .. } => Some(*id),
                _ => None,
            })
            .collect();

        let mut extra = Vec::new();
        for id in unlinked {
            let mut exists = self.contains(id);
            let mut paths: BTreeSet<&ResourcePath> = self.paths_of(id).collect();
            let mut tasks: BTreeSet<u64> = self.tasks(id).into_iter().map(|t| t.task).collect();

            for mutation in batch.iter().filter(|m| m.resource_id() == id) {
                match mutation {
                    Mutation::CreateResource { .. } => exists = true,
                    Mutation::DeleteResource { .. } => exists = false,
                    Mutation::LinkPath { path, .. } => {
                        paths.insert(path);
                    }
                    Mutation::UnlinkPath { path, .. } => {
                        paths.remove(path);
                    }
                    Mutation::PutTask { task } => {
                        tasks.insert(task.task);
                    }
                    Mutation::DeleteTask { task } => {
                        tasks.remove(&task.task);
                    }
                    Mutation::PutContents { .. } => {}
                }
            }

            if exists && paths.is_empty() {
                extra.extend(tasks.into_iter().map(|task| Mutation::DeleteTask {
                    task: TaskId::new(id, task),
                }));
                extra.push(Mutation::DeleteResource { id });
            }
        }
        extra
    }
}
