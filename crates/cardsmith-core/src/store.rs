// Copyright 2025 Fernando Borretti
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The persistence boundary: run records plus per-stage output blobs.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::error::PipelineError;
use crate::types::run::PipelineRun;
use crate::types::run::RunId;

/// Durable storage for runs. Every run write after creation is a
/// conditional update on the version the writer last saw.
pub trait RunStore: Send + Sync + 'static {
    /// Store a new run. Fails if the id is taken.
    fn create_run(&self, run: &PipelineRun) -> Result<(), PipelineError>;

    fn load_run(&self, run_id: &RunId) -> Result<PipelineRun, PipelineError>;

    /// Replace the stored run if its version is still `expected_version`.
    /// Returns the new version, `expected_version + 1`.
    fn update_run(&self, run: &PipelineRun, expected_version: u64) -> Result<u64, PipelineError>;

    /// `update_run` and `put_output` as one write: on a version conflict
    /// neither the run nor the output changes.
    fn commit_output(
        &self,
        run: &PipelineRun,
        expected_version: u64,
        key: &str,
        blob: &str,
    ) -> Result<u64, PipelineError>;

    /// Remove a run together with its outputs.
    fn delete_run(&self, run_id: &RunId) -> Result<(), PipelineError>;

    /// All runs, oldest first.
    fn list_runs(&self) -> Result<Vec<PipelineRun>, PipelineError>;

    fn put_output(&self, run_id: &RunId, key: &str, blob: &str) -> Result<(), PipelineError>;

    fn get_output(&self, run_id: &RunId, key: &str) -> Result<Option<String>, PipelineError>;
}

#[derive(Default)]
struct Tables {
    runs: BTreeMap<RunId, PipelineRun>,
    outputs: BTreeMap<(RunId, String), String>,
}

impl Tables {
    fn replace(&mut self, run: &PipelineRun, expected_version: u64) -> Result<u64, PipelineError> {
        let stored = self
            .runs
            .get_mut(&run.run_id)
            .ok_or_else(|| PipelineError::RunNotFound(run.run_id.clone()))?;
        if stored.version != expected_version {
            return Err(PipelineError::VersionConflict {
                run_id: run.run_id.clone(),
                expected: expected_version,
                found: stored.version,
            });
        }
        let version = expected_version + 1;
        *stored = PipelineRun {
            version,
            ..run.clone()
        };
        Ok(version)
    }
}

/// A run store that lives and dies with the process.
#[derive(Default)]
pub struct MemoryRunStore {
    tables: Mutex<Tables>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, PipelineError> {
        self.tables
            .lock()
            .map_err(|_| PipelineError::Store("run store lock poisoned".to_string()))
    }
}

impl RunStore for MemoryRunStore {
    fn create_run(&self, run: &PipelineRun) -> Result<(), PipelineError> {
        let mut tables = self.lock()?;
        if tables.runs.contains_key(&run.run_id) {
            return Err(PipelineError::Store(format!("run {} already exists", run.run_id)));
        }
        tables.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn load_run(&self, run_id: &RunId) -> Result<PipelineRun, PipelineError> {
        self.lock()?
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| PipelineError::RunNotFound(run_id.clone()))
    }

    fn update_run(&self, run: &PipelineRun, expected_version: u64) -> Result<u64, PipelineError> {
        self.lock()?.replace(run, expected_version)
    }

    fn commit_output(
        &self,
        run: &PipelineRun,
        expected_version: u64,
        key: &str,
        blob: &str,
    ) -> Result<u64, PipelineError> {
        let mut tables = self.lock()?;
        let version = tables.replace(run, expected_version)?;
        tables
            .outputs
            .insert((run.run_id.clone(), key.to_string()), blob.to_string());
        Ok(version)
    }

    fn delete_run(&self, run_id: &RunId) -> Result<(), PipelineError> {
        let mut tables = self.lock()?;
        if tables.runs.remove(run_id).is_none() {
            return Err(PipelineError::RunNotFound(run_id.clone()));
        }
        tables.outputs.retain(|(owner, _), _| owner != run_id);
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<PipelineRun>, PipelineError> {
        let mut runs: Vec<PipelineRun> = self.lock()?.runs.values().cloned().collect();
        runs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }

    fn put_output(&self, run_id: &RunId, key: &str, blob: &str) -> Result<(), PipelineError> {
        self.lock()?
            .outputs
            .insert((run_id.clone(), key.to_string()), blob.to_string());
        Ok(())
    }

    fn get_output(&self, run_id: &RunId, key: &str) -> Result<Option<String>, PipelineError> {
        Ok(self
            .lock()?
            .outputs
            .get(&(run_id.clone(), key.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::run::RunState;
    use crate::types::timestamp::Timestamp;

    #[test]
    fn test_conditional_update() -> Result<(), PipelineError> {
        let store = MemoryRunStore::new();
        let mut run = PipelineRun::new(RunId::new("r1"), "doc", Timestamp::now());
        store.create_run(&run)?;
        assert!(store.create_run(&run).is_err());

        run.state = RunState::Detecting;
        run.version = store.update_run(&run, 0)?;
        assert_eq!(run.version, 1);
        assert_eq!(store.load_run(&run.run_id)?.state, RunState::Detecting);

        let stale = store.update_run(&run, 0);
        assert_eq!(
            stale,
            Err(PipelineError::VersionConflict {
                run_id: RunId::new("r1"),
                expected: 0,
                found: 1,
            })
        );
        Ok(())
    }

    #[test]
    fn test_missing_run() {
        let store = MemoryRunStore::new();
        let id = RunId::new("nope");
        assert_eq!(store.load_run(&id), Err(PipelineError::RunNotFound(id)));
    }

    #[test]
    fn test_outputs_and_listing() -> Result<(), PipelineError> {
        let store = MemoryRunStore::new();
        let a = PipelineRun::new(RunId::new("b"), "doc", Timestamp::now());
        let b = PipelineRun::new(RunId::new("a"), "doc", a.created_at);
        store.create_run(&a)?;
        store.create_run(&b)?;
        let ids: Vec<String> = store
            .list_runs()?
            .iter()
            .map(|run| run.run_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        store.put_output(&a.run_id, "document", "text")?;
        assert_eq!(store.get_output(&a.run_id, "document")?, Some("text".to_string()));
        assert_eq!(store.get_output(&b.run_id, "document")?, None);
        Ok(())
    }

    #[test]
    fn test_commit_output_is_conditional() -> Result<(), PipelineError> {
        let store = MemoryRunStore::new();
        let mut run = PipelineRun::new(RunId::new("r1"), "doc", Timestamp::now());
        store.create_run(&run)?;
        run.version = store.commit_output(&run, 0, "detecting", "[]")?;
        assert_eq!(store.get_output(&run.run_id, "detecting")?, Some("[]".to_string()));

        run.state = RunState::Extracting;
        let stale = store.commit_output(&run, 0, "extracting", "[]");
        assert!(matches!(stale, Err(PipelineError::VersionConflict { .. })));
        assert_eq!(store.get_output(&run.run_id, "extracting")?, None);
        assert_eq!(store.load_run(&run.run_id)?.state, RunState::Pending);
        Ok(())
    }

    #[test]
    fn test_delete_run_removes_outputs() -> Result<(), PipelineError> {
        let store = MemoryRunStore::new();
        let kept = PipelineRun::new(RunId::new("kept"), "doc", Timestamp::now());
        let gone = PipelineRun::new(RunId::new("gone"), "doc", Timestamp::now());
        for run in [&kept, &gone] {
            store.create_run(run)?;
            store.put_output(&run.run_id, "document", "text")?;
        }
        store.delete_run(&gone.run_id)?;
        assert_eq!(
            store.load_run(&gone.run_id),
            Err(PipelineError::RunNotFound(gone.run_id.clone()))
        );
        assert_eq!(store.get_output(&gone.run_id, "document")?, None);
        assert_eq!(store.get_output(&kept.run_id, "document")?, Some("text".to_string()));
        assert_eq!(store.list_runs()?.len(), 1);
        assert_eq!(
            store.delete_run(&gone.run_id),
            Err(PipelineError::RunNotFound(gone.run_id))
        );
        Ok(())
    }
}
