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

use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::registry::ContentModule;
use crate::types::timestamp::Timestamp;
use crate::validate::ValidationReport;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        RunId(id.into())
    }

    /// A fresh identifier. Unique within the process; the timestamp makes
    /// collisions across processes unlikely.
    pub fn generate(document_id: &str, now: Timestamp) -> Self {
        let count = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut hasher = blake3::Hasher::new();
        hasher.update(document_id.as_bytes());
        hasher.update(now.to_string().as_bytes());
        hasher.update(&count.to_le_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        let hex = hasher.finalize().to_hex();
        RunId(hex[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The pipeline stages, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detecting,
    Extracting,
    Generating,
    Optimizing,
    Formatting,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Detecting,
        Stage::Extracting,
        Stage::Generating,
        Stage::Optimizing,
        Stage::Formatting,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The key of this stage's output blob in the run store.
    pub fn key(self) -> &'static str {
        match self {
            Stage::Detecting => "detecting",
            Stage::Extracting => "extracting",
            Stage::Generating => "generating",
            Stage::Optimizing => "optimizing",
            Stage::Formatting => "formatting",
        }
    }

    /// The key under which partial output of a failed attempt is kept.
    pub fn partial_key(self) -> String {
        format!("{}.partial", self.key())
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Display for StageStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Completed => write!(f, "completed"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The run state machine:
///
/// pending -> detecting -> extracting -> generating -> optimizing -> formatting -> completed
///
/// with `failed` reachable from every non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Detecting,
    Extracting,
    Generating,
    Optimizing,
    Formatting,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl From<Stage> for RunState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Detecting => RunState::Detecting,
            Stage::Extracting => RunState::Extracting,
            Stage::Generating => RunState::Generating,
            Stage::Optimizing => RunState::Optimizing,
            Stage::Formatting => RunState::Formatting,
        }
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::Detecting => "detecting",
            RunState::Extracting => "extracting",
            RunState::Generating => "generating",
            RunState::Optimizing => "optimizing",
            RunState::Formatting => "formatting",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    /// Store key of the persisted output, once the stage has completed.
    pub output: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl StageRecord {
    fn new(stage: Stage) -> Self {
        StageRecord {
            stage,
            status: StageStatus::Pending,
            output: None,
            attempts: 0,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Why a run ended up `failed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: Option<Stage>,
    pub module: Option<ContentModule>,
    pub reason: String,
    pub cancelled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub document_id: String,
    /// Bumped by the store on every successful conditional update.
    pub version: u64,
    pub state: RunState,
    pub stages: [StageRecord; 5],
    pub cancel_requested: bool,
    pub failure: Option<RunFailure>,
    pub warnings: Vec<String>,
    pub reports: Vec<ValidationReport>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// The configuration the run was started with. Resuming uses it, not
    /// whatever configuration the resuming process has.
    #[serde(default)]
    pub config: PipelineConfig,
}

impl PipelineRun {
    pub fn new(run_id: RunId, document_id: impl Into<String>, now: Timestamp) -> Self {
        PipelineRun {
            run_id,
            document_id: document_id.into(),
            version: 0,
            state: RunState::Pending,
            stages: Stage::ALL.map(StageRecord::new),
            cancel_requested: false,
            failure: None,
            warnings: Vec::new(),
            reports: Vec::new(),
            created_at: now,
            updated_at: now,
            config: PipelineConfig::default(),
        }
    }

    pub fn stage(&self, stage: Stage) -> &StageRecord {
        &self.stages[stage.index()]
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageRecord {
        &mut self.stages[stage.index()]
    }

    /// The first stage that has not completed, if any.
    pub fn first_incomplete_stage(&self) -> Option<Stage> {
        self.stages
            .iter()
            .find(|record| record.status != StageStatus::Completed)
            .map(|record| record.stage)
    }

    /// The stage the run is in, or stopped in.
    pub fn current_stage(&self) -> Option<Stage> {
        match self.state {
            RunState::Detecting => Some(Stage::Detecting),
            RunState::Extracting => Some(Stage::Extracting),
            RunState::Generating => Some(Stage::Generating),
            RunState::Optimizing => Some(Stage::Optimizing),
            RunState::Formatting => Some(Stage::Formatting),
            RunState::Failed => self.failure.as_ref().and_then(|failure| failure.stage),
            RunState::Pending | RunState::Completed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::registry::CardFormat;

    fn now() -> Timestamp {
        let ndt = NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        Timestamp::new(ndt)
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = PipelineRun::new(RunId::new("r1"), "doc", now());
        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.version, 0);
        assert_eq!(run.first_incomplete_stage(), Some(Stage::Detecting));
        assert_eq!(run.current_stage(), None);
        for (record, stage) in run.stages.iter().zip(Stage::ALL) {
            assert_eq!(record.stage, stage);
            assert_eq!(record.status, StageStatus::Pending);
        }
    }

    #[test]
    fn test_first_incomplete_stage() {
        let mut run = PipelineRun::new(RunId::new("r1"), "doc", now());
        run.stage_mut(Stage::Detecting).status = StageStatus::Completed;
        run.stage_mut(Stage::Extracting).status = StageStatus::Completed;
        run.stage_mut(Stage::Generating).status = StageStatus::Failed;
        assert_eq!(run.first_incomplete_stage(), Some(Stage::Generating));
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = RunId::generate("doc", now());
        let b = RunId::generate("doc", now());
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn test_run_serialization() {
        let mut run = PipelineRun::new(RunId::new("r1"), "doc", now());
        run.state = RunState::Failed;
        run.failure = Some(RunFailure {
            stage: Some(Stage::Extracting),
            module: Some(ContentModule::Code),
            reason: "timed out".to_string(),
            cancelled: false,
        });
        run.config.default_format = CardFormat::Cloze;
        run.config.max_list_items = 5;
        let json = serde_json::to_string(&run).unwrap();
        let back: PipelineRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run);
        assert_eq!(back.current_stage(), Some(Stage::Extracting));
    }

    #[test]
    fn test_stage_keys() {
        assert_eq!(Stage::Generating.key(), "generating");
        assert_eq!(Stage::Generating.partial_key(), "generating.partial");
        assert_eq!(RunState::from(Stage::Optimizing).to_string(), "optimizing");
    }
}
