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

use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;
use std::string::FromUtf8Error;

use serde::Deserialize;
use serde::Serialize;

use crate::registry::ContentModule;
use crate::types::card_id::CardId;
use crate::types::run::RunId;
use crate::types::run::Stage;

#[derive(Debug, PartialEq)]
pub struct ErrorReport {
    message: String,
}

impl ErrorReport {
    pub fn new(msg: impl Into<String>) -> Self {
        ErrorReport {
            message: msg.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for ErrorReport {
    fn from(value: std::io::Error) -> Self {
        ErrorReport {
            message: format!("I/O error: {value:#?}"),
        }
    }
}

impl From<FromUtf8Error> for ErrorReport {
    fn from(value: FromUtf8Error) -> Self {
        ErrorReport {
            message: format!("UTF-8 conversion error: {value:#?}"),
        }
    }
}

impl From<serde_json::Error> for ErrorReport {
    fn from(value: serde_json::Error) -> Self {
        ErrorReport {
            message: format!("JSON error: {value:#?}"),
        }
    }
}

impl From<toml::de::Error> for ErrorReport {
    fn from(value: toml::de::Error) -> Self {
        ErrorReport {
            message: format!("TOML error: {value}"),
        }
    }
}

impl From<regex::Error> for ErrorReport {
    fn from(value: regex::Error) -> Self {
        ErrorReport {
            message: format!("invalid pattern: {value}"),
        }
    }
}

impl From<PipelineError> for ErrorReport {
    fn from(value: PipelineError) -> Self {
        ErrorReport {
            message: value.to_string(),
        }
    }
}

impl Display for ErrorReport {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "error: {}", self.message)
    }
}

impl Error for ErrorReport {
    fn description(&self) -> &str {
        &self.message
    }
}

pub type Fallible<T> = Result<T, ErrorReport>;

pub fn fail<T>(msg: impl Into<String>) -> Fallible<T> {
    Err(ErrorReport {
        message: msg.into(),
    })
}

/// Which markup invariant the optimizer broke.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantKind {
    /// Math delimiter pairs or their content changed.
    MathConservation,
    /// Blank markers changed, went missing, or are not numbered from 1.
    MarkerSequence,
    /// The `origin_id` relation is not a forest, or points outside the run.
    Lineage,
}

impl Display for InvariantKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InvariantKind::MathConservation => write!(f, "math delimiter conservation"),
            InvariantKind::MarkerSequence => write!(f, "blank marker sequence"),
            InvariantKind::Lineage => write!(f, "card lineage"),
        }
    }
}

/// Errors surfaced by the pipeline stages and the orchestrator.
#[derive(Debug, PartialEq)]
pub enum PipelineError {
    NoApplicableModule,
    ExtractionFailed {
        module: ContentModule,
        cause: String,
    },
    GenerationFailed {
        module: ContentModule,
        cause: String,
    },
    /// Warning-level: every candidate card of a module was rejected.
    GenerationRejectedAll { module: ContentModule },
    OptimizationInvariantViolated {
        kind: InvariantKind,
        card: Option<CardId>,
        rule: String,
    },
    ValidationFailed {
        level: u8,
        diagnostics: Vec<String>,
    },
    StageTimeout { stage: Stage },
    Cancelled,
    VersionConflict {
        run_id: RunId,
        expected: u64,
        found: u64,
    },
    RunNotFound(RunId),
    NotResumable { run_id: RunId, state: String },
    /// The run may still be executing and was not forced.
    RunInProgress { run_id: RunId, state: String },
    Store(String),
}

impl PipelineError {
    /// Warning-level errors are recorded on the run but never fail it.
    pub fn is_warning(&self) -> bool {
        matches!(self, PipelineError::GenerationRejectedAll { .. })
    }
}

impl Display for PipelineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::NoApplicableModule => {
                write!(f, "no content module applies to the document")
            }
            PipelineError::ExtractionFailed { module, cause } => {
                write!(f, "extraction failed for module {module}: {cause}")
            }
            PipelineError::GenerationFailed { module, cause } => {
                write!(f, "generation failed for module {module}: {cause}")
            }
            PipelineError::GenerationRejectedAll { module } => {
                write!(f, "every generated card for module {module} was rejected")
            }
            PipelineError::OptimizationInvariantViolated { kind, card, rule } => match card {
                Some(card) => write!(
                    f,
                    "optimization broke {kind} on card {card} (rule: {rule})"
                ),
                None => write!(f, "optimization broke {kind} (rule: {rule})"),
            },
            PipelineError::ValidationFailed { level, diagnostics } => {
                write!(f, "validation level {level} failed: {}", diagnostics.join("; "))
            }
            PipelineError::StageTimeout { stage } => write!(f, "stage {stage} timed out"),
            PipelineError::Cancelled => write!(f, "run was cancelled"),
            PipelineError::VersionConflict {
                run_id,
                expected,
                found,
            } => write!(
                f,
                "run {run_id} was modified concurrently (expected version {expected}, found {found})"
            ),
            PipelineError::RunNotFound(run_id) => write!(f, "run {run_id} not found"),
            PipelineError::NotResumable { run_id, state } => {
                write!(f, "run {run_id} cannot be resumed from state {state}")
            }
            PipelineError::RunInProgress { run_id, state } => {
                write!(f, "run {run_id} is still in progress (state {state})")
            }
            PipelineError::Store(message) => write!(f, "run store error: {message}"),
        }
    }
}

impl Error for PipelineError {}

impl From<ErrorReport> for PipelineError {
    fn from(value: ErrorReport) -> Self {
        PipelineError::Store(value.message)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(value: serde_json::Error) -> Self {
        PipelineError::Store(format!("JSON error: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display() {
        let err = ErrorReport::new("directory does not exist.");
        assert_eq!(err.to_string(), "error: directory does not exist.");
    }

    #[test]
    fn test_pipeline_error_into_report() {
        let err: ErrorReport = PipelineError::ExtractionFailed {
            module: ContentModule::Vocabulary,
            cause: "empty response".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "error: extraction failed for module vocabulary: empty response"
        );
    }

    #[test]
    fn test_only_rejected_all_is_a_warning() {
        assert!(
            PipelineError::GenerationRejectedAll {
                module: ContentModule::Code
            }
            .is_warning()
        );
        assert!(!PipelineError::Cancelled.is_warning());
        assert!(
            !PipelineError::StageTimeout {
                stage: Stage::Extracting
            }
            .is_warning()
        );
    }
}
