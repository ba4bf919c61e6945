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

//! cardsmith-core: turns documents into validated flashcard exports.
//!
//! The library holds the whole pipeline:
//! - Module registry and rule-based detection
//! - Extraction and card generation through a pluggable text generator
//! - The atomizer pass and its lineage arena
//! - Export rendering and the six validation levels
//! - The orchestrator, its run model and the run store contract

pub mod atomizer;
pub mod capability;
pub mod config;
pub mod detector;
pub mod error;
pub mod export;
pub mod extractor;
pub mod generator;
pub mod lineage;
pub mod markdown;
pub mod markup;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod text;
pub mod types;
pub mod validate;

// Re-exports for convenience
pub use capability::{GenerationRequest, TextGenerator};
pub use config::PipelineConfig;
pub use error::{ErrorReport, Fallible, PipelineError, fail};
pub use export::Artifact;
pub use orchestrator::{Pipeline, RunOutcome};
pub use registry::{CardFormat, ContentModule};
pub use store::{MemoryRunStore, RunStore};
pub use types::card::{Card, CardContent};
pub use types::document::Document;
pub use types::run::{PipelineRun, RunId, RunState, Stage};
pub use types::timestamp::Timestamp;
pub use validate::{ValidationReport, Validator};
