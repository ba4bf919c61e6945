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

//! Drives a run through its stages. A stage's output is written to the run
//! store before the next stage starts, so a resumed run only redoes the
//! stage that was interrupted. Run records are written with a conditional
//! update on the version last seen, which keeps a stale attempt of a run
//! from overwriting a newer one.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;

use crate::atomizer::AtomizerSettings;
use crate::atomizer::Optimized;
use crate::atomizer::optimize;
use crate::capability::CallPolicy;
use crate::capability::TextGenerator;
use crate::config::PipelineConfig;
use crate::detector::Detector;
use crate::error::Fallible;
use crate::error::PipelineError;
use crate::export::Artifact;
use crate::export::group_by_format;
use crate::export::render_artifact;
use crate::extractor::ModuleExtraction;
use crate::extractor::extract;
use crate::generator::BatchReport;
use crate::generator::generate;
use crate::registry::CardFormat;
use crate::registry::ContentModule;
use crate::store::RunStore;
use crate::types::card::Card;
use crate::types::document::Document;
use crate::types::item::ExtractedItem;
use crate::types::run::PipelineRun;
use crate::types::run::RunFailure;
use crate::types::run::RunId;
use crate::types::run::RunState;
use crate::types::run::Stage;
use crate::types::run::StageStatus;
use crate::types::timestamp::Timestamp;
use crate::validate::ValidationReport;
use crate::validate::Validator;
use crate::validate::first_failure;

/// Store key of the document text.
pub const DOCUMENT_KEY: &str = "document";

/// Conditional writes a cancel request retries before giving up.
const CANCEL_ATTEMPTS: usize = 8;

/// Output of the generating stage: every batch's cards, concatenated in
/// (module, format) order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Generated {
    pub batches: Vec<BatchReport>,
    pub cards: Vec<Card>,
}

/// What a completed run produced.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    pub run: PipelineRun,
    pub artifacts: Vec<Artifact>,
    pub reports: Vec<ValidationReport>,
    pub warnings: Vec<String>,
}

struct StageOutput {
    blob: String,
    warnings: Vec<String>,
    reports: Vec<ValidationReport>,
}

impl StageOutput {
    fn new(blob: String) -> Self {
        StageOutput {
            blob,
            warnings: Vec::new(),
            reports: Vec::new(),
        }
    }
}

struct StageFailure {
    error: PipelineError,
    module: Option<ContentModule>,
    /// Whatever the stage finished before failing, kept for inspection.
    partial: Option<String>,
    reports: Vec<ValidationReport>,
}

impl From<PipelineError> for StageFailure {
    fn from(error: PipelineError) -> Self {
        StageFailure {
            error,
            module: None,
            partial: None,
            reports: Vec::new(),
        }
    }
}

type StageResult = Result<StageOutput, StageFailure>;

fn encode<T: Serialize>(value: &T) -> Result<String, PipelineError> {
    Ok(serde_json::to_string(value)?)
}

pub struct Pipeline<G, S> {
    generator: Arc<G>,
    store: Arc<S>,
    config: PipelineConfig,
    validator: Validator,
}

impl<G: TextGenerator, S: RunStore> Pipeline<G, S> {
    pub fn new(generator: Arc<G>, store: Arc<S>, config: PipelineConfig) -> Fallible<Self> {
        config.validate()?;
        let validator = Validator::new()?;
        Ok(Pipeline {
            generator,
            store,
            config,
            validator,
        })
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The configuration new runs start with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Record a new pending run for the document without running it. The
    /// run keeps a copy of the pipeline's configuration.
    pub fn start(&self, document: &Document) -> Result<RunId, PipelineError> {
        let now = Timestamp::now();
        let mut run = PipelineRun::new(RunId::generate(document.id(), now), document.id(), now);
        run.config = self.config.clone();
        self.store
            .put_output(&run.run_id, DOCUMENT_KEY, document.text())?;
        self.store.create_run(&run)?;
        log::info!("Created run {} for document {}.", run.run_id, document.id());
        Ok(run.run_id)
    }

    /// Run a document from scratch.
    pub async fn submit(&self, document: &Document) -> Result<RunOutcome, PipelineError> {
        let run_id = self.start(document)?;
        self.resume(&run_id).await
    }

    /// Continue a run from its first incomplete stage. Completed stages are
    /// not redone: their persisted outputs feed the remaining stages.
    pub async fn resume(&self, run_id: &RunId) -> Result<RunOutcome, PipelineError> {
        let mut run = self.store.load_run(run_id)?;
        match run.state {
            RunState::Completed => {
                return Err(PipelineError::NotResumable {
                    run_id: run_id.clone(),
                    state: run.state.to_string(),
                });
            }
            RunState::Pending => {}
            RunState::Failed => {
                log::info!(
                    "Resuming run {run_id} from stage {}.",
                    run.first_incomplete_stage()
                        .map_or("completion".to_string(), |stage| stage.to_string())
                );
                run.state = RunState::Pending;
                run.failure = None;
                run.cancel_requested = false;
                self.save(&mut run)?;
            }
            _ => {
                if run.cancel_requested {
                    let stage = run.current_stage();
                    return Err(self.fail(&mut run, stage, None, PipelineError::Cancelled));
                }
                // Bumping the version turns any attempt still in flight stale.
                log::info!("Taking over run {run_id} in state {}.", run.state);
                self.save(&mut run)?;
            }
        }
        self.drive(run).await
    }

    /// Ask a run to stop. The driver notices between stages and discards
    /// the results of the stage in flight. A run that never started is
    /// failed on the spot; a finished run is returned as is.
    pub fn cancel(&self, run_id: &RunId) -> Result<PipelineRun, PipelineError> {
        let mut conflict = None;
        for _ in 0..CANCEL_ATTEMPTS {
            let mut run = self.store.load_run(run_id)?;
            if run.is_terminal() || run.cancel_requested {
                return Ok(run);
            }
            run.cancel_requested = true;
            if run.state == RunState::Pending {
                mark_failed(&mut run, None, None, &PipelineError::Cancelled);
            }
            match self.save_raw(&mut run) {
                Ok(()) => {
                    log::info!("Cancellation requested for run {run_id} (state {}).", run.state);
                    return Ok(run);
                }
                Err(err @ PipelineError::VersionConflict { .. }) => conflict = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(conflict.unwrap_or_else(|| PipelineError::Store(format!("could not cancel run {run_id}"))))
    }

    pub fn status(&self, run_id: &RunId) -> Result<PipelineRun, PipelineError> {
        self.store.load_run(run_id)
    }

    /// Remove a run and everything stored for it. A run that may still be
    /// executing is only removed when `force` is set.
    pub fn delete(&self, run_id: &RunId, force: bool) -> Result<PipelineRun, PipelineError> {
        let run = self.store.load_run(run_id)?;
        let active = !run.is_terminal() && run.state != RunState::Pending;
        if active && !force {
            return Err(PipelineError::RunInProgress {
                run_id: run_id.clone(),
                state: run.state.to_string(),
            });
        }
        self.store.delete_run(run_id)?;
        log::info!("Deleted run {run_id} (state {}).", run.state);
        Ok(run)
    }

    /// The outcome of a completed run, or `None` if it has not completed.
    pub fn outcome(&self, run_id: &RunId) -> Result<Option<RunOutcome>, PipelineError> {
        let run = self.store.load_run(run_id)?;
        if run.state != RunState::Completed {
            return Ok(None);
        }
        self.assemble(run).map(Some)
    }

    fn assemble(&self, run: PipelineRun) -> Result<RunOutcome, PipelineError> {
        let artifacts: Vec<Artifact> = self.input(&run.run_id, Stage::Formatting)?;
        Ok(RunOutcome {
            reports: run.reports.clone(),
            warnings: run.warnings.clone(),
            artifacts,
            run,
        })
    }

    async fn drive(&self, mut run: PipelineRun) -> Result<RunOutcome, PipelineError> {
        let run_id = run.run_id.clone();
        let document: Arc<str> = self
            .store
            .get_output(&run_id, DOCUMENT_KEY)?
            .ok_or_else(|| PipelineError::Store(format!("run {run_id} has no stored document")))?
            .into();
        let config = run.config.clone();
        while let Some(stage) = run.first_incomplete_stage() {
            if run.cancel_requested {
                return Err(self.fail(&mut run, Some(stage), None, PipelineError::Cancelled));
            }
            self.begin(&mut run, stage)?;
            let result = match stage {
                Stage::Detecting => self.detect(&config, &document),
                Stage::Extracting => self.extract_all(&run_id, &config, &document).await,
                Stage::Generating => self.generate_all(&run_id, &config).await,
                Stage::Optimizing => self.optimize(&run_id, &config),
                Stage::Formatting => self.format(&run_id),
            };
            match result {
                Ok(output) => self.complete(&mut run, stage, output)?,
                Err(failure) => return Err(self.abandon(&mut run, stage, failure)),
            }
        }
        run.state = RunState::Completed;
        self.save(&mut run)?;
        log::info!(
            "Run {run_id} completed with {} warning(s) (version {}).",
            run.warnings.len(),
            run.version
        );
        self.assemble(run)
    }

    fn begin(&self, run: &mut PipelineRun, stage: Stage) -> Result<(), PipelineError> {
        run.state = RunState::from(stage);
        let record = run.stage_mut(stage);
        record.status = StageStatus::Running;
        record.attempts += 1;
        record.error = None;
        record.started_at = Some(Timestamp::now());
        record.finished_at = None;
        let attempt = record.attempts;
        self.save(run)?;
        log::info!(
            "Run {}: stage {stage} started (attempt {attempt}, version {}).",
            run.run_id,
            run.version
        );
        Ok(())
    }

    fn complete(&self, run: &mut PipelineRun, stage: Stage, output: StageOutput) -> Result<(), PipelineError> {
        let mut next = run.clone();
        for warning in &output.warnings {
            next.add_warning(warning.clone());
        }
        if !output.reports.is_empty() {
            next.reports = output.reports;
        }
        let record = next.stage_mut(stage);
        record.status = StageStatus::Completed;
        record.output = Some(stage.key().to_string());
        record.finished_at = Some(Timestamp::now());
        next.updated_at = Timestamp::now();
        // The output lands together with the record, and only if nobody
        // wrote the run since this attempt began.
        match self
            .store
            .commit_output(&next, run.version, stage.key(), &output.blob)
        {
            Ok(version) => {
                next.version = version;
                for warning in &output.warnings {
                    log::warn!("Run {}: {warning}", run.run_id);
                }
                *run = next;
            }
            Err(conflict @ PipelineError::VersionConflict { .. }) => return Err(self.settle(run, conflict)),
            Err(err) => return Err(err),
        }
        log::info!(
            "Run {}: stage {stage} completed (version {}).",
            run.run_id,
            run.version
        );
        Ok(())
    }

    fn abandon(&self, run: &mut PipelineRun, stage: Stage, failure: StageFailure) -> PipelineError {
        if let Some(partial) = &failure.partial {
            if let Err(e) = self.store.put_output(&run.run_id, &stage.partial_key(), partial) {
                log::error!("Run {}: could not keep partial {stage} output: {e}", run.run_id);
            }
        }
        if !failure.reports.is_empty() {
            run.reports = failure.reports;
        }
        self.fail(run, Some(stage), failure.module, failure.error)
    }

    fn fail(
        &self,
        run: &mut PipelineRun,
        stage: Option<Stage>,
        module: Option<ContentModule>,
        error: PipelineError,
    ) -> PipelineError {
        mark_failed(run, stage, module, &error);
        match stage {
            Some(stage) => log::error!("Run {} failed at stage {stage}: {error}", run.run_id),
            None => log::error!("Run {} failed: {error}", run.run_id),
        }
        match self.save(run) {
            Ok(()) => error,
            Err(err) => err,
        }
    }

    /// Write the run, resolving a version conflict.
    fn save(&self, run: &mut PipelineRun) -> Result<(), PipelineError> {
        match self.save_raw(run) {
            Err(conflict @ PipelineError::VersionConflict { .. }) => Err(self.settle(run, conflict)),
            other => other,
        }
    }

    fn save_raw(&self, run: &mut PipelineRun) -> Result<(), PipelineError> {
        run.updated_at = Timestamp::now();
        run.version = self.store.update_run(run, run.version)?;
        Ok(())
    }

    /// Someone else wrote the run. If it was a cancel request, honour it;
    /// otherwise this attempt is stale and stops without writing.
    fn settle(&self, run: &mut PipelineRun, conflict: PipelineError) -> PipelineError {
        let mut stored = match self.store.load_run(&run.run_id) {
            Ok(stored) => stored,
            Err(err) => return err,
        };
        if stored.cancel_requested && !stored.is_terminal() {
            let stage = stored.current_stage();
            mark_failed(&mut stored, stage, None, &PipelineError::Cancelled);
            if let Err(err) = self.save_raw(&mut stored) {
                return err;
            }
            log::info!("Run {} cancelled; in-flight results discarded.", stored.run_id);
            *run = stored;
            return PipelineError::Cancelled;
        }
        log::warn!("Run {}: abandoning stale attempt: {conflict}", run.run_id);
        conflict
    }

    fn input<T: DeserializeOwned>(&self, run_id: &RunId, stage: Stage) -> Result<T, PipelineError> {
        let blob = self
            .store
            .get_output(run_id, stage.key())?
            .ok_or_else(|| PipelineError::Store(format!("run {run_id} has no {stage} output")))?;
        Ok(serde_json::from_str(&blob)?)
    }

    fn detect(&self, config: &PipelineConfig, document: &str) -> StageResult {
        let detector = Detector::new(config.modules.clone()).map_err(PipelineError::from)?;
        let modules = detector.detect(document)?;
        log::info!(
            "Detected modules: {}.",
            modules
                .iter()
                .map(|module| module.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(StageOutput::new(encode(&modules)?))
    }

    async fn extract_all(&self, run_id: &RunId, config: &PipelineConfig, document: &Arc<str>) -> StageResult {
        let modules: Vec<ContentModule> = self.input(run_id, Stage::Detecting)?;
        let policy = CallPolicy::from(config);
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::new();
        for module in modules {
            let generator = Arc::clone(&self.generator);
            let document = Arc::clone(document);
            let handle = tasks.spawn(async move {
                (module, extract(generator.as_ref(), module, &document, policy).await)
            });
            spawned.insert(handle.id(), module);
        }
        let mut done: BTreeMap<ContentModule, ModuleExtraction> = BTreeMap::new();
        let mut failed: BTreeMap<ContentModule, PipelineError> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((module, Ok(extraction))) => {
                    done.insert(module, extraction);
                }
                Ok((module, Err(error))) => {
                    failed.insert(module, error);
                }
                Err(e) => {
                    if let Some(&module) = spawned.get(&e.id()) {
                        let cause = format!("extraction task did not finish: {e}");
                        failed.insert(module, PipelineError::ExtractionFailed { module, cause });
                    }
                }
            }
        }
        let extractions: Vec<ModuleExtraction> = done.into_values().collect();
        if let Some((module, error)) = failed.into_iter().next() {
            return Err(StageFailure {
                error,
                module: Some(module),
                partial: encode(&extractions).ok(),
                reports: Vec::new(),
            });
        }
        let mut warnings = Vec::new();
        for extraction in &extractions {
            warnings.extend(extraction.dropped.iter().cloned());
            if extraction.is_empty() {
                warnings.push(format!("module {} yielded no items", extraction.module));
            }
        }
        Ok(StageOutput {
            blob: encode(&extractions)?,
            warnings,
            reports: Vec::new(),
        })
    }

    async fn generate_all(&self, run_id: &RunId, config: &PipelineConfig) -> StageResult {
        let extractions: Vec<ModuleExtraction> = self.input(run_id, Stage::Extracting)?;
        let policy = CallPolicy::from(config);
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::new();
        for extraction in extractions {
            let module = extraction.module;
            if extraction.is_empty() {
                log::info!("Skipping module {module}: nothing was extracted.");
                continue;
            }
            if !config.generates(module) {
                log::info!("Skipping module {module}: extracted only.");
                continue;
            }
            let items: Arc<[ExtractedItem]> = extraction.items.into();
            for format in config.formats_for(module) {
                let generator = Arc::clone(&self.generator);
                let items = Arc::clone(&items);
                let targets = config.taxonomy.clone();
                let handle = tasks.spawn(async move {
                    let batch = generate(generator.as_ref(), module, format, &items, policy, &targets).await;
                    ((module, format), batch)
                });
                spawned.insert(handle.id(), (module, format));
            }
        }
        let mut results: BTreeMap<(ContentModule, CardFormat), Result<_, PipelineError>> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, batch)) => {
                    results.insert(key, batch);
                }
                Err(e) => {
                    if let Some(&(module, format)) = spawned.get(&e.id()) {
                        let cause = format!("{format} generation task did not finish: {e}");
                        results.insert((module, format), Err(PipelineError::GenerationFailed { module, cause }));
                    }
                }
            }
        }
        let mut generated = Generated {
            batches: Vec::new(),
            cards: Vec::new(),
        };
        let mut warnings = Vec::new();
        let mut failure = None;
        for ((module, _), result) in results {
            match result {
                Ok(batch) => {
                    generated.cards.extend(batch.cards);
                    generated.batches.push(batch.report);
                }
                Err(error) if error.is_warning() => warnings.push(error.to_string()),
                Err(error) => {
                    if failure.is_none() {
                        failure = Some((module, error));
                    }
                }
            }
        }
        if let Some((module, error)) = failure {
            return Err(StageFailure {
                error,
                module: Some(module),
                partial: encode(&generated).ok(),
                reports: Vec::new(),
            });
        }
        if generated.cards.is_empty() {
            warnings.push("no cards were generated".to_string());
        }
        Ok(StageOutput {
            blob: encode(&generated)?,
            warnings,
            reports: Vec::new(),
        })
    }

    fn optimize(&self, run_id: &RunId, config: &PipelineConfig) -> StageResult {
        let generated: Generated = self.input(run_id, Stage::Generating)?;
        let settings = AtomizerSettings::from(config);
        let optimized = optimize(generated.cards, &settings).inspect_err(|e| {
            log::error!("Run {run_id}: {e}");
        })?;
        Ok(StageOutput::new(encode(&optimized)?))
    }

    fn format(&self, run_id: &RunId) -> StageResult {
        let optimized: Optimized = self.input(run_id, Stage::Optimizing)?;
        let mut artifacts = Vec::new();
        let mut reports = Vec::new();
        for (format, cards) in group_by_format(&optimized.cards) {
            let artifact = render_artifact(format, &cards);
            let checked = self.validator.validate(format, &artifact.text, &cards);
            let failure = first_failure(&checked);
            reports.extend(checked);
            artifacts.push(artifact);
            if let Some(error) = failure {
                return Err(StageFailure {
                    error,
                    module: None,
                    partial: encode(&artifacts).ok(),
                    reports,
                });
            }
        }
        for artifact in &artifacts {
            log::info!("Run {run_id}: {} export with {} cards.", artifact.format, artifact.cards);
        }
        Ok(StageOutput {
            blob: encode(&artifacts)?,
            warnings: Vec::new(),
            reports,
        })
    }
}

fn mark_failed(
    run: &mut PipelineRun,
    stage: Option<Stage>,
    module: Option<ContentModule>,
    error: &PipelineError,
) {
    let now = Timestamp::now();
    if let Some(stage) = stage {
        let record = run.stage_mut(stage);
        if record.status == StageStatus::Running {
            record.status = StageStatus::Failed;
            record.error = Some(error.to_string());
            record.finished_at = Some(now);
        }
    }
    run.state = RunState::Failed;
    run.failure = Some(RunFailure {
        stage,
        module,
        reason: error.to_string(),
        cancelled: *error == PipelineError::Cancelled,
    });
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::capability::RequestKind;
    use crate::capability::scripted::*;
    use crate::error::ErrorReport;
    use crate::store::MemoryRunStore;

    const FORMULA_DOC: &str = "The output is computed as follows.\n\noutput = g(state)\n";
    const MOORE_DOC: &str = "A Moore machine is a finite-state machine whose output depends only on its current state.\n\noutput = g(state)\n";

    const FORMULA_ITEMS: &str = r#"{"items": [{"formula": "output = g(state)", "description": "Output of a Moore machine", "variables": {"state": "the current state"}}]}"#;
    const FORMULA_CARDS: &str = r#"```json
{"cards": [{"front": "What is the output equation of a Moore machine?", "back": "\\(output = g(state)\\)", "item": 0, "bloom": "recall"}]}
```"#;
    const FORMULA_CLOZE: &str = r#"{"cards": [{"text": "A Moore machine computes its output as {{c1::\\(output = g(state)\\)}}.", "item": 0}]}"#;
    const TERM_ITEMS: &str = r#"{"items": [{"term": "Moore machine", "definition": "A finite-state machine whose output depends only on its current state"}]}"#;
    const TERM_CARDS: &str = r#"{"cards": [{"front": "What does a Moore machine's output depend on?", "back": "Only on its current state; it ignores \"inputs\"", "item": 0}]}"#;

    type TestPipeline = Pipeline<ScriptedGenerator, MemoryRunStore>;

    fn config(modules: &[ContentModule]) -> PipelineConfig {
        PipelineConfig {
            max_attempts: 1,
            modules: Some(modules.iter().copied().collect::<BTreeSet<_>>()),
            ..PipelineConfig::default()
        }
    }

    fn pipeline(generator: ScriptedGenerator, config: PipelineConfig) -> Fallible<Arc<TestPipeline>> {
        let pipeline = Pipeline::new(Arc::new(generator), Arc::new(MemoryRunStore::new()), config)?;
        Ok(Arc::new(pipeline))
    }

    fn formula_generator() -> ScriptedGenerator {
        ScriptedGenerator::new()
            .on_extract(ContentModule::MathFormulas, vec![text(FORMULA_ITEMS)])
            .on_generate(ContentModule::MathFormulas, CardFormat::Basic, vec![text(FORMULA_CARDS)])
    }

    fn moore_generator(vocabulary_cards: Vec<Reply>) -> ScriptedGenerator {
        formula_generator()
            .on_extract(ContentModule::Vocabulary, vec![text(TERM_ITEMS)])
            .on_generate(ContentModule::Vocabulary, CardFormat::Basic, vocabulary_cards)
    }

    const BOTH: &[ContentModule] = &[ContentModule::Vocabulary, ContentModule::MathFormulas];

    async fn wait_for_call(pipeline: &TestPipeline, kind: RequestKind, module: ContentModule) {
        while pipeline.generator().call_count(kind, module) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn spawn_driver(
        pipeline: &Arc<TestPipeline>,
        run_id: &RunId,
    ) -> tokio::task::JoinHandle<Result<RunOutcome, PipelineError>> {
        let pipeline = Arc::clone(pipeline);
        let run_id = run_id.clone();
        tokio::spawn(async move { pipeline.resume(&run_id).await })
    }

    #[tokio::test]
    async fn test_formula_survives_to_export() -> Fallible<()> {
        let pipeline = pipeline(formula_generator(), PipelineConfig::default())?;
        let outcome = pipeline.submit(&Document::new("moore", FORMULA_DOC)).await?;
        assert_eq!(outcome.run.state, RunState::Completed);
        assert_eq!(outcome.artifacts.len(), 1);
        let artifact = &outcome.artifacts[0];
        assert_eq!(artifact.format, CardFormat::Basic);
        assert_eq!(
            artifact.text,
            "#separator:;\n#html:true\nWhat is the output equation of a Moore machine?;\\(output = g(state)\\)\n"
        );
        let levels: Vec<(u8, bool)> = outcome.reports.iter().map(|r| (r.level, r.passed)).collect();
        assert_eq!(
            levels,
            vec![(1, true), (2, true), (3, true), (4, true), (5, true), (6, true)]
        );
        for stage in Stage::ALL {
            let record = outcome.run.stage(stage);
            assert_eq!(record.status, StageStatus::Completed);
            assert_eq!(record.attempts, 1);
            assert!(pipeline.store().get_output(&outcome.run.run_id, stage.key())?.is_some());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_quoted_answer_passes_field_separation() -> Fallible<()> {
        let generator = moore_generator(vec![text(TERM_CARDS)]);
        let pipeline = pipeline(generator, config(BOTH))?;
        let outcome = pipeline.submit(&Document::new("moore", MOORE_DOC)).await?;
        let text = &outcome.artifacts[0].text;
        assert!(text.contains(r#";"Only on its current state; it ignores ""inputs""""#));
        assert_eq!(outcome.artifacts[0].cards, 2);
        assert!(outcome.reports.iter().all(|r| r.passed));
        let generated: Generated = pipeline.input(&outcome.run.run_id, Stage::Generating)?;
        assert_eq!(generated.batches.len(), 2);
        assert_eq!(generated.batches[0].module, ContentModule::Vocabulary);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_applicable_module_fails_the_run() -> Fallible<()> {
        let pipeline = pipeline(ScriptedGenerator::new(), PipelineConfig::default())?;
        let result = pipeline.submit(&Document::new("short", "ok")).await;
        assert_eq!(result.err(), Some(PipelineError::NoApplicableModule));
        let runs = pipeline.store().list_runs()?;
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.state, RunState::Failed);
        let failure = run.failure.clone().ok_or_else(|| ErrorReport::new("no failure"))?;
        assert_eq!(failure.stage, Some(Stage::Detecting));
        assert!(!failure.cancelled);
        assert_eq!(run.stage(Stage::Detecting).status, StageStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_resumed_run_matches_clean_run() -> Fallible<()> {
        let clean = pipeline(moore_generator(vec![text(TERM_CARDS)]), config(BOTH))?;
        let expected = clean.submit(&Document::new("moore", MOORE_DOC)).await?;

        let flaky = moore_generator(vec![Reply::Fail("service unavailable".to_string()), text(TERM_CARDS)]);
        let pipeline = pipeline(flaky, config(BOTH))?;
        let result = pipeline.submit(&Document::new("moore", MOORE_DOC)).await;
        assert_eq!(
            result.err(),
            Some(PipelineError::GenerationFailed {
                module: ContentModule::Vocabulary,
                cause: "service unavailable".to_string(),
            })
        );
        let run_id = pipeline.store().list_runs()?[0].run_id.clone();
        let failed = pipeline.status(&run_id)?;
        let failure = failed.failure.clone().ok_or_else(|| ErrorReport::new("no failure"))?;
        assert_eq!(failure.stage, Some(Stage::Generating));
        assert_eq!(failure.module, Some(ContentModule::Vocabulary));
        let partial = pipeline
            .store()
            .get_output(&run_id, &Stage::Generating.partial_key())?
            .ok_or_else(|| ErrorReport::new("no partial output"))?;
        let partial: Generated = serde_json::from_str(&partial)?;
        assert_eq!(partial.cards.len(), 1);
        assert_eq!(partial.cards[0].module, ContentModule::MathFormulas);

        let resumed = pipeline.resume(&run_id).await?;
        assert_eq!(resumed.artifacts, expected.artifacts);
        assert_eq!(resumed.reports, expected.reports);
        assert_eq!(resumed.run.stage(Stage::Detecting).attempts, 1);
        assert_eq!(resumed.run.stage(Stage::Extracting).attempts, 1);
        assert_eq!(resumed.run.stage(Stage::Generating).attempts, 2);
        assert_eq!(
            pipeline.generator().call_count(RequestKind::Extract, ContentModule::Vocabulary),
            1
        );
        Ok(())
    }

    fn cloze_config() -> PipelineConfig {
        PipelineConfig {
            default_format: CardFormat::Cloze,
            ..config(&[ContentModule::MathFormulas])
        }
    }

    #[tokio::test]
    async fn test_resume_uses_the_configuration_the_run_started_with() -> Fallible<()> {
        let clean = ScriptedGenerator::new()
            .on_extract(ContentModule::MathFormulas, vec![text(FORMULA_ITEMS)])
            .on_generate(ContentModule::MathFormulas, CardFormat::Cloze, vec![text(FORMULA_CLOZE)]);
        let clean = pipeline(clean, cloze_config())?;
        let expected = clean.submit(&Document::new("moore", FORMULA_DOC)).await?;
        assert_eq!(expected.artifacts[0].format, CardFormat::Cloze);

        let generator = Arc::new(
            ScriptedGenerator::new()
                .on_extract(ContentModule::MathFormulas, vec![text(FORMULA_ITEMS)])
                .on_generate(
                    ContentModule::MathFormulas,
                    CardFormat::Cloze,
                    vec![Reply::Fail("service unavailable".to_string()), text(FORMULA_CLOZE)],
                )
                .on_generate(ContentModule::MathFormulas, CardFormat::Basic, vec![text(FORMULA_CARDS)]),
        );
        let store = Arc::new(MemoryRunStore::new());
        let first = Pipeline::new(Arc::clone(&generator), Arc::clone(&store), cloze_config())?;
        let result = first.submit(&Document::new("moore", FORMULA_DOC)).await;
        assert!(matches!(result, Err(PipelineError::GenerationFailed { .. })));
        let run_id = store.list_runs()?[0].run_id.clone();
        assert_eq!(store.load_run(&run_id)?.config, cloze_config());

        // Another process, configured with the defaults, picks the run up.
        let second = Pipeline::new(Arc::clone(&generator), Arc::clone(&store), PipelineConfig::default())?;
        let resumed = second.resume(&run_id).await?;
        assert_eq!(resumed.artifacts, expected.artifacts);
        assert_eq!(resumed.run.config, cloze_config());
        assert_eq!(
            generator.call_count(RequestKind::Generate, ContentModule::MathFormulas),
            2
        );
        assert!(
            generator
                .calls()
                .iter()
                .all(|call| call.format != Some(CardFormat::Basic))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_refuses_active_runs_unless_forced() -> Fallible<()> {
        let gate = Arc::new(Notify::new());
        let generator = ScriptedGenerator::new()
            .on_extract(
                ContentModule::MathFormulas,
                vec![Reply::Gate(Arc::clone(&gate), FORMULA_ITEMS.to_string())],
            )
            .on_generate(ContentModule::MathFormulas, CardFormat::Basic, vec![text(FORMULA_CARDS)]);
        let pipeline = pipeline(generator, PipelineConfig::default())?;
        let run_id = pipeline.start(&Document::new("moore", FORMULA_DOC))?;
        let driver = spawn_driver(&pipeline, &run_id);
        wait_for_call(&pipeline, RequestKind::Extract, ContentModule::MathFormulas).await;

        assert_eq!(
            pipeline.delete(&run_id, false).err(),
            Some(PipelineError::RunInProgress {
                run_id: run_id.clone(),
                state: "extracting".to_string(),
            })
        );
        let deleted = pipeline.delete(&run_id, true)?;
        assert_eq!(deleted.state, RunState::Extracting);
        gate.notify_one();
        let result = driver.await.map_err(|e| ErrorReport::new(e.to_string()))?;
        assert_eq!(result.err(), Some(PipelineError::RunNotFound(run_id.clone())));
        assert_eq!(pipeline.status(&run_id), Err(PipelineError::RunNotFound(run_id.clone())));
        assert_eq!(pipeline.store().get_output(&run_id, DOCUMENT_KEY)?, None);
        assert_eq!(pipeline.store().get_output(&run_id, Stage::Extracting.key())?, None);

        gate.notify_one();
        let outcome = pipeline.submit(&Document::new("moore", FORMULA_DOC)).await?;
        pipeline.delete(&outcome.run.run_id, false)?;
        assert!(pipeline.store().list_runs()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_completed_run_is_not_resumable() -> Fallible<()> {
        let pipeline = pipeline(formula_generator(), PipelineConfig::default())?;
        let outcome = pipeline.submit(&Document::new("moore", FORMULA_DOC)).await?;
        let run_id = outcome.run.run_id.clone();
        let result = pipeline.resume(&run_id).await;
        assert!(matches!(result, Err(PipelineError::NotResumable { .. })));
        assert_eq!(pipeline.outcome(&run_id)?, Some(outcome));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_stage() -> Fallible<()> {
        let gate = Arc::new(Notify::new());
        let generator = ScriptedGenerator::new()
            .on_extract(
                ContentModule::MathFormulas,
                vec![Reply::Gate(Arc::clone(&gate), FORMULA_ITEMS.to_string())],
            )
            .on_generate(ContentModule::MathFormulas, CardFormat::Basic, vec![text(FORMULA_CARDS)]);
        let pipeline = pipeline(generator, PipelineConfig::default())?;
        let run_id = pipeline.start(&Document::new("moore", FORMULA_DOC))?;
        let driver = spawn_driver(&pipeline, &run_id);
        wait_for_call(&pipeline, RequestKind::Extract, ContentModule::MathFormulas).await;

        let requested = pipeline.cancel(&run_id)?;
        assert!(requested.cancel_requested);
        assert_eq!(requested.state, RunState::Extracting);
        gate.notify_one();
        let result = driver.await.map_err(|e| ErrorReport::new(e.to_string()))?;
        assert_eq!(result.err(), Some(PipelineError::Cancelled));

        let run = pipeline.status(&run_id)?;
        assert_eq!(run.state, RunState::Failed);
        let failure = run.failure.clone().ok_or_else(|| ErrorReport::new("no failure"))?;
        assert!(failure.cancelled);
        assert_eq!(failure.stage, Some(Stage::Extracting));
        assert_eq!(pipeline.store().get_output(&run_id, Stage::Extracting.key())?, None);

        gate.notify_one();
        let outcome = pipeline.resume(&run_id).await?;
        assert_eq!(outcome.run.state, RunState::Completed);
        assert!(!outcome.run.cancel_requested);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_pending_run() -> Fallible<()> {
        let pipeline = pipeline(formula_generator(), PipelineConfig::default())?;
        let run_id = pipeline.start(&Document::new("moore", FORMULA_DOC))?;
        let run = pipeline.cancel(&run_id)?;
        assert_eq!(run.state, RunState::Failed);
        assert!(run.failure.is_some_and(|failure| failure.cancelled));
        assert!(pipeline.generator().calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_attempt_stops_without_writing() -> Fallible<()> {
        let gate = Arc::new(Notify::new());
        let generator = ScriptedGenerator::new()
            .on_extract(
                ContentModule::MathFormulas,
                vec![Reply::Gate(Arc::clone(&gate), FORMULA_ITEMS.to_string())],
            )
            .on_generate(ContentModule::MathFormulas, CardFormat::Basic, vec![text(FORMULA_CARDS)]);
        let pipeline = pipeline(generator, PipelineConfig::default())?;
        let run_id = pipeline.start(&Document::new("moore", FORMULA_DOC))?;
        let driver = spawn_driver(&pipeline, &run_id);
        wait_for_call(&pipeline, RequestKind::Extract, ContentModule::MathFormulas).await;

        // Another writer touches the run while the extraction is in flight.
        let run = pipeline.status(&run_id)?;
        pipeline.store().update_run(&run, run.version)?;
        gate.notify_one();
        let result = driver.await.map_err(|e| ErrorReport::new(e.to_string()))?;
        assert!(matches!(result, Err(PipelineError::VersionConflict { .. })));
        let run = pipeline.status(&run_id)?;
        assert_eq!(run.state, RunState::Extracting);
        assert_eq!(pipeline.store().get_output(&run_id, Stage::Extracting.key())?, None);

        gate.notify_one();
        let outcome = pipeline.resume(&run_id).await?;
        assert_eq!(outcome.run.state, RunState::Completed);
        assert_eq!(outcome.run.stage(Stage::Extracting).attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_extraction_retries_then_succeeds() -> Fallible<()> {
        let generator = ScriptedGenerator::new()
            .on_extract(
                ContentModule::MathFormulas,
                vec![
                    Reply::Fail("overloaded".to_string()),
                    text("I could not find anything."),
                    text(FORMULA_ITEMS),
                ],
            )
            .on_generate(ContentModule::MathFormulas, CardFormat::Basic, vec![text(FORMULA_CARDS)]);
        let config = PipelineConfig {
            max_attempts: 3,
            ..PipelineConfig::default()
        };
        let pipeline = pipeline(generator, config)?;
        let outcome = pipeline.submit(&Document::new("moore", FORMULA_DOC)).await?;
        assert_eq!(outcome.run.state, RunState::Completed);
        assert_eq!(
            pipeline.generator().call_count(RequestKind::Extract, ContentModule::MathFormulas),
            3
        );
        assert_eq!(outcome.run.stage(Stage::Extracting).attempts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_capability_times_out() -> Fallible<()> {
        let generator = ScriptedGenerator::new().on_extract(
            ContentModule::MathFormulas,
            vec![Reply::Slow(Duration::from_secs(3), FORMULA_ITEMS.to_string())],
        );
        let config = PipelineConfig {
            max_attempts: 1,
            call_timeout_secs: 1,
            ..PipelineConfig::default()
        };
        let pipeline = pipeline(generator, config)?;
        let result = pipeline.submit(&Document::new("moore", FORMULA_DOC)).await;
        assert_eq!(
            result.err(),
            Some(PipelineError::StageTimeout {
                stage: Stage::Extracting
            })
        );
        let run = &pipeline.store().list_runs()?[0];
        let failure = run.failure.clone().ok_or_else(|| ErrorReport::new("no failure"))?;
        assert_eq!(failure.module, Some(ContentModule::MathFormulas));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_module_is_a_warning() -> Fallible<()> {
        let generator = moore_generator(vec![text("Sorry, no cards.")]);
        let pipeline = pipeline(generator, config(BOTH))?;
        let outcome = pipeline.submit(&Document::new("moore", MOORE_DOC)).await?;
        assert_eq!(outcome.run.state, RunState::Completed);
        assert_eq!(
            outcome.warnings,
            vec!["every generated card for module vocabulary was rejected".to_string()]
        );
        assert_eq!(outcome.artifacts[0].cards, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_validation_failure_withholds_artifact() -> Fallible<()> {
        let cards = r#"{"cards": [{"front": "Which HTML element groups block content?", "back": "The <div> element", "item": 0}]}"#;
        let generator = ScriptedGenerator::new()
            .on_extract(
                ContentModule::Vocabulary,
                vec![text(r#"{"items": [{"term": "div", "definition": "A generic block container"}]}"#)],
            )
            .on_generate(ContentModule::Vocabulary, CardFormat::Basic, vec![text(cards)]);
        let pipeline = pipeline(generator, config(&[ContentModule::Vocabulary]))?;
        let result = pipeline
            .submit(&Document::new("html", "A div is a generic block container."))
            .await;
        assert!(matches!(result, Err(PipelineError::ValidationFailed { level: 3, .. })));
        let run = &pipeline.store().list_runs()?[0];
        assert_eq!(run.failure.as_ref().and_then(|f| f.stage), Some(Stage::Formatting));
        assert_eq!(run.reports.last().map(|r| (r.level, r.passed)), Some((3, false)));
        assert_eq!(pipeline.store().get_output(&run.run_id, Stage::Formatting.key())?, None);
        assert!(
            pipeline
                .store()
                .get_output(&run.run_id, &Stage::Formatting.partial_key())?
                .is_some()
        );
        assert_eq!(pipeline.outcome(&run.run_id)?, None);
        Ok(())
    }
}
