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

use serde::Deserialize;
use serde::Serialize;

use crate::capability::CallError;
use crate::capability::CallPolicy;
use crate::capability::GenerationRequest;
use crate::capability::TextGenerator;
use crate::capability::call_with_retry;
use crate::capability::parse_items;
use crate::error::PipelineError;
use crate::registry::ContentModule;
use crate::types::item::ExtractedItem;
use crate::types::run::Stage;

/// The items of one module, in document order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleExtraction {
    pub module: ContentModule,
    pub items: Vec<ExtractedItem>,
    /// Items dropped for missing required fields.
    pub dropped: Vec<String>,
}

impl ModuleExtraction {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Shape-check an extraction response for `module`.
pub fn interpret(module: ContentModule, response: &str) -> Result<ModuleExtraction, String> {
    let raw = parse_items(response)?;
    let mut items = Vec::with_capacity(raw.len());
    let mut dropped = Vec::new();
    for (idx, value) in raw.into_iter().enumerate() {
        let item = ExtractedItem::from_value(module, value)
            .map_err(|e| format!("item {idx} does not match the {module} shape: {e}"))?;
        let missing = item.missing_fields();
        if missing.is_empty() {
            items.push(item);
        } else {
            dropped.push(format!(
                "{module} item {idx} dropped: empty {}",
                missing.join(", ")
            ));
        }
    }
    Ok(ModuleExtraction {
        module,
        items,
        dropped,
    })
}

/// Extract one module's items from the document. A single pass: one
/// request, retried under `policy`.
pub async fn extract<G: TextGenerator>(
    generator: &G,
    module: ContentModule,
    document: &str,
    policy: CallPolicy,
) -> Result<ModuleExtraction, PipelineError> {
    let request = GenerationRequest::extract(module, document);
    let result = call_with_retry(generator, &request, policy, |response| {
        interpret(module, response)
    })
    .await;
    match result {
        Ok(extraction) => {
            for warning in &extraction.dropped {
                log::warn!("{warning}");
            }
            if extraction.is_empty() {
                log::info!("Module {module} yielded no items.");
            } else {
                log::info!("Module {module}: extracted {} items.", extraction.items.len());
            }
            Ok(extraction)
        }
        Err(CallError::Timeout) => Err(PipelineError::StageTimeout {
            stage: Stage::Extracting,
        }),
        Err(err) => Err(PipelineError::ExtractionFailed {
            module,
            cause: err.cause(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capability::scripted::*;

    fn policy() -> CallPolicy {
        CallPolicy {
            max_attempts: 2,
            timeout: Duration::from_secs(5),
            rate_limit_wait: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_interpret_drops_incomplete_items() {
        let response = r#"{"items": [
            {"term": "Moore machine", "definition": "Outputs depend only on state"},
            {"term": "", "definition": "orphan"}
        ]}"#;
        let extraction = interpret(ContentModule::Vocabulary, response).unwrap();
        assert_eq!(extraction.items.len(), 1);
        assert_eq!(extraction.dropped.len(), 1);
        assert!(extraction.dropped[0].contains("term"));
    }

    #[test]
    fn test_interpret_rejects_wrong_shape() {
        let response = r#"{"items": [{"title": "x", "summary": "y"}]}"#;
        let err = interpret(ContentModule::Code, response).unwrap_err();
        assert!(err.contains("code shape"));
    }

    #[tokio::test]
    async fn test_extract_empty_is_not_a_failure() {
        let generator = ScriptedGenerator::new()
            .on_extract(ContentModule::Tables, vec![text(r#"{"items": []}"#)]);
        let extraction = extract(&generator, ContentModule::Tables, "doc", policy())
            .await
            .unwrap();
        assert!(extraction.is_empty());
    }

    #[tokio::test]
    async fn test_extract_fails_after_retries() {
        let generator = ScriptedGenerator::new()
            .on_extract(ContentModule::Themes, vec![text("I cannot help with that.")]);
        let err = extract(&generator, ContentModule::Themes, "doc", policy())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ExtractionFailed {
                module: ContentModule::Themes,
                ..
            }
        ));
        assert_eq!(generator.calls().len(), 2);
    }
}
