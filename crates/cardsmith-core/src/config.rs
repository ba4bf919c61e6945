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

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Fallible;
use crate::error::fail;
use crate::registry::CardFormat;
use crate::registry::ContentModule;
use crate::types::card::Bloom;

/// A closed interval of percentages.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub const fn new(min: f64, max: f64) -> Self {
        Band { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Advisory distribution targets. Deviation is reported, never enforced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonomyTargets {
    pub recall: Band,
    pub comprehension: Band,
    pub application: Band,
}

impl TaxonomyTargets {
    pub fn band(&self, level: Bloom) -> Band {
        match level {
            Bloom::Recall => self.recall,
            Bloom::Comprehension => self.comprehension,
            Bloom::Application => self.application,
        }
    }
}

impl Default for TaxonomyTargets {
    fn default() -> Self {
        TaxonomyTargets {
            recall: Band::new(40.0, 50.0),
            comprehension: Band::new(30.0, 40.0),
            application: Band::new(15.0, 25.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Attempts per capability call, including the first.
    pub max_attempts: u32,
    pub call_timeout_secs: u64,
    /// Back-off after a rate-limit error that names no reset time.
    pub rate_limit_wait_secs: u64,
    /// Token Jaccard similarity at or above which two cards interfere.
    pub similarity_threshold: f64,
    pub max_list_items: usize,
    pub max_cloze_deletions: usize,
    pub simplify_over_chars: usize,
    pub default_format: CardFormat,
    /// Per-module format overrides.
    pub formats: BTreeMap<ContentModule, Vec<CardFormat>>,
    /// When set, only these modules may be selected by the detector.
    pub modules: Option<BTreeSet<ContentModule>>,
    pub generate_image_modules: bool,
    pub taxonomy: TaxonomyTargets,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_attempts: 3,
            call_timeout_secs: 300,
            rate_limit_wait_secs: 300,
            similarity_threshold: 0.5,
            max_list_items: 3,
            max_cloze_deletions: 1,
            simplify_over_chars: 160,
            default_format: CardFormat::Basic,
            formats: BTreeMap::new(),
            modules: None,
            generate_image_modules: false,
            taxonomy: TaxonomyTargets::default(),
        }
    }
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.rate_limit_wait_secs)
    }

    /// The formats to generate for a module, restricted to those the module
    /// supports.
    pub fn formats_for(&self, module: ContentModule) -> Vec<CardFormat> {
        let requested = match self.formats.get(&module) {
            Some(formats) => formats.clone(),
            None => vec![self.default_format],
        };
        let spec = module.spec();
        let mut formats: Vec<CardFormat> = Vec::new();
        for format in requested {
            if spec.supports(format) && !formats.contains(&format) {
                formats.push(format);
            }
        }
        if formats.is_empty() {
            // Fall back to the module's first supported format.
            formats.extend(spec.formats.first().copied());
        }
        formats
    }

    /// Whether cards are generated for this module at all.
    pub fn generates(&self, module: ContentModule) -> bool {
        module.spec().generated_by_default || self.generate_image_modules
    }

    pub fn validate(&self) -> Fallible<()> {
        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1.");
        }
        if self.call_timeout_secs == 0 {
            return fail("call_timeout_secs must be at least 1.");
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return fail("similarity_threshold must be between 0 and 1.");
        }
        if self.max_list_items == 0 {
            return fail("max_list_items must be at least 1.");
        }
        if self.max_cloze_deletions == 0 {
            return fail("max_cloze_deletions must be at least 1.");
        }
        if let Some(modules) = &self.modules {
            if modules.is_empty() {
                return fail("the module allow-list is empty.");
            }
        }
        Ok(())
    }
}
