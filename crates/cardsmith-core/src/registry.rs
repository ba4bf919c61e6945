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

//! The closed catalog of content modules. Adding a module means adding a
//! variant here plus its registry entry, its item shape in
//! [`crate::types::item`], and its detection rule.

use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ErrorReport;

/// Declaration order is registry order; the merge step and every
/// `BTreeMap<ContentModule, _>` rely on it for determinism.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentModule {
    Themes,
    Vocabulary,
    Tables,
    MathFormulas,
    Code,
    ImagesList,
    ImagesDescriptions,
}

/// The two card shapes the pipeline can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardFormat {
    Basic,
    Cloze,
}

impl Display for CardFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CardFormat::Basic => write!(f, "basic"),
            CardFormat::Cloze => write!(f, "cloze"),
        }
    }
}

impl FromStr for CardFormat {
    type Err = ErrorReport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(CardFormat::Basic),
            "cloze" => Ok(CardFormat::Cloze),
            _ => Err(ErrorReport::new(format!(
                "unknown card format '{s}' (expected 'basic' or 'cloze')"
            ))),
        }
    }
}

/// Which extracted-item struct a module produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemShape {
    Theme,
    Term,
    Table,
    Formula,
    Snippet,
    ImageRef,
    ImageDescription,
}

impl ItemShape {
    /// The JSON fields the capability is asked to fill, required ones first.
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            ItemShape::Theme => &["title", "summary", "subthemes"],
            ItemShape::Term => &["term", "definition", "context"],
            ItemShape::Table => &["title", "headers", "rows", "locator"],
            ItemShape::Formula => &["formula", "description", "variables", "locator"],
            ItemShape::Snippet => &["snippet", "explanation", "language", "locator"],
            ItemShape::ImageRef => &["label", "page", "caption"],
            ItemShape::ImageDescription => &["label", "description"],
        }
    }
}

pub struct ModuleSpec {
    pub module: ContentModule,
    pub name: &'static str,
    pub description: &'static str,
    pub formats: &'static [CardFormat],
    pub item_shape: ItemShape,
    /// Image modules need the figures at review time, so they are extracted
    /// but not turned into cards unless asked for.
    pub generated_by_default: bool,
}

impl ModuleSpec {
    pub fn supports(&self, format: CardFormat) -> bool {
        self.formats.contains(&format)
    }
}

const BOTH: &[CardFormat] = &[CardFormat::Basic, CardFormat::Cloze];
const BASIC_ONLY: &[CardFormat] = &[CardFormat::Basic];

static REGISTRY: [ModuleSpec; 7] = [
    ModuleSpec {
        module: ContentModule::Themes,
        name: "themes",
        description: "Themes and sub-themes of the document",
        formats: BOTH,
        item_shape: ItemShape::Theme,
        generated_by_default: true,
    },
    ModuleSpec {
        module: ContentModule::Vocabulary,
        name: "vocabulary",
        description: "Technical terms and their definitions",
        formats: BOTH,
        item_shape: ItemShape::Term,
        generated_by_default: true,
    },
    ModuleSpec {
        module: ContentModule::Tables,
        name: "tables",
        description: "Data tables",
        formats: BOTH,
        item_shape: ItemShape::Table,
        generated_by_default: true,
    },
    ModuleSpec {
        module: ContentModule::MathFormulas,
        name: "math_formulas",
        description: "Mathematical formulas and equations",
        formats: BOTH,
        item_shape: ItemShape::Formula,
        generated_by_default: true,
    },
    ModuleSpec {
        module: ContentModule::Code,
        name: "code",
        description: "Code blocks and examples",
        formats: BOTH,
        item_shape: ItemShape::Snippet,
        generated_by_default: true,
    },
    ModuleSpec {
        module: ContentModule::ImagesList,
        name: "images_list",
        description: "Figures and diagrams with their page numbers",
        formats: BASIC_ONLY,
        item_shape: ItemShape::ImageRef,
        generated_by_default: false,
    },
    ModuleSpec {
        module: ContentModule::ImagesDescriptions,
        name: "images_descriptions",
        description: "Textual descriptions of figures",
        formats: BOTH,
        item_shape: ItemShape::ImageDescription,
        generated_by_default: false,
    },
];

/// Every module, in registry order.
pub fn registry() -> &'static [ModuleSpec] {
    &REGISTRY
}

pub fn all_modules() -> impl Iterator<Item = ContentModule> {
    REGISTRY.iter().map(|spec| spec.module)
}

impl ContentModule {
    pub fn spec(self) -> &'static ModuleSpec {
        // The registry holds exactly one entry per variant, in declaration order.
        &REGISTRY[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }
}

impl Display for ContentModule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ContentModule {
    type Err = ErrorReport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        REGISTRY
            .iter()
            .find(|spec| spec.name == s)
            .map(|spec| spec.module)
            .ok_or_else(|| ErrorReport::new(format!("unknown content module '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_indexed_by_variant() {
        for (idx, spec) in registry().iter().enumerate() {
            assert_eq!(spec.module as usize, idx);
            assert_eq!(spec.module.spec().name, spec.name);
        }
    }

    #[test]
    fn test_names_round_trip_through_serde_and_from_str() {
        for module in all_modules() {
            let json = serde_json::to_string(&module).unwrap();
            assert_eq!(json, format!("\"{}\"", module.name()));
            assert_eq!(module.name().parse::<ContentModule>().unwrap(), module);
        }
    }

    #[test]
    fn test_unknown_module() {
        assert!("diagrams".parse::<ContentModule>().is_err());
    }

    #[test]
    fn test_formats() {
        assert!(ContentModule::ImagesList.spec().supports(CardFormat::Basic));
        assert!(!ContentModule::ImagesList.spec().supports(CardFormat::Cloze));
        assert!(ContentModule::MathFormulas.spec().supports(CardFormat::Cloze));
        assert_eq!("cloze".parse::<CardFormat>().unwrap(), CardFormat::Cloze);
    }

    #[test]
    fn test_registry_order() {
        let mut sorted: Vec<ContentModule> = all_modules().collect();
        sorted.sort();
        assert_eq!(sorted, all_modules().collect::<Vec<_>>());
    }
}
