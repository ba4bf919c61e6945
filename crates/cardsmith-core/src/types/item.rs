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

//! Structured items pulled out of a document, one shape per content module.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::registry::ContentModule;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Theme {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub subthemes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub term: String,
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub title: String,
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub formula: String,
    pub description: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub snippet: String,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescription {
    pub label: String,
    pub description: String,
}

/// An extracted item, tagged with the module that produced it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum ExtractedItem {
    Themes(Theme),
    Vocabulary(Term),
    Tables(Table),
    MathFormulas(Formula),
    Code(Snippet),
    ImagesList(ImageRef),
    ImagesDescriptions(ImageDescription),
}

impl ExtractedItem {
    pub fn module(&self) -> ContentModule {
        match self {
            ExtractedItem::Themes(_) => ContentModule::Themes,
            ExtractedItem::Vocabulary(_) => ContentModule::Vocabulary,
            ExtractedItem::Tables(_) => ContentModule::Tables,
            ExtractedItem::MathFormulas(_) => ContentModule::MathFormulas,
            ExtractedItem::Code(_) => ContentModule::Code,
            ExtractedItem::ImagesList(_) => ContentModule::ImagesList,
            ExtractedItem::ImagesDescriptions(_) => ContentModule::ImagesDescriptions,
        }
    }

    /// A short human-readable name for reports and logs.
    pub fn label(&self) -> String {
        match self {
            ExtractedItem::Themes(theme) => theme.title.clone(),
            ExtractedItem::Vocabulary(term) => term.term.clone(),
            ExtractedItem::Tables(table) => table.title.clone(),
            ExtractedItem::MathFormulas(formula) => formula.formula.clone(),
            ExtractedItem::Code(code) => first_line(&code.snippet),
            ExtractedItem::ImagesList(image) => image.label.clone(),
            ExtractedItem::ImagesDescriptions(image) => image.label.clone(),
        }
    }

    /// Names of required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let mut check = |name: &'static str, value: &str| {
            if value.trim().is_empty() {
                missing.push(name);
            }
        };
        match self {
            ExtractedItem::Themes(theme) => {
                check("title", &theme.title);
                check("summary", &theme.summary);
            }
            ExtractedItem::Vocabulary(term) => {
                check("term", &term.term);
                check("definition", &term.definition);
            }
            ExtractedItem::Tables(table) => {
                check("title", &table.title);
                check("headers", &table.headers.concat());
            }
            ExtractedItem::MathFormulas(formula) => {
                check("formula", &formula.formula);
                check("description", &formula.description);
            }
            ExtractedItem::Code(code) => {
                check("snippet", &code.snippet);
                check("explanation", &code.explanation);
            }
            ExtractedItem::ImagesList(image) => check("label", &image.label),
            ExtractedItem::ImagesDescriptions(image) => {
                check("label", &image.label);
                check("description", &image.description);
            }
        }
        missing
    }

    /// Parse one raw JSON item into the shape of `module`.
    pub fn from_value(module: ContentModule, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match module {
            ContentModule::Themes => ExtractedItem::Themes(serde_json::from_value(value)?),
            ContentModule::Vocabulary => ExtractedItem::Vocabulary(serde_json::from_value(value)?),
            ContentModule::Tables => ExtractedItem::Tables(serde_json::from_value(value)?),
            ContentModule::MathFormulas => {
                ExtractedItem::MathFormulas(serde_json::from_value(value)?)
            }
            ContentModule::Code => ExtractedItem::Code(serde_json::from_value(value)?),
            ContentModule::ImagesList => ExtractedItem::ImagesList(serde_json::from_value(value)?),
            ContentModule::ImagesDescriptions => {
                ExtractedItem::ImagesDescriptions(serde_json::from_value(value)?)
            }
        })
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim().to_string()
}
