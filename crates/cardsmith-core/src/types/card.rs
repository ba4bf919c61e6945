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

use std::collections::BTreeSet;
use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

use crate::markup::MarkupError;
use crate::markup::blank_markers;
use crate::markup::case_sensitive_spans;
use crate::registry::CardFormat;
use crate::registry::ContentModule;
use crate::types::card_id::CardId;
use crate::types::card_id::Hasher;

/// Tags are an ordered set.
pub type Tags = BTreeSet<String>;

/// The cognitive level a card exercises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bloom {
    Recall,
    Comprehension,
    Application,
}

impl Display for Bloom {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Bloom::Recall => write!(f, "recall"),
            Bloom::Comprehension => write!(f, "comprehension"),
            Bloom::Application => write!(f, "application"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CardContent {
    Basic { front: String, back: String },
    Cloze { text: String },
}

impl CardContent {
    pub fn new_basic(front: impl Into<String>, back: impl Into<String>) -> Self {
        CardContent::Basic {
            front: front.into(),
            back: back.into(),
        }
    }

    pub fn new_cloze(text: impl Into<String>) -> Self {
        CardContent::Cloze { text: text.into() }
    }

    pub fn format(&self) -> CardFormat {
        match self {
            CardContent::Basic { .. } => CardFormat::Basic,
            CardContent::Cloze { .. } => CardFormat::Cloze,
        }
    }

    /// The exported fields, in column order.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            CardContent::Basic { front, back } => vec![front, back],
            CardContent::Cloze { text } => vec![text],
        }
    }

    /// The text a learner sees before answering: the front of a basic card,
    /// or the cloze text with its markers blanked.
    pub fn context(&self) -> Result<String, MarkupError> {
        match self {
            CardContent::Basic { front, .. } => Ok(front.clone()),
            CardContent::Cloze { text } => blank_markers(text),
        }
    }

    /// The text used for duplicate detection: whitespace collapsed and
    /// prose lowercased. Math and code keep their case, since `\(N\)` and
    /// `\(n\)` are different symbols.
    pub fn fact_key(&self) -> String {
        self.fields()
            .into_iter()
            .map(field_key)
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }
}

fn field_key(field: &str) -> String {
    let collapse = |text: &str| text.split_whitespace().collect::<Vec<_>>().join(" ");
    let Ok(spans) = case_sensitive_spans(field) else {
        return collapse(field);
    };
    let mut key = String::with_capacity(field.len());
    let mut last = 0;
    for range in spans {
        key.push_str(&field[last..range.start].to_lowercase());
        key.push_str(&field[range.clone()]);
        last = range.end;
    }
    key.push_str(&field[last..].to_lowercase());
    collapse(&key)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    /// The card this one was derived from by a split or rewrite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<CardId>,
    pub module: ContentModule,
    pub content: CardContent,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom: Option<Bloom>,
}

impl Card {
    /// A card as handed off by the generator. The id depends only on the
    /// module and the content, so reruns produce the same ids.
    pub fn generated(
        module: ContentModule,
        content: CardContent,
        tags: Tags,
        bloom: Option<Bloom>,
    ) -> Self {
        let mut hasher = Hasher::new();
        hasher.field("generated").field(module.name());
        hash_content(&mut hasher, &content);
        Card {
            id: hasher.finalize(),
            origin_id: None,
            module,
            content,
            tags,
            bloom,
        }
    }

    /// A card derived from `origin`. `index` distinguishes siblings.
    pub fn derived(origin: &Card, index: usize, content: CardContent) -> Self {
        let mut hasher = Hasher::new();
        hasher
            .field("derived")
            .field(&origin.id.to_hex())
            .field(&index.to_string());
        hash_content(&mut hasher, &content);
        Card {
            id: hasher.finalize(),
            origin_id: Some(origin.id),
            module: origin.module,
            content,
            tags: origin.tags.clone(),
            bloom: origin.bloom,
        }
    }

    pub fn format(&self) -> CardFormat {
        self.content.format()
    }
}

fn hash_content(hasher: &mut Hasher, content: &CardContent) {
    hasher.field(&content.format().to_string());
    for field in content.fields() {
        hasher.field(field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_stable() {
        let a = Card::generated(
            ContentModule::Vocabulary,
            CardContent::new_basic("What is a Moore machine?", "An FSM"),
            Tags::new(),
            None,
        );
        let b = Card::generated(
            ContentModule::Vocabulary,
            CardContent::new_basic("What is a Moore machine?", "An FSM"),
            Tags::new(),
            Some(Bloom::Recall),
        );
        assert_eq!(a.id, b.id);
        let other_module = Card::generated(
            ContentModule::Themes,
            CardContent::new_basic("What is a Moore machine?", "An FSM"),
            Tags::new(),
            None,
        );
        assert_ne!(a.id, other_module.id);
    }

    #[test]
    fn test_derived_card_points_at_origin() {
        let origin = Card::generated(
            ContentModule::Themes,
            CardContent::new_basic("Steps?", "- a\n- b"),
            ["fsm".to_string()].into_iter().collect(),
            None,
        );
        let first = Card::derived(&origin, 0, CardContent::new_basic("Steps? (1/2)", "a"));
        let second = Card::derived(&origin, 1, CardContent::new_basic("Steps? (2/2)", "b"));
        assert_eq!(first.origin_id, Some(origin.id));
        assert_ne!(first.id, second.id);
        assert_eq!(first.tags, origin.tags);
    }

    #[test]
    fn test_context_blanks_markers() {
        let cloze = CardContent::new_cloze("A {{c1::Moore}} machine");
        assert_eq!(cloze.context().unwrap(), "A [...] machine");
    }

    #[test]
    fn test_fact_key_normalizes() {
        let a = CardContent::new_basic("What  is X?", "Y");
        let b = CardContent::new_basic("what is x?", "y");
        assert_eq!(a.fact_key(), b.fact_key());
    }

    #[test]
    fn test_fact_key_keeps_the_case_of_math_and_code() {
        let upper = CardContent::new_basic("What is the size of the input?", r"\(N\)");
        let lower = CardContent::new_basic("What is the size of the input?", r"\(n\)");
        assert_ne!(upper.fact_key(), lower.fact_key());
        let upper = CardContent::new_basic("Which type holds text?", "`String`");
        let lower = CardContent::new_basic("which type holds text?", "`string`");
        assert_ne!(upper.fact_key(), lower.fact_key());
        let spaced = CardContent::new_basic("WHAT is the size  of the input?", r"\(N\)");
        assert_eq!(
            spaced.fact_key(),
            CardContent::new_basic("What is the size of the input?", r"\(N\)").fact_key()
        );
    }

    #[test]
    fn test_serialization_shape() {
        let content = CardContent::new_cloze("{{c1::a}}");
        let json = serde_json::to_string(&content).unwrap();
        assert_eq!(json, r#"{"type":"cloze","text":"{{c1::a}}"}"#);
    }
}
