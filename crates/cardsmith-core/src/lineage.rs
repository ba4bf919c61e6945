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

//! The arena of every card a run has produced, keyed by id, with
//! parent pointers. Cards are never mutated or removed here: a card that
//! was merged away or split is kept, marked as no longer live.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::InvariantKind;
use crate::error::PipelineError;
use crate::types::card::Card;
use crate::types::card::Tags;
use crate::types::card_id::CardId;
use crate::types::run::Stage;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub card: Card,
    /// The stage whose output first contained the card.
    pub stage: Stage,
    pub live: bool,
    /// Set when the card was merged into another one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<CardId>,
    /// The rules that produced the card, in application order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<LineageEntry>", into = "Vec<LineageEntry>")]
pub struct CardArena {
    entries: Vec<LineageEntry>,
    index: HashMap<CardId, usize>,
}

impl From<Vec<LineageEntry>> for CardArena {
    fn from(entries: Vec<LineageEntry>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| (entry.card.id, idx))
            .collect();
        CardArena { entries, index }
    }
}

impl From<CardArena> for Vec<LineageEntry> {
    fn from(arena: CardArena) -> Self {
        arena.entries
    }
}

impl CardArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a card. Returns false, and keeps the existing entry, if a card
    /// with the same id is already present.
    pub fn insert(&mut self, card: Card, stage: Stage, rules: Vec<String>) -> bool {
        if self.index.contains_key(&card.id) {
            return false;
        }
        self.index.insert(card.id, self.entries.len());
        self.entries.push(LineageEntry {
            card,
            stage,
            live: true,
            merged_into: None,
            rules,
        });
        true
    }

    pub fn get(&self, id: &CardId) -> Option<&LineageEntry> {
        self.index.get(id).map(|idx| &self.entries[*idx])
    }

    pub fn contains(&self, id: &CardId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark a card as superseded.
    pub fn retire(&mut self, id: &CardId, merged_into: Option<CardId>) {
        if let Some(idx) = self.index.get(id) {
            let entry = &mut self.entries[*idx];
            entry.live = false;
            if merged_into.is_some() {
                entry.merged_into = merged_into;
            }
        }
    }

    /// Replace the tags of a live card, e.g. after a merge.
    pub fn set_tags(&mut self, id: &CardId, tags: Tags) {
        if let Some(idx) = self.index.get(id) {
            self.entries[*idx].card.tags = tags;
        }
    }

    /// Live cards in insertion order.
    pub fn live(&self) -> impl Iterator<Item = &Card> {
        self.entries
            .iter()
            .filter(|entry| entry.live)
            .map(|entry| &entry.card)
    }

    /// The id of the root of a card's lineage tree.
    pub fn root(&self, id: &CardId) -> Option<CardId> {
        let mut current = *id;
        for _ in 0..=self.entries.len() {
            let entry = self.get(&current)?;
            match entry.card.origin_id {
                Some(parent) => current = parent,
                None => return Some(current),
            }
        }
        None
    }

    /// Check that the origin relation is a forest: every origin is a card
    /// from an earlier stage in this arena, nothing is its own ancestor.
    pub fn check_forest(&self) -> Result<(), PipelineError> {
        for entry in &self.entries {
            let card = &entry.card;
            let Some(origin) = card.origin_id else {
                continue;
            };
            let violation = |rule: &str| PipelineError::OptimizationInvariantViolated {
                kind: InvariantKind::Lineage,
                card: Some(card.id),
                rule: rule.to_string(),
            };
            if origin == card.id {
                return Err(violation("a card cannot be its own origin"));
            }
            let Some(parent) = self.get(&origin) else {
                return Err(violation("origin is not a card of this run"));
            };
            if parent.stage >= entry.stage {
                return Err(violation("origin must come from an earlier stage"));
            }
            if self.root(&card.id).is_none() {
                return Err(violation("origin chain has a cycle"));
            }
        }
        Ok(())
    }
}
