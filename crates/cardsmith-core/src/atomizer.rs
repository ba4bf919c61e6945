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

//! The whole-set optimization pass. Rules run in priority order over
//! working copies of the generated cards; the generated cards themselves
//! stay in the lineage arena untouched. A working copy that ends up
//! different from its source is materialized as a derived card whose
//! origin is the generated card.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::ops::Range;
use std::thread;

use serde::Deserialize;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::InvariantKind;
use crate::error::PipelineError;
use crate::lineage::CardArena;
use crate::markup::ClozeMarker;
use crate::markup::cloze_markers;
use crate::markup::distinct_numbers;
use crate::markup::is_sequential;
use crate::markup::keep_only_marker;
use crate::markup::marker_signature;
use crate::markup::math_signature;
use crate::markup::protected_spans;
use crate::markup::segments;
use crate::text::jaccard;
use crate::text::token_set;
use crate::text::tokens;
use crate::types::card::Card;
use crate::types::card::CardContent;
use crate::types::card::Tags;
use crate::types::card_id::CardId;
use crate::types::run::Stage;

/// Items longer than this many words are prose, not an enumeration.
const MAX_ITEM_WORDS: usize = 4;

/// Words that announce an ordered procedure, whose items are learned one
/// at a time.
const STEP_WORDS: &[&str] = &[
    "step",
    "steps",
    "stage",
    "stages",
    "phase",
    "phases",
    "sequence",
    "procedure",
    "étape",
    "étapes",
];

const FILLERS: &[&str] = &[
    "it is important to note that ",
    "it should be noted that ",
    "in other words, ",
    "basically, ",
    "essentially, ",
    "note that ",
    "as mentioned, ",
    "il est important de noter que ",
    "en d'autres termes, ",
];

const RULE_SPLIT: &str = "min_info_split";
const RULE_SIMPLIFY: &str = "simplify";
const RULE_LIST_BOUND: &str = "list_bound";
const RULE_LABEL: &str = "interference_label";

#[derive(Clone, Debug, PartialEq)]
pub struct AtomizerSettings {
    pub similarity_threshold: f64,
    pub max_list_items: usize,
    pub max_cloze_deletions: usize,
    pub simplify_over_chars: usize,
}

impl From<&PipelineConfig> for AtomizerSettings {
    fn from(config: &PipelineConfig) -> Self {
        AtomizerSettings {
            similarity_threshold: config.similarity_threshold,
            max_list_items: config.max_list_items,
            max_cloze_deletions: config.max_cloze_deletions,
            simplify_over_chars: config.simplify_over_chars,
        }
    }
}

impl Default for AtomizerSettings {
    fn default() -> Self {
        AtomizerSettings::from(&PipelineConfig::default())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub input: usize,
    pub output: usize,
    pub merged: usize,
    pub split: usize,
    pub simplified: usize,
    pub list_bounded: usize,
    pub labeled: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Optimized {
    pub cards: Vec<Card>,
    pub lineage: CardArena,
    pub report: OptimizationReport,
}

/// A card in flight. `origin` indexes the generated cards.
#[derive(Clone, Debug)]
struct Working {
    origin: usize,
    content: CardContent,
    tags: Tags,
    rules: Vec<String>,
}

impl Working {
    fn child(&self, content: CardContent, rule: &str) -> Working {
        let mut rules = self.rules.clone();
        rules.push(rule.to_string());
        Working {
            origin: self.origin,
            content,
            tags: self.tags.clone(),
            rules,
        }
    }
}

/// Optimize the merged card set. Deterministic for a given input and
/// settings.
pub fn optimize(cards: Vec<Card>, settings: &AtomizerSettings) -> Result<Optimized, PipelineError> {
    let mut report = OptimizationReport {
        input: cards.len(),
        ..OptimizationReport::default()
    };
    let mut arena = CardArena::new();
    let mut originals: Vec<Card> = Vec::with_capacity(cards.len());
    for card in cards {
        if arena.insert(card.clone(), Stage::Generating, Vec::new()) {
            originals.push(card);
        }
    }

    let working = merge_duplicates(&originals, &mut arena, &mut report);
    let mut working = split_min_info(working, settings, &mut report);
    for card in working.iter_mut() {
        if simplify(card, settings.simplify_over_chars) {
            report.simplified += 1;
        }
    }
    let mut working = bound_lists(working, settings, &mut report);
    label_interference(&mut working, &originals, settings.similarity_threshold, &mut report);

    let cards = materialize(working, &originals, &mut arena);
    check_conservation(&originals, &cards, &arena)?;
    arena.check_forest()?;
    check_live(&cards, &arena)?;
    report.output = cards.len();
    log::info!(
        "Optimized {} cards into {}: {} merged, {} split, {} list-bounded, {} simplified, {} labeled.",
        report.input,
        report.output,
        report.merged,
        report.split,
        report.list_bounded,
        report.simplified,
        report.labeled
    );
    Ok(Optimized {
        cards,
        lineage: arena,
        report,
    })
}

/// Fold cards stating the same fact into the first one, uniting tags.
fn merge_duplicates(
    originals: &[Card],
    arena: &mut CardArena,
    report: &mut OptimizationReport,
) -> Vec<Working> {
    let mut working: Vec<Working> = Vec::with_capacity(originals.len());
    let mut first_by_key: HashMap<String, usize> = HashMap::new();
    for (idx, card) in originals.iter().enumerate() {
        let key = format!("{}:{}", card.format(), card.content.fact_key());
        match first_by_key.get(&key) {
            Some(first) => {
                let target = &mut working[*first];
                target.tags.extend(card.tags.iter().cloned());
                let kept = originals[target.origin].id;
                log::debug!("Merging card {} into {}", card.id.short(), kept.short());
                arena.retire(&card.id, Some(kept));
                report.merged += 1;
            }
            None => {
                first_by_key.insert(key, working.len());
                working.push(Working {
                    origin: idx,
                    content: card.content.clone(),
                    tags: card.tags.clone(),
                    rules: Vec::new(),
                });
            }
        }
    }
    working
}

/// One card per listed item or named step (basic), one per deletion
/// number or named step (cloze).
fn split_min_info(
    working: Vec<Working>,
    settings: &AtomizerSettings,
    report: &mut OptimizationReport,
) -> Vec<Working> {
    let mut out = Vec::with_capacity(working.len());
    for card in working {
        let children: Option<Vec<CardContent>> = match &card.content {
            CardContent::Basic { front, back } => split_basic(front, back),
            CardContent::Cloze { text } => split_deletions(text, settings.max_cloze_deletions)
                .or_else(|| split_cloze_steps(text)),
        };
        match children {
            Some(children) => {
                report.split += 1;
                out.extend(
                    children
                        .into_iter()
                        .map(|content| card.child(content, RULE_SPLIT)),
                );
            }
            None => out.push(card),
        }
    }
    out
}

/// How many facts a card asks for at once, counted the way the split rule
/// would divide it.
pub fn fact_count(content: &CardContent) -> usize {
    match content {
        CardContent::Basic { front, back } => split_basic(front, back).map_or(1, |children| children.len()),
        CardContent::Cloze { text } => {
            let deletions = cloze_markers(text).map_or(0, |markers| distinct_numbers(&markers).len());
            if deletions > 1 {
                deletions
            } else {
                split_cloze_steps(text).map_or(1, |children| children.len())
            }
        }
    }
}

fn split_basic(front: &str, back: &str) -> Option<Vec<CardContent>> {
    let answers: Vec<String> = match list_block(back) {
        Some(block) => block.answers(),
        None if names_steps(front) => short_items(back)?
            .into_iter()
            .map(|range| back[range].to_string())
            .collect(),
        None => return None,
    };
    let n = answers.len();
    Some(
        answers
            .into_iter()
            .enumerate()
            .map(|(k, answer)| CardContent::new_basic(format!("{front} ({}/{n})", k + 1), answer))
            .collect(),
    )
}

fn names_steps(text: &str) -> bool {
    tokens(text)
        .iter()
        .any(|word| STEP_WORDS.contains(&word.as_str()))
}

/// The longest run of bullet or numbered lines in a field, with the lines
/// before and after it.
struct ListBlock<'a> {
    lead: Vec<&'a str>,
    items: Vec<&'a str>,
    trail: Vec<&'a str>,
}

impl ListBlock<'_> {
    /// One answer per item. Context lines without markup go on every
    /// answer; context with markup goes on the first or last answer only,
    /// so math stays partitioned in order.
    fn answers(&self) -> Vec<String> {
        let plain = |lines: &[&str]| {
            lines
                .iter()
                .all(|line| protected_spans(line).is_ok_and(|spans| spans.is_empty()))
        };
        let every_lead = plain(&self.lead);
        let every_trail = plain(&self.trail);
        let last = self.items.len() - 1;
        self.items
            .iter()
            .enumerate()
            .map(|(k, item)| {
                let mut lines: Vec<&str> = Vec::new();
                if every_lead || k == 0 {
                    lines.extend(&self.lead);
                }
                lines.push(item);
                if every_trail || k == last {
                    lines.extend(&self.trail);
                }
                lines.join("\n")
            })
            .collect()
    }
}

fn list_block(text: &str) -> Option<ListBlock<'_>> {
    let protected = protected_spans(text).ok()?;
    if protected.iter().any(|range| text[range.clone()].contains('\n')) {
        return None;
    }
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let mut best = 0..0;
    let mut start = 0;
    for (k, line) in lines.iter().enumerate() {
        if strip_list_marker(line).is_none() {
            start = k + 1;
        } else if k + 1 - start > best.len() {
            best = start..k + 1;
        }
    }
    if best.len() < 2 {
        return None;
    }
    Some(ListBlock {
        lead: lines[..best.start].to_vec(),
        items: lines[best.clone()]
            .iter()
            .filter_map(|line| strip_list_marker(line))
            .collect(),
        trail: lines[best.end..].to_vec(),
    })
}

fn strip_list_marker(line: &str) -> Option<&str> {
    for bullet in ["- ", "* ", "+ ", "• "] {
        if let Some(rest) = line.strip_prefix(bullet) {
            let rest = rest.trim();
            return (!rest.is_empty()).then_some(rest);
        }
    }
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    let rest = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") "))?.trim();
    (!rest.is_empty()).then_some(rest)
}

fn split_deletions(text: &str, max_deletions: usize) -> Option<Vec<CardContent>> {
    let markers = cloze_markers(text).ok()?;
    let numbers = distinct_numbers(&markers);
    if numbers.len() <= max_deletions {
        return None;
    }
    numbers
        .into_iter()
        .map(|number| keep_only_marker(text, number).ok().map(CardContent::new_cloze))
        .collect()
}

/// Split enumerations longer than the bound into chunks.
fn bound_lists(
    working: Vec<Working>,
    settings: &AtomizerSettings,
    report: &mut OptimizationReport,
) -> Vec<Working> {
    let max = settings.max_list_items;
    let mut out = Vec::with_capacity(working.len());
    for card in working {
        let children = match &card.content {
            CardContent::Basic { front, back } => enumeration(back, max).map(|chunks| {
                let n = chunks.len();
                chunks
                    .into_iter()
                    .enumerate()
                    .map(|(k, range)| {
                        CardContent::new_basic(format!("{front} ({}/{n})", k + 1), &back[range])
                    })
                    .collect::<Vec<_>>()
            }),
            CardContent::Cloze { text } => bound_cloze(text, max),
        };
        match children {
            Some(children) => {
                report.list_bounded += 1;
                out.extend(
                    children
                        .into_iter()
                        .map(|content| card.child(content, RULE_LIST_BOUND)),
                );
            }
            None => out.push(card),
        }
    }
    out
}

/// Item ranges, when `text` enumerates at least two short items.
fn short_items(text: &str) -> Option<Vec<Range<usize>>> {
    let items = enumeration_items(text)?;
    let short = items.len() >= 2
        && items
            .iter()
            .all(|item| tokens(&text[item.clone()]).len() <= MAX_ITEM_WORDS);
    short.then_some(items)
}

/// Chunks of at most `max` items, when `text` enumerates more than `max`
/// short items.
fn enumeration(text: &str, max: usize) -> Option<Vec<Range<usize>>> {
    let items = short_items(text)?;
    if items.len() <= max {
        return None;
    }
    Some(
        items
            .chunks(max)
            .map(|chunk| chunk[0].start..chunk[chunk.len() - 1].end)
            .collect(),
    )
}

/// Item ranges of an inline enumeration, split at `,`, `;`, ` and ` and
/// ` et ` outside protected spans and parentheses.
fn enumeration_items(text: &str) -> Option<Vec<Range<usize>>> {
    let protected = protected_spans(text).ok()?;
    let bytes = text.as_bytes();
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if let Some(range) = protected.iter().find(|range| range.start == i) {
            i = range.end;
            continue;
        }
        let separator = match bytes[i] {
            b'(' => {
                depth += 1;
                0
            }
            b')' => {
                depth = depth.saturating_sub(1);
                0
            }
            b',' | b';' if depth == 0 => 1,
            b' ' if depth == 0 => [" and ", " et "]
                .iter()
                .find(|word| bytes[i..].starts_with(word.as_bytes()))
                .map_or(0, |word| word.len()),
            _ => 0,
        };
        if separator > 0 {
            push_item(text, start..i, &mut items);
            i += separator;
            start = i;
        } else {
            i += 1;
        }
    }
    push_item(text, start..text.len(), &mut items);
    Some(items)
}

fn push_item(text: &str, range: Range<usize>, items: &mut Vec<Range<usize>>) {
    let slice = &text[range.clone()];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead + trail < slice.len() {
        items.push(range.start + lead..range.end - trail);
    }
}

fn single_marker(text: &str) -> Option<ClozeMarker> {
    match cloze_markers(text).ok()?.as_slice() {
        [marker] => Some(marker.clone()),
        _ => None,
    }
}

/// A single deletion listing the steps of a procedure becomes one card per
/// step.
fn split_cloze_steps(text: &str) -> Option<Vec<CardContent>> {
    let marker = single_marker(text)?;
    let outside = format!("{} {}", &text[..marker.start], &text[marker.end..]);
    if !names_steps(&outside) {
        return None;
    }
    let items = short_items(marker.answer(text))?;
    Some(move_marker(text, &marker, items))
}

/// A cloze whose single deletion enumerates too many items becomes one card
/// per chunk.
fn bound_cloze(text: &str, max: usize) -> Option<Vec<CardContent>> {
    let marker = single_marker(text)?;
    let chunks = enumeration(marker.answer(text), max)?;
    Some(move_marker(text, &marker, chunks))
}

/// Copies of the text with the marker narrowed to each range of its answer.
/// Every copy keeps the full text; only the marker moves.
fn move_marker(text: &str, marker: &ClozeMarker, ranges: Vec<Range<usize>>) -> Vec<CardContent> {
    let answer = marker.answer(text);
    let hint = marker
        .hint(text)
        .map(|hint| format!("::{hint}"))
        .unwrap_or_default();
    ranges
        .into_iter()
        .map(|range| {
            CardContent::new_cloze(format!(
                "{}{}{{{{c1::{}{hint}}}}}{}{}",
                &text[..marker.start],
                &answer[..range.start],
                &answer[range.clone()],
                &answer[range.end..],
                &text[marker.end..]
            ))
        })
        .collect()
}

/// Shorten overlong fields without touching protected spans. Returns
/// whether anything changed.
fn simplify(card: &mut Working, over_chars: usize) -> bool {
    let mut changed = false;
    let fields: Vec<&mut String> = match &mut card.content {
        CardContent::Basic { front, back } => vec![front, back],
        CardContent::Cloze { text } => vec![text],
    };
    for field in fields {
        if field.chars().count() <= over_chars {
            continue;
        }
        if let Some(simpler) = simplify_text(field) {
            if simpler != *field && !simpler.is_empty() {
                *field = simpler;
                changed = true;
            }
        }
    }
    if changed {
        card.rules.push(RULE_SIMPLIFY.to_string());
    }
    changed
}

fn simplify_text(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    for segment in segments(text).ok()? {
        if segment.protected {
            out.push_str(segment.text);
            continue;
        }
        let mut prose = collapse_spaces(segment.text);
        if segment.range.start == 0 {
            prose = strip_filler(&prose);
        }
        out.push_str(&reduce_punctuation(&prose));
    }
    Some(out.trim().to_string())
}

fn collapse_spaces(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_space = false;
    for c in text.chars() {
        if c == ' ' || c == '\t' {
            if !previous_space {
                out.push(' ');
            }
            previous_space = true;
        } else {
            out.push(c);
            previous_space = false;
        }
    }
    out
}

fn strip_filler(text: &str) -> String {
    let trimmed = text.trim_start();
    for filler in FILLERS {
        let matches = trimmed
            .get(..filler.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(filler));
        if matches {
            let rest = &trimmed[filler.len()..];
            let mut chars = rest.chars();
            return match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            };
        }
    }
    text.to_string()
}

fn reduce_punctuation(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous = None;
    for c in text.chars() {
        if (c == '!' || c == '?') && previous == Some(c) {
            continue;
        }
        out.push(c);
        previous = Some(c);
    }
    out
}

/// Prefix cards whose contexts are near-duplicates with a label telling
/// them apart. Siblings from the same split are already numbered and are
/// not compared.
fn label_interference(
    working: &mut [Working],
    originals: &[Card],
    threshold: f64,
    report: &mut OptimizationReport,
) {
    let contexts: Vec<String> = working
        .iter()
        .map(|card| card.content.context().unwrap_or_default())
        .collect();
    let sets: Vec<BTreeSet<String>> = contexts.iter().map(|context| token_set(context)).collect();
    let origins: Vec<usize> = working.iter().map(|card| card.origin).collect();
    let pairs = similar_pairs(&sets, &origins, threshold);

    let mut labels: Vec<Option<String>> = vec![None; working.len()];
    for (i, j) in pairs {
        if labels[i].is_some() && labels[j].is_some() {
            continue;
        }
        let label_i = distinguishing_label(&working[i], &working[j], &contexts[i], &sets[j], originals);
        let label_j = distinguishing_label(&working[j], &working[i], &contexts[j], &sets[i], originals);
        // A card whose context adds nothing is named by what it lacks.
        let (label_i, label_j) = match (label_i, label_j) {
            (Some(a), None) => {
                let not_a = format!("not {a}");
                (Some(a), Some(not_a))
            }
            (None, Some(b)) => (Some(format!("not {b}")), Some(b)),
            pair => pair,
        };
        if label_i == label_j {
            continue;
        }
        log::debug!(
            "Cards {i} and {j} interfere: labels {label_i:?} and {label_j:?}"
        );
        if labels[i].is_none() {
            labels[i] = label_i;
        }
        if labels[j].is_none() {
            labels[j] = label_j;
        }
    }

    for (card, label) in working.iter_mut().zip(labels) {
        let Some(label) = label else {
            continue;
        };
        match &mut card.content {
            CardContent::Basic { front, .. } => *front = format!("[{label}] {front}"),
            CardContent::Cloze { text } => *text = format!("[{label}] {text}"),
        }
        card.rules.push(RULE_LABEL.to_string());
        report.labeled += 1;
    }
}

/// Pairs `(i, j)`, `i < j`, of cards from different origins whose token
/// sets have a Jaccard similarity of at least `threshold`. The scan is
/// spread over threads; the result is sorted.
fn similar_pairs(sets: &[BTreeSet<String>], origins: &[usize], threshold: f64) -> Vec<(usize, usize)> {
    let n = sets.len();
    if n < 2 {
        return Vec::new();
    }
    let workers = thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
        .min(n);
    let rows: Vec<usize> = (0..n).collect();
    let chunk = n.div_ceil(workers);
    let mut pairs: Vec<(usize, usize)> = thread::scope(|scope| {
        let handles: Vec<_> = rows
            .chunks(chunk)
            .map(|rows| {
                scope.spawn(move || {
                    let mut found = Vec::new();
                    for &i in rows {
                        for j in i + 1..n {
                            if origins[i] != origins[j] && jaccard(&sets[i], &sets[j]) >= threshold {
                                found.push((i, j));
                            }
                        }
                    }
                    found
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect()
    });
    pairs.sort_unstable();
    pairs
}

/// First tag the other card lacks, else the module name if the modules
/// differ, else up to three words of this card's context the other lacks.
/// Words of four letters or more are preferred.
fn distinguishing_label(
    card: &Working,
    other: &Working,
    context: &str,
    other_words: &BTreeSet<String>,
    originals: &[Card],
) -> Option<String> {
    if let Some(tag) = card.tags.iter().find(|tag| !other.tags.contains(*tag)) {
        if let Some(label) = sanitize_label(tag) {
            return Some(label);
        }
    }
    let module = originals[card.origin].module;
    if module != originals[other.origin].module {
        return Some(module.name().to_string());
    }
    let fresh: Vec<String> = tokens(context)
        .into_iter()
        .filter(|word| !other_words.contains(word))
        .collect();
    let long: Vec<&String> = fresh.iter().filter(|word| word.chars().count() > 3).collect();
    let pool = if long.is_empty() { fresh.iter().collect() } else { long };
    let mut words: Vec<&str> = Vec::new();
    for word in pool {
        if !words.contains(&word.as_str()) {
            words.push(word);
            if words.len() == 3 {
                break;
            }
        }
    }
    sanitize_label(&words.join(" "))
}

/// Labels must not introduce markup.
fn sanitize_label(label: &str) -> Option<String> {
    let clean: String = label
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let clean = clean.trim();
    (!clean.is_empty()).then(|| clean.to_string())
}

/// Turn working copies into cards. A lone, unchanged copy is its generated
/// card; anything else becomes a derived card.
fn materialize(working: Vec<Working>, originals: &[Card], arena: &mut CardArena) -> Vec<Card> {
    let mut copies = vec![0usize; originals.len()];
    for card in &working {
        copies[card.origin] += 1;
    }
    let mut next_index = vec![0usize; originals.len()];
    let mut seen: HashMap<String, CardId> = HashMap::new();
    let mut cards = Vec::with_capacity(working.len());
    for copy in working {
        let origin = &originals[copy.origin];
        let card = if copies[copy.origin] == 1 && copy.content == origin.content {
            if copy.tags != origin.tags {
                arena.set_tags(&origin.id, copy.tags.clone());
            }
            let mut card = origin.clone();
            card.tags = copy.tags;
            card
        } else {
            let index = next_index[copy.origin];
            next_index[copy.origin] += 1;
            let mut card = Card::derived(origin, index, copy.content);
            card.tags = copy.tags;
            arena.insert(card.clone(), Stage::Optimizing, copy.rules);
            arena.retire(&origin.id, None);
            card
        };
        let key = format!("{}:{}", card.format(), card.content.fact_key());
        if let Some(kept) = seen.get(&key) {
            log::debug!("Dropping derived duplicate {}", card.id.short());
            arena.retire(&card.id, Some(*kept));
            continue;
        }
        seen.insert(key, card.id);
        cards.push(card);
    }
    cards
}

/// The live cards of the arena are exactly the output cards.
fn check_live(cards: &[Card], arena: &CardArena) -> Result<(), PipelineError> {
    let output: HashSet<CardId> = cards.iter().map(|card| card.id).collect();
    if let Some(card) = arena.live().find(|card| !output.contains(&card.id)) {
        return Err(violation(
            InvariantKind::Lineage,
            card,
            arena,
            "a live card is missing from the output",
        ));
    }
    if let Some(card) = cards
        .iter()
        .find(|card| arena.get(&card.id).is_none_or(|entry| !entry.live))
    {
        return Err(violation(
            InvariantKind::Lineage,
            card,
            arena,
            "an output card is not live in the lineage",
        ));
    }
    Ok(())
}

fn violation(kind: InvariantKind, card: &Card, arena: &CardArena, detail: &str) -> PipelineError {
    let rules = arena
        .get(&card.id)
        .map(|entry| entry.rules.join(", "))
        .filter(|rules| !rules.is_empty())
        .unwrap_or_else(|| "none".to_string());
    log::error!(
        "Invariant violated on card {}: {kind} ({detail}; rules: {rules})",
        card.id.short()
    );
    PipelineError::OptimizationInvariantViolated {
        kind,
        card: Some(card.id),
        rule: format!("{rules}: {detail}"),
    }
}

/// Markup conservation and marker sequence, checked per generated card
/// against everything derived from it.
fn check_conservation(originals: &[Card], cards: &[Card], arena: &CardArena) -> Result<(), PipelineError> {
    let mut groups: HashMap<CardId, Vec<&Card>> = HashMap::new();
    for card in cards {
        if let CardContent::Cloze { text } = &card.content {
            let sequential = cloze_markers(text)
                .map(|markers| !markers.is_empty() && is_sequential(&markers))
                .unwrap_or(false);
            if !sequential {
                return Err(violation(
                    InvariantKind::MarkerSequence,
                    card,
                    arena,
                    "markers must be numbered from 1 without gaps",
                ));
            }
        }
        groups
            .entry(card.origin_id.unwrap_or(card.id))
            .or_default()
            .push(card);
    }
    for origin in originals {
        let Some(children) = groups.get(&origin.id) else {
            continue;
        };
        if let [only] = children.as_slice() {
            if only.id == origin.id {
                continue;
            }
        }
        check_group(origin, children, arena)?;
    }
    Ok(())
}

fn check_group(origin: &Card, children: &[&Card], arena: &CardArena) -> Result<(), PipelineError> {
    let math = |kind_card: &Card, text: &str| {
        math_signature(text).map_err(|e| {
            violation(InvariantKind::MathConservation, kind_card, arena, &e.to_string())
        })
    };
    match &origin.content {
        CardContent::Basic { front, back } => {
            let front_math = math(origin, front)?;
            let mut back_math = Vec::new();
            for &child in children {
                let CardContent::Basic {
                    front: child_front,
                    back: child_back,
                } = &child.content
                else {
                    return Err(violation(InvariantKind::MathConservation, child, arena, "card changed format"));
                };
                if math(child, child_front)? != front_math {
                    return Err(violation(
                        InvariantKind::MathConservation,
                        child,
                        arena,
                        "math in the front changed",
                    ));
                }
                back_math.extend(math(child, child_back)?);
            }
            if back_math != math(origin, back)? {
                return Err(violation(
                    InvariantKind::MathConservation,
                    children[0],
                    arena,
                    "math in the back was not partitioned in order",
                ));
            }
        }
        CardContent::Cloze { text } => {
            let origin_math = math(origin, text)?;
            let origin_markers = marker_signature(text).map_err(|e| {
                violation(InvariantKind::MarkerSequence, origin, arena, &e.to_string())
            })?;
            let mut covered = vec![false; origin_markers.len()];
            for &child in children {
                let CardContent::Cloze { text: child_text } = &child.content else {
                    return Err(violation(InvariantKind::MarkerSequence, child, arena, "card changed format"));
                };
                if math(child, child_text)? != origin_math {
                    return Err(violation(
                        InvariantKind::MathConservation,
                        child,
                        arena,
                        "math spans changed",
                    ));
                }
                let child_markers = marker_signature(child_text).map_err(|e| {
                    violation(InvariantKind::MarkerSequence, child, arena, &e.to_string())
                })?;
                if children.len() == 1 {
                    if child_markers != origin_markers {
                        return Err(violation(
                            InvariantKind::MarkerSequence,
                            child,
                            arena,
                            "markers changed",
                        ));
                    }
                    covered.iter_mut().for_each(|c| *c = true);
                    continue;
                }
                for marker in &child_markers {
                    let source = origin_markers
                        .iter()
                        .position(|o| o.answer.contains(marker.answer.as_str()));
                    match source {
                        Some(idx) => {
                            for (pos, o) in origin_markers.iter().enumerate() {
                                if o.number == origin_markers[idx].number {
                                    covered[pos] = true;
                                }
                            }
                        }
                        None => {
                            return Err(violation(
                                InvariantKind::MarkerSequence,
                                child,
                                arena,
                                "marker answer is not part of the source card",
                            ));
                        }
                    }
                }
            }
            if covered.iter().any(|c| !c) {
                return Err(violation(
                    InvariantKind::MarkerSequence,
                    children[0],
                    arena,
                    "a deletion of the source card was lost",
                ));
            }
        }
    }
    Ok(())
}
