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

//! Card generation for one (module, format) pair. The capability proposes
//! cards; everything it proposes goes through the same acceptance checks
//! as the template cards we fall back on for uncovered items.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

use crate::atomizer::fact_count;
use crate::capability::CallError;
use crate::capability::CallPolicy;
use crate::capability::GenerationRequest;
use crate::capability::RawCard;
use crate::capability::RawCardContent;
use crate::capability::TextGenerator;
use crate::capability::call_with_retry;
use crate::capability::parse_cards;
use crate::config::TaxonomyTargets;
use crate::error::PipelineError;
use crate::markup::blank_markers;
use crate::markup::cloze_markers;
use crate::markup::math_spans;
use crate::markup::renumber_markers;
use crate::registry::CardFormat;
use crate::registry::ContentModule;
use crate::text::contains_phrase;
use crate::text::normalize;
use crate::text::tokens;
use crate::types::card::Bloom;
use crate::types::card::Card;
use crate::types::card::CardContent;
use crate::types::card::Tags;
use crate::types::item::ExtractedItem;
use crate::types::run::Stage;

/// Phrasings that admit more than one valid answer.
const AMBIGUOUS: &[&str] = &[
    "name a ",
    "name an ",
    "name one ",
    "give an example",
    "give one example",
    "list some",
    "what is an example",
    "cite un",
    "citez un",
    "donnez un exemple",
    "nommez un",
];

const YES_NO: &[&str] = &["yes", "no", "true", "false", "oui", "non", "vrai", "faux"];

const COMPREHENSION_CUES: &[&str] = &[
    "why",
    "how does",
    "how do",
    "explain",
    "compare",
    "difference",
    "distinguish",
    "pourquoi",
    "expliquez",
    "comparez",
];

const APPLICATION_CUES: &[&str] = &[
    "calculate",
    "compute",
    "apply",
    "solve",
    "what happens if",
    "given",
    "what would",
    "calculez",
    "appliquez",
    "que se passe-t-il",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Malformed,
    Ambiguous,
    Duplicate,
    Trivial,
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Malformed => write!(f, "malformed"),
            RejectReason::Ambiguous => write!(f, "ambiguous"),
            RejectReason::Duplicate => write!(f, "duplicate"),
            RejectReason::Trivial => write!(f, "trivial"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
}

/// Achieved cognitive-level distribution of a batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyReport {
    pub counts: BTreeMap<Bloom, usize>,
}

impl TaxonomyReport {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn count(&self, level: Bloom) -> usize {
        self.counts.get(&level).copied().unwrap_or(0)
    }

    pub fn percent(&self, level: Bloom) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.count(level) as f64 * 100.0 / total as f64
    }

    /// Levels whose share lies outside the advisory band.
    pub fn deviations(&self, targets: &TaxonomyTargets) -> Vec<String> {
        if self.total() == 0 {
            return Vec::new();
        }
        [Bloom::Recall, Bloom::Comprehension, Bloom::Application]
            .into_iter()
            .filter_map(|level| {
                let band = targets.band(level);
                let percent = self.percent(level);
                if band.contains(percent) {
                    None
                } else {
                    Some(format!(
                        "{level} cards at {percent:.0}% (target {:.0}-{:.0}%)",
                        band.min, band.max
                    ))
                }
            })
            .collect()
    }

    fn record(&mut self, level: Bloom) {
        *self.counts.entry(level).or_insert(0) += 1;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub module: ContentModule,
    pub format: CardFormat,
    pub emitted: usize,
    pub rejected: Vec<Rejection>,
    /// Cards built from item fields because no proposed card covered the item.
    pub templated: usize,
    /// Items that yielded no card because even their template was rejected.
    pub non_memorable: Vec<String>,
    /// Accepted cards that still state several facts. The optimizer splits
    /// them one fact per card.
    #[serde(default)]
    pub multi_fact: Vec<String>,
    pub taxonomy: TaxonomyReport,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub cards: Vec<Card>,
    pub report: BatchReport,
}

/// Generate the cards of one module in one format.
pub async fn generate<G: TextGenerator>(
    generator: &G,
    module: ContentModule,
    format: CardFormat,
    items: &[ExtractedItem],
    policy: CallPolicy,
    targets: &TaxonomyTargets,
) -> Result<Batch, PipelineError> {
    let input = serde_json::to_string_pretty(items).map_err(|e| PipelineError::GenerationFailed {
        module,
        cause: e.to_string(),
    })?;
    let request = GenerationRequest::generate(module, format, input);
    match call_with_retry(generator, &request, policy, parse_cards).await {
        Ok(raw) => {
            let batch = accept(module, format, items, raw, targets);
            if batch.cards.is_empty() {
                log::warn!("Every {format} card for module {module} was rejected.");
                return Err(PipelineError::GenerationRejectedAll { module });
            }
            Ok(batch)
        }
        Err(CallError::Timeout) => Err(PipelineError::StageTimeout {
            stage: Stage::Generating,
        }),
        Err(CallError::Capability(cause) | CallError::RateLimited(cause)) => {
            Err(PipelineError::GenerationFailed { module, cause })
        }
        Err(CallError::Schema(cause)) => {
            log::warn!("Module {module} never returned a usable card set: {cause}");
            Err(PipelineError::GenerationRejectedAll { module })
        }
    }
}

/// Run the acceptance checks over the proposed cards, then cover the items
/// no proposed card covered. Pure and deterministic.
pub fn accept(
    module: ContentModule,
    format: CardFormat,
    items: &[ExtractedItem],
    raw: Vec<RawCard>,
    targets: &TaxonomyTargets,
) -> Batch {
    let mut acceptor = Acceptor::new(module, format);
    let mut covered = vec![false; items.len()];
    for card in raw {
        let content = match card.content {
            RawCardContent::Basic { front, back } => CardContent::Basic { front, back },
            RawCardContent::Cloze { text } => CardContent::Cloze { text },
        };
        let tags: Tags = card
            .tags
            .iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        let bloom = card.bloom.as_deref().and_then(parse_bloom);
        if let Some(accepted) = acceptor.offer(content, tags, bloom) {
            match card.item.filter(|idx| *idx < items.len()) {
                Some(idx) => covered[idx] = true,
                None => {
                    let fields = accepted.fields().join(" ");
                    for (idx, item) in items.iter().enumerate() {
                        if contains_phrase(&fields, &item.label()) {
                            covered[idx] = true;
                        }
                    }
                }
            }
        }
    }
    let mut templated = 0;
    let mut non_memorable = Vec::new();
    for (item, _) in items.iter().zip(&covered).filter(|(_, covered)| !**covered) {
        let label = item.label();
        match template(item, format) {
            Some(content) => {
                let before = acceptor.rejected.len();
                if acceptor.offer(content, Tags::new(), None).is_some() {
                    templated += 1;
                } else {
                    let reason = acceptor.rejected[before..]
                        .first()
                        .map(|rejection| rejection.reason.to_string())
                        .unwrap_or_default();
                    non_memorable.push(format!("{label} ({reason})"));
                }
            }
            None => non_memorable.push(format!("{label} (no memorable fact)")),
        }
    }
    let taxonomy = acceptor.taxonomy();
    log::info!(
        "Module {module} ({format}): {} cards, {} rejected, {templated} from templates; recall {:.0}% comprehension {:.0}% application {:.0}%",
        acceptor.cards.len(),
        acceptor.rejected.len(),
        taxonomy.percent(Bloom::Recall),
        taxonomy.percent(Bloom::Comprehension),
        taxonomy.percent(Bloom::Application),
    );
    for deviation in taxonomy.deviations(targets) {
        log::warn!("Module {module} ({format}): {deviation}");
    }
    for item in &non_memorable {
        log::debug!("Module {module}: non-memorable item {item}");
    }
    Batch {
        report: BatchReport {
            module,
            format,
            emitted: acceptor.cards.len(),
            rejected: acceptor.rejected,
            templated,
            non_memorable,
            multi_fact: acceptor.multi_fact,
            taxonomy,
        },
        cards: acceptor.cards,
    }
}

struct Acceptor {
    module: ContentModule,
    format: CardFormat,
    seen: HashSet<String>,
    cards: Vec<Card>,
    rejected: Vec<Rejection>,
    multi_fact: Vec<String>,
}

impl Acceptor {
    fn new(module: ContentModule, format: CardFormat) -> Self {
        Acceptor {
            module,
            format,
            seen: HashSet::new(),
            cards: Vec::new(),
            rejected: Vec::new(),
            multi_fact: Vec::new(),
        }
    }

    /// Accept the card, returning its final content, or record why not.
    fn offer(&mut self, content: CardContent, tags: Tags, bloom: Option<Bloom>) -> Option<CardContent> {
        let summary = content.fields().join(" | ");
        let verdict = structural(self.format, content).and_then(|content| {
            if is_ambiguous(&content) {
                return Err(Rejection {
                    reason: RejectReason::Ambiguous,
                    detail: String::new(),
                });
            }
            if self.seen.contains(&content.fact_key()) {
                return Err(Rejection {
                    reason: RejectReason::Duplicate,
                    detail: String::new(),
                });
            }
            if is_trivial(&content) {
                return Err(Rejection {
                    reason: RejectReason::Trivial,
                    detail: String::new(),
                });
            }
            Ok(content)
        });
        match verdict {
            Ok(content) => {
                self.seen.insert(content.fact_key());
                let facts = fact_count(&content);
                if facts > 1 {
                    log::info!(
                        "Module {}: card states {facts} facts, left for splitting: {summary}",
                        self.module
                    );
                    self.multi_fact.push(format!("{summary} ({facts} facts)"));
                }
                let bloom = bloom.unwrap_or_else(|| classify(&content));
                let card = Card::generated(self.module, content.clone(), tags, Some(bloom));
                self.cards.push(card);
                Some(content)
            }
            Err(mut rejection) => {
                if rejection.detail.is_empty() {
                    rejection.detail = summary;
                } else {
                    rejection.detail = format!("{}: {summary}", rejection.detail);
                }
                log::debug!(
                    "Rejected {} card for module {}: {} ({})",
                    self.format,
                    self.module,
                    rejection.reason,
                    rejection.detail
                );
                self.rejected.push(rejection);
                None
            }
        }
    }

    fn taxonomy(&self) -> TaxonomyReport {
        let mut report = TaxonomyReport::default();
        for card in &self.cards {
            report.record(card.bloom.unwrap_or(Bloom::Recall));
        }
        report
    }
}

fn malformed(detail: impl Into<String>) -> Rejection {
    Rejection {
        reason: RejectReason::Malformed,
        detail: detail.into(),
    }
}

/// Format-specific structure. Cloze markers are renumbered here, the only
/// place where renumbering is allowed.
fn structural(format: CardFormat, content: CardContent) -> Result<CardContent, Rejection> {
    match (format, content) {
        (CardFormat::Basic, CardContent::Basic { front, back }) => {
            let front = front.trim().to_string();
            let back = back.trim().to_string();
            if front.is_empty() || back.is_empty() {
                return Err(malformed("empty front or back"));
            }
            for field in [&front, &back] {
                single_line_markup(field)?;
            }
            Ok(CardContent::Basic { front, back })
        }
        (CardFormat::Cloze, CardContent::Cloze { text }) => {
            let text = text.trim();
            single_line_markup(text)?;
            let markers = cloze_markers(text).map_err(|e| malformed(e.to_string()))?;
            if markers.is_empty() {
                return Err(malformed("no blank marker"));
            }
            let text = renumber_markers(text).map_err(|e| malformed(e.to_string()))?;
            Ok(CardContent::Cloze { text })
        }
        (CardFormat::Basic, CardContent::Cloze { .. }) => Err(malformed("cloze card in a basic batch")),
        (CardFormat::Cloze, CardContent::Basic { .. }) => Err(malformed("basic card in a cloze batch")),
    }
}

/// Math and markers must parse and stay on one line: export turns line
/// breaks into `<br>` everywhere except inside them.
fn single_line_markup(field: &str) -> Result<(), Rejection> {
    let spans = math_spans(field).map_err(|e| malformed(e.to_string()))?;
    if spans.iter().any(|span| span.outer(field).contains('\n')) {
        return Err(malformed("line break inside math"));
    }
    if let Ok(markers) = cloze_markers(field)
        && markers.iter().any(|marker| field[marker.range()].contains('\n'))
    {
        return Err(malformed("line break inside a blank marker"));
    }
    Ok(())
}

fn is_ambiguous(content: &CardContent) -> bool {
    let Ok(context) = content.context() else {
        return true;
    };
    let context = format!("{} ", normalize(&context));
    if AMBIGUOUS.iter().any(|phrase| context.contains(phrase)) {
        return true;
    }
    match content {
        CardContent::Cloze { .. } => tokens(&context.replace("[...]", "")).is_empty(),
        CardContent::Basic { .. } => false,
    }
}

fn is_trivial(content: &CardContent) -> bool {
    match content {
        CardContent::Basic { front, back } => {
            let answer = normalize(back);
            let answer = answer.trim_end_matches(['.', '!']);
            YES_NO.contains(&answer) || contains_phrase(front, back)
        }
        CardContent::Cloze { text } => {
            let (Ok(markers), Ok(blanked)) = (cloze_markers(text), blank_markers(text)) else {
                return false;
            };
            markers
                .iter()
                .any(|marker| contains_phrase(&blanked, marker.answer(text)))
        }
    }
}

pub fn parse_bloom(value: &str) -> Option<Bloom> {
    match value.trim().to_lowercase().as_str() {
        "recall" | "remember" | "knowledge" => Some(Bloom::Recall),
        "comprehension" | "understand" | "understanding" => Some(Bloom::Comprehension),
        "application" | "apply" | "analysis" => Some(Bloom::Application),
        _ => None,
    }
}

/// Keyword classifier for cards that carry no level.
pub fn classify(content: &CardContent) -> Bloom {
    let context = normalize(&content.context().unwrap_or_default());
    if APPLICATION_CUES.iter().any(|cue| context.contains(cue)) {
        Bloom::Application
    } else if COMPREHENSION_CUES.iter().any(|cue| context.contains(cue)) {
        Bloom::Comprehension
    } else {
        Bloom::Recall
    }
}

fn wrap_math(formula: &str) -> String {
    match math_spans(formula) {
        Ok(spans) if spans.is_empty() => format!("\\({formula}\\)"),
        _ => formula.to_string(),
    }
}

fn cloze(answer: &str) -> String {
    format!("{{{{c1::{answer}}}}}")
}

/// A deterministic card built from the item's own fields.
fn template(item: &ExtractedItem, format: CardFormat) -> Option<CardContent> {
    let content = match (item, format) {
        (ExtractedItem::Themes(theme), CardFormat::Basic) => CardContent::new_basic(
            format!("What is the main idea of \"{}\"?", theme.title),
            &theme.summary,
        ),
        (ExtractedItem::Themes(theme), CardFormat::Cloze) => {
            CardContent::new_cloze(format!("{}: {}", theme.title, cloze(&theme.summary)))
        }
        (ExtractedItem::Vocabulary(term), CardFormat::Basic) => {
            CardContent::new_basic(format!("What is {}?", term.term), &term.definition)
        }
        (ExtractedItem::Vocabulary(term), CardFormat::Cloze) => {
            CardContent::new_cloze(format!("{}: {}", cloze(&term.term), term.definition))
        }
        (ExtractedItem::Tables(table), CardFormat::Basic) => CardContent::new_basic(
            format!("Which columns does the table \"{}\" have?", table.title),
            table.headers.join(", "),
        ),
        (ExtractedItem::Tables(table), CardFormat::Cloze) => CardContent::new_cloze(format!(
            "The table \"{}\" has the columns {}",
            table.title,
            cloze(&table.headers.join(", "))
        )),
        (ExtractedItem::MathFormulas(formula), CardFormat::Basic) => CardContent::new_basic(
            format!("What does the formula {} express?", wrap_math(&formula.formula)),
            &formula.description,
        ),
        (ExtractedItem::MathFormulas(formula), CardFormat::Cloze) => CardContent::new_cloze(
            format!("{}: {}", formula.description, cloze(&wrap_math(&formula.formula))),
        ),
        (ExtractedItem::Code(code), CardFormat::Basic) => {
            let language = code.language.as_deref().unwrap_or_default();
            let front = if language.is_empty() {
                "What does this code do?".to_string()
            } else {
                format!("What does this {language} code do?")
            };
            CardContent::new_basic(
                format!("{front}\n```{language}\n{}\n```", code.snippet.trim_end()),
                &code.explanation,
            )
        }
        (ExtractedItem::Code(code), CardFormat::Cloze) => CardContent::new_cloze(format!(
            "```{}\n{}\n```\n{}",
            code.language.as_deref().unwrap_or_default(),
            code.snippet.trim_end(),
            cloze(&code.explanation)
        )),
        (ExtractedItem::ImagesList(image), _) => match (image.page, &image.caption) {
            (Some(page), _) => {
                CardContent::new_basic(format!("On which page is {}?", image.label), page.to_string())
            }
            (None, Some(caption)) => {
                CardContent::new_basic(format!("What does {} show?", image.label), caption)
            }
            (None, None) => return None,
        },
        (ExtractedItem::ImagesDescriptions(image), CardFormat::Basic) => {
            CardContent::new_basic(format!("What does {} show?", image.label), &image.description)
        }
        (ExtractedItem::ImagesDescriptions(image), CardFormat::Cloze) => CardContent::new_cloze(
            format!("{} shows {}", image.label, cloze(&image.description)),
        ),
    };
    Some(content)
}
