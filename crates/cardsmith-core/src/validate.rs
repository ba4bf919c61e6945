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

//! The six validation levels run over an export artifact. Levels run in
//! order and stop at the first one that fails, since later levels assume
//! the structure the earlier ones check.

use std::collections::HashSet;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Fallible;
use crate::error::PipelineError;
use crate::export::header_lines;
use crate::export::split_fields;
use crate::markup::cloze_markers;
use crate::markup::count_marker_openers;
use crate::markup::is_sequential;
use crate::markup::marker_signature;
use crate::markup::math_signature;
use crate::markup::math_spans;
use crate::registry::CardFormat;
use crate::types::card::Card;

pub const LEVELS: [u8; 6] = [1, 2, 3, 4, 5, 6];

/// Tags whose balance is checked. Anything else that looks like a tag is
/// treated as prose.
const BALANCED_TAGS: &[&str] = &[
    "a", "b", "blockquote", "code", "div", "em", "i", "li", "ol", "p", "pre", "span", "strong",
    "sub", "sup", "table", "td", "th", "tr", "u", "ul",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub format: CardFormat,
    pub level: u8,
    pub passed: bool,
    pub violations: Vec<String>,
}

impl ValidationReport {
    pub fn name(&self) -> &'static str {
        level_name(self.level)
    }
}

pub fn level_name(level: u8) -> &'static str {
    match level {
        1 => "structure",
        2 => "field separation",
        3 => "HTML escaping",
        4 => "special syntax balance",
        5 => "set coherence",
        6 => "pipeline preservation",
        _ => "unknown",
    }
}

/// The first failing report as an error.
pub fn first_failure(reports: &[ValidationReport]) -> Option<PipelineError> {
    reports
        .iter()
        .find(|report| !report.passed)
        .map(|report| PipelineError::ValidationFailed {
            level: report.level,
            diagnostics: report.violations.clone(),
        })
}

struct Line<'a> {
    number: usize,
    text: &'a str,
}

impl Line<'_> {
    fn at(&self, message: impl AsRef<str>) -> String {
        format!("line {}: {}: {}", self.number, message.as_ref(), preview(self.text))
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{cut}...")
    }
}

pub struct Validator {
    code: Regex,
    tag: Regex,
    entity: Regex,
}

impl Validator {
    pub fn new() -> Fallible<Self> {
        Ok(Validator {
            code: Regex::new(r"(?s)<code>(.*?)</code>")?,
            tag: Regex::new(r"<(/?)([a-zA-Z][a-zA-Z0-9]*)(?:\s[^<>]*)?(/?)>")?,
            entity: Regex::new(r"^&(?:#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z][a-zA-Z0-9]*);")?,
        })
    }

    /// Validate an artifact against the cards it was rendered from.
    pub fn validate(&self, format: CardFormat, text: &str, cards: &[&Card]) -> Vec<ValidationReport> {
        self.run_levels(format, text, Some(cards))
    }

    /// Validate an export file with no cards to compare against. Only the
    /// levels that read the file alone (1 to 5) run, and level 5 skips the
    /// card count.
    pub fn check_file(&self, format: CardFormat, text: &str) -> Vec<ValidationReport> {
        self.run_levels(format, text, None)
    }

    fn run_levels(&self, format: CardFormat, text: &str, cards: Option<&[&Card]>) -> Vec<ValidationReport> {
        let body = body_lines(format, text);
        let mut reports = Vec::new();
        for level in LEVELS {
            let violations = match level {
                1 => structure(format, text),
                2 => field_separation(format, &body),
                3 => self.escaping(&body),
                4 => syntax_balance(format, &body),
                5 => coherence(&body, cards),
                _ => match cards {
                    Some(cards) => preservation(&body, cards),
                    None => break,
                },
            };
            let passed = violations.is_empty();
            if !passed {
                log::warn!(
                    "{format} export failed level {level} ({}): {} violation(s)",
                    level_name(level),
                    violations.len()
                );
            }
            reports.push(ValidationReport {
                format,
                level,
                passed,
                violations,
            });
            if !passed {
                break;
            }
        }
        reports
    }

    fn escaping(&self, body: &[Line]) -> Vec<String> {
        let mut violations = Vec::new();
        for line in body {
            let Ok(fields) = split_fields(line.text) else {
                continue;
            };
            for field in fields {
                for capture in self.code.captures_iter(&field) {
                    let inner = capture.get(1).map_or("", |m| m.as_str()).replace("<br>", "");
                    if inner.contains('<') || inner.contains('>') {
                        violations.push(line.at("unescaped '<' or '>' inside code"));
                    }
                    let bare = inner
                        .match_indices('&')
                        .any(|(at, _)| !self.entity.is_match(&inner[at..]));
                    if bare {
                        violations.push(line.at("unescaped '&' inside code"));
                    }
                }
                if let Err(message) = self.tag_balance(&field) {
                    violations.push(line.at(message));
                }
            }
        }
        violations
    }

    fn tag_balance(&self, field: &str) -> Result<(), String> {
        let math = math_spans(field).unwrap_or_default();
        let mut open: Vec<String> = Vec::new();
        for capture in self.tag.captures_iter(field) {
            let Some(whole) = capture.get(0) else {
                continue;
            };
            if math.iter().any(|span| span.range().contains(&whole.start())) {
                continue;
            }
            let name = capture.get(2).map_or("", |m| m.as_str()).to_lowercase();
            let closing = capture.get(1).is_some_and(|m| !m.as_str().is_empty());
            let self_closing = capture.get(3).is_some_and(|m| !m.as_str().is_empty());
            if !BALANCED_TAGS.contains(&name.as_str()) || self_closing {
                continue;
            }
            if closing {
                match open.pop() {
                    Some(top) if top == name => {}
                    Some(top) => return Err(format!("</{name}> closes <{top}>")),
                    None => return Err(format!("</{name}> was never opened")),
                }
            } else {
                open.push(name);
            }
        }
        match open.last() {
            Some(name) => Err(format!("<{name}> is never closed")),
            None => Ok(()),
        }
    }
}

fn body_lines(format: CardFormat, text: &str) -> Vec<Line<'_>> {
    let headers = header_lines(format).len();
    let text = text.strip_suffix('\n').unwrap_or(text);
    text.split('\n')
        .enumerate()
        .skip(headers)
        .map(|(idx, text)| Line {
            number: idx + 1,
            text,
        })
        .collect()
}

fn structure(format: CardFormat, text: &str) -> Vec<String> {
    let mut violations = Vec::new();
    if !text.ends_with('\n') {
        violations.push("file does not end with a newline".to_string());
    }
    let lines: Vec<&str> = text.strip_suffix('\n').unwrap_or(text).split('\n').collect();
    for (idx, expected) in header_lines(format).iter().enumerate() {
        match lines.get(idx) {
            Some(line) if line == expected => {}
            Some(line) => violations.push(format!(
                "line {}: expected header '{expected}', found '{}'",
                idx + 1,
                preview(line)
            )),
            None => violations.push(format!("line {}: missing header '{expected}'", idx + 1)),
        }
    }
    for line in body_lines(format, text) {
        if line.text.trim().is_empty() {
            violations.push(format!("line {}: blank line", line.number));
        } else if line.text.starts_with('#') {
            violations.push(line.at("card line reads as a header"));
        } else if line.text.contains('\r') {
            violations.push(line.at("carriage return in card line"));
        }
    }
    violations
}

fn field_separation(format: CardFormat, body: &[Line]) -> Vec<String> {
    let expected = match format {
        CardFormat::Basic => 2,
        CardFormat::Cloze => 1,
    };
    body.iter()
        .filter_map(|line| match split_fields(line.text) {
            Ok(fields) if fields.len() == expected => None,
            Ok(fields) => Some(line.at(format!(
                "expected {expected} field(s), found {}",
                fields.len()
            ))),
            Err(message) => Some(line.at(message)),
        })
        .collect()
}

fn syntax_balance(format: CardFormat, body: &[Line]) -> Vec<String> {
    let mut violations = Vec::new();
    for line in body {
        let Ok(fields) = split_fields(line.text) else {
            continue;
        };
        for field in &fields {
            if let Err(e) = math_spans(field) {
                violations.push(line.at(e.to_string()));
                continue;
            }
            match cloze_markers(field) {
                Err(e) => violations.push(line.at(e.to_string())),
                Ok(markers) => {
                    if count_marker_openers(field) != markers.len() {
                        violations.push(line.at("blank marker opened but not closed"));
                    }
                    if format == CardFormat::Cloze {
                        if markers.is_empty() {
                            violations.push(line.at("cloze card without a blank marker"));
                        } else if !is_sequential(&markers) {
                            violations.push(line.at("blank markers are not numbered from 1"));
                        }
                    }
                }
            }
        }
    }
    violations
}

fn coherence(body: &[Line], cards: Option<&[&Card]>) -> Vec<String> {
    let mut violations = Vec::new();
    if let Some(cards) = cards
        && cards.len() != body.len()
    {
        violations.push(format!(
            "{} card line(s) exported for {} card(s)",
            body.len(),
            cards.len()
        ));
    }
    let mut seen = HashSet::new();
    for line in body {
        if let Ok(fields) = split_fields(line.text)
            && fields.iter().any(|field| field.trim().is_empty())
        {
            violations.push(line.at("empty field"));
        }
        if !seen.insert(line.text) {
            violations.push(line.at("duplicate card"));
        }
    }
    violations
}

fn preservation(body: &[Line], cards: &[&Card]) -> Vec<String> {
    let mut violations = Vec::new();
    for (line, card) in body.iter().zip(cards) {
        let Ok(exported) = split_fields(line.text) else {
            continue;
        };
        let original = card.content.fields();
        for (exported, original) in exported.iter().zip(original) {
            if math_signature(exported).ok() != math_signature(original).ok() {
                violations.push(line.at(format!("math differs from card {}", card.id.short())));
            }
            if marker_signature(exported).ok() != marker_signature(original).ok() {
                violations.push(line.at(format!(
                    "blank markers differ from card {}",
                    card.id.short()
                )));
            }
        }
    }
    violations
}
