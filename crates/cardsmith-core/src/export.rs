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

//! Serialization of the final card set into import files: a few header
//! lines, then one card per line with `;`-separated fields.

use serde::Deserialize;
use serde::Serialize;

use crate::markdown::code_to_html;
use crate::markup::cloze_markers;
use crate::markup::math_spans;
use crate::registry::CardFormat;
use crate::types::card::Card;

pub const SEPARATOR: char = ';';
pub const QUOTE: char = '"';

/// One export file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub format: CardFormat,
    pub cards: usize,
    pub text: String,
}

impl Artifact {
    pub fn file_name(&self, stem: &str) -> String {
        format!("{stem}-{}.txt", self.format)
    }
}

pub fn header_lines(format: CardFormat) -> &'static [&'static str] {
    match format {
        CardFormat::Basic => &["#separator:;", "#html:true"],
        CardFormat::Cloze => &["#separator:;", "#html:true", "#notetype:Cloze"],
    }
}

/// Split the cards by format, basic first, keeping their order.
pub fn group_by_format(cards: &[Card]) -> Vec<(CardFormat, Vec<&Card>)> {
    [CardFormat::Basic, CardFormat::Cloze]
        .into_iter()
        .map(|format| {
            let group: Vec<&Card> = cards.iter().filter(|card| card.format() == format).collect();
            (format, group)
        })
        .filter(|(_, group)| !group.is_empty())
        .collect()
}

/// Render the cards of one format. Cards of other formats are skipped.
pub fn render_artifact(format: CardFormat, cards: &[&Card]) -> Artifact {
    let mut text = String::new();
    for header in header_lines(format) {
        text.push_str(header);
        text.push('\n');
    }
    let mut count = 0;
    for card in cards.iter().filter(|card| card.format() == format) {
        text.push_str(&render_line(card));
        text.push('\n');
        count += 1;
    }
    Artifact {
        format,
        cards: count,
        text,
    }
}

pub fn render_line(card: &Card) -> String {
    card.content
        .fields()
        .iter()
        .map(|field| quote_field(&render_field(field)))
        .collect::<Vec<_>>()
        .join(&SEPARATOR.to_string())
}

/// Convert a field to single-line HTML: code becomes `<code>`/`<pre>`,
/// line breaks become `<br>`. Math and markers are copied verbatim.
pub fn render_field(field: &str) -> String {
    let mut protected: Vec<_> = math_spans(field)
        .map(|spans| spans.iter().map(|span| span.range()).collect())
        .unwrap_or_default();
    if let Ok(markers) = cloze_markers(field) {
        protected.extend(markers.iter().map(|marker| marker.range()));
    }
    let mut out = String::with_capacity(field.len());
    let mut last = 0;
    for (range, html) in code_to_html(field, &protected) {
        push_prose(&mut out, &field[last..range.start]);
        out.push_str(&html);
        last = range.end;
    }
    push_prose(&mut out, &field[last..]);
    out
}

fn push_prose(out: &mut String, text: &str) {
    out.push_str(&text.replace("\r\n", "\n").replace('\n', "<br>"));
}

/// Quote a field when it holds the separator, a quote, or would read as a
/// header line. Embedded quotes are doubled.
pub fn quote_field(field: &str) -> String {
    if field.contains(SEPARATOR) || field.contains(QUOTE) || field.starts_with('#') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split a line into unquoted fields.
pub fn split_fields(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        let mut field = String::new();
        if chars.peek() == Some(&QUOTE) {
            chars.next();
            loop {
                match chars.next() {
                    None => return Err("quoted field is not closed".to_string()),
                    Some(QUOTE) => match chars.peek() {
                        Some(&QUOTE) => {
                            chars.next();
                            field.push(QUOTE);
                        }
                        Some(&SEPARATOR) | None => break,
                        Some(c) => {
                            return Err(format!("quote inside a quoted field is not doubled (before '{c}')"));
                        }
                    },
                    Some(c) => field.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == SEPARATOR {
                    break;
                }
                if c == QUOTE {
                    return Err("quote character in an unquoted field".to_string());
                }
                field.push(c);
                chars.next();
            }
        }
        fields.push(field);
        match chars.next() {
            Some(SEPARATOR) => continue,
            None => return Ok(fields),
            Some(c) => return Err(format!("unexpected '{c}' after a field")),
        }
    }
}
