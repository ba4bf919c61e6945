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

//! Scanning of the two kinds of embedded markup every stage must preserve:
//! math delimiter pairs and numbered blank (cloze) markers.
//!
//! Positions are byte offsets. All delimiters are ASCII, so a byte offset at
//! the start or end of a delimiter is always a char boundary.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Display;
use std::fmt::Formatter;
use std::ops::Range;

use serde::Deserialize;
use serde::Serialize;

/// The math delimiter pairs we recognize. Spans never nest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MathKind {
    /// `[$$]...[/$$]`
    AnkiBlock,
    /// `[$]...[/$]`
    AnkiInline,
    /// `\(...\)`
    Paren,
    /// `\[...\]`
    Bracket,
}

/// Order matters: `[$$]` must be tried before `[$]`.
pub const MATH_KINDS: [MathKind; 4] = [
    MathKind::AnkiBlock,
    MathKind::AnkiInline,
    MathKind::Paren,
    MathKind::Bracket,
];

impl MathKind {
    pub fn open(self) -> &'static str {
        match self {
            MathKind::AnkiBlock => "[$$]",
            MathKind::AnkiInline => "[$]",
            MathKind::Paren => "\\(",
            MathKind::Bracket => "\\[",
        }
    }

    pub fn close(self) -> &'static str {
        match self {
            MathKind::AnkiBlock => "[/$$]",
            MathKind::AnkiInline => "[/$]",
            MathKind::Paren => "\\)",
            MathKind::Bracket => "\\]",
        }
    }
}

/// A math span, delimiters included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MathSpan {
    pub kind: MathKind,
    pub start: usize,
    pub end: usize,
}

impl MathSpan {
    pub fn outer<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }

    pub fn content<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start + self.kind.open().len()..self.end - self.kind.close().len()]
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// A blank marker `{{cN::answer}}` or `{{cN::answer::hint}}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClozeMarker {
    pub number: u32,
    pub start: usize,
    pub end: usize,
    pub answer: Range<usize>,
    pub hint: Option<Range<usize>>,
}

impl ClozeMarker {
    pub fn answer<'a>(&self, text: &'a str) -> &'a str {
        &text[self.answer.clone()]
    }

    pub fn hint<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.hint.clone().map(|range| &text[range])
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// The identity of a marker, independent of where it sits in the text.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkerSignature {
    pub number: u32,
    pub answer: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkupError {
    UnclosedMath { delimiter: &'static str, offset: usize },
    UnmatchedMathClose { delimiter: &'static str, offset: usize },
    UnclosedMarker { offset: usize },
    NestedMarker { offset: usize },
    MarkerInMath { offset: usize },
}

impl Display for MarkupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkupError::UnclosedMath { delimiter, offset } => {
                write!(f, "math delimiter '{delimiter}' at byte {offset} is never closed")
            }
            MarkupError::UnmatchedMathClose { delimiter, offset } => {
                write!(f, "closing math delimiter '{delimiter}' at byte {offset} has no opener")
            }
            MarkupError::UnclosedMarker { offset } => {
                write!(f, "blank marker at byte {offset} is never closed")
            }
            MarkupError::NestedMarker { offset } => {
                write!(f, "blank marker at byte {offset} is nested in another marker")
            }
            MarkupError::MarkerInMath { offset } => {
                write!(f, "blank marker at byte {offset} starts inside a math span")
            }
        }
    }
}

impl Error for MarkupError {}

fn starts_with_at(bytes: &[u8], at: usize, needle: &str) -> bool {
    bytes
        .get(at..)
        .is_some_and(|rest| rest.starts_with(needle.as_bytes()))
}

fn find_from(bytes: &[u8], from: usize, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    bytes
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

fn math_open_at(bytes: &[u8], at: usize) -> Option<MathKind> {
    MATH_KINDS
        .into_iter()
        .find(|kind| starts_with_at(bytes, at, kind.open()))
}

fn math_close_at(bytes: &[u8], at: usize) -> Option<MathKind> {
    MATH_KINDS
        .into_iter()
        .find(|kind| starts_with_at(bytes, at, kind.close()))
}

/// Find every math span in the text, in order.
pub fn math_spans(text: &str) -> Result<Vec<MathSpan>, MarkupError> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if let Some(kind) = math_open_at(bytes, i) {
            let content_start = i + kind.open().len();
            match find_from(bytes, content_start, kind.close()) {
                Some(close_at) => {
                    let end = close_at + kind.close().len();
                    spans.push(MathSpan {
                        kind,
                        start: i,
                        end,
                    });
                    i = end;
                }
                None => {
                    return Err(MarkupError::UnclosedMath {
                        delimiter: kind.open(),
                        offset: i,
                    });
                }
            }
        } else if let Some(kind) = math_close_at(bytes, i) {
            return Err(MarkupError::UnmatchedMathClose {
                delimiter: kind.close(),
                offset: i,
            });
        } else {
            i += 1;
        }
    }
    Ok(spans)
}

/// If a marker opener `{{cN::` starts at `at`, return its number and length.
fn marker_open_at(text: &str, at: usize) -> Option<(u32, usize)> {
    let bytes = text.as_bytes();
    if !starts_with_at(bytes, at, "{{c") {
        return None;
    }
    let digits_start = at + 3;
    let mut j = digits_start;
    while j < bytes.len() && bytes[j].is_ascii_digit() {
        j += 1;
    }
    if j == digits_start || !starts_with_at(bytes, j, "::") {
        return None;
    }
    let number: u32 = text[digits_start..j].parse().ok()?;
    Some((number, j + 2 - at))
}

fn span_starting_at(spans: &[MathSpan], at: usize) -> Option<&MathSpan> {
    spans
        .binary_search_by_key(&at, |span| span.start)
        .ok()
        .map(|idx| &spans[idx])
}

fn reject_markers_inside(text: &str, span: &MathSpan) -> Result<(), MarkupError> {
    for at in span.start..span.end {
        if marker_open_at(text, at).is_some() {
            return Err(MarkupError::MarkerInMath { offset: at });
        }
    }
    Ok(())
}

/// Find every blank marker in the text, in order. Math spans are skipped
/// when looking for the closing `}}`, so `{{c1::\(x^{2}\)}}` is one marker.
pub fn cloze_markers(text: &str) -> Result<Vec<ClozeMarker>, MarkupError> {
    let math = math_spans(text)?;
    let bytes = text.as_bytes();
    let mut markers = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if let Some(span) = span_starting_at(&math, i) {
            reject_markers_inside(text, span)?;
            i = span.end;
            continue;
        }
        let Some((number, open_len)) = marker_open_at(text, i) else {
            i += 1;
            continue;
        };
        let answer_start = i + open_len;
        let mut j = answer_start;
        let mut close = None;
        let mut hint_at = None;
        while j < bytes.len() {
            if let Some(span) = span_starting_at(&math, j) {
                reject_markers_inside(text, span)?;
                j = span.end;
                continue;
            }
            if marker_open_at(text, j).is_some() {
                return Err(MarkupError::NestedMarker { offset: j });
            }
            if starts_with_at(bytes, j, "}}") {
                close = Some(j);
                break;
            }
            if hint_at.is_none() && starts_with_at(bytes, j, "::") {
                hint_at = Some(j);
                j += 2;
                continue;
            }
            j += 1;
        }
        let close = close.ok_or(MarkupError::UnclosedMarker { offset: i })?;
        let (answer, hint) = match hint_at {
            Some(sep) => (answer_start..sep, Some(sep + 2..close)),
            None => (answer_start..close, None),
        };
        markers.push(ClozeMarker {
            number,
            start: i,
            end: close + 2,
            answer,
            hint,
        });
        i = close + 2;
    }
    Ok(markers)
}

/// Count marker openers outside math spans, whether or not they close.
pub fn count_marker_openers(text: &str) -> usize {
    let math = math_spans(text).unwrap_or_default();
    (0..text.len())
        .filter(|at| !math.iter().any(|span| span.range().contains(at)))
        .filter(|at| marker_open_at(text, *at).is_some())
        .count()
}

/// Distinct marker numbers in order of first appearance.
pub fn distinct_numbers(markers: &[ClozeMarker]) -> Vec<u32> {
    let mut numbers = Vec::new();
    for marker in markers {
        if !numbers.contains(&marker.number) {
            numbers.push(marker.number);
        }
    }
    numbers
}

/// Whether the distinct numbers, in order of first appearance, are 1..=n.
pub fn is_sequential(markers: &[ClozeMarker]) -> bool {
    distinct_numbers(markers)
        .iter()
        .enumerate()
        .all(|(idx, number)| *number as usize == idx + 1)
}

/// Rewrite marker numbers so they run 1..=n in order of first appearance.
/// Answers and hints are copied verbatim.
pub fn renumber_markers(text: &str) -> Result<String, MarkupError> {
    let markers = cloze_markers(text)?;
    let mapping: BTreeMap<u32, u32> = distinct_numbers(&markers)
        .into_iter()
        .enumerate()
        .map(|(idx, number)| (number, idx as u32 + 1))
        .collect();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for marker in &markers {
        let number = mapping.get(&marker.number).copied().unwrap_or(marker.number);
        out.push_str(&text[last..marker.start]);
        out.push_str(&format!("{{{{c{number}::"));
        last = marker.answer.start;
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Keep the markers numbered `number` (renumbered to 1) and unwrap every
/// other marker to its bare answer text.
pub fn keep_only_marker(text: &str, number: u32) -> Result<String, MarkupError> {
    let markers = cloze_markers(text)?;
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for marker in &markers {
        out.push_str(&text[last..marker.start]);
        if marker.number == number {
            out.push_str("{{c1::");
            out.push_str(&text[marker.answer.start..marker.end]);
        } else {
            out.push_str(marker.answer(text));
        }
        last = marker.end;
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Replace each marker by a visible blank. Used to compare cloze contexts.
pub fn blank_markers(text: &str) -> Result<String, MarkupError> {
    let markers = cloze_markers(text)?;
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for marker in &markers {
        out.push_str(&text[last..marker.start]);
        out.push_str("[...]");
        last = marker.end;
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// The outer text of every math span, in order.
pub fn math_signature(text: &str) -> Result<Vec<String>, MarkupError> {
    Ok(math_spans(text)?
        .iter()
        .map(|span| span.outer(text).to_string())
        .collect())
}

pub fn marker_signature(text: &str) -> Result<Vec<MarkerSignature>, MarkupError> {
    Ok(cloze_markers(text)?
        .iter()
        .map(|marker| MarkerSignature {
            number: marker.number,
            answer: marker.answer(text).to_string(),
            hint: marker.hint(text).map(str::to_string),
        })
        .collect())
}

/// Backtick code spans (inline or fenced) outside the given protected ranges.
fn code_spans(text: &str, protected: &[Range<usize>]) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if let Some(range) = protected.iter().find(|range| range.start == i) {
            i = range.end;
            continue;
        }
        if bytes[i] != b'`' {
            i += 1;
            continue;
        }
        let run_start = i;
        while i < bytes.len() && bytes[i] == b'`' {
            i += 1;
        }
        let run = i - run_start;
        let mut j = i;
        let mut close = None;
        while j < bytes.len() {
            if bytes[j] == b'`' {
                let other_start = j;
                while j < bytes.len() && bytes[j] == b'`' {
                    j += 1;
                }
                if j - other_start == run {
                    close = Some(j);
                    break;
                }
            } else {
                j += 1;
            }
        }
        if let Some(end) = close {
            spans.push(run_start..end);
            i = end;
        }
    }
    spans
}

/// Math and backtick code ranges, where case is significant.
pub fn case_sensitive_spans(text: &str) -> Result<Vec<Range<usize>>, MarkupError> {
    let math: Vec<Range<usize>> = math_spans(text)?.iter().map(MathSpan::range).collect();
    let mut all = math.clone();
    all.extend(code_spans(text, &math));
    all.sort_by_key(|range| range.start);
    Ok(merge_ranges(all))
}

/// Ranges no rewriting pass may touch: math, markers and backtick code.
pub fn protected_spans(text: &str) -> Result<Vec<Range<usize>>, MarkupError> {
    let mut ranges: Vec<Range<usize>> = math_spans(text)?.iter().map(MathSpan::range).collect();
    ranges.extend(cloze_markers(text)?.iter().map(ClozeMarker::range));
    ranges.sort_by_key(|range| range.start);
    let merged = merge_ranges(ranges);
    let mut all = merged.clone();
    all.extend(code_spans(text, &merged));
    all.sort_by_key(|range| range.start);
    Ok(merge_ranges(all))
}

fn merge_ranges(ranges: Vec<Range<usize>>) -> Vec<Range<usize>> {
    let mut merged: Vec<Range<usize>> = Vec::new();
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start < last.end => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// A piece of text that is either free prose or a protected span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment<'a> {
    pub text: &'a str,
    pub range: Range<usize>,
    pub protected: bool,
}

pub fn segments(text: &str) -> Result<Vec<Segment<'_>>, MarkupError> {
    let protected = protected_spans(text)?;
    let mut out = Vec::new();
    let mut last = 0;
    for range in protected {
        if range.start > last {
            out.push(Segment {
                text: &text[last..range.start],
                range: last..range.start,
                protected: false,
            });
        }
        out.push(Segment {
            text: &text[range.clone()],
            range: range.clone(),
            protected: true,
        });
        last = range.end;
    }
    if last < text.len() {
        out.push(Segment {
            text: &text[last..],
            range: last..text.len(),
            protected: false,
        });
    }
    Ok(out)
}

/// Rewrite the unprotected parts of the text, copying protected spans verbatim.
pub fn map_unprotected(
    text: &str,
    mut f: impl FnMut(&str) -> String,
) -> Result<String, MarkupError> {
    let mut out = String::with_capacity(text.len());
    for segment in segments(text)? {
        if segment.protected {
            out.push_str(segment.text);
        } else {
            out.push_str(&f(segment.text));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_math_spans_all_kinds() -> Result<(), MarkupError> {
        let text = r"a \(x\) b \[y\] c [$]z[/$] d [$$]w[/$$]";
        let spans = math_spans(text)?;
        let kinds: Vec<MathKind> = spans.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MathKind::Paren,
                MathKind::Bracket,
                MathKind::AnkiInline,
                MathKind::AnkiBlock
            ]
        );
        let contents: Vec<&str> = spans.iter().map(|s| s.content(text)).collect();
        assert_eq!(contents, vec!["x", "y", "z", "w"]);
        Ok(())
    }

    #[test]
    fn test_unclosed_math() {
        assert_eq!(
            math_spans(r"before \(x = 1"),
            Err(MarkupError::UnclosedMath {
                delimiter: "\\(",
                offset: 7
            })
        );
    }

    #[test]
    fn test_stray_math_close() {
        assert!(matches!(
            math_spans(r"x \) y"),
            Err(MarkupError::UnmatchedMathClose { .. })
        ));
    }

    #[test]
    fn test_single_marker() -> Result<(), MarkupError> {
        let text = "A {{c1::Moore machine}} has outputs.";
        let markers = cloze_markers(text)?;
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].number, 1);
        assert_eq!(markers[0].answer(text), "Moore machine");
        assert_eq!(markers[0].hint(text), None);
        Ok(())
    }

    #[test]
    fn test_marker_with_hint() -> Result<(), MarkupError> {
        let text = "{{c2::Paris::capital}} is in France.";
        let markers = cloze_markers(text)?;
        assert_eq!(markers[0].number, 2);
        assert_eq!(markers[0].answer(text), "Paris");
        assert_eq!(markers[0].hint(text), Some("capital"));
        Ok(())
    }

    #[test]
    fn test_marker_containing_math_with_braces() -> Result<(), MarkupError> {
        let text = r"Area is {{c1::\(\pi r^{2}\)}}.";
        let markers = cloze_markers(text)?;
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].answer(text), r"\(\pi r^{2}\)");
        Ok(())
    }

    #[test]
    fn test_marker_inside_math_is_rejected() {
        let text = r"\(x = {{c1::y}}\)";
        assert_eq!(
            cloze_markers(text),
            Err(MarkupError::MarkerInMath { offset: 6 })
        );
    }

    #[test]
    fn test_unclosed_and_nested_markers() {
        assert_eq!(
            cloze_markers("{{c1::open"),
            Err(MarkupError::UnclosedMarker { offset: 0 })
        );
        assert!(matches!(
            cloze_markers("{{c1::a {{c2::b}} c}}"),
            Err(MarkupError::NestedMarker { .. })
        ));
    }

    #[test]
    fn test_sequential_allows_repeats() -> Result<(), MarkupError> {
        let ok = cloze_markers("{{c1::a}} {{c2::b}} {{c1::c}}")?;
        assert!(is_sequential(&ok));
        let gap = cloze_markers("{{c1::a}} {{c3::b}}")?;
        assert!(!is_sequential(&gap));
        let backwards = cloze_markers("{{c2::a}} {{c1::b}}")?;
        assert!(!is_sequential(&backwards));
        Ok(())
    }

    #[test]
    fn test_renumber() -> Result<(), MarkupError> {
        let text = "{{c3::a}} and {{c7::b::h}} then {{c3::c}}";
        assert_eq!(
            renumber_markers(text)?,
            "{{c1::a}} and {{c2::b::h}} then {{c1::c}}"
        );
        Ok(())
    }

    #[test]
    fn test_keep_only_marker() -> Result<(), MarkupError> {
        let text = r"{{c1::Moore}} outputs depend on {{c2::the state \(s\)}}.";
        assert_eq!(
            keep_only_marker(text, 2)?,
            r"Moore outputs depend on {{c1::the state \(s\)}}."
        );
        assert_eq!(
            keep_only_marker(text, 1)?,
            r"{{c1::Moore}} outputs depend on the state \(s\)."
        );
        Ok(())
    }

    #[test]
    fn test_blank_markers() -> Result<(), MarkupError> {
        assert_eq!(blank_markers("a {{c1::b}} c")?, "a [...] c");
        Ok(())
    }

    #[test]
    fn test_protected_spans_cover_code() -> Result<(), MarkupError> {
        let text = "run `a < b` with \\(x\\) and {{c1::y}}";
        let segs = segments(text)?;
        let protected: Vec<&str> = segs
            .iter()
            .filter(|s| s.protected)
            .map(|s| s.text)
            .collect();
        assert_eq!(protected, vec!["`a < b`", "\\(x\\)", "{{c1::y}}"]);
        Ok(())
    }

    #[test]
    fn test_map_unprotected_leaves_math() -> Result<(), MarkupError> {
        let text = r"hello \(hello\) hello";
        let out = map_unprotected(text, |s| s.to_uppercase())?;
        assert_eq!(out, r"HELLO \(hello\) HELLO");
        Ok(())
    }

    #[test]
    fn test_count_marker_openers_ignores_math() {
        assert_eq!(count_marker_openers("{{c1::a}} {{c2::b"), 2);
        assert_eq!(count_marker_openers(r"\(\{{c1::a}}\)"), 0);
    }
}
