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

//! Rule-based module detection. Every rule is a pure function of the
//! document text, so detection is repeatable.

use std::collections::BTreeSet;

use regex::Regex;

use crate::error::Fallible;
use crate::error::PipelineError;
use crate::markup::math_spans;
use crate::registry::ContentModule;

/// Documents with at least this many words of prose have themes even
/// without headings.
const PROSE_WORDS: usize = 80;

pub struct Detector {
    heading: Regex,
    definition: Regex,
    term_line: Regex,
    table_rule: Regex,
    latex_command: Regex,
    equation: Regex,
    fence: Regex,
    code_keyword: Regex,
    image: Regex,
    figure_ref: Regex,
    caption: Regex,
    allow: Option<BTreeSet<ContentModule>>,
}

impl Detector {
    pub fn new(allow: Option<BTreeSet<ContentModule>>) -> Fallible<Self> {
        Ok(Detector {
            heading: Regex::new(r"(?m)^#{1,6}\s+\S")?,
            definition: Regex::new(
                r"(?i)\b(?:is an?|refers to|(?:is )?defined as|means|est une?|désigne)\s+\S",
            )?,
            term_line: Regex::new(r"(?m)^\s*(?:[-*]\s+)?\*{0,2}[\p{L}][\p{L}\s'-]{0,40}\*{0,2}\s*:\s+\S")?,
            table_rule: Regex::new(r"(?m)^\s*\|?\s*:?-{3,}:?\s*(?:\|\s*:?-{3,}:?\s*)+\|?\s*$")?,
            latex_command: Regex::new(
                r"\\(?:frac|sum|int|sqrt|prod|lim|alpha|beta|gamma|delta|lambda|sigma|theta|pi|cdot|times|leq|geq|infty)\b",
            )?,
            equation: Regex::new(r"(?m)^\s*[\p{L}_][\w]*\s*=\s*(?:[^=\n]*[-+*/^]|[^=\n]*\w\([^)\n]*\))")?,
            fence: Regex::new(r"(?m)^\s*```")?,
            code_keyword: Regex::new(
                r"(?m)^\s*(?:def|fn|function|class|import|#include|public|private|return|let|const|var|for|while|if)\b[^\n]*[;:{(]\s*$",
            )?,
            image: Regex::new(r"!\[[^\]]*\]\([^)]*\)")?,
            figure_ref: Regex::new(r"(?i)\b(?:figure|fig\.|diagram|image|schéma)\s*\d+")?,
            caption: Regex::new(r"(?im)^\s*(?:figure|fig\.)\s*\d+\s*[:.-]\s+\S")?,
            allow,
        })
    }

    /// The modules that apply to the document, in registry order.
    pub fn detect(&self, text: &str) -> Result<Vec<ContentModule>, PipelineError> {
        let prose = strip_fenced_code(text);
        let mut found = Vec::new();
        if self.heading.is_match(&prose) || prose.split_whitespace().count() >= PROSE_WORDS {
            found.push(ContentModule::Themes);
        }
        if self.definition.is_match(&prose) || self.term_line.is_match(&prose) {
            found.push(ContentModule::Vocabulary);
        }
        if self.table_rule.is_match(&prose) {
            found.push(ContentModule::Tables);
        }
        if self.has_math(&prose) {
            found.push(ContentModule::MathFormulas);
        }
        if self.fence.is_match(text) || has_indented_block(text) || self.code_keyword.is_match(text) {
            found.push(ContentModule::Code);
        }
        if self.image.is_match(&prose) || self.figure_ref.is_match(&prose) {
            found.push(ContentModule::ImagesList);
        }
        if self.caption.is_match(&prose) {
            found.push(ContentModule::ImagesDescriptions);
        }
        if let Some(allow) = &self.allow {
            found.retain(|module| allow.contains(module));
        }
        log::debug!("Detected modules: {found:?}");
        if found.is_empty() {
            return Err(PipelineError::NoApplicableModule);
        }
        Ok(found)
    }

    fn has_math(&self, text: &str) -> bool {
        let delimited = math_spans(text).map(|spans| !spans.is_empty()).unwrap_or(true);
        delimited || self.latex_command.is_match(text) || self.equation.is_match(text)
    }
}

/// Drop fenced code blocks so code does not read as prose or equations.
fn strip_fenced_code(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Two or more consecutive lines indented by four spaces or a tab, after a
/// blank line.
fn has_indented_block(text: &str) -> bool {
    let mut previous_blank = true;
    let mut run = 0;
    for line in text.lines() {
        let indented = (line.starts_with("    ") || line.starts_with('\t')) && !line.trim().is_empty();
        if indented && (run > 0 || previous_blank) {
            run += 1;
            if run >= 2 {
                return true;
            }
        } else {
            run = 0;
        }
        previous_blank = line.trim().is_empty();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(text: &str) -> Result<Vec<ContentModule>, PipelineError> {
        Detector::new(None).unwrap().detect(text)
    }

    #[test]
    fn test_formula_only_document() -> Fallible<()> {
        assert_eq!(detect("output = g(state)")?, vec![ContentModule::MathFormulas]);
        Ok(())
    }

    #[test]
    fn test_mixed_document() -> Fallible<()> {
        let text = "# Machines\n\nA Moore machine is a finite-state machine.\n\n| a | b |\n|---|---|\n| 1 | 2 |\n\n```rust\nfn main() {}\n```\n\n![diagram](fsm.png)\n\nFigure 1: A two-state machine.\n";
        let modules = detect(text)?;
        assert_eq!(
            modules,
            vec![
                ContentModule::Themes,
                ContentModule::Vocabulary,
                ContentModule::Tables,
                ContentModule::Code,
                ContentModule::ImagesList,
                ContentModule::ImagesDescriptions,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_delimited_math() -> Fallible<()> {
        let modules = detect(r"The energy \(E = mc^2\) is conserved.")?;
        assert!(modules.contains(&ContentModule::MathFormulas));
        Ok(())
    }

    #[test]
    fn test_code_in_fence_is_not_math() -> Fallible<()> {
        let modules = detect("```\nx = foo(bar)\n```\n")?;
        assert_eq!(modules, vec![ContentModule::Code]);
        Ok(())
    }

    #[test]
    fn test_nothing_applies() {
        assert_eq!(detect("ok"), Err(PipelineError::NoApplicableModule));
        assert_eq!(detect(""), Err(PipelineError::NoApplicableModule));
    }

    #[test]
    fn test_allow_list_narrows() -> Fallible<()> {
        let allow = [ContentModule::Vocabulary].into_iter().collect();
        let detector = Detector::new(Some(allow))?;
        let modules = detector.detect("# Title\n\nA lemma is a proven statement.")?;
        assert_eq!(modules, vec![ContentModule::Vocabulary]);
        assert_eq!(
            detector.detect("output = g(state)"),
            Err(PipelineError::NoApplicableModule)
        );
        Ok(())
    }

    #[test]
    fn test_detection_is_repeatable() -> Fallible<()> {
        let text = "Entropy is a measure of disorder.\n\n    let x = 1;\n    let y = 2;\n";
        assert_eq!(detect(text)?, detect(text)?);
        Ok(())
    }
}
