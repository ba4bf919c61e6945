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

use std::ops::Range;

use pulldown_cmark::Event;
use pulldown_cmark::Options;
use pulldown_cmark::Parser;
use pulldown_cmark::Tag;
use pulldown_cmark::TagEnd;

/// Escape the characters that are significant in HTML text.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Find inline code spans and code blocks and render each as HTML. Spans
/// overlapping a `protected` range are left alone. Returned in source order.
pub fn code_to_html(text: &str, protected: &[Range<usize>]) -> Vec<(Range<usize>, String)> {
    let mut replacements = Vec::new();
    let mut block: Option<(Range<usize>, String)> = None;
    for (event, range) in Parser::new_ext(text, Options::empty()).into_offset_iter() {
        match event {
            Event::Code(code) => {
                replacements.push((range, format!("<code>{}</code>", escape_html(&code))));
            }
            Event::Start(Tag::CodeBlock(_)) => block = Some((range, String::new())),
            Event::Text(content) => {
                if let Some((_, buffer)) = &mut block {
                    buffer.push_str(&content);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((range, buffer)) = block.take() {
                    let body = escape_html(buffer.trim_end_matches('\n')).replace('\n', "<br>");
                    replacements.push((range, format!("<pre><code>{body}</code></pre>")));
                }
            }
            _ => {}
        }
    }
    replacements.retain(|(range, _)| {
        !protected
            .iter()
            .any(|p| p.start < range.end && range.start < p.end)
    });
    replacements.sort_by_key(|(range, _)| range.start);
    replacements
}
