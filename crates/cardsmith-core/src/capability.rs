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

//! The boundary to the external text-generation service. The service is
//! treated as untrusted: every response is located, parsed and
//! shape-checked here before any stage looks at it.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use regex::Regex;
use serde_json::Value;

use crate::config::PipelineConfig;
use crate::error::Fallible;
use crate::registry::CardFormat;
use crate::registry::ContentModule;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Extract,
    Generate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub kind: RequestKind,
    pub module: ContentModule,
    pub format: Option<CardFormat>,
    /// A one-line role instruction.
    pub instruction: String,
    /// The context text: the document for extraction, the items as JSON for
    /// generation.
    pub input: String,
}

impl GenerationRequest {
    pub fn extract(module: ContentModule, document: &str) -> Self {
        let spec = module.spec();
        let instruction = format!(
            "Extract the {} ({}) from the document below. Reply with JSON of the form {{\"items\": [...]}} where each item has the fields: {}.",
            spec.name,
            spec.description.to_lowercase(),
            spec.item_shape.fields().join(", ")
        );
        GenerationRequest {
            kind: RequestKind::Extract,
            module,
            format: None,
            instruction,
            input: document.to_string(),
        }
    }

    pub fn generate(module: ContentModule, format: CardFormat, items: String) -> Self {
        let fields = match format {
            CardFormat::Basic => "front, back, tags, item, bloom",
            CardFormat::Cloze => "text (with {{c1::...}} markers), tags, item, bloom",
        };
        let instruction = format!(
            "Write atomic {format} flashcards, one fact per card, for the {} items below. Reply with JSON of the form {{\"cards\": [...]}} where each card has the fields: {fields}. Keep math delimiters verbatim.",
            module.name()
        );
        GenerationRequest {
            kind: RequestKind::Generate,
            module,
            format: Some(format),
            instruction,
            input: items,
        }
    }
}

/// The external text-generation capability.
pub trait TextGenerator: Send + Sync + 'static {
    /// Answer a request with raw text, which should contain a JSON payload.
    fn generate(&self, request: GenerationRequest) -> impl Future<Output = Fallible<String>> + Send;
}

/// Locate the JSON payload in a response: a ```json fence, then any fence,
/// then the span from the first `{` to the last `}`.
pub fn locate_json(response: &str) -> Option<&str> {
    if let Some(body) = fenced(response, "```json") {
        return Some(body);
    }
    if let Some(body) = fenced(response, "```") {
        return Some(body);
    }
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&response[start..=end])
}

fn fenced<'a>(response: &'a str, opener: &str) -> Option<&'a str> {
    let start = response.find(opener)? + opener.len();
    let rest = &response[start..];
    let end = rest.find("```")?;
    let body = rest[..end].trim();
    if body.starts_with('{') { Some(body) } else { None }
}

#[derive(Deserialize)]
struct ItemsPayload {
    items: Vec<Value>,
}

/// The raw items of an extraction response, not yet shaped per module.
pub fn parse_items(response: &str) -> Result<Vec<Value>, String> {
    let json = locate_json(response).ok_or_else(|| "no JSON object in response".to_string())?;
    let payload: ItemsPayload =
        serde_json::from_str(json).map_err(|e| format!("response does not match {{\"items\": [...]}}: {e}"))?;
    Ok(payload.items)
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawCardContent {
    Basic { front: String, back: String },
    Cloze { text: String },
}

/// A card as proposed by the capability, before acceptance checks.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RawCard {
    #[serde(flatten)]
    pub content: RawCardContent,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Index of the extracted item this card covers.
    #[serde(default)]
    pub item: Option<usize>,
    #[serde(default)]
    pub bloom: Option<String>,
}

#[derive(Deserialize)]
struct CardsPayload {
    cards: Vec<RawCard>,
}

pub fn parse_cards(response: &str) -> Result<Vec<RawCard>, String> {
    let json = locate_json(response).ok_or_else(|| "no JSON object in response".to_string())?;
    let payload: CardsPayload =
        serde_json::from_str(json).map_err(|e| format!("response does not match {{\"cards\": [...]}}: {e}"))?;
    Ok(payload.cards)
}

/// Retry and timeout policy for a single capability call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    /// Wait before retrying a rate-limited call whose error names no reset
    /// time.
    pub rate_limit_wait: Duration,
}

impl From<&PipelineConfig> for CallPolicy {
    fn from(config: &PipelineConfig) -> Self {
        CallPolicy {
            max_attempts: config.max_attempts,
            timeout: config.call_timeout(),
            rate_limit_wait: config.rate_limit_wait(),
        }
    }
}

/// Why the last attempt of a call failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallError {
    Timeout,
    Capability(String),
    /// The service refused the call for exceeding its usage limits.
    RateLimited(String),
    /// The response arrived but did not have the expected shape.
    Schema(String),
}

impl CallError {
    pub fn cause(&self) -> String {
        match self {
            CallError::Timeout => "timed out".to_string(),
            CallError::Capability(cause) => cause.clone(),
            CallError::RateLimited(cause) => cause.clone(),
            CallError::Schema(cause) => cause.clone(),
        }
    }
}

/// Phrases by which a service reports exhausted usage limits.
const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "token limit",
    "tokens limit",
    "quota",
    "too many requests",
    "429",
    "limit exceeded",
    "capacity",
];

/// Added to a reset time named by the service.
const RESET_MARGIN: Duration = Duration::from_secs(10);

/// How long to wait before retrying, if the error message reports a rate
/// limit. A reset time in the message (`resets in 1h 30m`) wins over the
/// default.
pub fn rate_limit_wait(message: &str, default: Duration) -> Option<Duration> {
    let message = message.to_lowercase();
    if !RATE_LIMIT_MARKERS.iter().any(|marker| message.contains(marker)) {
        return None;
    }
    Some(reset_after(&message).map_or(default, |reset| reset + RESET_MARGIN))
}

fn reset_after(message: &str) -> Option<Duration> {
    let rest = &message[message.find("reset")?..];
    let unit = Regex::new(r"(\d+)\s*(hours?|minutes?|mins?|seconds?|secs?|h|m|s)").ok()?;
    let mut secs: u64 = 0;
    let mut found = false;
    for captures in unit.captures_iter(rest) {
        let (Some(whole), Some(value), Some(name)) = (captures.get(0), captures.get(1), captures.get(2)) else {
            continue;
        };
        // `300ms` is not a number of minutes.
        if rest[whole.end()..].starts_with(|c: char| c.is_alphabetic()) {
            continue;
        }
        let Ok(value) = value.as_str().parse::<u64>() else {
            continue;
        };
        let scale = match name.as_str().as_bytes()[0] {
            b'h' => 3600,
            b'm' => 60,
            _ => 1,
        };
        secs = secs.saturating_add(value.saturating_mul(scale));
        found = true;
    }
    found.then(|| Duration::from_secs(secs))
}

/// Call the capability until `interpret` accepts a response or the attempts
/// run out. Each attempt is bounded by the policy's timeout; a timed-out
/// future is dropped, which cancels the call.
pub async fn call_with_retry<G, T>(
    generator: &G,
    request: &GenerationRequest,
    policy: CallPolicy,
    interpret: impl Fn(&str) -> Result<T, String>,
) -> Result<T, CallError>
where
    G: TextGenerator,
{
    let mut last = CallError::Capability("no attempt was made".to_string());
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        log::debug!(
            "Calling capability: kind={:?} module={} attempt={attempt}/{}",
            request.kind,
            request.module,
            policy.max_attempts
        );
        match tokio::time::timeout(policy.timeout, generator.generate(request.clone())).await {
            Err(_) => {
                log::warn!(
                    "Capability call for module {} timed out after {:?} (attempt {attempt})",
                    request.module,
                    policy.timeout
                );
                last = CallError::Timeout;
            }
            Ok(Err(err)) => match rate_limit_wait(err.message(), policy.rate_limit_wait) {
                Some(wait) => {
                    log::warn!(
                        "Capability call for module {} was rate limited (attempt {attempt}): {}",
                        request.module,
                        err.message()
                    );
                    last = CallError::RateLimited(err.message().to_string());
                    if attempt < attempts {
                        log::info!("Waiting {}s for the rate limit to reset.", wait.as_secs());
                        tokio::time::sleep(wait).await;
                    }
                }
                None => {
                    log::warn!(
                        "Capability call for module {} failed (attempt {attempt}): {}",
                        request.module,
                        err.message()
                    );
                    last = CallError::Capability(err.message().to_string());
                }
            },
            Ok(Ok(response)) => match interpret(&response) {
                Ok(value) => return Ok(value),
                Err(cause) => {
                    log::warn!(
                        "Capability response for module {} rejected (attempt {attempt}): {cause}",
                        request.module
                    );
                    last = CallError::Schema(cause);
                }
            },
        }
    }
    Err(last)
}

#[cfg(test)]
pub(crate) mod scripted {
    //! A deterministic stand-in for the capability, for tests.

    use std::collections::BTreeMap;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::error::ErrorReport;

    #[derive(Clone)]
    pub enum Reply {
        Text(String),
        Fail(String),
        /// Sleep, then answer.
        Slow(Duration, String),
        /// Wait until notified, then answer.
        Gate(Arc<Notify>, String),
    }

    type Key = (RequestKind, ContentModule, Option<CardFormat>);

    /// Replies are queued per (kind, module, format). The last reply of a
    /// queue is sticky.
    #[derive(Default)]
    pub struct ScriptedGenerator {
        replies: Mutex<BTreeMap<Key, VecDeque<Reply>>>,
        calls: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on_extract(self, module: ContentModule, replies: Vec<Reply>) -> Self {
            self.push((RequestKind::Extract, module, None), replies);
            self
        }

        pub fn on_generate(
            self,
            module: ContentModule,
            format: CardFormat,
            replies: Vec<Reply>,
        ) -> Self {
            self.push((RequestKind::Generate, module, Some(format)), replies);
            self
        }

        fn push(&self, key: Key, replies: Vec<Reply>) {
            let mut map = self.replies.lock().unwrap();
            map.entry(key).or_default().extend(replies);
        }

        pub fn calls(&self) -> Vec<GenerationRequest> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self, kind: RequestKind, module: ContentModule) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|call| call.kind == kind && call.module == module)
                .count()
        }

        fn next_reply(&self, key: &Key) -> Option<Reply> {
            let mut map = self.replies.lock().unwrap();
            let queue = map.get_mut(key)?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        }
    }

    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, request: GenerationRequest) -> Fallible<String> {
            let key = (request.kind, request.module, request.format);
            self.calls.lock().unwrap().push(request);
            match self.next_reply(&key) {
                Some(Reply::Text(text)) => Ok(text),
                Some(Reply::Fail(message)) => Err(ErrorReport::new(message)),
                Some(Reply::Slow(delay, text)) => {
                    tokio::time::sleep(delay).await;
                    Ok(text)
                }
                Some(Reply::Gate(gate, text)) => {
                    gate.notified().await;
                    Ok(text)
                }
                None => Err(ErrorReport::new(format!("no scripted reply for {key:?}"))),
            }
        }
    }

    pub fn text(s: impl Into<String>) -> Reply {
        Reply::Text(s.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_json_in_fence() {
        let response = "Here you go:\n```json\n{\"items\": []}\n```\nDone.";
        assert_eq!(locate_json(response), Some("{\"items\": []}"));
    }

    #[test]
    fn test_locate_json_in_bare_fence() {
        let response = "```\n{\"cards\": []}\n```";
        assert_eq!(locate_json(response), Some("{\"cards\": []}"));
    }

    #[test]
    fn test_locate_json_by_braces() {
        let response = "Sure! {\"items\": [{\"a\": 1}]} Hope this helps.";
        assert_eq!(locate_json(response), Some("{\"items\": [{\"a\": 1}]}"));
        assert_eq!(locate_json("no json here"), None);
    }

    #[test]
    fn test_parse_cards_both_shapes() {
        let response = r#"{"cards": [
            {"front": "Q", "back": "A", "tags": ["t"], "item": 0, "bloom": "recall"},
            {"text": "A {{c1::cloze}}"}
        ]}"#;
        let cards = parse_cards(response).unwrap();
        assert_eq!(cards.len(), 2);
        assert_eq!(
            cards[0].content,
            RawCardContent::Basic {
                front: "Q".to_string(),
                back: "A".to_string()
            }
        );
        assert_eq!(cards[0].item, Some(0));
        assert_eq!(
            cards[1].content,
            RawCardContent::Cloze {
                text: "A {{c1::cloze}}".to_string()
            }
        );
        assert!(cards[1].tags.is_empty());
    }

    #[test]
    fn test_parse_items_schema_mismatch() {
        let err = parse_items(r#"{"cards": []}"#).unwrap_err();
        assert!(err.contains("items"));
    }

    #[tokio::test]
    async fn test_call_with_retry_recovers() {
        use scripted::*;
        let generator = ScriptedGenerator::new().on_extract(
            ContentModule::Code,
            vec![Reply::Fail("boom".to_string()), text("not json"), text("{\"items\": []}")],
        );
        let request = GenerationRequest::extract(ContentModule::Code, "doc");
        let policy = CallPolicy {
            max_attempts: 3,
            timeout: Duration::from_secs(5),
            rate_limit_wait: Duration::from_secs(300),
        };
        let items = call_with_retry(&generator, &request, policy, parse_items).await;
        assert_eq!(items, Ok(Vec::new()));
        assert_eq!(generator.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_call_with_retry_reports_last_error() {
        use scripted::*;
        let generator = ScriptedGenerator::new().on_extract(
            ContentModule::Code,
            vec![
                Reply::Fail("boom".to_string()),
                Reply::Slow(Duration::from_secs(10), "{}".to_string()),
            ],
        );
        let request = GenerationRequest::extract(ContentModule::Code, "doc");
        let policy = CallPolicy {
            max_attempts: 2,
            timeout: Duration::from_millis(20),
            rate_limit_wait: Duration::from_secs(300),
        };
        let result = call_with_retry(&generator, &request, policy, parse_items).await;
        assert_eq!(result, Err(CallError::Timeout));
    }

    #[test]
    fn test_rate_limit_wait() {
        let default = Duration::from_secs(300);
        assert_eq!(
            rate_limit_wait("Rate limit reached; resets in 1h 30m", default),
            Some(Duration::from_secs(5410))
        );
        assert_eq!(
            rate_limit_wait("429 Too Many Requests (reset after 45s)", default),
            Some(Duration::from_secs(55))
        );
        assert_eq!(
            rate_limit_wait("Usage limit exceeded, resets in 2 minutes", default),
            Some(Duration::from_secs(130))
        );
        assert_eq!(rate_limit_wait("quota exceeded", default), Some(default));
        assert_eq!(rate_limit_wait("quota exceeded, reset in 300ms", default), Some(default));
        assert_eq!(rate_limit_wait("connection refused", default), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_for_reset() {
        use scripted::*;
        let generator = ScriptedGenerator::new().on_extract(
            ContentModule::Code,
            vec![
                Reply::Fail("429 Too Many Requests: usage resets in 2m".to_string()),
                text("{\"items\": []}"),
            ],
        );
        let request = GenerationRequest::extract(ContentModule::Code, "doc");
        let policy = CallPolicy {
            max_attempts: 2,
            timeout: Duration::from_secs(5),
            rate_limit_wait: Duration::from_secs(300),
        };
        let started = tokio::time::Instant::now();
        let items = call_with_retry(&generator, &request, policy, parse_items).await;
        assert_eq!(items, Ok(Vec::new()));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(130), "waited {waited:?}");
        assert!(waited < Duration::from_secs(135), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_on_last_attempt_does_not_wait() {
        use scripted::*;
        let generator = ScriptedGenerator::new()
            .on_extract(ContentModule::Code, vec![Reply::Fail("quota exceeded".to_string())]);
        let request = GenerationRequest::extract(ContentModule::Code, "doc");
        let policy = CallPolicy {
            max_attempts: 1,
            timeout: Duration::from_secs(5),
            rate_limit_wait: Duration::from_secs(300),
        };
        let started = tokio::time::Instant::now();
        let result = call_with_retry(&generator, &request, policy, parse_items).await;
        assert_eq!(result, Err(CallError::RateLimited("quota exceeded".to_string())));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_policy_from_config() {
        let config = PipelineConfig {
            max_attempts: 5,
            rate_limit_wait_secs: 60,
            ..PipelineConfig::default()
        };
        let policy = CallPolicy::from(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.timeout, Duration::from_secs(300));
        assert_eq!(policy.rate_limit_wait, Duration::from_secs(60));
    }

    #[test]
    fn test_requests_carry_registry_data() {
        let request = GenerationRequest::extract(ContentModule::Vocabulary, "text");
        assert_eq!(request.kind, RequestKind::Extract);
        assert!(request.instruction.contains("term, definition, context"));
        let request = GenerationRequest::generate(
            ContentModule::Code,
            CardFormat::Cloze,
            "[]".to_string(),
        );
        assert_eq!(request.format, Some(CardFormat::Cloze));
        assert!(request.instruction.contains("cloze"));
    }
}
