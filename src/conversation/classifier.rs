//! Intent classification for messages that arrive with no active flow.
//!
//! Two implementations:
//! 1. `LlmIntentClassifier`: structured JSON from the model
//! 2. `KeywordClassifier`: deterministic keyword families, no LLM
//!
//! Routing never gates on confidence; [`route_intent`] maps tags to flows by
//! fixed priority.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::conversation::state::FlowName;
use crate::error::ClassificationError;
use crate::flows::parse::{has_any, normalize};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};

/// Max tokens for the classification call.
const CLASSIFY_MAX_TOKENS: u32 = 256;

const CLASSIFY_TEMPERATURE: f32 = 0.0;

/// Coarse intent of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentTag {
    Browse,
    Valuation,
    Financing,
    Service,
    General,
}

impl IntentTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browse => "browse",
            Self::Valuation => "valuation",
            Self::Financing => "financing",
            Self::Service => "service",
            Self::General => "general",
        }
    }

    /// The flow this tag selects, if any.
    pub fn flow(&self) -> Option<FlowName> {
        match self {
            Self::Browse => Some(FlowName::Browse),
            Self::Valuation => Some(FlowName::Valuation),
            Self::Financing => Some(FlowName::Financing),
            Self::Service => Some(FlowName::Service),
            Self::General => None,
        }
    }

    fn parse(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "browse" | "browse_cars" | "buy" => Self::Browse,
            "valuation" | "car_valuation" | "sell" => Self::Valuation,
            "financing" | "emi" | "loan" => Self::Financing,
            "service" | "service_booking" => Self::Service,
            _ => Self::General,
        }
    }
}

impl std::fmt::Display for IntentTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub tag: IntentTag,
    /// Tie-break hint only, in 0..=1.
    pub confidence: f32,
    pub entities: BTreeMap<String, String>,
    /// Other tags the text also matched.
    pub candidates: Vec<IntentTag>,
}

impl Classification {
    pub fn general() -> Self {
        Self {
            tag: IntentTag::General,
            confidence: 0.0,
            entities: BTreeMap::new(),
            candidates: Vec::new(),
        }
    }
}

/// Consumed capability: classify free text into a coarse intent.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, ClassificationError>;
}

/// Flow selected by a classification. Explicit flow intents win over
/// general, in the order service, financing, valuation, browse.
pub fn route_intent(classification: &Classification) -> Option<FlowName> {
    const PRIORITY: [IntentTag; 4] = [
        IntentTag::Service,
        IntentTag::Financing,
        IntentTag::Valuation,
        IntentTag::Browse,
    ];
    let mut tags = vec![classification.tag];
    tags.extend(classification.candidates.iter().copied());
    if classification.tag != IntentTag::General {
        return classification.tag.flow();
    }
    PRIORITY
        .into_iter()
        .find(|p| tags.contains(p))
        .and_then(|t| t.flow())
}

// ── LLM classifier ──────────────────────────────────────────────────

pub struct LlmIntentClassifier {
    llm: Arc<dyn LlmProvider>,
}

impl LlmIntentClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

fn build_classify_system_prompt() -> String {
    "You classify messages sent to a used-car dealership assistant on WhatsApp.\n\n\
     Intents:\n\
     - \"browse\": wants to buy, search or look at cars, or book a test drive\n\
     - \"valuation\": wants to know what their own car is worth or to sell it\n\
     - \"financing\": asks about EMI, loans, down payment or monthly payments\n\
     - \"service\": wants to book a service, repair or maintenance\n\
     - \"general\": greetings, questions and anything else\n\n\
     Respond with ONLY a JSON object:\n\
     {\"intent\": \"...\", \"confidence\": 0.0, \"entities\": {\"brand\": \"...\", \"budget\": \"...\"}}\n\n\
     Rules:\n\
     - Pick exactly one intent\n\
     - Entities are optional plain strings; omit what is not mentioned"
        .to_string()
}

#[derive(Debug, serde::Deserialize)]
struct ClassifyResponse {
    intent: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    entities: BTreeMap<String, serde_json::Value>,
}

/// Parse the model's classification JSON.
fn parse_classification(raw: &str) -> Result<Classification, ClassificationError> {
    let json_str = extract_json_object(raw);
    let response: ClassifyResponse = serde_json::from_str(&json_str)
        .map_err(|e| ClassificationError::Unparseable(format!("JSON parse error: {e}")))?;

    let entities = response
        .entities
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some((k, s)),
            serde_json::Value::Number(n) => Some((k, n.to_string())),
            _ => None,
        })
        .collect();

    Ok(Classification {
        tag: IntentTag::parse(&response.intent),
        confidence: response.confidence.clamp(0.0, 1.0),
        entities,
        candidates: Vec::new(),
    })
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassificationError> {
        let preview: String = text.chars().take(1000).collect();
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_classify_system_prompt()),
            ChatMessage::user(preview),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        parse_classification(&response.content).inspect_err(|e| {
            warn!(raw_response = %response.content, error = %e, "Failed to parse classification");
        })
    }
}

// ── Keyword classifier ──────────────────────────────────────────────

const SERVICE_KEYWORDS: &[&str] = &[
    "book service", "service booking", "book a service", "service", "servicing", "repair",
    "maintenance", "book",
];
const FINANCING_KEYWORDS: &[&str] = &[
    "emi", "loan", "installment", "finance", "down payment", "monthly payment", "monthly emi",
    "calculate emi",
];
const VALUATION_KEYWORDS: &[&str] = &[
    "value", "valuation", "price", "worth", "resale", "sell", "how much", "estimate", "appraise",
];
const BROWSE_KEYWORDS: &[&str] = &[
    "browse", "buy", "purchase", "looking for", "want to buy", "search", "find car", "used cars",
];

/// Deterministic classifier over the dealership keyword families.
#[derive(Debug, Default, Clone)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    fn matches(text: &str) -> Vec<IntentTag> {
        let norm = normalize(text);
        [
            (IntentTag::Service, SERVICE_KEYWORDS),
            (IntentTag::Financing, FINANCING_KEYWORDS),
            (IntentTag::Valuation, VALUATION_KEYWORDS),
            (IntentTag::Browse, BROWSE_KEYWORDS),
        ]
        .into_iter()
        .filter(|(_, words)| has_any(&norm, words))
        .map(|(tag, _)| tag)
        .collect()
    }
}

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassificationError> {
        let matched = Self::matches(text);
        debug!(matched = ?matched, "Keyword classification");
        let Some((&tag, rest)) = matched.split_first() else {
            return Ok(Classification::general());
        };
        Ok(Classification {
            tag,
            confidence: if rest.is_empty() { 0.9 } else { 0.6 },
            entities: BTreeMap::new(),
            candidates: rest.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, FinishReason};

    #[test]
    fn parse_clean_json() {
        let c = parse_classification(r#"{"intent": "browse", "confidence": 0.82, "entities": {"brand": "Tata"}}"#)
            .unwrap();
        assert_eq!(c.tag, IntentTag::Browse);
        assert!((c.confidence - 0.82).abs() < f32::EPSILON);
        assert_eq!(c.entities.get("brand").map(String::as_str), Some("Tata"));
    }

    #[test]
    fn parse_wrapped_and_clamped() {
        let c = parse_classification("Sure!\n```json\n{\"intent\": \"EMI\", \"confidence\": 3}\n```").unwrap();
        assert_eq!(c.tag, IntentTag::Financing);
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn unknown_intent_is_general() {
        let c = parse_classification(r#"{"intent": "weather"}"#).unwrap();
        assert_eq!(c.tag, IntentTag::General);
        assert_eq!(route_intent(&c), None);
    }

    #[test]
    fn garbage_is_unparseable() {
        assert!(matches!(
            parse_classification("no idea"),
            Err(ClassificationError::Unparseable(_))
        ));
    }

    #[tokio::test]
    async fn keywords_follow_priority() {
        let k = KeywordClassifier::new();
        let c = k.classify("I want to buy a car, what would the EMI be?").await.unwrap();
        assert_eq!(c.tag, IntentTag::Financing);
        assert!(c.candidates.contains(&IntentTag::Browse));

        assert_eq!(k.classify("please book a service").await.unwrap().tag, IntentTag::Service);
        assert_eq!(k.classify("what's my car worth").await.unwrap().tag, IntentTag::Valuation);
        assert_eq!(k.classify("I want to buy a car").await.unwrap().tag, IntentTag::Browse);
        assert_eq!(k.classify("hello there").await.unwrap().tag, IntentTag::General);
    }

    #[test]
    fn route_prefers_explicit_flow() {
        let mut c = Classification::general();
        assert_eq!(route_intent(&c), None);
        c.candidates = vec![IntentTag::Browse, IntentTag::Service];
        assert_eq!(route_intent(&c), Some(FlowName::Service));
        c.tag = IntentTag::Valuation;
        assert_eq!(route_intent(&c), Some(FlowName::Valuation));
    }

    struct FailingLlm(Mutex<usize>);

    #[async_trait]
    impl LlmProvider for FailingLlm {
        fn model_name(&self) -> &str {
            "failing"
        }
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            *self.0.lock().unwrap() += 1;
            Err(LlmError::RequestFailed {
                provider: "failing".into(),
                reason: "offline".into(),
            })
        }
    }

    #[tokio::test]
    async fn llm_failure_is_unavailable() {
        let llm = Arc::new(FailingLlm(Mutex::new(0)));
        let classifier = LlmIntentClassifier::new(llm.clone());
        let err = classifier.classify("hi").await.unwrap_err();
        assert!(matches!(err, ClassificationError::Unavailable(_)));
        assert_eq!(*llm.0.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn llm_reply_is_parsed() {
        struct Canned;
        #[async_trait]
        impl LlmProvider for Canned {
            fn model_name(&self) -> &str {
                "canned"
            }
            async fn complete(&self, _r: CompletionRequest) -> Result<CompletionResponse, LlmError> {
                Ok(CompletionResponse {
                    content: r#"{"intent": "service", "confidence": 0.9}"#.into(),
                    input_tokens: 0,
                    output_tokens: 0,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                })
            }
        }
        let c = LlmIntentClassifier::new(Arc::new(Canned)).classify("car needs a repair").await.unwrap();
        assert_eq!(c.tag, IntentTag::Service);
    }
}
