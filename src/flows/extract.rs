//! `Extractor`: pulls structured fields for a flow out of free text.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::conversation::state::{FlowData, FlowName, Step};
use crate::error::ExtractionError;
use crate::flows::fields::FieldSpec;
use crate::flows::{FallbackParser, FlowDefinition, Vocabulary};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};

/// Unvalidated field values keyed by field name.
pub type RawFields = Map<String, Value>;

/// What an extractor found in one message. Consumed once by the router.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub fields: RawFields,
    /// The collaborator's raw output, for logs.
    pub raw: String,
}

/// Per-flow field extraction.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn analyze(
        &self,
        step: Step,
        text: &str,
        data: &FlowData,
    ) -> Result<Extraction, ExtractionError>;
}

/// Extractor backed by the flow's deterministic parser.
pub struct RuleExtractor {
    parser: FallbackParser,
    vocabulary: Arc<Vocabulary>,
}

impl RuleExtractor {
    pub fn new(definition: &FlowDefinition, vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            parser: definition.fallback,
            vocabulary,
        }
    }
}

#[async_trait]
impl Extractor for RuleExtractor {
    async fn analyze(
        &self,
        step: Step,
        text: &str,
        data: &FlowData,
    ) -> Result<Extraction, ExtractionError> {
        let fields = (self.parser)(step, text, data, &self.vocabulary);
        Ok(Extraction {
            raw: Value::Object(fields.clone()).to_string(),
            fields,
        })
    }
}

/// Extractor that asks an LLM for a JSON object of fields.
pub struct LlmExtractor {
    llm: Arc<dyn LlmProvider>,
    flow: FlowName,
    summary: &'static str,
    fields: &'static [FieldSpec],
    step_fields: Vec<(Step, Vec<&'static str>)>,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, definition: &FlowDefinition) -> Self {
        Self {
            llm,
            flow: definition.flow,
            summary: definition.summary,
            fields: definition.fields,
            step_fields: definition
                .steps
                .iter()
                .map(|s| (s.step, s.fields().collect()))
                .collect(),
        }
    }

    fn system_prompt(&self, step: Step, data: &FlowData) -> String {
        let field_lines: Vec<String> = self
            .fields
            .iter()
            .filter(|f| f.is_extractable())
            .map(|f| format!("- {}: {}", f.name, f.description))
            .collect();
        let current: Vec<&str> = self
            .step_fields
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, f)| f.clone())
            .unwrap_or_default();
        let collected = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());

        format!(
            "You extract structured details for a used-car dealership assistant.\n\
             Flow: {flow} ({summary})\n\
             Current step: {step}, which is asking for: {current}\n\n\
             Fields you may return:\n{fields}\n\n\
             Already collected: {collected}\n\n\
             Rules:\n\
             - Return only fields the user states in this message.\n\
             - If the user gives the same field twice, keep the most specific or latest value.\n\
             - Amounts are in rupees as plain numbers (1 lakh = 100000).\n\
             - Menu answers use the option name listed in the field description.\n\n\
             Respond with JSON only: {{\"fields\": {{\"<name>\": <value>}}}}",
            flow = self.flow,
            summary = self.summary,
            step = step,
            current = current.join(", "),
            fields = field_lines.join("\n"),
            collected = collected,
        )
    }
}

/// Parse `{"fields": {...}}` (or a bare field object) from a model reply.
pub(crate) fn parse_fields(flow: FlowName, content: &str) -> Result<RawFields, ExtractionError> {
    let json = extract_json_object(content);
    let value: Value =
        serde_json::from_str(&json).map_err(|e| ExtractionError::Unparseable {
            flow,
            reason: e.to_string(),
        })?;
    let object = match value {
        Value::Object(mut obj) => match obj.remove("fields") {
            Some(Value::Object(fields)) => fields,
            Some(Value::Null) => Map::new(),
            Some(_) => {
                return Err(ExtractionError::Unparseable {
                    flow,
                    reason: "\"fields\" is not an object".to_string(),
                });
            }
            None => obj,
        },
        _ => {
            return Err(ExtractionError::Unparseable {
                flow,
                reason: "expected a JSON object".to_string(),
            });
        }
    };
    Ok(object.into_iter().filter(|(_, v)| !v.is_null()).collect())
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn analyze(
        &self,
        step: Step,
        text: &str,
        data: &FlowData,
    ) -> Result<Extraction, ExtractionError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.system_prompt(step, data)),
            ChatMessage::user(text),
        ])
        .with_max_tokens(400)
        .with_temperature(0.0);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|source| ExtractionError::Unavailable {
                flow: self.flow,
                source,
            })?;

        let fields = parse_fields(self.flow, &response.content)?;
        debug!(flow = %self.flow, step = %step, fields = fields.len(), "Extraction parsed");
        Ok(Extraction {
            fields,
            raw: response.content,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rust_decimal::Decimal;
    use serde_json::json;

    use super::*;
    use crate::error::LlmError;
    use crate::flows::browse;
    use crate::llm::{CompletionResponse, FinishReason};

    struct CannedLlm {
        reply: Result<String, ()>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmProvider for CannedLlm {
        fn model_name(&self) -> &str {
            "canned"
        }
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.seen.lock().unwrap().push(request.messages[0].content.clone());
            match &self.reply {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 0,
                    output_tokens: 0,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "canned".into(),
                    reason: "down".into(),
                }),
            }
        }
    }

    fn extractor(reply: Result<String, ()>) -> (Arc<CannedLlm>, LlmExtractor) {
        let llm = Arc::new(CannedLlm {
            reply,
            seen: Mutex::new(Vec::new()),
        });
        let ex = LlmExtractor::new(llm.clone(), &browse::definition());
        (llm, ex)
    }

    #[test]
    fn parse_fields_accepts_wrapped_and_bare() {
        let wrapped = parse_fields(FlowName::Browse, r#"{"fields": {"brand": "Tata", "budget": null}}"#).unwrap();
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped["brand"], json!("Tata"));

        let bare = parse_fields(FlowName::Browse, "```json\n{\"car_type\": \"SUV\"}\n```").unwrap();
        assert_eq!(bare["car_type"], json!("SUV"));
    }

    #[test]
    fn parse_fields_rejects_garbage() {
        assert!(matches!(
            parse_fields(FlowName::Browse, "I think they want a Tata"),
            Err(ExtractionError::Unparseable { .. })
        ));
        assert!(parse_fields(FlowName::Browse, r#"{"fields": [1, 2]}"#).is_err());
    }

    #[tokio::test]
    async fn llm_extractor_returns_fields() {
        let (llm, ex) = extractor(Ok(r#"{"fields": {"brand": "Hyundai", "budget": 1000000}}"#.into()));
        let out = ex.analyze(Step::CollectingCriteria, "Hyundai under 10 lakh", &FlowData::new()).await.unwrap();
        assert_eq!(out.fields["brand"], json!("Hyundai"));
        assert_eq!(out.fields["budget"], json!(1000000));
        let prompt = llm.seen.lock().unwrap()[0].clone();
        assert!(prompt.contains("collecting_criteria"));
        assert!(prompt.contains("budget"));
    }

    #[tokio::test]
    async fn llm_failure_is_typed() {
        let (_, ex) = extractor(Err(()));
        let err = ex.analyze(Step::CollectingCriteria, "hi", &FlowData::new()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Unavailable { flow: FlowName::Browse, .. }));
    }

    #[tokio::test]
    async fn rule_extractor_uses_fallback_parser() {
        let ex = RuleExtractor::new(&browse::definition(), Arc::new(Vocabulary::default()));
        let out = ex
            .analyze(Step::CollectingCriteria, "Hyundai, under 10 lakh, SUV", &FlowData::new())
            .await
            .unwrap();
        assert_eq!(out.fields["brand"], json!("Hyundai"));
        assert_eq!(out.fields["car_type"], json!("SUV"));
        let budget: Decimal = out.fields["budget"].as_str().unwrap().parse().unwrap();
        assert_eq!(budget, Decimal::from(1_000_000));
    }
}
