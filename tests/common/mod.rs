//! Shared wiring and stubs for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;

use autosherpa::conversation::{
    Classification, ConversationStateStore, InMemoryStateStore, IntentClassifier, IntentTag,
    KeywordClassifier, Orchestrator, StepRouter,
};
use autosherpa::error::{ClassificationError, ExtractionError, LlmError};
use autosherpa::flows::{
    Extraction, Extractor, FlowDefinition, FlowRegistry, FlowSettings, RuleExtractor, Vocabulary,
};
use autosherpa::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use autosherpa::conversation::{FlowData, Step};
use autosherpa::store::{InMemoryRecordStore, RecordStore};

pub const TIMEOUT: Duration = Duration::from_millis(200);

/// Everything a test needs to drive and inspect one engine.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub states: Arc<dyn ConversationStateStore>,
}

impl Harness {
    pub async fn say(&self, user: &str, text: &str) -> String {
        self.orchestrator.handle(user, text).await.text
    }
}

pub struct Builder {
    classifier: Arc<dyn IntentClassifier>,
    records: Arc<dyn RecordStore>,
    states: Arc<dyn ConversationStateStore>,
    extractor: Option<Arc<dyn Extractor>>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            classifier: Arc::new(KeywordClassifier),
            records: Arc::new(InMemoryRecordStore::with_demo_catalog()),
            states: Arc::new(InMemoryStateStore::new(Duration::from_secs(1800))),
            extractor: None,
        }
    }

    pub fn classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = records;
        self
    }

    pub fn states(mut self, states: Arc<dyn ConversationStateStore>) -> Self {
        self.states = states;
        self
    }

    /// Use one extractor for every flow instead of the rule extractors.
    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub async fn build(self) -> Harness {
        let vocab = Arc::new(Vocabulary::load(self.records.as_ref()).await);
        let shared = self.extractor;
        let flows = FlowRegistry::standard(
            &FlowSettings {
                interest_rate: dec!(9.5),
            },
            |def: &FlowDefinition| match &shared {
                Some(ex) => Arc::clone(ex),
                None => Arc::new(RuleExtractor::new(def, Arc::clone(&vocab))) as Arc<dyn Extractor>,
            },
        )
        .unwrap();
        let router = StepRouter::new(Arc::new(flows), self.records, vocab, TIMEOUT);
        let orchestrator =
            Orchestrator::new(Arc::clone(&self.states), self.classifier, router, TIMEOUT);
        Harness {
            orchestrator,
            states: self.states,
        }
    }
}

// ── Stubs ───────────────────────────────────────────────────────────────

/// Always returns the same intent.
pub struct FixedClassifier(pub IntentTag);

#[async_trait]
impl IntentClassifier for FixedClassifier {
    async fn classify(&self, _text: &str) -> Result<Classification, ClassificationError> {
        Ok(Classification {
            tag: self.0,
            confidence: 0.95,
            ..Classification::general()
        })
    }
}

/// Never answers within the collaborator timeout.
pub struct HangingExtractor;

#[async_trait]
impl Extractor for HangingExtractor {
    async fn analyze(
        &self,
        _step: Step,
        _text: &str,
        _data: &FlowData,
    ) -> Result<Extraction, ExtractionError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Extraction::default())
    }
}

/// Replays canned model replies in order, then fails.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    pub seen: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.seen.lock().unwrap().push(request);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(content) => Ok(CompletionResponse {
                content,
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
                response_id: None,
            }),
            None => Err(LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: "script exhausted".into(),
            }),
        }
    }
}
