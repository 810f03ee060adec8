//! `Orchestrator`: the single entry point for inbound messages.
//!
//! Decides whether a message continues the active flow, leaves it, switches
//! to another flow or needs intent classification, then persists the result
//! with one store write. Never returns an error to the channel layer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::channels::OutboundMessage;
use crate::conversation::classifier::{Classification, IntentClassifier, route_intent};
use crate::conversation::locks::UserLocks;
use crate::conversation::phrases;
use crate::conversation::router::{Entry, OutcomeKind, StepOutcome, StepRouter};
use crate::conversation::state::{ConversationState, FlowName};
use crate::conversation::store::ConversationStateStore;
use crate::error::{ClassificationError, Error, RoutingError};

pub struct Orchestrator {
    states: Arc<dyn ConversationStateStore>,
    classifier: Arc<dyn IntentClassifier>,
    router: StepRouter,
    locks: UserLocks,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        states: Arc<dyn ConversationStateStore>,
        classifier: Arc<dyn IntentClassifier>,
        router: StepRouter,
        timeout: Duration,
    ) -> Self {
        Self {
            states,
            classifier,
            router,
            locks: UserLocks::new(),
            timeout,
        }
    }

    /// Handle one inbound message and produce exactly one reply.
    pub async fn handle(&self, user_id: &str, text: &str) -> OutboundMessage {
        let _guard = self.locks.lock(user_id).await;
        let reply = match self.process(user_id, text).await {
            Ok(reply) => reply,
            Err(Error::Routing(e)) => {
                error!(user_id = %user_id, "Flow aborted: {}", e);
                if let Err(e) = self.states.clear(user_id).await {
                    error!(user_id = %user_id, "Failed to clear aborted state: {}", e);
                }
                phrases::flow_aborted().to_string()
            }
            Err(e) => {
                error!(user_id = %user_id, "Message handling failed: {}", e);
                phrases::fallback().to_string()
            }
        };
        OutboundMessage::new(user_id, reply)
    }

    async fn process(&self, user_id: &str, text: &str) -> Result<String, Error> {
        let (state, finished) = match self.states.get(user_id).await? {
            Some(state) if state.step.is_terminal() => (None, true),
            other => (other, false),
        };

        let Some(state) = state else {
            return self.start(user_id, text, finished).await;
        };

        if phrases::is_exit(text) {
            info!(user_id = %user_id, flow = %state.flow, "User left the flow");
            self.states.clear(user_id).await?;
            return Ok(phrases::main_menu().to_string());
        }

        if let Some(requested) = phrases::requested_flow(text)
            && requested != state.flow
            && !self.absorbs(&state, requested)
        {
            let target = self.classify(text).await.tag.flow().unwrap_or(requested);
            if target != state.flow {
                info!(user_id = %user_id, from = %state.flow, to = %target, "Switching flow");
                return self.enter(user_id, target, text).await;
            }
            debug!(user_id = %user_id, "Classifier kept the current flow");
        }

        let outcome = self.router.route(&state, text, Entry::Continue).await?;
        self.apply(state, outcome).await
    }

    /// No active flow: classify and either seed a flow or answer directly.
    async fn start(&self, user_id: &str, text: &str, finished: bool) -> Result<String, Error> {
        let classification = self.classify(text).await;
        debug!(
            user_id = %user_id,
            tag = %classification.tag,
            confidence = classification.confidence,
            "Classified"
        );
        match route_intent(&classification) {
            Some(flow) => self.enter(user_id, flow, text).await,
            None => {
                if finished {
                    self.states.clear(user_id).await?;
                }
                let reply = if phrases::is_car_related(text) {
                    phrases::main_menu()
                } else {
                    phrases::out_of_scope()
                };
                Ok(reply.to_string())
            }
        }
    }

    /// Start `flow` fresh and let the same message seed it.
    async fn enter(&self, user_id: &str, flow: FlowName, text: &str) -> Result<String, Error> {
        let entry = self
            .router
            .flows()
            .get(flow)
            .ok_or(RoutingError::UnknownFlow(flow))?
            .definition
            .entry;
        let state = ConversationState::new(user_id, flow, entry);
        info!(user_id = %user_id, flow = %flow, session_id = %state.session_id, "Flow started");
        let outcome = self.router.route(&state, text, Entry::Seeded).await?;
        self.apply(state, outcome).await
    }

    /// Persist an outcome and return its reply.
    async fn apply(&self, state: ConversationState, outcome: StepOutcome) -> Result<String, Error> {
        match outcome.kind {
            OutcomeKind::Exited => {
                info!(user_id = %state.user_id, flow = %state.flow, "Flow ended");
                self.states.clear(&state.user_id).await?;
                Ok(outcome.reply)
            }
            OutcomeKind::Handoff { flow, data } => {
                let entry = self
                    .router
                    .flows()
                    .get(flow)
                    .ok_or(RoutingError::UnknownFlow(flow))?
                    .definition
                    .entry;
                let next = ConversationState::new(&state.user_id, flow, entry).with_data(data);
                let outcome = self.router.route(&next, "", Entry::Continue).await?;
                if matches!(outcome.kind, OutcomeKind::Handoff { .. }) {
                    return Err(RoutingError::InvalidHandoff {
                        from: state.flow,
                        to: flow,
                    }
                    .into());
                }
                self.write(next, outcome).await
            }
            _ => self.write(state, outcome).await,
        }
    }

    async fn write(&self, mut state: ConversationState, outcome: StepOutcome) -> Result<String, Error> {
        if outcome.kind == OutcomeKind::Completed {
            info!(user_id = %state.user_id, flow = %state.flow, "Flow completed");
        }
        state.step = outcome.step;
        state.sub_state = outcome.sub_state;
        state.data = outcome.data;
        state.touch();
        let user_id = state.user_id.clone();
        self.states.set(&user_id, state).await?;
        Ok(outcome.reply)
    }

    fn absorbs(&self, state: &ConversationState, requested: FlowName) -> bool {
        self.router
            .flows()
            .get(state.flow)
            .and_then(|b| b.definition.step(state.step))
            .is_some_and(|s| s.absorbs.contains(&requested))
    }

    /// Classifier call with the bounded wait. Failures fall back to general.
    async fn classify(&self, text: &str) -> Classification {
        let result = match tokio::time::timeout(self.timeout, self.classifier.classify(text)).await {
            Ok(result) => result,
            Err(_) => Err(ClassificationError::Timeout(self.timeout)),
        };
        result.unwrap_or_else(|e| {
            warn!("Intent classification failed, treating as general: {}", e);
            Classification::general()
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::conversation::classifier::KeywordClassifier;
    use crate::conversation::state::{Step, SubState};
    use crate::conversation::store::InMemoryStateStore;
    use crate::flows::{Extractor, FlowRegistry, FlowSettings, RuleExtractor, Vocabulary};
    use crate::store::InMemoryRecordStore;

    fn orchestrator(classifier: Arc<dyn IntentClassifier>) -> (Arc<InMemoryStateStore>, Orchestrator) {
        let vocab = Arc::new(Vocabulary::default());
        let flows = FlowRegistry::standard(
            &FlowSettings {
                interest_rate: dec!(9.5),
            },
            |def| Arc::new(RuleExtractor::new(def, Arc::clone(&vocab))) as Arc<dyn Extractor>,
        )
        .unwrap();
        let timeout = Duration::from_secs(2);
        let router = StepRouter::new(
            Arc::new(flows),
            Arc::new(InMemoryRecordStore::with_demo_catalog()),
            vocab,
            timeout,
        );
        let states = Arc::new(InMemoryStateStore::new(Duration::from_secs(1800)));
        let orch = Orchestrator::new(states.clone(), classifier, router, timeout);
        (states, orch)
    }

    struct Broken;

    #[async_trait]
    impl IntentClassifier for Broken {
        async fn classify(&self, _text: &str) -> Result<Classification, ClassificationError> {
            Err(ClassificationError::Unparseable("nonsense".into()))
        }
    }

    #[tokio::test]
    async fn first_message_seeds_browse() {
        let (states, orch) = orchestrator(Arc::new(KeywordClassifier::new()));
        let out = orch.handle("u1", "I want to buy a car").await;
        assert!(out.text.contains("Brand"), "{}", out.text);
        let state = states.get("u1").await.unwrap().unwrap();
        assert_eq!(state.flow, FlowName::Browse);
        assert_eq!(state.step, Step::CollectingCriteria);
        assert_eq!(state.sub_state, SubState::None);
    }

    #[tokio::test]
    async fn general_intent_creates_no_state() {
        let (states, orch) = orchestrator(Arc::new(KeywordClassifier::new()));
        let out = orch.handle("u1", "hello").await;
        assert_eq!(out.text, phrases::main_menu());
        let out = orch.handle("u1", "what's the weather in Pune?").await;
        assert_eq!(out.text, phrases::out_of_scope());
        assert!(states.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn classifier_failure_is_general() {
        let (states, orch) = orchestrator(Arc::new(Broken));
        let out = orch.handle("u1", "I want to buy a car").await;
        assert_eq!(out.text, phrases::main_menu());
        assert!(states.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn exit_clears_state() {
        let (states, orch) = orchestrator(Arc::new(KeywordClassifier::new()));
        orch.handle("u1", "I want to buy a car").await;
        let out = orch.handle("u1", "exit").await;
        assert_eq!(out.text, phrases::main_menu());
        assert!(states.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn switch_drops_old_data() {
        let (states, orch) = orchestrator(Arc::new(KeywordClassifier::new()));
        orch.handle("u1", "I want to buy a car").await;
        orch.handle("u1", "Hyundai").await;
        assert!(states.get("u1").await.unwrap().unwrap().data.contains("brand"));

        orch.handle("u1", "actually I need to book a service").await;
        let state = states.get("u1").await.unwrap().unwrap();
        assert_eq!(state.flow, FlowName::Service);
        assert!(!state.data.contains("brand"));
    }

    #[tokio::test]
    async fn routing_error_resets_state() {
        let (states, orch) = orchestrator(Arc::new(KeywordClassifier::new()));
        let mut bad = ConversationState::new("u1", FlowName::Browse, Step::DownPayment);
        bad.sub_state = SubState::None;
        states.set("u1", bad).await.unwrap();
        let out = orch.handle("u1", "hello").await;
        assert_eq!(out.text, phrases::flow_aborted());
        assert!(states.get("u1").await.unwrap().is_none());
    }
}
