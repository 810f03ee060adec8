//! Flow definitions: the declared step graph of each transactional flow and
//! the collaborators that fill it in.
//!
//! Each flow module provides a [`FlowDefinition`] (steps, fields, transitions
//! and a deterministic fallback parser), a [`ResponseComposer`] and
//! [`StepActions`]. The [`FlowRegistry`] checks every definition when it is
//! registered so a bad table fails at start-up instead of mid-conversation.

pub mod browse;
pub mod compose;
pub mod extract;
pub mod fields;
pub mod financing;
pub mod parse;
pub mod service;
pub mod valuation;

pub use compose::{Reply, ResponseComposer, format_lakh, format_rupees};
pub use extract::{Extraction, Extractor, LlmExtractor, RawFields, RuleExtractor};
pub use fields::{FieldIssue, FieldKind, FieldSpec};

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::warn;

use crate::conversation::state::{ConversationState, FlowData, FlowName, Step};
use crate::error::DefinitionError;
use crate::store::{CommitRequest, RecordStore};

/// What a step does once its required fields are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Gathers user details.
    Collect,
    /// Offers numbered options.
    Menu,
    /// Shows a result; has no required fields.
    Display,
    /// Shows a summary and waits for yes/no before committing.
    Confirm,
}

/// Where a transition leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Step(Step),
    /// Continue in another flow, carrying selected fields.
    Handoff(FlowName),
    /// Drop collected data and go back to the entry step.
    Restart,
    /// End the flow without completing it.
    Exit,
    /// End the flow successfully.
    Complete,
    /// Stay on the step and show its outcome reply.
    Stay,
}

/// Condition on collected data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    Equals(&'static str, &'static str),
    Flag(&'static str, bool),
    /// The first amount is at least the second.
    Covers(&'static str, &'static str),
}

impl Guard {
    pub fn holds(&self, data: &FlowData) -> bool {
        match self {
            Self::Always => true,
            Self::Equals(field, value) => data.text(field) == Some(*value),
            Self::Flag(field, value) => data.flag(field) == Some(*value),
            Self::Covers(a, b) => match (data.amount(a), data.amount(b)) {
                (Some(a), Some(b)) => a >= b,
                _ => false,
            },
        }
    }
}

/// A labelled edge of the step graph. The first matching edge wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub guard: Guard,
    pub target: Target,
    /// Fires even when the step's required fields are incomplete.
    pub escape: bool,
}

impl Transition {
    pub fn to(target: Target) -> Self {
        Self {
            guard: Guard::Always,
            target,
            escape: false,
        }
    }

    pub fn when(guard: Guard, target: Target) -> Self {
        Self {
            guard,
            target,
            escape: false,
        }
    }

    pub fn escape(guard: Guard, target: Target) -> Self {
        Self {
            guard,
            target,
            escape: true,
        }
    }
}

/// Cross-field validation run once a step's required fields are present.
pub type StepCheck = fn(&FlowData) -> Result<(), FieldIssue>;

/// One row of a flow's step table.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub step: Step,
    pub kind: StepKind,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
    pub transitions: Vec<Transition>,
    pub check: Option<StepCheck>,
    /// Flow switches this step handles itself instead of aborting the flow.
    pub absorbs: &'static [FlowName],
}

impl StepSpec {
    pub fn new(step: Step, kind: StepKind, required: &'static [&'static str]) -> Self {
        Self {
            step,
            kind,
            required,
            optional: &[],
            transitions: Vec::new(),
            check: None,
            absorbs: &[],
        }
    }

    pub fn optional(mut self, fields: &'static [&'static str]) -> Self {
        self.optional = fields;
        self
    }

    pub fn then(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn check(mut self, check: StepCheck) -> Self {
        self.check = Some(check);
        self
    }

    pub fn absorbs(mut self, flows: &'static [FlowName]) -> Self {
        self.absorbs = flows;
        self
    }

    /// Every field this step may take from a message.
    pub fn fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.required.iter().chain(self.optional.iter()).copied()
    }

    /// Why the step cannot advance yet; empty when complete.
    pub fn issues(&self, data: &FlowData) -> Vec<FieldIssue> {
        let missing: Vec<FieldIssue> = self
            .required
            .iter()
            .copied()
            .filter(|f| !data.contains(f))
            .map(|field| FieldIssue::Missing { field })
            .collect();
        if !missing.is_empty() {
            return missing;
        }
        match self.check.map(|check| check(data)) {
            Some(Err(issue)) => vec![issue],
            _ => Vec::new(),
        }
    }
}

/// Deterministic parse used when extraction fails or no model is configured.
pub type FallbackParser = fn(Step, &str, &FlowData, &Vocabulary) -> RawFields;

/// Static declaration of one flow.
#[derive(Debug, Clone)]
pub struct FlowDefinition {
    pub flow: FlowName,
    pub entry: Step,
    /// One-line description given to the extraction model.
    pub summary: &'static str,
    pub fields: &'static [FieldSpec],
    /// Steps in conversational order.
    pub steps: Vec<StepSpec>,
    pub fallback: FallbackParser,
}

impl FlowDefinition {
    pub fn step(&self, step: Step) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.step == step)
    }

    pub fn declares(&self, step: Step) -> bool {
        step.is_terminal() || self.step(step).is_some()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn position(&self, step: Step) -> Option<usize> {
        self.steps.iter().position(|s| s.step == step)
    }

    /// First regular transition whose guard holds.
    pub fn next_target(&self, step: Step, data: &FlowData) -> Option<Target> {
        self.step(step)?
            .transitions
            .iter()
            .find(|t| !t.escape && t.guard.holds(data))
            .map(|t| t.target)
    }

    /// First escape transition whose guard holds.
    pub fn escape_target(&self, step: Step, data: &FlowData) -> Option<Target> {
        self.step(step)?
            .transitions
            .iter()
            .find(|t| t.escape && t.guard.holds(data))
            .map(|t| t.target)
    }

    /// The collect steps leading up to a confirmation step. Their fields may
    /// be edited while confirmation is pending.
    pub fn confirm_scope(&self, confirm: Step) -> Vec<&StepSpec> {
        let Some(end) = self.position(confirm) else {
            return Vec::new();
        };
        let mut scope: Vec<&StepSpec> = self.steps[..end]
            .iter()
            .rev()
            .take_while(|s| s.kind == StepKind::Collect)
            .collect();
        scope.reverse();
        scope
    }

    /// Earliest step in conversational order that declares any of `fields`.
    pub fn earliest_step_for<'a>(
        &self,
        candidates: &[&'a StepSpec],
        fields: &[String],
    ) -> Option<&'a StepSpec> {
        candidates
            .iter()
            .find(|s| s.fields().any(|f| fields.iter().any(|c| c == f)))
            .copied()
    }

    /// Load-time completeness checks.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let flow = self.flow;
        let mut seen = HashSet::new();
        for spec in &self.steps {
            if spec.step.is_terminal() {
                return Err(DefinitionError::TerminalDeclared { flow });
            }
            if !seen.insert(spec.step) {
                return Err(DefinitionError::DuplicateStep {
                    flow,
                    step: spec.step,
                });
            }
        }
        if !seen.contains(&self.entry) {
            return Err(DefinitionError::MissingEntry {
                flow,
                step: self.entry,
            });
        }

        for spec in &self.steps {
            if let Some(field) = spec.fields().find(|f| self.field(f).is_none()) {
                return Err(DefinitionError::UndeclaredField {
                    flow,
                    step: spec.step,
                    field: field.to_string(),
                });
            }
            if spec.transitions.is_empty() {
                return Err(DefinitionError::DeadEnd {
                    flow,
                    step: spec.step,
                });
            }
            for t in &spec.transitions {
                let guarded: Vec<&'static str> = match t.guard {
                    Guard::Always => Vec::new(),
                    Guard::Equals(f, _) | Guard::Flag(f, _) => vec![f],
                    Guard::Covers(a, b) => vec![a, b],
                };
                if let Some(f) = guarded.iter().find(|f| self.field(f).is_none()) {
                    return Err(DefinitionError::UndeclaredField {
                        flow,
                        step: spec.step,
                        field: f.to_string(),
                    });
                }
                if let Target::Step(to) = t.target
                    && !self.declares(to)
                {
                    return Err(DefinitionError::UndeclaredTarget {
                        flow,
                        from: spec.step,
                        to,
                    });
                }
            }
        }

        let mut reached = BTreeSet::from([self.entry]);
        let mut queue = VecDeque::from([self.entry]);
        while let Some(step) = queue.pop_front() {
            let Some(spec) = self.step(step) else { continue };
            for t in &spec.transitions {
                if let Target::Step(to) = t.target
                    && reached.insert(to)
                {
                    queue.push_back(to);
                }
            }
        }
        if let Some(orphan) = self.steps.iter().find(|s| !reached.contains(&s.step)) {
            return Err(DefinitionError::Unreachable {
                flow,
                step: orphan.step,
            });
        }
        Ok(())
    }
}

/// Known brands and body types, used by the deterministic parsers.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    pub brands: Vec<String>,
    pub car_types: Vec<String>,
}

const DEFAULT_BRANDS: &[&str] = &[
    "Maruti", "Hyundai", "Tata", "Mahindra", "Honda", "Toyota", "Kia", "Ford", "Renault",
    "Skoda", "Nissan", "Volkswagen", "MG",
];
const DEFAULT_CAR_TYPES: &[&str] = &["SUV", "Sedan", "Hatchback", "MUV", "Compact SUV"];

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            brands: DEFAULT_BRANDS.iter().map(|s| s.to_string()).collect(),
            car_types: DEFAULT_CAR_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Vocabulary {
    /// Built-in lists extended with whatever the catalogue holds.
    pub async fn load(records: &dyn RecordStore) -> Self {
        let mut vocab = Self::default();
        match records.brands().await {
            Ok(brands) => merge_names(&mut vocab.brands, brands),
            Err(e) => warn!("Could not load catalogue brands, using defaults: {}", e),
        }
        match records.car_types().await {
            Ok(types) => merge_names(&mut vocab.car_types, types),
            Err(e) => warn!("Could not load catalogue car types, using defaults: {}", e),
        }
        vocab
    }
}

fn merge_names(into: &mut Vec<String>, from: Vec<String>) {
    for name in from {
        if !into.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
            into.push(name);
        }
    }
}

/// Collaborators available to step actions.
pub struct ActionContext<'a> {
    pub records: &'a dyn RecordStore,
    pub timeout: Duration,
}

/// Side effects attached to steps.
#[async_trait]
pub trait StepActions: Send + Sync {
    /// Runs when the router moves into `step`. May fill derived fields; an
    /// issue sends the user back to the previous step.
    async fn on_enter(
        &self,
        _step: Step,
        _data: &mut FlowData,
        _ctx: &ActionContext<'_>,
    ) -> Result<(), FieldIssue> {
        Ok(())
    }

    /// The record to write when the user confirms at `step`.
    fn commit_request(&self, _step: Step, _state: &ConversationState) -> Option<CommitRequest> {
        None
    }

    /// Fields carried into another flow on hand-off.
    fn handoff(&self, _to: FlowName, _data: &FlowData) -> FlowData {
        FlowData::new()
    }
}

/// Everything the router needs for one flow.
pub struct FlowBundle {
    pub definition: FlowDefinition,
    pub extractor: Arc<dyn Extractor>,
    pub composer: Arc<dyn ResponseComposer>,
    pub actions: Arc<dyn StepActions>,
}

/// Settings flows read at construction.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub interest_rate: Decimal,
}

/// Read-only table of registered flows.
#[derive(Default)]
pub struct FlowRegistry {
    flows: HashMap<FlowName, FlowBundle>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow after checking its definition.
    pub fn register(&mut self, bundle: FlowBundle) -> Result<(), DefinitionError> {
        bundle.definition.validate()?;
        self.flows.insert(bundle.definition.flow, bundle);
        Ok(())
    }

    pub fn get(&self, flow: FlowName) -> Option<&FlowBundle> {
        self.flows.get(&flow)
    }

    /// Fails unless every flow has a definition.
    pub fn ensure_complete(&self) -> Result<(), DefinitionError> {
        match FlowName::ALL.into_iter().find(|f| !self.flows.contains_key(f)) {
            Some(missing) => Err(DefinitionError::MissingFlow(missing)),
            None => Ok(()),
        }
    }

    /// The four dealership flows, with extractors supplied by `extractor_for`.
    pub fn standard<F>(settings: &FlowSettings, extractor_for: F) -> Result<Self, DefinitionError>
    where
        F: Fn(&FlowDefinition) -> Arc<dyn Extractor>,
    {
        let mut registry = Self::new();
        let bundles: [(FlowDefinition, Arc<dyn ResponseComposer>, Arc<dyn StepActions>); 4] = [
            (
                browse::definition(),
                Arc::new(browse::BrowseComposer),
                Arc::new(browse::BrowseActions),
            ),
            (
                valuation::definition(),
                Arc::new(valuation::ValuationComposer),
                Arc::new(valuation::ValuationActions),
            ),
            (
                financing::definition(),
                Arc::new(financing::FinancingComposer),
                Arc::new(financing::FinancingActions::new(settings.interest_rate)),
            ),
            (
                service::definition(),
                Arc::new(service::ServiceComposer),
                Arc::new(service::ServiceActions),
            ),
        ];
        for (definition, composer, actions) in bundles {
            let extractor = extractor_for(&definition);
            registry.register(FlowBundle {
                definition,
                extractor,
                composer,
                actions,
            })?;
        }
        registry.ensure_complete()?;
        Ok(registry)
    }
}
