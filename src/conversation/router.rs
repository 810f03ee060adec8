//! `StepRouter`: runs one message through the active flow's step table.
//!
//! Stages, in order:
//! 1. confirmation, when a commit point is awaiting yes/no
//! 2. init, when the step's prompt has not been shown yet
//! 3. main: extract, merge, then settle on the next step that still needs input
//!
//! The router never writes state. It returns a [`StepOutcome`] that the
//! orchestrator persists in a single store call.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::conversation::phrases;
use crate::conversation::state::{ConversationState, FlowData, FlowName, Step, SubState};
use crate::error::{CommitError, ExtractionError, RoutingError};
use crate::flows::compose::generic_reply;
use crate::flows::parse::parse_yes_no;
use crate::flows::{
    ActionContext, FieldIssue, FlowBundle, FlowDefinition, FlowRegistry, RawFields, Reply,
    StepKind, StepSpec, Target, Vocabulary,
};
use crate::store::RecordStore;

/// Upper bound on transitions taken for one message.
const MAX_HOPS: usize = 16;

/// How the router was entered for this message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// A message for a flow that was already active.
    Continue,
    /// The message that selected the flow; it also seeds it.
    Seeded,
}

/// What happened to the flow.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Stay,
    Advanced,
    Restarted,
    Completed,
    Exited,
    /// Continue in `flow` with `data`. The reply comes from the new flow.
    Handoff { flow: FlowName, data: FlowData },
}

/// Result of routing one message.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub data: FlowData,
    pub step: Step,
    pub sub_state: SubState,
    pub reply: String,
    pub kind: OutcomeKind,
}

impl StepOutcome {
    /// Whether the flow has ended.
    pub fn terminal(&self) -> bool {
        matches!(self.kind, OutcomeKind::Completed | OutcomeKind::Exited)
    }
}

pub struct StepRouter {
    flows: Arc<FlowRegistry>,
    records: Arc<dyn RecordStore>,
    vocabulary: Arc<Vocabulary>,
    timeout: Duration,
}

impl StepRouter {
    pub fn new(
        flows: Arc<FlowRegistry>,
        records: Arc<dyn RecordStore>,
        vocabulary: Arc<Vocabulary>,
        timeout: Duration,
    ) -> Self {
        Self {
            flows,
            records,
            vocabulary,
            timeout,
        }
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    /// Route `text` against `state`.
    pub async fn route(
        &self,
        state: &ConversationState,
        text: &str,
        entry: Entry,
    ) -> Result<StepOutcome, RoutingError> {
        let bundle = self
            .flows
            .get(state.flow)
            .ok_or(RoutingError::UnknownFlow(state.flow))?;
        let spec = bundle
            .definition
            .step(state.step)
            .ok_or(RoutingError::UndeclaredStep {
                flow: state.flow,
                step: state.step,
            })?;

        match state.sub_state {
            SubState::AwaitingConfirmation if spec.kind == StepKind::Confirm => {
                self.confirm(bundle, spec, state, text).await
            }
            SubState::NeedsInit if entry == Entry::Continue => {
                debug!(flow = %state.flow, step = %state.step, "Init stage");
                self.settle(bundle, state, state.step, state.data.clone(), Vec::new(), true)
                    .await
            }
            _ => self.main(bundle, spec, state, text, entry).await,
        }
    }

    // ── Confirmation stage ──────────────────────────────────────────

    async fn confirm(
        &self,
        bundle: &FlowBundle,
        spec: &StepSpec,
        state: &ConversationState,
        text: &str,
    ) -> Result<StepOutcome, RoutingError> {
        let def = &bundle.definition;
        match parse_yes_no(text) {
            Some(true) => {
                let request = bundle
                    .actions
                    .commit_request(spec.step, state)
                    .ok_or(RoutingError::MissingCommit {
                        flow: def.flow,
                        step: spec.step,
                    })?;
                match self.commit(&request).await {
                    Ok(confirmation_id) => {
                        info!(
                            user_id = %state.user_id,
                            flow = %def.flow,
                            confirmation_id = %confirmation_id,
                            "Committed"
                        );
                        let reply = compose(
                            bundle,
                            spec.step,
                            &state.data,
                            &Reply::Committed {
                                confirmation_id: &confirmation_id,
                            },
                        );
                        let step = match def.next_target(spec.step, &state.data) {
                            Some(Target::Step(next)) => next,
                            _ => Step::Complete,
                        };
                        let kind = if step.is_terminal() {
                            OutcomeKind::Completed
                        } else {
                            OutcomeKind::Advanced
                        };
                        Ok(StepOutcome {
                            data: state.data.clone(),
                            step,
                            sub_state: SubState::None,
                            reply,
                            kind,
                        })
                    }
                    Err(e) => {
                        warn!(user_id = %state.user_id, flow = %def.flow, "Commit failed: {}", e);
                        Ok(stay(bundle, state, Reply::CommitFailed))
                    }
                }
            }
            Some(false) => Ok(stay(bundle, state, Reply::Declined)),
            None => {
                let scope = def.confirm_scope(spec.step);
                let accepted: HashSet<&'static str> = scope.iter().flat_map(|s| s.fields()).collect();
                let raw = self.extract(bundle, state, text).await;
                let (incoming, issues) = absorb(def, raw, &accepted);
                let mut data = state.data.clone();
                let changed = data.merge(incoming);
                if !issues.is_empty() && changed.is_empty() {
                    return Ok(stay(bundle, state, Reply::Missing(&issues)));
                }
                match def.earliest_step_for(&scope, &changed) {
                    Some(from) => {
                        debug!(flow = %def.flow, from = %from.step, changed = ?changed, "Details edited before confirming");
                        self.settle(bundle, state, from.step, data, issues, false).await
                    }
                    None => Ok(stay(bundle, state, Reply::ConfirmReprompt)),
                }
            }
        }
    }

    async fn commit(&self, request: &crate::store::CommitRequest) -> Result<String, CommitError> {
        match tokio::time::timeout(self.timeout, self.records.commit(request)).await {
            Ok(result) => result,
            Err(_) => Err(CommitError::Timeout(self.timeout)),
        }
    }

    // ── Main stage ──────────────────────────────────────────────────

    async fn main(
        &self,
        bundle: &FlowBundle,
        spec: &StepSpec,
        state: &ConversationState,
        text: &str,
        entry: Entry,
    ) -> Result<StepOutcome, RoutingError> {
        let def = &bundle.definition;

        if text.trim().is_empty() {
            let issues = spec.issues(&state.data);
            let reply = if issues.is_empty() {
                Reply::Prompt
            } else {
                Reply::Missing(&issues)
            };
            return Ok(stay(bundle, state, reply));
        }
        if entry == Entry::Continue && phrases::is_restart(text) {
            info!(user_id = %state.user_id, flow = %def.flow, "Flow restarted by user");
            return Ok(restarted(bundle));
        }

        let accepted = accepted_fields(def, spec);
        let raw = self.extract(bundle, state, text).await;
        let (incoming, mut pending) = absorb(def, raw, &accepted);

        let before = &state.data;
        let mut data = before.clone();
        let mut changed = data.merge(incoming);
        enforce_checks(def, before, &mut data, &mut changed, &mut pending);

        let from = restart_point(def, spec, &changed);
        if from != spec.step {
            debug!(flow = %def.flow, from = %from, changed = ?changed, "Earlier answer changed");
        }
        let quiet = entry == Entry::Seeded && changed.is_empty() && pending.is_empty();
        self.settle(bundle, state, from, data, pending, quiet).await
    }

    /// Extraction with the bounded wait, falling back to the flow's parser.
    async fn extract(&self, bundle: &FlowBundle, state: &ConversationState, text: &str) -> RawFields {
        let def = &bundle.definition;
        let result = match tokio::time::timeout(
            self.timeout,
            bundle.extractor.analyze(state.step, text, &state.data),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout {
                flow: def.flow,
                timeout: self.timeout,
            }),
        };
        match result {
            Ok(extraction) => {
                debug!(flow = %def.flow, step = %state.step, raw = %extraction.raw, "Extracted fields");
                extraction.fields
            }
            Err(e) => {
                warn!(user_id = %state.user_id, "Extraction failed, using rule parser: {}", e);
                (def.fallback)(state.step, text, &state.data, &self.vocabulary)
            }
        }
    }

    // ── Settling ────────────────────────────────────────────────────

    /// Walk forward from `from` until a step needs input or the flow leaves
    /// its step graph.
    async fn settle(
        &self,
        bundle: &FlowBundle,
        state: &ConversationState,
        from: Step,
        mut data: FlowData,
        pending: Vec<FieldIssue>,
        quiet: bool,
    ) -> Result<StepOutcome, RoutingError> {
        let def = &bundle.definition;
        let flow = def.flow;
        let ctx = ActionContext {
            records: self.records.as_ref(),
            timeout: self.timeout,
        };
        let moved = |step: Step| {
            if step == state.step {
                OutcomeKind::Stay
            } else {
                OutcomeKind::Advanced
            }
        };

        let mut step = from;
        for _ in 0..MAX_HOPS {
            let spec = def
                .step(step)
                .ok_or(RoutingError::UndeclaredStep { flow, step })?;

            let target = match def.escape_target(step, &data) {
                Some(target) => target,
                None => {
                    if spec.kind == StepKind::Confirm {
                        let reply = compose(bundle, step, &data, &Reply::Summary);
                        return Ok(StepOutcome {
                            data,
                            step,
                            sub_state: SubState::AwaitingConfirmation,
                            reply,
                            kind: moved(step),
                        });
                    }
                    let issues = spec.issues(&data);
                    let blocked = pending
                        .iter()
                        .any(|p| p.field().is_none_or(|f| spec.fields().any(|g| g == f)));
                    if !issues.is_empty() || blocked {
                        let fresh = step != from && !spec.required.iter().any(|f| data.contains(f));
                        let reply_issues = with_pending(&pending, issues);
                        let reply = if pending.is_empty() && (fresh || (quiet && step == from)) {
                            Reply::Prompt
                        } else {
                            Reply::Missing(&reply_issues)
                        };
                        let reply = compose(bundle, step, &data, &reply);
                        return Ok(StepOutcome {
                            data,
                            step,
                            sub_state: SubState::None,
                            reply,
                            kind: moved(step),
                        });
                    }
                    def.next_target(step, &data)
                        .ok_or(RoutingError::NoTransition { flow, step })?
                }
            };

            match target {
                Target::Step(next) => {
                    if !def.declares(next) {
                        return Err(RoutingError::UndeclaredStep { flow, step: next });
                    }
                    if let Err(issue) = bundle.actions.on_enter(next, &mut data, &ctx).await {
                        debug!(flow = %flow, step = %next, issue = ?issue, "Step entry refused");
                        let reply = compose(bundle, step, &data, &Reply::Missing(&[issue]));
                        return Ok(StepOutcome {
                            data,
                            step,
                            sub_state: SubState::None,
                            reply,
                            kind: moved(step),
                        });
                    }
                    step = next;
                }
                Target::Stay => {
                    let reply = compose(bundle, step, &data, &Reply::Outcome);
                    return Ok(StepOutcome {
                        data,
                        step,
                        sub_state: SubState::None,
                        reply,
                        kind: moved(step),
                    });
                }
                Target::Complete | Target::Exit => {
                    let reply = compose(bundle, step, &data, &Reply::Outcome);
                    let (step, kind) = if target == Target::Complete {
                        (Step::Complete, OutcomeKind::Completed)
                    } else {
                        (step, OutcomeKind::Exited)
                    };
                    return Ok(StepOutcome {
                        data,
                        step,
                        sub_state: SubState::None,
                        reply,
                        kind,
                    });
                }
                Target::Restart => return Ok(restarted(bundle)),
                Target::Handoff(to) => {
                    if to == flow {
                        return Err(RoutingError::InvalidHandoff { from: flow, to });
                    }
                    let carried = bundle.actions.handoff(to, &data);
                    info!(user_id = %state.user_id, from = %flow, to = %to, "Hand-off");
                    return Ok(StepOutcome {
                        data,
                        step,
                        sub_state: SubState::None,
                        reply: String::new(),
                        kind: OutcomeKind::Handoff {
                            flow: to,
                            data: carried,
                        },
                    });
                }
            }
        }
        error!(flow = %flow, "Step graph did not settle");
        Err(RoutingError::Unsettled {
            flow,
            hops: MAX_HOPS,
        })
    }
}

/// Reply text for a step, replaced by a generic message if the composer fails.
fn compose(bundle: &FlowBundle, step: Step, data: &FlowData, reply: &Reply<'_>) -> String {
    match bundle.composer.compose(step, data, reply) {
        Ok(text) => text,
        Err(e) => {
            warn!(flow = %bundle.definition.flow, "Reply composition failed: {}", e);
            generic_reply(reply)
        }
    }
}

/// Outcome that leaves the state exactly as it was.
fn stay(bundle: &FlowBundle, state: &ConversationState, reply: Reply<'_>) -> StepOutcome {
    StepOutcome {
        reply: compose(bundle, state.step, &state.data, &reply),
        data: state.data.clone(),
        step: state.step,
        sub_state: state.sub_state,
        kind: OutcomeKind::Stay,
    }
}

fn restarted(bundle: &FlowBundle) -> StepOutcome {
    let def = &bundle.definition;
    let data = FlowData::new();
    let reply = match bundle.composer.compose(def.entry, &data, &Reply::Restarted) {
        Ok(text) => text,
        Err(_) => format!(
            "Okay, let's start again.\n\n{}",
            compose(bundle, def.entry, &data, &Reply::Prompt)
        ),
    };
    StepOutcome {
        data,
        step: def.entry,
        sub_state: SubState::None,
        reply,
        kind: OutcomeKind::Restarted,
    }
}

/// Fields a message may set while on `spec`: the step's own fields plus
/// any collect-step field of the flow. Menu answers only count on their own
/// step.
fn accepted_fields(def: &FlowDefinition, spec: &StepSpec) -> HashSet<&'static str> {
    def.steps
        .iter()
        .filter(|s| s.kind == StepKind::Collect)
        .flat_map(|s| s.fields())
        .chain(spec.fields())
        .collect()
}

/// Validate raw fields. Valid values are returned for merging; invalid ones
/// become issues and are not merged.
fn absorb(
    def: &FlowDefinition,
    raw: RawFields,
    accepted: &HashSet<&'static str>,
) -> (FlowData, Vec<FieldIssue>) {
    let mut incoming = FlowData::new();
    let mut issues = Vec::new();
    for (name, value) in raw {
        let Some(field) = def.field(&name) else {
            debug!(flow = %def.flow, field = %name, "Ignoring undeclared field");
            continue;
        };
        if !field.is_extractable() || !accepted.contains(field.name) {
            debug!(flow = %def.flow, field = %name, "Ignoring field outside the current step");
            continue;
        }
        match field.normalize(&value) {
            Ok(v) => {
                incoming.insert(field.name, v);
            }
            Err(issue) => issues.push(issue),
        }
    }
    (incoming, issues)
}

/// Undo changes that fail a step's cross-field check.
fn enforce_checks(
    def: &FlowDefinition,
    before: &FlowData,
    data: &mut FlowData,
    changed: &mut Vec<String>,
    pending: &mut Vec<FieldIssue>,
) {
    for spec in &def.steps {
        let Some(check) = spec.check else { continue };
        let touched: Vec<String> = changed
            .iter()
            .filter(|c| spec.fields().any(|f| f == c.as_str()))
            .cloned()
            .collect();
        if touched.is_empty() || spec.required.iter().any(|f| !data.contains(f)) {
            continue;
        }
        if let Err(issue) = check(data) {
            for key in &touched {
                match before.get(key) {
                    Some(old) => {
                        data.insert(key.clone(), old.clone());
                    }
                    None => {
                        data.remove(key);
                    }
                }
            }
            changed.retain(|c| !touched.contains(c));
            pending.push(issue);
        }
    }
}

/// The step to settle from: the earliest step whose answer changed, if it
/// comes before the current one.
fn restart_point(def: &FlowDefinition, current: &StepSpec, changed: &[String]) -> Step {
    let position = |step: Step| def.steps.iter().position(|s| s.step == step);
    let candidates: Vec<&StepSpec> = def.steps.iter().collect();
    match def.earliest_step_for(&candidates, changed) {
        Some(earlier) if position(earlier.step) < position(current.step) => earlier.step,
        _ => current.step,
    }
}

/// Normalization problems first, then whatever the step still lacks.
fn with_pending(pending: &[FieldIssue], issues: Vec<FieldIssue>) -> Vec<FieldIssue> {
    let mut all = pending.to_vec();
    for issue in issues {
        let dup = issue.field().is_some() && pending.iter().any(|p| p.field() == issue.field());
        if !dup {
            all.push(issue);
        }
    }
    all
}
