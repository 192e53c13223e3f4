//! The state-machine driver.
//!
//! Each cycle:
//! 1. Escalate stale items and resume anything a previous run left mid-flight
//! 2. Fetch unseen messages and split them into new requests and replies
//! 3. Halt the whole cycle if the guardrail trips
//! 4. Feed replies to items awaiting clarification
//! 5. Record and drive each new request, one at a time
//!
//! A transition is persisted before any of its side effects run, so a crash
//! leaves the item at its last committed status and the next run continues
//! from there.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clarification::{self, ClarificationController};
use crate::config::EngineConfig;
use crate::error::{Error, PipelineError, Result, StoreError};
use crate::guardrail::{Guardrail, GuardrailDecision};
use crate::matcher::Matcher;
use crate::pipeline::compose::{ResponseComposer, TemplateComposer};
use crate::pipeline::retry::with_retry;
use crate::pipeline::transitions::{self, Event, SideEffect};
use crate::pipeline::types::{CatalogSearch, Classifier, Extractor, MessageTransport, RawMessage};
use crate::store::RecordStore;
use crate::store::record::{
    FieldChange, ItemPatch, ItemStatus, ProcessingItem, UpdatePayload, UpdateResult,
};

/// External services the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub classifier: Arc<dyn Classifier>,
    pub extractor: Arc<dyn Extractor>,
    pub catalog: Arc<dyn CatalogSearch>,
    pub transport: Arc<dyn MessageTransport>,
}

/// Counts from one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub new_items: usize,
    /// Already-recorded messages, batch duplicates and unmatched replies.
    pub skipped: usize,
    /// Items picked up from an earlier run.
    pub resumed: usize,
    pub replies_handled: usize,
    pub completed: usize,
    pub rejected: usize,
    pub escalated: usize,
    pub awaiting: usize,
    pub stale_escalated: usize,
    /// Items that could not even be escalated.
    pub failed: usize,
}

impl CycleReport {
    fn tally(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::CompletedSuccess => self.completed += 1,
            ItemStatus::CompletedDontHelp => self.rejected += 1,
            ItemStatus::Escalated => self.escalated += 1,
            ItemStatus::AwaitingClarification => self.awaiting += 1,
            _ => {}
        }
    }
}

/// What one step produced: the event plus data to persist with it.
struct Step {
    event: Event,
    patch: ItemPatch,
    /// Clarification question, for `NeedsClarification`.
    question: Option<String>,
}

impl Step {
    fn on(event: Event) -> Self {
        Self {
            event,
            patch: ItemPatch::default(),
            question: None,
        }
    }

    fn with_patch(mut self, patch: ItemPatch) -> Self {
        self.patch = patch;
        self
    }

    fn escalate(reason: impl Into<String>) -> Self {
        Self::on(Event::Escalate).with_patch(ItemPatch::default().with_escalation_reason(reason))
    }
}

/// The catalog's own before/after report, falling back to the planned diff.
///
/// A field the catalog reports as already holding its new value keeps the
/// `before` captured when the update was planned. That happens when an update
/// is sent again after a crash between applying it and recording it.
fn reconcile_changes(planned: &[FieldChange], reported: Vec<FieldChange>) -> Vec<FieldChange> {
    if reported.is_empty() {
        return planned.to_vec();
    }
    reported
        .into_iter()
        .map(|mut change| {
            if change.before.as_ref() == Some(&change.after)
                && let Some(plan) = planned.iter().find(|p| p.field == change.field)
            {
                change.before = plan.before.clone();
            }
            change
        })
        .collect()
}

fn step_error(item: &ProcessingItem, step: &str, reason: impl Into<String>) -> Error {
    PipelineError::Step {
        item_id: item.item_id.clone(),
        step: step.to_string(),
        reason: reason.into(),
    }
    .into()
}

/// Fetched messages after deduplication.
#[derive(Default)]
struct Inbox {
    new: Vec<RawMessage>,
    /// Messages in conversations that already have a record.
    replies: Vec<RawMessage>,
    skipped: usize,
}

pub struct Orchestrator {
    config: EngineConfig,
    store: Arc<dyn RecordStore>,
    collaborators: Collaborators,
    composer: Arc<dyn ResponseComposer>,
    clarification: ClarificationController,
    matcher: Matcher,
    guardrail: Guardrail,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn RecordStore>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            clarification: ClarificationController::new(Arc::clone(&store)),
            matcher: Matcher::new(&config.match_suffixes),
            guardrail: Guardrail::new(config.mass_item_threshold),
            composer: Arc::new(TemplateComposer),
            config,
            store,
            collaborators,
        }
    }

    pub fn with_composer(mut self, composer: Arc<dyn ResponseComposer>) -> Self {
        self.composer = composer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    // ── Cycle ───────────────────────────────────────────────────────

    /// Run one full cycle. Returns `GuardrailHalted` when the batch is too large.
    pub async fn run_cycle(&self, shutdown: &AtomicBool) -> Result<CycleReport> {
        let mut report = self.resume(shutdown).await?;
        if shutdown.load(Ordering::SeqCst) {
            return Ok(report);
        }

        let known = self.store.known_ids().await?;
        let transport = &self.collaborators.transport;
        let messages = with_retry(&self.config.retry, "fetch_new", || {
            transport.fetch_new(self.config.fetch_since_days, &known)
        })
        .await?;
        report.fetched = messages.len();

        let inbox = self.sort_inbox(messages).await?;
        report.skipped += inbox.skipped;

        let subjects: Vec<&str> = inbox.new.iter().map(|m| m.subject.as_str()).collect();
        if let GuardrailDecision::Blocked {
            count,
            threshold,
            sample_subjects,
        } = self.guardrail.check(inbox.new.len(), &subjects)
        {
            self.send_guardrail_alert(count, threshold, &sample_subjects)
                .await;
            return Err(PipelineError::GuardrailHalted {
                count,
                threshold,
                samples: sample_subjects,
            }
            .into());
        }

        self.handle_replies(&inbox.replies, shutdown, &mut report)
            .await?;

        let total = inbox.new.len();
        for (i, message) in inbox.new.into_iter().enumerate() {
            if shutdown.load(Ordering::SeqCst) {
                info!(remaining = total - i, "Shutdown requested; leaving new items for next cycle");
                break;
            }
            report.new_items += 1;
            let item_id = message.id.clone();
            match self.process_new(message).await {
                Ok(done) => report.tally(done.status),
                Err(Error::Store(StoreError::DuplicateId { .. })) => {
                    debug!(item_id = %item_id, "Already recorded; skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(item_id = %item_id, error = %e, "New item could not be processed");
                    report.failed += 1;
                }
            }
        }

        info!(
            fetched = report.fetched,
            new = report.new_items,
            skipped = report.skipped,
            replies = report.replies_handled,
            completed = report.completed,
            rejected = report.rejected,
            escalated = report.escalated,
            awaiting = report.awaiting,
            stale = report.stale_escalated,
            "Cycle complete"
        );
        Ok(report)
    }

    /// Escalate stale items, then drive every item a previous run left mid-flight.
    pub async fn resume(&self, shutdown: &AtomicBool) -> Result<CycleReport> {
        let mut report = CycleReport {
            stale_escalated: self.sweep_stale().await?,
            ..Default::default()
        };

        let pending: Vec<ProcessingItem> = self
            .store
            .find_in_progress()
            .await?
            .into_iter()
            .filter(|item| item.status != ItemStatus::AwaitingClarification)
            .collect();

        for item in pending {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            info!(item_id = %item.item_id, status = %item.status, "Resuming item");
            report.resumed += 1;
            let item_id = item.item_id.clone();
            match self.drive(item).await {
                Ok(done) => report.tally(done.status),
                Err(e) => {
                    error!(item_id = %item_id, error = %e, "Resumed item could not be escalated");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Force-escalate every non-terminal item untouched for `stale_hours`.
    pub async fn sweep_stale(&self) -> Result<usize> {
        let stale = self.store.find_stale(self.config.stale_after()).await?;
        let mut escalated = 0;
        for item in stale {
            let reason = format!(
                "No progress for over {} hours (stuck in {})",
                self.config.stale_hours, item.status
            );
            match self.commit(&item, Step::escalate(reason)).await {
                Ok(_) => escalated += 1,
                Err(e) => error!(item_id = %item.item_id, error = %e, "Stale item could not be escalated"),
            }
        }
        if escalated > 0 {
            info!(count = escalated, "Stale items escalated");
        }
        Ok(escalated)
    }

    async fn sort_inbox(&self, messages: Vec<RawMessage>) -> Result<Inbox> {
        let mut inbox = Inbox::default();
        let mut batch_conversations = HashSet::new();

        for message in messages {
            if self.store.find(&message.id).await?.is_some() {
                inbox.skipped += 1;
            } else if self
                .store
                .find_by_conversation(&message.conversation_id)
                .await?
            {
                inbox.replies.push(message);
            } else if !batch_conversations.insert(message.conversation_id.clone()) {
                debug!(
                    item_id = %message.id,
                    conversation_id = %message.conversation_id,
                    "Conversation already in this batch; skipping"
                );
                inbox.skipped += 1;
            } else {
                inbox.new.push(message);
            }
        }
        Ok(inbox)
    }

    async fn process_new(&self, message: RawMessage) -> Result<ProcessingItem> {
        let item = ProcessingItem::new(
            message.id,
            message.conversation_id,
            message.sender,
            message.subject,
            message.body,
            message.received_at,
        );
        self.store.append(item.clone()).await?;
        info!(item_id = %item.item_id, sender = %item.sender, subject = %item.subject, "New item received");
        self.drive(item).await
    }

    // ── Clarification replies ───────────────────────────────────────

    async fn handle_replies(
        &self,
        replies: &[RawMessage],
        shutdown: &AtomicBool,
        report: &mut CycleReport,
    ) -> Result<()> {
        let waiting: Vec<ProcessingItem> = self
            .store
            .find_in_progress()
            .await?
            .into_iter()
            .filter(|item| item.status == ItemStatus::AwaitingClarification)
            .collect();

        let mut used = HashSet::new();
        for item in waiting {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let Some(reply) = self
                .clarification
                .check_for_reply(&item.item_id, replies)
                .await?
            else {
                continue;
            };
            used.insert(reply.id.clone());
            report.replies_handled += 1;

            let item_id = item.item_id.clone();
            let outcome = match self.handle_reply(item, &reply).await {
                Ok(done) => Ok(done),
                Err(e) => {
                    error!(item_id = %item_id, error = %e, "Reply handling failed; escalating");
                    self.force_escalate(&item_id, format!("Reply handling failed: {e}"), e.to_string())
                        .await
                }
            };
            match outcome {
                Ok(done) => report.tally(done.status),
                Err(e) => {
                    error!(item_id = %item_id, error = %e, "Item could not be escalated");
                    report.failed += 1;
                }
            }
        }

        report.skipped += replies.iter().filter(|r| !used.contains(&r.id)).count();
        Ok(())
    }

    /// Short-circuit to a human on request, otherwise merge and re-extract.
    pub async fn handle_reply(
        &self,
        item: ProcessingItem,
        reply: &RawMessage,
    ) -> Result<ProcessingItem> {
        transitions::next(item.status, Event::ReplyReceived)
            .map_err(|e| step_error(&item, "reply", e.to_string()))?;

        if clarification::detect_escalation_request(&reply.body) {
            info!(item_id = %item.item_id, "Sender asked for a human");
            return self
                .commit(&item, Step::escalate("Sender asked to speak to a person"))
                .await;
        }

        let merged = self
            .clarification
            .merge_reply(&item.item_id, &reply.body)
            .await?;
        info!(item_id = %item.item_id, from = %item.status, to = %merged.status, "Item transitioned");
        self.drive(merged).await
    }

    // ── Driver ──────────────────────────────────────────────────────

    /// Step an item until it is terminal or waiting on the sender.
    ///
    /// A failing step escalates the item. Returns `Err` only when even the
    /// escalation could not be recorded.
    pub async fn drive(&self, mut item: ProcessingItem) -> Result<ProcessingItem> {
        while !item.status.is_terminal() && item.status != ItemStatus::AwaitingClarification {
            let step = match self.step(&item).await {
                Ok(step) => step,
                Err(e) => {
                    error!(item_id = %item.item_id, status = %item.status, error = %e, "Step failed; escalating");
                    let mut step = Step::escalate(format!("Processing failed at {}: {e}", item.status));
                    step.patch.last_error = Some(e.to_string());
                    step
                }
            };

            item = match self.commit(&item, step).await {
                Ok(next) => next,
                Err(e) => {
                    error!(item_id = %item.item_id, status = %item.status, error = %e, "Commit failed; escalating");
                    return self
                        .force_escalate(
                            &item.item_id,
                            format!("Could not record progress at {}: {e}", item.status),
                            e.to_string(),
                        )
                        .await;
                }
            };
        }
        Ok(item)
    }

    /// Work for the item's current status.
    async fn step(&self, item: &ProcessingItem) -> Result<Step> {
        let retry = &self.config.retry;
        let Collaborators {
            classifier,
            extractor,
            catalog,
            transport,
        } = &self.collaborators;

        match item.status {
            ItemStatus::Received => {
                let verdict = with_retry(retry, "classify", || {
                    classifier.classify(&item.subject, &item.sender, &item.body)
                })
                .await?;
                info!(
                    item_id = %item.item_id,
                    category = ?verdict.category,
                    confidence = verdict.confidence,
                    "Item classified"
                );
                Ok(Step::on(Event::Classified).with_patch(ItemPatch {
                    category: Some(verdict.category),
                    confidence: Some(verdict.confidence.min(100)),
                    reason: Some(verdict.reason),
                    ..Default::default()
                }))
            }

            ItemStatus::Classified => {
                let (Some(category), Some(confidence)) = (item.category, item.confidence) else {
                    return Err(step_error(item, "route", "classification missing"));
                };
                let threshold = self.config.classification_confidence_threshold;
                if confidence < threshold {
                    return Ok(Step::escalate(format!(
                        "Classifier confidence {confidence} is below the threshold of {threshold}: {}",
                        item.reason.as_deref().unwrap_or("no reason given")
                    )));
                }
                Ok(Step::on(Event::Routed(category)))
            }

            ItemStatus::RoutedHelp => Ok(Step::on(Event::Started)),

            ItemStatus::RoutedEscalate => Ok(Step::escalate(format!(
                "Classifier flagged for human review: {}",
                item.reason.as_deref().unwrap_or("no reason given")
            ))),

            ItemStatus::RoutedDontHelp => {
                let body = self.composer.rejection(item);
                with_retry(retry, "reply", || transport.reply(&item.item_id, &body)).await?;
                info!(item_id = %item.item_id, "Rejection sent");
                Ok(Step::on(Event::RejectionSent))
            }

            ItemStatus::InProgress => {
                let data = with_retry(retry, "extract", || {
                    extractor.extract(&item.subject, &item.sender, &item.body)
                })
                .await?;
                let patch = ItemPatch {
                    extracted_data: Some(data.clone()),
                    ..Default::default()
                };

                let threshold = self.config.completeness_threshold;
                if data.is_complete(threshold) {
                    return Ok(Step::on(Event::Extracted).with_patch(patch));
                }

                let mut missing = data.missing_required();
                for field in &data.missing_fields {
                    if !missing.contains(field) {
                        missing.push(field.clone());
                    }
                }
                let gap = format!(
                    "completeness {} below {threshold}, missing [{}]",
                    data.completeness_score,
                    missing.join(", ")
                );

                let exhausted = if item.has_unjudged_reply() {
                    let status = self
                        .clarification
                        .record_unsatisfactory(&item.item_id, &gap)
                        .await?;
                    !status.can_retry
                } else {
                    !clarification::can_retry(item)
                };
                if exhausted {
                    let mut step = Step::escalate(format!(
                        "Request still incomplete after clarification: {gap}"
                    ));
                    step.patch.extracted_data = Some(data);
                    return Ok(step);
                }

                debug!(item_id = %item.item_id, gap = %gap, "Asking for clarification");
                let question = self.composer.clarification_question(item, &data);
                Ok(Step {
                    event: Event::NeedsClarification,
                    patch,
                    question: Some(question),
                })
            }

            ItemStatus::DataExtracted => {
                let data = item
                    .extracted_data
                    .as_ref()
                    .ok_or_else(|| step_error(item, "match", "no extracted data"))?;
                let target = data
                    .target_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| step_error(item, "match", "no target name"))?;

                let top_k = self.config.search_top_k;
                let candidates =
                    with_retry(retry, "search", || catalog.search(target, top_k)).await?;
                let outcome = self.matcher.resolve(target, &candidates);
                let summary = outcome.closest();

                let best = match &outcome.best {
                    Some(best) if outcome.should_proceed() => best,
                    _ => {
                        let mut step = Step::escalate(outcome.explain(target));
                        step.patch.match_summary = Some(summary);
                        return Ok(step);
                    }
                };

                let Some(current) = with_retry(retry, "get", || catalog.get(&best.id)).await? else {
                    let mut step = Step::escalate(format!(
                        "Catalog record {} ({}) no longer exists",
                        best.name, best.id
                    ));
                    step.patch.match_summary = Some(summary);
                    return Ok(step);
                };

                let changes = data
                    .change_fields
                    .iter()
                    .map(|(field, after)| FieldChange {
                        field: field.clone(),
                        before: current.fields.get(field).cloned(),
                        after: after.clone(),
                    })
                    .collect();

                info!(
                    item_id = %item.item_id,
                    target_id = %current.id,
                    tier = %outcome.tier,
                    score = outcome.score,
                    "Target resolved"
                );
                Ok(Step::on(Event::TargetResolved).with_patch(ItemPatch {
                    update_payload: Some(UpdatePayload {
                        target_id: current.id.clone(),
                        target_name: current.name.clone(),
                        changes,
                    }),
                    match_summary: Some(summary),
                    ..Default::default()
                }))
            }

            ItemStatus::UpdatePrepared => {
                let payload = item
                    .update_payload
                    .as_ref()
                    .ok_or_else(|| step_error(item, "update", "no update payload"))?;
                let field_patch = payload.field_patch();
                let change = with_retry(retry, "update", || {
                    catalog.update(&payload.target_id, &field_patch)
                })
                .await?;

                let result = UpdateResult {
                    success: change.success,
                    changes: reconcile_changes(&payload.changes, change.changes),
                    applied_at: Utc::now(),
                    message: change.message,
                };

                if !result.success {
                    let mut step = Step::escalate(format!(
                        "Catalog rejected the update to {}: {}",
                        payload.target_name,
                        result.message.as_deref().unwrap_or("no message")
                    ));
                    step.patch.update_result = Some(result);
                    return Ok(step);
                }

                info!(item_id = %item.item_id, target_id = %payload.target_id, fields = result.changes.len(), "Catalog updated");
                Ok(Step::on(Event::UpdateApplied).with_patch(ItemPatch {
                    update_result: Some(result),
                    ..Default::default()
                }))
            }

            ItemStatus::IndexUpdated => {
                let result = item
                    .update_result
                    .as_ref()
                    .ok_or_else(|| step_error(item, "notify", "no update result"))?;
                let body = self.composer.success(item, result);
                with_retry(retry, "reply", || transport.reply(&item.item_id, &body)).await?;
                Ok(Step::on(Event::Notified))
            }

            ItemStatus::AwaitingClarification
            | ItemStatus::CompletedSuccess
            | ItemStatus::CompletedDontHelp
            | ItemStatus::Escalated => Err(step_error(
                item,
                item.status.as_str(),
                "no work for this status",
            )),
        }
    }

    /// Persist the transition for `step`, then run its side effects.
    async fn commit(&self, item: &ProcessingItem, step: Step) -> Result<ProcessingItem> {
        let transition = transitions::next(item.status, step.event)
            .map_err(|e| step_error(item, item.status.as_str(), e.to_string()))?;
        let Step {
            mut patch,
            question,
            ..
        } = step;

        let mut updated = if transition.to == ItemStatus::AwaitingClarification {
            self.store.update(&item.item_id, patch).await?;
            self.clarification
                .ask(&item.item_id, question.as_deref().unwrap_or_default())
                .await?
        } else {
            patch.status = Some(transition.to);
            self.store.update(&item.item_id, patch).await?
        };
        info!(item_id = %item.item_id, from = %item.status, to = %updated.status, "Item transitioned");

        for effect in transition.effects {
            updated = match effect {
                SideEffect::ForwardToHuman => self.forward_to_human(updated).await?,
                SideEffect::SendQuestion => self.send_question(updated).await?,
            };
        }
        Ok(updated)
    }

    /// Reload and escalate, unless the item is already terminal.
    async fn force_escalate(
        &self,
        item_id: &str,
        reason: String,
        last_error: String,
    ) -> Result<ProcessingItem> {
        let item = self
            .store
            .find(item_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                id: item_id.to_string(),
            })?;
        if item.status.is_terminal() {
            return Ok(item);
        }
        let mut step = Step::escalate(reason);
        step.patch.last_error = Some(last_error);
        self.commit(&item, step).await
    }

    // ── Side effects ────────────────────────────────────────────────

    async fn forward_to_human(&self, item: ProcessingItem) -> Result<ProcessingItem> {
        let reason = item
            .escalation_reason
            .clone()
            .unwrap_or_else(|| "no reason recorded".to_string());
        warn!(item_id = %item.item_id, reason = %reason, "Item escalated");

        let recipients = &self.config.escalation_recipients;
        if recipients.is_empty() {
            warn!(item_id = %item.item_id, "No escalation recipients configured; not forwarding");
            return Ok(item);
        }

        let comment = self.composer.escalation_comment(&item, &reason);
        let transport = &self.collaborators.transport;
        match with_retry(&self.config.retry, "forward", || {
            transport.forward(&item.item_id, recipients, &comment)
        })
        .await
        {
            Ok(()) => Ok(item),
            Err(e) => {
                error!(item_id = %item.item_id, error = %e, "Escalation forward failed");
                let patch = ItemPatch::default().with_error(format!("Escalation forward failed: {e}"));
                Ok(self.store.update(&item.item_id, patch).await?)
            }
        }
    }

    async fn send_question(&self, item: ProcessingItem) -> Result<ProcessingItem> {
        let question = item.last_clarification_question.clone().unwrap_or_default();
        let transport = &self.collaborators.transport;
        match with_retry(&self.config.retry, "reply", || {
            transport.reply(&item.item_id, &question)
        })
        .await
        {
            Ok(()) => {
                info!(item_id = %item.item_id, "Clarification question sent");
                Ok(item)
            }
            Err(e) => {
                error!(item_id = %item.item_id, error = %e, "Clarification question could not be sent");
                let patch = ItemPatch::status(ItemStatus::Escalated)
                    .with_escalation_reason(format!("Could not send clarification question: {e}"))
                    .with_error(e.to_string());
                let escalated = self.store.update(&item.item_id, patch).await?;
                info!(item_id = %item.item_id, from = %item.status, to = %escalated.status, "Item transitioned");
                self.forward_to_human(escalated).await
            }
        }
    }

    async fn send_guardrail_alert(&self, count: usize, threshold: usize, samples: &[String]) {
        let Some(recipient) = self.config.alert_recipient.as_deref() else {
            warn!(count, threshold, "Guardrail halted cycle; no alert recipient configured");
            return;
        };
        let alert = self.composer.guardrail_alert(count, threshold, samples);
        let transport = &self.collaborators.transport;
        if let Err(e) = with_retry(&self.config.retry, "send", || {
            transport.send(recipient, &alert.subject, &alert.body)
        })
        .await
        {
            error!(error = %e, recipient = %recipient, "Guardrail alert could not be sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::config::RetryPolicy;
    use crate::error::{LlmError, SearchError, TransportError};
    use crate::pipeline::types::{Candidate, CatalogChange, Classification};
    use crate::store::JsonlRecordStore;
    use crate::store::record::{Category, ExtractedData};

    struct FixedClassifier(Classification);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _: &str, _: &str, _: &str) -> std::result::Result<Classification, LlmError> {
            Ok(self.0.clone())
        }
    }

    /// Returns scripted extractions in order, repeating the last one.
    struct ScriptedExtractor {
        script: Mutex<Vec<ExtractedData>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn extract(&self, _: &str, _: &str, _: &str) -> std::result::Result<ExtractedData, LlmError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                Ok(script.remove(0))
            } else {
                Ok(script[0].clone())
            }
        }
    }

    struct OneRecordCatalog;

    #[async_trait]
    impl CatalogSearch for OneRecordCatalog {
        async fn search(&self, _: &str, _: usize) -> std::result::Result<Vec<Candidate>, SearchError> {
            Ok(vec![record()])
        }

        async fn get(&self, _: &str) -> std::result::Result<Option<Candidate>, SearchError> {
            Ok(Some(record()))
        }

        async fn update(
            &self,
            _: &str,
            patch: &serde_json::Map<String, serde_json::Value>,
        ) -> std::result::Result<CatalogChange, SearchError> {
            Ok(CatalogChange {
                success: true,
                changes: patch
                    .iter()
                    .map(|(k, v)| FieldChange {
                        field: k.clone(),
                        before: record().fields.get(k).cloned(),
                        after: v.clone(),
                    })
                    .collect(),
                message: None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        inbox: Mutex<Vec<RawMessage>>,
        replies: Mutex<Vec<(String, String)>>,
        forwards: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageTransport for RecordingTransport {
        async fn fetch_new(&self, _: u32, exclude: &[String]) -> std::result::Result<Vec<RawMessage>, TransportError> {
            Ok(self
                .inbox
                .lock()
                .unwrap()
                .iter()
                .filter(|m| !exclude.contains(&m.id))
                .cloned()
                .collect())
        }

        async fn reply(&self, item_id: &str, body: &str) -> std::result::Result<(), TransportError> {
            self.replies.lock().unwrap().push((item_id.into(), body.into()));
            Ok(())
        }

        async fn forward(&self, item_id: &str, _: &[String], _: &str) -> std::result::Result<(), TransportError> {
            self.forwards.lock().unwrap().push(item_id.into());
            Ok(())
        }

        async fn send(&self, _: &str, _: &str, _: &str) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn record() -> Candidate {
        Candidate::new("rec-1", "Billing Portal").with_field("owner", serde_json::json!("carol@x.com"))
    }

    fn complete() -> ExtractedData {
        let mut data = ExtractedData {
            target_name: Some("Billing Portal".into()),
            completeness_score: 90,
            ..Default::default()
        };
        data.change_fields.insert("owner".into(), serde_json::json!("dana@x.com"));
        data
    }

    fn incomplete() -> ExtractedData {
        ExtractedData {
            completeness_score: 20,
            ..Default::default()
        }
    }

    fn message(id: &str, conversation: &str) -> RawMessage {
        RawMessage {
            id: id.into(),
            conversation_id: conversation.into(),
            sender: "alice@example.com".into(),
            subject: "Change owner".into(),
            body: "Please set the Billing Portal owner to dana@x.com".into(),
            received_at: Utc::now(),
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        transport: Arc<RecordingTransport>,
        extractor: Arc<ScriptedExtractor>,
    }

    fn harness(category: Category, confidence: u8, extractions: Vec<ExtractedData>) -> Harness {
        let store: Arc<dyn RecordStore> = Arc::new(JsonlRecordStore::in_memory());
        let transport = Arc::new(RecordingTransport::default());
        let extractor = Arc::new(ScriptedExtractor {
            script: Mutex::new(extractions),
            calls: Mutex::new(0),
        });
        let config = EngineConfig {
            escalation_recipients: vec!["ops@example.com".into()],
            retry: RetryPolicy::immediate(1),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(
            config,
            store,
            Collaborators {
                classifier: Arc::new(FixedClassifier(Classification {
                    category,
                    confidence,
                    reason: "test".into(),
                })),
                extractor: extractor.clone(),
                catalog: Arc::new(OneRecordCatalog),
                transport: transport.clone(),
            },
        );
        Harness {
            orchestrator,
            transport,
            extractor,
        }
    }

    #[tokio::test]
    async fn help_request_completes_with_diff() {
        let h = harness(Category::Help, 85, vec![complete()]);
        h.transport.inbox.lock().unwrap().push(message("m-1", "t-1"));

        let report = h.orchestrator.run_cycle(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(report.completed, 1);

        let item = h.orchestrator.store().find("m-1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::CompletedSuccess);
        let result = item.update_result.unwrap();
        assert!(result.success);
        assert_eq!(result.changes[0].before, Some(serde_json::json!("carol@x.com")));
        assert_eq!(h.transport.replies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn low_confidence_escalates_without_extraction() {
        let h = harness(Category::Help, 50, vec![complete()]);
        h.transport.inbox.lock().unwrap().push(message("m-1", "t-1"));

        let report = h.orchestrator.run_cycle(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(report.escalated, 1);
        assert_eq!(*h.extractor.calls.lock().unwrap(), 0);

        let item = h.orchestrator.store().find("m-1").await.unwrap().unwrap();
        assert!(item.escalation_reason.unwrap().contains("below the threshold of 70"));
        assert_eq!(*h.transport.forwards.lock().unwrap(), vec!["m-1".to_string()]);
    }

    #[tokio::test]
    async fn dont_help_sends_rejection() {
        let h = harness(Category::DontHelp, 95, vec![complete()]);
        h.transport.inbox.lock().unwrap().push(message("m-1", "t-1"));

        let report = h.orchestrator.run_cycle(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(report.rejected, 1);
        let replies = h.transport.replies.lock().unwrap();
        assert!(replies[0].1.contains("not able to help"));
    }

    #[tokio::test]
    async fn incomplete_extraction_asks_and_waits() {
        let h = harness(Category::Help, 90, vec![incomplete()]);
        h.transport.inbox.lock().unwrap().push(message("m-1", "t-1"));

        let report = h.orchestrator.run_cycle(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(report.awaiting, 1);

        let item = h.orchestrator.store().find("m-1").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::AwaitingClarification);
        assert_eq!(item.clarification_attempts, 0);
        assert!(item.extracted_data.is_some());
        let replies = h.transport.replies.lock().unwrap();
        assert_eq!(replies[0].1, item.last_clarification_question.unwrap());
    }

    #[tokio::test]
    async fn shutdown_flag_stops_before_new_items() {
        let h = harness(Category::Help, 90, vec![complete()]);
        h.transport.inbox.lock().unwrap().push(message("m-1", "t-1"));

        let report = h.orchestrator.run_cycle(&AtomicBool::new(true)).await.unwrap();
        assert_eq!(report.new_items, 0);
        assert!(h.orchestrator.store().find("m-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_conversation_in_batch_is_skipped() {
        let h = harness(Category::Help, 90, vec![complete()]);
        {
            let mut inbox = h.transport.inbox.lock().unwrap();
            inbox.push(message("m-1", "t-1"));
            inbox.push(message("m-2", "t-1"));
        }
        let report = h.orchestrator.run_cycle(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(report.new_items, 1);
        assert_eq!(report.skipped, 1);
        assert!(h.orchestrator.store().find("m-2").await.unwrap().is_none());
    }

    #[test]
    fn report_tallies_final_statuses() {
        let mut report = CycleReport::default();
        for status in [
            ItemStatus::CompletedSuccess,
            ItemStatus::Escalated,
            ItemStatus::Escalated,
            ItemStatus::AwaitingClarification,
            ItemStatus::CompletedDontHelp,
            ItemStatus::InProgress,
        ] {
            report.tally(status);
        }
        assert_eq!(
            (report.completed, report.escalated, report.awaiting, report.rejected),
            (1, 2, 1, 1)
        );
    }
}
