//! Transition table for the processing state machine.
//!
//! Pure: given a status and what a step observed, returns the next status and
//! the side effects owed once that status is persisted.

use crate::store::record::{Category, ItemStatus};

/// What a processing step observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Classifier returned a verdict.
    Classified,
    /// Router picked a lane for the verdict.
    Routed(Category),
    /// Routed for help; extraction may start.
    Started,
    /// Rejection sent to the sender.
    RejectionSent,
    /// Extraction is complete enough to match.
    Extracted,
    /// Extraction is incomplete and a question is being asked.
    NeedsClarification,
    /// The sender answered the outstanding question.
    ReplyReceived,
    /// Target resolved and the field-level change prepared.
    TargetResolved,
    /// The catalog accepted the change.
    UpdateApplied,
    /// The sender was told the change is done.
    Notified,
    /// A human has to take over.
    Escalate,
}

/// Work owed after a transition is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Forward the original message to the escalation recipients.
    ForwardToHuman,
    /// Reply to the sender with the clarification question.
    SendQuestion,
}

/// Next status plus owed side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: ItemStatus,
    pub effects: Vec<SideEffect>,
}

/// The (status, event) pair has no row in the table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No transition from {from} on {event:?}")]
pub struct NoTransition {
    pub from: ItemStatus,
    pub event: Event,
}

/// Look up the transition for `event` in `from`.
pub fn next(from: ItemStatus, event: Event) -> Result<Transition, NoTransition> {
    use ItemStatus::*;

    let to = match (from, event) {
        (s, Event::Escalate) if !s.is_terminal() => Escalated,
        (Received, Event::Classified) => Classified,
        (Classified, Event::Routed(Category::Help)) => RoutedHelp,
        (Classified, Event::Routed(Category::DontHelp)) => RoutedDontHelp,
        (Classified, Event::Routed(Category::Escalate)) => RoutedEscalate,
        (RoutedHelp, Event::Started) => InProgress,
        (RoutedDontHelp, Event::RejectionSent) => CompletedDontHelp,
        (InProgress, Event::Extracted) => DataExtracted,
        (InProgress, Event::NeedsClarification) => AwaitingClarification,
        (AwaitingClarification, Event::ReplyReceived) => InProgress,
        (DataExtracted, Event::TargetResolved) => UpdatePrepared,
        (UpdatePrepared, Event::UpdateApplied) => IndexUpdated,
        (IndexUpdated, Event::Notified) => CompletedSuccess,
        _ => return Err(NoTransition { from, event }),
    };

    let effects = match to {
        Escalated => vec![SideEffect::ForwardToHuman],
        AwaitingClarification => vec![SideEffect::SendQuestion],
        _ => Vec::new(),
    };

    Ok(Transition { to, effects })
}
