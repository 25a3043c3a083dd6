//! Remote API contract consumed by the sync engine.
//!
//! The original client reached its backend through one process-wide service
//! object; here the surface the sync engine actually needs is an injected
//! trait object, so tests can substitute a scripted implementation and the
//! engine never touches HTTP directly.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ChecklistItem, ChecklistItemPatch, EventMessage, NewChecklistItem, NewMessage};

/// Outcome classification for remote mutations.
///
/// The REST implementation maps HTTP statuses onto these variants: a 404 on
/// the parent event is `ParentMissing`, a 404 on the message/item itself is
/// `TargetMissing`, 429 is `RateLimited`, 401 is `Unauthorized`, anything
/// else is `Transient`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The mutation's own target no longer exists (e.g. the message was
    /// already deleted by the partner).
    #[error("target resource not found")]
    TargetMissing,

    /// The parent event is gone; nothing scoped to it can succeed anymore.
    #[error("parent event not found")]
    ParentMissing,

    /// The server throttled the request; safe to retry later.
    #[error("rate limited")]
    RateLimited,

    /// The credential was rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// Network or server failure that may clear up on its own.
    #[error("transient API failure: {0}")]
    Transient(String),
}

/// Result alias for remote API calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// The slice of the calendar REST surface the sync engine replays mutations
/// against. Every call is scoped by the parent event id.
#[async_trait]
pub trait CalendarApi: Send + Sync {
    /// Post a chat message into an event's conversation.
    async fn send_message(&self, event_id: &str, message: &NewMessage) -> ApiResult<EventMessage>;

    /// Delete a chat message.
    async fn delete_message(&self, event_id: &str, message_id: &str) -> ApiResult<()>;

    /// Create a checklist item on an event.
    async fn create_checklist_item(
        &self,
        event_id: &str,
        item: &NewChecklistItem,
    ) -> ApiResult<ChecklistItem>;

    /// Apply a partial update to a checklist item.
    async fn update_checklist_item(
        &self,
        event_id: &str,
        item_id: &str,
        patch: &ChecklistItemPatch,
    ) -> ApiResult<ChecklistItem>;

    /// Delete a checklist item.
    async fn delete_checklist_item(&self, event_id: &str, item_id: &str) -> ApiResult<()>;
}

impl ApiError {
    /// Whether the failure should be retried without counting against the
    /// action's retry budget.
    pub fn is_deferrable(&self) -> bool {
        matches!(self, ApiError::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_deferrable() {
        assert!(ApiError::RateLimited.is_deferrable());
        assert!(!ApiError::TargetMissing.is_deferrable());
        assert!(!ApiError::Transient("500".into()).is_deferrable());
    }
}
