//! Shared domain types and the remote API contract for the Tandem client.
//!
//! This crate is deliberately small: it holds the data shapes that travel
//! over the realtime channel and through the offline queue, plus the
//! [`CalendarApi`] trait the sync engine drives. The REST implementation of
//! that trait lives with the rest of the HTTP plumbing, outside this
//! workspace's scope.

mod api;
mod types;

pub use api::{ApiError, ApiResult, CalendarApi};
pub use types::{
    ChecklistItem, ChecklistItemPatch, EventMessage, NewChecklistItem, NewMessage,
};
