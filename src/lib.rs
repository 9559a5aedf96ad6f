//! Tracks AI-agent coding sessions (codex, claude, ...) across the
//! projects a host application has open.
//!
//! The host supplies the integration seams — [`source::SessionSource`]
//! per provider, a [`source::ProjectCatalog`], a [`source::RefreshGate`]
//! and a [`source::TabRegistry`] — and the [`coordinator::Coordinator`]
//! keeps a [`store::StateStore`] snapshot up to date: coalesced full
//! refreshes, debounced provider-change refreshes behind the gate,
//! archive suppression, pending-tab rebinding, and on-demand loads for
//! closed projects.

pub mod coordinator;
mod loader;
pub mod matcher;
pub mod model;
mod previews;
mod queue;
pub mod source;
pub mod store;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use store::StateStore;
