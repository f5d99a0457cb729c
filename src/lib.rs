// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod handoff;
pub mod history;
pub mod intent;
pub mod llm;
pub mod msg_analyzer;
pub mod notify;
pub mod query_handler;
pub mod retrieval;
pub mod sentiment;
pub mod session;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::config::ChatConfig;
pub use crate::container::ServiceContainer;
pub use crate::error::ChatError;
pub use crate::query_handler::QueryHandler;
