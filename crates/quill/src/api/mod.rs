//! HTTP API module.
//!
//! Routes, handlers, and the error envelope for the chat backend.

mod error;
pub mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
