//! HTTP layer: the JSON API under `/api` and the server-rendered console

pub mod accounts;
pub mod emails;
pub mod handlers;
pub mod server;
pub mod web;

pub use handlers::{ApiError, AppState};
pub use server::ApiServer;
