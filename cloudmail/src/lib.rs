//! cloudmail: admin console for disposable addresses on Cloudflare Email Routing
//!
//! Every disposable address is a forwarding rule in a Cloudflare zone that delivers to one
//! collecting IMAP mailbox. The console provisions those rules, pulls the collected mail into
//! SQLite and lets admins and account holders read it through a web UI or a JSON API.
//!
//! # Example
//!
//! ```no_run
//! use cloudmail::config::{Config, ConfigHandle};
//! use cloudmail::store::Database;
//!
//! #[tokio::main]
//! async fn main() -> cloudmail::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let db = Database::connect(&config.storage.database_url).await?;
//!     db.init_db().await?;
//!
//!     let handle = ConfigHandle::new(config, None);
//!     println!("{} domains configured", handle.snapshot().await.domains().len());
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: YAML configuration and the shared live handle
//! - [`store`]: accounts, emails, attachments and the activity log
//! - [`cloudflare`]: Email Routing client and the account sync
//! - [`ingest`]: IMAP fetch pipeline, job progress and scheduling
//! - [`generator`]: random usernames, names and passwords
//! - [`auth`]: login checks, login limiting, JWTs and sessions
//! - [`api`]: HTTP routers for the API and the console

pub mod api;
pub mod auth;
pub mod cloudflare;
pub mod config;
pub mod error;
pub mod generator;
pub mod ingest;
pub mod store;

// Re-export commonly used types
pub use config::{Config, ConfigHandle};
pub use error::{CloudMailError, Result};
