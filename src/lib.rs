//! # Document Provider
//!
//! Multi-tenant job orchestration for services that mirror documents from an
//! external account (a file host, a mailbox, a calendar) into a downstream
//! document API.
//!
//! Every connected account owns a token record and a durable job queue. An
//! update request locks the token, enqueues an update job and makes sure a
//! pool of isolated worker processes serves the account. Inside a worker the
//! update cycle asks the integrator's delta generator for what changed since
//! the stored cursor, turns the pushed items into task jobs (capped per
//! sub-queue) and finalizes the token once every write has landed. Task jobs
//! then deliver or delete documents through the integrator's task workers.
//! The pool drains itself once every worker reports idle.
//!
//! ## Key Features
//!
//! - **Process isolation**: integrator code runs in worker processes that are
//!   respawned transparently when they crash
//! - **One pool per account**: a registry keyed by access token
//! - **Crash-safe locking**: abandoned update locks are detected by age
//! - **Credential awareness**: credential failures flag the token for a
//!   refresh instead of retrying
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use document_provider::builders::ProviderBuilder;
//! use document_provider::config::ProviderConfig;
//! use document_provider::core::Integration;
//! use document_provider::runtime::{TokioSpawner, UpdateRequest};
//!
//! let integration = Integration::new(MyDelta).with_worker("additions", Upload);
//! let service = ProviderBuilder::new(ProviderConfig::from_env()?)
//!     .with_in_process_workers(integration)
//!     .build(TokioSpawner::current())?;
//!
//! service
//!     .schedule_update(UpdateRequest {
//!         access_token: "token".into(),
//!         documents_per_update: Some(2500),
//!         ..UpdateRequest::default()
//!     })
//!     .await?;
//! ```
//!
//! Out-of-process workers are integrator binaries whose `main` builds a host
//! with [`builders::worker_host_from_env`] (or [`builders::build_worker_host`])
//! and returns [`runtime::WorkerHost::serve_stdio`].

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Tokens, jobs, queues, update cycles and worker pools.
pub mod core;
/// Configuration models for account pools, queues, caches and workers.
pub mod config;
/// Builders to assemble the provider from configuration.
pub mod builders;
/// In-memory durable queue and token stores.
pub mod infra;
/// Worker launchers, the worker host and the handler surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
