//! Client-side data access for the Apphive server.
//!
//! Queries read GET endpoints through a cache shared by a [`ServerContext`],
//! keyed by path, search params and signed-in user. A query can name the
//! model records its data comes from; the server announces changes to those
//! records on a realtime channel and the query refetches itself.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod listener;
pub mod logging;
pub mod query;
pub mod realtime;
pub mod retry;
pub mod server;

pub use context::{ServerContext, ServerContextBuilder};
pub use error::{Error, Result};
pub use listener::{Identifier, ModelPropRef, UpdateListener};
pub use query::{QueryOptions, QueryResult, QueryState, SuspenseQuery};
pub use retry::RetryPolicy;
pub use server::{ServerClient, ServerError};
