//! Apphive server API: requests and the error wire format.

mod errors;
mod request;
mod types;

pub use errors::{ServerError, ERRORS_ID};
pub use request::{
  classify_error, EnvToken, SearchParams, ServerClient, StaticToken, TokenProvider, AUTH_HEADER,
};
pub use types::NamedId;
