//! The glue invoked per RPC: registry lookup, first-frame extraction,
//! routing, transaction setup, fan-out parameters and post-RPC bookkeeping,
//! plus the handlers for the RPCs the proxy serves itself.

mod admin;
mod director;
mod service;
mod status;

pub use admin::AdminHandlers;
pub use director::{Directed, StreamDirector};
pub use service::ProxyService;
pub use status::{datastore_status, election_status, router_status};
