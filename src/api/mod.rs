//! HTTP Surface
//!
//! Client-facing `/sql` and `/join`, observability routes, and the
//! cluster-internal consensus transport, all on the node's one listener.

mod http;

pub use http::{router, AppState};
