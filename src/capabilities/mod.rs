//! External collaborators, specified at their interface boundary: the
//! durable key-value store and the authenticated remote API client. The
//! desktop shell supplies the concrete implementations.

pub mod api;
pub mod kv;
