//! Shared API types for the piccolo daemon.
//!
//! This crate defines the declarative application specification that the
//! daemon reconciles against, together with the strict validation rules that
//! every spec revision must pass before any port is allocated or any
//! container process is launched. Keeping the types in their own crate lets
//! external callers (the admin API, CLIs, tests) construct and validate
//! specs without linking the daemon.

mod spec;
mod validate;

pub use spec::{
    AppSpec, Flow, InternetAccess, Listener, Middleware, NetworkPermissions, Permissions,
    Protocol, Resources, VolumeMount,
};
pub use validate::ValidateError;
