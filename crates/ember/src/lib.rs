//! Ember Library
//!
//! Keeps Spark sessions moving through their lifecycle: queued sessions are
//! launched, running ones are classified busy or idle, stale ones are killed
//! and a permanent session is kept alive. Several replicas may run side by
//! side; named leases make sure each duty runs on one of them at a time.

pub mod backend;
pub mod db;
pub mod lock;
pub mod reconcile;
pub mod session;
pub mod statement;
pub mod status;
