//! Flux balancer service controller
//!
//! The controller consumes a stream of service updates and keeps the host's rule tables in line
//! with the most recent definition of each service:
//!
//! - A service without an address or port is not forwarded; no rules are installed for it.
//! - A service with an address and port but no instances is rejected with a `filter` rule.
//! - A service with instances is forwarded: connections are hash-marked in the `mangle` table and
//!   DNAT'd to the instance that owns the mark in the `nat` table.
//!
//! ```text
//! [ ServiceUpdate ] -> [ ServiceSet ] -> [ ServiceController ] -> [ ServiceState ] -> [ RuleTable ]
//! ```
//!
//! Each service is handled by a [`ServiceController`], which holds exactly one live
//! [`Disposition`]. When a service moves between dispositions, the rules for the new disposition
//! are installed before the rules for the old one are removed, so there is never a moment at
//! which a handled service has no rule at all.
//!
//! All controllers are owned by a single task spawned by [`ServiceSet`]; rule-table calls for all
//! services are made from that task, one at a time.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod context;
mod controller;
mod error;
mod forwarding;
mod metrics;
mod set;
mod state;


pub use self::{
    context::{Context, NetConfig},
    controller::ServiceController,
    error::Error,
    metrics::ServiceMetrics,
    set::{Config, ServiceSet},
    state::Disposition,
};
