//! Core types shared by the flux balancer.
//!
//! The balancer watches a stream of [`ServiceUpdate`]s and maintains host firewall rules so that
//! traffic addressed to each service is rejected or forwarded to the service's instances. This
//! crate holds the model of a service as it is published by the registry, the description of an
//! individual firewall rule ([`RuleSpec`]), and the [`RuleTable`] capability through which rules
//! are installed and removed.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error_sink;
pub mod mem;
pub mod rules;
mod service;

pub use self::{
    error_sink::ErrorSink,
    rules::{Family, RuleSpec, RuleTable, Table},
    service::{Instance, Protocol, Service, ServiceUpdate},
};

/// The group assigned to instances that are registered without one.
pub const DEFAULT_GROUP: &str = "default";
