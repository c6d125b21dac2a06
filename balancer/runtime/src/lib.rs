#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use flux_balancer_core as core;
pub use flux_balancer_iptables as iptables;
pub use flux_balancer_services as services;

mod args;
pub mod source;

pub use self::args::Args;
