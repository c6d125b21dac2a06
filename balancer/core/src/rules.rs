use anyhow::Result;
use std::{fmt, net::IpAddr};

/// The tables in which the balancer installs rules.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
}

/// The address family a rule applies to.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Family {
    #[default]
    Ipv4,
    Ipv6,
}

/// An individual firewall rule, expressed as the ordered list of match and target arguments that
/// follow the chain name.
///
/// The exact syntax is a property of the driver. The balancer only relies on rules being
/// comparable, so that an unchanged rule is never reinstalled.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RuleSpec {
    family: Family,
    args: Vec<String>,
}

/// Installs and removes rules in the host's rule tables.
///
/// Calls are made one at a time from a single task, so implementations need not guard against
/// concurrent modification by the balancer itself.
#[async_trait::async_trait]
pub trait RuleTable: Send + Sync {
    async fn add_rule(&self, table: Table, rule: &RuleSpec) -> Result<()>;

    async fn delete_rule(&self, table: Table, rule: &RuleSpec) -> Result<()>;
}

// === impl Table ===

impl Table {
    pub const ALL: [Table; 3] = [Table::Filter, Table::Nat, Table::Mangle];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
            Self::Mangle => "mangle",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Family ===

impl From<IpAddr> for Family {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

// === impl RuleSpec ===

impl RuleSpec {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            args: Vec::new(),
        }
    }

    /// Starts a rule matching traffic addressed to `ip:port` over `proto`.
    pub fn destination(proto: crate::Protocol, ip: IpAddr, port: u16) -> Self {
        Self::new(ip.into())
            .arg("-p")
            .arg(proto)
            .arg("-d")
            .arg(ip)
            .arg("--dport")
            .arg(port)
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut args = self.args.iter();
        if let Some(arg) = args.next() {
            f.write_str(arg)?;
        }
        for arg in args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
