//! A [`RuleTable`] backed by the `iptables` and `ip6tables` commands.
//!
//! All rules are appended to a single balancer-owned chain in each table. [`Iptables::setup`]
//! creates that chain and jumps to it from the built-in chains that see service traffic:
//!
//! ```text
//! filter: INPUT, FORWARD, OUTPUT -> FLUX   (reject rules)
//! nat:    PREROUTING, OUTPUT      -> FLUX   (DNAT rules)
//! mangle: PREROUTING, OUTPUT      -> FLUX   (HMARK classifiers)
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use flux_balancer_core::{Family, RuleSpec, RuleTable, Table};
use std::{ffi::OsString, process::ExitStatus};
use tokio::process::Command;


pub const DEFAULT_CHAIN: &str = "FLUX";

#[derive(Clone, Debug)]
pub struct Iptables {
    chain: String,
    iptables: OsString,
    ip6tables: Option<OsString>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to run {program:?}")]
    Spawn {
        program: OsString,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("IPv6 rules are not enabled")]
    Ipv6Disabled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Op {
    Append,
    Delete,
}

// === impl Iptables ===

impl Iptables {
    pub fn new(chain: impl ToString) -> Self {
        Self {
            chain: chain.to_string(),
            iptables: "iptables".into(),
            ip6tables: None,
        }
    }

    /// Overrides the command used for IPv4 rules.
    pub fn with_iptables(mut self, program: impl Into<OsString>) -> Self {
        self.iptables = program.into();
        self
    }

    /// Enables IPv6 rules, managed with the given command.
    pub fn with_ip6tables(mut self, program: impl Into<OsString>) -> Self {
        self.ip6tables = Some(program.into());
        self
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Creates (or flushes) the balancer's chain in every table and hooks it into the built-in
    /// chains.
    pub async fn setup(&self) -> Result<(), Error> {
        for family in self.families() {
            for table in Table::ALL {
                match self.run(family, self.chain_args(table, "-N")).await {
                    Ok(()) => tracing::debug!(?family, %table, chain = %self.chain, "Created chain"),
                    Err(Error::Failed { stderr, .. }) if stderr.contains("already exists") => {
                        tracing::debug!(?family, %table, chain = %self.chain, "Flushing existing chain");
                        self.run(family, self.chain_args(table, "-F")).await?;
                    }
                    Err(error) => return Err(error),
                }

                for builtin in hooks(table) {
                    let check = self.hook_args(table, "-C", builtin);
                    if self.run(family, check).await.is_ok() {
                        continue;
                    }
                    self.run(family, self.hook_args(table, "-I", builtin)).await?;
                }
            }
        }
        tracing::info!(chain = %self.chain, "Chains ready");
        Ok(())
    }

    /// Unhooks, flushes and deletes the balancer's chains. Failures are logged and otherwise
    /// ignored so that as much as possible is removed.
    pub async fn cleanup(&self) {
        for family in self.families() {
            for table in Table::ALL {
                for builtin in hooks(table) {
                    let args = self.hook_args(table, "-D", builtin);
                    if let Err(error) = self.run(family, args).await {
                        tracing::warn!(?family, %table, builtin, %error, "Failed to unhook chain");
                    }
                }
                for op in ["-F", "-X"] {
                    if let Err(error) = self.run(family, self.chain_args(table, op)).await {
                        tracing::warn!(?family, %table, %error, "Failed to remove chain");
                    }
                }
            }
        }
    }

    fn families(&self) -> Vec<Family> {
        let mut families = vec![Family::Ipv4];
        if self.ip6tables.is_some() {
            families.push(Family::Ipv6);
        }
        families
    }

    fn chain_args(&self, table: Table, op: &str) -> Vec<String> {
        vec![
            "-t".to_string(),
            table.to_string(),
            op.to_string(),
            self.chain.clone(),
        ]
    }

    fn hook_args(&self, table: Table, op: &str, builtin: &str) -> Vec<String> {
        vec![
            "-t".to_string(),
            table.to_string(),
            op.to_string(),
            builtin.to_string(),
            "-j".to_string(),
            self.chain.clone(),
        ]
    }

    fn rule_args(&self, table: Table, op: Op, rule: &RuleSpec) -> Vec<String> {
        let op = match op {
            Op::Append => "-A",
            Op::Delete => "-D",
        };
        let mut args = self.chain_args(table, op);
        args.extend(rule.args().iter().cloned());
        args
    }

    async fn run(&self, family: Family, args: Vec<String>) -> Result<(), Error> {
        let program = match family {
            Family::Ipv4 => &self.iptables,
            Family::Ipv6 => self.ip6tables.as_ref().ok_or(Error::Ipv6Disabled)?,
        };

        // Wait for the xtables lock rather than failing when another process holds it.
        let output = Command::new(program)
            .arg("-w")
            .args(&args)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                program: program.clone(),
                source,
            })?;
        if output.status.success() {
            return Ok(());
        }

        Err(Error::Failed {
            command: format!("{} -w {}", program.to_string_lossy(), args.join(" ")),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait::async_trait]
impl RuleTable for Iptables {
    async fn add_rule(&self, table: Table, rule: &RuleSpec) -> anyhow::Result<()> {
        let args = self.rule_args(table, Op::Append, rule);
        self.run(rule.family(), args).await?;
        Ok(())
    }

    async fn delete_rule(&self, table: Table, rule: &RuleSpec) -> anyhow::Result<()> {
        let args = self.rule_args(table, Op::Delete, rule);
        self.run(rule.family(), args).await?;
        Ok(())
    }
}

/// The built-in chains from which the balancer's chain is reached in each table. Locally
/// originated traffic is covered by OUTPUT in every table.
fn hooks(table: Table) -> &'static [&'static str] {
    match table {
        Table::Filter => &["INPUT", "FORWARD", "OUTPUT"],
        Table::Nat | Table::Mangle => &["PREROUTING", "OUTPUT"],
    }
}
