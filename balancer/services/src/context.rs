use crate::{Error, ServiceMetrics};
use flux_balancer_core::{ErrorSink, RuleSpec, RuleTable, Table};
use std::sync::Arc;

/// Parameters of the host network that shape the forwarding rules.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NetConfig {
    /// The first packet mark assigned to instances. A service with N instances uses the marks
    /// `mark_base..mark_base + N`.
    pub mark_base: u32,

    /// Seeds the connection hash that picks an instance.
    pub hash_seed: u32,
}

/// Shared handles used by every service controller.
#[derive(Clone)]
pub struct Context {
    rules: Arc<dyn RuleTable>,
    pub(crate) net: NetConfig,
    pub(crate) errors: ErrorSink,
    pub(crate) metrics: ServiceMetrics,
}

// === impl NetConfig ===

impl NetConfig {
    /// The number of instance marks that must fit above `mark_base` for a configuration to be
    /// accepted.
    pub const MAX_INSTANCES: u32 = 1 << 16;

    /// Fails if `MAX_INSTANCES` marks don't fit between `mark_base` and `u32::MAX`.
    pub fn validate(&self) -> Result<(), Error> {
        self.marks(Self::MAX_INSTANCES).map(|_| ())
    }

    /// Returns the marks `mark_base..mark_base + count`, if they don't overflow.
    pub(crate) fn marks(&self, count: u32) -> Result<std::ops::Range<u32>, Error> {
        self.mark_base
            .checked_add(count)
            .map(|end| self.mark_base..end)
            .ok_or(Error::MarkRange {
                base: self.mark_base,
                count,
            })
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            mark_base: 0x1000,
            hash_seed: 0xf1ec,
        }
    }
}

// === impl Context ===

impl Context {
    pub fn new(
        rules: Arc<dyn RuleTable>,
        net: NetConfig,
        errors: ErrorSink,
        metrics: ServiceMetrics,
    ) -> Self {
        Self {
            rules,
            net,
            errors,
            metrics,
        }
    }

    pub(crate) async fn install(&self, table: Table, rule: &RuleSpec) -> Result<(), Error> {
        let res = self.rules.add_rule(table, rule).await;
        self.metrics.rule_op(table, "add", res.is_ok());
        res.map_err(|source| Error::Install {
            table,
            rule: rule.clone(),
            source,
        })
    }

    /// Removes a rule, reporting failures to the error sink rather than to the caller.
    pub(crate) async fn remove(&self, service: &str, table: Table, rule: &RuleSpec) {
        let res = self.rules.delete_rule(table, rule).await;
        self.metrics.rule_op(table, "delete", res.is_ok());
        if let Err(source) = res {
            let error = Error::Remove {
                table,
                rule: rule.clone(),
                source,
            };
            self.errors
                .post(anyhow::Error::new(error).context(format!("service {service}")));
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("net", &self.net)
            .finish_non_exhaustive()
    }
}
