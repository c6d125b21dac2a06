use crate::Disposition;
use flux_balancer_core::Table;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ServiceMetrics {
    updates: Family<UpdateLabels, Counter>,
    update_errors: Counter,
    transitions: Family<TransitionLabels, Counter>,
    rule_ops: Family<RuleLabels, Counter>,
    services: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct UpdateLabels {
    op: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TransitionLabels {
    to: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RuleLabels {
    table: &'static str,
    op: &'static str,
    result: &'static str,
}

// === impl ServiceMetrics ===

impl ServiceMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let updates = Family::default();
        prom.register(
            "updates",
            "Count of service updates processed",
            updates.clone(),
        );

        let update_errors = Counter::default();
        prom.register(
            "update_errors",
            "Count of service updates that could not be applied",
            update_errors.clone(),
        );

        let transitions = Family::default();
        prom.register(
            "transitions",
            "Count of services entering each disposition",
            transitions.clone(),
        );

        let rule_ops = Family::default();
        prom.register(
            "rule_ops",
            "Count of rule table operations",
            rule_ops.clone(),
        );

        let services = Gauge::default();
        prom.register(
            "services",
            "Gauge of the number of services being managed",
            services.clone(),
        );

        Self {
            updates,
            update_errors,
            transitions,
            rule_ops,
            services,
        }
    }

    pub(crate) fn update(&self, op: &'static str) {
        self.updates.get_or_create(&UpdateLabels { op }).inc();
    }

    pub(crate) fn update_error(&self) {
        self.update_errors.inc();
    }

    pub(crate) fn transition(&self, to: Disposition) {
        self.transitions
            .get_or_create(&TransitionLabels { to: to.as_str() })
            .inc();
    }

    pub(crate) fn rule_op(&self, table: Table, op: &'static str, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.rule_ops
            .get_or_create(&RuleLabels {
                table: table.as_str(),
                op,
                result,
            })
            .inc();
    }

    pub(crate) fn set_services(&self, count: usize) {
        self.services.set(count as i64);
    }
}
