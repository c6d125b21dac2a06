use flux_balancer_core::{RuleSpec, Table};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A rule could not be installed. The change that required it has not been applied.
    #[error("failed to add {table} rule `{rule}`")]
    Install {
        table: Table,
        rule: RuleSpec,
        #[source]
        source: anyhow::Error,
    },

    /// A rule could not be removed and may have been left behind.
    #[error("failed to delete {table} rule `{rule}`")]
    Remove {
        table: Table,
        rule: RuleSpec,
        #[source]
        source: anyhow::Error,
    },

    /// A service has more instances than there are marks above the configured base.
    #[error("{count} instance marks do not fit above {base:#x}")]
    MarkRange { base: u32, count: u32 },
}
