use crate::{forwarding::Forwarding, Context, Error};
use flux_balancer_core::{Protocol, RuleSpec, Service, Table};
use std::net::SocketAddr;

/// How traffic addressed to a service is handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// The service has no address or port; nothing is installed.
    NotForwarding,

    /// The service has an address and port but no instances; connections are rejected.
    Rejecting,

    /// Connections are distributed over the service's instances.
    Forwarding,
}

/// The live state of a single service. Each variant owns the rules it installed.
#[derive(Debug)]
pub(crate) enum ServiceState {
    NotForwarding,
    Rejecting(Rejecting),
    Forwarding(Forwarding),
}

#[derive(Debug)]
pub(crate) struct Rejecting {
    service: String,
    rule: RuleSpec,
}

// === impl Disposition ===

impl Disposition {
    /// Determines the disposition a service definition calls for.
    pub fn of(svc: &Service) -> Self {
        if !svc.should_forward() {
            Self::NotForwarding
        } else if svc.instances.is_empty() {
            Self::Rejecting
        } else {
            Self::Forwarding
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotForwarding => "not_forwarding",
            Self::Rejecting => "rejecting",
            Self::Forwarding => "forwarding",
        }
    }
}

// === impl ServiceState ===

impl ServiceState {
    /// Builds the state called for by `svc`, installing its rules.
    ///
    /// Nothing is left installed if this fails.
    pub(crate) async fn start(ctx: &Context, svc: &Service) -> Result<Self, Error> {
        let addr = match (Disposition::of(svc), svc.socket_addr()) {
            (Disposition::NotForwarding, _) | (_, None) => {
                tracing::debug!(service = %svc, "Not forwarding service");
                return Ok(Self::NotForwarding);
            }
            (_, Some(addr)) => addr,
        };

        if svc.instances.is_empty() {
            let rejecting = Rejecting::start(ctx, svc, addr).await?;
            return Ok(Self::Rejecting(rejecting));
        }

        let forwarding = Forwarding::start(ctx, svc, addr).await?;
        Ok(Self::Forwarding(forwarding))
    }

    /// Applies `svc` without leaving the current disposition, if possible.
    ///
    /// Returns false if the service calls for a different state, in which case nothing has been
    /// changed.
    pub(crate) async fn update(&mut self, ctx: &Context, svc: &Service) -> Result<bool, Error> {
        match self {
            Self::NotForwarding => Ok(!svc.should_forward()),
            Self::Rejecting(rejecting) => Ok(rejecting.handles(svc)),
            Self::Forwarding(forwarding) => forwarding.update(ctx, svc).await,
        }
    }

    /// Removes every rule owned by this state.
    pub(crate) async fn stop(self, ctx: &Context) {
        match self {
            Self::NotForwarding => {}
            Self::Rejecting(rejecting) => rejecting.stop(ctx).await,
            Self::Forwarding(forwarding) => forwarding.stop(ctx).await,
        }
    }

    pub(crate) fn disposition(&self) -> Disposition {
        match self {
            Self::NotForwarding => Disposition::NotForwarding,
            Self::Rejecting(_) => Disposition::Rejecting,
            Self::Forwarding(_) => Disposition::Forwarding,
        }
    }
}

// === impl Rejecting ===

impl Rejecting {
    async fn start(ctx: &Context, svc: &Service, addr: SocketAddr) -> Result<Self, Error> {
        tracing::info!(service = %svc, "Rejecting service");
        let rule = reject_rule(svc.protocol, addr);
        ctx.install(Table::Filter, &rule).await?;
        Ok(Self {
            service: svc.name.clone(),
            rule,
        })
    }

    /// A rejecting service stays put while it has no instances and its reject rule would be
    /// unchanged. If the address or port moved, a new `Rejecting` state is started so that the
    /// new rule is in place before the old one goes away.
    fn handles(&self, svc: &Service) -> bool {
        match svc.socket_addr() {
            Some(addr) if svc.instances.is_empty() => reject_rule(svc.protocol, addr) == self.rule,
            _ => false,
        }
    }

    async fn stop(self, ctx: &Context) {
        tracing::debug!(service = %self.service, "Removing reject rule");
        ctx.remove(&self.service, Table::Filter, &self.rule).await;
    }
}

fn reject_rule(proto: Protocol, addr: SocketAddr) -> RuleSpec {
    RuleSpec::destination(proto, addr.ip(), addr.port())
        .arg("-j")
        .arg("REJECT")
}
