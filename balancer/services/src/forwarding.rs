//! Distributes a service's connections over its instances.
//!
//! Each forwarded service owns one classifier rule in the `mangle` table and one DNAT rule per
//! instance in the `nat` table:
//!
//! ```text
//! mangle: -p tcp -d 10.0.0.5 --dport 80 -j HMARK --hmark-mod 3 --hmark-offset 0x1000 ...
//! nat:    -p tcp -d 10.0.0.5 --dport 80 -m mark --mark 0x1000 -j DNAT --to-destination 10.0.0.10:8080
//! nat:    -p tcp -d 10.0.0.5 --dport 80 -m mark --mark 0x1001 -j DNAT --to-destination 10.0.0.11:8080
//! nat:    -p tcp -d 10.0.0.5 --dport 80 -m mark --mark 0x1002 -j DNAT --to-destination 10.0.0.12:8080
//! ```
//!
//! The classifier hashes each connection onto one of N marks and every instance owns a slot in
//! `0..N`. Because the mangle table is traversed before the nat table, instance rules work
//! regardless of their position in the chain, and an instance's rule only changes when its own
//! slot does. Instances keep their slot across updates while it remains in range, so adding or
//! removing an instance touches as few rules as possible.

use crate::{Context, Error};
use flux_balancer_core::{Protocol, RuleSpec, Service, Table};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
};

#[cfg(test)]
mod tests;

#[derive(Debug)]
pub(crate) struct Forwarding {
    service: String,
    classifier: Option<RuleSpec>,
    instances: BTreeMap<SocketAddr, Installed>,
}

/// A rule installed for an instance.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Installed {
    slot: u32,
    rule: RuleSpec,
}

/// The rules a service should have for a given set of instances.
#[derive(Debug)]
struct Target {
    proto: Protocol,
    addr: SocketAddr,
    endpoints: BTreeSet<SocketAddr>,
}

// === impl Forwarding ===

impl Forwarding {
    pub(crate) async fn start(ctx: &Context, svc: &Service, addr: SocketAddr) -> Result<Self, Error> {
        tracing::info!(service = %svc, "Forwarding service");
        let mut forwarding = Self {
            service: svc.name.clone(),
            classifier: None,
            instances: BTreeMap::new(),
        };
        forwarding.reconcile(ctx, Target::new(svc, addr)).await?;
        Ok(forwarding)
    }

    /// Reconciles the rules for `svc` if it should still be forwarded.
    pub(crate) async fn update(&mut self, ctx: &Context, svc: &Service) -> Result<bool, Error> {
        let Some(addr) = svc.socket_addr() else {
            return Ok(false);
        };
        if svc.instances.is_empty() {
            return Ok(false);
        }

        self.reconcile(ctx, Target::new(svc, addr)).await?;
        Ok(true)
    }

    pub(crate) async fn stop(self, ctx: &Context) {
        tracing::debug!(service = %self.service, instances = self.instances.len(), "Removing forwarding rules");
        if let Some(classifier) = self.classifier.as_ref() {
            ctx.remove(&self.service, Table::Mangle, classifier).await;
        }
        for Installed { rule, .. } in self.instances.values() {
            ctx.remove(&self.service, Table::Nat, rule).await;
        }
    }

    /// Brings the installed rules in line with `target`.
    ///
    /// New rules are installed before stale rules are removed. If an install fails, the rules
    /// installed by this call are removed again and the prior rules are left in place. Nothing is
    /// installed if the instances' marks would overflow.
    async fn reconcile(&mut self, ctx: &Context, target: Target) -> Result<(), Error> {
        let slots = assign_slots(&self.instances, &target.endpoints);
        let count = u32::try_from(slots.len()).unwrap_or(u32::MAX);
        // Every slot is below `count`, so each instance's mark lies within `marks`.
        let marks = ctx.net.marks(count)?;

        let mut added = Vec::new();
        for (endpoint, slot) in slots.iter() {
            let rule = instance_rule(&target, marks.start + slot, *endpoint);
            if self.instances.get(endpoint).map(|i| &i.rule) == Some(&rule) {
                continue;
            }
            tracing::debug!(service = %self.service, %endpoint, slot, "Adding instance");
            if let Err(error) = ctx.install(Table::Nat, &rule).await {
                self.rollback(ctx, added).await;
                return Err(error);
            }
            added.push((*endpoint, Installed { slot: *slot, rule }));
        }

        let classifier = classifier_rule(&target, count, ctx);
        if self.classifier.as_ref() != Some(&classifier) {
            if let Err(error) = ctx.install(Table::Mangle, &classifier).await {
                self.rollback(ctx, added).await;
                return Err(error);
            }
            if let Some(prior) = self.classifier.replace(classifier) {
                ctx.remove(&self.service, Table::Mangle, &prior).await;
            }
        }

        let mut stale = Vec::new();
        for (endpoint, installed) in added {
            if let Some(prior) = self.instances.insert(endpoint, installed) {
                stale.push(prior.rule);
            }
        }
        self.instances.retain(|endpoint, installed| {
            if slots.contains_key(endpoint) {
                return true;
            }
            tracing::debug!(%endpoint, "Removing instance");
            stale.push(installed.rule.clone());
            false
        });
        for rule in stale.iter() {
            ctx.remove(&self.service, Table::Nat, rule).await;
        }

        Ok(())
    }

    async fn rollback(&self, ctx: &Context, added: Vec<(SocketAddr, Installed)>) {
        for (_, Installed { rule, .. }) in added {
            ctx.remove(&self.service, Table::Nat, &rule).await;
        }
    }

    #[cfg(test)]
    fn slots(&self) -> BTreeMap<SocketAddr, u32> {
        self.instances
            .iter()
            .map(|(endpoint, installed)| (*endpoint, installed.slot))
            .collect()
    }
}

// === impl Target ===

impl Target {
    fn new(svc: &Service, addr: SocketAddr) -> Self {
        let endpoints = svc
            .instances
            .iter()
            .map(|instance| instance.socket_addr())
            .collect();
        Self {
            proto: svc.protocol,
            addr,
            endpoints,
        }
    }

    fn matching(&self) -> RuleSpec {
        RuleSpec::destination(self.proto, self.addr.ip(), self.addr.port())
    }
}

/// Assigns each endpoint a slot in `0..endpoints.len()`.
///
/// Endpoints that already hold a slot keep it while it remains in range. The remaining slots are
/// handed out in endpoint order.
fn assign_slots(
    current: &BTreeMap<SocketAddr, Installed>,
    endpoints: &BTreeSet<SocketAddr>,
) -> BTreeMap<SocketAddr, u32> {
    let count = endpoints.len() as u32;
    let mut slots = BTreeMap::new();
    let mut taken = BTreeSet::new();
    for endpoint in endpoints {
        if let Some(Installed { slot, .. }) = current.get(endpoint) {
            if *slot < count && taken.insert(*slot) {
                slots.insert(*endpoint, *slot);
            }
        }
    }

    let mut free = (0..count).filter(|slot| !taken.contains(slot));
    for endpoint in endpoints {
        if slots.contains_key(endpoint) {
            continue;
        }
        if let Some(slot) = free.next() {
            slots.insert(*endpoint, slot);
        }
    }
    slots
}

fn classifier_rule(target: &Target, count: u32, ctx: &Context) -> RuleSpec {
    target
        .matching()
        .arg("-j")
        .arg("HMARK")
        .arg("--hmark-tuple")
        .arg("src,sport,dst,dport")
        .arg("--hmark-mod")
        .arg(count)
        .arg("--hmark-offset")
        .arg(format!("{:#x}", ctx.net.mark_base))
        .arg("--hmark-rnd")
        .arg(format!("{:#x}", ctx.net.hash_seed))
}

fn instance_rule(target: &Target, mark: u32, endpoint: SocketAddr) -> RuleSpec {
    target
        .matching()
        .arg("-m")
        .arg("mark")
        .arg("--mark")
        .arg(format!("{mark:#x}"))
        .arg("-j")
        .arg("DNAT")
        .arg("--to-destination")
        .arg(endpoint)
}
