use crate::{state::ServiceState, Context, Disposition, Error};
use flux_balancer_core::Service;

/// Manages the rules for a single named service.
#[derive(Debug)]
pub struct ServiceController {
    name: String,
    ctx: Context,
    state: ServiceState,
}

impl ServiceController {
    /// Starts managing `svc`, installing whatever rules its definition calls for.
    pub async fn start(ctx: Context, svc: &Service) -> Result<Self, Error> {
        let state = ServiceState::start(&ctx, svc).await?;
        ctx.metrics.transition(state.disposition());
        Ok(Self {
            name: svc.name.clone(),
            ctx,
            state,
        })
    }

    /// Applies a new definition of the service.
    ///
    /// If the definition can't be applied, the error is returned and the rules for the prior
    /// definition are left in place.
    pub async fn update(&mut self, svc: &Service) -> Result<(), Error> {
        if self.state.update(&self.ctx, svc).await? {
            tracing::debug!(service = %svc, disposition = ?self.state.disposition(), "Updated in place");
            return Ok(());
        }

        // The new state's rules must be in place before the prior state's are removed.
        let next = ServiceState::start(&self.ctx, svc).await?;
        self.ctx.metrics.transition(next.disposition());
        let prior = std::mem::replace(&mut self.state, next);
        tracing::debug!(
            service = %self.name,
            from = ?prior.disposition(),
            to = ?self.state.disposition(),
            "Transitioned",
        );
        prior.stop(&self.ctx).await;
        Ok(())
    }

    /// Removes all of the service's rules.
    pub async fn close(self) {
        tracing::debug!(service = %self.name, "Closing");
        self.state.stop(&self.ctx).await;
    }

    pub fn disposition(&self) -> Disposition {
        self.state.disposition()
    }
}
