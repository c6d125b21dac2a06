use crate::{Context, NetConfig, ServiceController, ServiceMetrics};
use ahash::AHashMap as HashMap;
use flux_balancer_core::{ErrorSink, RuleTable, Service, ServiceUpdate};
use std::{collections::hash_map::Entry, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info_span, Instrument};

/// Configures a [`ServiceSet`].
pub struct Config {
    pub rules: Arc<dyn RuleTable>,
    pub net: NetConfig,
    pub updates: mpsc::Receiver<ServiceUpdate>,
    pub errors: ErrorSink,
    pub metrics: ServiceMetrics,

    /// If set, notified each time an update has been processed.
    pub processed: Option<mpsc::Sender<()>>,
}

/// Owns the controllers for every known service.
///
/// Updates are processed by a single background task that has exclusive ownership of the
/// controllers. The task runs until [`ServiceSet::close`] is called.
pub struct ServiceSet {
    // Held for the whole of `close`, so concurrent callers wait for teardown to finish.
    phase: Mutex<Phase>,
}

enum Phase {
    Running {
        signal: drain::Signal,
        task: JoinHandle<Services>,
    },
    Closed,
}

type Services = HashMap<String, ServiceController>;

struct Runner {
    ctx: Context,
    updates: mpsc::Receiver<ServiceUpdate>,
    processed: Option<mpsc::Sender<()>>,
    services: Services,
}

// === impl Config ===

impl Config {
    /// Spawns the task that processes updates.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> ServiceSet {
        let Self {
            rules,
            net,
            updates,
            errors,
            metrics,
            processed,
        } = self;

        let runner = Runner {
            ctx: Context::new(rules, net, errors, metrics),
            updates,
            processed,
            services: HashMap::new(),
        };
        let (signal, watch) = drain::channel();
        let task = tokio::spawn(runner.run(watch).instrument(info_span!("services")));

        ServiceSet {
            phase: Mutex::new(Phase::Running { signal, task }),
        }
    }
}

// === impl ServiceSet ===

impl ServiceSet {
    /// Stops processing updates and removes the rules of every remaining service.
    ///
    /// An update that arrives concurrently with the call may or may not be applied before the
    /// set shuts down. Calls made while another is in progress return once it has finished; later
    /// calls have no effect.
    pub async fn close(&self) {
        let mut phase = self.phase.lock().await;
        let (signal, task) = match std::mem::replace(&mut *phase, Phase::Closed) {
            Phase::Running { signal, task } => (signal, task),
            Phase::Closed => return,
        };

        signal.drain().await;
        match task.await {
            Ok(services) => {
                tracing::debug!(services = services.len(), "Closing services");
                for (_, svc) in services {
                    svc.close().await;
                }
            }
            Err(error) => tracing::error!(
                %error,
                "Service task failed; rules for its services were left installed"
            ),
        }
        drop(phase);
    }

    /// Returns true once [`ServiceSet::close`] has completed.
    pub fn is_closed(&self) -> bool {
        self.phase
            .try_lock()
            .map_or(false, |phase| matches!(*phase, Phase::Closed))
    }
}

// === impl Runner ===

impl Runner {
    async fn run(mut self, watch: drain::Watch) -> Services {
        let shutdown = watch.signaled();
        tokio::pin!(shutdown);

        let mut updates_open = true;
        loop {
            let update = tokio::select! {
                _release = &mut shutdown => return self.services,
                update = self.updates.recv(), if updates_open => update,
            };
            let Some(update) = update else {
                tracing::info!("Update stream closed; waiting for shutdown");
                updates_open = false;
                continue;
            };

            self.process(update).await;

            // Notify the caller that an update was processed. The caller may be slow to receive,
            // so shutdown is still honored while waiting.
            if let Some(tx) = self.processed.take() {
                let sent = tokio::select! {
                    res = tx.send(()) => res.is_ok(),
                    _release = &mut shutdown => return self.services,
                };
                if sent {
                    self.processed = Some(tx);
                } else {
                    tracing::debug!("Update notifications are no longer being received");
                }
            }
        }
    }

    async fn process(&mut self, update: ServiceUpdate) {
        match update {
            ServiceUpdate::Apply(svc) => {
                self.ctx.metrics.update("apply");
                self.apply(svc).await;
            }
            ServiceUpdate::Delete { name } => {
                self.ctx.metrics.update("delete");
                match self.services.remove(&name) {
                    Some(svc) => svc.close().await,
                    None => tracing::debug!(service = %name, "Ignoring deletion of unknown service"),
                }
            }
        }
        self.ctx.metrics.set_services(self.services.len());
    }

    async fn apply(&mut self, svc: Service) {
        match self.services.entry(svc.name.clone()) {
            Entry::Occupied(mut entry) => {
                if let Err(error) = entry.get_mut().update(&svc).await {
                    self.ctx.metrics.update_error();
                    self.ctx.errors.post(
                        anyhow::Error::new(error).context(format!("updating service {}", svc.name)),
                    );
                }
            }
            Entry::Vacant(entry) => match ServiceController::start(self.ctx.clone(), &svc).await {
                Ok(controller) => {
                    entry.insert(controller);
                }
                Err(error) => {
                    self.ctx.metrics.update_error();
                    self.ctx.errors.post(
                        anyhow::Error::new(error).context(format!("adding service {}", svc.name)),
                    );
                }
            },
        }
    }
}
