use crate::{
    core::{mem::MemoryTable, ErrorSink, RuleTable},
    iptables::{self, Iptables},
    services::{self, NetConfig, ServiceMetrics},
    source,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tracing::{info, info_span, Instrument};

// The number of updates the reader may run ahead of the service set.
const UPDATE_QUEUE_SIZE: usize = 64;

#[derive(Debug, Parser)]
#[clap(
    name = "flux-balancer",
    about = "Forwards service addresses to their instances"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "flux_balancer=info,warn",
        env = "FLUX_BALANCER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The chain that holds the balancer's rules in every table.
    #[clap(long, default_value = iptables::DEFAULT_CHAIN)]
    chain: String,

    #[clap(long, default_value = "iptables")]
    iptables: String,

    /// Enables IPv6 rules, managed with the given command.
    #[clap(long)]
    ip6tables: Option<String>,

    /// The packet mark of the first instance of each service. Must leave room for
    /// `NetConfig::MAX_INSTANCES` marks.
    #[clap(long, default_value = "0x1000", value_parser = parse_u32)]
    mark_base: u32,

    #[clap(long, default_value = "0xf1ec", value_parser = parse_u32)]
    hash_seed: u32,

    /// A file of newline-delimited JSON service updates, or `-` for stdin.
    #[clap(long, default_value = "-")]
    updates: PathBuf,

    /// Keeps rules in memory instead of modifying the host's tables.
    #[clap(long)]
    dry_run: bool,

    /// Leaves the balancer's chains in place on shutdown.
    #[clap(long)]
    keep_chains: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            admin,
            chain,
            iptables,
            ip6tables,
            mark_base,
            hash_seed,
            updates,
            dry_run,
            keep_chains,
        } = self;

        log_format.try_init(log_level)?;
        let net = NetConfig {
            mark_base,
            hash_seed,
        };
        net.validate()?;
        let (shutdown, drain) = kubert::shutdown::sigint_or_sigterm()?;

        let mut prom = <Registry>::default();
        let metrics = ServiceMetrics::register(prom.sub_registry_with_prefix("services"));
        let admin = admin.into_builder().with_prometheus(prom).bind()?;

        let (rules, chains) = if dry_run {
            info!("Dry run: rules are only kept in memory");
            let rules: Arc<dyn RuleTable> = Arc::new(MemoryTable::default());
            (rules, None)
        } else {
            let mut table = Iptables::new(chain).with_iptables(iptables);
            if let Some(ip6tables) = ip6tables {
                table = table.with_ip6tables(ip6tables);
            }
            table.setup().await?;
            let rules: Arc<dyn RuleTable> = Arc::new(table.clone());
            (rules, Some(table))
        };

        let reader = source::open(&updates).await?;
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_QUEUE_SIZE);
        let set = services::Config {
            rules,
            net,
            updates: updates_rx,
            errors: ErrorSink::log_only(),
            metrics,
            processed: None,
        }
        .start();

        tokio::spawn(
            async move {
                if let Err(error) = source::read_updates(reader, updates_tx).await {
                    tracing::error!(%error, "Failed to read updates");
                }
            }
            .instrument(info_span!("source", path = %updates.display())),
        );

        tokio::spawn(
            async move {
                let release = drain.signaled().await;
                info!("Shutting down");
                release
                    .release_after(async move {
                        set.close().await;
                        match chains {
                            Some(chains) if !keep_chains => chains.cleanup().await,
                            _ => {}
                        }
                    })
                    .await;
            }
            .instrument(info_span!("shutdown")),
        );

        admin.set_ready();
        let _admin = admin.spawn();

        // Block the main thread on the shutdown signal. Once it fires, wait for the service rules
        // to be removed before exiting.
        if shutdown.signaled().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal integer.
fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}
