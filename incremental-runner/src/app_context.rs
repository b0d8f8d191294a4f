use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use incremental_core::{PgPipelineStore, PgScheduler, PipelineManager};
use sqlx::PgPool;
use tracing::{error, info};

use crate::config::{Config, RunnerSettings};
use crate::health::{HealthHandle, HealthRegistry};
use crate::metrics::inc;
use crate::metrics_constants::*;
use crate::runner::Runner;

pub struct AppContext {
    pub runner: Arc<Runner>,
    pub pool: PgPool,
    pub health: HealthRegistry,
    pub runner_liveness: HealthHandle,
    pub settings: RunnerSettings,
}

impl AppContext {
    pub async fn new(config: &Config) -> eyre::Result<Self> {
        let engine_config = config.get_engine_config();
        let settings = config.get_runner_settings();

        let store = PgPipelineStore::new(config.get_pool_config(), &engine_config).await?;
        let pool = store.pool().clone();
        let manager = PipelineManager::new(store, PgScheduler::new(pool.clone()), engine_config);

        let health = HealthRegistry::new("liveness");
        // A tick can take as long as its slowest command, which is bounded by the wait for
        // writers plus the command timeout
        let runner_liveness = health
            .register("runner", liveness_deadline(config))
            .await;

        Ok(Self {
            runner: Arc::new(Runner::new(manager, settings.clone())),
            pool,
            health,
            runner_liveness,
            settings,
        })
    }

    pub async fn run_migrations(&self) -> eyre::Result<()> {
        self.runner.run_migrations().await?;
        Ok(())
    }

    pub async fn run_loop(runner: Arc<Runner>, liveness: HealthHandle) {
        let mut interval = tokio::time::interval(runner.settings.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match runner.run_once(Utc::now()).await {
                Ok(result) if result.claimed > 0 => info!("runner tick finished: {:?}", result),
                Ok(_) => {}
                Err(e) => {
                    error!("runner failed to claim jobs: {}", e);
                    inc(RUN_ERRORS, &runner.metrics_labels, 1);
                }
            }
            liveness.report_healthy().await;
        }
    }
}

fn liveness_deadline(config: &Config) -> Duration {
    let tick = Duration::from_secs(config.poll_interval_secs.max(1));
    let writers = Duration::from_secs(config.writer_wait_timeout_secs);
    let command = Duration::from_secs(config.command_timeout_secs.unwrap_or(3600));
    tick * 4 + writers + command
}
