use std::time::Duration;

use envconfig::Envconfig;
use incremental_runner::{
    app_context::AppContext, config::Config, drops::listen_for_drops, http, metrics,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn setup_tracing(json: bool) {
    let log_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(env_filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_filter(env_filter())
            .boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let config = Config::init_from_env()?;
    setup_tracing(config.json_logs());

    let context = AppContext::new(&config).await?;
    info!("Starting incremental runner with ID {}", context.settings.id);

    if config.run_migrations {
        context.run_migrations().await?;
    }

    let run_loop = tokio::spawn(AppContext::run_loop(
        context.runner.clone(),
        context.runner_liveness.clone(),
    ));

    let drops_loop = if config.listen_for_drops {
        let heartbeat = Duration::from_secs(30);
        let liveness = context.health.register("drops", heartbeat * 2).await;
        Some(tokio::spawn(listen_for_drops(
            context.pool.clone(),
            liveness,
            heartbeat,
        )))
    } else {
        None
    };

    let mut app = http::app(context.health.clone());
    if config.expose_metrics {
        app = metrics::setup_metrics_routes(app)?;
    }
    let bind = format!("{}:{}", config.host, config.port);
    let http_server = tokio::spawn(http::listen(app, bind));

    let drops_exited = async {
        match drops_loop {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        res = run_loop => {
            error!("runner loop exited");
            if let Err(e) = res {
                error!("runner failed with: {}", e)
            }
        }
        res = drops_exited => {
            error!("drop listener exited");
            match res {
                Ok(Err(e)) => error!("drop listener failed with: {}", e),
                Err(e) => error!("drop listener panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        res = http_server => {
            error!("http server exited");
            match res {
                Ok(Err(e)) => error!("server failed with: {}", e),
                Err(e) => error!("server panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("exiting");
    Ok(())
}
