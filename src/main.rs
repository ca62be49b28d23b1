use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use volwatch::{
    init_logging, load_baselines, load_instruments, AlertDispatcher, ChannelSink, FeedClient,
    FeedHandler, MonitorBuilder, MonitorConfig, WebhookChannel,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = MonitorConfig::from_env().context("invalid VOLWATCH_* configuration")?;
    init_logging();

    let universe = load_instruments(&config.universe_path)
        .with_context(|| format!("loading universe from {}", config.universe_path.display()))?;
    let baselines = match &config.baselines_path {
        Some(path) => load_baselines(path)
            .with_context(|| format!("loading baselines from {}", path.display()))?,
        None => {
            tracing::warn!("VOLWATCH_BASELINES not set; spike detection and relative rules stay idle");
            HashMap::new()
        }
    };

    let mut builder = MonitorBuilder::from_config(&config)
        .instruments(universe.clone())
        .baselines(baselines);

    let dispatcher = match &config.webhook_url {
        Some(url) => {
            let (sink, rx) = ChannelSink::new();
            builder = builder.sink(Arc::new(sink));
            Some(
                AlertDispatcher::new()
                    .with_channel(Box::new(WebhookChannel::new(url)))
                    .spawn(rx),
            )
        }
        None => None,
    };

    let monitor = Arc::new(builder.build()?);
    let client = Arc::new(FeedClient::new(config.feed.clone())?);
    for instrument in universe {
        client.subscribe(instrument);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let session_task = {
        let monitor = monitor.clone();
        let mut shutdown = shutdown_rx.clone();
        let mut ticker = tokio::time::interval(config.session_check_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.check_session();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    let mut feed = {
        let client = client.clone();
        let handler: Arc<dyn FeedHandler> = monitor.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { client.connect(handler, shutdown).await })
    };

    tracing::info!("volwatch running; press Ctrl-C to stop");

    let feed_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
            feed.await
        }
        result = &mut feed => {
            let _ = shutdown_tx.send(true);
            result
        }
    };

    if let Err(e) = session_task.await {
        tracing::warn!("Session task ended abnormally: {}", e);
    }

    let stats = monitor.ingest_stats();
    let snapshot = serde_json::to_string_pretty(&monitor.snapshot())?;
    println!("{}", snapshot);
    tracing::info!(?stats, health = ?monitor.health(), "Final state");

    drop(monitor);
    if let Some(dispatcher) = dispatcher {
        if let Err(e) = dispatcher.await {
            tracing::warn!("Alert dispatcher ended abnormally: {}", e);
        }
    }

    feed_result
        .context("feed task panicked")?
        .context("feed stopped")?;
    Ok(())
}
