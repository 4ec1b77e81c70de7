use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use greennet::Config;
use greennet::Engine;
use greennet::TopicRouter;
use greennet::mqtt::MqttBridge;
use greennet::mqtt::RumqttcClient;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "greennet")]
#[command(about = "Bridge between an EnOcean-over-IP gateway and its MQTT broker")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "greennet.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.targets())
        .init();

    tracing::info!("greennet starting");
    tracing::info!("Loaded config from: {}", cli.config);

    let router = TopicRouter::new(&config.gateway.topic_base, &config.gateway.eag_id);
    let (engine, outbound) = Engine::new(router, config.reconciler.debounce());
    let engine = Arc::new(engine);

    let engine_task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await })
    };

    let client = RumqttcClient::new(&config.mqtt);
    let bridge = MqttBridge::new(client, Arc::clone(&engine));
    let mut bridge_task = tokio::spawn(bridge.run(outbound));
    tracing::info!(
        "Bridging gateway {} via {}:{}",
        config.gateway.eag_id,
        config.mqtt.broker,
        config.mqtt.port
    );

    let api = config.api.clone().map(|api| {
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(greennet::api::serve(
            api.listen,
            api.port,
            Arc::clone(&engine),
            shutdown_rx,
        ));
        (shutdown_tx, handle)
    });

    tracing::info!("Press Ctrl+C to exit");

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        },
        result = &mut bridge_task => match result {
            Ok(Ok(())) => tracing::warn!("MQTT bridge stopped"),
            Ok(Err(e)) => tracing::error!("MQTT bridge failed: {}", e),
            Err(e) => tracing::error!("MQTT bridge task panicked: {}", e),
        },
    }

    if let Some((shutdown_tx, handle)) = api {
        let _ = shutdown_tx.send(());
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("HTTP API server failed: {}", e),
            Err(e) => tracing::error!("HTTP API task panicked: {}", e),
        }
    }

    bridge_task.abort();
    engine_task.abort();
    engine.shutdown();

    tracing::info!("greennet shutdown complete");

    Ok(())
}
