mod aggregate;
mod codec;
mod config;
mod db;
mod engine;
mod error;
mod history;
mod model;
mod mqtt;
mod notify;
mod provision;
mod sequencer;
mod state;
mod store;
mod timer;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use engine::Engine;
use state::SystemState;
use store::Store;
use timer::{FlushTimer, FLUSH_PERIOD_SECS};
use web::WebState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:telemetry-hub.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed sensor types + owner) ─────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    // ── Shared state (ephemeral, for the web api) ───────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── Engine + sequencer ──────────────────────────────────────────
    let notifier = notify::channel();
    let store: Arc<dyn Store> = Arc::new(db.clone());
    let (handle, worker) = sequencer::spawn(Engine::new(store, notifier.clone()), Arc::clone(&shared));

    // Cold start: first in the queue, so nothing is ingested before it.
    handle.reload();

    let (timer, timer_task) =
        FlushTimer::start(handle.clone(), Duration::from_secs(FLUSH_PERIOD_SECS));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = WebState {
        shared: Arc::clone(&shared),
        engine: handle.clone(),
        timer: timer.clone(),
        db: db.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state).await {
            error!("{e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let client_id = "telemetry-hub";
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    client
        .subscribe(mqtt::READING_TOPIC_FILTER, QoS::AtLeastOnce)
        .await
        .context("subscribe to telemetry failed")?;
    client
        .subscribe(mqtt::RELOAD_TOPIC, QoS::AtLeastOnce)
        .await
        .context("subscribe to reload failed")?;
    info!(
        "hub subscribed to {} and {}",
        mqtt::READING_TOPIC_FILTER,
        mqtt::RELOAD_TOPIC
    );

    tokio::spawn(notify::relay_to_mqtt(notifier.subscribe(), client.clone()));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    mqtt::route_publish(&p.topic, &p.payload, &handle, &shared).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    let mut st = shared.write().await;
                    st.mqtt_connected = true;
                    st.record_system("mqtt connected".to_string());
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_system("mqtt disconnected".to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. reconnecting...");
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                    drop(st);

                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    // Stop triggering, then let everything already queued finish.
    timer.stop();
    if let Err(e) = timer_task.await {
        warn!("flush timer task ended abnormally: {e}");
    }
    if !handle.shutdown().await {
        warn!("sequencer was already stopped");
    }
    worker.await.context("sequencer task failed")?;
    info!("hub stopped");
    Ok(())
}
