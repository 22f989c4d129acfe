/**
 * Gateway Listener Example
 *
 * Discovers the gateway on the local network, binds a few sensor items and
 * prints discovery events and item updates as they arrive.
 *
 * Set XIAOMI_KEY to the developer key shown in the vendor app to enable
 * writes; the light is switched on once the gateway is found.
 */
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use xiaomi_gateway::{
    Command, Engine, EngineConfig, EngineEvent, ItemRegistry, MemoryItemRegistry,
};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("--- xiaomi-gateway - Listener ---");

    // 1. Bind items (replace the sids with your own devices)
    let items = Arc::new(MemoryItemRegistry::new());
    items.bind("HallTemperature", "158d0001a2b3c4.temperature");
    items.bind("HallHumidity", "158d0001a2b3c4.humidity");
    items.bind("FrontDoor", "158d0001d5e6f7.magnet");

    let key = std::env::var("XIAOMI_KEY").unwrap_or_default();
    let config = EngineConfig::default()
        .with_poll_interval(Duration::from_secs(30))
        .with_developer_key(&key);
    let engine = Engine::new(config, items.clone());

    // 2. Start listening
    let events = engine.events();
    tokio::pin!(events);
    if let Err(e) = engine.start().await {
        eprintln!("[ERROR] Failed to start engine: {}", e);
        return;
    }

    println!("[INFO] Waiting for events (Press Ctrl+C to stop)...");
    let timeout = tokio::time::sleep(Duration::from_secs(120));
    tokio::pin!(timeout);
    let mut ticker = tokio::time::interval(Duration::from_secs(10));

    // 3. Process events in real-time
    loop {
        tokio::select! {
            Some(event) = events.next() => match event {
                EngineEvent::GatewayDiscovered { sid, endpoint } => {
                    println!("[EVENT] Gateway {} at {}", sid, endpoint);
                    items.bind("GatewayLight", &format!("{}.light", sid));
                    if !key.is_empty() && let Err(e) = engine.command("GatewayLight", Command::On).await {
                        eprintln!("[ERROR] Light command failed: {}", e);
                    }
                }
                EngineEvent::DeviceDiscovered(record) => {
                    println!("[EVENT] Device {} ({})", record.sid, record.model);
                }
            },
            _ = ticker.tick() => {
                for (item, state) in items.updates() {
                    println!("[STATE] {} = {:?}", item, state);
                }
                items.clear_history();
                println!("[INFO] {} bound items", items.bindings().len());
            }
            _ = &mut timeout => {
                println!("[INFO] Example timeout reached. Exiting.");
                break;
            }
        }
    }

    engine.stop();
}
