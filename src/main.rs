use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::read_config;
use crate::house::House;
use crate::mqtt::init_mqtt;
use crate::palazzetti::ReqwestClient;

mod config;
mod delayer;
mod device;
mod house;
mod mqtt;
mod palazzetti;
mod topics;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = read_config()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    let (bus, events) = init_mqtt(&config.mqtt).await?;
    let http = ReqwestClient::new()?;

    let unregister_on_exit = config.mqtt.unregister_on_exit;
    let shared_house = Arc::new(Mutex::new(House::new(config, http, bus)));

    tokio::select! {
        res = house::run(shared_house.clone(), events) => res?,
        res = tokio::signal::ctrl_c() => res?,
    }

    info!("Shutting down");

    if unregister_on_exit {
        shared_house.lock().await.unregister_all().await?;
        // Let the MQTT event loop flush the retractions
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    Ok(())
}
