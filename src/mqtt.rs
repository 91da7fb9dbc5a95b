use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use rand::{distributions::Alphanumeric, Rng};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tokio::{sync::mpsc, task};

use crate::config::MqttConfig;

/// Something that happened on the bus connection
#[derive(Clone, Debug, PartialEq)]
pub enum BusEvent {
    /// The broker acknowledged a (re)connection
    Connected,
    Message { topic: String, payload: String },
}

/// Publish/subscribe operations the house needs from the bus.
///
/// Kept behind a trait so the house can be driven without a broker in tests.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Publishes `payload` to `topic`. An empty payload retracts a retained
    /// message.
    async fn publish(&self, topic: &str, payload: &str, retain: bool, qos: QoS) -> Result<()>;
}

#[derive(Clone)]
pub struct MqttBus {
    pub client: AsyncClient,
}

#[async_trait]
impl Bus for MqttBus {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str, retain: bool, qos: QoS) -> Result<()> {
        self.client
            .publish(topic, qos, retain, payload.as_bytes().to_vec())
            .await?;
        Ok(())
    }
}

pub async fn init_mqtt(
    mqtt_config: &MqttConfig,
) -> Result<(MqttBus, mpsc::UnboundedReceiver<BusEvent>)> {
    let random_string: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();

    let mut options = MqttOptions::new(
        format!("{}-{}", mqtt_config.id, random_string),
        mqtt_config.host.clone(),
        mqtt_config.port,
    );
    options.set_keep_alive(Duration::from_secs(5));

    if let Some(username) = &mqtt_config.username {
        let password = mqtt_config.password.clone().unwrap_or_default();
        options.set_credentials(username.clone(), password);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 10);
    let (tx, rx) = mpsc::unbounded_channel();

    task::spawn(async move {
        loop {
            let event = match eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    debug!("Connected to MQTT broker");
                    BusEvent::Connected
                }
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(msg))) => BusEvent::Message {
                    topic: msg.topic,
                    payload: String::from_utf8_lossy(&msg.payload).into_owned(),
                },
                Ok(_) => continue,
                Err(e) => {
                    warn!("MQTT error: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if tx.send(event).is_err() {
                debug!("MQTT event receiver dropped, stopping event loop");
                break;
            }
        }
    });

    Ok((MqttBus { client }, rx))
}

#[cfg(test)]
pub use mock::MockBus;
