use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rumqttc::QoS;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

use crate::config::Config;
use crate::delayer::Delayer;
use crate::device::{device_id_from_mac, mac_from_payload, Device, DeviceId, StoveReport};
use crate::mqtt::{Bus, BusEvent};
use crate::palazzetti::{HttpClient, PalazzettiApi};

/// Owns every known stove and keeps them in sync with the bus.
pub struct House<H: HttpClient, B: Bus> {
    config: Config,
    bus: B,
    api: PalazzettiApi<H>,
    devices: BTreeMap<DeviceId, Device>,
    delayer: Delayer,
    subscriptions: HashSet<String>,
    registered: bool,
}

impl<H: HttpClient, B: Bus> House<H, B> {
    pub fn new(config: Config, http: H, bus: B) -> Self {
        let delayer = Delayer::new(config.refresh.delays.clone(), config.refresh.randomness);

        House {
            config,
            bus,
            api: PalazzettiApi::new(http),
            devices: BTreeMap::new(),
            delayer,
            subscriptions: HashSet::new(),
            registered: false,
        }
    }

    #[cfg(test)]
    pub fn devices(&self) -> &BTreeMap<DeviceId, Device> {
        &self.devices
    }

    /// Polls every configured stove once, updating known devices and creating
    /// the ones seen for the first time. Returns the ids of new devices.
    ///
    /// A response without an identity aborts the rest of the pass.
    async fn update_all_states(&mut self) -> Vec<DeviceId> {
        debug!("update_all_states: begin");
        let mut discovered = Vec::new();

        for device_cfg in &self.config.devices {
            let payload = match self.api.fetch_state(&device_cfg.hostname).await {
                Some(payload) => payload,
                None => {
                    debug!(
                        "No data from {} this cycle, last successful response {:?} ago",
                        device_cfg.hostname,
                        self.api.last_successful_response_age()
                    );
                    continue;
                }
            };

            let device_id = match mac_from_payload(&payload) {
                Some(mac) => device_id_from_mac(mac),
                None => {
                    debug!("Payload received: {}", payload);
                    error!("Device response payload is missing a MAC identifier");
                    break;
                }
            };

            let report = match StoveReport::from_payload(&payload) {
                Ok(report) => report,
                Err(e) => {
                    warn!("Unusable state payload from {}: {:#}", device_cfg.hostname, e);
                    continue;
                }
            };

            let device = self.devices.entry(device_id.clone()).or_insert_with(|| {
                discovered.push(device_id.clone());
                Device::new(
                    device_id,
                    &device_cfg.name,
                    &device_cfg.hostname,
                    &self.config.mqtt,
                    &self.config.units,
                    self.config.refresh.offline_timeout(),
                )
            });

            device.update_state(&report, Instant::now());
            debug!("Device after update: {:?}", device.state());
        }

        debug!("update_all_states: end");
        discovered
    }

    /// Discovery pass: polls every stove and rebuilds every device's topics.
    pub async fn setup(&mut self) {
        self.update_all_states().await;

        for device in self.devices.values_mut() {
            device.rebuild_topics(&self.config.mqtt, &self.config.units);
            info!(
                "Device found: {} ({} | {})",
                device.name, device.id, device.hostname
            );
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        if self.subscriptions.contains(topic) {
            return Ok(());
        }

        self.bus
            .subscribe(topic)
            .await
            .with_context(|| format!("Failed to subscribe to {}", topic))?;
        self.subscriptions.insert(topic.to_string());

        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.bus
            .unsubscribe(topic)
            .await
            .with_context(|| format!("Failed to unsubscribe from {}", topic))?;
        self.subscriptions.remove(topic);

        Ok(())
    }

    async fn register_device(&mut self, device_id: &DeviceId) -> Result<()> {
        let Some(device) = self.devices.get(device_id) else {
            return Ok(());
        };

        let command_topics: Vec<String> = device
            .topics
            .command
            .iter()
            .map(|(_, topic)| topic.to_string())
            .collect();
        let announcements = device.topics.discovery.clone();

        for topic in command_topics {
            self.subscribe(&topic).await?;
        }

        if self.config.mqtt.discovery {
            for announcement in announcements {
                let payload = serde_json::to_string(&announcement.payload)?;
                self.bus
                    .publish(
                        &announcement.topic,
                        &payload,
                        self.config.mqtt.config_retain,
                        QoS::AtLeastOnce,
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Subscribes to the reset topic and every device's command topics and
    /// announces devices. Topics already subscribed to are not subscribed again.
    pub async fn register_all(&mut self) -> Result<()> {
        let reset_topic = self.config.mqtt.reset_topic.clone();
        self.subscribe(&reset_topic).await?;

        let device_ids: Vec<DeviceId> = self.devices.keys().cloned().collect();
        for device_id in &device_ids {
            self.register_device(device_id).await?;
        }

        self.registered = true;
        Ok(())
    }

    pub async fn unregister_all(&mut self) -> Result<()> {
        let reset_topic = self.config.mqtt.reset_topic.clone();
        self.unsubscribe(&reset_topic).await?;

        let mut command_topics = Vec::new();
        let mut discovery_topics = Vec::new();
        for device in self.devices.values() {
            command_topics.extend(device.topics.command.iter().map(|(_, t)| t.to_string()));
            discovery_topics.extend(device.topics.discovery.iter().map(|a| a.topic.clone()));
        }

        for topic in command_topics {
            self.unsubscribe(&topic).await?;
        }

        if self.config.mqtt.discovery {
            for topic in discovery_topics {
                self.bus
                    .publish(&topic, "", self.config.mqtt.config_retain, QoS::AtLeastOnce)
                    .await?;
            }
        }

        self.registered = false;
        Ok(())
    }

    /// Polls every stove and publishes the state of every known device.
    pub async fn refresh_all(&mut self) -> Result<()> {
        let discovered = self.update_all_states().await;

        for device_id in &discovered {
            if let Some(device) = self.devices.get(device_id) {
                info!(
                    "Device found: {} ({} | {})",
                    device.name, device.id, device.hostname
                );
            }
            if self.registered {
                self.register_device(device_id).await?;
            }
        }

        let now = Instant::now();
        let retain = self.config.mqtt.state_retain;

        for device in self.devices.values_mut() {
            let previous = device.availability();
            device.refresh_availability(now);
            if device.availability() != previous {
                info!("{} is now {}", device.name, device.availability().as_str());
            }

            for (topic, value) in device.state_messages() {
                self.bus
                    .publish(&topic, &value, retain, QoS::AtMostOnce)
                    .await?;
            }
        }

        Ok(())
    }

    /// Handles an inbound bus message: either a full rediscovery on the reset
    /// topic or a command for one of the devices. Any message brings the next
    /// refresh forward.
    pub async fn on_bus_message(&mut self, topic: &str, payload: &str) -> Result<()> {
        self.delayer.reset();

        if topic == self.config.mqtt.reset_topic {
            info!("Reset requested, rediscovering devices");
            self.setup().await;
            return self.register_all().await;
        }

        let mut tokens = topic.rsplit('/');
        let (Some(command), Some(device_id)) = (tokens.next(), tokens.next()) else {
            return Ok(());
        };

        info!(
            "MQTT message received device '{}' command '{}' value '{}'",
            device_id, command, payload
        );

        let Some(device) = self.devices.get(device_id) else {
            return Ok(());
        };
        let Some(kind) = device.command_for_topic(topic) else {
            return Ok(());
        };

        match device.action_for(kind, payload) {
            Some(action) => {
                let hostname = device.hostname.clone();
                self.api.send(&hostname, &action).await;
            }
            None => warn!(
                "Ignoring {:?} command with payload '{}' for {}",
                kind, payload, device_id
            ),
        }

        Ok(())
    }

    pub async fn handle_bus_event(&mut self, event: BusEvent) -> Result<()> {
        match event {
            BusEvent::Connected => {
                // A fresh session carries no subscriptions
                self.subscriptions.clear();
                if self.registered {
                    self.register_all().await?;
                }
                Ok(())
            }
            BusEvent::Message { topic, payload } => self.on_bus_message(&topic, &payload).await,
        }
    }

    pub fn next_refresh_delay(&mut self) -> Duration {
        self.delayer.next()
    }
}

/// Runs discovery once, then refreshes forever. Bus events are handled on a
/// separate task; each inbound message cuts the current wait short.
///
/// Both sides share one lock and a refresh holds it for the whole sweep, so a
/// command arriving mid-sweep waits until every stove has been polled.
pub async fn run<H, B>(
    house: Arc<Mutex<House<H, B>>>,
    mut events: mpsc::UnboundedReceiver<BusEvent>,
) -> Result<()>
where
    H: HttpClient + 'static,
    B: Bus + 'static,
{
    {
        let mut house = house.lock().await;
        house.setup().await;
        house.register_all().await?;
    }

    let wake = Arc::new(Notify::new());

    {
        let house = house.clone();
        let wake = wake.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let is_message = matches!(event, BusEvent::Message { .. });

                let res = house.lock().await.handle_bus_event(event).await;
                if let Err(e) = res {
                    warn!("Error while handling MQTT event: {:#}", e);
                }

                if is_message {
                    wake.notify_one();
                }
            }
            info!("MQTT event stream closed");
        });
    }

    loop {
        let delay = {
            let mut house = house.lock().await;
            if let Err(e) = house.refresh_all().await {
                warn!("Error while refreshing devices: {:#}", e);
            }
            house.next_refresh_delay()
        };

        debug!("Next refresh in {:.1}s", delay.as_secs_f64());

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {}
        }
    }
}
