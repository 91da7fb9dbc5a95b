use anyhow::Result;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{MqttConfig, UnitsConfig};
use crate::palazzetti::StoveCommand;
use crate::topics::{CommandKind, DeviceTopics};

pub type DeviceId = String;

// Based on the vendor's Android app mapping
pub const STATUS_NAMES: &[(i64, &str)] = &[
    (0, "Off"),
    (1, "Timer-regulated switch off"),
    (2, "Ignition test"),
    (3, "Pellet feed"),
    (4, "Ignition"),
    (5, "Fuel check"),
    (6, "Operating"),
    (7, "Operating - Modulating"),
    (8, "-"),
    (9, "Stand-By"),
    (10, "Switch off"),
    (11, "Burn pot cleaning"),
    (12, "Cooling in progress"),
    (50, "Final cleaning"),
    (51, "Ecomode"),
    (501, "Off"),
    (502, "Ignition"),
    (503, "Fuel check"),
    (504, "Operating"),
    (505, "Firewood finished"),
    (506, "Cooling"),
    (507, "Burn pot cleaning"),
    (1000, "General error – See Manual"),
    (1001, "General error – See Manual"),
    (1239, "Door open"),
    (1240, "Temperature too high"),
    (1241, "Cleaning warning"),
    (1243, "Fuel error – See Manual"),
    (1244, "Pellet probe or return water error"),
    (1245, "T05 error Disconnected or faulty probe"),
    (1247, "Feed hatch or door open"),
    (1248, "Safety pressure switch error"),
    (1249, "Main probe failure"),
    (1250, "Flue gas probe failure"),
    (1252, "Too high exhaust gas temperature"),
    (1253, "Pellets finished or Ignition failed"),
    (1508, "General error – See Manual"),
];

pub const FAN_SPEED_NAMES: &[(u8, &str)] = &[
    (0, "off"),
    (1, "1"),
    (2, "2"),
    (3, "3"),
    (4, "4"),
    (5, "5"),
    (6, "hi"),
    (7, "auto"),
];

pub const HEATING_STATUSES: &[i64] = &[2, 3, 4, 5, 6, 7, 51, 502, 503, 504];

const UNKNOWN_STATUS: &str = "Off";
const UNKNOWN_FAN_SPEED: &str = "Off";

pub fn status_name(code: i64) -> &'static str {
    STATUS_NAMES
        .iter()
        .find(|(c, _)| *c == code)
        .map_or(UNKNOWN_STATUS, |(_, name)| *name)
}

pub fn fan_speed_name(code: i64) -> &'static str {
    FAN_SPEED_NAMES
        .iter()
        .find(|(c, _)| i64::from(*c) == code)
        .map_or(UNKNOWN_FAN_SPEED, |(_, name)| *name)
}

pub fn fan_speed_code(label: &str) -> u8 {
    FAN_SPEED_NAMES
        .iter()
        .find(|(_, name)| *name == label)
        .map_or(0, |(code, _)| *code)
}

/// Canonical device identifier for a controller MAC address
pub fn device_id_from_mac(mac: &str) -> DeviceId {
    mac.replace(':', "_")
}

/// Extracts the hardware address from a `GET ALLS` response, if present.
pub fn mac_from_payload(payload: &Value) -> Option<&str> {
    payload.get("DATA")?.get("MAC")?.as_str()
}

/// Accepts numbers sent either as JSON numbers or as numeric strings.
fn deserialize_lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct LenientF64;

    impl<'de> de::Visitor<'de> for LenientF64 {
        type Value = f64;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("number or numeric string")
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(v as f64)
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            v.trim().parse().map_err(E::custom)
        }
    }

    deserializer.deserialize_any(LenientF64)
}

/// The `DATA` block of a `GET ALLS` response
#[derive(Clone, Debug, Deserialize)]
pub struct StoveReport {
    #[serde(rename = "SETP", deserialize_with = "deserialize_lenient_f64")]
    pub setpoint: f64,
    #[serde(rename = "T1", deserialize_with = "deserialize_lenient_f64")]
    pub room_temperature: f64,
    #[serde(rename = "T2", deserialize_with = "deserialize_lenient_f64")]
    pub exit_temperature: f64,
    #[serde(rename = "T3", deserialize_with = "deserialize_lenient_f64")]
    pub fumes_temperature: f64,
    #[serde(rename = "PQT", deserialize_with = "deserialize_lenient_f64")]
    pub pellet_quantity: f64,
    #[serde(rename = "F2L")]
    pub fan_speed: i64,
    #[serde(rename = "PWR")]
    pub power_level: i64,
    #[serde(rename = "CHRSTATUS")]
    pub timer_status: i64,
    #[serde(rename = "LSTATUS")]
    pub status: i64,
}

impl StoveReport {
    pub fn from_payload(payload: &Value) -> Result<StoveReport> {
        let data = payload
            .get("DATA")
            .ok_or_else(|| anyhow::anyhow!("Missing DATA block"))?;

        Ok(serde_path_to_error::deserialize(data)?)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    Heat,
    #[default]
    Off,
}

impl Mode {
    pub fn from_status(status: i64) -> Mode {
        if HEATING_STATUSES.contains(&status) {
            Mode::Heat
        } else {
            Mode::Off
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Heat => "heat",
            Mode::Off => "off",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Availability {
    Online,
    #[default]
    Offline,
}

impl Availability {
    pub fn as_str(self) -> &'static str {
        match self {
            Availability::Online => "online",
            Availability::Offline => "offline",
        }
    }
}

/// Normalized view of the last report received from a stove
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoveState {
    pub target_temperature: f64,
    pub room_temperature: f64,
    pub exit_temperature: f64,
    pub fumes_temperature: f64,
    pub pellet_quantity: f64,
    pub fan_speed: &'static str,
    pub power_level: i64,
    pub timer_on: bool,
    pub mode: Mode,
    pub status: &'static str,
}

impl From<&StoveReport> for StoveState {
    fn from(report: &StoveReport) -> Self {
        StoveState {
            target_temperature: report.setpoint,
            room_temperature: report.room_temperature,
            exit_temperature: report.exit_temperature,
            fumes_temperature: report.fumes_temperature,
            pellet_quantity: report.pellet_quantity,
            fan_speed: fan_speed_name(report.fan_speed),
            power_level: report.power_level,
            timer_on: report.timer_status == 1,
            mode: Mode::from_status(report.status),
            status: status_name(report.status),
        }
    }
}

#[derive(Debug)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub hostname: String,
    pub topics: DeviceTopics,
    state: StoveState,
    availability: Availability,
    last_update: Option<Instant>,
    temp_step: f64,
    offline_timeout: Duration,
}

impl Device {
    pub fn new(
        id: DeviceId,
        name: &str,
        hostname: &str,
        mqtt: &MqttConfig,
        units: &UnitsConfig,
        offline_timeout: Duration,
    ) -> Self {
        let topics = DeviceTopics::build(&id, name, mqtt, units);

        Device {
            id,
            name: name.to_string(),
            hostname: hostname.to_string(),
            topics,
            state: StoveState::default(),
            availability: Availability::Offline,
            last_update: None,
            temp_step: units.temp_step,
            offline_timeout,
        }
    }

    /// Recomputes topics and discovery payloads from scratch.
    pub fn rebuild_topics(&mut self, mqtt: &MqttConfig, units: &UnitsConfig) {
        self.topics = DeviceTopics::build(&self.id, &self.name, mqtt, units);
        self.temp_step = units.temp_step;
    }

    pub fn state(&self) -> &StoveState {
        &self.state
    }

    pub fn availability(&self) -> Availability {
        self.availability
    }

    pub fn update_state(&mut self, report: &StoveReport, now: Instant) {
        self.state = StoveState::from(report);
        self.last_update = Some(now);
        self.refresh_availability(now);
    }

    pub fn availability_at(&self, now: Instant) -> Availability {
        match self.last_update {
            Some(last_update)
                if now.saturating_duration_since(last_update) < self.offline_timeout =>
            {
                Availability::Online
            }
            _ => Availability::Offline,
        }
    }

    pub fn refresh_availability(&mut self, now: Instant) {
        self.availability = self.availability_at(now);
    }

    pub fn command_for_topic(&self, topic: &str) -> Option<CommandKind> {
        self.topics.command_for_topic(topic)
    }

    /// Translates a bus payload for `kind` into the request to send to the stove.
    ///
    /// Returns `None` when the payload cannot be turned into a request, e.g. a
    /// non-numeric target temperature.
    pub fn action_for(&self, kind: CommandKind, payload: &str) -> Option<StoveCommand> {
        let payload = payload.trim();

        match kind {
            CommandKind::Mode => Some(StoveCommand::Power(payload == Mode::Heat.as_str())),
            CommandKind::TargetTemperature => {
                let temperature: f64 = payload.parse().ok()?;
                // "nan" and "inf" parse fine but mean nothing to the stove
                if !temperature.is_finite() {
                    return None;
                }
                if (self.temp_step - 0.2).abs() < f64::EPSILON {
                    Some(StoveCommand::FloatTargetTemperature(temperature))
                } else {
                    Some(StoveCommand::TargetTemperature(temperature.round() as i64))
                }
            }
            CommandKind::FanSpeed => Some(StoveCommand::FanSpeed(fan_speed_code(payload))),
            CommandKind::PowerLevel => Some(StoveCommand::PowerLevel(payload.to_string())),
            CommandKind::Timer => Some(StoveCommand::Timer(payload == "on")),
        }
    }

    /// (topic, value) pairs describing the current state, availability included.
    pub fn state_messages(&self) -> Vec<(String, String)> {
        let topics = &self.topics.state;
        let state = &self.state;

        vec![
            (topics.temperature.clone(), state.room_temperature.to_string()),
            (topics.mode.clone(), state.mode.as_str().to_string()),
            (
                topics.target_temperature.clone(),
                state.target_temperature.to_string(),
            ),
            (topics.temp_step.clone(), self.temp_step.to_string()),
            (topics.fan_speed.clone(), state.fan_speed.to_string()),
            (topics.power_level.clone(), state.power_level.to_string()),
            (
                topics.timer.clone(),
                if state.timer_on { "on" } else { "off" }.to_string(),
            ),
            (
                topics.availability.clone(),
                self.availability.as_str().to_string(),
            ),
            (topics.status.clone(), state.status.to_string()),
            (
                topics.exit_temperature.clone(),
                state.exit_temperature.to_string(),
            ),
            (
                topics.fumes_temperature.clone(),
                state.fumes_temperature.to_string(),
            ),
            (
                topics.pellet_quantity.clone(),
                state.pellet_quantity.to_string(),
            ),
        ]
    }
}
