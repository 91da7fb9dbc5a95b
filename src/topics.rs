use serde::Serialize;

use crate::config::{MqttConfig, UnitsConfig};
use crate::device::{DeviceId, FAN_SPEED_NAMES};

pub const MANUFACTURER: &str = "Palazzetti";

/// Commands a device accepts from the bus, one command topic each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Mode,
    TargetTemperature,
    FanSpeed,
    PowerLevel,
    Timer,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        CommandKind::Mode,
        CommandKind::TargetTemperature,
        CommandKind::FanSpeed,
        CommandKind::PowerLevel,
        CommandKind::Timer,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            CommandKind::Mode => "mode",
            CommandKind::TargetTemperature => "target_temp",
            CommandKind::FanSpeed => "fan_speed",
            CommandKind::PowerLevel => "power_level",
            CommandKind::Timer => "timer",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StateTopics {
    pub temperature: String,
    pub mode: String,
    pub target_temperature: String,
    pub temp_step: String,
    pub fan_speed: String,
    pub power_level: String,
    pub timer: String,
    pub availability: String,
    pub status: String,
    pub exit_temperature: String,
    pub fumes_temperature: String,
    pub pellet_quantity: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommandTopics {
    pub mode: String,
    pub target_temperature: String,
    pub fan_speed: String,
    pub power_level: String,
    pub timer: String,
}

impl CommandTopics {
    pub fn get(&self, kind: CommandKind) -> &str {
        match kind {
            CommandKind::Mode => &self.mode,
            CommandKind::TargetTemperature => &self.target_temperature,
            CommandKind::FanSpeed => &self.fan_speed,
            CommandKind::PowerLevel => &self.power_level,
            CommandKind::Timer => &self.timer,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (CommandKind, &str)> {
        CommandKind::ALL.into_iter().map(move |kind| (kind, self.get(kind)))
    }
}

/// Home Assistant device block shared by every entity of a stove
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClimateDiscovery {
    pub name: String,
    pub unique_id: String,

    pub current_temperature_topic: String,
    pub mode_state_topic: String,
    pub temperature_state_topic: String,
    pub fan_mode_state_topic: String,
    pub hold_state_topic: String,
    pub swing_mode_state_topic: String,
    pub availability_topic: String,

    pub mode_command_topic: String,
    pub temperature_command_topic: String,
    pub fan_mode_command_topic: String,
    pub hold_command_topic: String,
    pub swing_mode_command_topic: String,

    pub temp_step: f64,
    pub hold_modes: Vec<String>,
    pub modes: Vec<String>,
    pub fan_modes: Vec<String>,
    pub swing_modes: Vec<String>,

    pub device: DeviceInfo,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SensorDiscovery {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    pub availability_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    pub device: DeviceInfo,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DiscoveryPayload {
    Climate(ClimateDiscovery),
    Sensor(SensorDiscovery),
}

#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryAnnouncement {
    pub topic: String,
    pub payload: DiscoveryPayload,
}

/// Every topic a stove publishes to or listens on, plus the discovery
/// announcements describing them.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceTopics {
    pub state: StateTopics,
    pub command: CommandTopics,
    pub discovery: Vec<DiscoveryAnnouncement>,
}

impl DeviceTopics {
    pub fn build(
        device_id: &DeviceId,
        name: &str,
        mqtt: &MqttConfig,
        units: &UnitsConfig,
    ) -> DeviceTopics {
        let state_topic = |suffix: &str| format!("{}/{}/{}", mqtt.state_prefix, device_id, suffix);
        let command_topic =
            |kind: CommandKind| format!("{}/{}/{}", mqtt.command_prefix, device_id, kind.suffix());

        let state = StateTopics {
            temperature: state_topic("temp"),
            mode: state_topic("mode"),
            target_temperature: state_topic("target_temp"),
            temp_step: state_topic("temp_step"),
            fan_speed: state_topic("fan_speed"),
            power_level: state_topic("power_level"),
            timer: state_topic("timer"),
            availability: state_topic("availability"),
            status: state_topic("status"),
            exit_temperature: state_topic("exit_temp"),
            fumes_temperature: state_topic("fumes_temp"),
            pellet_quantity: state_topic("pellet_qty"),
        };

        let command = CommandTopics {
            mode: command_topic(CommandKind::Mode),
            target_temperature: command_topic(CommandKind::TargetTemperature),
            fan_speed: command_topic(CommandKind::FanSpeed),
            power_level: command_topic(CommandKind::PowerLevel),
            timer: command_topic(CommandKind::Timer),
        };

        let device = DeviceInfo {
            identifiers: vec![device_id.clone()],
            name: name.to_string(),
            manufacturer: MANUFACTURER.to_string(),
        };

        let climate = ClimateDiscovery {
            name: name.to_string(),
            unique_id: device_id.clone(),

            current_temperature_topic: state.temperature.clone(),
            mode_state_topic: state.mode.clone(),
            temperature_state_topic: state.target_temperature.clone(),
            fan_mode_state_topic: state.fan_speed.clone(),
            hold_state_topic: state.power_level.clone(),
            swing_mode_state_topic: state.timer.clone(),
            availability_topic: state.availability.clone(),

            mode_command_topic: command.mode.clone(),
            temperature_command_topic: command.target_temperature.clone(),
            fan_mode_command_topic: command.fan_speed.clone(),
            hold_command_topic: command.power_level.clone(),
            swing_mode_command_topic: command.timer.clone(),

            temp_step: units.temp_step,
            hold_modes: ["1", "2", "3", "4", "5"].map(String::from).to_vec(),
            modes: ["off", "heat"].map(String::from).to_vec(),
            fan_modes: FAN_SPEED_NAMES
                .iter()
                .map(|(_, label)| label.to_string())
                .collect(),
            swing_modes: ["on", "off"].map(String::from).to_vec(),

            device: device.clone(),
        };

        let sensor = |object_id: &str,
                      label: &str,
                      state_topic: &str,
                      device_class: Option<&str>,
                      unit: Option<&str>| DiscoveryAnnouncement {
            topic: format!(
                "{}/sensor/{}_{}/config",
                mqtt.discovery_prefix, device_id, object_id
            ),
            payload: DiscoveryPayload::Sensor(SensorDiscovery {
                name: format!("{} ({})", name, label),
                unique_id: format!("{}_{}", device_id, object_id),
                state_topic: state_topic.to_string(),
                availability_topic: state.availability.clone(),
                device_class: device_class.map(String::from),
                unit_of_measurement: unit.map(String::from),
                device: device.clone(),
            }),
        };

        let discovery = vec![
            DiscoveryAnnouncement {
                topic: format!("{}/climate/{}/config", mqtt.discovery_prefix, device_id),
                payload: DiscoveryPayload::Climate(climate),
            },
            sensor("status", "status", &state.status, None, None),
            sensor(
                "exit_temp",
                "exit temperature",
                &state.exit_temperature,
                Some("temperature"),
                Some(units.temperature_unit.as_str()),
            ),
            sensor(
                "fumes_temp",
                "fumes temperature",
                &state.fumes_temperature,
                Some("temperature"),
                Some(units.temperature_unit.as_str()),
            ),
            sensor(
                "pellet_qty",
                "pellet quantity",
                &state.pellet_quantity,
                None,
                Some(units.pellet_quantity_unit.as_str()),
            ),
        ];

        DeviceTopics {
            state,
            command,
            discovery,
        }
    }

    pub fn command_for_topic(&self, topic: &str) -> Option<CommandKind> {
        self.command
            .iter()
            .find(|(_, command_topic)| *command_topic == topic)
            .map(|(kind, _)| kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn topics() -> DeviceTopics {
        let config = Config::default();
        DeviceTopics::build(
            &"AA_BB_CC_DD_EE_FF".to_string(),
            "Living room",
            &config.mqtt,
            &config.units,
        )
    }

    #[test]
    fn test_state_and_command_topics() {
        let topics = topics();

        assert_eq!(topics.state.temperature, "palazzetti/state/AA_BB_CC_DD_EE_FF/temp");
        assert_eq!(
            topics.state.availability,
            "palazzetti/state/AA_BB_CC_DD_EE_FF/availability"
        );
        assert_eq!(
            topics.state.pellet_quantity,
            "palazzetti/state/AA_BB_CC_DD_EE_FF/pellet_qty"
        );
        assert_eq!(topics.command.mode, "palazzetti/command/AA_BB_CC_DD_EE_FF/mode");
        assert_eq!(
            topics.command.target_temperature,
            "palazzetti/command/AA_BB_CC_DD_EE_FF/target_temp"
        );
    }

    #[test]
    fn test_command_for_topic() {
        let topics = topics();

        for (kind, topic) in topics.command.iter() {
            assert_eq!(topics.command_for_topic(topic), Some(kind));
        }
        assert_eq!(
            topics.command_for_topic("palazzetti/state/AA_BB_CC_DD_EE_FF/mode"),
            None
        );
        assert_eq!(topics.command_for_topic("palazzetti/reset"), None);
    }

    #[test]
    fn test_build_is_deterministic() {
        let first = topics();
        let second = topics();

        assert_eq!(first, second);

        let serialize = |topics: &DeviceTopics| -> Vec<String> {
            topics
                .discovery
                .iter()
                .map(|a| serde_json::to_string(&a.payload).unwrap())
                .collect()
        };
        assert_eq!(serialize(&first), serialize(&second));
    }

    #[test]
    fn test_discovery_announcements() {
        let topics = topics();
        let discovery_topics: Vec<&str> =
            topics.discovery.iter().map(|a| a.topic.as_str()).collect();

        assert_eq!(
            discovery_topics,
            vec![
                "homeassistant/climate/AA_BB_CC_DD_EE_FF/config",
                "homeassistant/sensor/AA_BB_CC_DD_EE_FF_status/config",
                "homeassistant/sensor/AA_BB_CC_DD_EE_FF_exit_temp/config",
                "homeassistant/sensor/AA_BB_CC_DD_EE_FF_fumes_temp/config",
                "homeassistant/sensor/AA_BB_CC_DD_EE_FF_pellet_qty/config",
            ]
        );

        let climate = serde_json::to_value(&topics.discovery[0].payload).unwrap();
        assert_eq!(climate["name"], "Living room");
        assert_eq!(climate["modes"], serde_json::json!(["off", "heat"]));
        assert_eq!(
            climate["fan_modes"],
            serde_json::json!(["off", "1", "2", "3", "4", "5", "hi", "auto"])
        );
        assert_eq!(climate["hold_modes"], serde_json::json!(["1", "2", "3", "4", "5"]));
        assert_eq!(
            climate["mode_command_topic"],
            "palazzetti/command/AA_BB_CC_DD_EE_FF/mode"
        );
        assert_eq!(climate["device"]["manufacturer"], "Palazzetti");

        let status = serde_json::to_value(&topics.discovery[1].payload).unwrap();
        assert_eq!(status["name"], "Living room (status)");
        assert!(status.get("device_class").is_none());

        let exit_temp = serde_json::to_value(&topics.discovery[2].payload).unwrap();
        assert_eq!(exit_temp["device_class"], "temperature");
        assert_eq!(exit_temp["unit_of_measurement"], "°C");
    }

    #[test]
    fn test_custom_prefixes() {
        let mut config = Config::default();
        config.mqtt.state_prefix = "stoves/state".to_string();
        config.mqtt.command_prefix = "stoves/set".to_string();
        config.mqtt.discovery_prefix = "ha".to_string();

        let topics = DeviceTopics::build(&"X".to_string(), "X", &config.mqtt, &config.units);

        assert_eq!(topics.state.mode, "stoves/state/X/mode");
        assert_eq!(topics.command.timer, "stoves/set/X/timer");
        assert_eq!(topics.discovery[0].topic, "ha/climate/X/config");
    }
}
