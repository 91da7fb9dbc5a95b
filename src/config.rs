use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::time::Duration;

fn default_client_id() -> String {
    "cbox".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_state_prefix() -> String {
    "palazzetti/state".to_string()
}

fn default_command_prefix() -> String {
    "palazzetti/command".to_string()
}

fn default_reset_topic() -> String {
    "palazzetti/reset".to_string()
}

fn default_true() -> bool {
    true
}

fn default_refresh_delays() -> Vec<f64> {
    vec![3.0, 5.0, 10.0, 30.0]
}

fn default_refresh_randomness() -> f64 {
    2.0
}

fn default_offline_timeout() -> u64 {
    120
}

fn default_temperature_unit() -> String {
    "°C".to_string()
}

fn default_temp_step() -> f64 {
    1.0
}

fn default_pellet_quantity_unit() -> String {
    "kg".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Deserialize, Debug)]
pub struct MqttConfig {
    /// Client name; a random suffix is added when connecting
    #[serde(default = "default_client_id")]
    pub id: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_state_prefix")]
    pub state_prefix: String,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default = "default_reset_topic")]
    pub reset_topic: String,

    /// Announce devices on the discovery prefix
    #[serde(default = "default_true")]
    pub discovery: bool,
    #[serde(default = "default_true")]
    pub config_retain: bool,
    #[serde(default = "default_true")]
    pub state_retain: bool,

    /// Unsubscribe and retract discovery announcements on shutdown
    #[serde(default)]
    pub unregister_on_exit: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            id: default_client_id(),
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            discovery_prefix: default_discovery_prefix(),
            state_prefix: default_state_prefix(),
            command_prefix: default_command_prefix(),
            reset_topic: default_reset_topic(),
            discovery: true,
            config_retain: true,
            state_retain: true,
            unregister_on_exit: false,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct RefreshConfig {
    /// Seconds between refreshes, walked through while nothing happens on the bus
    #[serde(default = "default_refresh_delays")]
    pub delays: Vec<f64>,
    #[serde(default = "default_refresh_randomness")]
    pub randomness: f64,
    /// Seconds without a successful poll before a device is reported offline
    #[serde(default = "default_offline_timeout")]
    pub offline_timeout: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            delays: default_refresh_delays(),
            randomness: default_refresh_randomness(),
            offline_timeout: default_offline_timeout(),
        }
    }
}

impl RefreshConfig {
    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout)
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct UnitsConfig {
    #[serde(default = "default_temperature_unit")]
    pub temperature_unit: String,
    /// Target temperature resolution; 0.2 switches to fractional setpoints
    #[serde(default = "default_temp_step")]
    pub temp_step: f64,
    #[serde(default = "default_pellet_quantity_unit")]
    pub pellet_quantity_unit: String,
}

impl Default for UnitsConfig {
    fn default() -> Self {
        UnitsConfig {
            temperature_unit: default_temperature_unit(),
            temp_step: default_temp_step(),
            pellet_quantity_unit: default_pellet_quantity_unit(),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct DeviceConfig {
    pub name: String,
    pub hostname: String,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub units: UnitsConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            mqtt: MqttConfig::default(),
            refresh: RefreshConfig::default(),
            units: UnitsConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.refresh.delays.is_empty(),
            "refresh.delays must contain at least one delay"
        );
        ensure!(
            self.refresh.delays.iter().all(|d| d.is_finite() && *d >= 0.0),
            "refresh.delays must be finite and not negative"
        );
        ensure!(
            self.refresh.randomness.is_finite() && self.refresh.randomness >= 0.0,
            "refresh.randomness must be finite and not negative"
        );
        ensure!(
            self.refresh.offline_timeout > 0,
            "refresh.offline_timeout must be positive"
        );
        ensure!(self.units.temp_step > 0.0, "units.temp_step must be positive");

        Ok(())
    }
}

fn parse_config(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Config> {
    let settings = builder.build()?;

    let config: Config = settings.try_deserialize().context(
        "Failed to deserialize config, compare your config file to Settings.toml.example!",
    )?;
    config.validate()?;

    Ok(config)
}

pub fn read_config() -> Result<Config> {
    let root = std::env::current_dir()?;
    let sample_path = root.join("Settings.toml.example");

    let path = root.join("Settings.toml");

    if !path.exists() && std::env::var("SKIP_SAMPLE_CONFIG").is_err() {
        println!("Settings.toml not found, generating sample configuration.");
        println!("Set SKIP_SAMPLE_CONFIG environment variable to opt out of this behavior.");
        std::fs::copy(&sample_path, &path).with_context(|| {
            format!("Failed to copy {} to {}", sample_path.display(), path.display())
        })?;
    }

    let builder = config::Config::builder()
        .add_source(config::File::with_name("Settings"))
        .add_source(config::File::with_name("Settings.local").required(false))
        .add_source(config::Environment::with_prefix("PALAZZETTI").separator("__"));

    parse_config(builder)
}
