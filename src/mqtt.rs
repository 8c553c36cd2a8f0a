use crate::daemon::{self, Sensor};
use anyhow::{bail, Context, Result};
use log::*;
use paho_mqtt as mqtt;
use pzem004t_lib::{protocol as proto, tokio_sync_safe_client::SafeClient};
use serde::Deserialize;
use std::fs::File;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Prefix of all published topics
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Quality of service code to use
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Meters to poll, replaces the addresses given on the command line.
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub address: proto::Address,
    /// Topic prefix of this meter, defaults to `<topic>/<address>`.
    pub topic: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
}

impl From<&SensorConfig> for Sensor {
    fn from(config: &SensorConfig) -> Self {
        Self {
            name: config.name.clone(),
            address: config.address,
            poll_interval: config.poll_interval,
        }
    }
}

fn default_client_id() -> String {
    format!("pzemcol-{}", std::process::id())
}

fn default_topic() -> String {
    String::from("pzem004t")
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

impl MqttConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "pzem004t_mqtt.yml";

    pub fn load(path: &str) -> Result<Self> {
        debug!("Loading MQTT config file from {path:?}");
        let file = File::open(path).with_context(|| format!("Cannot open config file {path}"))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Cannot parse config file {path}"))?;
        config.qos()?;
        Ok(config)
    }

    pub fn qos(&self) -> Result<i32> {
        if self.qos > 2 {
            bail!("Invalid MQTT qos {}, must be 0, 1 or 2", self.qos);
        }
        Ok(self.qos as i32)
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/{}", self.topic, MQTT_APPENDIX_AVAILABILITY)
    }

    /// Topic prefix of the meter at `address`.
    pub fn sensor_topic(&self, address: proto::Address) -> String {
        self.sensors
            .iter()
            .find(|s| s.address == address)
            .and_then(|s| s.topic.clone())
            .unwrap_or_else(|| format!("{}/{}", self.topic, address))
    }

    pub fn measurement_topic(&self, address: proto::Address, appendix: &str) -> String {
        format!("{}/{}", self.sensor_topic(address), appendix)
    }

    /// The configured meters, or `fallback` if the file lists none.
    pub fn sensors_or(&self, fallback: Vec<Sensor>) -> Vec<Sensor> {
        if self.sensors.is_empty() {
            fallback
        } else {
            self.sensors.iter().map(Sensor::from).collect()
        }
    }
}

const MQTT_APPENDIX_AVAILABILITY: &str = "availability";

/// Topic appendix and payload of every published quantity.
pub fn measurement_payloads(measurement: &proto::Measurement) -> [(&'static str, String); 6] {
    [
        ("voltage", format!("{:.1}", measurement.voltage)),
        ("current", format!("{:.3}", measurement.current)),
        ("power", format!("{:.1}", measurement.power)),
        ("energy", measurement.energy.to_string()),
        ("frequency", format!("{:.1}", measurement.frequency)),
        ("pf", format!("{:.2}", measurement.power_factor)),
    ]
}

fn publish_availability(client: &mqtt::Client, config: &MqttConfig, online: bool) -> Result<()> {
    let payload = if online { "online" } else { "offline" };
    let msg = mqtt::Message::new_retained(config.availability_topic(), payload, config.qos()?);
    client
        .publish(msg)
        .with_context(|| "Cannot publish mqtt message")
}

fn publish_measurement(
    client: &mqtt::Client,
    config: &MqttConfig,
    sensor: &Sensor,
    measurement: &proto::Measurement,
) -> Result<()> {
    for (appendix, payload) in measurement_payloads(measurement) {
        let msg = mqtt::Message::new(
            config.measurement_topic(sensor.address, appendix),
            payload,
            config.qos()?,
        );
        client
            .publish(msg)
            .with_context(|| "Cannot publish mqtt message")?;
    }
    debug!(
        "[{}] Published measurement to {}",
        sensor.name,
        config.sensor_topic(sensor.address)
    );
    Ok(())
}

/// Polls the meters and publishes every reading until publishing fails.
///
/// Meters listed in the config file replace `sensors`.
pub fn run_daemon(
    client: &mut SafeClient,
    sensors: Vec<Sensor>,
    poll_interval: Duration,
    retry_interval: Duration,
    delay: Duration,
    config_file: &str,
) -> Result<()> {
    let config = MqttConfig::load(config_file)?;
    trace!("MQTT config: {config:?}");
    let sensors = config.sensors_or(sensors);
    info!("Polling {} sensor(s): {sensors:?}", sensors.len());
    let mut schedule =
        daemon::Schedule::new(sensors, poll_interval, retry_interval, Instant::now());

    let create_opts = mqtt::CreateOptionsBuilder::new()
        .server_uri(config.url.as_str())
        .client_id(config.client_id.as_str())
        .finalize();
    let mut mqtt_client =
        mqtt::Client::new(create_opts).with_context(|| "Error creating mqtt client")?;
    mqtt_client.set_timeout(config.timeout);

    let last_will =
        mqtt::Message::new_retained(config.availability_topic(), "offline", config.qos()?);
    let mut conn_builder = mqtt::ConnectOptionsBuilder::new();
    conn_builder
        .keep_alive_interval(Duration::from_secs(20))
        .clean_session(true)
        .will_message(last_will);
    if let Some(user_name) = &config.username {
        conn_builder.user_name(user_name.as_str());
    }
    if let Some(password) = &config.password {
        conn_builder.password(password.as_str());
    }
    let conn_opts = conn_builder.finalize();

    info!("Connecting to MQTT broker {}", config.url);
    mqtt_client
        .connect(conn_opts)
        .with_context(|| format!("Mqtt client unable to connect to {}", config.url))?;
    publish_availability(&mqtt_client, &config, true)?;

    let result = daemon::run(client, &mut schedule, delay, |sensor, measurement| {
        publish_measurement(&mqtt_client, &config, sensor, measurement)
    });

    info!("Stopping MQTT publishing");
    if let Err(err) = publish_availability(&mqtt_client, &config, false) {
        warn!("Cannot publish offline state: {err:#}");
    }
    if let Err(err) = mqtt_client.disconnect(None) {
        warn!("Error disconnecting mqtt client: {err}");
    }
    result
}
