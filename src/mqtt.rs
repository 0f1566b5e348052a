use crate::prelude::*;

use crate::channels::Notification;
use crate::command::Command;
use crate::coordinator::{BatteryConnection, Coordinator};
use crate::inputs::Inputs;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

const PUBLISH_ATTEMPTS: u32 = 3;

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    pub fn for_snapshot(battery: &str, snapshot: &RegisterSnapshot) -> Result<Message> {
        let mut values: BTreeMap<&str, serde_json::Value> = snapshot
            .iter()
            .map(|(name, value)| (name, serde_json::json!(value)))
            .collect();
        if let Some(kwh) = snapshot.stored_energy_kwh() {
            values.insert("stored_energy", serde_json::json!(kwh));
        }
        if let Some(pct) = snapshot.round_trip_efficiency() {
            values.insert("round_trip_efficiency", serde_json::json!(pct));
        }
        if let Some(at) = snapshot.taken_at {
            values.insert("taken_at", serde_json::json!(at.to_rfc3339()));
        }

        Ok(Message {
            topic: format!("{}/state", battery),
            retain: true,
            payload: serde_json::to_string(&values)?,
        })
    }

    pub fn for_notification(notification: &Notification) -> Result<Message> {
        Ok(Message {
            topic: "notification".to_owned(),
            retain: false,
            payload: serde_json::to_string(notification)?,
        })
    }

    pub fn to_command(&self) -> Result<Command> {
        use Command::*;

        let parts: Vec<&str> = self.topic.split('/').collect();

        let r = match parts[..] {
            ["input", "consumption"] => Consumption(self.payload_float()?),
            ["input", "solar_forecast"] => SolarForecast(self.payload_float().ok()),
            ["input", "house_load"] => HouseLoad(self.payload_float()?),
            ["input", "manual_mode"] => ManualMode(self.payload_bool()),
            ["input", "override"] => PredictiveOverride(self.payload_bool()),
            ["input", "device", device] => DevicePower(device.to_owned(), self.payload_float()?),
            ["cmd", battery, "read", register] => ReadRegister {
                battery: battery.to_owned(),
                register: register.to_owned(),
            },
            ["cmd", battery, "write", register] => WriteRegister {
                battery: battery.to_owned(),
                register: register.to_owned(),
                value: self.payload_float()?,
            },
            ["config", "control"] => SetControl(self.payload_json()?),
            ["config", battery, "limits"] => SetBatteryLimits {
                battery: battery.to_owned(),
                limits: self.payload_json()?,
            },
            [..] => bail!("unhandled: {:?}", self),
        };

        Ok(r)
    }

    fn payload_float(&self) -> Result<f64> {
        let value: f64 = self
            .payload
            .trim()
            .parse()
            .map_err(|err| anyhow!("payload_float: {}", err))?;
        if !value.is_finite() {
            bail!("payload_float: {} is not a number", self.payload);
        }
        Ok(value)
    }

    fn payload_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.payload).map_err(|err| anyhow!("payload_json: {}", err))
    }

    fn payload_bool(&self) -> bool {
        matches!(
            self.payload.trim().to_ascii_lowercase().as_str(),
            "1" | "t" | "true" | "on" | "y" | "yes"
        )
    }
} // }}}

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    coordinator: Coordinator,
    inputs: Inputs,
}

impl Mqtt {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        coordinator: Coordinator,
        inputs: Inputs,
    ) -> Self {
        Self {
            config,
            channels,
            coordinator,
            inputs,
        }
    }

    /// Runs until `stop` fires. The broker publishes our last will when the connection
    /// goes away.
    pub async fn start(&self, mut stop: broadcast::Receiver<()>) -> Result<()> {
        let c = self.config.mqtt();

        let mut options = MqttOptions::new("venus-energy-manager", c.host(), c.port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(std::time::Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        tokio::select! {
            r = async {
                futures::try_join!(
                    self.setup(client.clone()),
                    self.receiver(eventloop),
                    self.sender(client.clone()),
                    self.dispatcher(),
                    self.snapshots(),
                    self.notifications()
                )
            } => { r?; }
            _ = stop.recv() => info!("mqtt stopping"),
        }

        Ok(())
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        let ns = self.config.mqtt().namespace().to_owned();

        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        client
            .subscribe(format!("{}/input/#", ns), QoS::AtMostOnce)
            .await?;

        client
            .subscribe(format!("{}/config/#", ns), QoS::AtMostOnce)
            .await?;

        for battery in self.coordinator.batteries() {
            client
                .subscribe(format!("{}/cmd/{}/#", ns, battery.name()), QoS::AtMostOnce)
                .await?;
        }

        Ok(())
    }

    // mqtt -> dispatcher
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if let Err(err) = self.handle_message(publish) {
                        warn!("{:#}", err);
                    }
                }
                Err(e) => {
                    error!("{}", e);
                    info!("reconnecting in 5s");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
                _ => {} // keepalives etc
            }
        }
    }

    fn handle_message(&self, publish: Publish) -> Result<()> {
        // remove the namespace, including the first /
        // doing it this way means we don't break if namespace happens to contain a /
        let topic = publish
            .topic
            .get(self.config.mqtt().namespace().len() + 1..)
            .ok_or_else(|| anyhow!("ignoring badly formed MQTT topic: {}", publish.topic))?
            .to_owned();

        let message = Message {
            topic,
            retain: publish.retain,
            payload: String::from_utf8(publish.payload.to_vec())?,
        };
        debug!("RX: {:?}", message);

        if self.channels.from_mqtt.send(message).is_err() {
            bail!("send(from_mqtt) failed - channel closed?");
        }

        Ok(())
    }

    async fn dispatcher(&self) -> Result<()> {
        let mut receiver = self.channels.from_mqtt.subscribe();

        loop {
            let message = match receiver.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(n)) => {
                    warn!("dispatcher lagged, {} messages dropped", n);
                    continue;
                }
                Err(RecvError::Closed) => return Ok(()),
            };

            match message.to_command() {
                Ok(command) => self.process_command(command).await,
                Err(err) => warn!("{:#}", err),
            }
        }
    }

    pub async fn process_command(&self, command: Command) {
        use Command::*;

        let result_topic = command.to_result_topic();

        let result = match command {
            Consumption(w) => {
                self.inputs.set_consumption(w);
                return;
            }
            SolarForecast(kwh) => {
                self.inputs.set_solar_forecast(kwh);
                return;
            }
            HouseLoad(w) => {
                self.inputs.set_house_load(w);
                return;
            }
            DevicePower(device, w) => {
                self.inputs.set_device_power(&device, w);
                return;
            }
            ManualMode(on) => {
                self.inputs.set_manual_mode(on);
                return;
            }
            PredictiveOverride(on) => {
                self.inputs.set_predictive_override(on);
                return;
            }
            ReadRegister { battery, register } => {
                self.coordinator.read(&battery, &[register.as_str()]).await
            }
            WriteRegister {
                battery,
                register,
                value,
            } => {
                let writes = BTreeMap::from([(register, value)]);
                self.coordinator
                    .write_atomic(&battery, &writes)
                    .await
                    .and_then(|outcome| match outcome.mismatches.first() {
                        Some(mismatch) => Err(mismatch.clone().into()),
                        None => Ok(outcome.confirmed),
                    })
            }
            SetControl(update) => {
                let control = update.applied_to(self.config.control());
                let applied = BTreeMap::from([
                    ("kp".to_owned(), control.kp),
                    ("kd".to_owned(), control.kd),
                    ("deadband".to_owned(), control.deadband),
                    ("max_power_change".to_owned(), control.max_power_change),
                    ("direction_hysteresis".to_owned(), control.direction_hysteresis),
                ]);
                self.config.set_control(control).map(|_| applied)
            }
            SetBatteryLimits { battery, limits } => self
                .config
                .set_battery_limits(&battery, limits)
                .map(|_| {
                    BTreeMap::from([
                        ("max_charge_power".to_owned(), limits.max_charge_power as f64),
                        ("max_discharge_power".to_owned(), limits.max_discharge_power as f64),
                        ("min_soc".to_owned(), limits.min_soc as f64),
                        ("max_soc".to_owned(), limits.max_soc as f64),
                    ])
                }),
        };

        let payload = match result {
            Ok(values) => serde_json::to_string(&values).unwrap_or_else(|_| "OK".to_owned()),
            Err(err) => {
                warn!("command failed: {:#}", err);
                "FAIL".to_owned()
            }
        };

        if let Some(topic) = result_topic {
            self.publish(Message {
                topic,
                retain: false,
                payload,
            });
        }
    }

    fn publish(&self, message: Message) {
        if self.channels.to_mqtt.send(message).is_err() {
            warn!("send(to_mqtt) failed - channel closed?");
        }
    }

    async fn snapshots(&self) -> Result<()> {
        let watchers = self
            .coordinator
            .batteries()
            .iter()
            .map(|b| self.watch_battery(b.clone()));
        futures::future::try_join_all(watchers).await?;
        Ok(())
    }

    async fn watch_battery(&self, battery: Arc<BatteryConnection>) -> Result<()> {
        let mut rx = battery.cache.subscribe();

        loop {
            rx.changed().await?;
            let snapshot = rx.borrow_and_update().clone();
            self.publish(Message::for_snapshot(battery.name(), &snapshot)?);
        }
    }

    async fn notifications(&self) -> Result<()> {
        let mut receiver = self.channels.notifications.subscribe();

        loop {
            match receiver.recv().await {
                Ok(n) => self.publish(Message::for_notification(&n)?),
                Err(RecvError::Lagged(n)) => warn!("{} notifications dropped", n),
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }

    // engine -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            let message = match receiver.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(n)) => {
                    warn!("mqtt sender lagged, {} messages dropped", n);
                    continue;
                }
                Err(RecvError::Closed) => return Ok(()),
            };

            let topic = format!("{}/{}", self.config.mqtt().namespace(), message.topic);
            debug!("publishing: {} = {}", topic, message.payload);

            for attempt in 1..=PUBLISH_ATTEMPTS {
                match client
                    .publish(&topic, QoS::AtLeastOnce, message.retain, message.payload.as_bytes())
                    .await
                {
                    Ok(_) => break,
                    Err(err) => {
                        error!(
                            "MQTT publish failed: {:?} - retrying in 10s (attempt {}/{})",
                            err, attempt, PUBLISH_ATTEMPTS
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                    }
                }
            }
        }
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, payload: &str) -> Message {
        Message {
            topic: topic.to_owned(),
            retain: false,
            payload: payload.to_owned(),
        }
    }

    #[test]
    fn input_topics() {
        assert_eq!(
            message("input/consumption", "512.5").to_command().unwrap(),
            Command::Consumption(512.5)
        );
        assert_eq!(
            message("input/solar_forecast", "unavailable").to_command().unwrap(),
            Command::SolarForecast(None)
        );
        assert_eq!(
            message("input/manual_mode", "ON").to_command().unwrap(),
            Command::ManualMode(true)
        );
        assert_eq!(
            message("input/device/ev_charger", "3000").to_command().unwrap(),
            Command::DevicePower("ev_charger".to_owned(), 3000.0)
        );
        assert!(message("input/consumption", "NaN").to_command().is_err());
    }

    #[test]
    fn battery_commands() {
        assert_eq!(
            message("cmd/garage/write/max_charge_power", "1200").to_command().unwrap(),
            Command::WriteRegister {
                battery: "garage".to_owned(),
                register: "max_charge_power".to_owned(),
                value: 1200.0
            }
        );
        assert!(message("cmd/garage/explode", "").to_command().is_err());
    }

    #[test]
    fn config_topics() {
        assert_eq!(
            message("config/control", r#"{"kp": 0.3}"#).to_command().unwrap(),
            Command::SetControl(config::ControlUpdate {
                kp: Some(0.3),
                ..Default::default()
            })
        );
        assert_eq!(
            message(
                "config/garage/limits",
                r#"{"max_charge_power": 1500, "max_discharge_power": 2000, "min_soc": 15, "max_soc": 90}"#
            )
            .to_command()
            .unwrap(),
            Command::SetBatteryLimits {
                battery: "garage".to_owned(),
                limits: config::BatteryLimits {
                    max_charge_power: 1500,
                    max_discharge_power: 2000,
                    min_soc: 15,
                    max_soc: 90,
                },
            }
        );
        assert!(message("config/garage/limits", r#"{"min_soc": 15}"#).to_command().is_err());
        assert!(message("config/control", "fast").to_command().is_err());
    }

    #[test]
    fn snapshot_payload() {
        let at = chrono::Local::now();
        let snapshot = RegisterSnapshot::merged(
            &RegisterSnapshot::default(),
            vec![("battery_soc", 50.0), ("battery_total_energy", 5.12)],
            at,
        );
        let m = Message::for_snapshot("garage", &snapshot).unwrap();
        assert_eq!(m.topic, "garage/state");
        assert!(m.retain);

        let v: serde_json::Value = serde_json::from_str(&m.payload).unwrap();
        assert_eq!(v["battery_soc"], 50.0);
        assert_eq!(v["stored_energy"], 2.56);
        assert!(v.get("round_trip_efficiency").is_none());
    }
}
