//! Actuator notification.
//!
//! The controller only decides ON/OFF. Whatever switches the lights or the air
//! conditioning listens through an [`ActuatorNotifier`], which receives one
//! [`Transition`] per state change, never per frame.

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::mpsc::Sender;

use crate::activity_log::TIMESTAMP_FORMAT;
use crate::controller::ActuatorState;

/// One ON/OFF change of a stream's actuator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub stream: String,
    pub state: ActuatorState,
    #[serde(with = "crate::activity_log::log_timestamp")]
    pub at: NaiveDateTime,
}

impl Transition {
    /// Human-readable notice, e.g. `[2024-05-01 12:00:03] Lights ON`.
    pub fn notice(&self) -> String {
        format!("[{}] Lights {}", self.at.format(TIMESTAMP_FORMAT), self.state)
    }
}

pub trait ActuatorNotifier: Send {
    fn notify(&mut self, transition: &Transition) -> Result<()>;
}

/// Emits notices through the `log` facade: ON at info, OFF at warn.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl ActuatorNotifier for LogNotifier {
    fn notify(&mut self, transition: &Transition) -> Result<()> {
        match transition.state {
            ActuatorState::On => log::info!("{}: {}", transition.stream, transition.notice()),
            ActuatorState::Off => log::warn!("{}: {}", transition.stream, transition.notice()),
        }
        Ok(())
    }
}

/// Forwards transitions to a channel.
#[derive(Debug)]
pub struct ChannelNotifier {
    tx: Sender<Transition>,
}

impl ChannelNotifier {
    pub fn new(tx: Sender<Transition>) -> Self {
        Self { tx }
    }
}

impl ActuatorNotifier for ChannelNotifier {
    fn notify(&mut self, transition: &Transition) -> Result<()> {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(transition.clone());
        Ok(())
    }
}

#[cfg(feature = "actuator-mqtt")]
pub use mqtt::{MqttNotifier, MqttSettings};

#[cfg(feature = "actuator-mqtt")]
mod mqtt {
    use anyhow::{anyhow, Context, Result};
    use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;
    use std::time::Duration;

    use super::{ActuatorNotifier, Transition};

    const PAYLOAD_ONLINE: &str = "online";
    const PAYLOAD_OFFLINE: &str = "offline";
    const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(500);
    const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(5);
    const REQUEST_CAPACITY: usize = 10;

    #[derive(Clone, Debug)]
    pub struct MqttSettings {
        /// `host:port`, optionally prefixed with `mqtt://` or `tcp://`.
        pub broker_addr: String,
        pub topic_prefix: String,
        pub client_id: String,
    }

    /// Latest state that could not be queued while the broker was away.
    type PendingState = Arc<Mutex<Option<(String, Vec<u8>)>>>;

    /// Publishes retained `ON`/`OFF` payloads to `<prefix>/<stream>/state`.
    ///
    /// `<prefix>/<stream>/availability` carries `online`, with a last-will of
    /// `offline` so subscribers notice a crashed daemon.
    ///
    /// The connection thread reconnects with backoff until the notifier is
    /// dropped. While the broker is unreachable and the request queue is full,
    /// only the newest state is kept and it is published on the next CONNACK.
    pub struct MqttNotifier {
        client: Client,
        topic_prefix: String,
        pending: PendingState,
        stop: Arc<AtomicBool>,
        connection_handle: Option<JoinHandle<()>>,
    }

    impl MqttNotifier {
        pub fn connect(settings: &MqttSettings, stream: &str) -> Result<Self> {
            let (host, port) = split_host_port(&settings.broker_addr)?;
            let availability = format!("{}/{}/availability", settings.topic_prefix, stream);

            let mut options =
                MqttOptions::new(format!("{}-{}", settings.client_id, stream), host, port);
            options.set_keep_alive(Duration::from_secs(60));
            options.set_clean_start(true);
            options.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
                availability.clone(),
                PAYLOAD_OFFLINE.as_bytes().to_vec(),
                QoS::AtLeastOnce,
                true,
                None,
            ));

            let (client, connection) = Client::new(options, REQUEST_CAPACITY);
            let pending: PendingState = Arc::new(Mutex::new(None));
            let stop = Arc::new(AtomicBool::new(false));
            let handle = {
                let driver = ConnectionDriver {
                    client: client.clone(),
                    availability,
                    pending: Arc::clone(&pending),
                    stop: Arc::clone(&stop),
                };
                std::thread::Builder::new()
                    .name(format!("mqtt-{}", stream))
                    .spawn(move || driver.run(connection))
                    .context("spawn MQTT connection thread")?
            };
            log::info!(
                "MqttNotifier: publishing {} transitions to {}",
                stream,
                settings.broker_addr
            );

            Ok(Self {
                client,
                topic_prefix: settings.topic_prefix.clone(),
                pending,
                stop,
                connection_handle: Some(handle),
            })
        }

        fn connection_alive(&self) -> bool {
            self.connection_handle
                .as_ref()
                .map_or(false, |handle| !handle.is_finished())
        }
    }

    impl ActuatorNotifier for MqttNotifier {
        fn notify(&mut self, transition: &Transition) -> Result<()> {
            let topic = format!("{}/{}/state", self.topic_prefix, transition.stream);
            let payload = transition.state.as_str().as_bytes().to_vec();
            match self
                .client
                .try_publish(topic.clone(), QoS::AtLeastOnce, true, payload.clone())
            {
                Ok(()) => {
                    if let Ok(mut pending) = self.pending.lock() {
                        pending.take();
                    }
                    Ok(())
                }
                Err(err) if self.connection_alive() => {
                    log::debug!("MQTT queue full ({}); holding {} until reconnect", err, topic);
                    let mut pending = self
                        .pending
                        .lock()
                        .map_err(|_| anyhow!("MQTT pending state lock poisoned"))?;
                    *pending = Some((topic, payload));
                    Ok(())
                }
                Err(err) => Err(anyhow!("publish MQTT state: {}", err)),
            }
        }
    }

    impl Drop for MqttNotifier {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Err(err) = self.client.try_disconnect() {
                log::debug!("MQTT disconnect not queued: {}", err);
            }
            if let Some(handle) = self.connection_handle.take() {
                let _ = handle.join();
            }
        }
    }

    struct ConnectionDriver {
        client: Client,
        availability: String,
        pending: PendingState,
        stop: Arc<AtomicBool>,
    }

    impl ConnectionDriver {
        /// Polls the event loop until stopped. Iterating after an error makes
        /// rumqttc dial the broker again.
        fn run(self, mut connection: Connection) {
            let mut backoff = RECONNECT_BACKOFF_MIN;
            let mut announce = false;
            for event in connection.iter() {
                if self.stop.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(event) => {
                        if let Event::Incoming(Incoming::ConnAck(_)) = event {
                            backoff = RECONNECT_BACKOFF_MIN;
                            announce = true;
                        }
                        // The queue may still be full right after CONNACK; retry on
                        // later events as the event loop drains it.
                        if announce {
                            announce = !self.flush();
                        }
                    }
                    Err(e) => {
                        log::warn!("MQTT connection error: {}. Reconnecting in {:?}", e, backoff);
                        self.pause(backoff);
                        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                    }
                }
            }
        }

        /// Publishes availability, then any held state. False if the queue had
        /// no room.
        fn flush(&self) -> bool {
            let online = PAYLOAD_ONLINE.as_bytes().to_vec();
            if self
                .client
                .try_publish(self.availability.clone(), QoS::AtLeastOnce, true, online)
                .is_err()
            {
                return false;
            }
            let Ok(mut pending) = self.pending.lock() else {
                return true;
            };
            match pending.take() {
                Some((topic, payload)) => {
                    match self
                        .client
                        .try_publish(topic.clone(), QoS::AtLeastOnce, true, payload.clone())
                    {
                        Ok(()) => true,
                        Err(_) => {
                            *pending = Some((topic, payload));
                            false
                        }
                    }
                }
                None => true,
            }
        }

        fn pause(&self, total: Duration) {
            let step = Duration::from_millis(50);
            let mut waited = Duration::ZERO;
            while waited < total && !self.stop.load(Ordering::SeqCst) {
                std::thread::sleep(step);
                waited += step;
            }
        }
    }

    pub(super) fn split_host_port(addr: &str) -> Result<(String, u16)> {
        let mut addr = addr.trim();
        if let Some((scheme, rest)) = addr.split_once("://") {
            match scheme {
                "mqtt" | "tcp" => {}
                other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
            }
            addr = rest;
        }
        if let Some(rest) = addr.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
            let port: u16 = port.parse().context("invalid MQTT port")?;
            return Ok((host.to_string(), port));
        }

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        Ok((host.to_string(), port))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::controller::ActuatorState;
        use chrono::NaiveDate;
        use std::io::{Read, Write};
        use std::net::TcpListener;
        use std::time::Instant;

        fn free_port() -> u16 {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        }

        fn settings(port: u16) -> MqttSettings {
            MqttSettings {
                broker_addr: format!("127.0.0.1:{}", port),
                topic_prefix: "test".to_string(),
                client_id: "occupancy-test".to_string(),
            }
        }

        fn transition(state: ActuatorState) -> Transition {
            Transition {
                stream: "lobby".to_string(),
                state,
                at: NaiveDate::from_ymd_opt(2024, 5, 1)
                    .and_then(|d| d.and_hms_opt(9, 0, 0))
                    .unwrap(),
            }
        }

        #[test]
        fn notify_keeps_working_while_broker_is_down() {
            let mut notifier = MqttNotifier::connect(&settings(free_port()), "lobby").unwrap();
            std::thread::sleep(Duration::from_millis(300));

            for i in 0..30 {
                let state = if i % 2 == 0 {
                    ActuatorState::On
                } else {
                    ActuatorState::Off
                };
                notifier.notify(&transition(state)).unwrap();
            }
            assert!(notifier.connection_alive());

            let held = notifier.pending.lock().unwrap().clone();
            assert_eq!(
                held,
                Some(("test/lobby/state".to_string(), b"OFF".to_vec()))
            );

            let started = Instant::now();
            drop(notifier);
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn reconnects_and_publishes_held_state() {
            let port = free_port();
            let mut notifier = MqttNotifier::connect(&settings(port), "lobby").unwrap();
            std::thread::sleep(Duration::from_millis(200));
            for _ in 0..(REQUEST_CAPACITY + 2) {
                notifier.notify(&transition(ActuatorState::Off)).unwrap();
            }
            notifier.notify(&transition(ActuatorState::On)).unwrap();

            let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
            let (mut broker, _) = listener.accept().unwrap();
            broker
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            let mut buf = [0u8; 1024];
            let n = broker.read(&mut buf).unwrap();
            assert!(n > 0, "expected CONNECT");
            // CONNACK: success, no properties.
            broker.write_all(&[0x20, 0x03, 0x00, 0x00, 0x00]).unwrap();

            let mut seen = Vec::new();
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                if published(&seen, b"test/lobby/availability", b"online")
                    && published(&seen, b"test/lobby/state", b"ON")
                {
                    break;
                }
                match broker.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => seen.extend_from_slice(&buf[..n]),
                }
            }
            assert!(published(&seen, b"test/lobby/availability", b"online"));
            assert!(published(&seen, b"test/lobby/state", b"ON"), "no ON after reconnect");
            assert!(notifier.connection_alive());
        }

        /// Some occurrence of `topic` is followed by `payload` within the few
        /// bytes of packet id and properties that separate them.
        fn published(bytes: &[u8], topic: &[u8], payload: &[u8]) -> bool {
            let mut from = 0;
            while let Some(at) = bytes[from..]
                .windows(topic.len())
                .position(|w| w == topic)
            {
                let start = from + at + topic.len();
                let end = (start + 4 + payload.len()).min(bytes.len());
                if bytes[start..end].windows(payload.len()).any(|w| w == payload) {
                    return true;
                }
                from = start;
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::mpsc;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .unwrap()
    }

    #[test]
    fn notice_formats_state_and_time() {
        let on = Transition {
            stream: "lobby".to_string(),
            state: ActuatorState::On,
            at: at(12, 0, 3),
        };
        assert_eq!(on.notice(), "[2024-05-01 12:00:03] Lights ON");

        let off = Transition {
            state: ActuatorState::Off,
            ..on
        };
        assert_eq!(off.notice(), "[2024-05-01 12:00:03] Lights OFF");
    }

    #[test]
    fn channel_notifier_forwards_and_tolerates_hangup() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut notifier = ChannelNotifier::new(tx);
        let t = Transition {
            stream: "lobby".to_string(),
            state: ActuatorState::On,
            at: at(8, 30, 0),
        };
        notifier.notify(&t)?;
        assert_eq!(rx.recv()?, t);

        drop(rx);
        notifier.notify(&t)?;
        Ok(())
    }

    #[test]
    fn log_notifier_never_fails() -> Result<()> {
        LogNotifier.notify(&Transition {
            stream: "s".to_string(),
            state: ActuatorState::Off,
            at: at(0, 0, 0),
        })
    }

    #[cfg(feature = "actuator-mqtt")]
    #[test]
    fn parses_broker_addresses() -> Result<()> {
        assert_eq!(
            mqtt::split_host_port("mqtt://127.0.0.1:1883")?,
            ("127.0.0.1".to_string(), 1883)
        );
        assert_eq!(mqtt::split_host_port("[::1]:1884")?, ("::1".to_string(), 1884));
        assert!(mqtt::split_host_port("mqtts://broker:8883").is_err());
        assert!(mqtt::split_host_port("broker").is_err());
        Ok(())
    }
}
