#![allow(dead_code)]

pub use venus_energy_manager::prelude::*;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory;

impl Factory {
    pub fn battery(name: &str, port: u16, version: &str) -> config::Battery {
        serde_yaml::from_str(&format!(
            "name: {}\nhost: 127.0.0.1\nport: {}\nversion: {}\ncapacity_kwh: 10.0\nmin_soc: 10\nmax_soc: 95\nresponse_timeout_ms: 300\nattempts: 3\n",
            name, port, version
        ))
        .unwrap()
    }

    pub fn config(batteries: Vec<config::Battery>) -> Config {
        let mut config: Config = serde_yaml::from_str("batteries: []\n").unwrap();
        config.batteries = batteries;
        config.control.kp = 0.5;
        config.control.kd = 0.0;
        config.control.deadband = 50.0;
        config.control.max_power_change = 300.0;
        config.control.direction_hysteresis = 100.0;
        config
    }

    pub fn config_wrapper(batteries: Vec<config::Battery>) -> ConfigWrapper {
        ConfigWrapper::from_config(Self::config(batteries))
    }

    pub fn shutdown_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }
}

pub fn address(version: BatteryVersion, name: &str) -> u16 {
    version.register_map().get(name).unwrap().address
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Seen {
    pub function: u8,
    pub address: u16,
    pub values: Vec<u16>,
}

impl Seen {
    pub fn is_write(&self) -> bool {
        self.function == 6 || self.function == 16
    }
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub registers: HashMap<u16, u16>,
    pub requests: Vec<Seen>,
    /// writes to these addresses get an illegal data value exception
    pub reject_writes_to: HashSet<u16>,
    /// writes to these addresses are acknowledged but not stored
    pub ignore_writes_to: HashSet<u16>,
    /// hang up without replying once this many more requests have arrived
    pub drop_after: Option<usize>,
    /// refuse to talk at all: every request closes the connection
    pub dead: bool,
    pub delay: Duration,
    /// announce one byte too many in exception replies, as some v3 firmware does
    pub malformed_exceptions: bool,
    /// echo single writes back with the wrong value
    pub bad_echo: bool,
    pub pipelined: bool,
    pub connections: usize,
}

/// In-process Modbus-TCP battery, enough of one to drive the engine against.
#[derive(Clone, Default)]
pub struct FakeBattery {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBattery {
    pub async fn start() -> (Self, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let fake = Self::default();

        let server = fake.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                server.with(|s| s.connections += 1);
                tokio::spawn(server.clone().serve(stream));
            }
        });

        (fake, port)
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set(&self, address: u16, value: u16) {
        self.with(|s| s.registers.insert(address, value));
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        self.with(|s| s.registers.get(&address).copied())
    }

    pub fn requests(&self) -> Vec<Seen> {
        self.with(|s| s.requests.clone())
    }

    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.requests()
            .into_iter()
            .filter(|r| r.is_write())
            .map(|r| (r.address, r.values[0]))
            .collect()
    }

    async fn serve(self, mut stream: TcpStream) {
        loop {
            let mut header = [0u8; 7];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let len = u16::from_be_bytes([header[4], header[5]]) as usize;
            let mut pdu = vec![0u8; len.saturating_sub(1)];
            if stream.read_exact(&mut pdu).await.is_err() {
                return;
            }

            let (reply, delay, hang_up) = self.handle(&pdu);
            if hang_up {
                return;
            }

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            // anything already waiting means the client didn't wait for us
            let mut peek = [0u8; 1];
            match stream.try_read(&mut peek) {
                Ok(0) => return,
                Ok(_) => self.with(|s| s.pipelined = true),
                Err(_) => {}
            }

            let mut length = reply.len() as u16 + 1;
            if reply[0] & 0x80 != 0 && self.with(|s| s.malformed_exceptions) {
                length += 1;
            }

            let mut frame = Vec::with_capacity(7 + reply.len());
            frame.extend_from_slice(&header[0..4]);
            frame.extend_from_slice(&length.to_be_bytes());
            frame.push(header[6]);
            frame.extend_from_slice(&reply);
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }

    fn handle(&self, pdu: &[u8]) -> (Vec<u8>, Duration, bool) {
        let word = |i: usize| u16::from_be_bytes([pdu[i], pdu[i + 1]]);
        let function = pdu[0];
        let address = word(1);

        let mut s = self.state.lock().unwrap();

        if s.dead {
            return (Vec::new(), Duration::ZERO, true);
        }

        let values = match function {
            6 => vec![word(3)],
            16 => (0..word(3) as usize).map(|i| word(6 + i * 2)).collect(),
            _ => Vec::new(),
        };
        s.requests.push(Seen {
            function,
            address,
            values: values.clone(),
        });

        if let Some(n) = s.drop_after {
            if n == 0 {
                s.drop_after = None;
                return (Vec::new(), Duration::ZERO, true);
            }
            s.drop_after = Some(n - 1);
        }

        let reply = match function {
            3 => {
                let count = word(3);
                let mut r = vec![3, (count * 2) as u8];
                for a in address..address + count {
                    r.extend_from_slice(&s.registers.get(&a).copied().unwrap_or(0).to_be_bytes());
                }
                r
            }
            6 | 16 if s.reject_writes_to.contains(&address) => vec![function | 0x80, 4],
            6 | 16 => {
                if !s.ignore_writes_to.contains(&address) {
                    for (i, v) in values.iter().enumerate() {
                        s.registers.insert(address + i as u16, *v);
                    }
                }
                if function == 6 {
                    let mut r = pdu[0..5].to_vec();
                    if s.bad_echo {
                        r[3..5].copy_from_slice(&values[0].wrapping_add(1).to_be_bytes());
                    }
                    r
                } else {
                    let mut r = vec![16];
                    r.extend_from_slice(&pdu[1..5]);
                    r
                }
            }
            _ => vec![function | 0x80, 1],
        };

        (reply, s.delay, false)
    }
}
