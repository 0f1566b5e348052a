use crate::prelude::*;

use crate::modbus::frame::{CodecError, ModbusCodec, Request, RequestFrame, Response};

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::codec::Framed;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const TCP_KEEPALIVE_SECS: u64 = 60;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5000;

#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub version: BatteryVersion,
    pub response_timeout: Duration,
    pub attempts: u32,
    pub tcp_nodelay: bool,
}

impl TransportSettings {
    pub fn for_battery(battery: &config::Battery) -> Self {
        Self {
            host: battery.host().to_owned(),
            port: battery.port(),
            unit_id: battery.unit_id(),
            version: battery.version(),
            response_timeout: Duration::from_millis(battery.response_timeout_ms()),
            attempts: battery.attempts(),
            tcp_nodelay: battery.tcp_nodelay(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub exchanges: u64,
    pub failures: u64,
    pub connects: u64,
}

// Link {{{
struct Link {
    framed: Option<Framed<TcpStream, ModbusCodec>>,
    next_transaction_id: u16,
    last_exchange: Option<Instant>,
}

impl Link {
    fn transaction_id(&mut self) -> u16 {
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        self.next_transaction_id
    }
} // }}}

/// One TCP session to one battery. The device cannot cope with interleaved requests, so
/// every exchange happens while holding `link`.
pub struct Transport {
    name: String,
    settings: TransportSettings,
    link: Mutex<Link>,
    shutdown: Arc<AtomicBool>,
    stats: std::sync::Mutex<TransportStats>,
}

impl Transport {
    pub fn new(name: &str, settings: TransportSettings, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            name: name.to_owned(),
            settings,
            link: Mutex::new(Link {
                framed: None,
                next_transaction_id: 0,
                last_exchange: None,
            }),
            shutdown,
            stats: std::sync::Mutex::new(TransportStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> BatteryVersion {
        self.settings.version
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TransportStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the connection for a group of exchanges. Waiters are served in arrival order.
    pub async fn lock(&self) -> TransportGuard<'_> {
        TransportGuard {
            transport: self,
            link: self.link.lock().await,
        }
    }

    /// Open the socket now rather than on the first exchange.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut guard = self.lock().await;
        guard.ensure_connected().await
    }

    pub async fn exchange(&self, request: Request) -> Result<Response, TransportError> {
        self.lock().await.exchange(request).await
    }

    /// Waits for any in-flight exchange, then drops the socket.
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        if link.framed.take().is_some() {
            info!("{}: disconnected", self.name);
        }
    }

    fn record(&self, f: impl FnOnce(&mut TransportStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    async fn open(&self) -> Result<Framed<TcpStream, ModbusCodec>, TransportError> {
        use net2::TcpStreamExt;

        let s = &self.settings;
        info!("{}: connecting to {}:{} ({})", self.name, s.host, s.port, s.version);

        let stream = match tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            TcpStream::connect((s.host.as_str(), s.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::Reset(format!("connect failed: {}", e))),
            Err(_) => {
                return Err(TransportError::Reset(format!(
                    "connect timed out after {}s",
                    CONNECT_TIMEOUT_SECS
                )))
            }
        };

        let std_stream = stream
            .into_std()
            .map_err(|e| TransportError::Reset(e.to_string()))?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::new(TCP_KEEPALIVE_SECS, 0))) {
            warn!("{}: failed to set TCP keepalive: {}", self.name, e);
        }
        let stream =
            TcpStream::from_std(std_stream).map_err(|e| TransportError::Reset(e.to_string()))?;

        if s.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("{}: failed to set TCP_NODELAY: {}", self.name, e);
            }
        }

        self.record(|st| st.connects += 1);
        info!("{}: connected!", self.name);

        Ok(Framed::new(stream, ModbusCodec::new(s.version)))
    }
}

/// Exclusive access to a battery connection for as long as it is held.
pub struct TransportGuard<'a> {
    transport: &'a Transport,
    link: MutexGuard<'a, Link>,
}

impl<'a> TransportGuard<'a> {
    pub fn version(&self) -> BatteryVersion {
        self.transport.settings.version
    }

    /// One request/response pair, retried with reconnect on timeouts and resets.
    pub async fn exchange(&mut self, request: Request) -> Result<Response, TransportError> {
        let t = self.transport;
        let attempts = t.settings.attempts.max(1);
        let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
        let mut last = String::new();

        for attempt in 1..=attempts {
            if t.is_shutting_down() {
                return Err(TransportError::ShuttingDown);
            }

            match self.attempt(&request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    warn!(
                        "{}: attempt {}/{} for {:?} failed: {}",
                        t.name, attempt, attempts, request, e
                    );
                    self.link.framed = None;
                    last = e.to_string();

                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(TransportError::Exhausted { attempts, last })
    }

    /// Single attempt that ignores the shutdown flag. Reserved for safe-state writes, which
    /// must still go out while everything else is being refused.
    pub async fn exchange_once(
        &mut self,
        request: Request,
    ) -> Result<Response, TransportError> {
        let result = self.attempt(&request).await;
        if matches!(result, Err(ref e) if e.is_retryable()) {
            self.link.framed = None;
        }
        result
    }

    async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        if self.link.framed.is_none() {
            if self.transport.is_shutting_down() {
                return Err(TransportError::ShuttingDown);
            }
            let framed = self.transport.open().await?;
            self.link.framed = Some(framed);
        }
        Ok(())
    }

    async fn attempt(&mut self, request: &Request) -> Result<Response, TransportError> {
        let t = self.transport;
        let result = self.attempt_inner(request).await;
        self.link.last_exchange = Some(Instant::now());

        t.record(|st| {
            st.exchanges += 1;
            if result.is_err() {
                st.failures += 1;
            }
        });

        result
    }

    async fn attempt_inner(&mut self, request: &Request) -> Result<Response, TransportError> {
        let t = self.transport;
        self.ensure_connected().await?;

        if let Some(last) = self.link.last_exchange {
            let wait = t.settings.version.message_wait();
            let elapsed = last.elapsed();
            if elapsed < wait {
                tokio::time::sleep(wait - elapsed).await;
            }
        }

        let frame = RequestFrame {
            transaction_id: self.link.transaction_id(),
            unit_id: t.settings.unit_id,
            request: request.clone(),
        };
        let transaction_id = frame.transaction_id;
        let timeout = t.settings.response_timeout;
        let timeout_ms = timeout.as_millis() as u64;

        let framed = self
            .link
            .framed
            .as_mut()
            .ok_or_else(|| TransportError::Reset("not connected".to_owned()))?;

        debug!("{}: TX {:?}", t.name, frame);
        match tokio::time::timeout(timeout, framed.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(codec_error(e)),
            Err(_) => return Err(TransportError::Timeout(timeout_ms)),
        }

        let reply = match tokio::time::timeout(timeout, framed.next()).await {
            Ok(Some(Ok(reply))) => reply,
            Ok(Some(Err(e))) => return Err(codec_error(e)),
            Ok(None) => return Err(TransportError::Reset("connection closed by peer".to_owned())),
            Err(_) => return Err(TransportError::Timeout(timeout_ms)),
        };
        debug!("{}: RX {:?}", t.name, reply);

        if reply.transaction_id != transaction_id || reply.unit_id != t.settings.unit_id {
            return Err(TransportError::Reset(format!(
                "reply for transaction {} unit {} while waiting for {} unit {}",
                reply.transaction_id, reply.unit_id, transaction_id, t.settings.unit_id
            )));
        }

        let function = u8::from(request.function());
        match (request, reply.response) {
            (_, Response::Exception { function: f, code }) if f == function => {
                Err(TransportError::Exception { function: f, code })
            }
            (Request::ReadHolding { count, .. }, Response::ReadHolding(words))
                if words.len() == *count as usize =>
            {
                Ok(Response::ReadHolding(words))
            }
            (Request::WriteSingle { address, value }, r @ Response::WriteSingle { .. }) => {
                check_echo(&r, *address, *value)?;
                Ok(r)
            }
            (Request::WriteMultiple { address, values }, r @ Response::WriteMultiple { .. }) => {
                check_echo(&r, *address, values.len() as u16)?;
                Ok(r)
            }
            (_, other) => Err(TransportError::Reset(format!(
                "reply {:?} does not answer {:?}",
                other, request
            ))),
        }
    }
}

// a write echo must repeat the address and value (or count) that was sent
fn check_echo(reply: &Response, address: u16, value: u16) -> Result<(), TransportError> {
    let (a, v) = match reply {
        Response::WriteSingle { address, value } => (*address, *value),
        Response::WriteMultiple { address, count } => (*address, *count),
        _ => return Ok(()),
    };
    if (a, v) != (address, value) {
        return Err(TransportError::Frame(FrameError::new(format!(
            "write echo {}={} does not match {}={}",
            a, v, address, value
        ))));
    }
    Ok(())
}

fn codec_error(e: CodecError) -> TransportError {
    match e {
        CodecError::Frame(f) => TransportError::Frame(f),
        CodecError::Io(io) => TransportError::Reset(io.to_string()),
    }
}
