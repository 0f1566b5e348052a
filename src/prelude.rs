pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::str::FromStr;
pub use tokio::sync::{broadcast, watch};

pub use crate::{
    channels::Channels,
    config::{self, Config, ConfigWrapper},
    error::{FrameError, RegisterError, TransportError, WriteMismatchError},
    options::Options,
    register::{BatteryVersion, RegisterMap},
    register_cache::RegisterSnapshot,
};
