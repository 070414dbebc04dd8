//! Configuration options.

use std::fmt::{self, Display, Formatter};
use std::ops::Deref;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use calloop::LoopHandle;
use calloop::channel::{self, Event, Sender};
use configory::EventHandler;
use configory::docgen::{DocType, Docgen, Leaf};
use serde::{Deserialize, Deserializer};
use tracing::{error, info};

use crate::State;

/// # netlinkd
///
/// ## Syntax
///
/// netlinkd's configuration file uses the TOML format. The format's
/// specification can be found at _https://toml.io/en/v1.0.0_.
///
/// ## Location
///
/// netlinkd doesn't create the configuration file for you, but it looks for
/// one at <br> `${XDG_CONFIG_HOME:-$HOME/.config}/netlinkd/config.toml`.
///
/// ## Fields
#[derive(Docgen, Deserialize, Default, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// This section documents the `[scan]` table.
    pub scan: Scan,
    /// This section documents the `[devices]` table.
    pub devices: Devices,
    /// This section documents the `[log]` table.
    pub log: Log,
}

/// Scan reconciler configuration.
#[derive(Docgen, Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Scan {
    /// Interval between periodic background scans.
    pub interval: MillisDuration,
    /// Duration to wait for driver scan results before retrying once.
    pub retry_wait: MillisDuration,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10).into(),
            retry_wait: Duration::from_secs(2).into(),
        }
    }
}

/// Device handling configuration.
#[derive(Docgen, Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Devices {
    /// Allow synthetic test devices to be created.
    ///
    /// Synthetic devices only ever exist when this is explicitly enabled;
    /// every radio primitive on them short-circuits to a fixed stub reply
    /// instead of touching any real interface.
    pub enable_test_devices: bool,
    /// Association pause used for radios with 14 channels or fewer.
    pub association_pause_short: MillisDuration,
    /// Association pause used for radios with more than 14 channels.
    pub association_pause_long: MillisDuration,
}

impl Default for Devices {
    fn default() -> Self {
        Self {
            enable_test_devices: false,
            association_pause_short: Duration::from_secs(5).into(),
            association_pause_long: Duration::from_secs(10).into(),
        }
    }
}

/// Logging configuration.
#[derive(Docgen, Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Log {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"netlinkd=debug,warn"`.
    pub filter: LogFilter,
}

impl Default for Log {
    fn default() -> Self {
        Self { filter: LogFilter::from("netlinkd=info,warn") }
    }
}

/// Read-only reference-counted log filter string.
#[derive(Hash, PartialEq, Eq, Clone, Debug)]
pub struct LogFilter {
    arc: Arc<String>,
}

impl LogFilter {
    fn from(filter: impl Into<String>) -> Self {
        Self { arc: Arc::new(filter.into()) }
    }
}

impl Deref for LogFilter {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.arc.as_str()
    }
}

impl Display for LogFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", self.arc.as_str())
    }
}

impl<'de> Deserialize<'de> for LogFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let filter = String::deserialize(deserializer)?;
        Ok(Self::from(filter))
    }
}

impl Docgen for LogFilter {
    fn doc_type() -> DocType {
        String::doc_type()
    }

    fn format(&self) -> String {
        self.arc.format()
    }
}

/// Config wrapper for millisecond-precision durations.
#[derive(Copy, Clone, Hash, PartialEq, Eq, Debug)]
pub struct MillisDuration(Duration);

impl Deref for MillisDuration {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for MillisDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms).into())
    }
}

impl Docgen for MillisDuration {
    fn doc_type() -> DocType {
        DocType::Leaf(Leaf::new("integer (milliseconds)"))
    }

    fn format(&self) -> String {
        self.0.as_millis().to_string()
    }
}

impl From<Duration> for MillisDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl Display for MillisDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", self.0.as_millis())
    }
}

/// Event handler for configuration manager updates.
pub struct ConfigEventHandler {
    tx: Sender<Config>,
}

impl ConfigEventHandler {
    pub fn new(event_loop: &LoopHandle<'static, State>) -> Self {
        // Create calloop channel to apply config updates.
        let (tx, rx) = channel::channel();
        let _ = event_loop
            .insert_source(rx, |event, _, state| {
                if let Event::Msg(config) = event {
                    state.set_config(Rc::new(config));
                }
            })
            .inspect_err(|err| error!("Failed to insert config source: {err}"));

        Self { tx }
    }

    /// Reload the configuration file.
    fn reload_config(&self, config: &configory::Config) {
        info!("Reloading configuration file");

        // Try to parse config, ignoring broken updates.
        let parsed = match config.get::<&str, _>(&[]) {
            Ok(parsed) => parsed.unwrap_or_default(),
            Err(err) => {
                error!("Config error: {err}");
                return;
            },
        };

        // Update the config.
        if let Err(err) = self.tx.send(parsed) {
            error!("Failed to send on config channel: {err}");
        }
    }
}

impl EventHandler<()> for ConfigEventHandler {
    fn file_changed(&self, config: &configory::Config) {
        self.reload_config(config);
    }

    fn ipc_changed(&self, config: &configory::Config) {
        self.reload_config(config);
    }

    fn file_error(&self, _config: &configory::Config, err: configory::Error) {
        error!("Configuration file error: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use configory::docgen::markdown::Markdown;

    use super::*;

    #[test]
    fn config_docs() {
        let mut formatter = Markdown::new();
        formatter.set_heading_size(3);
        let expected = formatter.format::<Config>();

        // Uncomment to update config documentation.
        // fs::write("./docs/config.md", &expected).unwrap();

        // Ensure documentation is up to date.
        let docs = fs::read_to_string("./docs/config.md").unwrap();
        assert_eq!(docs, expected);
    }
}
