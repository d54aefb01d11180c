//! Device configuration file
//!
//! Stored as JSON. Every field is optional; a missing file or field falls
//! back to 100 ms integration, no averaging and no correction tables.
//!
//! ```json
//! {
//!   "integration_time": "250ms",
//!   "average": 4,
//!   "channels": [
//!     { "nonlinear": [0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0] },
//!     { "ijking": { "reference": "100ms", "start": 12, "values": [1.0, 0.98] } }
//!   ]
//! }
//! ```

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::PixelLayout;
use crate::error::{Result, SpectrometerError};

/// Nonlinearity tables hold exactly this many coefficients.
pub const NONLINEAR_TERMS: usize = 8;

pub const DEFAULT_INTEGRATION_TIME: Duration = Duration::from_millis(100);

/// Per-pixel intensity correction measured at a reference integration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IjkingTable {
    /// Integration time the table was recorded at
    #[serde(with = "humantime_serde")]
    pub reference: Duration,
    /// First pixel covered by `values`
    pub start: usize,
    pub values: Vec<f32>,
}

impl IjkingTable {
    /// Correction factor for `pixel`, if the table covers it.
    pub fn value(&self, pixel: usize) -> Option<f32> {
        pixel
            .checked_sub(self.start)
            .and_then(|i| self.values.get(i))
            .copied()
    }
}

/// Correction tables for one channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub nonlinear: Vec<f32>,
    pub ijking: Option<IjkingTable>,
}

/// Settings applied when a device is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    #[serde(with = "humantime_serde")]
    pub integration_time: Duration,
    pub average: u16,
    /// Indexed by channel number
    pub channels: Vec<ChannelConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            integration_time: DEFAULT_INTEGRATION_TIME,
            average: 1,
            channels: Vec::new(),
        }
    }
}

impl DeviceConfig {
    /// Save as pretty-printed JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load_from_file(path) {
            Err(SpectrometerError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Validated correction tables for `channel`.
    ///
    /// Nonlinearity tables of the wrong length are ignored. An ijking table
    /// starting beyond the usable pixels is an error; values past the last
    /// pixel are dropped.
    pub fn channel_corrections(
        &self,
        channel: usize,
        layout: PixelLayout,
    ) -> Result<(Vec<f32>, Option<IjkingTable>)> {
        let Some(cfg) = self.channels.get(channel) else {
            return Ok((Vec::new(), None));
        };

        let nonlinear = match cfg.nonlinear.len() {
            0 | NONLINEAR_TERMS => cfg.nonlinear.clone(),
            n => {
                warn!(
                    "Channel {}: ignoring nonlinearity table with {} terms (need {})",
                    channel, n, NONLINEAR_TERMS
                );
                Vec::new()
            }
        };

        let ijking = match &cfg.ijking {
            None => None,
            Some(table) if table.start >= layout.pixel_count => {
                return Err(SpectrometerError::InvalidArgument(format!(
                    "invalid start for ijk on channel {}: {} >= {}",
                    channel, table.start, layout.pixel_count
                )));
            }
            Some(table) => {
                let mut table = table.clone();
                table.values.truncate(layout.pixel_count - table.start);
                Some(table)
            }
        };

        Ok((nonlinear, ijking))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const LAYOUT: PixelLayout = PixelLayout {
        pixel_count: 10,
        extra_pixels: 0,
    };

    #[test]
    fn test_defaults() {
        let cfg: DeviceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, DeviceConfig::default());
        assert_eq!(cfg.integration_time, Duration::from_millis(100));
        assert_eq!(cfg.average, 1);
    }

    #[test]
    fn test_parse_humantime() {
        let cfg: DeviceConfig = serde_json::from_str(
            r#"{"integration_time": "1s 500ms", "channels": [{}, {"ijking": {"reference": "20ms", "start": 2, "values": [1.5]}}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.integration_time, Duration::from_millis(1500));
        let ijk = cfg.channels[1].ijking.as_ref().unwrap();
        assert_eq!(ijk.reference, Duration::from_millis(20));
        assert_eq!(ijk.value(2), Some(1.5));
        assert_eq!(ijk.value(1), None);
        assert_eq!(ijk.value(3), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.json");
        let cfg = DeviceConfig {
            integration_time: Duration::from_millis(250),
            average: 3,
            channels: vec![ChannelConfig {
                nonlinear: vec![0.5; 8],
                ijking: None,
            }],
        };
        cfg.save_to_file(&path).unwrap();
        assert_eq!(DeviceConfig::load_from_file(&path).unwrap(), cfg);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let cfg = DeviceConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg, DeviceConfig::default());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            DeviceConfig::load_or_default(&path),
            Err(SpectrometerError::Config(_))
        ));
    }

    #[test]
    fn test_channel_corrections() {
        let cfg = DeviceConfig {
            channels: vec![
                ChannelConfig {
                    nonlinear: vec![1.0; 3],
                    ijking: Some(IjkingTable {
                        reference: Duration::from_millis(10),
                        start: 7,
                        values: vec![1.0, 2.0, 3.0, 4.0, 5.0],
                    }),
                },
                ChannelConfig {
                    nonlinear: vec![2.0; 8],
                    ijking: None,
                },
            ],
            ..Default::default()
        };

        let (nl, ijk) = cfg.channel_corrections(0, LAYOUT).unwrap();
        assert!(nl.is_empty());
        assert_eq!(ijk.unwrap().values, vec![1.0, 2.0, 3.0]);

        let (nl, ijk) = cfg.channel_corrections(1, LAYOUT).unwrap();
        assert_eq!(nl.len(), 8);
        assert!(ijk.is_none());

        let (nl, ijk) = cfg.channel_corrections(5, LAYOUT).unwrap();
        assert!(nl.is_empty() && ijk.is_none());
    }

    #[test]
    fn test_ijking_start_out_of_range() {
        let cfg = DeviceConfig {
            channels: vec![ChannelConfig {
                nonlinear: Vec::new(),
                ijking: Some(IjkingTable {
                    reference: Duration::from_millis(10),
                    start: 10,
                    values: vec![1.0],
                }),
            }],
            ..Default::default()
        };
        assert!(matches!(
            cfg.channel_corrections(0, LAYOUT),
            Err(SpectrometerError::InvalidArgument(_))
        ));
    }
}
