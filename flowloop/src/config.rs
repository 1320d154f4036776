//! # Loop configuration

use crate::prelude::v1::*;
use crate::timer::{frame_interval, try_frame_interval};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

/// What the loop does after a failed tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Stop rescheduling. The loop stays halted until capture is started again.
    Stall,
    /// Re-run the tick after a delay that doubles with every consecutive failure (capped at 8x).
    ///
    /// A failing tick is retried up to `max_retries` times, so the loop stalls on the
    /// `max_retries + 1`-th failure in a row.
    Retry { backoff_ms: u64, max_retries: u32 },
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::Stall
    }
}

impl ErrorPolicy {
    /// Delay before retrying after `failures` consecutive failed ticks, `None` to stall.
    pub fn retry_delay(&self, failures: u32) -> Option<Duration> {
        match *self {
            Self::Stall => None,
            Self::Retry {
                backoff_ms,
                max_retries,
            } => {
                if failures == 0 || failures > max_retries {
                    None
                } else {
                    let factor = 1u64 << (failures - 1).min(3);
                    Some(Duration::from_millis(backoff_ms.saturating_mul(factor)))
                }
            }
        }
    }
}

/// Settings of the capture loop.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    /// Target tick rate.
    pub target_fps: f64,
    /// Constraints requested from the source.
    pub constraints: CaptureConstraints,
    /// Optical flow parameters.
    pub flow: FarnebackParams,
    pub error_policy: ErrorPolicy,
    /// Number of results buffered for a slow consumer before new ones are dropped.
    pub result_queue: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            target_fps: 30.0,
            constraints: Default::default(),
            flow: Default::default(),
            error_policy: Default::default(),
            result_queue: 8,
        }
    }
}

impl LoopSettings {
    /// Interval between tick starts.
    pub fn frame_interval(&self) -> Duration {
        frame_interval(self.target_fps)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.target_fps.is_finite() || self.target_fps < 0.0 {
            return Err(anyhow!("invalid target fps {}", self.target_fps));
        }
        if try_frame_interval(self.target_fps).is_none() {
            return Err(anyhow!("target fps {} is too low", self.target_fps));
        }
        if self.result_queue == 0 {
            return Err(anyhow!("result_queue must be at least 1"));
        }
        self.flow.validate()
    }

    /// Load settings from a JSON file. Missing fields take their default values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let settings: Self = serde_json::from_reader(BufReader::new(file))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings as pretty printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_never_retries() {
        assert_eq!(ErrorPolicy::Stall.retry_delay(1), None);
    }

    #[test]
    fn retry_backs_off_and_gives_up() {
        let p = ErrorPolicy::Retry {
            backoff_ms: 10,
            max_retries: 5,
        };
        assert_eq!(p.retry_delay(1), Some(Duration::from_millis(10)));
        assert_eq!(p.retry_delay(2), Some(Duration::from_millis(20)));
        assert_eq!(p.retry_delay(4), Some(Duration::from_millis(80)));
        assert_eq!(p.retry_delay(5), Some(Duration::from_millis(80)));
        assert_eq!(p.retry_delay(6), None);
    }

    #[test]
    fn json_defaults_and_policy_tag() {
        let s: LoopSettings = serde_json::from_str(
            r#"{ "target_fps": 15, "error_policy": { "mode": "retry", "backoff_ms": 50, "max_retries": 2 } }"#,
        )
        .unwrap();
        assert_eq!(s.target_fps, 15.0);
        assert_eq!(s.flow, FarnebackParams::default());
        assert_eq!(s.constraints.width, 640);
        assert_eq!(
            s.error_policy,
            ErrorPolicy::Retry {
                backoff_ms: 50,
                max_retries: 2
            }
        );
    }

    #[test]
    fn save_and_load() {
        let mut path = std::env::temp_dir();
        path.push(format!("flowloop-settings-{}.json", std::process::id()));

        let settings = LoopSettings {
            target_fps: 12.5,
            ..Default::default()
        };
        settings.save(&path).unwrap();
        let loaded = LoopSettings::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, settings);
    }

    #[test]
    fn rejects_negative_fps() {
        let s = LoopSettings {
            target_fps: -1.0,
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_unrepresentable_interval() {
        let s = LoopSettings {
            target_fps: 1e-20,
            ..Default::default()
        };
        assert!(s.validate().is_err());

        let s = LoopSettings {
            target_fps: 0.0,
            ..Default::default()
        };
        assert!(s.validate().is_ok());
    }

    #[test]
    fn rejects_empty_queue() {
        let s = LoopSettings {
            result_queue: 0,
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }
}
