//! Host load sampling and the dispatch gate built on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use simtest_core::SystemError;
use sysinfo::System;
use tracing::{debug, warn};

/// One observation of the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    /// 1-minute load average.
    pub load_1min: f64,
    pub cpus: usize,
}

/// Source of load samples.
pub trait LoadSensor: Send + Sync {
    fn sample(&self) -> Result<LoadSample, SystemError>;
}

/// Sensor backed by the operating system's load average.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoLoadSensor;

impl LoadSensor for SysinfoLoadSensor {
    fn sample(&self) -> Result<LoadSample, SystemError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(SystemError::LoadUnavailable);
        }
        let load = System::load_average();
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .map_err(|e| SystemError::Sensor(e.to_string()))?;
        Ok(LoadSample {
            load_1min: load.one,
            cpus,
        })
    }
}

/// Sensor returning a fixed sample, for tests and embedders.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoadSensor(pub LoadSample);

impl LoadSensor for FixedLoadSensor {
    fn sample(&self) -> Result<LoadSample, SystemError> {
        Ok(self.0)
    }
}

/// Decides whether another run may start.
pub struct LoadGate {
    ceiling: f64,
    sensor: Arc<dyn LoadSensor>,
    sensor_failed: AtomicBool,
}

impl LoadGate {
    pub fn new(ceiling: f64, sensor: Arc<dyn LoadSensor>) -> Self {
        Self {
            ceiling,
            sensor,
            sensor_failed: AtomicBool::new(false),
        }
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    /// A run is admitted when throttling is off, when nothing is running
    /// (so a loaded host still makes progress), or when the projected
    /// load per CPU stays under the ceiling.
    pub fn admits(&self, in_flight: usize) -> bool {
        if self.ceiling >= 1.0 || in_flight == 0 {
            return true;
        }
        if self.sensor_failed.load(Ordering::Relaxed) {
            return true;
        }
        match self.sensor.sample() {
            Ok(sample) => {
                let projected = (sample.load_1min + 1.0) / sample.cpus.max(1) as f64;
                let admitted = projected <= self.ceiling;
                if !admitted {
                    debug!(
                        load = sample.load_1min,
                        cpus = sample.cpus,
                        ceiling = self.ceiling,
                        "host load above ceiling, holding dispatch"
                    );
                }
                admitted
            }
            Err(e) => {
                if !self.sensor_failed.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "load sensor failed, disabling load throttling");
                }
                true
            }
        }
    }
}

impl std::fmt::Debug for LoadGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadGate")
            .field("ceiling", &self.ceiling)
            .field("sensor_failed", &self.sensor_failed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FailingSensor(AtomicUsize);

    impl LoadSensor for FailingSensor {
        fn sample(&self) -> Result<LoadSample, SystemError> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Err(SystemError::Sensor("no /proc".to_string()))
        }
    }

    fn fixed(load: f64, cpus: usize) -> Arc<dyn LoadSensor> {
        Arc::new(FixedLoadSensor(LoadSample {
            load_1min: load,
            cpus,
        }))
    }

    #[test]
    fn test_ceiling_of_one_never_throttles() {
        let gate = LoadGate::new(1.0, fixed(100.0, 1));
        assert!(gate.admits(8));
    }

    #[test]
    fn test_idle_host_is_admitted() {
        let gate = LoadGate::new(0.9, fixed(0.5, 8));
        assert!(gate.admits(2));
    }

    #[test]
    fn test_busy_host_is_held() {
        let gate = LoadGate::new(0.9, fixed(7.5, 8));
        assert!(!gate.admits(3));
    }

    #[test]
    fn test_nothing_in_flight_always_admits() {
        let gate = LoadGate::new(0.5, fixed(64.0, 2));
        assert!(gate.admits(0));
    }

    #[test]
    fn test_sensor_failure_disables_throttling_once() {
        let sensor = Arc::new(FailingSensor(AtomicUsize::new(0)));
        let gate = LoadGate::new(0.5, sensor.clone());
        assert!(gate.admits(1));
        assert!(gate.admits(1));
        assert_eq!(sensor.0.load(Ordering::Relaxed), 1);
    }
}
