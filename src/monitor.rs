//! Periodic stability check of measured voltage against the commanded
//! setpoint. Deviations beyond the configured limit raise an alarm on
//! every check; in-band readings produce a rate-limited heartbeat so
//! the log shows the link was healthy.

use std::{io, path::Path, time::Duration};

use chrono::Local;
use eyre::{Result, WrapErr};
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, interval},
};

use crate::{
    config::MonitorConfig,
    hardware::supply::defs::{Setpoint, Telemetry},
};

const EVENT_QUEUE: usize = 16;

pub struct StabilityMonitor {
    task: JoinHandle<()>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MonitorEvent {
    /// Measured voltage strayed beyond the deviation limit.
    Alarm { measured: f64, target: f64 },
    /// Voltage on target; emitted at most once per heartbeat period.
    Heartbeat { measured: f64, target: f64 },
}

/// The decision core, kept free of timers and I/O.
struct StabilityCheck {
    max_deviation: f64,
    heartbeat_period: Duration,
    last_heartbeat: Option<Instant>,
}

struct StabilityLog {
    file: File,
}

impl StabilityMonitor {
    /// Starts the check timer and truncates the log file. Events are
    /// advisory: a slow or absent consumer never stalls the checks.
    pub async fn spawn(
        config: &MonitorConfig,
        telemetry: watch::Receiver<Telemetry>,
        setpoint: watch::Receiver<Setpoint>,
    ) -> Result<(Self, mpsc::Receiver<MonitorEvent>)> {
        let log = StabilityLog::create(&config.log_path).await?;
        let check = StabilityCheck::new(
            config.max_deviation_kv,
            Duration::from_secs(config.heartbeat_period_s),
        );

        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let period = Duration::from_secs(config.check_interval_s);

        let task = tokio::spawn(Self::monitor_task(
            period, check, log, telemetry, setpoint, events,
        ));

        Ok((StabilityMonitor { task }, events_rx))
    }

    async fn monitor_task(
        period: Duration,
        mut check: StabilityCheck,
        mut log: StabilityLog,
        telemetry: watch::Receiver<Telemetry>,
        setpoint: watch::Receiver<Setpoint>,
        events: mpsc::Sender<MonitorEvent>,
    ) {
        let mut timer = interval(period);

        // The first interval tick completes immediately; the first
        // check belongs one full period after startup.
        timer.tick().await;

        loop {
            timer.tick().await;

            let measured = telemetry.borrow().status.voltage;
            let target = setpoint.borrow().voltage;

            let Some(event) = check.evaluate(measured, target, Instant::now()) else {
                continue;
            };

            match event {
                MonitorEvent::Alarm { measured, target } => {
                    tracing::warn!("Voltage off target: {measured:.2} kV (target {target:.2} kV)");
                }
                MonitorEvent::Heartbeat { measured, .. } => {
                    tracing::info!("Voltage stable at {measured:.2} kV");
                }
            }

            if let Err(err) = log.append(&event).await {
                tracing::warn!("Stability log write failed: {err}");
            }

            let _ = events.try_send(event);
        }
    }
}

impl Drop for StabilityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl StabilityCheck {
    fn new(max_deviation: f64, heartbeat_period: Duration) -> Self {
        Self {
            max_deviation,
            heartbeat_period,
            last_heartbeat: None,
        }
    }

    fn evaluate(&mut self, measured: f64, target: f64, now: Instant) -> Option<MonitorEvent> {
        if (measured - target).abs() > self.max_deviation {
            return Some(MonitorEvent::Alarm { measured, target });
        }

        let due = self
            .last_heartbeat
            .is_none_or(|last| now.duration_since(last) >= self.heartbeat_period);

        if due {
            self.last_heartbeat = Some(now);
            return Some(MonitorEvent::Heartbeat { measured, target });
        }

        None
    }
}

impl StabilityLog {
    async fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .await
            .wrap_err_with(|| format!("Failed to create {}", path.display()))?;

        Ok(StabilityLog { file })
    }

    /// One line per event: timestamp, measured, target, deviation flag.
    async fn append(&mut self, event: &MonitorEvent) -> io::Result<()> {
        let (measured, target, deviation) = match *event {
            MonitorEvent::Alarm { measured, target } => (measured, target, true),
            MonitorEvent::Heartbeat { measured, target } => (measured, target, false),
        };

        let line = format!(
            "{} measured={measured:.2} target={target:.2} deviation={deviation}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
        );

        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use crate::hardware::supply::defs::DeviceStatus;

    use super::*;

    fn check() -> StabilityCheck {
        StabilityCheck::new(0.2, Duration::from_secs(600))
    }

    #[tokio::test]
    async fn alarm_on_every_deviating_check() {
        let mut check = check();
        let start = Instant::now();

        for minute in 0..5 {
            let now = start + Duration::from_secs(60 * minute);

            assert_eq!(
                check.evaluate(39.0, 40.0, now),
                Some(MonitorEvent::Alarm {
                    measured: 39.0,
                    target: 40.0,
                })
            );
        }
    }

    #[tokio::test]
    async fn heartbeat_suppressed_within_period() {
        let mut check = check();
        let start = Instant::now();

        assert!(matches!(
            check.evaluate(40.0, 40.0, start),
            Some(MonitorEvent::Heartbeat { .. })
        ));

        for minute in 1..10 {
            let now = start + Duration::from_secs(60 * minute);
            assert_eq!(check.evaluate(40.1, 40.0, now), None);
        }

        assert!(matches!(
            check.evaluate(40.0, 40.0, start + Duration::from_secs(600)),
            Some(MonitorEvent::Heartbeat { .. })
        ));
    }

    #[tokio::test]
    async fn deviation_limit_is_exclusive() {
        let mut check = check();
        let now = Instant::now();

        // Exactly 0.2 kV off target is still in band.
        assert!(matches!(
            check.evaluate(40.2, 40.0, now),
            Some(MonitorEvent::Heartbeat { .. })
        ));

        assert!(matches!(
            check.evaluate(40.3, 40.0, now),
            Some(MonitorEvent::Alarm { .. })
        ));
    }

    #[tokio::test]
    async fn alarms_do_not_advance_the_heartbeat_clock() {
        let mut check = check();
        let start = Instant::now();

        check.evaluate(40.0, 40.0, start);

        assert!(matches!(
            check.evaluate(30.0, 40.0, start + Duration::from_secs(300)),
            Some(MonitorEvent::Alarm { .. })
        ));

        assert!(matches!(
            check.evaluate(40.0, 40.0, start + Duration::from_secs(660)),
            Some(MonitorEvent::Heartbeat { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn task_emits_alarm_after_first_interval() {
        let status = DeviceStatus {
            voltage: 10.0,
            ..Default::default()
        };

        let (_telemetry_tx, telemetry) = watch::channel(Telemetry { status, stale: false });
        let (_setpoint_tx, setpoint) = watch::channel(Setpoint {
            voltage: 12.0,
            current: 3.0,
        });

        let config = MonitorConfig {
            log_path: env::temp_dir().join("hvctl-monitor-alarm-test.log"),
            ..Default::default()
        };

        let (_monitor, mut events) = StabilityMonitor::spawn(&config, telemetry, setpoint)
            .await
            .unwrap();

        let started = Instant::now();
        let event = events.recv().await.unwrap();

        assert_eq!(
            event,
            MonitorEvent::Alarm {
                measured: 10.0,
                target: 12.0,
            }
        );

        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn task_rate_limits_heartbeats() {
        let (_telemetry_tx, telemetry) = watch::channel(Telemetry {
            status: DeviceStatus {
                voltage: 40.0,
                ..Default::default()
            },
            stale: false,
        });

        let (_setpoint_tx, setpoint) = watch::channel(Setpoint {
            voltage: 40.0,
            current: 3.0,
        });

        let config = MonitorConfig {
            log_path: env::temp_dir().join("hvctl-monitor-heartbeat-test.log"),
            ..Default::default()
        };

        let (_monitor, mut events) = StabilityMonitor::spawn(&config, telemetry, setpoint)
            .await
            .unwrap();

        let first_at = {
            let event = events.recv().await.unwrap();
            assert!(matches!(event, MonitorEvent::Heartbeat { .. }));
            Instant::now()
        };

        let event = events.recv().await.unwrap();
        assert!(matches!(event, MonitorEvent::Heartbeat { .. }));
        assert!(first_at.elapsed() >= Duration::from_secs(600));
    }
}
