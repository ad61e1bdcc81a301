use eyre::Result;
use tokio::{select, signal};

use crate::monitor::{MonitorEvent, StabilityMonitor};

use super::supply::ConnectArgs;

/// Foreground control loop: keeps the link alive, prints status changes
/// and stability events until Ctrl-C, then stops the timers and closes
/// the port.
pub async fn launch(connect: &ConnectArgs) -> Result<()> {
    let config = connect.load_config().await?;

    let supply = crate::hardware::Supply::open(&config.supply)?;
    let mut telemetry = supply.telemetry();

    let (monitor, mut events) =
        StabilityMonitor::spawn(&config.monitor, supply.telemetry(), supply.setpoint()).await?;

    let mut last_printed = None;

    loop {
        select! {
            _ = signal::ctrl_c() => break,

            changed = telemetry.changed() => {
                if changed.is_err() {
                    break;
                }

                let current = *telemetry.borrow_and_update();

                if last_printed != Some(current) {
                    println!("{}{}", current.status, if current.stale { "  (stale)" } else { "" });
                    last_printed = Some(current);
                }
            }

            event = events.recv() => match event {
                Some(MonitorEvent::Alarm { measured, target }) => {
                    println!("ALARM: {measured:.2} kV, target {target:.2} kV");
                }

                Some(MonitorEvent::Heartbeat { measured, .. }) => {
                    println!("Stable at {measured:.2} kV");
                }

                None => break,
            },
        }
    }

    tracing::info!("Shutting down");

    drop(monitor);
    drop(supply);

    Ok(())
}
