use clap::Args;
use eyre::{Result, WrapErr};
use tokio_serial::SerialStream;

use crate::{
    config::Config,
    hardware::supply::{
        Supply,
        defs::{MAX_CURRENT, Setpoint},
    },
};

#[derive(Args)]
pub struct ConnectArgs {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: String,

    /// Serial port, overriding the configuration file
    #[arg(short, long)]
    pub port: Option<String>,
}

impl ConnectArgs {
    pub async fn load_config(&self) -> Result<Config> {
        let mut config = Config::load_or_default(&self.config).await?;

        if let Some(port) = &self.port {
            config.supply.port = port.clone();
        }

        Ok(config)
    }

    pub async fn open(&self) -> Result<Supply<SerialStream>> {
        let config = self.load_config().await?;

        Supply::open(&config.supply)
            .wrap_err_with(|| format!("Failed to open {}", config.supply.port))
    }
}

pub async fn status(connect: &ConnectArgs) -> Result<()> {
    let supply = connect.open().await?;
    let status = supply.query().await?;

    println!("{status}");
    Ok(())
}

pub async fn set(connect: &ConnectArgs, voltage: f64, current: Option<f64>) -> Result<()> {
    let setpoint = Setpoint {
        voltage,
        current: current.unwrap_or(MAX_CURRENT),
    };

    let supply = connect.open().await?;
    let status = supply.set_output(setpoint).await?;

    println!(
        "Setpoint applied: {:.2} kV, {:.2} mA limit",
        setpoint.voltage, setpoint.current
    );
    println!("{status}");
    Ok(())
}

pub async fn off(connect: &ConnectArgs) -> Result<()> {
    let supply = connect.open().await?;
    let status = supply.hv_off().await?;

    println!("{status}");
    Ok(())
}

pub async fn reset(connect: &ConnectArgs) -> Result<()> {
    let supply = connect.open().await?;
    let status = supply.reset().await?;

    println!("Output reset: setpoint zeroed, HV off");
    println!("{status}");
    Ok(())
}

pub async fn version(connect: &ConnectArgs) -> Result<()> {
    let supply = connect.open().await?;
    let version = supply.version().await?;

    println!("Firmware version: {version}");
    Ok(())
}
