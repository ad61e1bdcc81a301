use clap::{Parser, Subcommand};
use eyre::Result;

mod config;
mod ports;
mod run;
mod supply;

use supply::ConnectArgs;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse and display the configuration file
    Config {
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },

    /// Drop HV, keeping the programmed setpoint
    Off {
        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// List detected serial ports
    Ports,

    /// Send the zero-setpoint, power-off reset command
    Reset {
        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Poll the supply and run the stability monitor until interrupted
    Run {
        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Program a new output setpoint and raise HV
    Set {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Target voltage in kV
        #[arg(short, long)]
        voltage: f64,

        /// Current limit in mA, defaults to the rated maximum
        #[arg(short = 'i', long)]
        current: Option<f64>,
    },

    /// Query and print the device status
    Status {
        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Print the firmware version
    Version {
        #[command(flatten)]
        connect: ConnectArgs,
    },
}

pub async fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Config { config } => self::config::read_and_print(&config).await,
        Command::Off { connect } => self::supply::off(&connect).await,
        Command::Ports => self::ports::list(),
        Command::Reset { connect } => self::supply::reset(&connect).await,
        Command::Run { connect } => self::run::launch(&connect).await,

        Command::Set {
            connect,
            voltage,
            current,
        } => self::supply::set(&connect, voltage, current).await,

        Command::Status { connect } => self::supply::status(&connect).await,
        Command::Version { connect } => self::supply::version(&connect).await,
    }
}
