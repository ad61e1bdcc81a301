//! Control handle for a Glassman FJ series high-voltage supply.
//!
//! The device drops out of remote mode when it hears nothing for 1.5 s,
//! so a background task polls it every 500 ms and publishes each decoded
//! status on a watch channel. All port I/O goes through one mutex-held
//! link, one request in flight at a time.

pub mod defs;
pub mod protocol;

use std::{io, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, watch},
    task::JoinHandle,
    time::interval,
};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::{config::SupplyConfig, misc::buf::Encode};

use defs::{DeviceStatus, Setpoint, Telemetry};
use protocol::{CR, DeviceFault, DigitalControl, FrameError, RangeError, Request, Response};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct Supply<T> {
    inner: Arc<Inner<T>>,
    poll_task: JoinHandle<()>,
}

struct Inner<T> {
    link: Mutex<Link<T>>,
    telemetry: watch::Sender<Telemetry>,
    setpoint: watch::Sender<Setpoint>,
}

struct Link<T> {
    io: T,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum SupplyError {
    #[error("serial port: {0}")]
    Port(#[from] tokio_serial::Error),

    #[error("serial I/O: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error("corrupt response: {0}")]
    Frame(#[from] FrameError),

    #[error("device error: {0}")]
    Device(DeviceFault),

    #[error("unexpected response (expected {0})")]
    Unexpected(&'static str),
}

impl Supply<SerialStream> {
    /// Opens the configured serial port (8N1) and starts the poller.
    pub fn open(config: &SupplyConfig) -> Result<Self, SupplyError> {
        let stream = tokio_serial::new(&config.port, config.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()?;

        tracing::info!("Opened {} at {} baud", config.port, config.baud);

        Ok(Self::with_transport(stream))
    }
}

impl<T> Supply<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wraps an async stream that speaks the supply protocol.
    ///
    /// The transport is not restricted to a local serial port: a TCP
    /// serial bridge or an in-memory pipe work just as well.
    pub fn with_transport(io: T) -> Self {
        let (telemetry, _) = watch::channel(Telemetry {
            status: DeviceStatus::default(),
            stale: true,
        });

        let (setpoint, _) = watch::channel(Setpoint::default());

        let inner = Arc::new(Inner {
            link: Mutex::new(Link::new(io)),
            telemetry,
            setpoint,
        });

        let poll_task = tokio::spawn(Self::poll_task(inner.clone()));

        Supply { inner, poll_task }
    }

    pub fn telemetry(&self) -> watch::Receiver<Telemetry> {
        self.inner.telemetry.subscribe()
    }

    /// The last commanded setpoint, as used by the stability monitor.
    pub fn setpoint(&self) -> watch::Receiver<Setpoint> {
        self.inner.setpoint.subscribe()
    }

    /// One-shot status query, competing with the poller for the port.
    pub async fn query(&self) -> Result<DeviceStatus, SupplyError> {
        let mut link = self.inner.link.lock().await;
        let status = link.query().await?;

        self.inner.telemetry.send_replace(Telemetry { status, stale: false });

        Ok(status)
    }

    /// Programs the setpoint and raises HV.
    pub async fn set_output(&self, setpoint: Setpoint) -> Result<DeviceStatus, SupplyError> {
        let request = Request::set_output(setpoint, DigitalControl::HvOn)?;
        self.execute(request, setpoint).await
    }

    /// Drops HV while keeping the programmed setpoint.
    pub async fn hv_off(&self) -> Result<DeviceStatus, SupplyError> {
        let setpoint = *self.inner.setpoint.borrow();
        let request = Request::set_output(setpoint, DigitalControl::HvOff)?;
        self.execute(request, setpoint).await
    }

    /// Zero setpoint plus power-off, regardless of prior state. Leaves
    /// the port open.
    pub async fn reset(&self) -> Result<DeviceStatus, SupplyError> {
        self.execute(Request::reset(), Setpoint::default()).await
    }

    pub async fn version(&self) -> Result<String, SupplyError> {
        let mut link = self.inner.link.lock().await;

        match link.exec(Request::Version).await? {
            Response::Version(version) => Ok(version),
            _ => Err(SupplyError::Unexpected("version frame")),
        }
    }

    /// Bench-debugging aid; the timeout must stay enabled in normal use.
    pub async fn set_comm_timeout(&self, enabled: bool) -> Result<(), SupplyError> {
        let mut link = self.inner.link.lock().await;
        link.exec_ack(Request::SetCommTimeout(enabled)).await
    }

    /// Sends a set-family command and refreshes the published state, as
    /// the device only reports flags through a follow-up query.
    async fn execute(
        &self,
        request: Request,
        setpoint: Setpoint,
    ) -> Result<DeviceStatus, SupplyError> {
        let mut link = self.inner.link.lock().await;

        link.exec_ack(request).await?;
        self.inner.setpoint.send_replace(setpoint);

        let status = link.query().await?;
        self.inner.telemetry.send_replace(Telemetry { status, stale: false });

        Ok(status)
    }

    async fn poll_task(inner: Arc<Inner<T>>) {
        let mut timer = interval(POLL_INTERVAL);

        loop {
            timer.tick().await;

            let mut link = inner.link.lock().await;

            match link.query().await {
                Ok(status) => {
                    inner.telemetry.send_replace(Telemetry { status, stale: false });
                }

                // Keep the previous snapshot, flagged stale; the link
                // stays alive and the next poll may recover.
                Err(err) => {
                    tracing::debug!("Poll failed: {err}");

                    inner.telemetry.send_if_modified(|telemetry| {
                        let was_fresh = !telemetry.stale;
                        telemetry.stale = true;
                        was_fresh
                    });
                }
            }
        }
    }
}

impl<T> Drop for Supply<T> {
    fn drop(&mut self) {
        self.poll_task.abort();
    }
}

impl<T> Link<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    const READ_CHUNK: usize = 64;

    fn new(io: T) -> Self {
        Self {
            io,
            read_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(32),
        }
    }

    /// Writes one request frame and decodes the response line. Device
    /// error frames surface as `SupplyError::Device`.
    async fn exec(&mut self, request: Request) -> Result<Response, SupplyError> {
        // Discard anything left over from an earlier, failed exchange.
        self.read_buf.clear();

        self.write_buf.clear();
        request.encode(&mut self.write_buf);
        self.io.write_all(&self.write_buf).await?;

        let line = self.read_line().await?;

        match Response::parse(&line)? {
            Response::Fault(fault) => Err(SupplyError::Device(fault)),
            response => Ok(response),
        }
    }

    async fn exec_ack(&mut self, request: Request) -> Result<(), SupplyError> {
        match self.exec(request).await? {
            Response::Ack => Ok(()),
            _ => Err(SupplyError::Unexpected("acknowledge")),
        }
    }

    async fn query(&mut self) -> Result<DeviceStatus, SupplyError> {
        match self.exec(Request::Query).await? {
            Response::Status(status) => Ok(status),
            _ => Err(SupplyError::Unexpected("status frame")),
        }
    }

    /// Reads up to the CR terminator, returning the line without it.
    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(index) = self.read_buf.iter().position(|&byte| byte == CR) {
                let mut line: Vec<u8> = self.read_buf.drain(..=index).collect();
                line.pop();
                return Ok(line);
            }

            let mut chunk = [0u8; Self::READ_CHUNK];
            let count = self.io.read(&mut chunk).await?;

            if count == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            self.read_buf.extend_from_slice(&chunk[..count]);
        }
    }
}
