use eyre::Result;

pub fn list() -> Result<()> {
    let mut ports = tokio_serial::available_ports()?;
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));

    if ports.is_empty() {
        println!("No serial ports detected");
    }

    for port in ports {
        println!("{}", port.port_name);
    }

    Ok(())
}
