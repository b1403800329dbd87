use crate::config::ReaderConfig;
use crate::reader::{BadgeReader, CardCallback, ReaderShared};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Serial variant poll cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Line-oriented serial badge reader (CH340/CP2102/FTDI-style USB dongles
/// that print one badge identifier per line).
pub struct SerialBadgeReader {
    port_name: String,
    baud_rate: u32,
    shared: Arc<ReaderShared>,
    handle: Option<JoinHandle<()>>,
    #[cfg(feature = "serial")]
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialBadgeReader {
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            port_name: config.serial_port.clone(),
            baud_rate: config.baud_rate,
            shared: ReaderShared::new(),
            handle: None,
            #[cfg(feature = "serial")]
            port: None,
        }
    }
}

#[cfg(feature = "serial")]
mod imp {
    use super::*;
    use crate::error::ReaderError;
    use crate::reader::{run_poll_loop, stop_poll_thread};
    use std::collections::VecDeque;
    use std::io::Read;
    use tracing::{debug, error, info, warn};

    /// Interface-chip signatures recognized during port auto-detection.
    const USB_CHIP_KEYWORDS: &[&str] =
        &["USB", "SERIAL", "UART", "CH340", "CP2102", "FTDI", "ACM"];

    fn port_matches(info: &serialport::SerialPortInfo) -> bool {
        let mut haystack = info.port_name.to_uppercase();
        if let serialport::SerialPortType::UsbPort(usb) = &info.port_type {
            if let Some(product) = &usb.product {
                haystack.push_str(&product.to_uppercase());
            }
            if let Some(manufacturer) = &usb.manufacturer {
                haystack.push_str(&manufacturer.to_uppercase());
            }
        }
        USB_CHIP_KEYWORDS.iter().any(|kw| haystack.contains(kw))
    }

    /// Pick the configured port, or the first port that looks like a USB
    /// serial adapter, or the first port at all.
    fn detect_port(configured: &str) -> Option<String> {
        if !configured.is_empty() {
            return Some(configured.to_string());
        }

        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Serial port enumeration failed: {}", e);
                return None;
            }
        };

        if let Some(info) = ports.iter().find(|info| port_matches(info)) {
            debug!("Auto-detected serial reader on {}", info.port_name);
            return Some(info.port_name.clone());
        }

        ports.first().map(|info| info.port_name.clone())
    }

    /// Names of ports currently visible, for diagnostics.
    pub fn list_serial_ports() -> Vec<String> {
        serialport::available_ports()
            .unwrap_or_default()
            .into_iter()
            .map(|info| match info.port_type {
                serialport::SerialPortType::UsbPort(usb) => format!(
                    "{} ({})",
                    info.port_name,
                    usb.product.unwrap_or_else(|| "USB serial".to_string())
                ),
                _ => info.port_name,
            })
            .collect()
    }

    impl SerialBadgeReader {
        fn open_port(&self) -> Result<Box<dyn serialport::SerialPort>, ReaderError> {
            let path = detect_port(&self.port_name).ok_or(ReaderError::NoDevice)?;

            let port = serialport::new(&path, self.baud_rate)
                .timeout(Duration::from_millis(50))
                .open()
                .map_err(|e| ReaderError::Open {
                    device: path.clone(),
                    details: e.to_string(),
                })?;

            info!("Serial reader connected on {} @ {} baud", path, self.baud_rate);
            Ok(port)
        }
    }

    impl BadgeReader for SerialBadgeReader {
        fn connect(&mut self) -> bool {
            if self.port.is_none() {
                match self.open_port() {
                    Ok(port) => self.port = Some(port),
                    Err(e) => {
                        error!("Serial reader unavailable: {}", e);
                        self.shared.set_connected(false);
                        return false;
                    }
                }
            }
            self.shared.set_connected(true);
            true
        }

        fn disconnect(&mut self) {
            self.stop_reading();
            self.port = None;
            self.shared.set_connected(false);
        }

        fn start_reading(&mut self, on_card: CardCallback) {
            if self.shared.is_running() {
                warn!("Serial reader already reading");
                return;
            }

            // The port moves into the poll thread; reopen after a previous
            // stop_reading cycle.
            if self.port.is_none() && !self.connect() {
                error!("Cannot start reading: serial port unavailable");
                return;
            }
            let Some(mut port) = self.port.take() else {
                return;
            };

            self.shared.set_running(true);
            let shared = self.shared.clone();

            self.handle = Some(std::thread::spawn(move || {
                let mut accumulator = String::new();
                let mut pending: VecDeque<String> = VecDeque::new();
                let mut buf = [0u8; 256];

                run_poll_loop(
                    "serial",
                    shared,
                    POLL_INTERVAL,
                    move || {
                        let waiting = port.bytes_to_read().map_err(|e| ReaderError::Read {
                            details: e.to_string(),
                        })?;

                        if waiting > 0 {
                            match port.read(&mut buf) {
                                Ok(0) => {}
                                Ok(n) => {
                                    accumulator.push_str(&String::from_utf8_lossy(&buf[..n]));
                                    while let Some(pos) = accumulator.find('\n') {
                                        let line = accumulator[..pos].trim().to_string();
                                        accumulator.drain(..=pos);
                                        if !line.is_empty() {
                                            pending.push_back(line);
                                        }
                                    }
                                }
                                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                                Err(e) => {
                                    return Err(ReaderError::Read {
                                        details: e.to_string(),
                                    })
                                }
                            }
                        }

                        Ok(pending.pop_front())
                    },
                    on_card,
                );
            }));
        }

        fn stop_reading(&mut self) {
            stop_poll_thread("serial", &self.shared, self.handle.take());
        }

        fn is_reading(&self) -> bool {
            self.shared.is_running()
        }

        fn is_connected(&self) -> bool {
            self.shared.is_connected()
        }

        fn shared(&self) -> Arc<ReaderShared> {
            self.shared.clone()
        }

        fn name(&self) -> &'static str {
            "serial"
        }
    }
}

#[cfg(feature = "serial")]
pub use imp::list_serial_ports;

#[cfg(not(feature = "serial"))]
mod imp {
    use super::*;
    use crate::error::ReaderError;
    use tracing::warn;

    impl BadgeReader for SerialBadgeReader {
        fn connect(&mut self) -> bool {
            warn!("{}", ReaderError::Unavailable("serial"));
            false
        }

        fn disconnect(&mut self) {}

        fn start_reading(&mut self, _on_card: CardCallback) {
            warn!("{}", ReaderError::Unavailable("serial"));
        }

        fn stop_reading(&mut self) {
            let _ = self.handle.take();
        }

        fn is_reading(&self) -> bool {
            false
        }

        fn is_connected(&self) -> bool {
            false
        }

        fn shared(&self) -> Arc<ReaderShared> {
            self.shared.clone()
        }

        fn name(&self) -> &'static str {
            "serial (unavailable)"
        }
    }
}

#[cfg(not(feature = "serial"))]
pub fn list_serial_ports() -> Vec<String> {
    Vec::new()
}

#[cfg(all(test, feature = "serial"))]
mod tests {
    use super::*;
    use crate::config::PointeuseConfig;

    #[test]
    fn test_connect_fails_on_bogus_port() {
        let mut config = PointeuseConfig::default().reader;
        config.serial_port = "/dev/does-not-exist-pointeuse".to_string();

        let mut reader = SerialBadgeReader::new(&config);
        assert!(!reader.connect());
        assert!(!reader.is_connected());
        assert!(!reader.is_reading());
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let config = PointeuseConfig::default().reader;
        let mut reader = SerialBadgeReader::new(&config);
        reader.stop_reading();
        assert!(!reader.is_reading());
    }
}
