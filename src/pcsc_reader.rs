use crate::config::ReaderConfig;
use crate::reader::{BadgeReader, CardCallback, ReaderShared};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// PC/SC variant poll cadence. Contactless enumeration is heavier than a
/// serial buffer check, so the tick is slower.
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Get Data APDU: returns the card UID on ISO 14443 readers.
#[cfg(feature = "pcsc")]
const GET_UID_APDU: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

/// Contactless smart-card reader driven through the platform PC/SC stack
/// (ACR122U and compatible NFC readers).
pub struct PcscBadgeReader {
    reader_index: usize,
    shared: Arc<ReaderShared>,
    handle: Option<JoinHandle<()>>,
    #[cfg(feature = "pcsc")]
    context: Option<(pcsc::Context, std::ffi::CString)>,
}

impl PcscBadgeReader {
    pub fn new(config: &ReaderConfig) -> Self {
        Self {
            reader_index: config.pcsc_reader_index,
            shared: ReaderShared::new(),
            handle: None,
            #[cfg(feature = "pcsc")]
            context: None,
        }
    }
}

#[cfg(feature = "pcsc")]
mod imp {
    use super::*;
    use crate::reader::{run_poll_loop, stop_poll_thread};
    use pcsc::{Context, Protocols, Scope, ShareMode};
    use std::ffi::CString;
    use tracing::{debug, error, info, warn};

    fn hex_upper(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02X}", b)).collect()
    }

    /// One read attempt: connect to the card if one is on the reader,
    /// ask for its UID, release the connection.
    fn try_read_uid(context: &Context, reader: &CString) -> Option<String> {
        let card = match context.connect(reader, ShareMode::Shared, Protocols::ANY) {
            Ok(card) => card,
            // No badge on the reader is the normal idle case.
            Err(pcsc::Error::NoSmartcard) | Err(pcsc::Error::RemovedCard) => return None,
            Err(e) => {
                debug!("PC/SC connect failed: {}", e);
                return None;
            }
        };

        let mut response = [0u8; pcsc::MAX_BUFFER_SIZE];
        let response = match card.transmit(&GET_UID_APDU, &mut response) {
            Ok(response) => response,
            Err(e) => {
                debug!("PC/SC transmit failed: {}", e);
                return None;
            }
        };

        if response.len() < 2 {
            debug!("PC/SC short response ({} bytes)", response.len());
            return None;
        }

        let (data, status) = response.split_at(response.len() - 2);
        if status != [0x90, 0x00] {
            warn!(
                "PC/SC status {:02X} {:02X}, ignoring read",
                status[0], status[1]
            );
            return None;
        }

        if data.is_empty() {
            return None;
        }
        Some(hex_upper(data))
    }

    /// Names of PC/SC readers currently attached, for diagnostics.
    pub fn list_pcsc_readers() -> Vec<String> {
        let Ok(context) = Context::establish(Scope::User) else {
            return Vec::new();
        };
        let mut buf = [0u8; 2048];
        match context.list_readers(&mut buf) {
            Ok(readers) => readers
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    impl PcscBadgeReader {
        fn establish(&mut self) -> bool {
            let context = match Context::establish(Scope::User) {
                Ok(context) => context,
                Err(e) => {
                    error!("PC/SC context unavailable: {}", e);
                    return false;
                }
            };

            let mut buf = [0u8; 2048];
            let readers: Vec<CString> = match context.list_readers(&mut buf) {
                Ok(readers) => readers.map(CString::from).collect(),
                Err(e) => {
                    warn!("PC/SC reader enumeration failed: {}", e);
                    return false;
                }
            };

            let Some(reader) = readers.get(self.reader_index) else {
                warn!(
                    "PC/SC reader index {} out of range ({} readers found)",
                    self.reader_index,
                    readers.len()
                );
                return false;
            };

            info!("PC/SC reader connected: {}", reader.to_string_lossy());
            self.context = Some((context, reader.clone()));
            true
        }
    }

    impl BadgeReader for PcscBadgeReader {
        fn connect(&mut self) -> bool {
            if self.context.is_none() && !self.establish() {
                self.shared.set_connected(false);
                return false;
            }
            self.shared.set_connected(true);
            true
        }

        fn disconnect(&mut self) {
            self.stop_reading();
            self.context = None;
            self.shared.set_connected(false);
        }

        fn start_reading(&mut self, on_card: CardCallback) {
            if self.shared.is_running() {
                warn!("PC/SC reader already reading");
                return;
            }

            if self.context.is_none() && !self.connect() {
                error!("Cannot start reading: PC/SC reader unavailable");
                return;
            }
            let Some((context, reader)) = self.context.clone() else {
                return;
            };

            self.shared.set_running(true);
            let shared = self.shared.clone();

            self.handle = Some(std::thread::spawn(move || {
                run_poll_loop(
                    "pcsc",
                    shared,
                    POLL_INTERVAL,
                    move || Ok(try_read_uid(&context, &reader)),
                    on_card,
                );
            }));
        }

        fn stop_reading(&mut self) {
            stop_poll_thread("pcsc", &self.shared, self.handle.take());
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
            "pcsc"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_hex_upper() {
            assert_eq!(hex_upper(&[0xDE, 0xAD, 0x01]), "DEAD01");
            assert_eq!(hex_upper(&[]), "");
        }
    }
}

#[cfg(feature = "pcsc")]
pub use imp::list_pcsc_readers;

#[cfg(not(feature = "pcsc"))]
mod imp {
    use super::*;
    use crate::error::ReaderError;
    use tracing::warn;

    impl BadgeReader for PcscBadgeReader {
        fn connect(&mut self) -> bool {
            warn!("{}", ReaderError::Unavailable("pcsc"));
            false
        }

        fn disconnect(&mut self) {}

        fn start_reading(&mut self, _on_card: CardCallback) {
            warn!("{}", ReaderError::Unavailable("pcsc"));
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
            "pcsc (unavailable)"
        }
    }
}

#[cfg(not(feature = "pcsc"))]
pub fn list_pcsc_readers() -> Vec<String> {
    Vec::new()
}
