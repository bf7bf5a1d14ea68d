//! Interrupt endpoint polling
//!
//! One reader thread per Connected session. It reads the claimed interrupt IN
//! endpoint into a reusable buffer, turns each packet into text and ships it to
//! the UI queue. It never releases anything: the session manager clears the
//! shared `running` flag, releases the link, and waits for the thread to exit.
//!
//! ```text
//! session thread                 reader thread                  UI
//! ──────────────                 ─────────────                  ──
//!   spawn ───────────────────────► loop while running
//!                                    read_interrupt (≤ timeout)
//!                                    decode ───────────────────► DataAppended
//!                                    sleep(interval)
//!   running = false
//!   link.release() ──────────────► read fails / flag seen
//!   wait (grace) ◄───────────────── exit
//! ```

use crate::error::{SessionError, classify_read_error};
use crate::usb::host::DeviceLink;
use async_channel::Sender;
use common::{EndpointHandle, SessionEvent, SessionId, UiEvent};
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Default pause between two reads
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Default upper bound for one blocking read
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Fixed-capacity packet buffer, allocated once per reader
pub struct ReadBuffer {
    data: Box<[u8]>,
    filled: usize,
}

impl ReadBuffer {
    /// Buffer sized to the endpoint's max packet size
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes received by the last completed read
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Whole buffer for the next read to fill
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record how many bytes the last read produced
    pub fn set_filled(&mut self, len: usize) {
        self.filled = len.min(self.data.len());
    }

    /// Zero the buffer for reuse
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.filled = 0;
    }
}

/// Render raw packet bytes as text
///
/// Each byte becomes its signed decimal value (0xFF is "-1"), separated by single
/// spaces. This is a raw diagnostic view of the card data, not a character decoding.
pub fn decode_packet(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len() * 4);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            text.push(' ');
        }
        // Writing to a String cannot fail
        let _ = write!(text, "{}", *byte as i8);
    }
    text
}

/// Reader settings
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub read_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Polling loop state for one session
pub struct PollingReader {
    session: SessionId,
    link: Arc<dyn DeviceLink>,
    endpoint: EndpointHandle,
    running: Arc<AtomicBool>,
    settings: PollSettings,
    ui_tx: Sender<UiEvent>,
    event_tx: Sender<SessionEvent>,
}

impl PollingReader {
    pub fn new(
        session: SessionId,
        link: Arc<dyn DeviceLink>,
        endpoint: EndpointHandle,
        running: Arc<AtomicBool>,
        settings: PollSettings,
        ui_tx: Sender<UiEvent>,
        event_tx: Sender<SessionEvent>,
    ) -> Self {
        Self {
            session,
            link,
            endpoint,
            running,
            settings,
            ui_tx,
            event_tx,
        }
    }

    /// Run the loop until the running flag drops or the device goes away
    pub fn run(self) {
        info!(
            "Reader for session {} started on endpoint {:#04x}",
            self.session, self.endpoint.address
        );

        let mut buffer = ReadBuffer::new(usize::from(self.endpoint.max_packet_size));
        let mut lost = false;

        while self.running.load(Ordering::Acquire) {
            match self.poll_once(&mut buffer) {
                Ok(Some(text)) => {
                    // Teardown may have started while we were blocked in the read
                    if !self.running.load(Ordering::Acquire) {
                        debug!("Session {} stopped, dropping late packet", self.session);
                        break;
                    }
                    // Card data must not be dropped; a full UI queue stalls the reader
                    // instead, and teardown's grace period bounds the stall
                    if let Err(e) = self.ui_tx.send_blocking(UiEvent::DataAppended { text }) {
                        warn!("UI gone, stopping reader for session {}: {}", self.session, e);
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_terminal() => {
                    lost = self.running.load(Ordering::Acquire);
                    break;
                }
                Err(e) => {
                    warn!("Session {}: {}", self.session, e);
                }
            }

            std::thread::sleep(self.settings.interval);
        }

        if lost {
            warn!("Device for session {} went away, reader stopping", self.session);
            if let Err(e) = self.event_tx.send_blocking(SessionEvent::ReaderLost {
                session: self.session,
            }) {
                warn!("Failed to report reader loss: {}", e);
            }
        }

        info!("Reader for session {} stopped", self.session);
    }

    /// One read into `buffer`
    ///
    /// `Ok(Some(text))` for a packet, `Ok(None)` when the read completed without
    /// data (timeout or empty packet).
    pub fn poll_once(&self, buffer: &mut ReadBuffer) -> Result<Option<String>, SessionError> {
        let result = self.link.read_interrupt(
            self.endpoint.address,
            buffer.spare_mut(),
            self.settings.read_timeout,
        );

        match result {
            Ok(0) => Ok(None),
            Ok(len) => {
                buffer.set_filled(len);
                trace!("Session {}: read {} bytes", self.session, len);
                let text = decode_packet(buffer.filled());
                buffer.clear();
                Ok(Some(text))
            }
            Err(rusb::Error::Timeout) => Ok(None),
            Err(e) => Err(classify_read_error(e)),
        }
    }
}

/// Spawn the reader on its own thread
pub fn spawn_reader(reader: PollingReader) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("usb-reader-{}", reader.session.0))
        .spawn(move || reader.run())
}
