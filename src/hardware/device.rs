//! One scope on one serial line.
//!
//! A [`Device`] owns its open [`SerialLink`]. All methods block; the fleet runs them on the
//! blocking worker pool. Dropping a device closes the line.

use crate::config::SerialSettings;
use crate::error::{AppResult, DeviceError, VscopeError};
use crate::hardware::link::{PortScanner, SerialLink};
use crate::protocol::codec::{
    decode_text, Command, Handshake, BYTES_PER_SAMPLE, HANDSHAKE_RESPONSE_LEN,
    LABEL_RESPONSE_LEN,
};
use std::io::{self, ErrorKind, Write};
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

/// Read timeout for fixed-size responses.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(20);
/// Read timeout for a full buffer download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Attempts per command before giving up.
pub const MAX_ATTEMPTS: usize = 3;

/// A connected scope.
pub struct Device {
    comport: String,
    link: Box<dyn SerialLink>,
    channels: u16,
    buffer_length: u16,
    identifier: String,
    channel_labels: Vec<String>,
    response: Option<Vec<u8>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("comport", &self.comport)
            .field("identifier", &self.identifier)
            .field("channels", &self.channels)
            .field("buffer_length", &self.buffer_length)
            .field("channel_labels", &self.channel_labels)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Open `path` through `scanner` and run the handshake.
    pub fn connect(
        scanner: &dyn PortScanner,
        path: &str,
        settings: &SerialSettings,
    ) -> AppResult<Self> {
        let link = scanner.open(path, settings)?;
        Self::with_link(path, link)
    }

    /// Wrap an already open line and run the handshake.
    pub fn with_link(path: &str, link: Box<dyn SerialLink>) -> AppResult<Self> {
        let mut device = Self {
            comport: path.to_string(),
            link,
            channels: 0,
            buffer_length: 0,
            identifier: path.to_string(),
            channel_labels: Vec::new(),
            response: None,
        };
        device.configure()?;
        Ok(device)
    }

    /// Re-run the handshake and refresh dimensions, identifier and labels.
    ///
    /// A short handshake response leaves the device unusable and is reported as
    /// [`VscopeError::Handshake`]. Label failures only yield empty labels.
    #[instrument(skip(self), fields(port = %self.comport))]
    pub fn configure(&mut self) -> AppResult<()> {
        let handshake = self.handshake().map_err(|source| VscopeError::Handshake {
            port: self.comport.clone(),
            source,
        })?;

        self.channels = handshake.channels;
        self.buffer_length = handshake.buffer_length;
        self.identifier = if handshake.name.is_empty() {
            self.comport.clone()
        } else {
            handshake.name
        };
        self.channel_labels = (0..u32::from(self.channels))
            .map(|channel| self.label(channel))
            .collect();

        debug!(
            device = %self.identifier,
            channels = self.channels,
            buffer_length = self.buffer_length,
            "Device configured"
        );
        Ok(())
    }

    fn handshake(&mut self) -> Result<Handshake, DeviceError> {
        self.link.set_timeout(COMMAND_TIMEOUT)?;
        self.link.discard_buffers()?;
        self.link.write_all(&Command::Handshake.encode())?;
        self.link.flush()?;

        let raw = read_up_to(self.link.as_mut(), HANDSHAKE_RESPONSE_LEN)?;
        Handshake::decode(&raw).ok_or(DeviceError::ShortRead {
            expected: HANDSHAKE_RESPONSE_LEN,
            received: raw.len(),
        })
    }

    /// Label of one channel; empty when the device does not answer.
    ///
    /// Firmware terminates labels with a NUL and does not pad them, so a response shorter
    /// than the maximum label length is accepted.
    pub fn label(&mut self, channel: u32) -> String {
        match self.query_label(channel) {
            Ok(label) => label,
            Err(e) => {
                warn!(port = %self.comport, channel, error = %e, "Channel label query failed");
                String::new()
            }
        }
    }

    fn query_label(&mut self, channel: u32) -> Result<String, DeviceError> {
        self.link.set_timeout(COMMAND_TIMEOUT)?;
        self.link.write_all(&Command::GetLabel(channel).encode())?;
        self.link.flush()?;
        let raw = read_up_to(self.link.as_mut(), LABEL_RESPONSE_LEN)?;
        Ok(decode_text(&raw))
    }

    /// Write `message` and read the response.
    ///
    /// `expected` is the response length in bytes; `None` means the full capture buffer, read
    /// with the long download timeout. Each failed attempt clears the line before retrying.
    pub fn send(&mut self, message: &[u8], expected: Option<usize>) -> Result<Vec<u8>, DeviceError> {
        let (size, timeout) = match expected {
            Some(size) => (size, COMMAND_TIMEOUT),
            None => (self.buffer_bytes(), DOWNLOAD_TIMEOUT),
        };

        for attempt in 1..=MAX_ATTEMPTS {
            match self.exchange(message, size, timeout) {
                Ok(response) => {
                    trace!(device = %self.identifier, bytes = response.len(), "Response received");
                    self.response = Some(response.clone());
                    return Ok(response);
                }
                Err(e) => {
                    debug!(device = %self.identifier, attempt, error = %e, "Exchange failed");
                    if let Err(e) = self.link.discard_buffers() {
                        debug!(device = %self.identifier, error = %e, "Could not clear line");
                    }
                }
            }
        }

        self.response = None;
        Err(DeviceError::RetriesExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    fn exchange(
        &mut self,
        message: &[u8],
        size: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, DeviceError> {
        self.link.set_timeout(timeout)?;
        self.link.write_all(message)?;
        self.link.flush()?;
        let response = read_up_to(self.link.as_mut(), size)?;
        if response.len() != size {
            return Err(DeviceError::ShortRead {
                expected: size,
                received: response.len(),
            });
        }
        Ok(response)
    }

    /// Size of a full buffer download in bytes.
    pub fn buffer_bytes(&self) -> usize {
        usize::from(self.channels) * usize::from(self.buffer_length) * BYTES_PER_SAMPLE
    }

    /// Port path.
    pub fn comport(&self) -> &str {
        &self.comport
    }

    /// Reported name, or the port path when the device has none.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Number of channels.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Samples per channel.
    pub fn buffer_length(&self) -> u16 {
        self.buffer_length
    }

    /// One label per channel.
    pub fn channel_labels(&self) -> &[String] {
        &self.channel_labels
    }

    /// Last successful response, cleared when a command fails.
    pub fn last_response(&self) -> Option<&[u8]> {
        self.response.as_deref()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug!(device = %self.identifier, port = %self.comport, "Closing serial line");
    }
}

/// Read until `size` bytes arrived, the line times out, or it reports end of stream.
fn read_up_to(link: &mut dyn SerialLink, size: usize) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match link.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::TimedOut => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buffer.truncate(filled);
    Ok(buffer)
}
