//! Serial transport for RS-232 motion controllers.
//!
//! Wraps the `serialport` crate and provides async I/O by moving the blocking
//! reads and writes onto Tokio's blocking task executor. Responses are read one
//! byte at a time until the configured delimiter, under an overall per-read
//! deadline; the port's own short timeout just paces the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use serialport::SerialPort;
use tokio::sync::Mutex;

use super::{Transport, TransportError};
use crate::config::SerialConfig;

/// RS-232 transport speaking newline-terminated ASCII.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Create an unconnected transport from serial settings.
    pub fn new(config: SerialConfig) -> Self {
        Self { config, port: None }
    }

    /// Open the configured port.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        let port = serialport::new(&self.config.port, self.config.baud_rate)
            // Internal read timeout; the overall deadline is enforced per response.
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| {
                TransportError::Failed(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    self.config.port, self.config.baud_rate, e
                ))
            })?;

        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(
            "Serial port '{}' opened at {} baud",
            self.config.port, self.config.baud_rate
        );
        Ok(())
    }

    /// Close the port, if open.
    pub fn disconnect(&mut self) {
        if self.port.take().is_some() {
            debug!("Serial port '{}' closed", self.config.port);
        }
    }

    fn port_handle(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>, TransportError> {
        self.port.clone().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        let port = self.port_handle()?;
        let framed = format!("{}{}", command, self.config.line_terminator);
        let logged = command.to_string();

        // Execute blocking serial I/O on a dedicated thread
        tokio::task::spawn_blocking(move || {
            use std::io::Write;

            let mut guard = port.blocking_lock();
            guard.write_all(framed.as_bytes())?;
            guard.flush()?;
            debug!("Sent serial command: {}", logged.trim());
            Ok(())
        })
        .await
        .map_err(|e| TransportError::Failed(format!("Serial I/O task panicked: {}", e)))?
    }

    async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        let port = self.port_handle()?;
        let framed = format!("{}{}", command, self.config.line_terminator);
        let logged = command.to_string();
        let delimiter = self.config.response_delimiter;
        let deadline = self.config.read_timeout;

        tokio::task::spawn_blocking(move || -> Result<String, TransportError> {
            use std::io::{Read, Write};

            let mut guard = port.blocking_lock();
            guard.write_all(framed.as_bytes())?;
            guard.flush()?;
            debug!("Sent serial command: {}", logged.trim());

            let mut response = String::new();
            let mut buffer = [0u8; 1];
            let start = Instant::now();

            loop {
                if start.elapsed() > deadline {
                    return Err(TransportError::Timeout {
                        elapsed: start.elapsed(),
                    });
                }

                match guard.read(&mut buffer) {
                    Ok(1) => {
                        let ch = buffer[0] as char;
                        if ch == delimiter {
                            break;
                        }
                        response.push(ch);
                    }
                    Ok(0) => return Err(TransportError::Eof),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        // Port timeout is shorter than the overall deadline
                        continue;
                    }
                    Err(e) => return Err(TransportError::Io(e)),
                    Ok(_) => {
                        return Err(TransportError::Failed(
                            "single-byte read returned more than one byte".to_string(),
                        ))
                    }
                }
            }

            let response = response.trim().to_string();
            debug!("Received serial response: {}", response);
            Ok(response)
        })
        .await
        .map_err(|e| TransportError::Failed(format!("Serial I/O task panicked: {}", e)))?
    }
}
