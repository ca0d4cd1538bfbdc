use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::io::{self, Read};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

use crate::config::DsmrVersion;
use crate::telegram::{Telegram, TelegramBuffer};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Why reading from the port stopped.
#[derive(Debug)]
enum Stop {
    ChannelClosed,
    Disconnected(io::Error),
}

/// Dedicated thread reading P1 telegrams from the meter's serial port.
pub struct P1Reader {
    port: String,
    version: DsmrVersion,
    update_sender: Sender<Telegram>,
    buffer: TelegramBuffer,
}

impl P1Reader {
    /// Creates a reader that will send each decoded telegram via the provided channel
    pub fn new(port: String, version: DsmrVersion, update_sender: Sender<Telegram>) -> Self {
        Self {
            port,
            version,
            update_sender,
            buffer: TelegramBuffer::new(),
        }
    }

    /// Serial I/O is blocking, so the reader gets an OS thread rather than a tokio task.
    /// The thread exits once the receiving side of the channel is dropped.
    pub fn spawn(mut self) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn run(&mut self) {
        tracing::info!(port = %self.port, "starting P1 reader thread");
        let mut backoff = Duration::from_secs(1);

        loop {
            match self.open() {
                Ok(mut port) => {
                    tracing::info!(port = %self.port, "serial port opened");
                    backoff = Duration::from_secs(1);
                    match self.pump(&mut port) {
                        Stop::ChannelClosed => break,
                        Stop::Disconnected(e) => {
                            tracing::warn!(port = %self.port, "serial read failed: {e}")
                        }
                    }
                }
                Err(e) => tracing::warn!(port = %self.port, "cannot open serial port: {e}"),
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        tracing::info!("P1 reader thread exiting");
    }

    fn open(&self) -> serialport::Result<Box<dyn SerialPort>> {
        let builder = serialport::new(&self.port, self.version.baud_rate())
            .timeout(Duration::from_secs(5))
            .stop_bits(StopBits::One);
        let builder = match self.version {
            DsmrVersion::V2_2 => builder.data_bits(DataBits::Seven).parity(Parity::Even),
            DsmrVersion::V4 | DsmrVersion::V5 => {
                builder.data_bits(DataBits::Eight).parity(Parity::None)
            }
        };
        builder.open()
    }

    /// Reads until the source fails or ends, forwarding every valid telegram.
    fn pump(&mut self, source: &mut impl Read) -> Stop {
        let mut chunk = [0u8; 1024];
        loop {
            let read = match source.read(&mut chunk) {
                Ok(0) => return Stop::Disconnected(io::ErrorKind::UnexpectedEof.into()),
                Ok(read) => read,
                // Meters send a telegram every 1-10s; a quiet port is not an error
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Stop::Disconnected(e),
            };
            self.buffer.append(&chunk[..read]);

            while let Some(frame) = self.buffer.next_frame() {
                match Telegram::parse(&frame, self.version.has_crc()) {
                    Ok(telegram) => {
                        if self.update_sender.blocking_send(telegram).is_err() {
                            return Stop::ChannelClosed;
                        }
                    }
                    Err(e) => tracing::warn!("dropping telegram: {e}"),
                }
            }
        }
    }
}
