//! Serial transport for the MT protocol
//!
//! Owns the UART: a blocking reader thread feeds decoded frames into a
//! channel, an async writer task serialises outgoing frames. Everything
//! above this layer deals in [`MtFrame`]s, never bytes.

use crate::codec::FrameDecoder;
use crate::frame::MtFrame;
use crate::types::ProtocolError;

use serial2::SerialPort;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default baud rate for CC2531/CC2652 ZNP images
pub const BAUD_RATE: u32 = 115_200;

/// Serial port configuration
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`
    pub path: String,
    pub baud_rate: u32,
    /// Toggle RTS/DTR on open so a CC2531 skips its serial bootloader
    pub skip_bootloader: bool,
    /// RTS pin states applied on connect, 100 ms apart
    pub rts_states: Vec<bool>,
    /// DTR pin states applied on connect, 100 ms apart
    pub dtr_states: Vec<bool>,
}

impl SerialConfig {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: BAUD_RATE,
            skip_bootloader: true,
            rts_states: vec![false, true, false],
            dtr_states: vec![false, false, false],
        }
    }
}

/// Frame-level duplex handed to the bus
///
/// [`connect`] backs this with a serial port; [`MtLink::pair`] backs it
/// with in-process channels for simulators and tests.
pub struct MtLink {
    pub(crate) frame_rx: mpsc::Receiver<MtFrame>,
    pub(crate) write_tx: mpsc::Sender<WriteCommand>,
}

/// The far end of an in-process [`MtLink`]
pub struct MtLinkPeer {
    /// Inject frames as if they arrived from the wire
    pub frame_tx: mpsc::Sender<MtFrame>,
    /// Observe frames the bus writes
    pub write_rx: mpsc::Receiver<WriteCommand>,
}

/// Command to send to the writer task
pub enum WriteCommand {
    Send(MtFrame),
    Shutdown,
}

impl MtLink {
    /// Create a channel-backed link and its peer, no serial port involved
    #[must_use]
    pub fn pair() -> (MtLink, MtLinkPeer) {
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (write_tx, write_rx) = mpsc::channel(32);
        (
            MtLink { frame_rx, write_tx },
            MtLinkPeer { frame_tx, write_rx },
        )
    }
}

/// Open the serial port and spawn the reader/writer pair
#[allow(clippy::missing_errors_doc)]
pub async fn connect(config: &SerialConfig) -> Result<MtLink, ProtocolError> {
    tracing::info!("Connecting to ZNP at {}", config.path);

    let mut port = SerialPort::open(&config.path, config.baud_rate)?;

    // Short read timeout keeps the reader thread responsive to shutdown
    port.set_read_timeout(Duration::from_millis(100))?;

    if config.skip_bootloader {
        apply_pin_sequence(&port, &config.rts_states, &config.dtr_states).await?;
    }

    let reader_port = port.try_clone()?;

    let (frame_tx, frame_rx) = mpsc::channel::<MtFrame>(64);
    let (write_tx, write_rx) = mpsc::channel::<WriteCommand>(32);

    tokio::spawn(writer_task(port, write_rx));

    std::thread::spawn(move || {
        reader_thread(reader_port, frame_tx);
    });

    tracing::info!("Serial link to {} established", config.path);

    Ok(MtLink { frame_rx, write_tx })
}

/// Walk RTS/DTR through the configured states, 100 ms per step
async fn apply_pin_sequence(
    port: &SerialPort,
    rts_states: &[bool],
    dtr_states: &[bool],
) -> Result<(), ProtocolError> {
    let steps = rts_states.len().max(dtr_states.len());
    for i in 0..steps {
        if let Some(&rts) = rts_states.get(i) {
            port.set_rts(rts)?;
        }
        if let Some(&dtr) = dtr_states.get(i) {
            port.set_dtr(dtr)?;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

/// Writer task: serialises frame emission so frames are never interleaved
async fn writer_task(port: SerialPort, mut rx: mpsc::Receiver<WriteCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCommand::Send(frame) => {
                let data = frame.serialize();
                tracing::trace!("TX {:02X?}", data);
                if let Err(e) = port.write_all(&data) {
                    tracing::error!("Serial write error: {}", e);
                }
                if let Err(e) = port.flush() {
                    tracing::error!("Serial flush error: {}", e);
                }
            }
            WriteCommand::Shutdown => break,
        }
    }
    tracing::debug!("Writer task shutting down");
}

/// Reader thread: blocking reads, incremental decode, frames out by channel
fn reader_thread(port: SerialPort, frame_tx: mpsc::Sender<MtFrame>) {
    tracing::debug!("Reader thread started");
    let mut buffer = [0u8; 1024];
    let mut decoder = FrameDecoder::new();

    loop {
        match port.read(&mut buffer) {
            Ok(0) => {
                tracing::warn!("Serial port closed");
                break;
            }
            Ok(n) => {
                tracing::trace!("RX {:02X?}", &buffer[..n]);
                for frame in decoder.feed(&buffer[..n]) {
                    if frame_tx.blocking_send(frame).is_err() {
                        tracing::debug!("Frame channel closed, reader exiting");
                        return;
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if frame_tx.is_closed() {
                    return;
                }
            }
            Err(ref e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                continue;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                tracing::error!("Serial read error: {}", e);
                break;
            }
        }
    }
    tracing::debug!(
        "Reader thread shutting down ({} framing errors seen)",
        decoder.stats().framing_errors
    );
    // Dropping frame_tx signals disconnect to the bus
}
