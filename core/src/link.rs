// Raw Layer-2 access behind a narrow seam.
//
// The stream engine only ever talks to the `RawLink` trait; the pnet
// datalink channel is the production backend, tests substitute scripted
// links. Transmitter and listener each own a separate link on the same
// interface.

use crate::iec61850::ethernet::MacAddr;
use log::debug;
use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};
use std::fmt;
use std::io;
use std::time::Duration;

/// Poll granularity of the receive side. Receives never block longer than
/// this, so cancellation stays responsive.
const READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Socket buffer sizing: ~300 KB/s at 4800 Hz, sized to absorb burst jitter.
const WRITE_BUFFER_SIZE: usize = 1 << 20;
const READ_BUFFER_SIZE: usize = 2 << 20;

#[derive(Debug)]
pub enum LinkError {
    NoSuchInterface(String),
    UnsupportedChannel(String),
    Io { iface: String, source: io::Error },
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkError::NoSuchInterface(iface) => {
                write!(f, "no such network interface: {}", iface)
            }
            LinkError::UnsupportedChannel(iface) => {
                write!(f, "interface {} does not provide an Ethernet channel", iface)
            }
            LinkError::Io { iface, source } => {
                if source.kind() == io::ErrorKind::PermissionDenied {
                    write!(
                        f,
                        "failed to open {}: {} (raw sockets usually require elevated privileges)",
                        iface, source
                    )
                } else {
                    write!(f, "failed to open {}: {}", iface, source)
                }
            }
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LinkError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// The four-method capability the engine consumes: send a frame, poll for a
/// frame, report the interface MAC. Closing is dropping.
pub trait RawLink: Send {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<usize>;

    /// Poll for one frame. `Ok(None)` means nothing was pending within the
    /// poll window.
    fn recv_frame(&mut self) -> io::Result<Option<Vec<u8>>>;

    fn mac_address(&self) -> Option<MacAddr>;
}

/// pnet datalink backend bound to one named interface.
pub struct DatalinkLink {
    interface: NetworkInterface,
    tx: Box<dyn DataLinkSender>,
    rx: Box<dyn DataLinkReceiver>,
}

impl DatalinkLink {
    pub fn open(iface: &str) -> Result<DatalinkLink, LinkError> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|candidate| candidate.name == iface)
            .ok_or_else(|| LinkError::NoSuchInterface(iface.to_string()))?;

        let config = datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            write_buffer_size: WRITE_BUFFER_SIZE,
            read_buffer_size: READ_BUFFER_SIZE,
            ..Default::default()
        };

        match datalink::channel(&interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => {
                debug!("opened datalink channel on {}", iface);
                Ok(DatalinkLink { interface, tx, rx })
            }
            Ok(_) => Err(LinkError::UnsupportedChannel(iface.to_string())),
            Err(source) => Err(LinkError::Io {
                iface: iface.to_string(),
                source,
            }),
        }
    }

    pub fn interface_name(&self) -> &str {
        &self.interface.name
    }
}

impl RawLink for DatalinkLink {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        match self.tx.send_to(frame, None) {
            Some(Ok(())) => Ok(frame.len()),
            Some(Err(e)) => Err(e),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datalink sender refused the frame",
            )),
        }
    }

    fn recv_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(frame.to_vec())),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn mac_address(&self) -> Option<MacAddr> {
        self.interface.mac.map(|mac| MacAddr(mac.octets()))
    }
}
