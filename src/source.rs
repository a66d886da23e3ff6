//! Frame source abstraction over the transport receiver.
//!
//! The network receiver that demultiplexes transport packets into access
//! units lives outside this crate; the decode supervisor only consumes
//! this interface and tears the binding down on every restart.

use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::info;

/// One coded picture's worth of compressed bytes, the atomic unit fed
/// to a decoder. Borrowed by the decode engine for the duration of a
/// feed call, never retained.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    /// Creation timestamp, used to measure parse-to-feed latency
    pub created_at: Instant,
}

impl AccessUnit {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            created_at: Instant::now(),
        }
    }
}

/// Supplier of encoded access units and the initial configuration
/// payload.
pub trait FrameSource {
    /// Wait up to `timeout` for the next access unit. This is the only
    /// blocking operation on the decode thread.
    fn try_get_access_unit(&mut self, timeout: Duration) -> Option<AccessUnit>;

    /// Session configuration data (e.g. SPS/PPS payload), if the
    /// receiver has negotiated one. Consumed once per session.
    fn try_get_session_config_data(&mut self) -> Option<Bytes>;

    /// Whether the stream's negotiated parameters changed mid-session.
    /// Sticky flag, cleared by reading it.
    fn parameters_changed(&mut self) -> bool;
}

/// Minimal UDP binding: one datagram is treated as one opaque access
/// unit. Demultiplexing and reassembly belong to the external receiver.
pub struct UdpFrameSource {
    socket: UdpSocket,
    recv_buf: Vec<u8>,
}

/// Largest access unit we accept in a single datagram.
const MAX_DATAGRAM_SIZE: usize = 1024 * 1024;

impl UdpFrameSource {
    pub fn bind(ip: &str, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((ip, port))?;
        info!("listening for video on {}:{}", ip, port);
        Ok(Self {
            socket,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }
}

impl FrameSource for UdpFrameSource {
    fn try_get_access_unit(&mut self, timeout: Duration) -> Option<AccessUnit> {
        // set_read_timeout(Some(0)) would error, clamp to 1ms
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket.set_read_timeout(Some(timeout)).ok()?;
        match self.socket.recv(&mut self.recv_buf) {
            Ok(len) => Some(AccessUnit::new(Bytes::copy_from_slice(
                &self.recv_buf[..len],
            ))),
            Err(_) => None,
        }
    }

    fn try_get_session_config_data(&mut self) -> Option<Bytes> {
        None
    }

    fn parameters_changed(&mut self) -> bool {
        false
    }
}

/// Channel-backed source for hosts that already own a receiver, and for
/// tests. The [`SourceHandle`] side injects access units and signals.
pub struct ChannelFrameSource {
    rx: flume::Receiver<AccessUnit>,
    config_data: Arc<Mutex<Option<Bytes>>>,
    params_changed: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct SourceHandle {
    tx: flume::Sender<AccessUnit>,
    config_data: Arc<Mutex<Option<Bytes>>>,
    params_changed: Arc<AtomicBool>,
}

impl ChannelFrameSource {
    pub fn new() -> (Self, SourceHandle) {
        let (tx, rx) = flume::unbounded();
        let config_data = Arc::new(Mutex::new(None));
        let params_changed = Arc::new(AtomicBool::new(false));
        (
            Self {
                rx,
                config_data: config_data.clone(),
                params_changed: params_changed.clone(),
            },
            SourceHandle {
                tx,
                config_data,
                params_changed,
            },
        )
    }
}

impl SourceHandle {
    pub fn push(&self, au: AccessUnit) -> bool {
        self.tx.send(au).is_ok()
    }

    pub fn set_session_config_data(&self, data: Bytes) {
        *self.config_data.lock().unwrap() = Some(data);
    }

    pub fn signal_parameters_changed(&self) {
        self.params_changed.store(true, Ordering::Release);
    }
}

impl FrameSource for ChannelFrameSource {
    fn try_get_access_unit(&mut self, timeout: Duration) -> Option<AccessUnit> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn try_get_session_config_data(&mut self) -> Option<Bytes> {
        self.config_data.lock().unwrap().take()
    }

    fn parameters_changed(&mut self) -> bool {
        self.params_changed.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_source_delivers_in_order() {
        let (mut source, handle) = ChannelFrameSource::new();
        handle.push(AccessUnit::new(Bytes::from_static(&[1])));
        handle.push(AccessUnit::new(Bytes::from_static(&[2])));

        let first = source.try_get_access_unit(Duration::from_millis(10)).unwrap();
        let second = source.try_get_access_unit(Duration::from_millis(10)).unwrap();
        assert_eq!(first.data.as_ref(), &[1]);
        assert_eq!(second.data.as_ref(), &[2]);
        assert!(source.try_get_access_unit(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn parameters_changed_is_sticky_until_read() {
        let (mut source, handle) = ChannelFrameSource::new();
        assert!(!source.parameters_changed());
        handle.signal_parameters_changed();
        assert!(source.parameters_changed());
        // cleared by the read
        assert!(!source.parameters_changed());
    }

    #[test]
    fn session_config_data_is_consumed_once() {
        let (mut source, handle) = ChannelFrameSource::new();
        handle.set_session_config_data(Bytes::from_static(b"sps-pps"));
        assert!(source.try_get_session_config_data().is_some());
        assert!(source.try_get_session_config_data().is_none());
    }
}
