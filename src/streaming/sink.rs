//! Frame consumers.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::info;

use crate::error::AppResult;

/// Destination for encoded frames.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

impl FrameSink for TcpStream {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_all(frame)
    }
}

/// Block until one acquisition client connects to `addr`.
pub fn accept_consumer(addr: impl ToSocketAddrs) -> AppResult<(TcpStream, SocketAddr)> {
    let listener = TcpListener::bind(addr)?;
    info!(addr = %listener.local_addr()?, "Waiting for acquisition consumer");
    let (stream, peer) = listener.accept()?;
    stream.set_nodelay(true)?;
    info!(%peer, "Acquisition consumer connected");
    Ok((stream, peer))
}

/// In-memory sink that keeps every frame with its send time.
///
/// Clones share the same buffer, so a test can keep one clone while the stream worker
/// owns another.
#[derive(Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<(Instant, Bytes)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().iter().map(|(_, f)| f.clone()).collect()
    }

    pub fn timestamps(&self) -> Vec<Instant> {
        self.frames.lock().iter().map(|(t, _)| *t).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FrameSink for MemorySink {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.frames
            .lock()
            .push((Instant::now(), Bytes::copy_from_slice(frame)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn memory_sink_clones_share_frames() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.send_frame(b"abc").unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(&sink.frames()[0][..], b"abc");
    }

    #[test]
    fn tcp_stream_delivers_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        });
        let (mut server, _) = listener.accept().unwrap();
        server.send_frame(&[1, 2, 3, 4]).unwrap();
        assert_eq!(client.join().unwrap(), [1, 2, 3, 4]);
    }
}
