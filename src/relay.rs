use log::{info, warn};
use std::{
    io::{BufReader, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use thiserror::Error;

use crate::{
    bus::{Bus, BusError, Publisher, Subscription},
    msg::UInt8MultiArray,
    raw_data::QUEUE_DEPTH,
};

/// Largest payload accepted in a single frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const RELAY_NODE: &str = "raw_data_relay";

#[derive(Error, Debug)]
/// Errors raised while relaying the raw data stream over TCP
pub enum RelayError {
    /// Socket error
    #[error("Relay I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Announced frame length is above [`MAX_FRAME_LEN`]
    #[error("Frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    /// Bus subscription could not be created
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Write one frame: big-endian `u32` payload length, then the payload
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<(), RelayError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(RelayError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns `None` when the stream ends cleanly between frames.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Vec<u8>>, RelayError> {
    let mut header = [0u8; 4];
    let mut got = 0;
    while got < header.len() {
        match reader.read(&mut header[got..]) {
            Ok(0) if got == 0 => return Ok(None),
            Ok(0) => return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into()),
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RelayError::FrameTooLarge(len));
    }
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Forwards every message of a bus topic to all connected TCP clients
pub struct RelayServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accept_hdl: Option<thread::JoinHandle<()>>,
    _subscription: Subscription<UInt8MultiArray>,
    clients: Arc<Mutex<Vec<TcpStream>>>,
}

impl RelayServer {
    /// Listen on `addr` and relay the messages published on `topic`
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
        bus: &Bus<UInt8MultiArray>,
        topic: &str,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let clients = Arc::new(Mutex::new(Vec::<TcpStream>::new()));

        let subscription = {
            let clients = clients.clone();
            bus.create_subscription(RELAY_NODE, topic, QUEUE_DEPTH, move |msg: UInt8MultiArray| {
                let mut clients = clients.lock().unwrap_or_else(|e| e.into_inner());
                clients.retain_mut(|stream| match write_frame(stream, msg.as_bytes()) {
                    Ok(()) => true,
                    Err(e) => {
                        info!("Relay client {:?} dropped: {e}", stream.peer_addr().ok());
                        false
                    }
                });
            })?
        };

        let stop = Arc::new(AtomicBool::new(false));
        let accept_hdl = {
            let stop = stop.clone();
            let clients = clients.clone();
            thread::Builder::new()
                .name("relay-accept".into())
                .spawn(move || {
                    info!("Relaying raw data stream on {local_addr}");
                    while !stop.load(Ordering::Relaxed) {
                        match listener.accept() {
                            Ok((stream, peer)) => {
                                let setup = stream
                                    .set_nonblocking(false)
                                    .and_then(|_| stream.set_nodelay(true))
                                    .and_then(|_| {
                                        stream.set_write_timeout(Some(Duration::from_secs(1)))
                                    });
                                if let Err(e) = setup {
                                    warn!("Could not set up relay client {peer}: {e}");
                                    continue;
                                }
                                info!("Relay client {peer} connected");
                                clients
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .push(stream);
                            }
                            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                                thread::sleep(Duration::from_millis(50));
                            }
                            Err(e) => {
                                warn!("Relay accept error: {e}");
                                thread::sleep(Duration::from_millis(50));
                            }
                        }
                    }
                })?
        };

        Ok(Self {
            local_addr,
            stop,
            accept_hdl: Some(accept_hdl),
            _subscription: subscription,
            clients,
        })
    }

    /// Address the server listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(hdl) = self.accept_hdl.take() {
            let _ = hdl.join();
        }
        for stream in self.clients.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Receives a relayed stream and republishes it on the local bus
pub struct RelayClient {
    peer: SocketAddr,
    stream: TcpStream,
    hdl: Option<thread::JoinHandle<Result<u64, RelayError>>>,
}

impl RelayClient {
    /// Connect to a [`RelayServer`] and publish every received frame
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        publisher: Publisher<UInt8MultiArray>,
    ) -> Result<Self, RelayError> {
        let stream = TcpStream::connect(addr)?;
        let peer = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        info!("Receiving raw data stream from {peer}");
        let hdl = thread::Builder::new()
            .name("relay-client".into())
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                let mut frames = 0u64;
                while let Some(payload) = read_frame(&mut reader)? {
                    publisher.publish(UInt8MultiArray::from(payload));
                    frames += 1;
                }
                info!("Relay {peer} closed after {frames} frames");
                Ok(frames)
            })?;
        Ok(Self {
            peer,
            stream,
            hdl: Some(hdl),
        })
    }

    /// Address of the relay server
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the connection has ended
    pub fn is_finished(&self) -> bool {
        self.hdl.as_ref().map_or(true, |hdl| hdl.is_finished())
    }

    /// Close the connection; the reader thread ends at its next read
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Wait for the connection to end and return the number of frames received
    pub fn join(mut self) -> Result<u64, RelayError> {
        match self.hdl.take() {
            Some(hdl) => hdl.join().unwrap_or_else(|_| {
                Err(std::io::Error::new(ErrorKind::Other, "relay thread panicked").into())
            }),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{io::Cursor, sync::mpsc::channel, time::Instant};

    #[test]
    fn test_frames() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"\xb5\x62abc").unwrap();
        write_frame(&mut buf, b"").unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        let mut rd = Cursor::new(buf);
        assert_eq!(read_frame(&mut rd).unwrap().unwrap(), b"\xb5\x62abc");
        assert_eq!(read_frame(&mut rd).unwrap().unwrap(), b"");
        assert!(read_frame(&mut rd).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frames() {
        let mut rd = Cursor::new(vec![0u8, 0]);
        assert!(matches!(read_frame(&mut rd), Err(RelayError::Io(_))));
        let mut rd = Cursor::new(vec![0u8, 0, 0, 9, b'a']);
        assert!(matches!(read_frame(&mut rd), Err(RelayError::Io(_))));
        let mut rd = Cursor::new(0xffff_ffffu32.to_be_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut rd),
            Err(RelayError::FrameTooLarge(0xffff_ffff))
        ));
    }

    #[test]
    fn test_relay_roundtrip() {
        let source = Bus::<UInt8MultiArray>::new();
        let sink = Bus::<UInt8MultiArray>::new();
        let server = RelayServer::bind("127.0.0.1:0", &source, "/raw_data_pa/raw_data_stream")
            .unwrap();

        let (tx, rx) = channel();
        let _sub = sink
            .create_subscription("listener", "/raw_data_stream", 100, move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();
        let local = sink.create_publisher("relay", "/raw_data_stream").unwrap();
        let client = RelayClient::connect(server.local_addr(), local).unwrap();

        let start = Instant::now();
        while server.client_count() == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "client never accepted");
            thread::sleep(Duration::from_millis(10));
        }

        let publisher = source
            .create_publisher("raw_data_pa", "~/raw_data_stream")
            .unwrap();
        publisher.publish(UInt8MultiArray::from_bytes(b"first"));
        publisher.publish(UInt8MultiArray::from_bytes(b"second"));

        let first: UInt8MultiArray = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, UInt8MultiArray::from_bytes(b"first"));
        assert_eq!(second.as_bytes(), b"second");

        drop(server);
        assert_eq!(client.join().unwrap(), 2);
    }

    #[test]
    fn test_client_shutdown() {
        let bus = Bus::<UInt8MultiArray>::new();
        let server = RelayServer::bind("127.0.0.1:0", &bus, "/unused").unwrap();
        let publisher = bus.create_publisher("relay", "/echo").unwrap();
        let client = RelayClient::connect(server.local_addr(), publisher).unwrap();
        assert_eq!(client.peer_addr(), server.local_addr());
        client.shutdown();
        assert_eq!(client.join().unwrap(), 0);
    }
}
