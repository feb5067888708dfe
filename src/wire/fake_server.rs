//! Loopback stand-in for a job server, driven step by step from tests.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, bind, listen, socket,
};

use crate::connection::ServerAddress;
use crate::wire::codec::{CommandType, Decoded, Magic, Packet, WireCodec};

const PEER_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FakeJobServer {
    listener: TcpListener,
}

impl FakeJobServer {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("fake server should bind");
        listener
            .set_nonblocking(true)
            .expect("fake server listener should be nonblocking");
        Self { listener }
    }

    pub fn address(&self) -> ServerAddress {
        let local = self.listener.local_addr().expect("fake server local addr");
        ServerAddress::new("127.0.0.1", local.port())
    }

    pub fn accept(&self) -> FakePeer {
        accept_from(&self.listener)
    }

    /// Answers a single ECHO_REQ on the next accepted connection.
    pub fn spawn_echo_responder(&self) -> JoinHandle<()> {
        let listener = self
            .listener
            .try_clone()
            .expect("fake server listener should clone");
        thread::spawn(move || {
            let mut peer = accept_from(&listener);
            let request = peer.recv();
            assert_eq!(request.command, CommandType::EchoReq);
            peer.send(CommandType::EchoRes, &[request.field(0)]);
        })
    }
}

/// Listener that never accepts and whose backlog is already full, so new
/// SYNs are dropped and connects hang like against an unreachable host.
pub struct StalledListener {
    listener: TcpListener,
    _backlog: Vec<TcpStream>,
}

impl StalledListener {
    pub fn bind() -> Self {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .expect("stalled listener socket");
        let loopback = SockaddrIn::new(127, 0, 0, 1, 0);
        bind(fd.as_raw_fd(), &loopback).expect("stalled listener bind");
        listen(&fd, Backlog::new(1).expect("backlog of one")).expect("stalled listener listen");
        let listener = TcpListener::from(fd);
        let local = listener.local_addr().expect("stalled listener local addr");

        let mut backlog = Vec::new();
        while backlog.len() < 4096 {
            match TcpStream::connect_timeout(&local, Duration::from_millis(100)) {
                Ok(stream) => backlog.push(stream),
                Err(_) => {
                    return Self {
                        listener,
                        _backlog: backlog,
                    };
                }
            }
        }
        panic!("listener backlog never filled up");
    }

    pub fn address(&self) -> ServerAddress {
        let local: SocketAddr = self.listener.local_addr().expect("stalled listener local addr");
        ServerAddress::new("127.0.0.1", local.port())
    }
}

fn accept_from(listener: &TcpListener) -> FakePeer {
    let deadline = Instant::now() + PEER_TIMEOUT;
    loop {
        match listener.accept() {
            Ok((stream, _)) => return FakePeer::new(stream),
            Err(error) if error.kind() == ErrorKind::WouldBlock => {
                assert!(Instant::now() < deadline, "no client connected to fake server");
                thread::sleep(Duration::from_millis(5));
            }
            Err(error) => panic!("fake server accept failed: {error}"),
        }
    }
}

pub struct FakePeer {
    stream: TcpStream,
    codec: WireCodec,
    buffer: Vec<u8>,
}

impl FakePeer {
    fn new(stream: TcpStream) -> Self {
        stream
            .set_nonblocking(false)
            .expect("fake peer should switch to blocking");
        stream
            .set_read_timeout(Some(PEER_TIMEOUT))
            .expect("fake peer read timeout");
        Self {
            stream,
            codec: WireCodec::default(),
            buffer: Vec::new(),
        }
    }

    pub fn send(&mut self, command: CommandType, fields: &[&[u8]]) {
        let frame = self
            .codec
            .encode(Magic::Response, command, fields)
            .expect("fake server frame should encode");
        self.send_raw(&frame);
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream
            .write_all(bytes)
            .expect("fake server write should succeed");
    }

    pub fn recv(&mut self) -> Packet {
        loop {
            match self
                .codec
                .decode(&self.buffer, Magic::Request)
                .expect("worker frames should decode")
            {
                Decoded::Complete { packet, consumed } => {
                    self.buffer.drain(..consumed);
                    return packet;
                }
                Decoded::Incomplete => {}
            }

            let mut chunk = [0_u8; 1024];
            let size = self
                .stream
                .read(&mut chunk)
                .expect("fake server read should not time out");
            assert!(size > 0, "worker closed the connection");
            self.buffer.extend_from_slice(&chunk[..size]);
        }
    }

    /// Collects packets up to and including the first `command`.
    pub fn recv_until(&mut self, command: CommandType) -> Vec<Packet> {
        let mut packets = Vec::new();
        loop {
            let packet = self.recv();
            let done = packet.command == command;
            packets.push(packet);
            if done {
                return packets;
            }
        }
    }

    /// True once the worker side has closed the socket.
    pub fn is_closed_by_worker(&mut self) -> bool {
        self.stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .expect("fake peer read timeout");
        let mut chunk = [0_u8; 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(error) if error.kind() == ErrorKind::ConnectionReset => return true,
                Err(_) => return false,
            }
        }
    }
}
