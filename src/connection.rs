use crate::poller::Pollable;
use mio::{event::Source, net::TcpStream};
use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    AgentOutbound,
    CollectorInbound,
}

/// Outcome of draining a readable socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// More bytes may follow.
    Open,
    /// The peer shut down its write side.
    Closed,
}

/// Result of probing a non-blocking connect.
#[derive(Debug)]
pub enum ConnectStatus {
    Connected,
    InProgress,
    Refused(io::Error),
}

/// One TCP stream plus the buffers and counters of its exchange.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    role: Role,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    bytes_read: usize,
    bytes_written: usize,
}

impl Connection {
    pub const fn new(stream: TcpStream, peer: SocketAddr, role: Role) -> Self {
        Self {
            stream,
            peer,
            role,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            write_pos: 0,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub fn received(&self) -> &[u8] {
        &self.read_buf
    }

    pub fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.read_buf)
    }

    pub const fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    pub const fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Bytes queued but not yet accepted by the kernel.
    pub fn pending_write(&self) -> usize {
        self.write_buf.len() - self.write_pos
    }

    pub fn queue(&mut self, bytes: &[u8]) {
        if self.write_pos == self.write_buf.len() {
            self.write_buf.clear();
            self.write_pos = 0;
        }
        self.write_buf.extend_from_slice(bytes);
    }

    /// Reads everything currently available.
    ///
    /// # Errors
    /// Any socket error other than `WouldBlock`/`Interrupted`.
    pub fn fill(&mut self) -> io::Result<ReadStatus> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    self.bytes_read += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes queued bytes until done (`true`) or the socket would block (`false`).
    ///
    /// # Errors
    /// Any socket error other than `WouldBlock`/`Interrupted`; a zero-length
    /// write is reported as `WriteZero`.
    pub fn flush(&mut self) -> io::Result<bool> {
        while self.write_pos < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.write_pos += n;
                    self.bytes_written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Tells whether a non-blocking connect has finished.
    pub fn connect_status(&self) -> ConnectStatus {
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => return ConnectStatus::Refused(e),
            Ok(None) => {}
        }
        match self.stream.peer_addr() {
            Ok(_) => ConnectStatus::Connected,
            Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectStatus::InProgress,
            Err(e) => ConnectStatus::Refused(e),
        }
    }

    /// Half-closes the stream once everything has been written.
    ///
    /// # Errors
    /// The OS error, except `NotConnected` which means the peer is already gone.
    pub fn shutdown_write(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Write) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

impl Pollable for Connection {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }
}
