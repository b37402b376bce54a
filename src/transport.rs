//! Datagram transport for callers who do not run their own I/O loop.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

use crate::Error;

/// Something that moves datagrams.
pub trait Transport {
    fn send_datagram(&mut self, addr: SocketAddr, data: &[u8]) -> Result<(), Error>;

    /// Receive one datagram into `buf`. `Ok(None)` if nothing is waiting on
    /// a non-blocking transport.
    fn recv_datagram(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, Error>;
}

impl Transport for UdpSocket {
    fn send_datagram(&mut self, addr: SocketAddr, data: &[u8]) -> Result<(), Error> {
        match self.send_to(data, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("Socket full, dropping {} bytes to {}", data.len(), addr);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, Error> {
        match self.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, from))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
