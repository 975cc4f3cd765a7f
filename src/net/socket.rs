//! Non-blocking TCP transport backend.
//!
//! Implements the transport contract over `std::net` sockets with a
//! single `polling::Poller` for readiness. Accepted sockets are switched
//! to non-blocking immediately (close-on-exec comes with every socket
//! the standard library creates). The one deliberate exception to the
//! non-blocking rule is outbound `connect`: a short-lived, one-shot
//! blocking call, after which the socket joins the non-blocking set.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use polling::{Event, Events, Poller};

use crate::transport::{
    Endpoint, Handle, Interest, Readiness, Recv, Result, Transport, TransportError,
};

enum Source {
    Stream(TcpStream),
    Listener(TcpListener),
}

/// TCP socket backend.
pub struct SocketTransport {
    poller: Poller,
    sources: HashMap<u64, Source>,
    next_key: u64,
}

impl SocketTransport {
    /// Creates the backend with its poller.
    pub fn new() -> Result<Self> {
        Ok(SocketTransport {
            poller: Poller::new()?,
            sources: HashMap::new(),
            next_key: 0,
        })
    }

    fn resolve(endpoint: &Endpoint) -> Result<SocketAddr> {
        let mut addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(format!("{}: {}", endpoint, e)))?;
        addrs
            .next()
            .ok_or_else(|| TransportError::Resolve(format!("{}: no address found", endpoint)))
    }

    fn register_stream(&mut self, stream: TcpStream) -> Result<Handle> {
        stream.set_nonblocking(true)?;
        self.next_key += 1;
        let key = self.next_key;
        unsafe {
            self.poller.add(&stream, Event::none(key as usize))?;
        }
        self.sources.insert(key, Source::Stream(stream));
        Ok(Handle(key))
    }

    fn arm(&self, key: u64, source: &Source, readable: bool, writable: bool) -> std::io::Result<()> {
        let k = key as usize;
        let event = match (readable, writable) {
            (true, true) => Event::all(k),
            (true, false) => Event::readable(k),
            (false, true) => Event::writable(k),
            (false, false) => Event::none(k),
        };
        match source {
            Source::Stream(s) => self.poller.modify(s, event),
            Source::Listener(l) => self.poller.modify(l, event),
        }
    }
}

impl Transport for SocketTransport {
    fn connect(&mut self, endpoint: &Endpoint) -> Result<Handle> {
        let addr = Self::resolve(endpoint)?;
        let stream = TcpStream::connect(addr)?;
        self.register_stream(stream)
    }

    fn listen(&mut self, endpoint: &Endpoint) -> Result<Handle> {
        let addr = Self::resolve(endpoint)?;
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        self.next_key += 1;
        let key = self.next_key;
        unsafe {
            self.poller.add(&listener, Event::none(key as usize))?;
        }
        self.sources.insert(key, Source::Listener(listener));
        Ok(Handle(key))
    }

    fn accept(&mut self, listener: Handle) -> Result<Option<(Handle, Endpoint)>> {
        let accepted = match self.sources.get(&listener.0) {
            Some(Source::Listener(l)) => match l.accept() {
                Ok((stream, peer)) => Some((stream, peer)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => None,
                Err(e) => return Err(e.into()),
            },
            Some(Source::Stream(_)) => {
                return Err(TransportError::Unsupported("accept on a stream handle"))
            }
            None => return Err(TransportError::BadHandle(listener)),
        };
        match accepted {
            Some((stream, peer)) => {
                let handle = self.register_stream(stream)?;
                log::debug!("accepted {} from {}", handle, peer);
                Ok(Some((
                    handle,
                    Endpoint::new(&peer.ip().to_string(), peer.port()),
                )))
            }
            None => Ok(None),
        }
    }

    fn send(&mut self, handle: Handle, buf: &[u8]) -> Result<usize> {
        let stream = match self.sources.get_mut(&handle.0) {
            Some(Source::Stream(s)) => s,
            Some(Source::Listener(_)) => {
                return Err(TransportError::Unsupported("send on a listener handle"))
            }
            None => return Err(TransportError::BadHandle(handle)),
        };
        match stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn recv(&mut self, handle: Handle, buf: &mut [u8]) -> Result<Recv> {
        let stream = match self.sources.get_mut(&handle.0) {
            Some(Source::Stream(s)) => s,
            Some(Source::Listener(_)) => {
                return Err(TransportError::Unsupported("recv on a listener handle"))
            }
            None => return Err(TransportError::BadHandle(handle)),
        };
        match stream.read(buf) {
            Ok(0) => Ok(Recv::Closed),
            Ok(n) => Ok(Recv::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(Recv::WouldBlock)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn poll(&mut self, interest: &[Interest], timeout: Duration) -> Result<Vec<Readiness>> {
        // Quiesce everything, then arm exactly what this tick asks for;
        // stale one-shot arms from earlier ticks must not wake us.
        for (key, source) in &self.sources {
            self.arm(*key, source, false, false)?;
        }
        for want in interest {
            if let Some(source) = self.sources.get(&want.handle.0) {
                self.arm(want.handle.0, source, want.readable, want.writable)?;
            }
        }

        let mut events = Events::new();
        self.poller.wait(&mut events, Some(timeout))?;

        let mut ready = Vec::new();
        for event in events.iter() {
            ready.push(Readiness {
                handle: Handle(event.key as u64),
                readable: event.readable,
                writable: event.writable,
            });
        }
        Ok(ready)
    }

    fn close(&mut self, handle: Handle) {
        if let Some(source) = self.sources.remove(&handle.0) {
            let result = match &source {
                Source::Stream(s) => self.poller.delete(s),
                Source::Listener(l) => self.poller.delete(l),
            };
            if let Err(e) = result {
                log::debug!("poller delete for {}: {}", handle, e);
            }
        }
    }
}
