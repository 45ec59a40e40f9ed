use std::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::flow::error::{ErrorReporter, FlowError};
use crate::flow::interface::{StreamPassInterface, StreamRecvInterface};
use crate::reactor::{FdEvents, Reactor};
use crate::util::with_upgraded;

/// Connects a nonblocking byte stream (typically a TCP or Unix socket) to the flow framework:
///  reads are served through an SR source, writes are accepted through an SP sink.
///
/// I/O is attempted as soon as an operation arrives, and the fd is only watched while an
///  operation is waiting for readiness. End of stream is reported as
///  [`FlowError::StreamClosed`], any other I/O failure as [`FlowError::Transport`]. After an
///  error the socket performs no further I/O.
pub struct StreamSocket<S: Read + Write + AsRawFd + 'static> {
    reactor: Reactor,
    fd: RawFd,
    _inner: Rc<RefCell<StreamSocketInner<S>>>,
    source: StreamRecvInterface,
    sink: StreamPassInterface,
}

struct StreamSocketInner<S> {
    reactor: Reactor,
    stream: S,
    fd: RawFd,
    source: Option<StreamRecvInterface>,
    sink: Option<StreamPassInterface>,
    recv_request: Option<(BytesMut, usize)>,
    send_request: Option<Bytes>,
    failed: bool,
}

impl<S: Read + Write + AsRawFd> StreamSocketInner<S> {
    fn try_recv(&mut self) -> Option<FlowError> {
        if self.failed {
            return None;
        }
        let (mut buf, max) = self.recv_request.take()?;

        let start = buf.len();
        buf.resize(start + max, 0);
        loop {
            match self.stream.read(&mut buf[start..]) {
                Ok(0) => {
                    debug!("fd {}: end of stream", self.fd);
                    return Some(self.fail(FlowError::StreamClosed));
                }
                Ok(n) => {
                    trace!("fd {}: read {} bytes", self.fd, n);
                    buf.truncate(start + n);
                    if let Some(source) = &self.source {
                        source.done(buf);
                    }
                    return None;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    buf.truncate(start);
                    self.recv_request = Some((buf, max));
                    return None;
                }
                Err(e) => {
                    debug!("fd {}: read failed: {}", self.fd, e);
                    return Some(self.fail(e.into()));
                }
            }
        }
    }

    fn try_send(&mut self) -> Option<FlowError> {
        if self.failed {
            return None;
        }
        let data = self.send_request.take()?;

        loop {
            match self.stream.write(&data) {
                Ok(0) => {
                    debug!("fd {}: stream accepts no more data", self.fd);
                    return Some(self.fail(FlowError::StreamClosed));
                }
                Ok(n) => {
                    trace!("fd {}: wrote {} bytes", self.fd, n);
                    if let Some(sink) = &self.sink {
                        sink.done(n);
                    }
                    return None;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.send_request = Some(data);
                    return None;
                }
                Err(e) => {
                    debug!("fd {}: write failed: {}", self.fd, e);
                    return Some(self.fail(e.into()));
                }
            }
        }
    }

    fn fail(&mut self, error: FlowError) -> FlowError {
        self.failed = true;
        self.recv_request = None;
        self.send_request = None;
        error
    }

    fn update_interest(&self) {
        let mut interest = FdEvents::empty();
        if self.recv_request.is_some() {
            interest |= FdEvents::READ;
        }
        if self.send_request.is_some() {
            interest |= FdEvents::WRITE;
        }
        if let Err(e) = self.reactor.update_fd(self.fd, interest) {
            warn!("fd {}: {}", self.fd, e);
        }
    }

    fn on_events(&mut self, events: FdEvents) -> Option<FlowError> {
        let failure = events.intersects(FdEvents::ERROR | FdEvents::HUP);
        let mut error = None;
        if events.contains(FdEvents::READ) || failure {
            error = self.try_recv();
        }
        if error.is_none() && (events.contains(FdEvents::WRITE) || failure) {
            error = self.try_send();
        }
        self.update_interest();
        error
    }
}

impl<S: Read + Write + AsRawFd + 'static> StreamSocket<S> {
    /// `stream` must already be in nonblocking mode.
    pub fn new(reactor: &Reactor, stream: S, reporter: Rc<dyn ErrorReporter>) -> anyhow::Result<StreamSocket<S>> {
        let fd = stream.as_raw_fd();
        let inner = Rc::new(RefCell::new(StreamSocketInner {
            reactor: reactor.clone(),
            stream,
            fd,
            source: None,
            sink: None,
            recv_request: None,
            send_request: None,
            failed: false,
        }));

        let weak = Rc::downgrade(&inner);
        let fd_reporter = reporter.clone();
        reactor.add_fd(fd, FdEvents::empty(), move |events| {
            if let Some(error) = with_upgraded(&weak, |this| this.on_events(events)).flatten() {
                fd_reporter.report(error);
            }
        })?;

        let weak = Rc::downgrade(&inner);
        let recv_reporter = reporter.clone();
        let source = StreamRecvInterface::new(reactor, move |buf, max| {
            let error = with_upgraded(&weak, |this| {
                this.recv_request = Some((buf, max));
                let error = this.try_recv();
                this.update_interest();
                error
            });
            if let Some(error) = error.flatten() {
                recv_reporter.report(error);
            }
        });

        let weak = Rc::downgrade(&inner);
        let sink = StreamPassInterface::new(reactor, move |data| {
            let error = with_upgraded(&weak, |this| {
                this.send_request = Some(data);
                let error = this.try_send();
                this.update_interest();
                error
            });
            if let Some(error) = error.flatten() {
                reporter.report(error);
            }
        });

        {
            let mut inner = inner.borrow_mut();
            inner.source = Some(source.clone());
            inner.sink = Some(sink.clone());
        }

        debug!("stream socket on fd {}", fd);
        Ok(StreamSocket {
            reactor: reactor.clone(),
            fd,
            _inner: inner,
            source,
            sink,
        })
    }

    /// Bytes read from the stream
    pub fn source(&self) -> &StreamRecvInterface {
        &self.source
    }

    /// Bytes to write to the stream
    pub fn sink(&self) -> &StreamPassInterface {
        &self.sink
    }
}

impl<S: Read + Write + AsRawFd + 'static> Drop for StreamSocket<S> {
    fn drop(&mut self) {
        self.reactor.remove_fd(self.fd);
    }
}
