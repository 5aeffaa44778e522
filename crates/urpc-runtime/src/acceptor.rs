//! Listening socket
//!
//! The acceptor drains the listen queue on every readable event (the
//! poller is edge-triggered, so one event may stand for many
//! connections). Accepted sockets are parked in the loop core; the event
//! loop adopts them as server transports once the dispatch pass is done
//! touching the handle table.

use std::net::SocketAddr;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;

use nix::errno::Errno;
use urpc_core::{Error, HandleId, RpcError};

use crate::event_loop::LoopCore;
use crate::handle::{HandleError, HandleResult, IoHandle};
use crate::poller::IoSource;
use crate::service::ServiceRegistry;
use crate::socket;

/// A connection accepted but not yet installed as a transport
pub struct Accepted {
    pub fd: OwnedFd,
    pub peer: Option<SocketAddr>,
    pub services: Rc<ServiceRegistry>,
}

pub struct Acceptor {
    source: IoSource,
    local: SocketAddr,
    services: Rc<ServiceRegistry>,
    nodelay: bool,
    accepted: u64,
}

impl Acceptor {
    pub fn new(
        id: HandleId,
        listener: OwnedFd,
        local: SocketAddr,
        services: Rc<ServiceRegistry>,
        nodelay: bool,
    ) -> Self {
        Self {
            source: IoSource::new(id, Some(listener)),
            local,
            services,
            nodelay,
            accepted: 0,
        }
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    #[inline]
    pub fn services(&self) -> &Rc<ServiceRegistry> {
        &self.services
    }

    /// Connections accepted so far.
    #[inline]
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn start(&mut self, core: &mut LoopCore) -> Result<(), Error> {
        core.poller
            .register_read(&mut self.source)
            .map_err(|e| Error::os("epoll_ctl", e))
    }
}

impl IoHandle for Acceptor {
    fn source(&self) -> &IoSource {
        &self.source
    }

    fn on_readable(&mut self, core: &mut LoopCore) -> HandleResult {
        loop {
            let Some(listener) = self.source.fd() else {
                return Ok(());
            };
            match socket::accept(listener) {
                Ok((fd, peer)) => {
                    if self.nodelay {
                        if let Err(e) = socket::set_nodelay(fd.as_fd(), true) {
                            tracing::debug!(?peer, error = %e, "TCP_NODELAY not set");
                        }
                    }
                    tracing::debug!(local = %self.local, ?peer, "accepted");
                    self.accepted += 1;
                    core.accepted.push(Accepted {
                        fd,
                        peer,
                        services: Rc::clone(&self.services),
                    });
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(()),
                // The peer gave up while queued; the listener is fine.
                Err(Errno::ECONNABORTED) => continue,
                Err(e @ (Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM)) => {
                    // Leave the rest queued; the next edge retries.
                    tracing::warn!(local = %self.local, error = %e, "accept deferred");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(local = %self.local, error = %e, "accept failed");
                    return Err(HandleError::Fatal(Error::Acceptor(e)));
                }
            }
        }
    }

    fn on_writable(&mut self, _core: &mut LoopCore) -> HandleResult {
        Ok(())
    }

    fn reset(&mut self, err: &RpcError, core: &mut LoopCore) {
        if self.source.close(&core.poller) {
            tracing::info!(local = %self.local, reason = %err, "acceptor closed");
        }
    }
}
