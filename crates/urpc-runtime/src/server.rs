//! Server surface
//!
//! ```ignore
//! let mut server = Server::new(ServerOptions::default());
//! server.add_service(Rc::new(echo_service), ServiceOwnership::ServerOwned)?;
//! let addr = server.start(&mut ev, "0.0.0.0:8000")?;
//! ev.run_forever()?;
//! server.stop(&mut ev);
//! ```
//!
//! Services are added before `start`; once connections hold the registry
//! it is read-only.

use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::rc::Rc;

use urpc_core::{Error, HandleId, Result, RpcError};

use crate::config::ServerOptions;
use crate::event_loop::EventLoop;
use crate::service::{Service, ServiceOwnership, ServiceRegistry};
use crate::socket;

pub struct Server {
    options: ServerOptions,
    services: Rc<ServiceRegistry>,
    acceptor: Option<HandleId>,
    local_addr: Option<SocketAddr>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            services: Rc::new(ServiceRegistry::new()),
            acceptor: None,
            local_addr: None,
        }
    }

    pub fn add_service(&mut self, service: Rc<dyn Service>, ownership: ServiceOwnership) -> Result<()> {
        let name = service.name().to_owned();
        let registry = Rc::get_mut(&mut self.services).ok_or(Error::AlreadyStarted)?;
        registry.add_service(service, ownership)?;
        tracing::debug!(service = %name, ?ownership, "service added");
        Ok(())
    }

    #[inline]
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Bound address once started; resolves port 0.
    #[inline]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Listen on `addr` (`host:port`) and accept on `ev`.
    pub fn start(&mut self, ev: &mut EventLoop, addr: &str) -> Result<SocketAddr> {
        if self.acceptor.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let addr = socket::resolve(addr)?;
        let listener = socket::tcp_listener(&addr, self.options.backlog, self.options.reuse_port)?;
        let local = socket::local_addr(listener.as_fd()).map_err(|e| Error::os("getsockname", e))?;
        let id = ev.add_acceptor(listener, local, Rc::clone(&self.services), self.options.tcp_nodelay)?;
        self.acceptor = Some(id);
        self.local_addr = Some(local);
        tracing::info!(%local, services = self.services.len(), "server started");
        Ok(local)
    }

    /// Close the listener and every connection it accepted, then release
    /// server-owned services. Replies still queued are dropped.
    pub fn stop(&mut self, ev: &mut EventLoop) {
        let Some(acceptor) = self.acceptor.take() else {
            return;
        };
        let err = RpcError::shutdown();
        ev.close_handle(acceptor, &err);
        let conns = ev.passive_ids_for(&self.services);
        for id in &conns {
            ev.close_handle(*id, &err);
        }
        match Rc::get_mut(&mut self.services) {
            Some(registry) => registry.release_owned(),
            None => tracing::warn!("services still referenced after stop; not released"),
        }
        tracing::info!(local = ?self.local_addr, connections = conns.len(), "server stopped");
        self.local_addr = None;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.options)
            .field("services", &self.services.len())
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Done, ServiceBuilder};
    use std::io::Read;
    use std::net::TcpStream;
    use std::time::Duration;
    use urpc_core::Controller;

    fn echo_service(name: &str) -> Rc<dyn Service> {
        Rc::new(
            ServiceBuilder::new(name)
                .method("Echo", |_cntl: &Controller, req: String, done: Done<String>| {
                    done.finish(req)
                })
                .build(),
        )
    }

    #[test]
    fn test_services_frozen_after_start() {
        let mut ev = EventLoop::new().unwrap();
        let mut server = Server::new(ServerOptions::new());
        server
            .add_service(echo_service("a.Svc"), ServiceOwnership::ServerOwned)
            .unwrap();
        assert!(matches!(
            server.add_service(echo_service("a.Svc"), ServiceOwnership::ServerOwned),
            Err(Error::DuplicateService(_))
        ));

        let local = server.start(&mut ev, "127.0.0.1:0").unwrap();
        assert_ne!(local.port(), 0);
        assert!(matches!(
            server.add_service(echo_service("b.Svc"), ServiceOwnership::ServerOwned),
            Err(Error::AlreadyStarted)
        ));
        assert!(matches!(server.start(&mut ev, "127.0.0.1:0"), Err(Error::AlreadyStarted)));
        server.stop(&mut ev);
    }

    #[test]
    fn test_stop_closes_connections_and_releases_owned() {
        let mut ev = EventLoop::new().unwrap();
        let mut server = Server::new(ServerOptions::new());
        server
            .add_service(echo_service("owned.Svc"), ServiceOwnership::ServerOwned)
            .unwrap();
        server
            .add_service(echo_service("kept.Svc"), ServiceOwnership::CallerOwned)
            .unwrap();
        let local = server.start(&mut ev, "127.0.0.1:0").unwrap();

        let mut client = TcpStream::connect(local).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        for _ in 0..100 {
            if ev.len() == 2 {
                break;
            }
            ev.run_once(Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(ev.len(), 2);

        server.stop(&mut ev);
        assert!(!server.is_running());
        assert!(ev.is_empty());
        assert!(server.services().find_service("owned.Svc").is_none());
        assert!(server.services().find_service("kept.Svc").is_some());

        // The server side closed: the client reads EOF.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
