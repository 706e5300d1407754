//! Request handler shared by every connection task.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::http::{ProxyRequest, ResponseWriter};
use crate::net::Pusher;
use crate::network::Network;
use crate::proxy::dispatcher::{Dispatch, Dispatcher};

/// How intercepted connections are fed back to the server.
#[derive(Debug, Clone)]
pub enum Reinjection {
    /// Enqueue the decrypted stream on the listener.
    Push(Pusher),
    /// Dial this address (the proxy's own listener) and splice.
    Loopback(SocketAddr),
}

/// Network provider, re-injection mode and dispatcher; immutable once built.
pub struct Handler {
    network: Arc<dyn Network>,
    reinjection: Reinjection,
    dispatcher: Dispatcher,
}

impl Handler {
    pub fn new(network: Arc<dyn Network>, reinjection: Reinjection, dispatcher: Dispatcher) -> Self {
        Self {
            network,
            reinjection,
            dispatcher,
        }
    }

    pub fn network(&self) -> &dyn Network {
        self.network.as_ref()
    }

    pub fn reinjection(&self) -> &Reinjection {
        &self.reinjection
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Serve one request.
    pub async fn serve(&self, rw: &mut ResponseWriter, req: ProxyRequest) -> Dispatch {
        self.dispatcher.dispatch(self, rw, req).await
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("reinjection", &self.reinjection)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
