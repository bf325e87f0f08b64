//! One outbound HTTP connection.

use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::{Request, Response};
use tokio::task::JoinHandle;

use crate::http::response::ProxyBody;

/// A client-side HTTP/1.1 connection to an origin or to the chain proxy.
///
/// At most one exists per inbound connection. Dropping the leg aborts its
/// connection driver, so it never outlives the inbound connection owning it.
pub struct OutboundLeg {
    target: String,
    chained: bool,
    tls: bool,
    sender: SendRequest<ProxyBody>,
    driver: JoinHandle<()>,
}

impl OutboundLeg {
    pub(crate) fn new(
        target: String,
        chained: bool,
        tls: bool,
        sender: SendRequest<ProxyBody>,
        driver: JoinHandle<()>,
    ) -> Self {
        Self {
            target,
            chained,
            tls,
            sender,
            driver,
        }
    }

    /// Destination key this leg talks to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the TCP connection terminates at the chain proxy.
    pub fn is_chained(&self) -> bool {
        self.chained
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Requests on this leg must carry absolute-form targets.
    pub fn uses_absolute_form(&self) -> bool {
        self.chained && !self.tls
    }

    /// Whether this leg can carry another request for `target`.
    pub fn reusable_for(&self, target: &str, tls: bool) -> bool {
        self.target == target && self.tls == tls && !self.sender.is_closed()
    }

    /// Wait until the connection can take a request.
    pub async fn ready(&mut self) -> Result<(), hyper::Error> {
        self.sender.ready().await
    }

    pub async fn send(&mut self, request: Request<ProxyBody>) -> Result<Response<Incoming>, hyper::Error> {
        self.sender.send_request(request).await
    }
}

impl Drop for OutboundLeg {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl std::fmt::Debug for OutboundLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundLeg")
            .field("target", &self.target)
            .field("chained", &self.chained)
            .field("tls", &self.tls)
            .finish()
    }
}
