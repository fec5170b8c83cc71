use super::element::{ElementRef, HostError};
use super::mutation::{MutationSubscription, ObserveOptions};
use core::future::Future;
use core::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

pub type HostFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type SharedDocument = Arc<dyn HostDocument>;

/// The live document hosting the single-page application.
pub trait HostDocument: Send + Sync + 'static {
    /// Full navigable location (`location.href`).
    fn location(&self) -> String;

    /// Path component of the current location.
    fn pathname(&self) -> String {
        pathname_of(&self.location())
    }

    fn body(&self) -> ElementRef;

    /// Every connected element carrying the attribute `name`.
    fn query_attribute(&self, name: &str) -> Vec<ElementRef>;

    fn observe(
        &self,
        target: &ElementRef,
        options: ObserveOptions,
    ) -> Result<MutationSubscription, HostError>;

    /// Named document events (SPA navigation lifecycle signals among them).
    fn events(&self) -> broadcast::Receiver<String>;

    /// Hands control back to the host so it can render between batches of work.
    fn yield_to_host(&self) -> HostFuture<'_, ()> {
        Box::pin(tokio::task::yield_now())
    }
}

pub(crate) fn pathname_of(location: &str) -> String {
    match Url::parse(location) {
        Ok(url) => url.path().to_owned(),
        Err(_) => {
            let end = location.find(['?', '#']).unwrap_or(location.len());
            location[..end].to_owned()
        }
    }
}
