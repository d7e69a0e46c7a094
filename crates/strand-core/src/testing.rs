//! Test doubles shared by the unit tests in this crate.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use strand_net::{PointerRouting, RoutingError};
use strand_shared::pointer::{Pointer, PointerKey};

/// A DHT that never finishes anything: lookups stay open forever and
/// publishes never return.
#[derive(Default)]
pub(crate) struct StalledRouting {
    open: Mutex<Vec<mpsc::Sender<Pointer>>>,
}

#[async_trait]
impl PointerRouting for StalledRouting {
    async fn publish(&self, _pointer: &Pointer) -> Result<(), RoutingError> {
        std::future::pending().await
    }

    async fn find_pointers(&self, _key: &PointerKey) -> Result<mpsc::Receiver<Pointer>, RoutingError> {
        let (tx, rx) = mpsc::channel(1);
        self.open.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        Ok(rx)
    }
}
