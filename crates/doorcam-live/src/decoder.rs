//! Local stream decoder abstraction and the single-decoder slot.
//!
//! A decoder goes through `create → initialize → play → dispose`.  Every
//! decoder is wrapped in a [`DecoderLease`] that also holds the one permit of
//! the [`DecoderSlot`]; the permit is only returned by [`DecoderLease::dispose`],
//! so a new decoder cannot be created while the previous one is still alive.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::DecoderError;

/// One playable media source bound to a URL.
pub trait StreamDecoder: Send + 'static {
    /// Handshake and buffering before playback.  May never complete on a dead
    /// stream; callers bound it.
    fn initialize(&mut self) -> impl Future<Output = Result<(), DecoderError>> + Send;

    fn play(&mut self) -> impl Future<Output = Result<(), DecoderError>> + Send;

    fn set_looping(&mut self, looping: bool)
        -> impl Future<Output = Result<(), DecoderError>> + Send;

    /// Release everything.  Must be safe whether or not `initialize` ran or
    /// succeeded.
    fn dispose(self) -> impl Future<Output = ()> + Send;
}

/// Allocates decoders.  `create` does no I/O.
pub trait DecoderFactory: Send + Sync + 'static {
    type Decoder: StreamDecoder;

    fn create(&self, url: &str) -> Self::Decoder;
}

/// Process-wide allowance of one live decoder.
#[derive(Clone)]
pub struct DecoderSlot {
    permits: Arc<Semaphore>,
}

impl Default for DecoderSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderSlot {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for the slot, then create a decoder for `url` inside it.
    pub async fn lease<F: DecoderFactory>(
        &self,
        factory: &F,
        url: &str,
    ) -> Result<DecoderLease<F::Decoder>, DecoderError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DecoderError::Spawn("decoder slot closed".to_string()))?;
        debug!("decoder: creating for {}", url);
        Ok(DecoderLease {
            decoder: Some(factory.create(url)),
            permit: Some(permit),
        })
    }
}

/// Exclusive ownership of a created decoder plus the slot permit.
pub struct DecoderLease<D: StreamDecoder> {
    decoder: Option<D>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<D: StreamDecoder> DecoderLease<D> {
    fn live(&mut self) -> Result<&mut D, DecoderError> {
        self.decoder
            .as_mut()
            .ok_or_else(|| DecoderError::Ipc("decoder already disposed".to_string()))
    }

    pub async fn initialize(&mut self) -> Result<(), DecoderError> {
        self.live()?.initialize().await
    }

    pub async fn play(&mut self) -> Result<(), DecoderError> {
        self.live()?.play().await
    }

    pub async fn set_looping(&mut self, looping: bool) -> Result<(), DecoderError> {
        self.live()?.set_looping(looping).await
    }

    /// Dispose the decoder, then give the slot back.
    pub async fn dispose(mut self) {
        if let Some(decoder) = self.decoder.take() {
            decoder.dispose().await;
            debug!("decoder: disposed");
        }
        drop(self.permit.take());
    }
}

impl<D: StreamDecoder> Drop for DecoderLease<D> {
    fn drop(&mut self) {
        if self.decoder.is_some() {
            warn!("decoder: lease dropped without dispose");
        }
    }
}
