//! Message handler trait.

use crate::messaging::context::MessageContext;
use crate::messaging::envelope::Message;
use async_trait::async_trait;
use std::future::Future;

/// Error returned by a handler; any error type works
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Processes decoded messages of type `M`.
///
/// Returning an error (or panicking) counts as a processing failure toward
/// the poison threshold. Closures `Fn(M, MessageContext) -> Future` implement
/// this trait directly.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync {
    async fn handle(&self, message: M, ctx: MessageContext) -> HandlerResult;
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for F
where
    M: Message,
    F: Fn(M, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: M, ctx: MessageContext) -> HandlerResult {
        (self)(message, ctx).await
    }
}
