//! Messaging trait and dynamic dispatch companion.

use crate::error::Result;
use crate::extensions::commands::CommandSurface;
use crate::{InboundEvent, OutboundResponse, ReplyTarget, StatusUpdate};

use futures::Stream;
use std::pin::Pin;

/// Inbound event stream type.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Static trait for chat platform adapters.
/// Use this for type-safe implementations.
pub trait Messaging: Send + Sync + 'static {
    /// Unique name for this adapter.
    fn name(&self) -> &str;

    /// Start the adapter and return the inbound event stream.
    fn start(&self) -> impl std::future::Future<Output = Result<InboundStream>> + Send;

    /// Deliver one response: a message, a file, or a reaction change.
    fn respond(
        &self,
        target: &ReplyTarget,
        response: OutboundResponse,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Send a typing indicator or clear it.
    fn send_status(
        &self,
        _target: &ReplyTarget,
        _status: StatusUpdate,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Register the merged command surface with the platform.
    fn register_commands(
        &self,
        _surface: &CommandSurface,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Graceful shutdown.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn MessagingDyn>` for storing different adapters.
pub trait MessagingDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn start<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>>;

    fn respond<'a>(
        &'a self,
        target: &'a ReplyTarget,
        response: OutboundResponse,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn send_status<'a>(
        &'a self,
        target: &'a ReplyTarget,
        status: StatusUpdate,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn register_commands<'a>(
        &'a self,
        surface: &'a CommandSurface,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn shutdown<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

/// Blanket implementation: any type implementing Messaging automatically implements MessagingDyn.
impl<T: Messaging> MessagingDyn for T {
    fn name(&self) -> &str {
        Messaging::name(self)
    }

    fn start<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>> {
        Box::pin(Messaging::start(self))
    }

    fn respond<'a>(
        &'a self,
        target: &'a ReplyTarget,
        response: OutboundResponse,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::respond(self, target, response))
    }

    fn send_status<'a>(
        &'a self,
        target: &'a ReplyTarget,
        status: StatusUpdate,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::send_status(self, target, status))
    }

    fn register_commands<'a>(
        &'a self,
        surface: &'a CommandSurface,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::register_commands(self, surface))
    }

    fn shutdown<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::shutdown(self))
    }
}
