//! Socket-level handlers: disconnect, socket listing and system messages.

use super::core::{Args, Context, Handler, done, reply};
use crate::error::HandlerResult;
use async_trait::async_trait;

/// `disconnect(reason?)`: drop the calling socket.
pub struct DisconnectHandler;

#[async_trait]
impl Handler for DisconnectHandler {
    fn arity(&self) -> usize {
        1
    }

    fn optional_args(&self) -> usize {
        1
    }

    fn requires_socket(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let reason = args.opt_string(0, "reason")?;
        tracing::info!(
            user = %ctx.session.name(),
            socket = ctx.options.socket.as_deref(),
            reason = reason.as_deref(),
            "Client disconnect"
        );
        ctx.session.disconnect(reason, ctx.options).await?;
        done()
    }
}

/// `listOwnSockets()`: the user's sockets and the rooms each is joined to.
pub struct ListOwnSocketsHandler;

#[async_trait]
impl Handler for ListOwnSocketsHandler {
    fn arity(&self) -> usize {
        0
    }

    async fn handle(&self, ctx: &Context<'_>, _args: &Args) -> HandlerResult {
        reply(ctx.session.list_own_sockets().await?)
    }
}

/// `systemMessage(data)`: relay arbitrary data to the user's other sockets.
pub struct SystemMessageHandler;

#[async_trait]
impl Handler for SystemMessageHandler {
    fn arity(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        ctx.session.system_message(args.value(0), ctx.options).await?;
        done()
    }
}
