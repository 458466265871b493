//! Direct messaging handlers.

use super::core::{Args, Context, Handler, done, reply};
use crate::error::HandlerResult;
use async_trait::async_trait;

/// `directMessage(toUser, msg)`: returns the stamped message.
pub struct DirectMessageHandler;

#[async_trait]
impl Handler for DirectMessageHandler {
    fn arity(&self) -> usize {
        2
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let recipient = args.string(0, "toUser")?;
        let msg = args.message(1, "msg")?;
        reply(
            ctx.session
                .direct_message(&recipient, msg, ctx.options)
                .await?,
        )
    }
}

/// `directAddToList(listName, values)`
pub struct DirectAddToListHandler;

#[async_trait]
impl Handler for DirectAddToListHandler {
    fn arity(&self) -> usize {
        2
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let list = args.string(0, "listName")?;
        let values = args.strings(1, "values")?;
        ctx.session.direct_add_to_list(&list, values).await?;
        done()
    }
}

/// `directRemoveFromList(listName, values)`
pub struct DirectRemoveFromListHandler;

#[async_trait]
impl Handler for DirectRemoveFromListHandler {
    fn arity(&self) -> usize {
        2
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let list = args.string(0, "listName")?;
        let values = args.strings(1, "values")?;
        ctx.session.direct_remove_from_list(&list, values).await?;
        done()
    }
}

/// `directGetAccessList(listName)`
pub struct DirectGetAccessListHandler;

#[async_trait]
impl Handler for DirectGetAccessListHandler {
    fn arity(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let list = args.string(0, "listName")?;
        reply(ctx.session.direct_get_access_list(&list).await?)
    }
}

/// `directGetWhitelistMode()`
pub struct DirectGetWhitelistModeHandler;

#[async_trait]
impl Handler for DirectGetWhitelistModeHandler {
    fn arity(&self) -> usize {
        0
    }

    async fn handle(&self, ctx: &Context<'_>, _args: &Args) -> HandlerResult {
        reply(ctx.session.direct_get_whitelist_mode().await?)
    }
}

/// `directSetWhitelistMode(mode)`
pub struct DirectSetWhitelistModeHandler;

#[async_trait]
impl Handler for DirectSetWhitelistModeHandler {
    fn arity(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let mode = args.bool(0, "mode")?;
        ctx.session.direct_set_whitelist_mode(mode).await?;
        done()
    }
}
