//! Room handlers: membership, messages, management, access lists, history.

use super::core::{Args, Context, Handler, done, reply};
use crate::error::HandlerResult;
use async_trait::async_trait;
use serde_json::json;

/// `roomJoin(roomName)`: returns the user's joined socket count.
pub struct RoomJoinHandler;

#[async_trait]
impl Handler for RoomJoinHandler {
    fn arity(&self) -> usize {
        1
    }

    fn requires_socket(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        reply(ctx.session.room_join(&room, ctx.options).await?)
    }
}

/// `roomLeave(roomName)`: returns the user's joined socket count.
pub struct RoomLeaveHandler;

#[async_trait]
impl Handler for RoomLeaveHandler {
    fn arity(&self) -> usize {
        1
    }

    fn requires_socket(&self) -> bool {
        true
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        reply(ctx.session.room_leave(&room, ctx.options).await?)
    }
}

/// `roomMessage(roomName, msg)`: returns the message id.
pub struct RoomMessageHandler;

#[async_trait]
impl Handler for RoomMessageHandler {
    fn arity(&self) -> usize {
        2
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        let msg = args.message(1, "msg")?;
        reply(ctx.session.room_message(&room, msg, ctx.options).await?)
    }
}

/// `roomCreate(roomName, whitelistOnly)`
pub struct RoomCreateHandler;

#[async_trait]
impl Handler for RoomCreateHandler {
    fn arity(&self) -> usize {
        2
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        let whitelist_only = args.bool(1, "whitelistOnly")?;
        ctx.session
            .room_create(&room, whitelist_only, ctx.options)
            .await?;
        done()
    }
}

/// `roomDelete(roomName)`
pub struct RoomDeleteHandler;

#[async_trait]
impl Handler for RoomDeleteHandler {
    fn arity(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        ctx.session.room_delete(&room, ctx.options).await?;
        done()
    }
}

/// `roomAddToList(roomName, listName, values)`
pub struct RoomAddToListHandler;

#[async_trait]
impl Handler for RoomAddToListHandler {
    fn arity(&self) -> usize {
        3
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        let list = args.string(1, "listName")?;
        let values = args.strings(2, "values")?;
        ctx.session
            .room_add_to_list(&room, &list, values, ctx.options)
            .await?;
        done()
    }
}

/// `roomRemoveFromList(roomName, listName, values)`
pub struct RoomRemoveFromListHandler;

#[async_trait]
impl Handler for RoomRemoveFromListHandler {
    fn arity(&self) -> usize {
        3
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        let list = args.string(1, "listName")?;
        let values = args.strings(2, "values")?;
        ctx.session
            .room_remove_from_list(&room, &list, values, ctx.options)
            .await?;
        done()
    }
}

/// `roomSetWhitelistMode(roomName, mode)`: resolves `[evictedUsers, mode]`.
pub struct RoomSetWhitelistModeHandler;

#[async_trait]
impl Handler for RoomSetWhitelistModeHandler {
    fn arity(&self) -> usize {
        2
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        let mode = args.bool(1, "mode")?;
        let (evicted, mode) = ctx
            .session
            .room_set_whitelist_mode(&room, mode, ctx.options)
            .await?;
        Ok(vec![json!(evicted), json!(mode)])
    }
}

/// `roomGetAccessList(roomName, listName)`
pub struct RoomGetAccessListHandler;

#[async_trait]
impl Handler for RoomGetAccessListHandler {
    fn arity(&self) -> usize {
        2
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        let list = args.string(1, "listName")?;
        reply(
            ctx.session
                .room_get_access_list(&room, &list, ctx.options)
                .await?,
        )
    }
}

/// `roomGetOwner(roomName)`
pub struct RoomGetOwnerHandler;

#[async_trait]
impl Handler for RoomGetOwnerHandler {
    fn arity(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        reply(ctx.session.room_get_owner(&room, ctx.options).await?)
    }
}

/// `roomGetWhitelistMode(roomName)`
pub struct RoomGetWhitelistModeHandler;

#[async_trait]
impl Handler for RoomGetWhitelistModeHandler {
    fn arity(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        reply(ctx.session.room_get_whitelist_mode(&room, ctx.options).await?)
    }
}

/// `roomRecentHistory(roomName)`: newest messages first.
pub struct RoomRecentHistoryHandler;

#[async_trait]
impl Handler for RoomRecentHistoryHandler {
    fn arity(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        reply(ctx.session.room_recent_history(&room, ctx.options).await?)
    }
}

/// `roomHistoryGet(roomName, id, limit)`: messages after `id`, oldest first.
pub struct RoomHistoryGetHandler;

#[async_trait]
impl Handler for RoomHistoryGetHandler {
    fn arity(&self) -> usize {
        3
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        let after = args.u64(1, "id")?;
        let limit = usize::try_from(args.u64(2, "limit")?).unwrap_or(usize::MAX);
        reply(
            ctx.session
                .room_history_get(&room, after, limit, ctx.options)
                .await?,
        )
    }
}

/// `roomHistoryInfo(roomName)`
pub struct RoomHistoryInfoHandler;

#[async_trait]
impl Handler for RoomHistoryInfoHandler {
    fn arity(&self) -> usize {
        1
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        reply(ctx.session.room_history_info(&room, ctx.options).await?)
    }
}

/// `roomUserSeen(roomName, userName)`
pub struct RoomUserSeenHandler;

#[async_trait]
impl Handler for RoomUserSeenHandler {
    fn arity(&self) -> usize {
        2
    }

    async fn handle(&self, ctx: &Context<'_>, args: &Args) -> HandlerResult {
        let room = args.string(0, "roomName")?;
        let user = args.string(1, "userName")?;
        reply(ctx.session.room_user_seen(&room, &user, ctx.options).await?)
    }
}
