//! Group mutation coordinator and message dispatch glue.
//!
//! Every operation follows the same shape: authorization predicate →
//! conditional persisted write → post-commit broadcast. Broadcasts never
//! precede the commit, so a client can never observe an event whose
//! underlying state read would return the old value.

use std::sync::Arc;

use sqlx::{Pool, Sqlite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::{self, ChatPatch, ChatRecord, DirectInsert, Precondition};
use crate::error::{CoordError, CoordResult};
use crate::events::{ChatDto, ConnId, MemberDto, MessageDto, RoomId, ServerEvent, UserId};
use crate::presence::PresenceRegistry;
use crate::rooms::{Broadcaster, RoomRouter};

/// Result of a committed mutation. `degraded` is set when the persisted
/// write succeeded but best-effort payload enrichment did not.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub chat: ChatDto,
    pub degraded: bool,
}

pub struct ChatCoordinator {
    pool: Pool<Sqlite>,
    presence: Arc<PresenceRegistry>,
    rooms: Arc<RoomRouter>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl ChatCoordinator {
    pub fn new(
        pool: Pool<Sqlite>,
        presence: Arc<PresenceRegistry>,
        rooms: Arc<RoomRouter>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            pool,
            presence,
            rooms,
            broadcaster,
        }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create (or return the existing) direct conversation between the
    /// requester and `target`.
    pub async fn create_direct(&self, requester: &UserId, target: &str) -> CoordResult<MutationOutcome> {
        if target.is_empty() {
            return Err(CoordError::validation("target identity is required"));
        }
        if target == requester {
            return Err(CoordError::validation("cannot start a conversation with yourself"));
        }
        if !database::user_exists(&self.pool, target).await? {
            return Err(CoordError::not_found(format!("no such user: {target}")));
        }

        if let Some(existing) = database::find_direct_chat(&self.pool, requester, target).await? {
            return Ok(self.populate(existing).await);
        }

        let chat_id = Uuid::new_v4().to_string();
        let record =
            match database::insert_direct_chat(&self.pool, &chat_id, requester, target).await? {
                DirectInsert::Created => database::get_chat(&self.pool, &chat_id)
                    .await?
                    .ok_or_else(|| CoordError::not_found("conversation vanished after insert"))?,
                // A concurrent creator won the UNIQUE-key race; their chat is
                // the conversation for this pair.
                DirectInsert::Existing(chat) => return Ok(self.populate(chat).await),
            };

        info!("Direct chat {} created between {} and {}", chat_id, requester, target);
        let outcome = self.populate(record).await;
        self.broadcaster
            .broadcast_to_user(&target.to_string(), &ServerEvent::NewConversation {
                chat: outcome.chat.clone(),
            })
            .await;
        Ok(outcome)
    }

    /// Create a group chat with the requester as admin. Candidate members
    /// are deduplicated and filtered to identities that exist; at least two
    /// others must remain.
    pub async fn create_group(
        &self,
        requester: &UserId,
        name: &str,
        members: &[UserId],
        about: Option<&str>,
    ) -> CoordResult<MutationOutcome> {
        if name.trim().is_empty() {
            return Err(CoordError::validation("group name is required"));
        }

        let mut others: Vec<UserId> = Vec::new();
        for id in members {
            if id != requester && !others.contains(id) {
                others.push(id.clone());
            }
        }
        let others = database::filter_existing_users(&self.pool, &others).await?;
        if others.len() < 2 {
            return Err(CoordError::validation(
                "a group needs at least two other existing members",
            ));
        }

        let mut all_members = vec![requester.clone()];
        all_members.extend(others.iter().cloned());

        let chat_id = Uuid::new_v4().to_string();
        database::insert_group_chat(&self.pool, &chat_id, name.trim(), requester, &all_members, about)
            .await?;
        info!("Group {} ({}) created by {} with {} members", chat_id, name, requester, all_members.len());

        let record = self.reload(&chat_id).await?;
        let outcome = self.populate(record).await;
        for member in &others {
            self.broadcaster
                .broadcast_to_user(member, &ServerEvent::AddedToGroup {
                    chat: outcome.chat.clone(),
                })
                .await;
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Metadata mutations (admin only)
    // -----------------------------------------------------------------------

    pub async fn rename(
        &self,
        requester: &UserId,
        chat_id: &str,
        name: &str,
        initiator: Option<ConnId>,
    ) -> CoordResult<MutationOutcome> {
        if name.trim().is_empty() {
            return Err(CoordError::validation("group name is required"));
        }
        self.admin_update(requester, chat_id, &[ChatPatch::Name(name.trim())], initiator)
            .await
    }

    pub async fn update_about(
        &self,
        requester: &UserId,
        chat_id: &str,
        about: &str,
        initiator: Option<ConnId>,
    ) -> CoordResult<MutationOutcome> {
        self.admin_update(requester, chat_id, &[ChatPatch::About(about)], initiator)
            .await
    }

    pub async fn update_picture(
        &self,
        requester: &UserId,
        chat_id: &str,
        picture: &str,
        initiator: Option<ConnId>,
    ) -> CoordResult<MutationOutcome> {
        self.admin_update(requester, chat_id, &[ChatPatch::Picture(picture)], initiator)
            .await
    }

    /// Shared path for the single-field admin mutations: one conditional
    /// write with the admin re-checked in the WHERE clause, then one
    /// "group-updated" broadcast.
    async fn admin_update(
        &self,
        requester: &UserId,
        chat_id: &str,
        patches: &[ChatPatch<'_>],
        initiator: Option<ConnId>,
    ) -> CoordResult<MutationOutcome> {
        let matched = database::update_chat_if(
            &self.pool,
            chat_id,
            Precondition { admin: Some(requester.as_str()), ..Default::default() },
            patches,
        )
        .await?;
        if !matched {
            return Err(self.classify_no_match(chat_id, requester).await);
        }

        let record = self.reload(chat_id).await?;
        let outcome = self.populate(record).await;
        self.broadcaster
            .broadcast_to_room(
                &RoomId::chat(chat_id),
                &ServerEvent::GroupUpdated { chat: outcome.chat.clone() },
                initiator,
            )
            .await;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    pub async fn add_members(
        &self,
        requester: &UserId,
        chat_id: &str,
        candidates: &[UserId],
        initiator: Option<ConnId>,
    ) -> CoordResult<MutationOutcome> {
        let chat = self.require_group(chat_id).await?;
        if chat.admin.as_deref() != Some(requester.as_str()) {
            return Err(CoordError::forbidden("only the group admin can add members"));
        }

        let mut additions: Vec<UserId> = Vec::new();
        for id in candidates {
            if id != requester && !chat.members.contains(id) && !additions.contains(id) {
                additions.push(id.clone());
            }
        }
        let additions = database::filter_existing_users(&self.pool, &additions).await?;
        if additions.is_empty() {
            return Err(CoordError::validation("no valid identities to add"));
        }

        let snapshot = database::members_json(&chat.members);
        let mut members = chat.members.clone();
        members.extend(additions.iter().cloned());

        // Precondition: the membership we extended is still the live one.
        // A remove that committed since the read must not be overwritten
        // with the stale list.
        let matched = database::update_chat_if(
            &self.pool,
            chat_id,
            Precondition {
                admin: Some(requester.as_str()),
                members_json: Some(&snapshot),
            },
            &[ChatPatch::Members(&members)],
        )
        .await?;
        if !matched {
            return Err(self.classify_no_match(chat_id, requester).await);
        }
        info!("Added {} member(s) to group {}", additions.len(), chat_id);

        let record = self.reload(chat_id).await?;
        let outcome = self.populate(record).await;
        self.broadcaster
            .broadcast_to_room(
                &RoomId::chat(chat_id),
                &ServerEvent::GroupUpdated { chat: outcome.chat.clone() },
                initiator,
            )
            .await;
        for member in &additions {
            self.broadcaster
                .broadcast_to_user(member, &ServerEvent::AddedToGroup {
                    chat: outcome.chat.clone(),
                })
                .await;
        }
        Ok(outcome)
    }

    /// Remove a member. Allowed for the admin, or for any member removing
    /// themselves. The admin may only remove themselves when nobody else
    /// remains; otherwise admin transfer comes first.
    pub async fn remove_member(
        &self,
        requester: &UserId,
        chat_id: &str,
        target: &str,
        initiator: Option<ConnId>,
    ) -> CoordResult<MutationOutcome> {
        let chat = self.require_group(chat_id).await?;
        if !chat.members.iter().any(|m| m == target) {
            return Err(CoordError::validation("target is not a member of this group"));
        }

        let is_admin = chat.admin.as_deref() == Some(requester.as_str());
        let is_self = requester == target;
        if !is_admin && !is_self {
            return Err(CoordError::forbidden(
                "only the group admin can remove other members",
            ));
        }
        if is_admin && is_self && chat.members.len() > 1 {
            return Err(CoordError::forbidden(
                "transfer the admin role before leaving the group",
            ));
        }

        let snapshot = database::members_json(&chat.members);
        let members: Vec<UserId> =
            chat.members.iter().filter(|m| m.as_str() != target).cloned().collect();
        let mut patches = vec![ChatPatch::Members(&members)];
        if members.is_empty() {
            // Sole-member self-removal leaves an effectively member-less
            // group with no admin.
            patches.push(ChatPatch::Admin(None));
        }

        // Precondition: the membership snapshot we decided on is still the
        // live one. Closes the race with a concurrent add/remove.
        let matched = database::update_chat_if(
            &self.pool,
            chat_id,
            Precondition {
                admin: is_admin.then_some(requester.as_str()),
                members_json: Some(&snapshot),
            },
            &patches,
        )
        .await?;
        if !matched {
            return Err(self.classify_no_match(chat_id, requester).await);
        }
        info!("User {} removed from group {} by {}", target, chat_id, requester);

        self.broadcaster
            .broadcast_to_user(&target.to_string(), &ServerEvent::RemovedFromGroup {
                chat_id: chat_id.to_string(),
                name: chat.name.clone(),
            })
            .await;

        let record = self.reload(chat_id).await?;
        let outcome = self.populate(record).await;
        self.broadcaster
            .broadcast_to_room(
                &RoomId::chat(chat_id),
                &ServerEvent::UserLeftGroup { chat: outcome.chat.clone() },
                initiator,
            )
            .await;
        self.rooms
            .force_leave(&self.presence, &target.to_string(), &RoomId::chat(chat_id));
        Ok(outcome)
    }

    /// Hand the admin role to another current member. The current admin is
    /// re-validated inside the conditional write, not just at read time, so
    /// two stale admins cannot both succeed.
    pub async fn transfer_admin(
        &self,
        requester: &UserId,
        chat_id: &str,
        new_admin: &str,
        initiator: Option<ConnId>,
    ) -> CoordResult<MutationOutcome> {
        if new_admin == requester {
            return Err(CoordError::validation("you are already the admin"));
        }
        let chat = self.require_group(chat_id).await?;
        if !chat.members.iter().any(|m| m == new_admin) {
            return Err(CoordError::validation("the new admin must be a group member"));
        }

        self.admin_update(requester, chat_id, &[ChatPatch::Admin(Some(new_admin))], initiator)
            .await
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Delete a group and all of its messages. The room is told first, then
    /// emptied.
    pub async fn delete(&self, requester: &UserId, chat_id: &str) -> CoordResult<()> {
        let chat = self.require_group(chat_id).await?;

        let deleted = database::delete_chat_if_admin(&self.pool, chat_id, requester).await?;
        if !deleted {
            return Err(self.classify_no_match(chat_id, requester).await);
        }
        info!("Group {} deleted by {}", chat_id, requester);

        let room = RoomId::chat(chat_id);
        self.broadcaster
            .broadcast_to_room(
                &room,
                &ServerEvent::GroupDeleted {
                    chat_id: chat_id.to_string(),
                    name: chat.name.clone(),
                },
                None,
            )
            .await;
        self.rooms.clear_room(&room);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Message dispatch glue
    // -----------------------------------------------------------------------

    /// Persist a message, advance the parent chat's latest-message pointer,
    /// then broadcast. Members not currently in the conversation room still
    /// see their chat list move via their personal rooms.
    pub async fn send_message(
        &self,
        requester: &UserId,
        chat_id: &str,
        content: &str,
    ) -> CoordResult<MessageDto> {
        if content.is_empty() {
            return Err(CoordError::validation("message content is required"));
        }
        let chat = database::get_chat(&self.pool, chat_id)
            .await?
            .ok_or_else(|| CoordError::not_found("conversation not found"))?;
        if !chat.members.iter().any(|m| m == requester) {
            return Err(CoordError::forbidden("not a member of this conversation"));
        }

        // Insert and pointer update commit together; a chat deleted since
        // the membership check leaves no orphaned message row behind.
        let message_id = Uuid::new_v4().to_string();
        let message =
            database::insert_message(&self.pool, &message_id, chat_id, requester, content)
                .await?
                .ok_or_else(|| CoordError::not_found("conversation not found"))?;
        debug!("Message {} persisted to chat {}", message_id, chat_id);

        self.broadcaster
            .broadcast_to_room(
                &RoomId::chat(chat_id),
                &ServerEvent::MessageReceived { message: message.clone() },
                None,
            )
            .await;
        for member in &chat.members {
            self.broadcaster
                .broadcast_to_user(member, &ServerEvent::LatestMessageUpdated {
                    message: message.clone(),
                })
                .await;
        }
        Ok(message)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_chat(&self, requester: &UserId, chat_id: &str) -> CoordResult<MutationOutcome> {
        let chat = database::get_chat(&self.pool, chat_id)
            .await?
            .ok_or_else(|| CoordError::not_found("conversation not found"))?;
        if !chat.members.iter().any(|m| m == requester) {
            return Err(CoordError::forbidden("not a member of this conversation"));
        }
        Ok(self.populate(chat).await)
    }

    pub async fn list_messages(
        &self,
        requester: &UserId,
        chat_id: &str,
    ) -> CoordResult<Vec<MessageDto>> {
        let chat = database::get_chat(&self.pool, chat_id)
            .await?
            .ok_or_else(|| CoordError::not_found("conversation not found"))?;
        if !chat.members.iter().any(|m| m == requester) {
            return Err(CoordError::forbidden("not a member of this conversation"));
        }
        Ok(database::list_messages(&self.pool, chat_id).await?)
    }

    /// Membership check used by the socket layer before letting a
    /// connection join a conversation room.
    pub async fn is_chat_member(&self, user: &UserId, chat_id: &str) -> CoordResult<bool> {
        let chat = database::get_chat(&self.pool, chat_id).await?;
        Ok(chat.map(|c| c.members.iter().any(|m| m == user)).unwrap_or(false))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn require_group(&self, chat_id: &str) -> CoordResult<ChatRecord> {
        let chat = database::get_chat(&self.pool, chat_id)
            .await?
            .ok_or_else(|| CoordError::not_found("conversation not found"))?;
        if !chat.is_group {
            return Err(CoordError::validation("not a group conversation"));
        }
        Ok(chat)
    }

    async fn reload(&self, chat_id: &str) -> CoordResult<ChatRecord> {
        database::get_chat(&self.pool, chat_id)
            .await?
            .ok_or_else(|| CoordError::not_found("conversation not found"))
    }

    /// Diagnostic read after a no-match conditional write, solely to
    /// classify the failure for the caller. Best effort: if the chat
    /// disappeared between the write and this read, report not-found.
    async fn classify_no_match(&self, chat_id: &str, requester: &UserId) -> CoordError {
        match database::get_chat(&self.pool, chat_id).await {
            Ok(None) | Err(_) => CoordError::not_found("conversation not found"),
            Ok(Some(chat)) if !chat.is_group => CoordError::validation("not a group conversation"),
            Ok(Some(chat)) if chat.admin.as_deref() != Some(requester.as_str()) => {
                CoordError::forbidden("only the group admin can do this")
            }
            // Precondition held on re-read: a concurrent writer beat us.
            Ok(Some(_)) => CoordError::forbidden("the group changed concurrently, try again"),
        }
    }

    /// Best-effort enrichment of a chat record for broadcast/response
    /// payloads. The mutation has already committed; a failure here yields
    /// the unpopulated record with the degraded flag, never an error.
    async fn populate(&self, record: ChatRecord) -> MutationOutcome {
        let mut degraded = false;

        let members = match database::member_summaries(&self.pool, &record.members).await {
            Ok(members) => members,
            Err(e) => {
                warn!("Member enrichment failed for chat {}: {}", record.id, e);
                degraded = true;
                record
                    .members
                    .iter()
                    .map(|id| MemberDto { id: id.clone(), name: None })
                    .collect()
            }
        };

        let latest_message = match &record.latest_message_id {
            Some(id) => match database::get_message(&self.pool, id).await {
                Ok(message) => message,
                Err(e) => {
                    warn!("Latest-message enrichment failed for chat {}: {}", record.id, e);
                    degraded = true;
                    None
                }
            },
            None => None,
        };

        MutationOutcome {
            chat: ChatDto {
                id: record.id,
                is_group: record.is_group,
                name: record.name,
                admin: record.admin,
                about: record.about,
                picture: record.picture,
                members,
                latest_message,
            },
            degraded,
        }
    }
}
