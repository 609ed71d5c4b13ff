//! Invite-link operations.
//!
//! Invite commands answer out of band: the server pushes a notification
//! with the actual payload and then resolves the command with a bare
//! `Success`. Each operation therefore arms a notification catcher before
//! sending its command and collects the caught payload afterwards.

use std::collections::HashMap;

use pylon_core::{
    Command, CommandResult, InviteCreate, InviteInfo, InviteLogAction, InviteQueryInfo, Notify,
    NotifyKind,
};
use thiserror::Error;
use tracing::debug;

use crate::connection::Connection;

/// Failure of an invite operation.
#[derive(Debug, Error)]
pub enum InviteError {
    /// The server rejected the command.
    #[error("invite command rejected: {0:?}")]
    Rejected(CommandResult),
    /// The command succeeded but the expected notification never arrived.
    #[error("invite command succeeded without the expected notification")]
    NotifyMissing,
}

/// Outcome of [`InviteService::create_invite_link`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedInvite {
    /// Identifier of the link.
    pub link_id: String,
    /// Administration token, present when a new link was created rather
    /// than an equivalent one reused.
    pub admin_token: Option<String>,
}

/// Invite operations over an established [`Connection`].
pub struct InviteService {
    connection: Connection,
}

impl InviteService {
    /// Service over `connection`.
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Create (or reuse) an invite link with the given properties.
    pub async fn create_invite_link(
        &self,
        new_link: bool,
        properties_connect: HashMap<String, String>,
        properties_info: HashMap<String, String>,
    ) -> Result<CreatedInvite, InviteError> {
        // Armed before the send so the notification cannot slip past.
        let caught = self.connection.catch_notify(NotifyKind::InviteCreated);
        let command = Command::InviteCreate(InviteCreate {
            new_link,
            properties_connect,
            properties_info,
        });
        let result = self.connection.execute_command(command).await;
        if !result.is_success() {
            debug!(result = ?result, "invite creation rejected");
            return Err(InviteError::Rejected(result));
        }
        match caught.resolve() {
            Some(Notify::InviteCreated(created)) => Ok(CreatedInvite {
                link_id: created.link_id,
                admin_token: created.admin_token,
            }),
            _ => Err(InviteError::NotifyMissing),
        }
    }

    /// Query the stored info of an invite link.
    pub async fn query_invite_link(
        &self,
        link_id: &str,
        register_view: bool,
    ) -> Result<InviteInfo, InviteError> {
        let wanted = link_id.to_owned();
        let caught = self
            .connection
            .catch_notify_when(NotifyKind::InviteInfo, move |notify| {
                matches!(notify, Notify::InviteInfo(info) if info.link_id == wanted)
            });
        let command = Command::InviteQueryInfo(InviteQueryInfo {
            link_id: link_id.to_owned(),
            register_view,
        });
        let result = self.connection.execute_command(command).await;
        if !result.is_success() {
            debug!(link_id, result = ?result, "invite query rejected");
            return Err(InviteError::Rejected(result));
        }
        match caught.resolve() {
            Some(Notify::InviteInfo(info)) => Ok(info),
            _ => Err(InviteError::NotifyMissing),
        }
    }

    /// Log a click action against the session's invite link.
    pub async fn log_action(&self, click_type: i32) -> Result<(), InviteError> {
        let command = Command::InviteLogAction(InviteLogAction { click_type });
        let result = self.connection.execute_command(command).await;
        if result.is_success() {
            Ok(())
        } else {
            Err(InviteError::Rejected(result))
        }
    }
}
