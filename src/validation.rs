use crate::error::{Result, SyncError};

/// Longest channel name accepted
pub const MAX_CHANNEL_NAME_LEN: usize = 80;
/// Longest message body accepted, in characters
pub const MAX_MESSAGE_LEN: usize = 10_000;
/// Most attachments on one message
pub const MAX_ATTACHMENTS: usize = 20;
/// Longest reaction symbol accepted, in characters
pub const MAX_REACTION_LEN: usize = 32;

/// Validation for user-supplied input before it reaches the cache
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Validate a record id passed in by a caller
    pub fn validate_id(id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(SyncError::Validation("Id cannot be empty".to_string()));
        }

        if id.len() > 128 {
            return Err(SyncError::Validation("Id too long (max 128 bytes)".to_string()));
        }

        if id.chars().any(char::is_control) {
            return Err(SyncError::Validation("Id contains control characters".to_string()));
        }

        Ok(())
    }

    /// Validate channel name
    pub fn validate_channel_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(SyncError::Validation("Channel name cannot be empty".to_string()));
        }

        if name.chars().count() > MAX_CHANNEL_NAME_LEN {
            return Err(SyncError::Validation(format!(
                "Channel name too long (max {MAX_CHANNEL_NAME_LEN} characters)"
            )));
        }

        if name.contains('\0') || name.contains('\r') || name.contains('\n') {
            return Err(SyncError::Validation(
                "Channel name contains invalid characters".to_string(),
            ));
        }

        Ok(())
    }

    /// Validate a message about to be sent or edited.
    ///
    /// Empty text is fine as long as something is attached.
    pub fn validate_message(content: &str, attachment_count: usize) -> Result<()> {
        if content.trim().is_empty() && attachment_count == 0 {
            return Err(SyncError::Validation(
                "Message needs text or at least one attachment".to_string(),
            ));
        }

        if content.chars().count() > MAX_MESSAGE_LEN {
            return Err(SyncError::Validation(format!(
                "Message too long (max {MAX_MESSAGE_LEN} characters)"
            )));
        }

        if content.contains('\0') {
            return Err(SyncError::Validation("Message contains a NUL byte".to_string()));
        }

        if attachment_count > MAX_ATTACHMENTS {
            return Err(SyncError::Validation(format!(
                "Too many attachments (max {MAX_ATTACHMENTS})"
            )));
        }

        Ok(())
    }

    /// Validate a reaction symbol
    pub fn validate_reaction(emoji: &str) -> Result<()> {
        if emoji.trim().is_empty() {
            return Err(SyncError::Validation("Reaction cannot be empty".to_string()));
        }

        if emoji.chars().count() > MAX_REACTION_LEN {
            return Err(SyncError::Validation(format!(
                "Reaction too long (max {MAX_REACTION_LEN} characters)"
            )));
        }

        if emoji.chars().any(char::is_whitespace) {
            return Err(SyncError::Validation("Reaction cannot contain whitespace".to_string()));
        }

        Ok(())
    }
}
