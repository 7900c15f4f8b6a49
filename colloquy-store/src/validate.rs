use colloquy_core::error::TranscriptError;
use colloquy_core::message::normalize_sender;

/// Validate and normalize an append's inputs. Returns the normalized
/// sender and trimmed content.
pub(crate) fn validate_message(
    sender: &str,
    content: &str,
    max_message_length: usize,
) -> Result<(String, String), TranscriptError> {
    let sender = normalize_sender(sender)
        .ok_or_else(|| TranscriptError::InvalidInput("sender cannot be empty".to_string()))?;

    let content = content.trim();
    if content.is_empty() {
        return Err(TranscriptError::InvalidInput(
            "message content cannot be empty".to_string(),
        ));
    }
    if content.len() > max_message_length {
        return Err(TranscriptError::InvalidInput(format!(
            "message too long ({} bytes, max {max_message_length})",
            content.len()
        )));
    }

    Ok((sender, content.to_string()))
}

/// Coerce the caller's metadata into an object bag; non-objects are
/// replaced with an empty bag rather than rejected.
pub(crate) fn metadata_object(metadata: serde_json::Value) -> serde_json::Value {
    if metadata.is_object() {
        metadata
    } else {
        serde_json::json!({})
    }
}

/// Token count to add to the running tally, taken from the caller's
/// metadata as-is.
pub(crate) fn metadata_tokens(metadata: &serde_json::Value) -> u64 {
    metadata
        .get(colloquy_core::message::meta_keys::TOKENS)
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0)
}
