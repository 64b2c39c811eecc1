//! Topic and consumer-group naming convention
//!
//! Topics follow `<vertical>.<action>.<module>.<key>` (for example
//! `family.created.memories.photo`), consumer groups follow
//! `<vertical>.<module>.<purpose>`. The builders are plain joins; callers
//! that assemble topic names from configuration should validate them with
//! [`is_valid_topic_name`] before publishing.

/// Builds a topic name from the four-segment convention.
///
/// No validation is performed here; see [`is_valid_topic_name`].
pub fn build_topic(vertical: &str, action: &str, module: &str, key: &str) -> String {
    [vertical, action, module, key].join(".")
}

/// Builds a consumer-group name from the three-segment convention.
///
/// Uniqueness is the caller's responsibility: picking a `purpose` already
/// used by an unrelated consumer splits that consumer's deliveries.
pub fn build_group(vertical: &str, module: &str, purpose: &str) -> String {
    [vertical, module, purpose].join(".")
}

/// True iff `name` has at least four dot-separated segments, each starting
/// with a lowercase letter followed by lowercase letters or digits.
pub fn is_valid_topic_name(name: &str) -> bool {
    let mut segments = 0;
    for segment in name.split('.') {
        if !is_valid_segment(segment) {
            return false;
        }
        segments += 1;
    }
    segments >= 4
}

fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Topic every reply for this client funnels through.
pub fn reply_topic(client_id: &str) -> String {
    format!("{}-replies", client_id)
}

/// Consumer group of the shared reply listener.
pub fn reply_group(client_id: &str) -> String {
    format!("{}-reply-group", client_id)
}

/// Consumer group derived for plain subscriptions to `topic`.
pub fn subscriber_group(client_id: &str, topic: &str) -> String {
    format!("{}-{}-sub", client_id, topic)
}

/// Consumer group derived for request handlers serving `topic`.
pub fn replier_group(client_id: &str, topic: &str) -> String {
    format!("{}-{}-replier", client_id, topic)
}
