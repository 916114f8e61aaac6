//! Storage layer for tlog
//!
//! Two key/value areas sit behind one interface:
//! - **Durable**: survives reloads and is shared by every tab of the origin
//!   (SQLite via [`SqliteArea`])
//! - **Session**: scoped to one tab ([`MemoryArea`])
//!
//! [`StorageManager`] adds an in-memory fallback per area, quota cleanup and
//! the guarantee that storage failures never reach the caller.

pub mod area;
pub mod manager;
pub mod sqlite;

pub use area::{MemoryArea, StorageArea};
pub use manager::{StorageKind, StorageManager};
pub use sqlite::SqliteArea;

/// Prefix shared by every key this crate writes
pub const KEY_PREFIX: &str = "tlog:";

/// Durable key holding the anonymous user id
pub const USER_ID_KEY: &str = "tlog:uid";

/// Persisted recovery payload for a project
pub fn queue_key(project_id: &str) -> String {
    format!("{KEY_PREFIX}{project_id}:queue")
}

/// Session record for a project
pub fn session_key(project_id: &str) -> String {
    format!("{KEY_PREFIX}{project_id}:session")
}

/// Last page seen by this tab (session area)
pub fn page_key(project_id: &str) -> String {
    format!("{KEY_PREFIX}{project_id}:page")
}

/// Cross-tab channel name for a project
pub fn broadcast_channel_name(project_id: &str) -> String {
    format!("{KEY_PREFIX}{project_id}:broadcast")
}

/// Recovery payloads are the first thing dropped when space runs out
pub(crate) fn is_recovery_key(key: &str) -> bool {
    key.starts_with(KEY_PREFIX) && key.ends_with(":queue")
}

/// Keys that quota cleanup must never delete
pub(crate) fn is_essential_key(key: &str) -> bool {
    key == USER_ID_KEY || (key.starts_with(KEY_PREFIX) && key.ends_with(":session"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(queue_key("shop"), "tlog:shop:queue");
        assert_eq!(session_key("shop"), "tlog:shop:session");
        assert_eq!(broadcast_channel_name("shop"), "tlog:shop:broadcast");
        assert_eq!(page_key("shop"), "tlog:shop:page");
    }

    #[test]
    fn test_key_classes() {
        assert!(is_recovery_key("tlog:shop:queue"));
        assert!(!is_recovery_key("other:queue"));
        assert!(is_essential_key("tlog:shop:session"));
        assert!(is_essential_key(USER_ID_KEY));
        assert!(!is_essential_key("tlog:shop:queue"));
    }
}
