//! JSON-RPC method names used on the wire.
//!
//! Only the methods the client issues are listed; server notifications are
//! classified with [`is_list_changed`] rather than matched one by one.

/// Handshake request sent first on every connection.
pub const INITIALIZE: &str = "initialize";
/// Sent once the `initialize` response has been accepted.
pub const INITIALIZED: &str = "notifications/initialized";
pub const PING: &str = "ping";
/// Tells the server an in-flight request was abandoned.
pub const CANCELLED: &str = "notifications/cancelled";

pub const TOOLS_LIST: &str = "tools/list";
pub const TOOLS_CALL: &str = "tools/call";
pub const PROMPTS_LIST: &str = "prompts/list";
pub const PROMPTS_GET: &str = "prompts/get";
pub const RESOURCES_LIST: &str = "resources/list";
pub const RESOURCES_READ: &str = "resources/read";

const LIST_CHANGED_SUFFIX: &str = "/list_changed";

/// Whether `method` announces that one of the server's catalogs
/// (tools, prompts or resources) changed and should be fetched again.
pub fn is_list_changed(method: &str) -> bool {
    method.starts_with("notifications/") && method.ends_with(LIST_CHANGED_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_list_changed() {
        assert!(is_list_changed("notifications/tools/list_changed"));
        assert!(is_list_changed("notifications/resources/list_changed"));
        assert!(!is_list_changed(TOOLS_LIST));
        assert!(!is_list_changed(CANCELLED));
    }
}
