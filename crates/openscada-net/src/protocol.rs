// ── Service command codes ──
//
// Command codes and body field names of the Data Access service. Every
// code lives above 0xFF so it never collides with the well-known codes in
// `message::command`.

/// Data Access service.
pub mod da {
    // ── Session ──
    pub const CC_CREATE_SESSION: u32 = 0x0001_0001;
    pub const CC_CLOSE_SESSION: u32 = 0x0001_0002;

    // ── Subscriptions ──
    pub const CC_SUBSCRIBE_ITEM: u32 = 0x0001_0010;
    pub const CC_UNSUBSCRIBE_ITEM: u32 = 0x0001_0011;

    // ── Server push ──
    pub const CC_NOTIFY_VALUE: u32 = 0x0001_0020;
    pub const CC_NOTIFY_ATTRIBUTES: u32 = 0x0001_0021;
    pub const CC_NOTIFY_SUBSCRIPTION_STATE: u32 = 0x0001_0022;

    // ── Operations ──
    pub const CC_READ: u32 = 0x0001_0030;
    pub const CC_WRITE: u32 = 0x0001_0031;
    pub const CC_BROWSE: u32 = 0x0001_0040;

    // ── Fields ──
    pub const FIELD_SESSION_ID: &str = "session-id";
    pub const FIELD_USER: &str = "user";
    pub const FIELD_PROPERTIES: &str = "properties";
    pub const FIELD_ITEM_ID: &str = "item-id";
    pub const FIELD_VALUE: &str = "value";
    pub const FIELD_ATTRIBUTES: &str = "attributes";
    /// `true` when an attribute push replaces the whole map.
    pub const FIELD_INITIAL: &str = "initial";
    pub const FIELD_STATE: &str = "subscription-state";
    pub const FIELD_ENTRIES: &str = "entries";

    /// Human-readable name of a DA command code, for logging.
    pub fn command_name(code: u32) -> &'static str {
        match code {
            CC_CREATE_SESSION => "create-session",
            CC_CLOSE_SESSION => "close-session",
            CC_SUBSCRIBE_ITEM => "subscribe-item",
            CC_UNSUBSCRIBE_ITEM => "unsubscribe-item",
            CC_NOTIFY_VALUE => "notify-value",
            CC_NOTIFY_ATTRIBUTES => "notify-attributes",
            CC_NOTIFY_SUBSCRIPTION_STATE => "notify-subscription-state",
            CC_READ => "read",
            CC_WRITE => "write",
            CC_BROWSE => "browse",
            _ => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::da;

    #[test]
    fn service_codes_stay_clear_of_well_known_range() {
        for code in [
            da::CC_CREATE_SESSION,
            da::CC_SUBSCRIBE_ITEM,
            da::CC_NOTIFY_VALUE,
            da::CC_WRITE,
            da::CC_BROWSE,
        ] {
            assert!(code > 0xFF);
            assert_ne!(da::command_name(code), "unknown");
        }
        assert_eq!(da::command_name(0x10), "unknown");
    }
}
