/// Conversation identity derivation
///
/// A 1:1 thread is named by its two participants, so either side can compute
/// the id without a handshake.

/// Joins the two sorted participant ids
pub const CONVERSATION_ID_SEPARATOR: &str = "_";

/// Derive the conversation id for participants `a` and `b`.
///
/// Symmetric: `derive_conversation_id(a, b) == derive_conversation_id(b, a)`.
pub fn derive_conversation_id(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{}{}{}", first, CONVERSATION_ID_SEPARATOR, second)
}

/// The participant that is not `local_user`, given a message's two endpoints
pub fn counterpart<'a>(local_user: &str, sender_id: &'a str, receiver_id: &'a str) -> &'a str {
    if sender_id == local_user {
        receiver_id
    } else {
        sender_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_sorted_join() {
        assert_eq!(derive_conversation_id("u1", "u2"), "u1_u2");
        assert_eq!(derive_conversation_id("u2", "u1"), "u1_u2");
    }

    #[test]
    fn test_derive_is_symmetric() {
        let ids = [
            "u1",
            "u2",
            "64f1a2b3c4d5e6f708091a2b",
            "64f1a2b3c4d5e6f708091a2c",
            "",
            "Zed",
            "alpha",
        ];
        for a in ids {
            for b in ids {
                assert_eq!(derive_conversation_id(a, b), derive_conversation_id(b, a));
            }
        }
    }

    #[test]
    fn test_self_conversation() {
        assert_eq!(derive_conversation_id("u1", "u1"), "u1_u1");
    }

    #[test]
    fn test_counterpart() {
        assert_eq!(counterpart("u1", "u1", "u2"), "u2");
        assert_eq!(counterpart("u1", "u2", "u1"), "u2");
    }
}
