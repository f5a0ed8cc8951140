mod action_type;
mod bucket_key;
mod service_id;
mod transaction_id;

pub use action_type::ActionType;
pub use bucket_key::BucketKey;
pub use service_id::ServiceId;
pub use transaction_id::TransactionId;

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! serde_round_trip {
        ($name:ident, $val:expr) => {
            #[test]
            fn $name() {
                let val = $val;
                let json = serde_json::to_string(&val).unwrap();
                let decoded = serde_json::from_str(&json).unwrap();
                assert_eq!(val, decoded);
            }
        };
    }

    serde_round_trip!(action_type_json, ActionType::new("SERVER/EU/BUY"));
    serde_round_trip!(service_id_json, ServiceId::new("4b1c"));
    serde_round_trip!(bucket_key_json, BucketKey::new("lo", Some("eu"), 7));

    #[test]
    fn newtypes_serialize_as_plain_strings() {
        let json = serde_json::to_string(&TransactionId::new("tx-1")).unwrap();
        assert_eq!(json, "\"tx-1\"");
    }

    #[test]
    fn bucket_key_format() {
        assert_eq!(BucketKey::new("lo", None, 3).to_string(), "lo:bucket-queue:3");
        assert_eq!(
            BucketKey::new("lo", Some("eu"), 3).to_string(),
            "lo:eu:bucket-queue:3"
        );
        assert_eq!(BucketKey::new("", None, 0).store_key(), ":bucket-queue:0");
    }

    #[test]
    fn segment_from_action_type() {
        assert_eq!(ActionType::new("SERVER/EU/BUY").segment().as_deref(), Some("eu"));
        assert_eq!(ActionType::new("SERVER/BUY").segment(), None);
        assert_eq!(ActionType::new("BUY").segment(), None);
    }

    #[test]
    fn service_id_short() {
        let id = ServiceId::new("0123456789abcdef");
        assert_eq!(id.short(), "01234567");
        assert_eq!(ServiceId::new("abc").short(), "abc");
        assert_ne!(ServiceId::random(), ServiceId::random());
    }
}
