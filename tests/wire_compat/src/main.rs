fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use intentcast_protocol::{IntentionPacket, Message, MessageType, PacketError, PacketType};
    use intentcast_server::{RepeaterOptions, RepeaterStats};

    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn read_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        serde_json::from_str(&read_fixture(name))
            .unwrap_or_else(|e| panic!("failed to parse fixture {name}: {e}"))
    }

    /// Normalizes JSON values so that integer-valued floats compare equal.
    ///
    /// Other producers may write `5` where serde_json writes `5.0`.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it and compares the JSON values
    /// (order-independent, float-normalized).
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  ours:    {reserialized}"
        );
        parsed
    }

    // --- Envelopes ---

    #[test]
    fn fixture_message_intention() {
        let msg = roundtrip_test::<Message>("message_intention.json");
        assert_eq!(msg.msg_type, MessageType::Intention);
        assert_eq!(msg.id.as_deref(), Some("req-42"));

        let packet = IntentionPacket::decode_verified(msg.packet_data.as_deref().unwrap()).unwrap();
        assert_eq!(packet.payload.intention, msg.data["intention"]);
    }

    #[test]
    fn fixture_message_error() {
        let msg = roundtrip_test::<Message>("message_error.json");
        let err = msg.as_error().unwrap();
        assert_eq!(err.code, 404);
        assert!(msg.packet_data.is_none());
    }

    #[test]
    fn fixture_start_repeater_options() {
        let msg = roundtrip_test::<Message>("message_start_repeater.json");
        assert_eq!(msg.msg_type, MessageType::StartRepeater);

        let options: RepeaterOptions = serde_json::from_value(msg.data["options"].clone()).unwrap();
        assert!(options.use_hashing);
        assert_eq!(options.multiplier, 3);
        assert_eq!(options.repetition_rate_hz, 5.0);
        assert_eq!(
            normalize_value(&serde_json::to_value(options).unwrap()),
            normalize_value(&msg.data["options"])
        );
    }

    #[test]
    fn fixture_repeater_stats() {
        let stats = roundtrip_test::<RepeaterStats>("repeater_stats.json");
        assert_eq!(stats.active_count, 1);
        assert_eq!(
            stats.total_iterations,
            stats.broadcasts.iter().map(|b| b.iterations).sum::<u64>()
        );
    }

    // --- Packets ---

    #[test]
    fn fixture_packet_intention() {
        let packet = roundtrip_test::<IntentionPacket>("packet_intention.json");
        assert_eq!(packet.header.packet_type, PacketType::Intention);
        assert_eq!(packet.header.repetition_count, None);
        assert!(packet.payload.repeater_options.is_none());
        assert!(packet.verify());
    }

    #[test]
    fn fixture_packet_repeater() {
        let packet = roundtrip_test::<IntentionPacket>("packet_repeater.json");
        assert_eq!(packet.header.packet_type, PacketType::Repeater);
        assert_eq!(packet.header.repetition_count, Some(12));
        let flags = packet.payload.repeater_options.unwrap();
        assert!(flags.use_hashing && flags.use_multiplier);
        assert!(packet.verify());
    }

    #[test]
    fn fixture_payload_length_matches() {
        for name in ["packet_intention.json", "packet_repeater.json"] {
            let packet: IntentionPacket = serde_json::from_value(load_fixture(name)).unwrap();
            let len = serde_json::to_vec(&packet.payload).unwrap().len();
            assert_eq!(packet.header.payload_length, len, "{name}");
        }
    }

    #[test]
    fn fixture_transport_strings_decode() {
        for (b64, json) in [
            ("packet_intention.b64", "packet_intention.json"),
            ("packet_repeater.b64", "packet_repeater.json"),
        ] {
            let decoded = IntentionPacket::decode_verified(&read_fixture(b64)).unwrap();
            let expected: IntentionPacket = serde_json::from_value(load_fixture(json)).unwrap();
            assert_eq!(decoded, expected, "{b64}");
        }
    }

    #[test]
    fn fixture_tampered_packet_is_rejected() {
        let packet: IntentionPacket =
            serde_json::from_value(load_fixture("packet_tampered.json")).unwrap();
        assert!(!packet.verify());

        let err = IntentionPacket::decode_verified(&read_fixture("packet_tampered.b64")).unwrap_err();
        assert!(matches!(err, PacketError::ChecksumMismatch { .. }));

        // Still decodable without verification.
        assert!(IntentionPacket::transport_decode(&read_fixture("packet_tampered.b64")).is_ok());
    }

    #[test]
    fn our_encoding_matches_fixture_shape() {
        let ours = IntentionPacket::encode("Peace and clarity", 7.83, "torus", "broadcast").unwrap();
        let ours = serde_json::to_value(&ours).unwrap();
        let fixture = load_fixture("packet_intention.json");

        let keys = |v: &serde_json::Value, section: &str| -> Vec<String> {
            let mut k: Vec<String> = v[section].as_object().unwrap().keys().cloned().collect();
            k.sort();
            k
        };
        assert_eq!(keys(&ours, "header"), keys(&fixture, "header"));
        assert_eq!(keys(&ours, "payload"), keys(&fixture, "payload"));
    }
}
