//! Error formatting for codec faults
//!
//! Display output is what ends up in remote error envelopes and logs, so it
//! must carry the numbers needed to diagnose a bad frame. Debug output keeps
//! the variant name for structured logging.

use tether_codec::CodecError;

#[test]
fn test_message_too_small_formatting() {
    let error = CodecError::message_too_small(44, 12, "header");

    let debug_output = format!("{:?}", error);
    assert!(debug_output.contains("MessageTooSmall"));
    assert!(debug_output.contains("44"));
    assert!(debug_output.contains("header"));

    let display_output = format!("{}", error);
    assert!(display_output.contains("need 44 bytes"));
    assert!(display_output.contains("got 12"));
    assert!(display_output.contains("context: header"));
}

#[test]
fn test_invalid_magic_formatting() {
    let zeroed = CodecError::invalid_magic(*b"TTHR", [0; 4]);
    assert!(zeroed.to_string().contains("uninitialized buffer"));

    let foreign = CodecError::invalid_magic(*b"TTHR", *b"GET ");
    assert!(foreign.to_string().contains("data corruption"));

    let other_protocol = CodecError::invalid_magic(*b"TTHR", *b"AMQP");
    let display = other_protocol.to_string();
    assert!(display.contains("different protocol"));
    assert!(display.contains("Invalid magic marker"));
}

#[test]
fn test_checksum_mismatch_formatting() {
    let error = CodecError::ChecksumMismatch {
        expected: 0x1234_5678,
        calculated: 0xabcd,
    };

    let display_output = format!("{}", error);
    assert!(display_output.contains("expected 0x12345678"));
    assert!(display_output.contains("calculated 0x0000abcd"));
    assert_eq!(error.category(), "framing");
}

#[test]
fn test_size_and_security_formatting() {
    let too_large = CodecError::message_too_large(4096, 1024);
    assert_eq!(
        too_large.to_string(),
        "Message too large: 4096 bytes exceeds maximum 1024"
    );
    assert_eq!(too_large.category(), "size");

    let auth = CodecError::authentication("HMAC digest mismatch");
    assert!(auth.to_string().contains("HMAC digest mismatch"));
    assert_eq!(auth.category(), "security");
}

#[test]
fn test_serialization_errors_are_grouped() {
    let refused = CodecError::SerializerNotAccepted {
        id: 3,
        accepted: "json".to_string(),
    };
    assert!(refused.is_serialization());
    assert!(refused.to_string().contains("accepted: json"));

    let tag = CodecError::unknown_type_tag("geometry.Point");
    assert!(tag.is_serialization());
    assert!(tag.to_string().contains("'geometry.Point'"));

    let failed = CodecError::serialize("bincode", "unexpected end of input");
    assert_eq!(
        failed.to_string(),
        "Serialization failed (bincode): unexpected end of input"
    );
    assert!(!CodecError::invalid_annotation(44, "truncated").is_serialization());
}
