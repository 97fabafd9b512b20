use std::hash::Hasher;
use std::sync::LazyLock;

use regex::Regex;
use siphasher::sip128::{Hasher128, SipHasher13};

use vg_core::types::Frame;

// The fingerprint is a stability contract: the hash keys, the separator, the
// normalization patterns, and the frame cap are frozen for a major release.
// Changing any of them regroups every error on upgrade.
const HASH_KEY_0: u64 = 0x7669_6769_6c5f_6670; // "vigil_fp"
const HASH_KEY_1: u64 = 0x6670_5f76_3100_0000; // "fp_v1"
const SEPARATOR: char = '\u{1f}';

static RE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static RE_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("uuid regex")
});
static RE_HEX_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[0-9a-fA-F]+\b").expect("hex addr regex"));
static RE_LONG_HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-f]{8,}\b").expect("long hex regex"));
static RE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[^"]*"|'[^']*'"#).expect("quoted regex"));
static RE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("number regex"));

/// Normalize a message for grouping: trim, collapse whitespace, and replace
/// volatile tokens (ids, addresses, quoted values) with placeholders so two
/// occurrences of the same error hash identically.
pub fn normalize_message(message: &str) -> String {
    let text = message.trim();
    let text = RE_WHITESPACE.replace_all(text, " ");
    let text = RE_QUOTED.replace_all(&text, "<str>");
    let text = RE_UUID.replace_all(&text, "<uuid>");
    let text = RE_HEX_ADDR.replace_all(&text, "<addr>");
    let text = RE_LONG_HEX.replace_all(&text, "<hex>");
    RE_NUMBER.replace_all(&text, "<num>").into_owned()
}

/// Deterministic 128-bit fingerprint over the normalized message, the first
/// `frame_limit` in-app frames, the environment, and (optionally) severity.
pub fn fingerprint(
    message: &str,
    frames: &[Frame],
    environment: &str,
    severity: Option<&str>,
    frame_limit: usize,
) -> String {
    let mut canonical = normalize_message(message);

    for frame in frames.iter().filter(|f| f.in_app).take(frame_limit) {
        canonical.push(SEPARATOR);
        canonical.push_str(&frame.function);
        canonical.push(SEPARATOR);
        canonical.push_str(&frame.file);
        canonical.push(SEPARATOR);
        canonical.push_str(&frame.line.to_string());
    }

    canonical.push(SEPARATOR);
    canonical.push_str(environment);
    if let Some(severity) = severity {
        canonical.push(SEPARATOR);
        canonical.push_str(severity);
    }

    let mut hasher = SipHasher13::new_with_keys(HASH_KEY_0, HASH_KEY_1);
    hasher.write(canonical.as_bytes());
    format!("{:032x}", hasher.finish128().as_u128())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(function: &str, file: &str, line: u32, in_app: bool) -> Frame {
        Frame {
            function: function.into(),
            file: file.into(),
            line,
            in_app,
        }
    }

    #[test]
    fn normalization_strips_volatile_tokens() {
        assert_eq!(
            normalize_message("  user   42 not found  "),
            "user <num> not found"
        );
        assert_eq!(
            normalize_message("order 550e8400-e29b-41d4-a716-446655440000 failed"),
            "order <uuid> failed"
        );
        assert_eq!(
            normalize_message("segfault at 0x7ffee4c3"),
            "segfault at <addr>"
        );
        assert_eq!(
            normalize_message("bad token deadbeefdeadbeef"),
            "bad token <hex>"
        );
        assert_eq!(
            normalize_message("missing key 'user.name' in payload"),
            "missing key <str> in payload"
        );
    }

    #[test]
    fn same_error_different_ids_share_a_fingerprint() {
        let frames = vec![frame("f", "a.js", 10, true)];
        let a = fingerprint("user 42 not found", &frames, "production", None, 5);
        let b = fingerprint("user 97 not found", &frames, "production", None, 5);
        assert_eq!(a, b);
    }

    #[test]
    fn environment_distinguishes_fingerprints() {
        let frames = vec![frame("f", "a.js", 10, true)];
        let prod = fingerprint("boom", &frames, "production", None, 5);
        let staging = fingerprint("boom", &frames, "staging", None, 5);
        assert_ne!(prod, staging);
    }

    #[test]
    fn only_leading_in_app_frames_count() {
        let with_vendor = vec![
            frame("f", "a.js", 10, true),
            frame("vendorFn", "node_modules/lib.js", 1, false),
        ];
        let without_vendor = vec![frame("f", "a.js", 10, true)];
        assert_eq!(
            fingerprint("boom", &with_vendor, "production", None, 5),
            fingerprint("boom", &without_vendor, "production", None, 5)
        );
    }

    #[test]
    fn frame_limit_caps_the_input() {
        let mut many = Vec::new();
        for i in 0..10 {
            many.push(frame(&format!("f{i}"), "a.js", i, true));
        }
        let first_five = many[..5].to_vec();
        assert_eq!(
            fingerprint("boom", &many, "production", None, 5),
            fingerprint("boom", &first_five, "production", None, 5)
        );
        assert_ne!(
            fingerprint("boom", &many, "production", None, 6),
            fingerprint("boom", &many, "production", None, 5)
        );
    }

    #[test]
    fn severity_participates_only_when_enabled() {
        let frames = vec![frame("f", "a.js", 10, true)];
        let plain = fingerprint("boom", &frames, "production", None, 5);
        let with_sev = fingerprint("boom", &frames, "production", Some("critical"), 5);
        assert_ne!(plain, with_sev);
    }

    #[test]
    fn output_is_32_hex_chars() {
        let fp = fingerprint("boom", &[], "production", None, 5);
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    proptest! {
        // Determinism: the same payload always produces the same hash.
        #[test]
        fn fingerprint_is_deterministic(
            message in ".{0,200}",
            environment in "[a-z]{1,12}",
            line in 0u32..10_000,
        ) {
            let frames = vec![frame("handler", "src/app.js", line, true)];
            let a = fingerprint(&message, &frames, &environment, None, 5);
            let b = fingerprint(&message, &frames, &environment, None, 5);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn numeric_ids_never_split_groups(
            id_a in 0u64..1_000_000,
            id_b in 0u64..1_000_000,
        ) {
            let frames = vec![frame("handler", "src/app.js", 1, true)];
            let a = fingerprint(
                &format!("record {id_a} missing"), &frames, "production", None, 5);
            let b = fingerprint(
                &format!("record {id_b} missing"), &frames, "production", None, 5);
            prop_assert_eq!(a, b);
        }
    }
}
