use std::sync::LazyLock;

use regex::Regex;

use vg_core::metadata::MetadataMap;
use vg_core::types::{Frame, ScrubPolicy, UserContext};

/// Per-field input cap for regex evaluation; longer fields are cut first.
pub const MAX_FIELD_BYTES: usize = 10 * 1024;
const TRUNCATION_MARKER: &str = "...[TRUNCATED]";

pub const REDACTED_EMAIL: &str = "[REDACTED:EMAIL]";
pub const REDACTED_PHONE: &str = "[REDACTED:PHONE]";
pub const REDACTED_IP: &str = "[REDACTED:IP]";
pub const REDACTED_CARD: &str = "[REDACTED:CARD]";
pub const REDACTED: &str = "[REDACTED]";

// Replacement tokens contain no digits, no `@`, and no angle brackets, so a
// second pass can never re-match them (scrubbing is a fixed point).
static RE_HTML: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("html regex"));
static RE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:bearer|api[_-]?key|token|secret)\b[\s:=]+[A-Za-z0-9\-._~+/]{8,}=*")
        .expect("token regex")
});
static RE_KEY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:sk|pk|proj)_[A-Za-z0-9]{16,}\b").expect("key prefix regex")
});
static RE_CARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d(?:[ -]?\d){12,18}\b").expect("card regex"));
static RE_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex")
});
static RE_PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\+?\d{1,3}[ .-]?\(?\d{2,4}\)?[ .-]?\d{3}[ .-]?\d{2,4}\b").expect("phone regex")
});
static RE_IP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("ip regex")
});

/// Policy-driven PII redaction, applied to every string the pipeline
/// persists. Card numbers, secrets, and HTML are removed unconditionally;
/// emails, phones, and IPs follow the project policy.
#[derive(Debug, Clone, Copy)]
pub struct Scrubber {
    policy: ScrubPolicy,
}

impl Scrubber {
    pub fn new(policy: ScrubPolicy) -> Self {
        Self { policy }
    }

    /// Scrub one string field. Input beyond [`MAX_FIELD_BYTES`] is truncated
    /// (with a marker) before any regex runs.
    pub fn scrub_text(&self, input: &str) -> String {
        let mut text = truncate_field(input);

        text = RE_HTML.replace_all(&text, "").into_owned();
        text = RE_TOKEN.replace_all(&text, REDACTED).into_owned();
        text = RE_KEY_PREFIX.replace_all(&text, REDACTED).into_owned();
        text = RE_CARD.replace_all(&text, REDACTED_CARD).into_owned();

        if self.policy.remove_emails {
            text = RE_EMAIL.replace_all(&text, REDACTED_EMAIL).into_owned();
        }
        if self.policy.remove_ips {
            text = RE_IP.replace_all(&text, REDACTED_IP).into_owned();
        }
        if self.policy.remove_phones {
            text = RE_PHONE.replace_all(&text, REDACTED_PHONE).into_owned();
        }
        // Redaction tokens are longer than some of what they replace, so the
        // output is clamped again to keep scrubbing a fixed point.
        truncate_field(&text)
    }

    pub fn scrub_frames(&self, frames: &mut [Frame]) {
        for frame in frames {
            frame.function = self.scrub_text(&frame.function);
            frame.file = self.scrub_text(&frame.file);
        }
    }

    /// `email` and `ip` fields are redacted whole when the policy asks for
    /// their category; the rest go through text scrubbing.
    pub fn scrub_user_context(&self, ctx: &mut UserContext) {
        if let Some(id) = &ctx.id {
            ctx.id = Some(self.scrub_text(id));
        }
        if let Some(email) = ctx.email.take() {
            ctx.email = Some(if self.policy.remove_emails {
                REDACTED_EMAIL.to_string()
            } else {
                self.scrub_text(&email)
            });
        }
        if let Some(ip) = ctx.ip.take() {
            ctx.ip = Some(if self.policy.remove_ips {
                REDACTED_IP.to_string()
            } else {
                self.scrub_text(&ip)
            });
        }
        if let Some(segment) = &ctx.segment {
            ctx.segment = Some(self.scrub_text(segment));
        }
    }

    pub fn scrub_metadata(&self, metadata: &mut MetadataMap) {
        metadata.for_each_string_mut(|value| {
            *value = self.scrub_text(value);
        });
    }
}

fn truncate_field(input: &str) -> String {
    let budget = MAX_FIELD_BYTES - TRUNCATION_MARKER.len();
    if input.len() <= MAX_FIELD_BYTES {
        return input.to_string();
    }
    let mut cut = budget;
    while !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &input[..cut])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
