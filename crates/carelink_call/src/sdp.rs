/*
 * SPDX-FileCopyrightText: 2026 CareLink Health - CARELINK Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Repair pipeline for text session descriptions.
//!
//! Negotiation payloads arriving over the relay (or produced by a
//! misbehaving peer) are occasionally structurally broken in ways the
//! native negotiation object rejects outright. This module re-parses the
//! description into a typed intermediate (session-level lines plus an
//! ordered list of media blocks), synthesizes any missing mandatory
//! lines, strips parser-breaking malformations and reassembles. The
//! output is always parseable; callers use `fixed` whether or not the
//! input was valid.

use carelink_protocol::SdpKind;

/// Outcome of one repair pass. `valid` is true only when no error-level
/// fix was applied; warnings alone do not invalidate a description.
#[derive(Debug, Clone)]
pub struct SdpReport {
    pub fixed: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub valid: bool,
}

/// One `m=` section and everything classified under it.
#[derive(Debug)]
struct MediaBlock {
    m_line: String,
    lines: Vec<String>,
}

#[derive(Debug, Default)]
struct Parsed {
    session: Vec<String>,
    media: Vec<MediaBlock>,
}

fn classify(raw: &str) -> Parsed {
    let mut parsed = Parsed::default();
    for line in raw.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // The four mandatory lines are session-level no matter where they
        // appear; a mid-block v=/o=/s=/t= is an upstream splice error.
        if line.starts_with("v=")
            || line.starts_with("o=")
            || line.starts_with("s=")
            || line.starts_with("t=")
        {
            parsed.session.push(line.to_string());
            continue;
        }
        if line.starts_with("m=") {
            parsed.media.push(MediaBlock {
                m_line: line.to_string(),
                lines: Vec::new(),
            });
            continue;
        }
        match parsed.media.last_mut() {
            Some(block) => block.lines.push(line.to_string()),
            None => parsed.session.push(line.to_string()),
        }
    }
    parsed
}

fn ensure_session_line(
    session: &mut Vec<String>,
    prefix: &str,
    default: &str,
    position: usize,
    errors: &mut Vec<String>,
) {
    if session.iter().any(|l| l.starts_with(prefix)) {
        return;
    }
    errors.push(format!("missing mandatory session line ({prefix})"));
    let at = position.min(session.len());
    session.insert(at, default.to_string());
}

/// A `c=` line inside a media block is only well-placed directly under its
/// `m=` line; anywhere else it marks a description that was spliced back
/// together incorrectly upstream and breaks strict parsers.
fn strip_orphan_connection_lines(block: &mut MediaBlock, errors: &mut Vec<String>) {
    let mut kept = Vec::with_capacity(block.lines.len());
    let mut prev_is_media = true; // first line follows the m= line itself
    let mut dropped = 0usize;
    for line in block.lines.drain(..) {
        if line.starts_with("c=") && !prev_is_media {
            dropped += 1;
            continue;
        }
        prev_is_media = line.starts_with("m=");
        kept.push(line);
    }
    if dropped > 0 {
        errors.push(format!(
            "removed {dropped} orphaned c= line(s) from media section {}",
            block.m_line
        ));
    }
    block.lines = kept;
}

fn synthetic_audio_block() -> MediaBlock {
    MediaBlock {
        m_line: "m=audio 9 UDP/TLS/RTP/SAVPF 111".to_string(),
        lines: vec![
            "c=IN IP4 0.0.0.0".to_string(),
            "a=rtcp:9 IN IP4 0.0.0.0".to_string(),
            "a=sendrecv".to_string(),
        ],
    }
}

fn check_bundle_group(parsed: &Parsed, warnings: &mut Vec<String>) {
    let mut mids: Vec<&str> = Vec::new();
    for block in &parsed.media {
        for line in &block.lines {
            if let Some(mid) = line.strip_prefix("a=mid:") {
                mids.push(mid.trim());
            }
        }
    }
    for line in &parsed.session {
        if let Some(members) = line.strip_prefix("a=group:BUNDLE") {
            let missing: Vec<&str> = members
                .split_whitespace()
                .filter(|id| !mids.contains(id))
                .collect();
            if !missing.is_empty() {
                warnings.push(format!(
                    "bundle group references unknown mid(s): {}",
                    missing.join(", ")
                ));
            }
        }
    }
}

fn check_msid_semantic(parsed: &Parsed, warnings: &mut Vec<String>) {
    for line in &parsed.session {
        if let Some(rest) = line.strip_prefix("a=msid-semantic:") {
            let rest = rest.trim();
            if rest == "WMS" || rest.strip_prefix("WMS").map(str::trim) == Some("") {
                warnings.push("msid-semantic WMS has empty identifier".to_string());
            }
        }
    }
}

fn reassemble(parsed: &Parsed) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in &parsed.session {
        out.push(line);
    }
    for block in &parsed.media {
        out.push(&block.m_line);
        for line in &block.lines {
            out.push(line);
        }
    }
    out.join("\n")
}

/// Validates a raw session description, repairing structural defects.
///
/// The pass is idempotent: feeding `fixed` back in returns it unchanged
/// with no errors. An already-valid description passes through intact.
pub fn validate_and_fix(raw: &str) -> SdpReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let normalized = raw.replace('\0', "").replace("\r\n", "\n").replace('\r', "\n");
    let mut parsed = classify(&normalized);

    ensure_session_line(&mut parsed.session, "v=", "v=0", 0, &mut errors);
    ensure_session_line(
        &mut parsed.session,
        "o=",
        "o=- 0 0 IN IP4 127.0.0.1",
        1,
        &mut errors,
    );
    ensure_session_line(&mut parsed.session, "s=", "s=-", 2, &mut errors);
    ensure_session_line(&mut parsed.session, "t=", "t=0 0", 3, &mut errors);

    for block in &mut parsed.media {
        strip_orphan_connection_lines(block, &mut errors);
    }

    if parsed.media.is_empty() {
        errors.push("no media sections present".to_string());
        parsed.media.push(synthetic_audio_block());
    }

    check_bundle_group(&parsed, &mut warnings);
    check_msid_semantic(&parsed, &mut warnings);

    let fixed = reassemble(&parsed);
    let valid = errors.is_empty();
    SdpReport {
        fixed,
        errors,
        warnings,
        valid,
    }
}

/// Hand-authored minimal description used when even the repaired input
/// cannot be applied. Structurally complete: one audio section and,
/// optionally, one video section, bundled transport attributes included.
pub fn minimal_description(kind: SdpKind, include_video: bool) -> String {
    let setup = match kind {
        SdpKind::Offer => "a=setup:actpass",
        SdpKind::Answer => "a=setup:active",
    };
    let mut lines = vec![
        "v=0".to_string(),
        "o=- 0 0 IN IP4 127.0.0.1".to_string(),
        "s=-".to_string(),
        "t=0 0".to_string(),
        "m=audio 9 UDP/TLS/RTP/SAVPF 111".to_string(),
        "c=IN IP4 0.0.0.0".to_string(),
        "a=rtcp:9 IN IP4 0.0.0.0".to_string(),
        "a=ice-ufrag:care".to_string(),
        "a=ice-pwd:carelinkcarelinkcarelink".to_string(),
        "a=fingerprint:sha-256 00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00".to_string(),
        setup.to_string(),
        "a=mid:0".to_string(),
        "a=sendrecv".to_string(),
        "a=rtcp-mux".to_string(),
        "a=rtpmap:111 opus/48000/2".to_string(),
        "a=fmtp:111 minptime=10;useinbandfec=1".to_string(),
    ];
    if include_video {
        lines.extend(
            [
                "m=video 9 UDP/TLS/RTP/SAVPF 96",
                "c=IN IP4 0.0.0.0",
                "a=rtcp:9 IN IP4 0.0.0.0",
                "a=ice-ufrag:care",
                "a=ice-pwd:carelinkcarelinkcarelink",
                "a=fingerprint:sha-256 00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00:00",
                setup,
                "a=mid:1",
                "a=sendrecv",
                "a=rtcp-mux",
                "a=rtcp-rsize",
                "a=rtpmap:96 VP8/90000",
                "a=rtcp-fb:96 nack",
                "a=rtcp-fb:96 nack pli",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "v=0\n\
        o=- 46117317 2 IN IP4 127.0.0.1\n\
        s=-\n\
        t=0 0\n\
        a=group:BUNDLE 0\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\n\
        c=IN IP4 0.0.0.0\n\
        a=mid:0\n\
        a=sendrecv";

    #[test]
    fn valid_description_passes_through_unchanged() {
        let report = validate_and_fix(VALID);
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
        assert_eq!(report.fixed, VALID);
    }

    #[test]
    fn missing_mandatory_lines_are_synthesized() {
        let report = validate_and_fix("m=audio 9 UDP/TLS/RTP/SAVPF 111\na=mid:0");
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 4);
        for prefix in ["v=", "o=", "s=", "t="] {
            assert!(
                report.fixed.lines().any(|l| l.starts_with(prefix)),
                "missing {prefix} in {}",
                report.fixed
            );
        }
        // Canonical ordering of the synthesized header.
        let lines: Vec<&str> = report.fixed.lines().collect();
        assert_eq!(lines[0], "v=0");
        assert!(lines[1].starts_with("o="));
        assert!(lines[2].starts_with("s="));
        assert!(lines[3].starts_with("t="));
    }

    #[test]
    fn zero_media_sections_get_a_synthetic_audio_block() {
        let report = validate_and_fix("v=0\no=- 0 0 IN IP4 127.0.0.1\ns=-\nt=0 0");
        assert!(!report.valid);
        assert!(report.fixed.contains("m=audio"));
    }

    #[test]
    fn empty_input_is_fully_synthesized() {
        let report = validate_and_fix("");
        assert!(!report.valid);
        assert!(report.fixed.starts_with("v=0"));
        assert!(report.fixed.contains("m=audio"));
        assert_eq!(report.errors.len(), 5);
    }

    #[test]
    fn orphaned_connection_lines_are_stripped() {
        let raw = "v=0\n\
            o=- 0 0 IN IP4 127.0.0.1\n\
            s=-\n\
            t=0 0\n\
            m=audio 9 UDP/TLS/RTP/SAVPF 111\n\
            c=IN IP4 0.0.0.0\n\
            a=mid:0\n\
            c=IN IP4 192.168.1.7";
        let report = validate_and_fix(raw);
        assert!(!report.valid);
        // Only the well-placed c= (directly under m=) survives.
        let orphans = report
            .fixed
            .lines()
            .zip(report.fixed.lines().skip(1))
            .filter(|(prev, line)| line.starts_with("c=") && !prev.starts_with("m="))
            .count();
        assert_eq!(orphans, 0, "fixed: {}", report.fixed);
        assert!(report.fixed.contains("c=IN IP4 0.0.0.0"));
        assert!(!report.fixed.contains("192.168.1.7"));
    }

    #[test]
    fn session_level_connection_line_is_kept() {
        let raw = "v=0\n\
            o=- 0 0 IN IP4 127.0.0.1\n\
            s=-\n\
            c=IN IP4 0.0.0.0\n\
            t=0 0\n\
            m=audio 9 UDP/TLS/RTP/SAVPF 111\n\
            a=mid:0";
        let report = validate_and_fix(raw);
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.fixed.contains("c=IN IP4 0.0.0.0"));
    }

    #[test]
    fn bundle_group_with_unknown_mid_warns_only() {
        let raw = "v=0\n\
            o=- 0 0 IN IP4 127.0.0.1\n\
            s=-\n\
            t=0 0\n\
            a=group:BUNDLE 0 1\n\
            m=audio 9 UDP/TLS/RTP/SAVPF 111\n\
            c=IN IP4 0.0.0.0\n\
            a=mid:0";
        let report = validate_and_fix(raw);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains('1'));
    }

    #[test]
    fn repair_is_idempotent() {
        let inputs = [
            "",
            VALID,
            "m=audio 9 UDP/TLS/RTP/SAVPF 111\nc=IN IP4 0.0.0.0\na=mid:0\nc=IN IP4 10.0.0.1",
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0",
        ];
        for raw in inputs {
            let once = validate_and_fix(raw);
            let twice = validate_and_fix(&once.fixed);
            assert_eq!(once.fixed, twice.fixed, "input: {raw:?}");
            assert!(twice.errors.is_empty(), "input: {raw:?}");
        }
    }

    #[test]
    fn null_bytes_and_crlf_are_normalized() {
        let raw = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\u{0}";
        let report = validate_and_fix(raw);
        assert!(report.valid);
        assert!(!report.fixed.contains('\r'));
        assert!(!report.fixed.contains('\u{0}'));
    }

    #[test]
    fn minimal_description_is_structurally_complete() {
        for kind in [SdpKind::Offer, SdpKind::Answer] {
            let audio = minimal_description(kind, false);
            let report = validate_and_fix(&audio);
            assert!(report.valid, "minimal audio failed: {:?}", report.errors);
            assert!(!audio.contains("m=video"));

            let video = minimal_description(kind, true);
            assert!(video.contains("m=video"));
            assert!(validate_and_fix(&video).valid);
        }
        assert!(minimal_description(SdpKind::Answer, false).contains("a=setup:active"));
    }
}
