//! Helpers shared by the line-oriented directory document parsers

use base64::Engine;

use crate::directory::router::unix_seconds;
use crate::error::{Result, TorError};

/// Parse `YYYY-MM-DD HH:MM:SS` (UTC) into unix seconds
pub fn parse_timestamp(date: &str, time: &str) -> Result<u64> {
    let text = format!("{} {}", date, time);
    humantime::parse_rfc3339_weak(&text)
        .map(unix_seconds)
        .map_err(|e| TorError::ParseError(format!("bad timestamp {:?}: {}", text, e)))
}

/// Format unix seconds as `YYYY-MM-DD HH:MM:SS`
pub fn format_timestamp(secs: u64) -> String {
    let t = std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs);
    humantime::format_rfc3339_seconds(t)
        .to_string()
        .trim_end_matches('Z')
        .replacen('T', " ", 1)
}

/// Timestamp from the 2nd and 3rd words of a keyword line
pub fn keyword_timestamp(line: &str) -> Result<u64> {
    let mut parts = line.split_whitespace().skip(1);
    match (parts.next(), parts.next()) {
        (Some(date), Some(time)) => parse_timestamp(date, time),
        _ => Err(TorError::ParseError(format!("missing timestamp: {}", line))),
    }
}

/// Base64 that may or may not carry padding, as Tor documents mix both
pub fn decode_base64(s: &str) -> Result<Vec<u8>> {
    let trimmed = s.trim().trim_end_matches('=');
    base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(trimmed)
        .map_err(|e| TorError::ParseError(format!("bad base64: {}", e)))
}

/// Collect the body of a `-----BEGIN X-----` block that starts at the next line
///
/// Returns the decoded bytes; the iterator is left after the END line.
pub fn read_pem_block<'a, I>(lines: &mut I) -> Result<Vec<u8>>
where
    I: Iterator<Item = &'a str>,
{
    let begin = lines
        .next()
        .ok_or_else(|| TorError::ParseError("missing PEM block".into()))?;
    if !begin.trim().starts_with("-----BEGIN ") {
        return Err(TorError::ParseError(format!("expected PEM block, got {:?}", begin)));
    }
    let mut body = String::new();
    for line in lines.by_ref() {
        let line = line.trim();
        if line.starts_with("-----END ") {
            return decode_base64(&body);
        }
        body.push_str(line);
    }
    Err(TorError::ParseError("unterminated PEM block".into()))
}

/// Slice of `text` from its start through the end of `marker`
pub fn signed_portion<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    text.find(marker).map(|idx| &text[..idx + marker.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let secs = parse_timestamp("2024-03-01", "12:00:00").unwrap();
        assert_eq!(secs, 1_709_294_400);
        assert_eq!(format_timestamp(secs), "2024-03-01 12:00:00");
        assert_eq!(keyword_timestamp("valid-after 2024-03-01 12:00:00").unwrap(), secs);
        assert!(parse_timestamp("2024-13-01", "00:00:00").is_err());
    }

    #[test]
    fn test_base64_padding_agnostic() {
        assert_eq!(decode_base64("aGVsbG8").unwrap(), b"hello");
        assert_eq!(decode_base64("aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn test_pem_block() {
        let text = "-----BEGIN RSA PUBLIC KEY-----\naGVs\nbG8=\n-----END RSA PUBLIC KEY-----\nnext";
        let mut lines = text.lines();
        assert_eq!(read_pem_block(&mut lines).unwrap(), b"hello");
        assert_eq!(lines.next(), Some("next"));
    }

    #[test]
    fn test_signed_portion() {
        let text = "a\nb\ndirectory-signature xyz\n";
        assert_eq!(
            signed_portion(text, "\ndirectory-signature "),
            Some("a\nb\ndirectory-signature ")
        );
    }
}
