//! Bounded header field scanners.
//!
//! The extractors below replace ad hoc format-string parsing with small
//! dedicated scans: every scan is bounded by the header block it is
//! given, and every failure is an explicit `None`. No full header
//! grammar is implemented; this layer only digs out the handful of
//! fields the framing and upload code needs.

/// Longest accepted multipart boundary token, in bytes.
pub const MAX_BOUNDARY_LEN: usize = 100;

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.eq_ignore_ascii_case(y))
}

/// Splits a header block into lines, tolerating both CRLF and bare LF.
fn lines(head: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    head.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

/// Finds the value of header `name` (case-insensitive) in a header
/// block, with surrounding whitespace trimmed. The first matching line
/// wins.
pub fn header_value<'a>(head: &'a [u8], name: &str) -> Option<&'a [u8]> {
    for line in lines(head) {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if eq_ignore_case(&line[..colon], name.as_bytes()) {
            let mut value = &line[colon + 1..];
            while matches!(value.first(), Some(&(b' ' | b'\t'))) {
                value = &value[1..];
            }
            while matches!(value.last(), Some(&(b' ' | b'\t'))) {
                value = &value[..value.len() - 1];
            }
            return Some(value);
        }
    }
    None
}

/// Parses the declared body length from a header block. `None` when the
/// header is absent or not a valid non-negative number.
pub fn content_length(head: &[u8]) -> Option<i64> {
    let value = header_value(head, "Content-Length")?;
    let text = std::str::from_utf8(value).ok()?;
    let n: i64 = text.parse().ok()?;
    if n < 0 {
        return None;
    }
    Some(n)
}

/// Extracts the multipart boundary token from a Content-Type value.
///
/// Accepts both `boundary="token"` and `boundary=token` forms
/// (case-insensitive parameter name). Empty tokens and tokens longer
/// than [`MAX_BOUNDARY_LEN`] are rejected.
pub fn boundary_token(content_type: &[u8]) -> Option<&[u8]> {
    let needle = b"boundary=";
    let at = content_type
        .windows(needle.len())
        .position(|w| eq_ignore_case(w, needle))?;
    let rest = &content_type[at + needle.len()..];

    let token = if let Some(quoted) = rest.strip_prefix(b"\"") {
        let end = quoted.iter().position(|&b| b == b'"')?;
        &quoted[..end]
    } else {
        let end = rest
            .iter()
            .position(|&b| b == b';' || b == b' ' || b == b'\t')
            .unwrap_or(rest.len());
        &rest[..end]
    };

    if token.is_empty() || token.len() > MAX_BOUNDARY_LEN {
        return None;
    }
    Some(token)
}

/// Extracts the declared filename from a part's header block.
///
/// The legacy extractor this mirrors only matched `filename=` as the
/// third whitespace-delimited field of a Content-Disposition line; a
/// filename parameter found anywhere else on such a line is still
/// accepted, but flagged in the log so the deviation is visible.
pub fn filename(part_head: &[u8]) -> Option<String> {
    for line in lines(part_head) {
        if !starts_with_ignore_case(line, b"Content-Disposition:") {
            continue;
        }
        let Some(at) = find_ignore_case(line, b"filename=\"") else {
            continue;
        };
        let value = &line[at + b"filename=\"".len()..];
        let end = value.iter().position(|&b| b == b'"')?;
        let name = String::from_utf8_lossy(&value[..end]).into_owned();

        if !legacy_field_position(line, at) {
            log::warn!("filename parameter outside the expected field position: {:?}", name);
        }
        return Some(name);
    }
    None
}

fn starts_with_ignore_case(line: &[u8], prefix: &[u8]) -> bool {
    line.len() >= prefix.len() && eq_ignore_case(&line[..prefix.len()], prefix)
}

fn find_ignore_case(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| eq_ignore_case(w, needle))
}

/// True when `filename=` sits where the legacy 3-field scan expected
/// it: as the third whitespace-delimited field of the line.
fn legacy_field_position(line: &[u8], filename_at: usize) -> bool {
    let mut fields = 0;
    let mut in_field = false;
    for (i, &b) in line.iter().enumerate() {
        let ws = b == b' ' || b == b'\t';
        if !ws && !in_field {
            fields += 1;
            in_field = true;
            if i == filename_at {
                return fields == 4;
            }
        } else if ws {
            in_field = false;
        }
        if i == filename_at {
            return false;
        }
    }
    false
}

/// Reduces a declared filename to its final path segment, discarding
/// any directory components in both separator conventions. Security
/// relevant: this is what confines uploads to the destination
/// directory.
pub fn sanitize_filename(name: &str) -> &str {
    match name.rsplit(['/', '\\']).next() {
        Some(last) => last,
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: &[u8] = b"POST /u HTTP/1.1\r\n\
        Host: example\r\n\
        content-type: multipart/form-data; boundary=xyz\r\n\
        Content-Length: 42\r\n\r\n";

    #[test]
    fn test_header_value_case_insensitive() {
        assert_eq!(header_value(HEAD, "Content-Type").unwrap(), b"multipart/form-data; boundary=xyz");
        assert_eq!(header_value(HEAD, "HOST").unwrap(), b"example");
        assert!(header_value(HEAD, "Cookie").is_none());
    }

    #[test]
    fn test_content_length() {
        assert_eq!(content_length(HEAD), Some(42));
        assert_eq!(content_length(b"Content-Length: -1\r\n\r\n"), None);
        assert_eq!(content_length(b"Content-Length: abc\r\n\r\n"), None);
        assert_eq!(content_length(b"Host: x\r\n\r\n"), None);
    }

    #[test]
    fn test_boundary_token_bare_and_quoted() {
        assert_eq!(boundary_token(b"multipart/form-data; boundary=xyz").unwrap(), b"xyz");
        assert_eq!(
            boundary_token(b"multipart/form-data; boundary=\"a b\"; charset=utf-8").unwrap(),
            b"a b"
        );
        assert_eq!(
            boundary_token(b"multipart/form-data; Boundary=----WebKitFormBoundaryRVr").unwrap(),
            b"----WebKitFormBoundaryRVr"
        );
        assert_eq!(boundary_token(b"multipart/form-data; boundary=abc; x=y").unwrap(), b"abc");
    }

    #[test]
    fn test_boundary_token_rejects_empty_and_oversized() {
        assert!(boundary_token(b"multipart/form-data").is_none());
        assert!(boundary_token(b"multipart/form-data; boundary=").is_none());
        assert!(boundary_token(b"multipart/form-data; boundary=\"\"").is_none());
        let long = format!("multipart/form-data; boundary={}", "b".repeat(101));
        assert!(boundary_token(long.as_bytes()).is_none());
        let max = format!("multipart/form-data; boundary={}", "b".repeat(100));
        assert_eq!(boundary_token(max.as_bytes()).unwrap().len(), 100);
    }

    #[test]
    fn test_filename_first_line_wins() {
        let part = b"Content-Disposition: form-data; name=\"f\"; filename=\"a.png\"\r\n\
            Content-Type: image/png\r\n\r\n";
        assert_eq!(filename(part).unwrap(), "a.png");
    }

    #[test]
    fn test_filename_nonstandard_position_still_found() {
        let part = b"Content-Disposition: form-data; filename=\"late.bin\"\r\n\r\n";
        assert_eq!(filename(part).unwrap(), "late.bin");
    }

    #[test]
    fn test_filename_absent() {
        let part = b"Content-Disposition: form-data; name=\"field\"\r\n\r\n";
        assert!(filename(part).is_none());
        assert!(filename(b"Content-Type: text/plain\r\n\r\n").is_none());
    }

    #[test]
    fn test_sanitize_filename_strips_traversal() {
        assert_eq!(sanitize_filename("../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("..\\..\\x"), "x");
        assert_eq!(sanitize_filename("name.png"), "name.png");
        assert_eq!(sanitize_filename("/abs/path/f.txt"), "f.txt");
        assert_eq!(sanitize_filename("mixed\\sep/last.bin"), "last.bin");
        assert_eq!(sanitize_filename("dir/"), "");
    }
}
