use crate::Record;

pub mod regex;

pub use self::regex::RegexParser;

/// Turns one complete log line into a record of named string fields.
///
/// Tailers call `parse` once per non-empty line, after the line terminator (and an optional
/// carriage return) has been stripped. Returning `None` means the line did not match; tailers
/// skip such lines without treating them as errors.
///
/// # Examples
///
/// ```
/// use logtail_agent::parsers::{LineParser, RegexParser};
///
/// let parser = RegexParser::new(r"^(?P<level>\w+) (?P<message>.*)").unwrap();
/// let record = parser.parse("INFO hello").unwrap();
/// assert_eq!(record["level"], "INFO");
/// assert!(parser.parse("").is_none());
/// ```
pub trait LineParser: Send + Sync {
    fn parse(&self, line: &str) -> Option<Record>;
}

/// Creates a preview of a line for log output, truncated at `limit` characters.
pub(crate) fn line_preview(line: &str, limit: usize) -> String {
    let mut preview = String::new();
    for (idx, ch) in line.chars().enumerate() {
        if idx >= limit {
            preview.push('…');
            return preview;
        }
        preview.push(ch);
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_preview_truncates_long_lines() {
        assert_eq!(line_preview("short", 10), "short");
        assert_eq!(line_preview("abcdefgh", 3), "abc…");
    }
}
