use anyhow::{bail, Context, Result};
use regex::Regex;

use super::LineParser;
use crate::Record;

/// Extracts fields from a line using a regular expression with named capture groups.
///
/// The pattern is used as written: it is not anchored, so a pattern that only covers the start
/// of a line still yields the fields it captures. Groups that do not take part in the match are
/// left out of the record.
#[derive(Debug, Clone)]
pub struct RegexParser {
    regex: Regex,
    group_names: Vec<String>,
}

impl RegexParser {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex =
            Regex::new(pattern).with_context(|| format!("invalid line pattern {pattern:?}"))?;

        let group_names: Vec<String> = regex
            .capture_names()
            .flatten()
            .map(str::to_string)
            .collect();

        if group_names.is_empty() {
            bail!("line pattern {pattern:?} has no named capture groups (use (?P<name>...))");
        }

        Ok(Self { regex, group_names })
    }

    pub fn group_names(&self) -> &[String] {
        &self.group_names
    }
}

impl LineParser for RegexParser {
    fn parse(&self, line: &str) -> Option<Record> {
        let captures = self.regex.captures(line)?;

        let mut record = Record::with_capacity(self.group_names.len());
        for name in &self.group_names {
            if let Some(m) = captures.name(name) {
                record.insert(name.clone(), m.as_str().to_string());
            }
        }
        Some(record)
    }
}
