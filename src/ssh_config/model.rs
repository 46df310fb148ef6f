use std::ops::Range;

use glob::{MatchOptions, Pattern};

/// Represents the entire SSH config file as a sequence of elements.
/// Preserves the original structure for round-trip fidelity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshConfigFile {
    pub elements: Vec<ConfigElement>,
    /// Whether the original file used CRLF line endings.
    pub crlf: bool,
    /// Whether the original file ended with a line terminator.
    pub trailing_newline: bool,
}

/// A single element in the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigElement {
    /// A Host or Match block: the header line plus every line up to the next header.
    Block(HostBlock),
    /// A comment, blank line, or global directive not inside a block.
    GlobalLine(String),
}

/// The line that opens a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockHeader {
    /// `Host` followed by one or more patterns (quotes stripped).
    Host(Vec<String>),
    /// `Match` criteria, kept verbatim. Never selected by host-name matching.
    Match(String),
}

/// A parsed block with its directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBlock {
    pub header: BlockHeader,
    /// The original raw header line for faithful reproduction.
    pub raw_header_line: String,
    pub directives: Vec<Directive>,
}

/// A line inside a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    KeyValue(KeyValue),
    /// Comment, blank line, or anything else kept verbatim.
    Other(String),
}

/// A `Key Value` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The directive key as written (e.g., "IdentityFile", "user").
    pub key: String,
    /// The value token as written, quotes included.
    pub value: String,
    /// The original raw line (preserves indentation, separator, inline comments).
    pub raw_line: String,
    /// Byte range of `value` inside `raw_line`.
    pub value_range: Range<usize>,
}

impl KeyValue {
    /// Case-insensitive key comparison, as ssh does.
    pub fn is_key(&self, key: &str) -> bool {
        self.key.eq_ignore_ascii_case(key)
    }

    /// The value with surrounding double quotes removed.
    pub fn unquoted_value(&self) -> &str {
        unquote(&self.value)
    }

    /// Replace the value bytes in place. Everything around them is untouched.
    /// Returns false when the value was already equal.
    pub fn set_value(&mut self, value: &str) -> bool {
        let token = quote_if_needed(value);
        if self.value == token || self.unquoted_value() == value {
            return false;
        }
        // A bare "Key" line has no separator to put the value after
        let bare = self.value.is_empty()
            && !self.raw_line[..self.value_range.start].ends_with(|c: char| c.is_whitespace() || c == '=');
        let start = self.value_range.start + usize::from(bare);
        let replacement = if bare { format!(" {}", token) } else { token.clone() };
        self.raw_line.replace_range(self.value_range.clone(), &replacement);
        self.value_range = start..start + token.len();
        self.value = token;
        true
    }
}

impl Directive {
    /// The line exactly as it will be written out.
    pub fn raw_line(&self) -> &str {
        match self {
            Directive::KeyValue(kv) => &kv.raw_line,
            Directive::Other(line) => line,
        }
    }
}

impl HostBlock {
    /// Whether this block applies to `name` under OpenSSH pattern-list rules:
    /// a matching negated pattern vetoes the block, otherwise any positive match selects it.
    pub fn matches(&self, name: &str) -> bool {
        let patterns = match &self.header {
            BlockHeader::Host(patterns) => patterns,
            BlockHeader::Match(_) => return false,
        };
        let mut found = false;
        for pattern in patterns {
            if let Some(negated) = pattern.strip_prefix('!') {
                if match_pattern(name, negated) {
                    return false;
                }
            } else if match_pattern(name, pattern) {
                found = true;
            }
        }
        found
    }

    /// Iterate the key/value directives with the given key.
    pub fn key_values_mut<'a>(
        &'a mut self,
        key: &'a str,
    ) -> impl Iterator<Item = &'a mut KeyValue> {
        self.directives.iter_mut().filter_map(move |d| match d {
            Directive::KeyValue(kv) if kv.is_key(key) => Some(kv),
            _ => None,
        })
    }

    /// Whether the block carries at least one directive with the given key.
    pub fn has_key(&self, key: &str) -> bool {
        self.directives
            .iter()
            .any(|d| matches!(d, Directive::KeyValue(kv) if kv.is_key(key)))
    }

    /// Display form of the header patterns (e.g. "github.com gist.github.com").
    pub fn label(&self) -> String {
        match &self.header {
            BlockHeader::Host(patterns) => patterns.join(" "),
            BlockHeader::Match(criteria) => format!("Match {}", criteria),
        }
    }
}

impl SshConfigFile {
    /// All Host blocks that apply to `name`, in file order.
    pub fn matching_blocks_mut<'a>(
        &'a mut self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a mut HostBlock> {
        self.elements.iter_mut().filter_map(move |e| match e {
            ConfigElement::Block(block) if block.matches(name) => Some(block),
            _ => None,
        })
    }

    /// Read-only view of every block.
    pub fn blocks(&self) -> impl Iterator<Item = &HostBlock> {
        self.elements.iter().filter_map(|e| match e {
            ConfigElement::Block(block) => Some(block),
            _ => None,
        })
    }
}

/// Match a single ssh wildcard pattern (`*` and `?`) against a host name, case-insensitively.
pub fn match_pattern(name: &str, pattern: &str) -> bool {
    // Only `*` and `?` are special to ssh. Escape everything glob would
    // otherwise interpret (brackets) and then re-enable the two wildcards.
    let escaped = Pattern::escape(pattern)
        .replace("[*]", "*")
        .replace("[?]", "?");
    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    match Pattern::new(&escaped) {
        Ok(p) => p.matches_with(name, options),
        Err(_) => pattern.eq_ignore_ascii_case(name),
    }
}

pub(crate) fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn quote_if_needed(value: &str) -> String {
    // A leading '#' would read back as a comment and a leading '=' as the separator
    if value.chars().any(char::is_whitespace) || value.starts_with(['#', '=']) {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}
