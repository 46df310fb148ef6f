use super::model::{BlockHeader, ConfigElement, Directive, HostBlock, KeyValue, SshConfigFile, unquote};

/// A syntax error found while decoding a config file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    /// 1-based line number.
    pub line: usize,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("line continuation is not supported")]
    OrphanedContinuation,
    #[error("directive has no keyword")]
    MissingKeyword,
    #[error("Host requires at least one pattern")]
    MissingHostPattern,
}

/// A directive split into its parts, with the value's byte range in the raw line.
struct RawDirective<'a> {
    key: &'a str,
    value: &'a str,
    value_start: usize,
}

impl SshConfigFile {
    /// Parse SSH config content.
    /// Preserves all formatting, comments, and unknown directives for round-trip fidelity.
    pub fn parse_content(content: &str) -> Result<Self, ParseError> {
        let (lines, crlf) = Self::split_lines(content);
        let mut elements = Vec::new();
        let mut current_block: Option<HostBlock> = None;

        for (idx, line) in lines.into_iter().enumerate() {
            let line_no = idx + 1;
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                match current_block {
                    Some(ref mut block) => block.directives.push(Directive::Other(line.to_string())),
                    None => elements.push(ConfigElement::GlobalLine(line.to_string())),
                }
                continue;
            }

            if trimmed.ends_with('\\') {
                return Err(ParseError {
                    line: line_no,
                    kind: ParseErrorKind::OrphanedContinuation,
                });
            }

            let raw = Self::parse_directive(line).map_err(|kind| ParseError { line: line_no, kind })?;

            // A Host or Match keyword starts a new block and flushes the previous one
            if let Some(header) = Self::parse_header(&raw).map_err(|kind| ParseError { line: line_no, kind })? {
                if let Some(block) = current_block.take() {
                    elements.push(ConfigElement::Block(block));
                }
                current_block = Some(HostBlock {
                    header,
                    raw_header_line: line.to_string(),
                    directives: Vec::new(),
                });
                continue;
            }

            match current_block {
                Some(ref mut block) => block.directives.push(Directive::KeyValue(KeyValue {
                    key: raw.key.to_string(),
                    value: raw.value.to_string(),
                    raw_line: line.to_string(),
                    value_range: raw.value_start..raw.value_start + raw.value.len(),
                })),
                // Global directive (before any Host block), never rewritten
                None => elements.push(ConfigElement::GlobalLine(line.to_string())),
            }
        }

        if let Some(block) = current_block {
            elements.push(ConfigElement::Block(block));
        }

        Ok(SshConfigFile {
            elements,
            crlf,
            trailing_newline: content.ends_with('\n'),
        })
    }

    /// Split into lines without terminators. CRLF is only stripped when every line
    /// uses it; otherwise a stray `\r` stays in the raw line so output is byte-identical.
    fn split_lines(content: &str) -> (Vec<&str>, bool) {
        if content.is_empty() {
            return (Vec::new(), false);
        }
        let newlines = content.matches('\n').count();
        let crlf = newlines > 0 && content.matches("\r\n").count() == newlines;
        let terminated = content.ends_with('\n');
        let body = content.strip_suffix('\n').unwrap_or(content);
        let pieces: Vec<&str> = body.split('\n').collect();
        let last = pieces.len() - 1;
        let lines = pieces
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                if crlf && (terminated || i < last) {
                    line.strip_suffix('\r').unwrap_or(line)
                } else {
                    line
                }
            })
            .collect();
        (lines, crlf)
    }

    /// Recognize a "Host <patterns>" or "Match <criteria>" line.
    fn parse_header(raw: &RawDirective<'_>) -> Result<Option<BlockHeader>, ParseErrorKind> {
        // "HostName" is a different keyword, so exact comparison is enough
        if raw.key.eq_ignore_ascii_case("host") {
            let patterns: Vec<String> = raw
                .value
                .split_whitespace()
                .map(|p| unquote(p).to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if patterns.is_empty() {
                return Err(ParseErrorKind::MissingHostPattern);
            }
            return Ok(Some(BlockHeader::Host(patterns)));
        }
        if raw.key.eq_ignore_ascii_case("match") {
            return Ok(Some(BlockHeader::Match(raw.value.to_string())));
        }
        Ok(None)
    }

    /// Parse a "Key Value" directive line.
    /// SSH config format: `Key Value`, `Key=Value` or `Key = Value`, with either spaces or tabs.
    fn parse_directive(line: &str) -> Result<RawDirective<'_>, ParseErrorKind> {
        let key_start = line.len() - line.trim_start().len();
        let rest = &line[key_start..];
        let key_len = rest
            .find(|c: char| c.is_whitespace() || c == '=')
            .unwrap_or(rest.len());
        if key_len == 0 {
            return Err(ParseErrorKind::MissingKeyword);
        }
        let key = &rest[..key_len];

        // Separator: whitespace, at most one '=', whitespace
        let mut pos = key_start + key_len;
        pos += Self::leading_whitespace(&line[pos..]);
        if line[pos..].starts_with('=') {
            pos += 1;
            pos += Self::leading_whitespace(&line[pos..]);
        }
        let value_start = pos;

        // Value runs until an inline comment (# preceded by whitespace) outside quotes
        let mut in_quote = false;
        let mut prev_whitespace = true;
        let mut end = line.len();
        for (i, c) in line[value_start..].char_indices() {
            match c {
                '"' => in_quote = !in_quote,
                '#' if !in_quote && prev_whitespace => {
                    end = value_start + i;
                    break;
                }
                _ => {}
            }
            prev_whitespace = c.is_whitespace();
        }
        if in_quote {
            return Err(ParseErrorKind::UnterminatedQuote);
        }

        Ok(RawDirective {
            key,
            value: line[value_start..end].trim_end(),
            value_start,
        })
    }

    fn leading_whitespace(s: &str) -> usize {
        s.len() - s.trim_start().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(content: &str) -> SshConfigFile {
        SshConfigFile::parse_content(content).unwrap()
    }

    fn block(config: &SshConfigFile, idx: usize) -> &HostBlock {
        match &config.elements[idx] {
            ConfigElement::Block(block) => block,
            other => panic!("Expected Block, got {:?}", other),
        }
    }

    fn key_value(block: &HostBlock, idx: usize) -> &KeyValue {
        match &block.directives[idx] {
            Directive::KeyValue(kv) => kv,
            other => panic!("Expected KeyValue, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_config() {
        let config = parse_str("");
        assert!(config.elements.is_empty());
        assert!(!config.trailing_newline);
    }

    #[test]
    fn test_basic_host() {
        let config = parse_str("Host github.com\n  HostName github.com\n  User git\n  IdentityFile ~/.ssh/id_work\n");
        let b = block(&config, 0);
        assert_eq!(b.header, BlockHeader::Host(vec!["github.com".to_string()]));
        assert_eq!(b.directives.len(), 3);
        assert_eq!(key_value(b, 1).key, "User");
        assert_eq!(key_value(b, 1).value, "git");
        assert_eq!(key_value(b, 2).value, "~/.ssh/id_work");
    }

    #[test]
    fn test_multiple_hosts() {
        let content = "\
Host alpha
  User deploy

Host beta gamma
  User root
";
        let config = parse_str(content);
        assert_eq!(config.blocks().count(), 2);
        assert_eq!(
            block(&config, 1).header,
            BlockHeader::Host(vec!["beta".to_string(), "gamma".to_string()])
        );
        // The blank separator belongs to the first block
        assert_eq!(block(&config, 0).directives[1], Directive::Other(String::new()));
    }

    #[test]
    fn test_comments_preserved() {
        let content = "\
# Global comment
Host myserver
  # This is a comment
  HostName 10.0.0.1
";
        let config = parse_str(content);
        assert!(matches!(&config.elements[0], ConfigElement::GlobalLine(s) if s == "# Global comment"));
        assert_eq!(
            block(&config, 1).directives[0],
            Directive::Other("  # This is a comment".to_string())
        );
    }

    #[test]
    fn test_global_directives_are_lines() {
        let config = parse_str("IdentityFile ~/.ssh/global\nInclude config.d/*\n\nHost a\n  User x\n");
        assert!(matches!(&config.elements[0], ConfigElement::GlobalLine(s) if s == "IdentityFile ~/.ssh/global"));
        assert!(matches!(&config.elements[1], ConfigElement::GlobalLine(s) if s == "Include config.d/*"));
        assert!(matches!(&config.elements[3], ConfigElement::Block(_)));
    }

    #[test]
    fn test_equals_separator() {
        let config = parse_str("Host=github.com\n  User = git\n  IdentityFile=~/.ssh/id\n");
        let b = block(&config, 0);
        assert!(b.matches("github.com"));
        assert_eq!(key_value(b, 0).value, "git");
        assert_eq!(key_value(b, 0).value_range, 9..12);
        assert_eq!(key_value(b, 1).value, "~/.ssh/id");
    }

    #[test]
    fn test_inline_comment_excluded_from_value() {
        let config = parse_str("Host a\n  User git # personal\n");
        let kv = key_value(block(&config, 0), 0);
        assert_eq!(kv.value, "git");
        assert_eq!(kv.raw_line, "  User git # personal");
    }

    #[test]
    fn test_hash_inside_quotes_is_value() {
        let config = parse_str("Host a\n  IdentityFile \"~/keys/#1 key\"\n");
        assert_eq!(key_value(block(&config, 0), 0).unquoted_value(), "~/keys/#1 key");
    }

    #[test]
    fn test_host_with_tab_separator() {
        let config = parse_str("Host\tmyserver\n\tUser\tadmin\n");
        let b = block(&config, 0);
        assert!(b.matches("myserver"));
        assert_eq!(key_value(b, 0).value, "admin");
    }

    #[test]
    fn test_hostname_not_confused_with_host() {
        let config = parse_str("Host myserver\n  HostName example.com\n");
        assert_eq!(config.blocks().count(), 1);
        assert_eq!(key_value(block(&config, 0), 0).key, "HostName");
    }

    #[test]
    fn test_match_ends_host_block() {
        let config = parse_str("Host a\n  User x\nMatch host b exec true\n  User y\n");
        assert_eq!(block(&config, 0).directives.len(), 1);
        assert_eq!(
            block(&config, 1).header,
            BlockHeader::Match("host b exec true".to_string())
        );
    }

    #[test]
    fn test_crlf_detected() {
        let config = parse_str("Host a\r\n  User x\r\n");
        assert!(config.crlf);
        assert_eq!(key_value(block(&config, 0), 0).value, "x");
    }

    #[test]
    fn test_unicode_comment_no_panic() {
        let content = "# abcde\u{00e9} test\n\nHost myserver\n  User \u{3042}\u{3042}\n";
        let config = parse_str(content);
        assert_eq!(key_value(block(&config, 2), 0).value, "\u{3042}\u{3042}");
    }

    #[test]
    fn test_unterminated_quote() {
        let err = SshConfigFile::parse_content("Host a\n  IdentityFile \"~/.ssh/id\n").unwrap_err();
        assert_eq!(
            err,
            ParseError {
                line: 2,
                kind: ParseErrorKind::UnterminatedQuote
            }
        );
        assert_eq!(err.to_string(), "line 2: unterminated quote");
    }

    #[test]
    fn test_orphaned_continuation() {
        let err = SshConfigFile::parse_content("Host a\n  User git \\\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::OrphanedContinuation);
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_comment_ending_in_backslash_is_fine() {
        assert!(SshConfigFile::parse_content("# C:\\keys\\\nHost a\n").is_ok());
    }

    #[test]
    fn test_missing_keyword() {
        let err = SshConfigFile::parse_content("Host a\n  = value\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MissingKeyword);
    }

    #[test]
    fn test_host_without_pattern() {
        let err = SshConfigFile::parse_content("Host\n  User x\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MissingHostPattern);
        assert_eq!(err.line, 1);
    }
}
