use regex::{Regex, RegexBuilder};

/// Body assertion configured on a service: a literal substring, or a
/// `/pattern/flags` regular expression.
#[derive(Debug, Clone)]
pub enum ContentMatcher {
    Literal(String),
    Pattern(Regex),
}

const REGEX_FLAGS: &str = "gimsuxy";

impl ContentMatcher {
    pub fn parse(raw: &str) -> Result<Self, regex::Error> {
        if let Some((pattern, flags)) = split_regex_literal(raw) {
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(flags.contains('i'))
                .multi_line(flags.contains('m'))
                .dot_matches_new_line(flags.contains('s'))
                .ignore_whitespace(flags.contains('x'))
                .build()?;
            return Ok(ContentMatcher::Pattern(regex));
        }
        Ok(ContentMatcher::Literal(raw.to_string()))
    }

    pub fn matches(&self, body: &str) -> bool {
        match self {
            ContentMatcher::Literal(needle) => body.contains(needle.as_str()),
            ContentMatcher::Pattern(regex) => regex.is_match(body),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ContentMatcher::Literal(needle) => format!("\"{}\"", needle),
            ContentMatcher::Pattern(regex) => format!("/{}/", regex.as_str()),
        }
    }
}

/// `/pattern/flags` → (pattern, flags). Anything else is a literal.
fn split_regex_literal(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let (pattern, flags) = (&rest[..end], &rest[end + 1..]);
    if flags.chars().all(|c| REGEX_FLAGS.contains(c)) {
        Some((pattern, flags))
    } else {
        None
    }
}
