//! Parser for `Authentication-Results` header values (RFC 8601).
//!
//! Only the subset needed to read back verdicts written by a local verifier is
//! supported: the authserv-id with an optional version, `;` separated result
//! statements made of `method=result` followed by `ptype.property=value`
//! pairs. Comments are dropped before tokenizing.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing authserv-id")]
    MissingIdentifier,
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),
    #[error("malformed authserv-id: {0}")]
    MalformedIdentifier(String),
    #[error("malformed authentication method and value: {0}")]
    MalformedResult(String),
    #[error("unterminated comment")]
    UnterminatedComment,
    #[error("unterminated quoted string")]
    UnterminatedQuote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultValue {
    None,
    Pass,
    Fail,
    Policy,
    Neutral,
    TempError,
    PermError,
    SoftFail,
    HardFail,
    Other(String),
}

impl ResultValue {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "none" => ResultValue::None,
            "pass" => ResultValue::Pass,
            "fail" => ResultValue::Fail,
            "policy" => ResultValue::Policy,
            "neutral" => ResultValue::Neutral,
            "temperror" => ResultValue::TempError,
            "permerror" => ResultValue::PermError,
            "softfail" => ResultValue::SoftFail,
            "hardfail" => ResultValue::HardFail,
            other => ResultValue::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ResultValue::None => "none",
            ResultValue::Pass => "pass",
            ResultValue::Fail => "fail",
            ResultValue::Policy => "policy",
            ResultValue::Neutral => "neutral",
            ResultValue::TempError => "temperror",
            ResultValue::PermError => "permerror",
            ResultValue::SoftFail => "softfail",
            ResultValue::HardFail => "hardfail",
            ResultValue::Other(value) => value,
        }
    }
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One result statement of an `Authentication-Results` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Auth {
        value: ResultValue,
        reason: Option<String>,
        auth: Option<String>,
        mail_from: Option<String>,
    },
    Dkim {
        value: ResultValue,
        reason: Option<String>,
        domain: Option<String>,
        identifier: Option<String>,
        selector: Option<String>,
        algorithm: Option<String>,
    },
    DomainKeys {
        value: ResultValue,
        reason: Option<String>,
        domain: Option<String>,
        from: Option<String>,
        sender: Option<String>,
    },
    Iprev {
        value: ResultValue,
        reason: Option<String>,
        policy_iprev: Option<String>,
    },
    Spf {
        value: ResultValue,
        reason: Option<String>,
        from: Option<String>,
        helo: Option<String>,
    },
    Dmarc {
        value: ResultValue,
        reason: Option<String>,
        from: Option<String>,
    },
    Generic {
        method: String,
        value: ResultValue,
        params: BTreeMap<String, String>,
    },
}

impl AuthResult {
    pub fn method(&self) -> &str {
        match self {
            AuthResult::Auth { .. } => "auth",
            AuthResult::Dkim { .. } => "dkim",
            AuthResult::DomainKeys { .. } => "domainkeys",
            AuthResult::Iprev { .. } => "iprev",
            AuthResult::Spf { .. } => "spf",
            AuthResult::Dmarc { .. } => "dmarc",
            AuthResult::Generic { method, .. } => method,
        }
    }

    pub fn value(&self) -> &ResultValue {
        match self {
            AuthResult::Auth { value, .. }
            | AuthResult::Dkim { value, .. }
            | AuthResult::DomainKeys { value, .. }
            | AuthResult::Iprev { value, .. }
            | AuthResult::Spf { value, .. }
            | AuthResult::Dmarc { value, .. }
            | AuthResult::Generic { value, .. } => value,
        }
    }

    fn build(method: String, value: ResultValue, mut params: BTreeMap<String, String>) -> Self {
        let reason = params.remove("reason");
        match method.as_str() {
            "auth" => AuthResult::Auth {
                value,
                reason,
                auth: params.remove("smtp.auth"),
                mail_from: params.remove("smtp.mailfrom"),
            },
            "dkim" => AuthResult::Dkim {
                value,
                reason,
                domain: params.remove("header.d"),
                identifier: params.remove("header.i"),
                selector: params.remove("header.s"),
                algorithm: params.remove("header.a"),
            },
            "domainkeys" => AuthResult::DomainKeys {
                value,
                reason,
                domain: params.remove("header.d"),
                from: params.remove("header.from"),
                sender: params.remove("header.sender"),
            },
            "iprev" => AuthResult::Iprev {
                value,
                reason,
                policy_iprev: params.remove("policy.iprev"),
            },
            "spf" => AuthResult::Spf {
                value,
                reason,
                from: params.remove("smtp.mailfrom"),
                helo: params.remove("smtp.helo"),
            },
            "dmarc" => AuthResult::Dmarc {
                value,
                reason,
                from: params.remove("header.from"),
            },
            _ => {
                if let Some(reason) = reason {
                    params.insert("reason".to_string(), reason);
                }
                AuthResult::Generic {
                    method,
                    value,
                    params,
                }
            }
        }
    }
}

/// Parses an `Authentication-Results` header value into its authserv-id and
/// result statements.
pub fn parse(value: &str) -> Result<(String, Vec<AuthResult>), ParseError> {
    let cleaned = strip_comments(value)?;
    let segments = split_statements(&cleaned);

    let mut segments = segments.iter().map(|s| s.trim());
    let identifier = parse_identifier(segments.next().unwrap_or_default())?;

    let mut results = Vec::new();
    for segment in segments {
        if segment.is_empty() || segment.eq_ignore_ascii_case("none") {
            continue;
        }
        results.push(parse_result(segment)?);
    }

    Ok((identifier, results))
}

fn parse_identifier(segment: &str) -> Result<String, ParseError> {
    let mut words = segment.split_whitespace();
    let identifier = words.next().ok_or(ParseError::MissingIdentifier)?;
    if let Some(version) = words.next() {
        if version != "1" {
            return Err(ParseError::UnsupportedVersion(version.to_string()));
        }
    }
    if words.next().is_some() {
        return Err(ParseError::MalformedIdentifier(segment.to_string()));
    }
    Ok(identifier.to_string())
}

fn parse_result(segment: &str) -> Result<AuthResult, ParseError> {
    let tokens = tokenize(segment)?;
    let mut tokens = tokens.into_iter();

    let first = tokens.next().unwrap_or_default();
    let (method, value) = split_param(&first)
        .filter(|(method, value)| !method.is_empty() && !value.is_empty())
        .ok_or_else(|| ParseError::MalformedResult(segment.to_string()))?;
    let method = method.to_ascii_lowercase();
    let value = ResultValue::parse(&value);

    let mut params = BTreeMap::new();
    for token in tokens {
        // Bare words (e.g. trailing "none" or free text) carry no property.
        if let Some((key, value)) = split_param(&token) {
            params.insert(key.to_ascii_lowercase(), value);
        }
    }

    Ok(AuthResult::build(method, value, params))
}

fn split_param(token: &str) -> Option<(String, String)> {
    let (key, value) = token.split_once('=')?;
    Some((key.trim().to_string(), value.trim().to_string()))
}

/// Removes RFC 5322 comments, which may nest, leaving quoted strings intact.
fn strip_comments(value: &str) -> Result<String, ParseError> {
    let mut out = String::with_capacity(value.len());
    let mut depth = 0usize;
    let mut quoted = false;
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted || depth > 0 => {
                let escaped = chars.next();
                if depth == 0 {
                    out.push(c);
                    if let Some(escaped) = escaped {
                        out.push(escaped);
                    }
                }
            }
            '"' if depth == 0 => {
                quoted = !quoted;
                out.push(c);
            }
            '(' if !quoted => depth += 1,
            ')' if !quoted && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    out.push(' ');
                }
            }
            _ if depth > 0 => {}
            _ => out.push(c),
        }
    }

    if depth > 0 {
        return Err(ParseError::UnterminatedComment);
    }
    if quoted {
        return Err(ParseError::UnterminatedQuote);
    }
    Ok(out)
}

fn split_statements(value: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                current.push(c);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ';' if !quoted => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// Splits a result statement into `key=value` words. Whitespace around `=` is
/// folded and quoted values are unquoted.
fn tokenize(segment: &str) -> Result<Vec<String>, ParseError> {
    let chars: Vec<char> = segment.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    // A quoted value ending in `=` must not swallow the next word
    let mut closed_quote = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ParseError::UnterminatedQuote),
                        Some('"') => {
                            closed_quote = true;
                            break;
                        }
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                current.push(escaped);
                            }
                            i += 2;
                            continue;
                        }
                        Some(&other) => current.push(other),
                    }
                    i += 1;
                }
            }
            c if c.is_whitespace() => {
                let mut next = i;
                while next < chars.len() && chars[next].is_whitespace() {
                    next += 1;
                }
                let joins =
                    (current.ends_with('=') && !closed_quote) || chars.get(next) == Some(&'=');
                if !joins && !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                    closed_quote = false;
                }
                i = next;
                continue;
            }
            _ => current.push(c),
        }
        i += 1;
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dmarc(value: ResultValue, from: &str) -> AuthResult {
        AuthResult::Dmarc {
            value,
            reason: None,
            from: Some(from.to_string()),
        }
    }

    #[test]
    fn test_parse_single_dmarc_result() {
        let (id, results) = parse("mail.club1.fr; dmarc=fail header.from=gmail.com").unwrap();
        assert_eq!(id, "mail.club1.fr");
        assert_eq!(results, vec![dmarc(ResultValue::Fail, "gmail.com")]);
    }

    #[test]
    fn test_parse_keeps_property_case() {
        let (_, results) = parse("mx.example.org; DMARC=FAIL header.from=GMAIL.com").unwrap();
        assert_eq!(results, vec![dmarc(ResultValue::Fail, "GMAIL.com")]);
    }

    #[test]
    fn test_parse_result_without_value_is_an_error() {
        let err = parse("mail.club1.fr; dmarc header.from=gmail.com").unwrap_err();
        assert!(matches!(err, ParseError::MalformedResult(_)));
    }

    #[test]
    fn test_parse_version() {
        let (id, _) = parse("mx.example.org 1; none").unwrap();
        assert_eq!(id, "mx.example.org");

        assert_eq!(
            parse("mx.example.org 2; dmarc=pass").unwrap_err(),
            ParseError::UnsupportedVersion("2".to_string())
        );
    }

    #[test]
    fn test_parse_missing_identifier() {
        assert_eq!(parse("").unwrap_err(), ParseError::MissingIdentifier);
        assert_eq!(parse("  ; dmarc=pass").unwrap_err(), ParseError::MissingIdentifier);
    }

    #[test]
    fn test_parse_none() {
        let (id, results) = parse("mx.example.org; none").unwrap();
        assert_eq!(id, "mx.example.org");
        assert!(results.is_empty());
    }

    #[test]
    fn test_parse_multiple_results_with_comments() {
        let value = "mx.example.org;\r\n\
                     \tspf=pass (sender SPF authorized) smtp.mailfrom=example.com;\r\n\
                     \tdkim=pass (2048-bit key) header.d=example.com header.s=sel1;\r\n\
                     \tdmarc=pass (p=none dis=none) header.from=example.com";
        let (_, results) = parse(value).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[0],
            AuthResult::Spf {
                value: ResultValue::Pass,
                reason: None,
                from: Some("example.com".to_string()),
                helo: None,
            }
        );
        assert_eq!(results[1].method(), "dkim");
        assert_eq!(results[2], dmarc(ResultValue::Pass, "example.com"));
    }

    #[test]
    fn test_parse_nested_comment_and_quoted_reason() {
        let value = r#"mx.example.org (outer (inner) comment); dmarc=fail reason="policy; p=reject" header.from=example.net"#;
        let (id, results) = parse(value).unwrap();
        assert_eq!(id, "mx.example.org");
        assert_eq!(
            results,
            vec![AuthResult::Dmarc {
                value: ResultValue::Fail,
                reason: Some("policy; p=reject".to_string()),
                from: Some("example.net".to_string()),
            }]
        );
    }

    #[test]
    fn test_parse_whitespace_around_equals() {
        let (_, results) = parse("mx.example.org; dmarc = none header.from = example.net").unwrap();
        assert_eq!(results, vec![dmarc(ResultValue::None, "example.net")]);
    }

    #[test]
    fn test_parse_empty_quoted_reason() {
        let (_, results) =
            parse(r#"mail.club1.fr; dmarc=fail reason="" header.from=gmail.com"#).unwrap();
        assert_eq!(
            results,
            vec![AuthResult::Dmarc {
                value: ResultValue::Fail,
                reason: Some(String::new()),
                from: Some("gmail.com".to_string()),
            }]
        );
    }

    #[test]
    fn test_parse_spaced_quoted_reason() {
        let (_, results) =
            parse(r#"mail.club1.fr; dmarc=fail reason = "x" header.from=gmail.com"#).unwrap();
        assert_eq!(
            results,
            vec![AuthResult::Dmarc {
                value: ResultValue::Fail,
                reason: Some("x".to_string()),
                from: Some("gmail.com".to_string()),
            }]
        );
        assert_eq!(results[0].value(), &ResultValue::Fail);
    }

    #[test]
    fn test_parse_unterminated_comment() {
        assert_eq!(
            parse("mx.example.org; dmarc=pass (oops").unwrap_err(),
            ParseError::UnterminatedComment
        );
    }

    #[test]
    fn test_parse_unknown_method_is_generic() {
        let (_, results) = parse("mail.club1.fr; auth=none header.from=example.com").unwrap();
        assert_eq!(results.len(), 1);
        match &results[0] {
            AuthResult::Auth { value, .. } => assert_eq!(value, &ResultValue::None),
            other => panic!("unexpected result: {other:?}"),
        }

        let (_, results) = parse("mx.example.org; x-custom=weird foo.bar=baz").unwrap();
        match &results[0] {
            AuthResult::Generic {
                method,
                value,
                params,
            } => {
                assert_eq!(method, "x-custom");
                assert_eq!(value, &ResultValue::Other("weird".to_string()));
                assert_eq!(params.get("foo.bar").map(String::as_str), Some("baz"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_result_value_labels() {
        assert_eq!(ResultValue::parse("TempError"), ResultValue::TempError);
        assert_eq!(ResultValue::parse("bestguesspass").to_string(), "bestguesspass");
        assert_eq!(ResultValue::Fail.to_string(), "fail");
    }
}
