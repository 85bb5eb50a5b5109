use std::collections::HashSet;

/// Substitution marker of the rejection message template.
pub const DOMAIN_MARKER: &str = "%s";

/// Sender domains whose DMARC failures are rejected regardless of the
/// policy they publish. Lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectDomains {
    domains: HashSet<String>,
}

impl RejectDomains {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        RejectDomains { domains }
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(&domain.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Rejection text with a single `%s` standing for the claimed domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectTemplate {
    prefix: String,
    suffix: String,
}

impl RejectTemplate {
    /// `%%` stands for a literal `%`, any other `%` sequence is kept as is.
    pub fn parse(template: &str) -> anyhow::Result<Self> {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match (c, chars.peek()) {
                ('%', Some('%')) => {
                    chars.next();
                    current.push('%');
                }
                ('%', Some('s')) => {
                    chars.next();
                    parts.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            }
        }

        let markers = parts.len();
        if markers != 1 {
            anyhow::bail!(
                "reject message must contain exactly one '{}' marker, found {}: {:?}",
                DOMAIN_MARKER,
                markers,
                template
            );
        }
        let prefix = parts.pop().unwrap_or_default();
        Ok(RejectTemplate {
            prefix,
            suffix: current,
        })
    }

    pub fn render(&self, domain: &str) -> String {
        format!("{}{}{}", self.prefix, domain, self.suffix)
    }
}

/// Everything a session needs to judge a message. Built once at startup and
/// shared read-only by all sessions.
#[derive(Debug, Clone)]
pub struct Policy {
    pub authserv_id: String,
    pub reject_domains: RejectDomains,
    pub reject_template: RejectTemplate,
}

impl Policy {
    pub fn new(
        authserv_id: impl Into<String>,
        reject_domains: RejectDomains,
        reject_template: RejectTemplate,
    ) -> Self {
        Policy {
            authserv_id: authserv_id.into(),
            reject_domains,
            reject_template,
        }
    }

    pub fn is_local_identifier(&self, identifier: &str) -> bool {
        identifier.eq_ignore_ascii_case(&self.authserv_id)
    }
}
