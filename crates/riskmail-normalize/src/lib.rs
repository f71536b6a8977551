//! C12: syntactic validation, local/domain split, alias stripping, and
//! lowercase canonicalization of an incoming email address.
use riskmail_types::email::ParsedEmail;
use riskmail_types::error::{Error, HardRejectReason};
use std::collections::HashSet;

const MAX_LOCAL_PART_LEN: usize = 64;
const MAX_LABEL_LEN: usize = 63;

/// Domains whose `+`-suffix the normalizer treats as an alias segment
/// for canonicalization purposes (§4.1, §9 Open Question: "whether the
/// normalizer should strip aliases only on alias-capable domains").
/// This service resolves that question in favor of the documented
/// behavior spelled out in §3: stripping is scoped to a configured set
/// rather than applied universally, since most providers treat the
/// `+` suffix as a literal part of the mailbox name.
#[derive(Debug, Clone)]
pub struct AliasCapableDomains(HashSet<String>);

impl Default for AliasCapableDomains {
    fn default() -> Self {
        Self(
            ["gmail.com", "googlemail.com"]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }
}

impl AliasCapableDomains {
    pub fn new(domains: impl IntoIterator<Item = String>) -> Self {
        Self(domains.into_iter().map(|d| d.to_lowercase()).collect())
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.0.contains(domain)
    }
}

/// Parse and normalize a raw email address. Returns
/// `Error::HardReject(HardRejectReason::InvalidSyntax)` for anything
/// that fails the syntactic rules in §4.1; the engine short-circuits
/// scoring on that error rather than producing a `ParsedEmail`.
pub fn parse_email(raw: &str, alias_domains: &AliasCapableDomains) -> Result<ParsedEmail, Error> {
    let mut at_positions = raw.match_indices('@');
    let (at_idx, _) = at_positions
        .next()
        .ok_or(Error::HardReject(HardRejectReason::InvalidSyntax))?;
    if at_positions.next().is_some() {
        return Err(Error::HardReject(HardRejectReason::InvalidSyntax));
    }

    let local_part = &raw[..at_idx];
    let domain = &raw[at_idx + 1..];

    if local_part.is_empty() || local_part.chars().count() > MAX_LOCAL_PART_LEN {
        return Err(Error::HardReject(HardRejectReason::InvalidSyntax));
    }

    validate_domain(domain)?;

    let domain_lower = domain.to_lowercase();
    let is_alias = local_part.contains('+');

    let canonical_local = if is_alias && alias_domains.contains(&domain_lower) {
        local_part
            .split_once('+')
            .map(|(user, _tag)| user)
            .unwrap_or(local_part)
    } else {
        local_part
    };

    let normalized = format!("{}@{}", canonical_local.to_lowercase(), domain_lower);

    Ok(ParsedEmail {
        raw: raw.to_string(),
        normalized,
        local_part: local_part.to_lowercase(),
        domain: domain_lower,
        is_alias,
    })
}

fn validate_domain(domain: &str) -> Result<(), Error> {
    if domain.is_empty() || !domain.contains('.') {
        return Err(Error::HardReject(HardRejectReason::InvalidSyntax));
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(Error::HardReject(HardRejectReason::InvalidSyntax));
    }

    for label in domain.split('.') {
        if label.is_empty() || label.chars().count() > MAX_LABEL_LEN {
            return Err(Error::HardReject(HardRejectReason::InvalidSyntax));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(Error::HardReject(HardRejectReason::InvalidSyntax));
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn aliasing() -> AliasCapableDomains {
        AliasCapableDomains::default()
    }

    #[test]
    fn basic() {
        let parsed = parse_email("John.Doe@Gmail.com", &aliasing()).unwrap();
        assert_eq!(parsed.domain, "gmail.com");
        assert_eq!(parsed.normalized, "john.doe@gmail.com");
        assert!(!parsed.is_alias);
    }

    #[test]
    fn alias_on_capable_domain() {
        let parsed = parse_email("user+tag@gmail.com", &aliasing()).unwrap();
        assert!(parsed.is_alias);
        assert_eq!(parsed.normalized, "user@gmail.com");
    }

    #[test]
    fn alias_on_non_capable_domain_is_not_stripped() {
        let parsed = parse_email("user+tag@example.com", &aliasing()).unwrap();
        assert!(parsed.is_alias);
        assert_eq!(parsed.normalized, "user+tag@example.com");
    }

    #[test]
    fn normalization_is_idempotent() {
        let domains = aliasing();
        let once = parse_email("User+Tag@Gmail.com", &domains).unwrap();
        let twice = parse_email(&once.normalized, &domains).unwrap();
        assert_eq!(once.normalized, twice.normalized);
    }

    #[test]
    fn rejects_missing_at() {
        assert!(parse_email("not-an-email", &aliasing()).is_err());
    }

    #[test]
    fn rejects_multiple_at() {
        assert!(parse_email("a@b@example.com", &aliasing()).is_err());
    }

    #[test]
    fn rejects_empty_local_part() {
        assert!(parse_email("@example.com", &aliasing()).is_err());
    }

    #[test]
    fn rejects_domain_without_dot() {
        assert!(parse_email("user@localhost", &aliasing()).is_err());
    }

    #[test]
    fn rejects_label_with_leading_hyphen() {
        assert!(parse_email("user@-example.com", &aliasing()).is_err());
    }

    #[test]
    fn rejects_overlong_local_part() {
        let local = "a".repeat(65);
        let email = format!("{local}@example.com");
        assert!(parse_email(&email, &aliasing()).is_err());
    }
}
