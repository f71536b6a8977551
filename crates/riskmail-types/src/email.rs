use serde::{Deserialize, Serialize};

/// The request shape accepted by `analyse`/`analyse/fast`: a raw email
/// plus whatever network identity the caller observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailInput {
    pub raw_email: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl EmailInput {
    pub fn new(raw_email: impl Into<String>) -> Self {
        Self {
            raw_email: raw_email.into(),
            ip: None,
            user_agent: None,
            request_id: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
}

/// The outcome of normalizing and syntactically validating an
/// `EmailInput::raw_email`. Construction is the only place that decides
/// whether an address is well-formed; everything downstream trusts it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedEmail {
    pub raw: String,
    pub normalized: String,
    pub local_part: String,
    pub domain: String,
    pub is_alias: bool,
}
