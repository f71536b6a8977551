//! The WHOIS/IP-intel/SMTP subset of `Signals`, produced by
//! [`crate::RiskEngine::run_slow`] and merged into whatever the cheap
//! pass already collected.
use riskmail_types::Signals;

#[derive(Debug, Clone, Default)]
pub struct SlowSignals {
    pub domain_age_days: Option<i64>,
    pub is_new_domain: Option<bool>,
    pub ip_country: Option<String>,
    pub is_vpn: Option<bool>,
    pub is_proxy: Option<bool>,
    pub is_datacenter: Option<bool>,
    pub smtp_valid: Option<bool>,
    pub smtp_deliverable: Option<bool>,
    pub smtp_catch_all: Option<bool>,
}

impl SlowSignals {
    /// Merge the slow-probe fields into a `Signals` record that
    /// already carries the cheap fields, without disturbing them.
    pub fn merge_into(self, mut cheap: Signals) -> Signals {
        cheap.domain_age_days = self.domain_age_days;
        cheap.is_new_domain = self.is_new_domain;
        cheap.ip_country = self.ip_country;
        cheap.is_vpn = self.is_vpn;
        cheap.is_proxy = self.is_proxy;
        cheap.is_datacenter = self.is_datacenter;
        cheap.smtp_valid = self.smtp_valid;
        cheap.smtp_deliverable = self.smtp_deliverable;
        cheap.smtp_catch_all = self.smtp_catch_all;
        cheap
    }
}
