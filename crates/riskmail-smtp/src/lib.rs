//! C6: mailbox-level SMTP probing, disabled by default (§4.6). Opens a
//! connection to the target's MX host, EHLOs, issues `MAIL FROM` then
//! `RCPT TO` the candidate mailbox, then a second `RCPT TO` a random
//! non-existent local-part on the same domain to detect a catch-all.
//! Advisory only — a positive RCPT never confirms deliverability, it
//! only rules out the obvious negative.
use rand::distributions::Alphanumeric;
use rand::Rng;
use rfc5321::{Command, ForwardPath, ReversePath, SmtpClient, SmtpClientTimeouts};
use std::time::Duration;
use tokio::time::timeout;

const HARD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection to {host} failed: {source}")]
    Connect {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("smtp protocol error: {0}")]
    Protocol(#[from] rfc5321::ClientError),
    #[error("probe exceeded the {0:?} hard timeout")]
    TimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmtpProbeResult {
    /// The target mailbox's RCPT TO was accepted (2xx).
    pub valid: bool,
    /// Advisory: `valid` without `catch_all` being the only signal
    /// supporting it. Per §9, this spec treats `catch_all` as
    /// independent and not a confirmation/denial of deliverability.
    pub deliverable: bool,
    pub catch_all: bool,
}

#[derive(Debug, Clone)]
pub struct SmtpProberConfig {
    pub enabled: bool,
    pub sender: String,
    pub ehlo_name: String,
}

impl Default for SmtpProberConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sender: String::new(),
            ehlo_name: "riskmail-probe.local".to_string(),
        }
    }
}

pub struct SmtpProber {
    config: SmtpProberConfig,
}

impl SmtpProber {
    pub fn new(config: SmtpProberConfig) -> Self {
        Self { config }
    }

    /// `None` when disabled globally or on any transport failure
    /// (§4.6: "any 4xx/5xx is recorded without retry; null on
    /// transport failure").
    pub async fn probe(&self, email: &str, mx_host: &str) -> Option<SmtpProbeResult> {
        if !self.config.enabled {
            return None;
        }

        match timeout(HARD_TIMEOUT, self.probe_inner(email, mx_host)).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(err)) => {
                tracing::debug!(mx_host, email, error = %err, "smtp probe failed");
                None
            }
            Err(_) => {
                tracing::debug!(mx_host, email, "smtp probe exceeded hard timeout");
                None
            }
        }
    }

    async fn probe_inner(&self, email: &str, mx_host: &str) -> Result<SmtpProbeResult, Error> {
        let domain = email.rsplit_once('@').map(|(_, d)| d).unwrap_or(mx_host);
        let addr = format!("{mx_host}:25");

        let mut client = SmtpClient::new(addr, SmtpClientTimeouts::default())
            .await
            .map_err(|source| Error::Connect {
                host: mx_host.to_string(),
                source,
            })?;

        client.ehlo(&self.config.ehlo_name).await?;

        let sender = ReversePath::try_from(self.config.sender.as_str()).unwrap_or(ReversePath::NullSender);
        client
            .send_command(&Command::MailFrom {
                address: sender,
                parameters: vec![],
            })
            .await?;

        let target = ForwardPath::try_from(email).map_err(|_| {
            Error::Protocol(rfc5321::ClientError::MalformedResponseLine(format!(
                "invalid rcpt target {email}"
            )))
        })?;
        let rcpt_response = client
            .send_command(&Command::RcptTo {
                address: target,
                parameters: vec![],
            })
            .await?;
        let valid = (200..300).contains(&rcpt_response.code);

        let decoy = format!("{}@{domain}", random_local_part());
        let decoy_target = ForwardPath::try_from(decoy.as_str()).map_err(|_| {
            Error::Protocol(rfc5321::ClientError::MalformedResponseLine(format!(
                "invalid decoy rcpt target {decoy}"
            )))
        })?;
        let decoy_response = client
            .send_command(&Command::RcptTo {
                address: decoy_target,
                parameters: vec![],
            })
            .await?;
        let catch_all = (200..300).contains(&decoy_response.code);

        let _ = client.send_command(&Command::Quit).await;

        Ok(SmtpProbeResult {
            valid,
            deliverable: valid,
            catch_all,
        })
    }
}

fn random_local_part() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("riskmail-probe-{suffix}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn disabled_prober_never_connects() {
        let prober = SmtpProber::new(SmtpProberConfig::default());
        let result = prober.probe("user@example.com", "mail.example.com").await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn unreachable_host_returns_null() {
        let config = SmtpProberConfig {
            enabled: true,
            ..SmtpProberConfig::default()
        };
        let prober = SmtpProber::new(config);
        // port 1 should refuse immediately rather than hang.
        let result = prober.probe("user@example.com", "127.0.0.1").await;
        assert_eq!(result, None);
    }

    #[test]
    fn random_local_parts_are_unique() {
        let a = random_local_part();
        let b = random_local_part();
        assert_ne!(a, b);
        assert!(a.starts_with("riskmail-probe-"));
    }
}
