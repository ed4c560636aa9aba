//! Authorization gate
//!
//! A pure function over path configuration, presented credentials and the
//! client address. The IP allow-list is evaluated before credentials and a
//! denial short-circuits. The anti-brute-force pause is applied by the path
//! manager when it answers a failed attempt; the gate itself never sleeps.

use std::net::IpAddr;
use std::time::Duration;

use crate::conf::{Credential, IpNetwork, PathConf};

/// Pause applied before answering a failed authorization attempt
pub const AUTH_FAIL_PAUSE: Duration = Duration::from_secs(2);

/// Kind of access being attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Write media to a path
    Publish,
    /// Consume media from a path
    Read,
    /// Inspect paths through the API
    Api,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Publish => write!(f, "publish"),
            Action::Read => write!(f, "read"),
            Action::Api => write!(f, "api"),
        }
    }
}

/// Credentials presented by a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Credentials {
    /// Credentials with both fields set
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }
}

/// Authorization failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Client address outside the allowed networks
    #[error("ip not allowed")]
    DenyIp,

    /// User or password rejected
    #[error("authentication failed")]
    DenyCredentials,
}

fn ip_allowed(networks: &[IpNetwork], ip: IpAddr) -> bool {
    networks.is_empty() || networks.iter().any(|net| net.contains(ip))
}

fn check_credentials(
    user: &Credential,
    pass: &Credential,
    presented: &Credentials,
) -> Result<(), AuthError> {
    // Both are always checked so that timing does not reveal which failed.
    let user_ok = user.check(&presented.user);
    let pass_ok = pass.check(&presented.pass);
    if user_ok && pass_ok {
        Ok(())
    } else {
        Err(AuthError::DenyCredentials)
    }
}

/// Authorize `action` on a path for a client at `ip` presenting
/// `credentials`.
///
/// API access is gated by the path's read credentials: anyone allowed to
/// consume the stream may inspect it.
pub fn authorize(
    action: Action,
    conf: &PathConf,
    credentials: &Credentials,
    ip: IpAddr,
) -> Result<(), AuthError> {
    let (user, pass, ips) = match action {
        Action::Publish => (&conf.publish_user, &conf.publish_pass, &conf.publish_ips),
        Action::Read | Action::Api => (&conf.read_user, &conf.read_pass, &conf.read_ips),
    };

    if !ip_allowed(ips, ip) {
        return Err(AuthError::DenyIp);
    }

    check_credentials(user, pass, credentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::PathConf;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_open_path_allows_anyone() {
        let conf = PathConf::default();
        let creds = Credentials::default();

        assert!(authorize(Action::Publish, &conf, &creds, localhost()).is_ok());
        assert!(authorize(Action::Read, &conf, &creds, localhost()).is_ok());
        assert!(authorize(Action::Api, &conf, &creds, localhost()).is_ok());
    }

    #[test]
    fn test_read_credentials() {
        let mut conf = PathConf::default();
        conf.read_user = "alice".into();
        conf.read_pass = "secret".into();

        let ok = Credentials::new("alice", "secret");
        assert!(authorize(Action::Read, &conf, &ok, localhost()).is_ok());

        let wrong_pass = Credentials::new("alice", "nope");
        assert_eq!(
            authorize(Action::Read, &conf, &wrong_pass, localhost()),
            Err(AuthError::DenyCredentials)
        );

        let anonymous = Credentials::default();
        assert_eq!(
            authorize(Action::Read, &conf, &anonymous, localhost()),
            Err(AuthError::DenyCredentials)
        );

        // Publish side is unaffected by read credentials.
        assert!(authorize(Action::Publish, &conf, &anonymous, localhost()).is_ok());
    }

    #[test]
    fn test_hashed_credentials() {
        let mut conf = PathConf::default();
        conf.publish_user = "sha256:rl3rgi4NcZkpAEcacZnQ2VuOfJ0FxAqCRaKB/SwdZoQ=".into();

        let ok = Credentials::new("testuser", "");
        assert!(authorize(Action::Publish, &conf, &ok, localhost()).is_ok());

        let bad = Credentials::new("nottestuser", "");
        assert_eq!(
            authorize(Action::Publish, &conf, &bad, localhost()),
            Err(AuthError::DenyCredentials)
        );
    }

    #[test]
    fn test_ip_deny_short_circuits_credentials() {
        let mut conf = PathConf::default();
        conf.read_ips = vec!["10.0.0.0/8".parse().unwrap()];
        conf.read_user = "alice".into();
        conf.read_pass = "secret".into();

        // Correct credentials from a denied address still fail with DenyIp.
        let creds = Credentials::new("alice", "secret");
        assert_eq!(
            authorize(Action::Read, &conf, &creds, localhost()),
            Err(AuthError::DenyIp)
        );

        let allowed: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(authorize(Action::Read, &conf, &creds, allowed).is_ok());
    }

    #[test]
    fn test_api_uses_read_rules() {
        let mut conf = PathConf::default();
        conf.read_user = "viewer".into();

        assert_eq!(
            authorize(Action::Api, &conf, &Credentials::default(), localhost()),
            Err(AuthError::DenyCredentials)
        );
        assert!(
            authorize(Action::Api, &conf, &Credentials::new("viewer", ""), localhost()).is_ok()
        );
    }
}
