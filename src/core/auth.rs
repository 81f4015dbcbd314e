use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use tracing::warn;

use super::error::AuthError;
use crate::observability::metrics as obs;

// ---------------------------------------------------------------------------
// IP allow-list entries
// ---------------------------------------------------------------------------

/// A single allow-list entry: a literal address or a CIDR range.
///
/// Parsed from strings such as `"192.168.1.15"` or `"10.0.0.0/8"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRange {
    Single(IpAddr),
    Net { addr: IpAddr, prefix: u8 },
}

impl IpRange {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match *self {
            IpRange::Single(addr) => addr == ip,
            IpRange::Net { addr, prefix } => match (addr, ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = if prefix == 0 {
                        0
                    } else {
                        u32::MAX << (32 - u32::from(prefix))
                    };
                    u32::from(net) & mask == u32::from(ip) & mask
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = if prefix == 0 {
                        0
                    } else {
                        u128::MAX << (128 - u32::from(prefix))
                    };
                    u128::from(net) & mask == u128::from(ip) & mask
                }
                _ => false,
            },
        }
    }
}

impl FromStr for IpRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            None => {
                let addr: IpAddr = s.parse().map_err(|_| format!("invalid IP '{}'", s))?;
                Ok(IpRange::Single(addr))
            }
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| format!("invalid IP '{}'", addr))?;
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| format!("invalid prefix '{}'", prefix))?;
                let max = if addr.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(format!("prefix /{} out of range for '{}'", prefix, addr));
                }
                Ok(IpRange::Net { addr, prefix })
            }
        }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpRange::Single(addr) => write!(f, "{}", addr),
            IpRange::Net { addr, prefix } => write!(f, "{}/{}", addr, prefix),
        }
    }
}

impl Serialize for IpRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RangeVisitor;

        impl Visitor<'_> for RangeVisitor {
            type Value = IpRange;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an IP address or CIDR range")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<IpRange, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(RangeVisitor)
    }
}

// ---------------------------------------------------------------------------
// Authentication requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    Read,
    Publish,
}

impl AuthAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthAction::Read => "read",
            AuthAction::Publish => "publish",
        }
    }
}

/// What the connection side knows about the peer asking for access.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub path_name: String,
    pub action: AuthAction,
    pub ip: IpAddr,
    pub query_user: String,
    pub query_pass: String,
    pub raw_query: String,
}

/// What the path side contributes: its configured allow-list and
/// credentials for one direction. Empty fields mean "not enforced".
#[derive(Debug, Clone, Default)]
pub struct PathAuthSpec {
    pub ips: Vec<IpRange>,
    pub user: String,
    pub pass: String,
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

/// Evaluates the three access checks in fixed order; the first failure
/// wins and every failure is critical.
#[derive(Debug, Clone)]
pub struct Authenticator {
    external_url: Option<String>,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ExternalAuthBody<'a> {
    ip: String,
    user: &'a str,
    pass: &'a str,
    path: &'a str,
    action: &'a str,
    query: &'a str,
}

impl Authenticator {
    pub fn new(external_url: Option<String>) -> Self {
        Self {
            external_url,
            http: reqwest::Client::new(),
        }
    }

    pub async fn authenticate(
        &self,
        req: &AuthRequest,
        spec: &PathAuthSpec,
    ) -> Result<(), AuthError> {
        if let Some(url) = &self.external_url {
            self.external_auth(url, req).await.inspect_err(|_| {
                self.record_failure(req, "external");
            })?;
        }

        if !spec.ips.is_empty() && !spec.ips.iter().any(|r| r.contains(req.ip)) {
            self.record_failure(req, "ip");
            return Err(AuthError::Critical {
                message: format!("IP '{}' not allowed", req.ip),
            });
        }

        if !spec.user.is_empty()
            && (req.query_user != spec.user || req.query_pass != spec.pass)
        {
            self.record_failure(req, "credentials");
            return Err(AuthError::Critical {
                message: "invalid credentials".to_string(),
            });
        }

        Ok(())
    }

    async fn external_auth(&self, url: &str, req: &AuthRequest) -> Result<(), AuthError> {
        let body = ExternalAuthBody {
            ip: req.ip.to_string(),
            user: &req.query_user,
            pass: &req.query_pass,
            path: &req.path_name,
            action: req.action.as_str(),
            query: &req.raw_query,
        };

        let res = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Critical {
                message: format!("external authentication failed: {}", e),
            })?;

        if !res.status().is_success() {
            return Err(AuthError::Critical {
                message: format!(
                    "external authentication failed: server replied with code {}",
                    res.status().as_u16()
                ),
            });
        }

        Ok(())
    }

    fn record_failure(&self, req: &AuthRequest, check: &'static str) {
        warn!(
            ip = %req.ip,
            path = %req.path_name,
            action = req.action.as_str(),
            check,
            "authentication rejected"
        );
        obs::inc_auth_failures(req.action.as_str());
    }
}
