//! Which targets the agent is willing to dial
//!
//! Resolved target addresses are checked against:
//! - CIDR ranges (e.g., 10.0.0.0/8, 192.168.0.0/16)
//! - Port ranges (e.g., 22, 80-443, 5432)
//!
//! An empty list allows everything for that dimension.

use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessControlError {
    #[error("Address {0} is not in allowed CIDR ranges")]
    CidrNotAllowed(IpAddr),

    #[error("Port {0} is not in allowed port ranges")]
    PortNotAllowed(u16),

    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),
}

/// Port range specification (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn range(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl std::str::FromStr for PortRange {
    type Err = AccessControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|e| AccessControlError::InvalidPortRange(format!("{:?}: {}", s, e)))
        };

        match s.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(AccessControlError::InvalidPortRange(format!(
                        "start port {} > end port {}",
                        start, end
                    )));
                }
                Ok(PortRange::range(start, end))
            }
            None => Ok(PortRange::single(parse(s)?)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    /// Allowed CIDR ranges (empty = allow all)
    pub allowed_cidrs: Vec<IpNet>,
    /// Allowed port ranges (empty = allow all)
    pub allowed_ports: Vec<PortRange>,
}

impl AccessControl {
    pub fn new(allowed_cidrs: Vec<IpNet>, allowed_ports: Vec<PortRange>) -> Self {
        Self {
            allowed_cidrs,
            allowed_ports,
        }
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.allowed_cidrs.is_empty() && self.allowed_ports.is_empty()
    }

    /// Check one resolved target address
    pub fn check(&self, addr: &SocketAddr) -> Result<(), AccessControlError> {
        if !self.allowed_cidrs.is_empty() {
            let ip = addr.ip();
            if !self.allowed_cidrs.iter().any(|cidr| cidr.contains(&ip)) {
                return Err(AccessControlError::CidrNotAllowed(ip));
            }
        }

        if !self.allowed_ports.is_empty() {
            let port = addr.port();
            if !self.allowed_ports.iter().any(|range| range.contains(port)) {
                return Err(AccessControlError::PortNotAllowed(port));
            }
        }

        Ok(())
    }
}
