//! Endpoint Addresses
//!
//! `protocol://address[/service[/param]]`. Messengers use them to name their
//! destination and stamp the destination service onto each submitted message.

use alloc::string::{String, ToString};
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::errors::EndpointError;

/// Address of an endpoint, optionally qualified by a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress {
    protocol: String,
    address: String,
    service_name: Option<String>,
    service_param: Option<String>,
}

impl EndpointAddress {
    /// Create an unqualified address
    pub fn new<P: Into<String>, A: Into<String>>(
        protocol: P,
        address: A,
    ) -> Result<Self, EndpointError> {
        let protocol = protocol.into();
        let address = address.into();
        if protocol.is_empty() {
            return Err(EndpointError::invalid_address("empty protocol"));
        }
        if address.is_empty() {
            return Err(EndpointError::invalid_address("empty address"));
        }
        Ok(Self {
            protocol,
            address,
            service_name: None,
            service_param: None,
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    pub fn service_param(&self) -> Option<&str> {
        self.service_param.as_deref()
    }

    /// Copy of this address qualified by `service` and `param`.
    ///
    /// A parameter without a service is dropped.
    pub fn with_service(&self, service: Option<&str>, param: Option<&str>) -> Self {
        let service_name = service.filter(|s| !s.is_empty()).map(ToString::to_string);
        let service_param = service_name
            .as_ref()
            .and(param.filter(|p| !p.is_empty()).map(ToString::to_string));
        Self {
            protocol: self.protocol.clone(),
            address: self.address.clone(),
            service_name,
            service_param,
        }
    }

    /// This address without service qualification
    pub fn base(&self) -> Self {
        self.with_service(None, None)
    }
}

impl FromStr for EndpointAddress {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, rest) = s
            .split_once("://")
            .ok_or_else(|| EndpointError::invalid_address(format!("missing '://' in {s:?}")))?;
        let mut parts = rest.splitn(3, '/');
        let address = parts.next().unwrap_or_default();
        let service = parts.next();
        let param = parts.next();
        Ok(EndpointAddress::new(protocol, address)?.with_service(service, param))
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)?;
        if let Some(service) = &self.service_name {
            write!(f, "/{}", service)?;
            if let Some(param) = &self.service_param {
                write!(f, "/{}", param)?;
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
