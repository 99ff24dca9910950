// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Picks the address a migration source should stream to.

use std::ffi::{CStr, CString};

use nix::unistd::gethostname;
use thiserror::Error;

/// Longest address handed back to the source: the maximum length of a DNS
/// name.
pub const MAX_ADDRESS_LEN: usize = 253;

/// Local names that the remote peer cannot use to reach this host.
const LOOPBACK_PREFIX: &str = "localhost";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("failed to determine local hostname: {0}")]
    Hostname(String),

    #[error(
        "hostname on destination resolved to {0}, \
         but migration requires an FQDN"
    )]
    Loopback(String),

    #[error("destination address is empty")]
    Empty,

    #[error("destination address {0:?} exceeds {MAX_ADDRESS_LEN} bytes")]
    TooLong(String),
}

/// Source of this host's name.
#[cfg_attr(test, mockall::automock)]
pub trait HostnameSource: Send + Sync {
    fn hostname(&self) -> Result<String, EndpointError>;
}

/// Reads the system hostname and canonicalises it through the resolver, so
/// a bare `db-7` becomes `db-7.internal` when the resolver knows better.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHostname;

impl HostnameSource for SystemHostname {
    fn hostname(&self) -> Result<String, EndpointError> {
        let name = system_hostname()?;
        Ok(canonical_name(&name).unwrap_or(name))
    }
}

fn system_hostname() -> Result<String, EndpointError> {
    let name = gethostname()
        .map_err(|e| EndpointError::Hostname(e.desc().to_owned()))?;
    name.into_string().map_err(|raw| {
        EndpointError::Hostname(format!("non-UTF-8 hostname {raw:?}"))
    })
}

/// Asks getaddrinfo(3) for the canonical name of `host`.
fn canonical_name(host: &str) -> Option<String> {
    let c_host = CString::new(host).ok()?;

    // SAFETY: an all-zero addrinfo is a valid "no hints" value.
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_flags = libc::AI_CANONNAME;
    hints.ai_family = libc::AF_UNSPEC;

    let mut res: *mut libc::addrinfo = std::ptr::null_mut();
    // SAFETY: all pointers are valid for the call; `res` is freed below.
    let rc = unsafe {
        libc::getaddrinfo(c_host.as_ptr(), std::ptr::null(), &hints, &mut res)
    };
    if rc != 0 || res.is_null() {
        return None;
    }

    // SAFETY: `res` is a valid list returned by getaddrinfo; the canonical
    // name, if present, is a NUL-terminated string owned by that list.
    let canon = unsafe {
        let canon = (*res).ai_canonname;
        let name = (!canon.is_null())
            .then(|| CStr::from_ptr(canon).to_string_lossy().into_owned());
        libc::freeaddrinfo(res);
        name
    };

    canon.filter(|c| !c.is_empty())
}

/// Turns a destination identifier into the address the source streams to.
pub struct EndpointResolver {
    hostname: Box<dyn HostnameSource>,
}

impl Default for EndpointResolver {
    fn default() -> Self {
        Self::new(Box::new(SystemHostname))
    }
}

impl EndpointResolver {
    pub fn new(hostname: Box<dyn HostnameSource>) -> Self {
        EndpointResolver { hostname }
    }

    /// Uses `explicit` verbatim if supplied; otherwise falls back to the local
    /// host's fully qualified name, which must not be a loopback name.
    pub fn resolve_destination(
        &self,
        explicit: Option<&str>,
    ) -> Result<String, EndpointError> {
        let address = match explicit {
            Some(uri) => uri.to_owned(),
            None => {
                let name = self.hostname.hostname()?;
                if name.starts_with(LOOPBACK_PREFIX) {
                    return Err(EndpointError::Loopback(name));
                }
                name
            }
        };

        check_address(&address)?;
        Ok(address)
    }
}

/// Validates an address received from a peer or a caller.
pub fn check_address(address: &str) -> Result<(), EndpointError> {
    if address.is_empty() {
        return Err(EndpointError::Empty);
    }
    if address.len() > MAX_ADDRESS_LEN {
        return Err(EndpointError::TooLong(address.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_with_hostname(name: &'static str) -> EndpointResolver {
        let mut source = MockHostnameSource::new();
        source.expect_hostname().returning(move || Ok(name.to_owned()));
        EndpointResolver::new(Box::new(source))
    }

    #[test]
    fn local_hostname_is_used_without_explicit_uri() {
        let resolver = resolver_with_hostname("db-7.internal");
        assert_eq!(resolver.resolve_destination(None).unwrap(), "db-7.internal");
    }

    #[test]
    fn localhost_is_rejected() {
        for name in ["localhost", "localhost.localdomain"] {
            let resolver = resolver_with_hostname(name);
            assert_eq!(
                resolver.resolve_destination(None),
                Err(EndpointError::Loopback(name.to_owned()))
            );
        }
    }

    #[test]
    fn explicit_uri_is_used_verbatim() {
        let mut source = MockHostnameSource::new();
        source.expect_hostname().never();
        let resolver = EndpointResolver::new(Box::new(source));

        assert_eq!(
            resolver.resolve_destination(Some("10.0.0.7")).unwrap(),
            "10.0.0.7"
        );
    }

    #[test]
    fn overlong_address_is_rejected() {
        let resolver = resolver_with_hostname("unused");
        let long = "a".repeat(MAX_ADDRESS_LEN + 1);
        assert!(matches!(
            resolver.resolve_destination(Some(&long)),
            Err(EndpointError::TooLong(_))
        ));
        assert_eq!(
            resolver.resolve_destination(Some("")),
            Err(EndpointError::Empty)
        );
    }

    #[test]
    fn system_hostname_is_readable() {
        let name = system_hostname().unwrap();
        assert!(!name.is_empty());
        assert!(!name.contains('\0'));
    }

    #[test]
    fn hostname_failure_is_reported() {
        let mut source = MockHostnameSource::new();
        source
            .expect_hostname()
            .returning(|| Err(EndpointError::Hostname("boom".to_owned())));
        let resolver = EndpointResolver::new(Box::new(source));
        assert!(matches!(
            resolver.resolve_destination(None),
            Err(EndpointError::Hostname(_))
        ));
    }
}
