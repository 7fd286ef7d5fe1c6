use std::{fmt, net::IpAddr};

use sha2::{Digest, Sha256};

/// Stands in for a missing or blank network address before hashing
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Pseudonymous visitor key: a salted one-way hash of a network address
///
/// This is the only form in which a visitor's address is ever stored or logged.
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Never fails: anything that is not an address hashes like any other string
    pub fn of(raw_address: Option<&str>, salt: &str) -> Fingerprint {
        let address = normalize_address(raw_address);
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        // separator so that ("ab", "c") and ("a", "bc") differ
        hasher.update([0u8]);
        hasher.update(address.as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize_address(raw: Option<&str>) -> String {
    let raw = match raw.map(str::trim) {
        None | Some("") => return String::from(UNKNOWN_ADDRESS),
        Some(raw) => raw,
    };
    match raw.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(ip) => ip.to_string(),
        Err(_) => String::from(raw),
    }
}
