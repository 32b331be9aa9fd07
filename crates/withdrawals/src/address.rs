use serde::{Deserialize, Serialize};

use vaultledger_core::{DomainError, DomainResult};

/// A payout destination: a non-zero 20-byte hex address, stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PayoutAddress(String);

impl PayoutAddress {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let raw = raw.trim();
        let hex = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .ok_or_else(|| DomainError::validation("invalid wallet address: missing 0x prefix"))?;

        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::validation(
                "invalid wallet address: expected 40 hex characters",
            ));
        }
        if hex.chars().all(|c| c == '0') {
            return Err(DomainError::validation("invalid wallet address: zero address"));
        }

        Ok(Self(format!("0x{}", hex.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for PayoutAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PayoutAddress {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PayoutAddress> for String {
    fn from(value: PayoutAddress) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_valid_addresses() {
        let addr = PayoutAddress::parse("0xAbCdEf0123456789aBcDeF0123456789ABCDEF01").unwrap();
        assert_eq!(addr.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn rejects_malformed_and_zero_addresses() {
        for bad in [
            "",
            "abcdef0123456789abcdef0123456789abcdef01",
            "0xabc",
            "0xzzcdef0123456789abcdef0123456789abcdef01",
            "0x0000000000000000000000000000000000000000",
        ] {
            assert!(
                matches!(PayoutAddress::parse(bad), Err(DomainError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
