//! Claim identities presented at authorize time.
//!
//! A miner's username is the payout address its solved blocks pay, with an
//! optional `.worker` suffix: `bc1q....rig7`. Only single-key and script
//! hash witness types plus legacy P2PKH are accepted.

use std::fmt;
use std::str::FromStr;

use bitcoin::address::{Address, AddressType};
use bitcoin::{Network, ScriptBuf};
use thiserror::Error;

const MAX_WORKER_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("empty username")]
    Empty,

    #[error("not a valid address: {0}")]
    BadAddress(String),

    #[error("address is not for {0}")]
    WrongNetwork(Network),

    #[error("unsupported address type")]
    UnsupportedType,

    #[error("bad worker name")]
    BadWorker,
}

/// Accepted payout address kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ClaimKind {
    P2pkh,
    P2wpkh,
    P2wsh,
    P2tr,
}

/// An authorized miner identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimIdentity {
    pub address: Address,
    pub worker: Option<String>,
    pub kind: ClaimKind,
}

impl ClaimIdentity {
    /// Parse `address[.worker]` for `network`.
    pub fn parse(username: &str, network: Network) -> Result<Self, IdentityError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(IdentityError::Empty);
        }
        let (address, worker) = match username.split_once('.') {
            Some((address, worker)) => (address, Some(worker)),
            None => (username, None),
        };

        let worker = worker
            .map(|w| {
                let valid = !w.is_empty()
                    && w.len() <= MAX_WORKER_LEN
                    && w.chars().all(|c| c.is_ascii_graphic());
                if valid {
                    Ok(w.to_string())
                } else {
                    Err(IdentityError::BadWorker)
                }
            })
            .transpose()?;

        let address = Address::from_str(address)
            .map_err(|e| IdentityError::BadAddress(e.to_string()))?
            .require_network(network)
            .map_err(|_| IdentityError::WrongNetwork(network))?;

        let kind = match address.address_type() {
            Some(AddressType::P2pkh) => ClaimKind::P2pkh,
            Some(AddressType::P2wpkh) => ClaimKind::P2wpkh,
            Some(AddressType::P2wsh) => ClaimKind::P2wsh,
            Some(AddressType::P2tr) => ClaimKind::P2tr,
            _ => return Err(IdentityError::UnsupportedType),
        };

        Ok(Self {
            address,
            worker,
            kind,
        })
    }

    /// Script the coinbase reward pays.
    pub fn claim_script(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// Address without worker suffix, as used for tag lookup.
    pub fn address_string(&self) -> String {
        self.address.to_string()
    }
}

impl fmt::Display for ClaimIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.worker {
            Some(worker) => write!(f, "{}.{}", self.address, worker),
            None => write!(f, "{}", self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2", ClaimKind::P2pkh; "p2pkh")]
    #[test_case("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", ClaimKind::P2wpkh; "p2wpkh")]
    #[test_case("bc1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qccfmv3", ClaimKind::P2wsh; "p2wsh")]
    #[test_case("bc1p5d7rjq7g6rdk2yhzks9smlaqtedr4dekq08ge8ztwac72sfr9rusxg3297", ClaimKind::P2tr; "p2tr")]
    fn test_accepted_mainnet_kinds(address: &str, kind: ClaimKind) {
        let identity = ClaimIdentity::parse(address, Network::Bitcoin).unwrap();
        assert_eq!(identity.kind, kind);
        assert_eq!(identity.worker, None);
        assert_eq!(identity.to_string(), address);
    }

    #[test]
    fn test_p2sh_rejected() {
        assert_eq!(
            ClaimIdentity::parse("3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy", Network::Bitcoin),
            Err(IdentityError::UnsupportedType)
        );
    }

    #[test]
    fn test_worker_suffix() {
        let identity = ClaimIdentity::parse(
            "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq.rig-7",
            Network::Bitcoin,
        )
        .unwrap();
        assert_eq!(identity.worker.as_deref(), Some("rig-7"));
        assert_eq!(
            identity.address_string(),
            "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"
        );
        assert_eq!(
            identity.to_string(),
            "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq.rig-7"
        );
    }

    #[test]
    fn test_wrong_network() {
        assert_eq!(
            ClaimIdentity::parse("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", Network::Regtest),
            Err(IdentityError::WrongNetwork(Network::Regtest))
        );
    }

    #[test_case(""; "empty")]
    #[test_case("not-an-address"; "garbage")]
    #[test_case("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq."; "empty worker")]
    fn test_rejected(username: &str) {
        assert!(ClaimIdentity::parse(username, Network::Bitcoin).is_err());
    }

    #[test]
    fn test_claim_script_is_witness_program() {
        let identity =
            ClaimIdentity::parse("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", Network::Bitcoin)
                .unwrap();
        assert!(identity.claim_script().is_p2wpkh());
    }
}
