use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaskParseError {
    #[error("empty address")]
    Empty,
    #[error("invalid octet `{0}`")]
    Octet(String),
    #[error("too many octets in `{0}`")]
    TooManyOctets(String),
    #[error("invalid prefix length `{0}`")]
    Prefix(String),
}

/// An IPv4 network given as address plus prefix length.
///
/// Parses dotted quads with an optional `/bits` suffix. Short forms are
/// accepted the way ban files usually write them: `10.0` means `10.0.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpMask {
    network: u32,
    prefix: u8,
}

impl IpMask {
    /// Builds a mask, clearing any host bits below the prefix.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, MaskParseError> {
        if prefix > 32 {
            return Err(MaskParseError::Prefix(prefix.to_string()));
        }
        let mask = prefix_to_mask(prefix);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix
    }

    pub fn mask(&self) -> u32 {
        prefix_to_mask(self.prefix)
    }

    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == self.network
    }
}

fn prefix_to_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p.min(32))),
    }
}

impl FromStr for IpMask {
    type Err = MaskParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MaskParseError::Empty);
        }

        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let mut octets = [0u8; 4];
        let mut count = 0usize;
        for part in addr_part.split('.') {
            if count == 4 {
                return Err(MaskParseError::TooManyOctets(addr_part.to_string()));
            }
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MaskParseError::Octet(part.to_string()));
            }
            octets[count] = part
                .parse()
                .map_err(|_| MaskParseError::Octet(part.to_string()))?;
            count += 1;
        }

        let prefix = match prefix_part {
            Some(p) => {
                if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(MaskParseError::Prefix(p.to_string()));
                }
                let bits: u8 = p.parse().map_err(|_| MaskParseError::Prefix(p.to_string()))?;
                if bits > 32 {
                    return Err(MaskParseError::Prefix(p.to_string()));
                }
                bits
            }
            None => (count * 8) as u8,
        };

        IpMask::new(Ipv4Addr::from(octets), prefix)
    }
}

impl fmt::Display for IpMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix == 32 {
            write!(f, "{}", self.network())
        } else {
            write!(f, "{}/{}", self.network(), self.prefix)
        }
    }
}
