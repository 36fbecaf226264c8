//! Target list parsing into an ordered, deduplicated address space
//!
//! Accepted record forms, one or more per line:
//!
//! - single address: `10.0.0.1`, `2001:db8::1`, or with a port suffix that is
//!   ignored: `10.0.0.1:443`, `[2001:db8::1]:443`
//! - CIDR block: `10.0.0.0/30`, `2001:db8::/120` (network and broadcast
//!   addresses included)
//! - explicit range: `10.0.0.1-10.0.0.9`, `2001:db8::1-2001:db8::ff`, or with
//!   an abbreviated last octet: `10.0.0.1-9`
//! - per-octet range: `10.0.1-2.0-255` (from the octet minimums to the octet
//!   maximums)
//! - trailing-dot prefix: `10.0.0.` for `10.0.0.0-10.0.0.255`
//! - range with CIDR ends: `10.0.0.0/24-10.0.1.255`, `10.0.0.0-10.0.1.0/24`
//!
//! Records on one line are separated by `,` or `|` and may be quoted. Lines
//! starting with `#` are comments.

use crate::network::{addr_to_u128, AddressFamily};
use crate::ScanError;
use ipnetwork::IpNetwork;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Inclusive run of consecutive addresses of one family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressBlock {
    pub family: AddressFamily,
    pub first: u128,
    pub last: u128,
}

impl AddressBlock {
    fn new(first: IpAddr, last: IpAddr) -> crate::Result<Self> {
        let family = AddressFamily::of(&first);
        if AddressFamily::of(&last) != family {
            return Err(ScanError::InvalidTarget(format!(
                "Range {}-{} mixes address families",
                first, last
            )));
        }

        let (first, last) = (addr_to_u128(&first), addr_to_u128(&last));
        if first > last {
            return Err(ScanError::InvalidTarget(format!(
                "Range start {} is after its end {}",
                family.addr_from_u128(first),
                family.addr_from_u128(last)
            )));
        }

        let block = Self {
            family,
            first,
            last,
        };
        block.count()?;
        Ok(block)
    }

    /// Number of addresses, if it fits in a u64
    pub fn count(&self) -> crate::Result<u64> {
        let span = self.last - self.first;
        if span >= u64::MAX as u128 {
            return Err(ScanError::InvalidTarget(format!(
                "Block {} holds more than 2^64 - 1 addresses",
                self
            )));
        }
        Ok(span as u64 + 1)
    }

    pub fn first_addr(&self) -> IpAddr {
        self.family.addr_from_u128(self.first)
    }

    pub fn last_addr(&self) -> IpAddr {
        self.family.addr_from_u128(self.last)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        AddressFamily::of(addr) == self.family && {
            let value = addr_to_u128(addr);
            self.first <= value && value <= self.last
        }
    }
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first_addr())
        } else {
            write!(f, "{}-{}", self.first_addr(), self.last_addr())
        }
    }
}

/// Immutable, ordered set of scan targets
///
/// IPv4 blocks come first, then IPv6, each ascending. Overlapping and
/// adjacent blocks are merged, so every address appears exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpace {
    blocks: Vec<AddressBlock>,
    /// Index of the first address of each block
    offsets: Vec<u64>,
    total: u64,
}

impl AddressSpace {
    /// Canonicalise arbitrary blocks into an address space
    pub fn from_blocks(mut blocks: Vec<AddressBlock>) -> crate::Result<Self> {
        blocks.sort_unstable();

        let mut merged: Vec<AddressBlock> = Vec::with_capacity(blocks.len());
        for block in blocks {
            match merged.last_mut() {
                Some(prev)
                    if prev.family == block.family
                        && block.first <= prev.last.saturating_add(1) =>
                {
                    prev.last = prev.last.max(block.last);
                }
                _ => merged.push(block),
            }
        }

        let mut offsets = Vec::with_capacity(merged.len());
        let mut total = 0u64;
        for block in &merged {
            offsets.push(total);
            total = total.checked_add(block.count()?).ok_or_else(|| {
                ScanError::InvalidTarget(
                    "Address space holds more than 2^64 - 1 addresses".to_string(),
                )
            })?;
        }

        if total == 0 {
            return Err(ScanError::InvalidTarget(
                "Address space holds no addresses".to_string(),
            ));
        }

        Ok(Self {
            blocks: merged,
            offsets,
            total,
        })
    }

    /// Total number of addresses
    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn blocks(&self) -> &[AddressBlock] {
        &self.blocks
    }

    /// Families present, IPv4 first
    pub fn families(&self) -> Vec<AddressFamily> {
        let mut families: Vec<AddressFamily> = self.blocks.iter().map(|b| b.family).collect();
        families.dedup();
        families
    }

    /// Address at position `index` in scan order
    pub fn get(&self, index: u64) -> Option<IpAddr> {
        if index >= self.total {
            return None;
        }
        let block_index = self.offsets.partition_point(|&offset| offset <= index) - 1;
        let block = &self.blocks[block_index];
        let value = block.first + (index - self.offsets[block_index]) as u128;
        Some(block.family.addr_from_u128(value))
    }

    /// Every address in scan order
    pub fn iter(&self) -> impl Iterator<Item = IpAddr> + Send + '_ {
        self.blocks
            .iter()
            .flat_map(|block| (block.first..=block.last).map(move |v| block.family.addr_from_u128(v)))
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        let family = AddressFamily::of(addr);
        let value = addr_to_u128(addr);
        let idx = self
            .blocks
            .partition_point(|b| (b.family, b.first) <= (family, value));
        idx > 0 && self.blocks[idx - 1].contains(addr)
    }
}

/// Characters stripped from both ends of lines and records
fn is_trimmed(c: char) -> bool {
    matches!(c, ',' | '|' | '"' | '\'') || c.is_whitespace()
}

/// Parser for newline-separated target records
#[derive(Debug, Clone, Default)]
pub struct AddressRangeParser {
    max_addresses: Option<u64>,
}

impl AddressRangeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject inputs that expand to more than `max` addresses
    pub fn with_max_addresses(mut self, max: u64) -> Self {
        self.max_addresses = Some(max);
        self
    }

    /// Parse a whole target list
    ///
    /// Malformed records are skipped with a warning. Fails when nothing
    /// usable remains.
    pub fn parse(&self, text: &str) -> crate::Result<AddressSpace> {
        let mut blocks = Vec::new();
        let mut skipped = 0usize;

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim_matches(is_trimmed);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            for record in line.split(|c| c == ',' || c == '|') {
                let record = record.trim_matches(is_trimmed);
                if record.is_empty() {
                    continue;
                }
                match Self::parse_record(record) {
                    Ok(block) => blocks.push(block),
                    Err(e) => {
                        skipped += 1;
                        log::warn!("Skipping record {:?} on line {}: {}", record, line_no + 1, e);
                    }
                }
            }
        }

        if blocks.is_empty() {
            return Err(ScanError::InvalidTarget(if skipped > 0 {
                format!("No valid targets ({} malformed records)", skipped)
            } else {
                "No targets given".to_string()
            }));
        }

        let block_count = blocks.len();
        let space = AddressSpace::from_blocks(blocks)?;

        if let Some(max) = self.max_addresses {
            if space.len() > max {
                return Err(ScanError::InvalidTarget(format!(
                    "{} addresses exceeds the limit of {}",
                    space.len(),
                    max
                )));
            }
        }

        log::info!(
            "Parsed {} addresses from {} records ({} merged blocks, {} skipped)",
            space.len(),
            block_count,
            space.blocks().len(),
            skipped
        );
        Ok(space)
    }

    /// Parse one record into a block
    pub fn parse_record(record: &str) -> crate::Result<AddressBlock> {
        if record.contains('-') && record.contains('/') {
            Self::parse_cidr_range(record)
        } else if record.contains('-') {
            if record.split('.').count() == 4 {
                Self::parse_octet_range(record)
            } else {
                Self::parse_explicit_range(record)
            }
        } else if record.ends_with('.') {
            Self::parse_trailing_dot(record)
        } else if record.contains('/') {
            Self::parse_cidr(record)
        } else {
            Self::parse_single(record)
        }
    }

    fn cidr_bounds(text: &str) -> crate::Result<(IpAddr, IpAddr)> {
        let network = IpNetwork::from_str(text)?;
        let family = AddressFamily::of(&network.ip());
        let host_bits = u32::from(family.bits() - network.prefix());
        let host_mask = if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };

        let first = addr_to_u128(&network.ip()) & !host_mask;
        let last = first | host_mask;
        Ok((family.addr_from_u128(first), family.addr_from_u128(last)))
    }

    /// `10.0.0.0/30`
    fn parse_cidr(record: &str) -> crate::Result<AddressBlock> {
        let (first, last) = Self::cidr_bounds(record)?;
        AddressBlock::new(first, last)
    }

    /// `10.0.0.0/24-10.0.1.255`, `10.0.0.0-10.0.1.0/24` or `10.0.0.0/24-10.0.0.0`
    fn parse_cidr_range(record: &str) -> crate::Result<AddressBlock> {
        let (left, right) = record
            .split_once('-')
            .ok_or_else(|| ScanError::InvalidTarget(record.to_string()))?;

        let begin_text = left.split('/').next().unwrap_or(left);
        let begin = IpAddr::from_str(begin_text)?;

        // A right side equal to the left base address means "the left block"
        let end = if left.contains('/') && !right.contains('/') && begin_text == right {
            Self::cidr_bounds(left)?.1
        } else if right.contains('/') {
            Self::cidr_bounds(right)?.1
        } else {
            IpAddr::from_str(right)?
        };

        AddressBlock::new(begin, end)
    }

    /// `10.0.1-2.0-255`, `10.0.0.1-20`
    fn parse_octet_range(record: &str) -> crate::Result<AddressBlock> {
        let mut begin = [0u8; 4];
        let mut end = [0u8; 4];

        for (i, part) in record.split('.').enumerate() {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (lo.parse::<u8>()?, hi.parse::<u8>()?),
                None => {
                    let octet = part.parse::<u8>()?;
                    (octet, octet)
                }
            };
            begin[i] = lo;
            end[i] = hi;
        }

        AddressBlock::new(
            IpAddr::V4(Ipv4Addr::from(begin)),
            IpAddr::V4(Ipv4Addr::from(end)),
        )
    }

    /// `10.0.0.1-10.0.0.9`, `10.0.0.1-9`, `2001:db8::1-2001:db8::ff`
    fn parse_explicit_range(record: &str) -> crate::Result<AddressBlock> {
        let (begin_text, end_text) = record
            .split_once('-')
            .ok_or_else(|| ScanError::InvalidTarget(record.to_string()))?;
        let begin = IpAddr::from_str(begin_text)?;

        let end = match (begin, end_text.len()) {
            (IpAddr::V4(v4), 1..=3) => {
                let mut octets = v4.octets();
                octets[3] = end_text.parse::<u8>()?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            _ => IpAddr::from_str(end_text)?,
        };

        AddressBlock::new(begin, end)
    }

    /// `10.0.0.`
    fn parse_trailing_dot(record: &str) -> crate::Result<AddressBlock> {
        let first = Ipv4Addr::from_str(&format!("{}0", record))?;
        let last = Ipv4Addr::from_str(&format!("{}255", record))?;
        AddressBlock::new(IpAddr::V4(first), IpAddr::V4(last))
    }

    /// `10.0.0.1`, `10.0.0.1:443`, `[2001:db8::1]:443`
    fn parse_single(record: &str) -> crate::Result<AddressBlock> {
        let addr = match IpAddr::from_str(record) {
            Ok(addr) => addr,
            Err(e) => match SocketAddr::from_str(record) {
                Ok(socket_addr) => socket_addr.ip(),
                Err(_) => return Err(e.into()),
            },
        };
        AddressBlock::new(addr, addr)
    }
}
