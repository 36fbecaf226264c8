//! Property tests for target list parsing

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use synsweep::AddressRangeParser;

proptest! {
    #[test]
    fn ipv4_cidr_count_matches_prefix(base in any::<u32>(), prefix in 0u8..=32) {
        let text = format!("{}/{}", Ipv4Addr::from(base), prefix);
        let space = AddressRangeParser::new().parse(&text).unwrap();

        prop_assert_eq!(space.len(), 1u64 << (32 - prefix as u32));

        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix as u32) };
        prop_assert_eq!(space.get(0), Some(IpAddr::V4(Ipv4Addr::from(base & mask))));
        prop_assert_eq!(
            space.get(space.len() - 1),
            Some(IpAddr::V4(Ipv4Addr::from((base & mask) | !mask)))
        );
    }

    #[test]
    fn ipv6_cidr_count_matches_prefix(base in any::<u128>(), prefix in 65u8..=128) {
        let text = format!("{}/{}", Ipv6Addr::from(base), prefix);
        let space = AddressRangeParser::new().parse(&text).unwrap();
        prop_assert_eq!(space.len(), 1u64 << (128 - prefix as u32));
    }

    #[test]
    fn overlapping_ranges_enumerate_each_address_once(
        ranges in prop::collection::vec((0u16..2000, 0u16..300), 1..6)
    ) {
        let mut expected = BTreeSet::new();
        let mut lines = Vec::new();
        for (start, len) in &ranges {
            let first = u32::from(Ipv4Addr::new(10, 0, 0, 0)) + *start as u32;
            let last = first + *len as u32;
            lines.push(format!("{}-{}", Ipv4Addr::from(first), Ipv4Addr::from(last)));
            expected.extend((first..=last).map(|v| IpAddr::V4(Ipv4Addr::from(v))));
        }

        let space = AddressRangeParser::new().parse(&lines.join("\n")).unwrap();
        let enumerated: Vec<IpAddr> = space.iter().collect();

        prop_assert_eq!(space.len(), expected.len() as u64);
        prop_assert_eq!(enumerated, expected.into_iter().collect::<Vec<_>>());
    }
}

#[test]
fn test_total_count_matches_enumeration() {
    let text = "\
# lab hosts
10.0.0.0/29
10.0.0.4-10.0.0.12
\"192.168.0.1\",\"192.168.0.2\"
192.168.0.3|192.168.0.4
172.16.5.
2001:db8::1
2001:db8::/126
";
    let space = AddressRangeParser::new().parse(text).unwrap();
    assert_eq!(space.len(), space.iter().count() as u64);
    // 10.0.0.0-12, 172.16.5.0/24, 192.168.0.1-4, 2001:db8::0-3
    assert_eq!(space.len(), 13 + 256 + 4 + 4);
}
