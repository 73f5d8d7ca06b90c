use hosthawk_rs::netdetect::{detect_local_cidrs, ipv4_to_default_cidr, source_addr_for};
use hosthawk_rs::targets::expand_targets;
use std::net::{IpAddr, Ipv4Addr};

#[test]
fn default_cidr_is_24() {
    let cidr = ipv4_to_default_cidr(Ipv4Addr::new(192, 168, 42, 99));
    assert_eq!(cidr.to_string(), "192.168.42.0/24");
}

#[test]
fn detected_networks_expand_to_hosts() {
    // Hosts without a non-loopback IPv4 interface simply detect nothing.
    let cidrs = detect_local_cidrs().expect("interface listing");
    for cidr in cidrs {
        assert_eq!(cidr.prefix_len(), 24);
        let hosts = expand_targets(&cidr.to_string()).unwrap();
        assert_eq!(hosts.remaining(), 254);
    }
}

#[test]
fn route_to_loopback_uses_loopback_source() {
    let src = source_addr_for(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
    assert_eq!(src, IpAddr::V4(Ipv4Addr::LOCALHOST));
}
