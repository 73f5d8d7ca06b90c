use hosthawk_rs::targets::{load_ports_file, parse_ports_list};
use hosthawk_rs::{expand_ports, expand_targets, ValidationKind};
use std::io::Write;

#[test]
fn mixed_expression_is_sorted_and_deduplicated() {
    assert_eq!(expand_ports("80,22,1000-1002").unwrap(), vec![22, 80, 1000, 1001, 1002]);
    assert_eq!(expand_ports("443,443,1-3,2").unwrap(), vec![1, 2, 3, 443]);
}

#[test]
fn malformed_expressions_never_yield_an_empty_set() {
    for bad in ["70000", "0", "10-1", "abc", "", ",", "1-2-3"] {
        assert!(expand_ports(bad).is_err(), "{bad:?} should be rejected");
    }
    assert_eq!(expand_ports("70000").unwrap_err().input, "70000");
}

#[test]
fn full_range_stays_within_bounds() {
    let ports = expand_ports("1-65535").unwrap();
    assert_eq!(ports.len(), 65535);
    assert_eq!(ports.first(), Some(&1));
    assert_eq!(ports.last(), Some(&65535));
}

#[test]
fn ports_file_with_comments() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# common ports\n22\n80  # http\n8000-8002\n8001").unwrap();
    assert_eq!(load_ports_file(file.path()).unwrap(), vec![22, 80, 8000, 8001, 8002]);
}

#[test]
fn ports_list_rejects_invalid_lines() {
    assert_eq!(parse_ports_list("22\n0\n").unwrap_err().kind, ValidationKind::PortRange);
    assert!(parse_ports_list("# only comments\n").is_err());
}

#[test]
fn cidr_expansion_is_deterministic() {
    let a: Vec<_> = expand_targets("10.9.8.0/28").unwrap().collect();
    let b: Vec<_> = expand_targets("10.9.8.0/28").unwrap().collect();
    assert_eq!(a, b);
    assert_eq!(a.len(), 14);
    assert_eq!(expand_targets("10.9.8.0/28").unwrap().size_hint(), (14, Some(14)));
}
