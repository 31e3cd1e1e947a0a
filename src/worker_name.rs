//! Worker-name parsing and filtering helpers used by `mining.authorize`.

use std::net::IpAddr;

/// Strips characters pool accounting systems reject: keeps ASCII alphanumerics plus
/// `_`, `-`, `.`; everything else is dropped.
pub fn filter_worker_name(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')).collect()
}

/// Splits `sub.worker` (or a bare name) into (sub_account, worker) on the first `.`.
/// A name with no `.` has an empty sub-account and the whole string as worker.
pub fn split_sub_account(full_name: &str) -> (&str, &str) {
    match full_name.find('.') {
        Some(idx) => (&full_name[..idx], &full_name[idx + 1..]),
        None => ("", full_name),
    }
}

/// Renders the remote IPv4 octets into `format`, replacing `{1}`..`{4}` with each octet.
/// Falls back to the default `{1}x{2}x{3}x{4}` shape for IPv6 by hashing nothing special —
/// the octets of an IPv4-mapped address are used directly, otherwise all four placeholders
/// are filled with `0`.
pub fn ip_as_worker_name(format: &str, addr: IpAddr) -> String {
    let octets = match addr {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.octets(),
            None => [0, 0, 0, 0],
        },
    };
    format
        .replace("{1}", &octets[0].to_string())
        .replace("{2}", &octets[1].to_string())
        .replace("{3}", &octets[2].to_string())
        .replace("{4}", &octets[3].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn filters_unsafe_characters() {
        assert_eq!(filter_worker_name("rig 01!"), "rig01");
        assert_eq!(filter_worker_name("rig_01-a.b"), "rig_01-a.b");
    }

    #[test]
    fn splits_on_first_dot_only() {
        assert_eq!(split_sub_account("user.rig.extra"), ("user", "rig.extra"));
        assert_eq!(split_sub_account("noseparator"), ("", "noseparator"));
    }

    #[test]
    fn formats_ip_worker_name() {
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(ip_as_worker_name("{1}x{2}x{3}x{4}", addr), "10x0x0x7");
    }
}
