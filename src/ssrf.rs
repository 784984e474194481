// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Outbound URL guard for user-supplied download targets
//! (URL download, modpack installs, addon fetches).
//!
//! Hostnames are checked as given; a name that later resolves to a private
//! address is not caught.

use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{AxisError, Result};

const BLOCKED_HOSTS: &[&str] = &[
    "localhost",
    "127.0.0.1",
    "0.0.0.0",
    "::1",
    "169.254.169.254",
    "metadata.google.internal",
    "metadata.internal",
];

/// Parse and vet a URL before any outbound fetch
pub fn check_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|_| AxisError::invalid("Invalid URL"))?;
    match url.scheme() {
        "http" | "https" => {}
        _ => return Err(AxisError::invalid("Only http and https URLs are allowed")),
    }

    let host = url.host_str().ok_or_else(|| AxisError::invalid("URL has no host"))?;
    let name = host.trim_start_matches('[').trim_end_matches(']').trim_end_matches('.').to_ascii_lowercase();
    if BLOCKED_HOSTS.contains(&name.as_str()) {
        return Err(AxisError::invalid("URL points to a blocked host"));
    }

    let private = match name.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_private_v4(ip),
        Ok(IpAddr::V6(ip)) => is_private_v6(ip),
        Err(_) => false,
    };
    if private {
        return Err(AxisError::invalid("URL points to a private address"));
    }
    Ok(url)
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 10
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
        || a == 127
        || (a == 169 && b == 254)
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let first = ip.segments()[0];
    // fc00::/7 unique local, fe80::/10 link local
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80 || ip.is_loopback()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_urls_pass() {
        assert!(check_url("https://cdn.modrinth.com/data/pack.mrpack").is_ok());
        assert!(check_url("http://93.184.216.34/file.jar").is_ok());
        assert!(check_url("https://172.32.0.1/x").is_ok());
    }

    #[test]
    fn blocked_hosts_and_schemes() {
        for bad in [
            "ftp://example.com/file",
            "file:///etc/passwd",
            "http://localhost:8080/",
            "http://LOCALHOST/",
            "http://169.254.169.254/latest/meta-data",
            "http://metadata.google.internal/computeMetadata/v1/",
            "http://[::1]/",
            "http://0.0.0.0/",
            "not a url",
        ] {
            assert!(check_url(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn private_ranges_rejected() {
        for bad in [
            "http://10.1.2.3/",
            "http://172.16.0.1/",
            "http://172.31.255.255/",
            "http://192.168.1.10/",
            "http://127.5.5.5/",
            "http://169.254.10.10/",
            "http://[fd12:3456::1]/",
            "http://[fe80::1]/",
            "http://[::ffff:10.0.0.1]/",
        ] {
            assert!(check_url(bad).is_err(), "{bad}");
        }
    }
}
