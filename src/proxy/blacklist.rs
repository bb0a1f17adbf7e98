//! Relay blacklist
//!
//! Domains known to reject or tarpit traffic arriving from anonymizing relay
//! exits. Matching is by substring so subdomains and country TLD variants are
//! covered by a single entry.

/// Domains that reject relay-circuit egress
const RELAY_HOSTILE_DOMAINS: &[&str] = &[
    "craigslist",
    "yelp",
    "expedia",
    "ticketmaster",
    "bestbuy",
    "walmart",
    "homedepot",
    "lowes",
    "target.com",
];

/// Check whether a domain is known to block relay-circuit egress
pub fn is_blocked(domain: &str) -> bool {
    RELAY_HOSTILE_DOMAINS
        .iter()
        .any(|entry| domain.contains(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_domains_match_by_substring() {
        assert!(is_blocked("craigslist.org"));
        assert!(is_blocked("www.craigslist.org"));
        assert!(is_blocked("sfbay.craigslist.org"));
        assert!(is_blocked("www.yelp.com"));
        assert!(is_blocked("www.ticketmaster.co.uk"));
    }

    #[test]
    fn test_unlisted_domains_pass() {
        assert!(!is_blocked("example.com"));
        assert!(!is_blocked("www.amazon.com"));
        assert!(!is_blocked("amazon.co.jp"));
        assert!(!is_blocked(""));
    }
}
