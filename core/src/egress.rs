//! Pure template producer for the egress nftables ruleset: DNS to the
//! configured resolvers, TCP 443 to the package index and the webhook host,
//! everything else dropped. Applying the ruleset is external; the service
//! only renders and logs it at startup.

use std::net::IpAddr;
use std::net::ToSocketAddrs;

use crate::error::Result;
use crate::error::TriageErr;

const ALLOWED_HOSTS: &[&str] = &["pypi.org", "files.pythonhosted.org"];

pub fn render_nftables_rules(
    webhook_host: &str,
    dns_resolvers: &[String],
    resolver: &dyn Fn(&str) -> Vec<String>,
) -> String {
    let mut ip_set: Vec<String> = Vec::new();
    for host in ALLOWED_HOSTS.iter().copied().chain([webhook_host]) {
        for ip in resolver(host) {
            if !ip_set.contains(&ip) {
                ip_set.push(ip);
            }
        }
    }

    let ip_lines = ip_set.join(", ");
    let dns_lines = dns_resolvers.join(", ");
    format!(
        "table inet pkgtriage {{
  set allowed_tls_ips {{
    type ipv4_addr
    elements = {{ {ip_lines} }}
  }}
  set dns_resolvers {{
    type ipv4_addr
    elements = {{ {dns_lines} }}
  }}

  chain output {{
    type filter hook output priority 0;
    policy drop;

    oifname \"lo\" accept
    ct state established,related accept

    ip daddr @dns_resolvers udp dport 53 accept
    ip daddr @dns_resolvers tcp dport 53 accept

    ip daddr @allowed_tls_ips tcp dport 443 accept
  }}
}}
"
    )
}

/// Renders the ruleset for the configured webhook URL, resolving allowed
/// hosts via the live resolver.
pub fn render_rules_for_webhook(webhook_url: &str, dns_resolvers: &[String]) -> Result<String> {
    let parsed = reqwest::Url::parse(webhook_url)
        .map_err(|err| TriageErr::Config(format!("DISCORD_WEBHOOK_URL is not a URL: {err}")))?;
    let Some(host) = parsed.host_str() else {
        return Err(TriageErr::Config(
            "DISCORD_WEBHOOK_URL must include a hostname".to_string(),
        ));
    };
    Ok(render_nftables_rules(host, dns_resolvers, &resolve_ipv4))
}

/// Sorted, deduplicated IPv4 addresses for `host`; resolution failures
/// yield an empty set.
pub fn resolve_ipv4(host: &str) -> Vec<String> {
    let mut addrs: Vec<String> = match (host, 443u16).to_socket_addrs() {
        Ok(iter) => iter
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(v4) => Some(v4.to_string()),
                IpAddr::V6(_) => None,
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    addrs.sort();
    addrs.dedup();
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_resolver(host: &str) -> Vec<String> {
        match host {
            "pypi.org" => vec!["151.101.0.223".to_string()],
            "files.pythonhosted.org" => {
                vec!["151.101.0.223".to_string(), "151.101.64.223".to_string()]
            }
            "discord.example" => vec!["203.0.113.9".to_string()],
            _ => Vec::new(),
        }
    }

    #[test]
    fn ruleset_contains_deduplicated_ips_and_resolvers() {
        let rules = render_nftables_rules(
            "discord.example",
            &["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            &fake_resolver,
        );

        assert!(rules.contains("policy drop;"));
        assert!(rules.contains("151.101.0.223, 151.101.64.223, 203.0.113.9"));
        assert!(rules.contains("elements = { 1.1.1.1, 8.8.8.8 }"));
        assert_eq!(rules.matches("151.101.0.223").count(), 1);
    }

    #[test]
    fn webhook_renderer_extracts_the_host() {
        let rules = render_rules_for_webhook(
            "https://discord.example/api/webhooks/1/abc",
            &["1.1.1.1".to_string()],
        )
        .unwrap();
        assert!(rules.contains("table inet pkgtriage"));
    }

    #[test]
    fn webhook_url_without_host_is_rejected() {
        let err = render_rules_for_webhook("not a url", &["1.1.1.1".to_string()]).unwrap_err();
        assert!(err.to_string().contains("DISCORD_WEBHOOK_URL"));
    }
}
