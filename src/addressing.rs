//! URL addressing and proxy rewrite engine.
//!
//! Pure functions over raw sandbox URL strings. Parsing is best-effort and
//! total: malformed input never errors, it yields `None` or the original
//! string unchanged, because addressing must never be the reason a UI
//! blocks. Callers fall through to passthrough on "no match".

use url::Url;

use crate::sandbox::types::{REMOTE_DESKTOP_PORT, TERMINAL_PORT};

/// Hostname suffix of the cloud provider's per-port service URLs.
pub const CLOUD_HOST_SUFFIX: &str = "http.cloud.morph.so";

/// Domain serving this product's stable public proxy hostnames.
pub const PROXY_DOMAIN: &str = "manaflow.app";

/// Product prefix in proxy hostnames.
pub const PROXY_PREFIX: &str = "manaflow";

/// Hosts treated as local placeholders for the loopback rewrite.
const LOCAL_PLACEHOLDER_HOSTS: &[&str] =
    &["localhost", "127.0.0.1", "0.0.0.0", "host.docker.internal"];

/// One service port of one cloud VM, parsed out of a raw service URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmServiceHost {
    pub vm_id: String,
    pub port: u16,
}

/// Cloud-side hostname of one service port: `port-<port>-<vmId>.<suffix>`.
pub fn cloud_service_url(vm_id: &str, port: u16) -> String {
    format!("https://port-{port}-{vm_id}.{CLOUD_HOST_SUFFIX}")
}

fn proxy_host(vm_id: &str, scope: &str, port: u16) -> String {
    format!("{PROXY_PREFIX}-{vm_id}-{scope}-{port}.{PROXY_DOMAIN}")
}

/// Recognize the cloud provider's per-port hostname pattern and extract
/// the VM id and port. `None` when the URL does not match.
pub fn parse_vm_host(raw: &str) -> Option<VmServiceHost> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    let label = host.strip_suffix(CLOUD_HOST_SUFFIX)?.strip_suffix('.')?;
    let rest = label.strip_prefix("port-")?;
    let (port, vm_id) = rest.split_once('-')?;
    let port: u16 = port.parse().ok()?;
    if vm_id.is_empty() {
        return None;
    }
    Some(VmServiceHost {
        vm_id: vm_id.to_string(),
        port,
    })
}

/// Rewrite a raw service URL onto the product's proxy domain, preserving
/// path and query, so the VM's raw cloud hostname is never exposed to end
/// clients.
pub fn public_proxy_url(raw: &str, scope: &str, port: u16) -> Option<String> {
    let vm = parse_vm_host(raw)?;
    let mut url = Url::parse(raw).ok()?;
    url.set_host(Some(&proxy_host(&vm.vm_id, scope, port))).ok()?;
    Some(url.to_string())
}

/// If the raw URL points at a loopback/placeholder host and a preferred
/// origin is supplied, move it onto that origin keeping path and query.
/// Anything else passes through unchanged.
pub fn rewrite_loopback(raw: &str, preferred_origin: Option<&str>) -> String {
    let Some(origin) = preferred_origin else {
        return raw.to_string();
    };
    let Ok(url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let is_local = url
        .host_str()
        .map(|h| LOCAL_PLACEHOLDER_HOSTS.contains(&h))
        .unwrap_or(false);
    if !is_local {
        return raw.to_string();
    }
    let Ok(origin_url) = Url::parse(origin) else {
        return raw.to_string();
    };

    let mut out = url;
    if out.set_scheme(origin_url.scheme()).is_err() {
        return raw.to_string();
    }
    if out.set_host(origin_url.host_str()).is_err() {
        return raw.to_string();
    }
    let _ = out.set_port(origin_url.port());
    out.to_string()
}

/// Remote-desktop (noVNC) URL for the VM behind a raw service URL: fixed
/// port, fixed viewer path, autoconnect/reconnect query.
pub fn remote_desktop_url(raw: &str, direct: bool) -> Option<String> {
    let vm = parse_vm_host(raw)?;
    let host = if direct {
        format!("port-{REMOTE_DESKTOP_PORT}-{}.{CLOUD_HOST_SUFFIX}", vm.vm_id)
    } else {
        proxy_host(&vm.vm_id, "vnc", REMOTE_DESKTOP_PORT)
    };
    let mut url = Url::parse(&format!("https://{host}")).ok()?;
    url.set_path("/vnc.html");
    url.set_query(Some("autoconnect=1&resize=remote&reconnect=1"));
    Some(url.to_string())
}

/// Secure-websocket variant of the remote-desktop endpoint: fixed control
/// path, empty query.
pub fn remote_desktop_ws_url(raw: &str, direct: bool) -> Option<String> {
    let vm = parse_vm_host(raw)?;
    let host = if direct {
        format!("port-{REMOTE_DESKTOP_PORT}-{}.{CLOUD_HOST_SUFFIX}", vm.vm_id)
    } else {
        proxy_host(&vm.vm_id, "vnc", REMOTE_DESKTOP_PORT)
    };
    let mut url = Url::parse(&format!("https://{host}")).ok()?;
    url.set_scheme("wss").ok()?;
    url.set_path("/websockify");
    url.set_query(None);
    Some(url.to_string())
}

/// Base URL of the terminal-control service for the VM behind a raw
/// service URL. In direct-host mode the VM's own hostname is reachable and
/// the proxy rewrite is skipped.
pub fn terminal_base_url(raw: &str, direct: bool) -> Option<String> {
    let vm = parse_vm_host(raw)?;
    if direct {
        Some(cloud_service_url(&vm.vm_id, TERMINAL_PORT))
    } else {
        Some(format!("https://{}", proxy_host(&vm.vm_id, "terminal", TERMINAL_PORT)))
    }
}

/// All plausible base URLs for a target port, deduplicated and in probe
/// order: proxied hostname, direct cloud hostname, then naive port
/// substitution on the original URL. Used when the caller cannot know in
/// advance which addressing strategy is currently reachable.
pub fn service_base_urls(raw: &str, port: u16) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |candidate: String| {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    };

    if let Some(vm) = parse_vm_host(raw) {
        push(format!("https://{}", proxy_host(&vm.vm_id, "base", port)));
        push(cloud_service_url(&vm.vm_id, port));
    }
    if let Ok(mut url) = Url::parse(raw) {
        if url.set_port(Some(port)).is_ok() {
            push(url.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "https://port-39378-abc123.http.cloud.morph.so/?folder=/root/workspace";

    #[test]
    fn parse_vm_host_extracts_id_and_port() {
        let vm = parse_vm_host(RAW).unwrap();
        assert_eq!(vm.vm_id, "abc123");
        assert_eq!(vm.port, 39378);
    }

    #[test]
    fn parse_vm_host_allows_dashes_in_vm_id() {
        let vm =
            parse_vm_host("https://port-39383-morphvm-x7.http.cloud.morph.so/path").unwrap();
        assert_eq!(vm.vm_id, "morphvm-x7");
        assert_eq!(vm.port, 39383);
    }

    #[test]
    fn parse_vm_host_rejects_non_matching_urls() {
        assert!(parse_vm_host("https://example.com/").is_none());
        assert!(parse_vm_host("https://port-x-abc.http.cloud.morph.so/").is_none());
        assert!(parse_vm_host("https://39378-abc.http.cloud.morph.so/").is_none());
        assert!(parse_vm_host("not a url").is_none());
        assert!(parse_vm_host("").is_none());
    }

    #[test]
    fn public_proxy_rewrite_preserves_path_and_query() {
        let rewritten = public_proxy_url(RAW, "base", 39378).unwrap();
        assert_eq!(
            rewritten,
            "https://manaflow-abc123-base-39378.manaflow.app/?folder=/root/workspace"
        );
    }

    #[test]
    fn public_proxy_rewrite_no_match_is_none() {
        assert!(public_proxy_url("https://example.com/app", "base", 39378).is_none());
        assert!(public_proxy_url("garbage", "base", 39378).is_none());
    }

    #[test]
    fn remote_desktop_url_has_fixed_port_path_and_query() {
        let url = remote_desktop_url(RAW, false).unwrap();
        assert!(url.contains("39380"));
        assert!(url.contains("/vnc.html"));
        assert!(url.contains("autoconnect=1"));
        assert_eq!(
            url,
            "https://manaflow-abc123-vnc-39380.manaflow.app/vnc.html?autoconnect=1&resize=remote&reconnect=1"
        );
    }

    #[test]
    fn remote_desktop_url_direct_uses_cloud_hostname() {
        let url = remote_desktop_url(RAW, true).unwrap();
        assert!(url.starts_with("https://port-39380-abc123.http.cloud.morph.so"));
    }

    #[test]
    fn remote_desktop_ws_url_switches_scheme_and_clears_query() {
        let url = remote_desktop_ws_url(RAW, false).unwrap();
        assert_eq!(
            url,
            "wss://manaflow-abc123-vnc-39380.manaflow.app/websockify"
        );
    }

    #[test]
    fn terminal_base_url_proxied_and_direct() {
        assert_eq!(
            terminal_base_url(RAW, false).unwrap(),
            "https://manaflow-abc123-terminal-39383.manaflow.app"
        );
        assert_eq!(
            terminal_base_url(RAW, true).unwrap(),
            "https://port-39383-abc123.http.cloud.morph.so"
        );
    }

    #[test]
    fn derivations_never_panic_on_garbage() {
        for input in ["", "not a url", "https://example.com/x?y=z", "::::"] {
            assert!(remote_desktop_url(input, false).is_none());
            assert!(remote_desktop_ws_url(input, false).is_none());
            assert!(terminal_base_url(input, false).is_none());
        }
    }

    #[test]
    fn rewrite_loopback_moves_placeholder_hosts() {
        let out = rewrite_loopback(
            "http://localhost:39378/?folder=/root/workspace",
            Some("https://workspace.manaflow.app"),
        );
        assert_eq!(out, "https://workspace.manaflow.app/?folder=/root/workspace");
    }

    #[test]
    fn rewrite_loopback_keeps_origin_port() {
        let out = rewrite_loopback("http://127.0.0.1:39378/x", Some("http://10.0.0.5:8443"));
        assert_eq!(out, "http://10.0.0.5:8443/x");
    }

    #[test]
    fn rewrite_loopback_passthrough() {
        // Non-local host: unchanged.
        assert_eq!(rewrite_loopback(RAW, Some("https://p.example")), RAW);
        // No preferred origin: unchanged.
        assert_eq!(
            rewrite_loopback("http://localhost:1/x", None),
            "http://localhost:1/x"
        );
        // Garbage in, garbage out.
        assert_eq!(rewrite_loopback("::::", Some("https://p.example")), "::::");
    }

    #[test]
    fn service_base_urls_are_deduplicated_probe_candidates() {
        let urls = service_base_urls(RAW, 39383);
        assert_eq!(
            urls,
            vec![
                "https://manaflow-abc123-base-39383.manaflow.app".to_string(),
                "https://port-39383-abc123.http.cloud.morph.so".to_string(),
                "https://port-39378-abc123.http.cloud.morph.so:39383/?folder=/root/workspace"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn service_base_urls_on_non_cloud_url_falls_back_to_port_substitution() {
        let urls = service_base_urls("http://127.0.0.1:39378/", 39383);
        assert_eq!(urls, vec!["http://127.0.0.1:39383/".to_string()]);
    }

    #[test]
    fn service_base_urls_on_garbage_is_empty() {
        assert!(service_base_urls("not a url", 39383).is_empty());
    }
}
