use super::map::RouteEntry;

/// Host part of `host:port`, `[v6]:port` or a bare host
pub fn strip_port(target: &str) -> &str {
    let target = target.trim();

    if let Some(rest) = target.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        };
    }

    // A bare IPv6 literal has more than one colon and no port
    if target.matches(':').count() > 1 {
        return target;
    }

    match target.split_once(':') {
        Some((host, _)) => host,
        None => target,
    }
}

/// First entry whose key contains, or is contained in, `target_address`
///
/// Containment in either direction lets a rule for `example.com` catch
/// `www.example.com`, and it also lets `a.com` catch `data.com`.
/// An empty address matches nothing.
pub fn match_route_for_target<'a>(
    target_address: &str,
    entries: &'a [RouteEntry],
) -> Option<&'a RouteEntry> {
    if target_address.is_empty() {
        return None;
    }

    entries.iter().find(|entry| {
        !entry.target.is_empty()
            && (target_address.contains(entry.target.as_str())
                || entry.target.contains(target_address))
    })
}
