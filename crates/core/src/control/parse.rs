//! Parsers for control-port replies
//!
//! Reply bodies arrive as the text after the three-digit status code and
//! separator; data blocks (`250+`) contribute one entry per line.

use super::error::ControlError;
use super::types::{
    CircuitHop, CircuitPurpose, CircuitState, CircuitStatus, Relay, RelayFlag, RelayInfo,
    StreamEvent, StreamStatus,
};
use anonroute_common::{CircuitId, CountryCode, Fingerprint};
use base64::{engine::general_purpose::STANDARD_NO_PAD as BASE64, Engine};
use std::net::IpAddr;

/// A single status line of a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplyLine {
    pub code: u16,
    pub separator: char,
    pub text: String,
}

impl ReplyLine {
    pub fn parse(line: &str) -> Result<Self, ControlError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 4 || !line.is_char_boundary(3) {
            return Err(ControlError::malformed(format!("short reply line '{}'", line)));
        }

        let code = line[..3]
            .parse::<u16>()
            .map_err(|_| ControlError::malformed(format!("bad status code in '{}'", line)))?;
        let separator = line[3..].chars().next().unwrap_or(' ');
        if !matches!(separator, ' ' | '-' | '+') {
            return Err(ControlError::malformed(format!("bad separator in '{}'", line)));
        }

        Ok(Self {
            code,
            separator,
            text: line[4..].to_string(),
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_async_event(&self) -> bool {
        self.code == 650
    }

    pub fn is_final(&self) -> bool {
        self.separator == ' '
    }

    pub fn starts_data(&self) -> bool {
        self.separator == '+'
    }
}

/// Parse router status entries (`GETINFO ns/all`, `ns/id/<fp>`)
pub fn parse_router_status(lines: &[String]) -> Result<Vec<Relay>, ControlError> {
    let mut relays = Vec::new();
    let mut current: Option<Relay> = None;

    for line in lines {
        let line = strip_getinfo_key(line);

        if let Some(rest) = line.strip_prefix("r ") {
            if let Some(relay) = current.take() {
                relays.push(relay);
            }
            current = Some(parse_r_line(rest)?);
        } else if let Some(rest) = line.strip_prefix("s ") {
            if let Some(relay) = current.as_mut() {
                relay.flags = rest
                    .split_whitespace()
                    .filter_map(|f| f.parse::<RelayFlag>().ok())
                    .collect();
            }
        }
    }

    if let Some(relay) = current.take() {
        relays.push(relay);
    }

    Ok(relays)
}

// r <nickname> <identity> <digest> <date> <time> <ip> <orport> <dirport>
fn parse_r_line(rest: &str) -> Result<Relay, ControlError> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 6 {
        return Err(ControlError::malformed(format!("router status line 'r {}'", rest)));
    }

    let nickname = fields[0];
    let identity = BASE64
        .decode(fields[1].trim_end_matches('='))
        .map_err(|e| ControlError::malformed(format!("relay identity {}: {}", fields[1], e)))?;
    let fingerprint = Fingerprint::from_slice(&identity)
        .map_err(|e| ControlError::malformed(format!("relay identity {}: {}", fields[1], e)))?;

    // The IP follows the publication date and time
    let ip = fields
        .iter()
        .skip(3)
        .find_map(|f| f.parse::<IpAddr>().ok())
        .ok_or_else(|| ControlError::malformed(format!("no address in 'r {}'", rest)))?;

    Ok(Relay::new(fingerprint, nickname, ip))
}

pub(crate) fn parse_relay_info(lines: &[String]) -> Result<RelayInfo, ControlError> {
    let relay = parse_router_status(lines)?
        .into_iter()
        .next()
        .ok_or_else(|| ControlError::malformed("relay info without router status"))?;

    Ok(RelayInfo {
        fingerprint: relay.fingerprint,
        nickname: relay.nickname,
        ip: relay.ip,
    })
}

/// Parse `GETINFO circuit-status`
pub fn parse_circuit_status(lines: &[String]) -> Result<Vec<CircuitStatus>, ControlError> {
    let mut circuits = Vec::new();

    for line in lines {
        let line = strip_getinfo_key(line).trim();
        if line.is_empty() || line == "OK" {
            continue;
        }
        circuits.push(parse_circuit_line(line)?);
    }

    Ok(circuits)
}

fn parse_circuit_line(line: &str) -> Result<CircuitStatus, ControlError> {
    let mut tokens = line.split_whitespace();

    let circuit_id = tokens
        .next()
        .and_then(|t| t.parse::<CircuitId>().ok())
        .ok_or_else(|| ControlError::malformed(format!("circuit line '{}'", line)))?;
    let state = tokens
        .next()
        .map(|t| t.parse::<CircuitState>().unwrap_or(CircuitState::Other(t.to_string())))
        .ok_or_else(|| ControlError::malformed(format!("circuit line '{}'", line)))?;

    let mut relays = Vec::new();
    let mut purpose = CircuitPurpose::General;

    for token in tokens {
        if token.starts_with('$') {
            relays = parse_path(token)?;
        } else if let Some(value) = token.strip_prefix("PURPOSE=") {
            purpose = value.parse().unwrap_or(CircuitPurpose::Other(value.to_string()));
        }
    }

    Ok(CircuitStatus {
        circuit_id,
        state,
        purpose,
        relays,
    })
}

// $FP~nick,$FP=nick,$FP
fn parse_path(token: &str) -> Result<Vec<CircuitHop>, ControlError> {
    token
        .split(',')
        .map(|hop| {
            let (fp, nickname) = match hop.find(['~', '=']) {
                Some(idx) => (&hop[..idx], Some(hop[idx + 1..].to_string())),
                None => (hop, None),
            };
            let fingerprint = Fingerprint::from_hex(fp)
                .map_err(|e| ControlError::malformed(format!("circuit hop '{}': {}", hop, e)))?;
            Ok(CircuitHop {
                fingerprint,
                nickname,
            })
        })
        .collect()
}

/// Parse `650 STREAM <id> <status> <circ> <target> ...`
pub fn parse_stream_event(line: &str) -> Result<StreamEvent, ControlError> {
    let body = line.strip_prefix("650 ").unwrap_or(line);
    let body = body
        .strip_prefix("STREAM ")
        .ok_or_else(|| ControlError::malformed(format!("not a stream event: '{}'", line)))?;

    let fields: Vec<&str> = body.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(ControlError::malformed(format!("stream event '{}'", line)));
    }

    let status = fields[1]
        .parse::<StreamStatus>()
        .unwrap_or(StreamStatus::Other(fields[1].to_string()));
    let circuit_id = fields[2].parse::<CircuitId>().ok();

    Ok(StreamEvent::new(fields[0], status, circuit_id, fields[3]))
}

/// Parse `EXTENDED <circuit id>`
pub(crate) fn parse_extended(lines: &[String]) -> Result<CircuitId, ControlError> {
    lines
        .iter()
        .find_map(|l| l.strip_prefix("EXTENDED "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse::<CircuitId>().ok())
        .ok_or_else(|| ControlError::malformed(format!("extend reply {:?}", lines)))
}

/// Parse `ip-to-country/<ip>=<cc>` rows; `??` means unknown
pub(crate) fn parse_ip_to_country(lines: &[String]) -> Vec<(String, Option<CountryCode>)> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("ip-to-country/"))
        .filter_map(|rest| rest.split_once('='))
        .map(|(ip, cc)| {
            let cc = cc.trim();
            let country = if cc.is_empty() || cc == "??" {
                None
            } else {
                Some(CountryCode::new(cc))
            };
            (ip.trim().to_string(), country)
        })
        .collect()
}

// "ns/all=" / "circuit-status=" lead the first line of a data reply
fn strip_getinfo_key(line: &str) -> &str {
    match line.split_once('=') {
        Some((key, rest))
            if !key.contains(' ') && (key.starts_with("ns/") || key == "circuit-status") =>
        {
            rest
        }
        _ => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    // base64 of 20 bytes of 0x00 and 0x11
    const ID_ZERO: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const ID_ONES: &str = "ERERERERERERERERERERERERERE";

    #[test]
    fn reply_line_parsing() {
        let line = ReplyLine::parse("250-version=0.4.8").unwrap();
        assert_eq!(line.code, 250);
        assert!(!line.is_final());
        assert_eq!(line.text, "version=0.4.8");

        assert!(ReplyLine::parse("25").is_err());
        assert!(ReplyLine::parse("abc OK").unwrap_err().is_malformed());
        assert!(ReplyLine::parse("650 STREAM 1 NEW 0 a:1").unwrap().is_async_event());
    }

    #[test]
    fn router_status_entries() {
        let raw = lines(&[
            "ns/all=",
            &format!("r relayA {} digest 2024-01-01 00:00:00 10.0.0.1 9001 0", ID_ZERO),
            "s Exit Fast Running Stable Valid",
            "w Bandwidth=100",
            &format!("r relayB {} digest 2024-01-01 00:00:00 10.0.0.2 9001 0", ID_ONES),
            "s Guard Running Stable",
        ]);

        let relays = parse_router_status(&raw).unwrap();
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].nickname, "relayA");
        assert_eq!(relays[0].fingerprint, Fingerprint::from_bytes([0; 20]));
        assert!(relays[0].has_flag(&RelayFlag::Exit));
        assert_eq!(relays[1].fingerprint, Fingerprint::from_bytes([0x11; 20]));
        assert_eq!(relays[1].ip.to_string(), "10.0.0.2");
        assert!(relays[1].has_flag(&RelayFlag::Guard));
        assert!(relays[1].country.is_none());
    }

    #[test]
    fn router_status_rejects_bad_identity() {
        let raw = lines(&["r relayA !!! digest 2024-01-01 00:00:00 10.0.0.1 9001 0"]);
        assert!(parse_router_status(&raw).unwrap_err().is_malformed());
    }

    #[test]
    fn circuit_status_rows() {
        let fp_a = "A".repeat(40);
        let fp_b = "B".repeat(40);
        let raw = lines(&[
            "circuit-status=",
            &format!(
                "7 BUILT ${}~alpha,${}=beta BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL",
                fp_a, fp_b
            ),
            "8 LAUNCHED BUILD_FLAGS=NEED_CAPACITY PURPOSE=HS_VANGUARDS",
            "9 CLOSED REASON=FINISHED",
        ]);

        let circuits = parse_circuit_status(&raw).unwrap();
        assert_eq!(circuits.len(), 3);
        assert_eq!(circuits[0].circuit_id, CircuitId(7));
        assert_eq!(circuits[0].state, CircuitState::Built);
        assert_eq!(circuits[0].relays.len(), 2);
        assert_eq!(circuits[0].relays[0].nickname.as_deref(), Some("alpha"));
        assert_eq!(
            circuits[1].purpose,
            CircuitPurpose::Other("HS_VANGUARDS".into())
        );
        assert!(circuits[1].relays.is_empty());
        assert!(circuits[2].state.is_terminal());
    }

    #[test]
    fn circuit_status_single_line_form() {
        let raw = lines(&["circuit-status=3 FAILED PURPOSE=GENERAL"]);
        let circuits = parse_circuit_status(&raw).unwrap();
        assert_eq!(circuits[0].circuit_id, CircuitId(3));
        assert_eq!(circuits[0].state, CircuitState::Failed);
    }

    #[test]
    fn circuit_status_empty() {
        assert!(parse_circuit_status(&lines(&["circuit-status=", "OK"]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn stream_events() {
        let event = parse_stream_event("650 STREAM 21 NEW 0 example.com:443 SOURCE=SOCKS").unwrap();
        assert_eq!(event.stream_id, "21");
        assert_eq!(event.status, StreamStatus::New);
        assert!(event.is_unattached());
        assert_eq!(event.target, "example.com:443");

        let remap = parse_stream_event("STREAM 21 REMAP 12 93.184.216.34:443").unwrap();
        assert_eq!(remap.status, StreamStatus::Remap);
        assert_eq!(remap.circuit_id, Some(CircuitId(12)));

        assert!(parse_stream_event("650 CIRC 1 BUILT").is_err());
    }

    #[test]
    fn extended_and_country_replies() {
        assert_eq!(
            parse_extended(&lines(&["EXTENDED 42"])).unwrap(),
            CircuitId(42)
        );
        assert!(parse_extended(&lines(&["OK"])).is_err());

        let countries = parse_ip_to_country(&lines(&[
            "ip-to-country/10.0.0.1=de",
            "ip-to-country/10.0.0.2=??",
            "OK",
        ]));
        assert_eq!(
            countries,
            vec![
                ("10.0.0.1".to_string(), Some(CountryCode::new("DE"))),
                ("10.0.0.2".to_string(), None),
            ]
        );
    }
}
