//! IP address anonymization
//!
//! IPv4 addresses become `0.0.0.0`, IPv6 addresses become `::`. Exempted
//! addresses (an injected [`IpExemption`]) are left as they are.

use super::{BoxedStage, StageFactory};
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use edgeproxy_core::{Event, EventStage, StageError};
use regex::bytes::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const IPV4_PATTERN: &str = r"([0-9]{1,3}\.){3}[0-9]{1,3}";

// Candidate must be delimited by a non-hex, non-colon byte on both sides;
// group 1 holds the address.
const IPV6_PATTERN: &str = r"(?i)(?:[^0-9a-f:])(([0-9a-f]{1,4}:){1,7}:|:(:[0-9a-f]{1,4}){1,7}|([0-9a-f]{1,4}:){1,7}[0-9a-f]{0,4}(:[0-9a-f]{1,4}){1,7})(?:[^0-9a-f:])";

const MASKED_V4: &[u8] = b"0.0.0.0";
const MASKED_V6: &[u8] = b"::";

/// Anonymizer settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnonymizeConfig {
    /// Also mask IPv6 addresses
    pub ipv6: bool,
    /// Addresses never masked
    pub exempt: Vec<IpAddr>,
}

impl Default for AnonymizeConfig {
    fn default() -> Self {
        Self {
            ipv6: true,
            exempt: Vec::new(),
        }
    }
}

/// Decides which addresses keep their value
pub trait IpExemption: Send + Sync {
    /// True when `ip` must not be masked
    fn is_exempt(&self, ip: &IpAddr) -> bool;
}

impl<F> IpExemption for F
where
    F: Fn(&IpAddr) -> bool + Send + Sync,
{
    fn is_exempt(&self, ip: &IpAddr) -> bool {
        self(ip)
    }
}

/// Shared anonymizer: compiled patterns plus the exemption predicate
///
/// Clones share the patterns, the predicate and the masked counter.
#[derive(Clone)]
pub struct Anonymizer {
    ipv4: Regex,
    ipv6: Option<Regex>,
    exemption: Arc<dyn IpExemption>,
    masked: Arc<AtomicU64>,
}

impl Anonymizer {
    /// Build from configuration; `exempt` addresses become the exemption
    pub fn from_config(config: &AnonymizeConfig) -> Result<Self> {
        let ipv4 = compile(IPV4_PATTERN)?;
        let ipv6 = if config.ipv6 {
            Some(compile(IPV6_PATTERN)?)
        } else {
            None
        };
        let exempt: HashSet<IpAddr> = config.exempt.iter().copied().collect();

        Ok(Self {
            ipv4,
            ipv6,
            exemption: Arc::new(move |ip: &IpAddr| exempt.contains(ip)),
            masked: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Replace the exemption predicate
    pub fn with_exemption(mut self, exemption: impl IpExemption + 'static) -> Self {
        self.exemption = Arc::new(exemption);
        self
    }

    /// Addresses masked so far
    pub fn masked(&self) -> u64 {
        self.masked.load(Ordering::Relaxed)
    }

    /// Masked copy of `message`, or `None` when nothing was replaced
    pub fn mask(&self, message: &[u8]) -> Option<Bytes> {
        let mut edits: Vec<(Range<usize>, &'static [u8])> = Vec::new();

        for found in self.ipv4.find_iter(message) {
            if let Some(ip) = parse::<Ipv4Addr>(found.as_bytes()) {
                if !self.exemption.is_exempt(&IpAddr::V4(ip)) {
                    edits.push((found.range(), MASKED_V4));
                }
            }
        }

        if let Some(ipv6) = &self.ipv6 {
            for caps in ipv6.captures_iter(message) {
                let Some(address) = caps.get(1) else {
                    continue;
                };
                if let Some(ip) = parse::<Ipv6Addr>(address.as_bytes()) {
                    if !self.exemption.is_exempt(&IpAddr::V6(ip)) {
                        edits.push((address.range(), MASKED_V6));
                    }
                }
            }
        }

        edits.retain(|(range, with)| &message[range.clone()] != *with);
        if edits.is_empty() {
            return None;
        }
        edits.sort_by_key(|(range, _)| range.start);

        let mut out = Vec::with_capacity(message.len());
        let mut cursor = 0;
        for (range, with) in &edits {
            // the two patterns can overlap on odd inputs; first edit wins
            if range.start < cursor {
                continue;
            }
            out.extend_from_slice(&message[cursor..range.start]);
            out.extend_from_slice(with);
            cursor = range.end;
        }
        out.extend_from_slice(&message[cursor..]);

        self.masked.fetch_add(edits.len() as u64, Ordering::Relaxed);
        Some(Bytes::from(out))
    }

    /// Wrap `upstream`
    pub fn stage<S: EventStage>(&self, upstream: S) -> AnonymizeStage<S> {
        AnonymizeStage {
            upstream,
            anonymizer: self.clone(),
            current: None,
        }
    }
}

impl StageFactory for Anonymizer {
    fn name(&self) -> &'static str {
        "anonymize"
    }

    fn wrap(&self, upstream: BoxedStage) -> BoxedStage {
        Box::new(self.stage(upstream))
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ProxyError::Config(format!("anonymize pattern: {e}")))
}

fn parse<T: std::str::FromStr>(raw: &[u8]) -> Option<T> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// Stage masking each record of one request
pub struct AnonymizeStage<S> {
    upstream: S,
    anonymizer: Anonymizer,
    /// Rewritten record; `None` means upstream's record is unchanged
    current: Option<Event>,
}

impl<S: EventStage> EventStage for AnonymizeStage<S> {
    fn name(&self) -> &'static str {
        "anonymize"
    }

    fn advance(&mut self) -> bool {
        self.current = None;
        if !self.upstream.advance() {
            return false;
        }
        if let Some(event) = self.upstream.current() {
            self.current = self
                .anonymizer
                .mask(&event.message)
                .map(|masked| event.derive(event.topic.clone(), masked));
        }
        true
    }

    fn current(&self) -> Option<&Event> {
        self.current.as_ref().or_else(|| self.upstream.current())
    }

    fn error(&self) -> Option<&StageError> {
        self.upstream.error()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use edgeproxy_core::{collect, VecStage};

    fn anonymizer() -> Anonymizer {
        Anonymizer::from_config(&AnonymizeConfig::default()).unwrap()
    }

    fn masked(anonymizer: &Anonymizer, input: &str) -> String {
        anonymizer
            .mask(input.as_bytes())
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .unwrap_or_else(|| input.to_string())
    }

    #[test]
    fn test_masks_ipv4_addresses() {
        let a = anonymizer();
        let input = r#"{"via":"74.115.4.69","ngx_var_remote_addr":"113.203.84.5","from_ip":"113.203.84.0"}"#;
        assert_eq!(
            masked(&a, input),
            r#"{"via":"0.0.0.0","ngx_var_remote_addr":"0.0.0.0","from_ip":"0.0.0.0"}"#
        );
        assert_eq!(a.masked(), 3);
    }

    #[test]
    fn test_out_of_range_octets_untouched() {
        let a = anonymizer();
        assert!(a.mask(br#"{"version":"999.1.2.3"}"#).is_none());
    }

    #[test]
    fn test_no_match_returns_none() {
        let a = anonymizer();
        assert!(a.mask(br#"{"event":"click"}"#).is_none());
        assert!(a.mask(b"").is_none());
        // already masked
        assert!(a.mask(br#"{"ip":"0.0.0.0"}"#).is_none());
    }

    #[test]
    fn test_masks_ipv6_addresses() {
        let a = anonymizer();
        for ip in ["2001:db8:a0b:12f0::1", "::12f0:0:1", "23:A9::", "3281:DF:1::12", "A::B"] {
            let input = format!(r#"{{"from_ip":"{ip}"}}"#);
            assert_eq!(masked(&a, &input), r#"{"from_ip":"::"}"#, "{ip}");
        }
    }

    #[test]
    fn test_full_ipv6_form() {
        let a = anonymizer();
        let input = r#"{"via": "2001:0db8:85a3:0000:0000:8a2e:0370:7334"}"#;
        assert_eq!(masked(&a, input), r#"{"via": "::"}"#);
    }

    #[test]
    fn test_ipv6_disabled() {
        let a = Anonymizer::from_config(&AnonymizeConfig {
            ipv6: false,
            exempt: vec![],
        })
        .unwrap();
        assert!(a.mask(br#"{"ip":"2001:db8::1"}"#).is_none());
        assert_eq!(masked(&a, r#"{"ip":"10.0.0.1"}"#), r#"{"ip":"0.0.0.0"}"#);
    }

    #[test]
    fn test_configured_exemptions() {
        let a = Anonymizer::from_config(&AnonymizeConfig {
            ipv6: true,
            exempt: vec!["10.0.0.1".parse().unwrap()],
        })
        .unwrap();
        assert_eq!(
            masked(&a, r#"{"a":"10.0.0.1","b":"10.0.0.2"}"#),
            r#"{"a":"10.0.0.1","b":"0.0.0.0"}"#
        );
    }

    #[test]
    fn test_injected_exemption() {
        let a = anonymizer().with_exemption(|ip: &IpAddr| ip.is_loopback());
        assert_eq!(
            masked(&a, r#"{"a":"127.0.0.1","b":"8.8.8.8"}"#),
            r#"{"a":"127.0.0.1","b":"0.0.0.0"}"#
        );
    }

    #[test]
    fn test_stage_rewrites_only_matching_records() {
        let a = anonymizer();
        let source = VecStage::new(vec![
            Event::new("t", r#"{"ip":"1.2.3.4"}"#, 0),
            Event::new("t", r#"{"ip":"none"}"#, 17),
        ])
        .with_error(StageError::Aborted("end".into()));

        let mut stage = a.stage(source);
        let (events, err) = collect(&mut stage);

        assert_eq!(events[0].message_str(), Some(r#"{"ip":"0.0.0.0"}"#));
        assert_eq!(events[0].offset, 0);
        assert_eq!(events[1].message_str(), Some(r#"{"ip":"none"}"#));
        assert_eq!(events[1].offset, 17);
        assert_eq!(err, Some(StageError::Aborted("end".into())));
    }

    #[test]
    fn test_factory_shares_counter() {
        let a = anonymizer();
        let mut stage = a.wrap(Box::new(VecStage::new(vec![Event::new("t", "9.9.9.9", 0)])));
        assert_eq!(StageFactory::name(&a), "anonymize");
        assert_eq!(stage.name(), "anonymize");

        let (events, _) = collect(&mut stage);
        assert_eq!(events[0].message_str(), Some("0.0.0.0"));
        assert_eq!(a.masked(), 1);
    }
}
