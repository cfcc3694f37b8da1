//! Field redaction for device payloads relayed upstream.
//!
//! A [`RuleSet`] is built once at startup from the `[redaction]` config
//! section and shared read-only by every request handler. It holds:
//!
//! - **global rules** applied to every JSON body,
//! - **route rules** applied only when the request path matches a
//!   [`RoutePattern`],
//! - a **header allowlist**; headers not on it are never forwarded.
//!
//! Each rule either removes a field or masks it with a placeholder value.
//! Redaction never mutates its input, skips absent fields, and is idempotent.

pub mod path;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName};
use serde_json::{Map, Value};
use tracing::debug;

pub use path::{FieldPath, RoutePattern};

use crate::config::{ActionKind, RedactionConfig, RuleConfig};
use crate::error::{Result, SipGuardError};

/// Placeholder used by `mask` rules that don't specify a value.
pub const DEFAULT_MASK: &str = "[REDACTED]";

/// What happens to a field matched by a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldAction {
    Remove,
    Mask(Value),
}

/// A compiled field rule.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub path: FieldPath,
    pub action: FieldAction,
}

impl FieldRule {
    pub fn from_config(config: &RuleConfig) -> Result<Self> {
        let path = FieldPath::parse(&config.field).ok_or_else(|| {
            SipGuardError::ConfigInvalid(format!("invalid redaction field path {:?}", config.field))
        })?;
        let action = match config.action {
            ActionKind::Remove => FieldAction::Remove,
            ActionKind::Mask => FieldAction::Mask(
                config
                    .value
                    .clone()
                    .unwrap_or_else(|| Value::String(DEFAULT_MASK.to_string())),
            ),
        };
        Ok(Self { path, action })
    }

    /// Returns true if the payload changed.
    fn apply(&self, map: &mut Map<String, Value>) -> bool {
        match &self.action {
            FieldAction::Remove => self.path.remove_from(map),
            FieldAction::Mask(placeholder) => self.path.mask_in(map, placeholder),
        }
    }
}

#[derive(Debug, Clone)]
struct RouteRules {
    pattern: RoutePattern,
    rules: Vec<FieldRule>,
}

/// The process-wide, immutable redaction rule set.
#[derive(Debug, Clone)]
pub struct RuleSet {
    global: Vec<FieldRule>,
    routes: Vec<RouteRules>,
    forward_headers: Vec<HeaderName>,
}

impl RuleSet {
    /// Compile a rule set from configuration.
    pub fn from_config(config: &RedactionConfig) -> Result<Self> {
        let global = config
            .rules
            .iter()
            .map(FieldRule::from_config)
            .collect::<Result<Vec<_>>>()?;

        let mut routes = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            routes.push(RouteRules {
                pattern: RoutePattern::parse(&route.path),
                rules: route
                    .rules
                    .iter()
                    .map(FieldRule::from_config)
                    .collect::<Result<Vec<_>>>()?,
            });
        }

        let forward_headers = config
            .forward_headers
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()).map_err(|_| {
                    SipGuardError::ConfigInvalid(format!("invalid header name {:?}", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            global,
            routes,
            forward_headers,
        })
    }

    /// A rule set that redacts nothing and forwards no headers.
    pub fn empty() -> Self {
        Self {
            global: Vec::new(),
            routes: Vec::new(),
            forward_headers: Vec::new(),
        }
    }

    /// Whether any route-scoped rule applies to `path`.
    pub fn has_route_rules(&self, path: &str) -> bool {
        self.routes.iter().any(|r| r.pattern.matches(path))
    }

    fn rules_for<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a FieldRule> + 'a {
        self.global.iter().chain(
            self.routes
                .iter()
                .filter(move |r| r.pattern.matches(path))
                .flat_map(|r| r.rules.iter()),
        )
    }

    /// Return a redacted copy of `payload` for a request to `path`.
    ///
    /// Objects are redacted in place on the copy; top-level arrays are
    /// redacted element by element; other values are returned unchanged.
    pub fn redact(&self, path: &str, payload: &Value) -> Value {
        let mut out = payload.clone();
        let changed = match &mut out {
            Value::Object(map) => self.redact_object(path, map),
            Value::Array(items) => items
                .iter_mut()
                .filter_map(|item| item.as_object_mut())
                .map(|map| self.redact_object(path, map))
                .fold(0, |acc, n| acc + n),
            _ => 0,
        };
        if changed > 0 {
            debug!("Redacted {} field(s) for {}", changed, path);
        }
        out
    }

    fn redact_object(&self, path: &str, map: &mut Map<String, Value>) -> usize {
        self.rules_for(path).filter(|rule| rule.apply(map)).count()
    }

    /// Redact a raw request body.
    ///
    /// - empty bodies stay empty;
    /// - JSON bodies are redacted; if nothing changed the original bytes are
    ///   returned untouched;
    /// - non-JSON bodies pass through unless a route rule targets `path`, in
    ///   which case they are dropped.
    pub fn redact_body(&self, path: &str, body: &[u8]) -> Bytes {
        if body.is_empty() {
            return Bytes::new();
        }
        match serde_json::from_slice::<Value>(body) {
            Ok(original) => {
                let redacted = self.redact(path, &original);
                if redacted == original {
                    return Bytes::copy_from_slice(body);
                }
                match serde_json::to_vec(&redacted) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(_) => Bytes::new(),
                }
            }
            Err(_) if self.has_route_rules(path) => {
                debug!("Dropping non-JSON body for {}", path);
                Bytes::new()
            }
            Err(_) => Bytes::copy_from_slice(body),
        }
    }

    /// Keep only allowlisted headers.
    pub fn filter_headers(&self, headers: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in headers.iter() {
            if self.forward_headers.contains(name) {
                out.append(name.clone(), value.clone());
            }
        }
        out
    }
}

impl Default for RuleSet {
    /// The built-in rule set, identical to an empty `[redaction]` section.
    fn default() -> Self {
        Self::from_config(&RedactionConfig::default()).expect("built-in redaction rules are valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn strips_geolocation_and_device_id() {
        let rules = RuleSet::default();
        let input = json!({"lat": 43.6, "lon": -79.4, "device_id": "abc123", "volume_ml": 250});
        let out = rules.redact("/parse/classes/Sip", &input);
        assert_eq!(out, json!({"volume_ml": 250}));
    }

    #[test]
    fn input_is_not_mutated() {
        let rules = RuleSet::default();
        let input = json!({"lat": 1.0, "keep": true});
        let snapshot = input.clone();
        let _ = rules.redact("/anything", &input);
        assert_eq!(input, snapshot);
    }

    #[test]
    fn unknown_fields_pass_through_in_order() {
        let rules = RuleSet::default();
        let input = json!({"z": 1, "lat": 2, "a": {"nested": [1, 2, 3]}, "m": "text"});
        let out = rules.redact("/parse/classes/Sip", &input);
        let keys: Vec<&String> = out.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
        assert_eq!(out["a"], json!({"nested": [1, 2, 3]}));
    }

    #[test]
    fn redaction_is_idempotent() {
        let rules = RuleSet::default();
        let inputs = [
            ("/parse/classes/Day/d1", json!({"altitude": 120.5, "location": {"lat": 1}, "rank": 3, "steps": 9000})),
            ("/parse/classes/Bottle/b1", json!({"location": {"latitude": 43.6, "longitude": -79.4}, "name": "mine"})),
            ("/parse/classes/Location", json!({"altitude": 3, "point": {"__type": "GeoPoint", "latitude": 1.0, "longitude": 2.0}})),
            ("/x", json!([{"lat": 1, "ok": 1}, 5, "s"])),
        ];
        for (path, input) in inputs {
            let once = rules.redact(path, &input);
            let twice = rules.redact(path, &once);
            assert_eq!(once, twice, "not idempotent for {}", path);
        }
    }

    #[test]
    fn day_route_masks_and_removes() {
        let rules = RuleSet::default();
        let input = json!({
            "altitude": 120.5,
            "isLocationUsed": true,
            "humidity": 55,
            "rank": 3,
            "location": {"__type": "Pointer", "className": "Location", "objectId": "x"},
            "totalAmount": 1200,
        });
        let out = rules.redact("/parse/classes/Day/abc", &input);
        assert_eq!(
            out,
            json!({"altitude": 0, "isLocationUsed": false, "humidity": 0, "rank": 0, "totalAmount": 1200})
        );
    }

    #[test]
    fn route_rules_do_not_leak_to_other_paths() {
        let rules = RuleSet::default();
        let input = json!({"altitude": 120.5});
        assert_eq!(rules.redact("/parse/classes/Sip", &input), input);
        assert_eq!(rules.redact("/parse/classes/Day", &input), input);
    }

    #[test]
    fn bottle_location_is_zeroed() {
        let rules = RuleSet::default();
        let input = json!({"location": {"latitude": 43.6, "longitude": -79.4, "accuracy": 5}});
        let out = rules.redact("/parse/classes/Bottle/b1", &input);
        assert_eq!(out, json!({"location": {"latitude": 0, "longitude": 0, "accuracy": 5}}));
    }

    #[test]
    fn installation_routes_mask_identifiers() {
        let rules = RuleSet::default();
        let input = json!({"deviceType": "android", "appVersion": "2.2", "deviceToken": "tok", "deviceName": "pixel", "timeZone": "UTC"});

        let created = rules.redact("/parse/classes/_Installation", &input);
        assert_eq!(
            created,
            json!({"deviceType": "a", "appVersion": "a", "deviceToken": "a", "deviceName": "pixel", "timeZone": "UTC"})
        );

        let updated = rules.redact("/parse/classes/_Installation/i1", &input);
        assert_eq!(
            updated,
            json!({"deviceType": "a", "appVersion": "2.2", "deviceToken": "a", "deviceName": "a", "timeZone": "UTC"})
        );
    }

    #[test]
    fn default_mask_placeholder() {
        let config = RedactionConfig {
            rules: vec![RuleConfig {
                field: "serial".to_string(),
                action: ActionKind::Mask,
                value: None,
            }],
            routes: vec![],
            forward_headers: vec![],
        };
        let rules = RuleSet::from_config(&config).unwrap();
        let out = rules.redact("/", &json!({"serial": "SN-1"}));
        assert_eq!(out, json!({"serial": DEFAULT_MASK}));
    }

    #[test]
    fn invalid_field_path_is_rejected() {
        let config = RedactionConfig {
            rules: vec![RuleConfig::remove("a..b")],
            routes: vec![],
            forward_headers: vec![],
        };
        assert!(matches!(
            RuleSet::from_config(&config),
            Err(SipGuardError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn redact_body_keeps_bytes_when_nothing_matches() {
        let rules = RuleSet::default();
        let body = br#"{"amount":  250, "time": {"__type": "Date", "iso": "2024-01-01T00:00:00.000Z"}}"#;
        let out = rules.redact_body("/parse/classes/Sip", body);
        assert_eq!(&out[..], &body[..]);
    }

    #[test]
    fn redact_body_rewrites_when_fields_match() {
        let rules = RuleSet::default();
        let out = rules.redact_body("/parse/classes/Sip", br#"{"lat":1,"amount":250}"#);
        assert_eq!(&out[..], br#"{"amount":250}"#);
    }

    #[test]
    fn redact_body_non_json() {
        let rules = RuleSet::default();
        assert_eq!(&rules.redact_body("/parse/functions/x", b"not json")[..], b"not json");
        assert!(rules.redact_body("/parse/classes/Day/d1", b"not json").is_empty());
        assert!(rules.redact_body("/parse/classes/Day/d1", b"").is_empty());
    }

    #[test]
    fn filter_headers_keeps_allowlist_only() {
        let rules = RuleSet::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-parse-application-id", HeaderValue::from_static("app"));
        headers.insert("x-parse-session-token", HeaderValue::from_static("r:tok"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.7"));
        headers.insert("cookie", HeaderValue::from_static("tracking=1"));

        let out = rules.filter_headers(&headers);
        assert_eq!(out.len(), 3);
        assert_eq!(out.get("X-Parse-Application-Id").unwrap(), "app");
        assert!(out.get("x-forwarded-for").is_none());
        assert!(out.get("cookie").is_none());
    }
}
