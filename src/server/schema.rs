//! Parse class definitions and field validation.
//!
//! Stored objects keep every field in its wire form: dates as
//! `{"__type": "Date", "iso": ...}` and pointers as
//! `{"__type": "Pointer", "className": ..., "objectId": ...}`. Incoming
//! values are checked against the field kind and normalized before they are
//! written, so serializing an object is a plain copy of its data.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::{Map, Value, json};

use crate::server::error::{ApiError, ApiResult};

pub const USER_CLASS: &str = "_User";

/// Recommended daily intake in millilitres.
pub const RECOMMENDED_GOAL: f64 = 2000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Float,
    Bool,
    Str,
    /// Arbitrary JSON (objects, arrays, GeoPoints).
    Json,
    /// Parse Date object with microsecond precision.
    Date,
    /// Calendar date, `YYYY-MM-DD`.
    PlainDate,
    /// Pointer to an object of the named class.
    Pointer(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    None,
    Zero,
    False,
    EmptyObject,
    EmptyList,
    Now,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Clients may set the field.
    pub writable: bool,
    /// Value written when a new object omits the field.
    pub fill: Fill,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        writable: true,
        fill: Fill::None,
    }
}

const fn filled(name: &'static str, kind: FieldKind, fill: Fill) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        writable: true,
        fill,
    }
}

const fn read_only(name: &'static str, kind: FieldKind, fill: Fill) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        writable: false,
        fill,
    }
}

#[derive(Debug)]
pub struct ClassSpec {
    pub name: &'static str,
    pub table: &'static str,
    pub fields: &'static [FieldSpec],
    /// Fields a create request must carry.
    pub required: &'static [&'static str],
    /// Field whose value is unique per owner.
    pub natural_key: Option<&'static str>,
    /// Pointer field naming the aggregating parent object.
    pub parent: Option<&'static str>,
    /// Date fields refreshed to the current time on every write.
    pub touch: &'static [&'static str],
}

use FieldKind::*;

pub static INSTALLATION: ClassSpec = ClassSpec {
    name: "_Installation",
    table: "installations",
    fields: &[
        field("user", Pointer(USER_CLASS)),
        field("deviceType", Str),
        field("appVersion", Str),
        field("appName", Str),
        field("timeZone", Str),
        field("installationId", Str),
        field("appIdentifier", Str),
        field("localeIdentifier", Str),
        field("deviceName", Str),
        field("pushType", Str),
        field("deviceToken", Str),
    ],
    required: &[],
    natural_key: None,
    parent: None,
    touch: &[],
};

pub static USER: ClassSpec = ClassSpec {
    name: USER_CLASS,
    table: "users",
    fields: &[
        field("birthday", Date),
        field("wakeUp", Date),
        field("goToSleep", Date),
        field("sipGlow", Bool),
        field("gender", Str),
        field("weight", Float),
        field("timeZone", Str),
        field("fluidInMetric", Bool),
        field("elevationInMetric", Bool),
        field("heightInMetric", Bool),
        field("lightNotificationCount", Int),
        field("degreesInMetric", Bool),
        field("appNotificationCount", Int),
        field("name", Str),
        filled("breastfeeding", Bool, Fill::False),
        field("weightInMetric", Bool),
        field("pushNotificationCount", Int),
        filled("spam", Bool, Fill::False),
        field("email", Str),
        field("activityLevel", Int),
        field("username", Str),
        field("height", Float),
        filled("agreedToTOS", Bool, Fill::False),
        filled("suppressedNotificationTypes", Json, Fill::EmptyList),
        filled("bottleVendors", Json, Fill::EmptyObject),
        field("fitbitUserId", Str),
        field("goal", Float),
        filled("lightType", Int, Fill::Zero),
        filled("pushNotificationAlways", Bool, Fill::False),
    ],
    required: &["username", "email"],
    natural_key: None,
    parent: None,
    touch: &[],
};

pub static BOTTLE: ClassSpec = ClassSpec {
    name: "Bottle",
    table: "bottles",
    fields: &[
        filled("lastSynced", Date, Fill::Now),
        filled("batteryLevel", Int, Fill::Zero),
        filled("capacity", Int, Fill::Zero),
        filled("firmwareBootloaderVersion", Int, Fill::Zero),
        filled("firmwareMinorVersion", Int, Fill::Zero),
        field("name", Str),
        field("serialNumber", Str),
        field("user", Pointer(USER_CLASS)),
        read_only("shouldUpdate", Bool, Fill::False),
        filled("description", Json, Fill::EmptyObject),
        field("location", Json),
    ],
    required: &[],
    natural_key: None,
    parent: None,
    touch: &["lastSynced"],
};

pub static HEALTH_STATS: ClassSpec = ClassSpec {
    name: "UserHealthStats",
    table: "health_stats",
    fields: &[
        read_only("user", Pointer(USER_CLASS), Fill::None),
        read_only("recentTotal", Float, Fill::Zero),
        read_only("recentGoal", Float, Fill::Zero),
        read_only("bottlesSaved", Int, Fill::Zero),
        read_only("average", Float, Fill::Zero),
        read_only("goalMetCount", Int, Fill::Zero),
        read_only("statDate", Date, Fill::Now),
        read_only("volume", Float, Fill::Zero),
        filled("streak", Int, Fill::Zero),
    ],
    required: &[],
    natural_key: None,
    parent: None,
    touch: &["statDate"],
};

pub static DAY: ClassSpec = ClassSpec {
    name: "Day",
    table: "days",
    fields: &[
        field("user", Pointer(USER_CLASS)),
        field("date", PlainDate),
        filled("totalAmount", Int, Fill::Zero),
        filled("totalBottleAmount", Int, Fill::Zero),
        field("location", Pointer("Location")),
        filled("isLocationUsed", Bool, Fill::False),
        filled("recommendedGoal", Float, Fill::Zero),
        field("goal", Float),
        field("altitude", Float),
        field("humidity", Float),
        field("rank", Int),
        field("steps", Int),
    ],
    required: &["date"],
    natural_key: Some("date"),
    parent: None,
    touch: &[],
};

pub static LOCATION: ClassSpec = ClassSpec {
    name: "Location",
    table: "locations",
    fields: &[
        field("altitude", Float),
        field("point", Json),
        field("user", Pointer(USER_CLASS)),
    ],
    required: &["altitude", "point"],
    natural_key: None,
    parent: None,
    touch: &[],
};

pub static SIP: ClassSpec = ClassSpec {
    name: "Sip",
    table: "sips",
    fields: &[
        filled("time", Date, Fill::Now),
        filled("amount", Int, Fill::Zero),
        field("bottleSerialNumber", Str),
        field("day", Pointer("Day")),
        filled("max", Int, Fill::Zero),
        filled("min", Int, Fill::Zero),
        filled("start", Int, Fill::Zero),
        filled("stop", Int, Fill::Zero),
        field("user", Pointer(USER_CLASS)),
    ],
    required: &["day"],
    natural_key: None,
    parent: Some("day"),
    touch: &[],
};

pub static GLOW: ClassSpec = ClassSpec {
    name: "Glow",
    table: "glows",
    fields: &[field("name", Str), field("content", Json)],
    required: &["name", "content"],
    natural_key: None,
    parent: None,
    touch: &[],
};

/// Every class reachable through a pointer.
pub static CLASSES: &[&ClassSpec] = &[
    &INSTALLATION,
    &USER,
    &BOTTLE,
    &HEALTH_STATS,
    &DAY,
    &LOCATION,
    &SIP,
    &GLOW,
];

pub fn class_by_name(name: &str) -> Option<&'static ClassSpec> {
    CLASSES.iter().copied().find(|spec| spec.name == name)
}

/// Fields present on every object but never writable.
const SYSTEM_FIELDS: &[&str] = &["objectId", "createdAt", "updatedAt"];

/// Keys the SDK may send that the server ignores.
const IGNORED_FIELDS: &[&str] = &["objectId", "createdAt", "updatedAt", "ACL"];

impl ClassSpec {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields accepted in `where` and `order`.
    pub fn is_queryable(&self, name: &str) -> bool {
        SYSTEM_FIELDS.contains(&name) || self.field(name).is_some()
    }

    /// Pointer wire form for an object of this class.
    pub fn pointer(&self, object_id: &str) -> Value {
        json!({"__type": "Pointer", "className": self.name, "objectId": object_id})
    }

    /// Default values for a newly created object.
    pub fn defaults(&self, now: &str) -> Map<String, Value> {
        let mut data = Map::new();
        for spec in self.fields {
            let value = match (spec.fill, spec.kind) {
                (Fill::None, _) => continue,
                (Fill::Zero, Float) => json!(0.0),
                (Fill::Zero, _) => json!(0),
                (Fill::False, _) => json!(false),
                (Fill::EmptyObject, _) => json!({}),
                (Fill::EmptyList, _) => json!([]),
                (Fill::Now, _) => date_value(now),
            };
            data.insert(spec.name.to_string(), value);
        }
        data
    }
}

/// Current time in the storage format, e.g. `2026-10-19T08:30:00.123456Z`.
pub fn now_iso() -> String {
    format_timestamp(&Utc::now())
}

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn date_value(iso: &str) -> Value {
    json!({"__type": "Date", "iso": iso})
}

/// New random object ID: 16 bytes, URL-safe base64 without padding.
pub fn new_object_id() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 16]>())
}

/// Object ID carried by a stored pointer value.
pub fn pointer_id(value: &Value) -> Option<&str> {
    value.get("objectId").and_then(Value::as_str)
}

fn type_error(name: &str) -> ApiError {
    ApiError::invalid(format!("Invalid type for {}", name))
}

fn parse_timestamp(raw: &str) -> Option<String> {
    let parsed = DateTime::parse_from_rfc3339(raw).ok()?;
    Some(format_timestamp(&parsed.with_timezone(&Utc)))
}

/// Check `value` against `spec` and return its storage form.
///
/// Pointer targets are confirmed through `exists`, which receives the class
/// name and object ID.
pub fn normalize_value(
    spec: &FieldSpec,
    value: &Value,
    exists: &mut dyn FnMut(&str, &str) -> ApiResult<bool>,
) -> ApiResult<Value> {
    let name = spec.name;
    let normalized = match spec.kind {
        Int => match value.as_i64() {
            Some(n) => json!(n),
            None => return Err(type_error(name)),
        },
        Float => match value.as_f64() {
            Some(n) => json!(n),
            None => return Err(type_error(name)),
        },
        Bool => match value {
            Value::Bool(_) => value.clone(),
            _ => return Err(type_error(name)),
        },
        Str => match value {
            Value::String(_) => value.clone(),
            _ => return Err(type_error(name)),
        },
        Json => value.clone(),
        Date => {
            let raw = match value {
                Value::String(s) => Some(s.as_str()),
                Value::Object(obj) if obj.get("__type") == Some(&json!("Date")) => {
                    obj.get("iso").and_then(Value::as_str)
                }
                _ => None,
            };
            match raw.and_then(parse_timestamp) {
                Some(iso) => date_value(&iso),
                None => return Err(type_error(name)),
            }
        }
        PlainDate => match value.as_str().map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d")) {
            Some(Ok(date)) => json!(date.format("%Y-%m-%d").to_string()),
            _ => return Err(type_error(name)),
        },
        Pointer(class_name) => {
            let obj = value.as_object().ok_or_else(|| type_error(name))?;
            let well_formed = obj.len() == 3
                && obj.get("__type") == Some(&json!("Pointer"))
                && obj.get("className") == Some(&json!(class_name));
            let object_id = obj.get("objectId").and_then(Value::as_str);
            match object_id {
                Some(id) if well_formed && exists(class_name, id)? => json!({
                    "__type": "Pointer",
                    "className": class_name,
                    "objectId": id,
                }),
                _ => return Err(type_error(name)),
            }
        }
    };
    Ok(normalized)
}

/// Apply a client payload to `data`.
///
/// Unknown or read-only fields are rejected unless the payload repeats the
/// stored value. A `null` value clears the field. System fields and ACLs are
/// ignored.
pub fn apply_changes(
    class: &ClassSpec,
    data: &mut Map<String, Value>,
    changes: &Map<String, Value>,
    exists: &mut dyn FnMut(&str, &str) -> ApiResult<bool>,
) -> ApiResult<()> {
    for (key, value) in changes {
        if IGNORED_FIELDS.contains(&key.as_str()) || data.get(key) == Some(value) {
            continue;
        }
        let spec = match class.field(key) {
            Some(spec) if spec.writable => spec,
            _ => return Err(ApiError::invalid(format!("Unknown field {}", key))),
        };
        if value.is_null() {
            data.shift_remove(key);
            continue;
        }
        let normalized = normalize_value(spec, value, exists)?;
        data.insert(key.clone(), normalized);
    }
    Ok(())
}

/// Check that a new object carries every required field.
pub fn check_required(class: &ClassSpec, data: &Map<String, Value>) -> ApiResult<()> {
    match class.required.iter().find(|name| !data.contains_key(**name)) {
        Some(name) => Err(ApiError::invalid(format!("missing {}", name))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_pointers(_: &str, _: &str) -> ApiResult<bool> {
        Ok(false)
    }

    fn all_pointers(_: &str, _: &str) -> ApiResult<bool> {
        Ok(true)
    }

    #[test]
    fn object_ids_are_url_safe() {
        let id = new_object_id();
        assert_eq!(id.len(), 22);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(id, new_object_id());
    }

    #[test]
    fn dates_normalize_to_micros_utc() {
        let spec = SIP.field("time").unwrap();
        let value = json!({"__type": "Date", "iso": "2026-10-19T10:15:30.5+02:00"});
        let normalized = normalize_value(spec, &value, &mut no_pointers).unwrap();
        assert_eq!(
            normalized,
            json!({"__type": "Date", "iso": "2026-10-19T08:15:30.500000Z"})
        );

        let plain = normalize_value(spec, &json!("2026-10-19T08:15:30Z"), &mut no_pointers).unwrap();
        assert_eq!(plain["iso"], "2026-10-19T08:15:30.000000Z");

        assert!(normalize_value(spec, &json!({"iso": "2026-10-19T08:15:30Z"}), &mut no_pointers).is_err());
        assert!(normalize_value(spec, &json!(12), &mut no_pointers).is_err());
    }

    #[test]
    fn plain_dates() {
        let spec = DAY.field("date").unwrap();
        assert_eq!(
            normalize_value(spec, &json!("2026-10-19"), &mut no_pointers).unwrap(),
            json!("2026-10-19")
        );
        assert!(normalize_value(spec, &json!("19/10/2026"), &mut no_pointers).is_err());
    }

    #[test]
    fn scalar_types_are_checked() {
        let amount = SIP.field("amount").unwrap();
        assert_eq!(normalize_value(amount, &json!(250), &mut no_pointers).unwrap(), json!(250));
        assert!(normalize_value(amount, &json!("250"), &mut no_pointers).is_err());
        assert!(normalize_value(amount, &json!(2.5), &mut no_pointers).is_err());

        let weight = USER.field("weight").unwrap();
        assert_eq!(normalize_value(weight, &json!(70), &mut no_pointers).unwrap(), json!(70.0));
    }

    #[test]
    fn pointers_must_match_class_and_exist() {
        let spec = SIP.field("day").unwrap();
        let good = json!({"__type": "Pointer", "className": "Day", "objectId": "d1"});
        assert_eq!(normalize_value(spec, &good, &mut all_pointers).unwrap(), good);
        assert!(normalize_value(spec, &good, &mut no_pointers).is_err());

        let wrong_class = json!({"__type": "Pointer", "className": "Bottle", "objectId": "d1"});
        assert!(normalize_value(spec, &wrong_class, &mut all_pointers).is_err());

        let extra = json!({"__type": "Pointer", "className": "Day", "objectId": "d1", "x": 1});
        assert!(normalize_value(spec, &extra, &mut all_pointers).is_err());
    }

    #[test]
    fn apply_changes_rejects_unknown_and_read_only() {
        let mut data = BOTTLE.defaults("2026-10-19T00:00:00.000000Z");
        let err = apply_changes(&BOTTLE, &mut data, json!({"colour": "red"}).as_object().unwrap(), &mut no_pointers)
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown field colour");

        let err = apply_changes(&BOTTLE, &mut data, json!({"shouldUpdate": true}).as_object().unwrap(), &mut no_pointers)
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown field shouldUpdate");

        // Repeating the stored value is accepted
        apply_changes(&BOTTLE, &mut data, json!({"shouldUpdate": false}).as_object().unwrap(), &mut no_pointers)
            .unwrap();
    }

    #[test]
    fn apply_changes_ignores_system_fields() {
        let mut data = Map::new();
        let changes = json!({"objectId": "x", "ACL": {"*": {"read": true}}, "name": "desk"});
        apply_changes(&BOTTLE, &mut data, changes.as_object().unwrap(), &mut no_pointers).unwrap();
        assert_eq!(Value::Object(data), json!({"name": "desk"}));
    }

    #[test]
    fn apply_changes_null_clears_field() {
        let mut data = Map::new();
        data.insert("name".to_string(), json!("kitchen"));
        apply_changes(&BOTTLE, &mut data, json!({"name": null}).as_object().unwrap(), &mut no_pointers)
            .unwrap();
        assert!(!data.contains_key("name"));
    }

    #[test]
    fn defaults_follow_field_kinds() {
        let data = SIP.defaults("2026-10-19T00:00:00.000000Z");
        assert_eq!(data["amount"], json!(0));
        assert_eq!(data["time"]["__type"], "Date");
        assert!(!data.contains_key("day"));

        let stats = HEALTH_STATS.defaults("2026-10-19T00:00:00.000000Z");
        assert_eq!(stats["volume"], json!(0.0));
    }

    #[test]
    fn required_fields() {
        let data = SIP.defaults("2026-10-19T00:00:00.000000Z");
        assert_eq!(check_required(&SIP, &data).unwrap_err().to_string(), "missing day");
        assert!(check_required(&BOTTLE, &Map::new()).is_ok());
    }

    #[test]
    fn class_lookup() {
        assert_eq!(class_by_name("Day").unwrap().table, "days");
        assert_eq!(class_by_name("_User").unwrap().table, "users");
        assert!(class_by_name("Trophy").is_none());
        assert!(SIP.is_queryable("objectId"));
        assert!(SIP.is_queryable("amount"));
        assert!(!SIP.is_queryable("password"));
    }
}
