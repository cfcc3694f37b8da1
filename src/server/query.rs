//! `where` / `order` / `limit` handling for list endpoints.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::server::error::{ApiError, ApiResult};
use crate::server::schema::{self, ClassSpec};
use crate::server::store::StoredObject;

#[derive(Debug, Default)]
pub struct ListQuery {
    filters: Vec<(String, Value)>,
    order: Vec<(String, bool)>,
    limit: Option<usize>,
}

/// Decode the `where` parameter, sent either as a JSON string (query string)
/// or as an object (method-override body).
pub fn parse_where(params: &Map<String, Value>) -> ApiResult<Option<Map<String, Value>>> {
    let parsed = match params.get("where") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(raw)) => {
            serde_json::from_str::<Value>(raw).map_err(|_| ApiError::InvalidJson)?
        }
        Some(other) => other.clone(),
    };
    match parsed {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(ApiError::invalid("invalid where")),
    }
}

fn parse_limit(value: &Value) -> ApiResult<usize> {
    let limit = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match limit {
        Some(n) if n > 0 => Ok(usize::try_from(n).unwrap_or(usize::MAX)),
        _ => Err(ApiError::invalid("invalid limit")),
    }
}

impl ListQuery {
    pub fn parse(
        class: &ClassSpec,
        params: &Map<String, Value>,
        exists: &mut dyn FnMut(&str, &str) -> ApiResult<bool>,
    ) -> ApiResult<Self> {
        let mut query = ListQuery::default();

        if let Some(conditions) = parse_where(params)? {
            for (key, value) in conditions {
                if !class.is_queryable(&key) {
                    return Err(ApiError::invalid("invalid where"));
                }
                let expected = match class.field(&key) {
                    Some(_) if value.is_null() => Value::Null,
                    Some(spec) => schema::normalize_value(spec, &value, exists)
                        .map_err(|_| ApiError::invalid("invalid where"))?,
                    None if value.is_string() => value,
                    None => return Err(ApiError::invalid("invalid where")),
                };
                query.filters.push((key, expected));
            }
        }

        if let Some(order) = params.get("order") {
            let order = order
                .as_str()
                .ok_or_else(|| ApiError::invalid("invalid order"))?;
            for term in order.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                let (field, descending) = match term.strip_prefix('-') {
                    Some(field) => (field, true),
                    None => (term, false),
                };
                if !class.is_queryable(field) {
                    return Err(ApiError::invalid("invalid order"));
                }
                query.order.push((field.to_string(), descending));
            }
        }

        if let Some(limit) = params.get("limit") {
            query.limit = Some(parse_limit(limit)?);
        }

        Ok(query)
    }

    pub fn apply(&self, objects: Vec<StoredObject>) -> Vec<StoredObject> {
        let mut matched: Vec<StoredObject> = objects
            .into_iter()
            .filter(|object| {
                self.filters.iter().all(|(key, expected)| match object.field(key) {
                    Some(actual) => &actual == expected,
                    None => expected.is_null(),
                })
            })
            .collect();

        if !self.order.is_empty() {
            matched.sort_by(|a, b| {
                for (field, descending) in &self.order {
                    let ordering = compare_values(a.field(field).as_ref(), b.field(field).as_ref());
                    let ordering = if *descending { ordering.reverse() } else { ordering };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

fn rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Object(_)) => 4,
        Some(Value::Array(_)) => 5,
    }
}

/// Dates sort by instant and pointers by object ID.
fn object_sort_key(map: &Map<String, Value>) -> &str {
    map.get("iso")
        .or_else(|| map.get("objectId"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Object(x)), Some(Value::Object(y))) => object_sort_key(x).cmp(object_sort_key(y)),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::schema::{DAY, SIP};
    use serde_json::json;

    fn no_pointers(_: &str, _: &str) -> ApiResult<bool> {
        Ok(false)
    }

    fn sip(id: &str, amount: i64, iso: &str) -> StoredObject {
        let data = json!({
            "amount": amount,
            "time": {"__type": "Date", "iso": iso},
        });
        StoredObject::with_id(id.into(), Some("u1".into()), data.as_object().unwrap().clone())
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn ids(objects: &[StoredObject]) -> Vec<&str> {
        objects.iter().map(|o| o.id.as_str()).collect()
    }

    fn sample() -> Vec<StoredObject> {
        vec![
            sip("a", 200, "2026-10-19T08:00:00.000000Z"),
            sip("b", 100, "2026-10-19T09:00:00.000000Z"),
            sip("c", 200, "2026-10-19T07:00:00.000000Z"),
        ]
    }

    #[test]
    fn empty_params_return_everything() {
        let query = ListQuery::parse(&SIP, &Map::new(), &mut no_pointers).unwrap();
        assert_eq!(ids(&query.apply(sample())), vec!["a", "b", "c"]);
    }

    #[test]
    fn where_from_query_string() {
        let query = ListQuery::parse(&SIP, &params(json!({"where": "{\"amount\": 200}"})), &mut no_pointers)
            .unwrap();
        assert_eq!(ids(&query.apply(sample())), vec!["a", "c"]);
    }

    #[test]
    fn where_from_override_body_and_object_id() {
        let query = ListQuery::parse(&SIP, &params(json!({"where": {"objectId": "b"}})), &mut no_pointers)
            .unwrap();
        assert_eq!(ids(&query.apply(sample())), vec!["b"]);
    }

    #[test]
    fn where_rejects_unknown_fields_and_bad_values() {
        let unknown = ListQuery::parse(&SIP, &params(json!({"where": {"colour": 1}})), &mut no_pointers);
        assert_eq!(unknown.unwrap_err().to_string(), "invalid where");

        let bad_type = ListQuery::parse(&SIP, &params(json!({"where": {"amount": "x"}})), &mut no_pointers);
        assert_eq!(bad_type.unwrap_err().to_string(), "invalid where");

        let missing_day = json!({"where": {"day": {"__type": "Pointer", "className": "Day", "objectId": "d"}}});
        assert!(ListQuery::parse(&SIP, &params(missing_day), &mut no_pointers).is_err());

        let not_json = ListQuery::parse(&SIP, &params(json!({"where": "{nope"})), &mut no_pointers);
        assert!(matches!(not_json, Err(ApiError::InvalidJson)));
    }

    #[test]
    fn order_by_date_descending_then_limit() {
        let query = ListQuery::parse(
            &SIP,
            &params(json!({"order": "-time", "limit": "2"})),
            &mut no_pointers,
        )
        .unwrap();
        assert_eq!(ids(&query.apply(sample())), vec!["b", "a"]);
    }

    #[test]
    fn order_by_multiple_keys() {
        let query = ListQuery::parse(&SIP, &params(json!({"order": "-amount,time"})), &mut no_pointers)
            .unwrap();
        assert_eq!(ids(&query.apply(sample())), vec!["c", "a", "b"]);
    }

    #[test]
    fn invalid_order_and_limit() {
        let order = ListQuery::parse(&DAY, &params(json!({"order": "-colour"})), &mut no_pointers);
        assert_eq!(order.unwrap_err().to_string(), "invalid order");

        for limit in [json!("0"), json!(-3), json!("ten"), json!(true)] {
            let err = ListQuery::parse(&DAY, &params(json!({"limit": limit})), &mut no_pointers);
            assert_eq!(err.unwrap_err().to_string(), "invalid limit");
        }
        let numeric = ListQuery::parse(&DAY, &params(json!({"limit": 7})), &mut no_pointers).unwrap();
        assert_eq!(numeric.limit, Some(7));
    }

    #[test]
    fn null_where_matches_missing_field() {
        let mut objects = sample();
        objects[1].data.insert("bottleSerialNumber".into(), json!("HS-1"));
        let query = ListQuery::parse(
            &SIP,
            &params(json!({"where": {"bottleSerialNumber": null}})),
            &mut no_pointers,
        )
        .unwrap();
        assert_eq!(ids(&query.apply(objects)), vec!["a", "c"]);
    }
}
