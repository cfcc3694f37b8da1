//! Derived hydration figures: per-day totals, per-user health stats and the
//! rolling set of Day objects for the current week.

use chrono::{Datelike, Duration, NaiveDate};
use rusqlite::Connection;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::server::error::{ApiError, ApiResult};
use crate::server::schema::{self, DAY, HEALTH_STATS, RECOMMENDED_GOAL, USER};
use crate::server::store::{self, StoredObject};

fn add_amount(total: i64, amount: i64) -> ApiResult<i64> {
    total
        .checked_add(amount)
        .ok_or_else(|| ApiError::invalid("amount out of range"))
}

/// Recompute `totalAmount` and `totalBottleAmount` of a Day from its Sips.
///
/// Bottle totals only count sips that carry a bottle serial number. A total
/// that no longer fits in an `i64` rejects the write.
pub fn recompute_day(conn: &Connection, day_id: &str) -> ApiResult<()> {
    let Some(mut day) = store::get(conn, &DAY, day_id)? else {
        return Ok(());
    };
    let mut stmt = conn.prepare(
        "SELECT json_extract(data, '$.amount'), json_extract(data, '$.bottleSerialNumber')
         FROM sips WHERE parent_id = ?1",
    )?;
    let rows = stmt.query_map([day_id], |row| {
        Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<String>>(1)?))
    })?;

    let (mut total, mut bottle_total) = (0i64, 0i64);
    for row in rows {
        let (amount, serial) = row?;
        let amount = amount.unwrap_or(0);
        total = add_amount(total, amount)?;
        if serial.is_some_and(|s| !s.is_empty()) {
            bottle_total = add_amount(bottle_total, amount)?;
        }
    }
    debug!("Day {} totals: {} ({} from bottle)", day_id, total, bottle_total);
    day.data.insert("totalAmount".to_string(), json!(total));
    day.data.insert("totalBottleAmount".to_string(), json!(bottle_total));
    store::save(conn, &DAY, &mut day)
}

/// Recompute `volume` and `goalMetCount` on every health-stats object of a user.
pub fn recompute_health_stats(conn: &Connection, user_id: &str) -> ApiResult<()> {
    // TOTAL() sums as a float and never overflows
    let volume: f64 = conn.query_row(
        "SELECT TOTAL(json_extract(data, '$.amount')) FROM sips WHERE owner_id = ?1",
        [user_id],
        |row| row.get(0),
    )?;
    let goal_met: i64 = conn.query_row(
        "SELECT COUNT(*) FROM days
         WHERE owner_id = ?1
           AND json_extract(data, '$.goal') IS NOT NULL
           AND json_extract(data, '$.totalAmount') >= json_extract(data, '$.goal')",
        [user_id],
        |row| row.get(0),
    )?;

    for mut stats in store::list_owned(conn, &HEALTH_STATS, user_id)? {
        stats.data.insert("volume".to_string(), json!(volume));
        stats.data.insert("goalMetCount".to_string(), json!(goal_met));
        store::save(conn, &HEALTH_STATS, &mut stats)?;
    }
    Ok(())
}

/// The user's own goal, or the recommended goal when unset.
pub fn effective_goal(user_data: &Map<String, Value>) -> f64 {
    user_data
        .get("goal")
        .and_then(Value::as_f64)
        .filter(|goal| *goal != 0.0)
        .unwrap_or(RECOMMENDED_GOAL)
}

/// Dates whose Day objects the list endpoint guarantees.
///
/// Counting Monday as 7, the window starts `weekday` days before today and
/// spans `max(weekday + 2, 7)` days.
pub fn week_window(today: NaiveDate) -> Vec<NaiveDate> {
    let weekday = match today.weekday().num_days_from_monday() {
        0 => 7,
        n => i64::from(n),
    };
    let start = today - Duration::days(weekday);
    let count = (weekday + 2).max(7);
    (0..count).map(|i| start + Duration::days(i)).collect()
}

/// Create any missing Day objects for the current week window.
pub fn ensure_week(conn: &Connection, user_id: &str, goal: f64, today: NaiveDate) -> ApiResult<usize> {
    let mut created = 0;
    for date in week_window(today) {
        let mut data = DAY.defaults(&schema::now_iso());
        data.insert("user".to_string(), USER.pointer(user_id));
        data.insert("date".to_string(), json!(date.format("%Y-%m-%d").to_string()));
        data.insert("recommendedGoal".to_string(), json!(RECOMMENDED_GOAL));
        data.insert("goal".to_string(), json!(goal));
        let day = StoredObject::new(Some(user_id.to_string()), data);
        if store::insert_if_absent(conn, &DAY, &day)? {
            created += 1;
        }
    }
    if created > 0 {
        debug!("Created {} Day objects for user {}", created, user_id);
    }
    Ok(created)
}

/// Apply the user's current goal to Day objects dated `from` or later.
pub fn refresh_goals(conn: &Connection, user_id: &str, goal: f64, from: NaiveDate) -> ApiResult<usize> {
    let from = from.format("%Y-%m-%d").to_string();
    let days = store::list_owned_from_key(conn, &DAY, user_id, &from)?;
    let count = days.len();
    for mut day in days {
        day.data.insert("recommendedGoal".to_string(), json!(RECOMMENDED_GOAL));
        day.data.insert("goal".to_string(), json!(goal));
        store::save(conn, &DAY, &mut day)?;
    }
    Ok(count)
}
