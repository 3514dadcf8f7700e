use crate::calc;
use crate::gradebook::{self, GradeRecord};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

/// Resolves the (enrollment, subject) pair and loads its record, or an empty
/// default when it has never been saved.
fn open_record(conn: &Connection, req: &Request) -> Result<GradeRecord, serde_json::Value> {
    let enrollment_id = required_str(req, "enrollmentId")?;
    let subject_id = required_str(req, "subjectId")?;
    gradebook::require_enrollment(conn, &enrollment_id).map_err(|e| calc_err(&req.id, e))?;
    gradebook::require_subject(conn, &subject_id).map_err(|e| calc_err(&req.id, e))?;
    gradebook::load_record(conn, &enrollment_id, &subject_id).map_err(|e| calc_err(&req.id, e))
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let record = match open_record(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cfg = gradebook::load_grading_config(conn);
    ok(&req.id, json!({ "record": record.view(&cfg) }))
}

/// Live feedback for unsaved form values. Without ids the scores are
/// classified as given; with ids they are applied over the stored record so
/// the active-period lock is checked the same way save checks it.
fn handle_grades_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let active_period = match gradebook::parse_active_period(&req.params) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let has_ids =
        optional_str(req, "enrollmentId").is_some() || optional_str(req, "subjectId").is_some();
    let (mut record, cfg) = if has_ids {
        let conn = match db_conn(state, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let record = match open_record(conn, req) {
            Ok(v) => v,
            Err(e) => return e,
        };
        (record, gradebook::load_grading_config(conn))
    } else {
        let cfg = state
            .db
            .as_ref()
            .map(gradebook::load_grading_config)
            .unwrap_or_default();
        (GradeRecord::empty("", ""), cfg)
    };

    // There is no stored record to lock against without ids.
    let lock = if has_ids { active_period } else { None };
    if let Err(e) = gradebook::apply_form(&mut record, &req.params, lock, &cfg) {
        return calc_err(&req.id, e);
    }
    let summary = calc::summarize(&record.scores(), &cfg);
    ok(
        &req.id,
        json!({
            "promedio": summary.promedio,
            "estado": summary.estado,
            "activePeriods": summary.active_periods,
            "tier": summary.tier,
            "nc": summary.nc,
        }),
    )
}

fn handle_grades_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active_period = match gradebook::parse_active_period(&req.params) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let mut record = match open_record(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cfg = gradebook::load_grading_config(conn);

    if let Err(e) = gradebook::apply_form(&mut record, &req.params, active_period, &cfg) {
        tracing::warn!(code = %e.code, message = %e.message, "grade save rejected");
        return calc_err(&req.id, e);
    }

    let created = !record.exists;
    match gradebook::save_record(conn, &record, &cfg) {
        Ok(saved) => {
            tracing::info!(
                enrollment = %saved.enrollment_id,
                subject = %saved.subject_id,
                created,
                "grade record saved"
            );
            ok(
                &req.id,
                json!({ "created": created, "record": saved.view(&cfg) }),
            )
        }
        Err(e) => {
            tracing::warn!(code = %e.code, message = %e.message, "grade save failed");
            calc_err(&req.id, e)
        }
    }
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = gradebook::require_enrollment(conn, &enrollment_id) {
        return calc_err(&req.id, e);
    }
    let cfg = gradebook::load_grading_config(conn);
    let rows = match gradebook::records_for_enrollment(conn, &enrollment_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let records: Vec<serde_json::Value> = rows
        .iter()
        .map(|(subject, record)| {
            json!({
                "subject": subject,
                "record": record.view(&cfg),
            })
        })
        .collect();
    ok(&req.id, json!({ "records": records }))
}

fn handle_indicators_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period = match gradebook::parse_period(&req.params) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let text = match required_str(req, "text") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut record = match open_record(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let cfg = gradebook::load_grading_config(conn);

    if !record.push_indicator(period, &text) {
        return ok(
            &req.id,
            json!({ "added": false, "record": record.view(&cfg) }),
        );
    }
    match gradebook::save_record(conn, &record, &cfg) {
        Ok(saved) => ok(&req.id, json!({ "added": true, "record": saved.view(&cfg) })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_indicators_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period = match gradebook::parse_period(&req.params) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let Some(position) = req.params.get("position").and_then(|v| v.as_u64()) else {
        return err(&req.id, "bad_params", "position must be a non-negative integer", None);
    };
    let mut record = match open_record(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let list = &mut record.indicators[period - 1];
    let position = position as usize;
    if position >= list.len() {
        return err(
            &req.id,
            "not_found",
            "indicator not found",
            Some(json!({ "period": period, "position": position })),
        );
    }
    list.remove(position);

    let cfg = gradebook::load_grading_config(conn);
    match gradebook::save_record(conn, &record, &cfg) {
        Ok(saved) => ok(&req.id, json!({ "record": saved.view(&cfg) })),
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.get" => Some(handle_grades_get(state, req)),
        "grades.preview" => Some(handle_grades_preview(state, req)),
        "grades.save" => Some(handle_grades_save(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.indicators.add" => Some(handle_indicators_add(state, req)),
        "grades.indicators.remove" => Some(handle_indicators_remove(state, req)),
        _ => None,
    }
}
