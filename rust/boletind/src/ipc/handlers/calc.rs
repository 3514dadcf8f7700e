use crate::calc::{self, GradingConfig};
use crate::db;
use crate::gradebook::{self, CALC_CONFIG_KEY};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

/// Stateless classification of one score set. Works without a workspace,
/// in which case the compiled defaults apply.
fn handle_calc_classify(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = state
        .db
        .as_ref()
        .map(gradebook::load_grading_config)
        .unwrap_or_default();

    let scores = calc::normalize_period_inputs(&req.params);
    if let Err(e) = calc::validate_period_scores(&scores, &cfg) {
        return calc_err(&req.id, e);
    }
    let fallas = calc::normalize_absences(req.params.get("fallas"));
    if let Err(e) = calc::validate_absences(fallas) {
        return calc_err(&req.id, e);
    }

    let summary = calc::summarize(&scores, &cfg);
    ok(
        &req.id,
        json!({
            "scores": scores,
            "fallas": fallas,
            "promedio": summary.promedio,
            "estado": summary.estado,
            "activePeriods": summary.active_periods,
            "tier": summary.tier,
            "nc": summary.nc,
        }),
    )
}

fn handle_calc_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let saved = match db::settings_get_json(conn, CALC_CONFIG_KEY) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "defaults": GradingConfig::default(),
            "override": saved,
            "effective": gradebook::load_grading_config(conn),
        }),
    )
}

fn handle_calc_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.as_object() else {
        return err(&req.id, "bad_params", "params must be an object", None);
    };

    let saved = match db::settings_get_json(conn, CALC_CONFIG_KEY) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut merged_override = saved
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    for (k, v) in patch {
        merged_override.insert(k.clone(), v.clone());
    }

    let effective = match calc::merge_config_patch(&GradingConfig::default(), &merged_override) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    if let Err(e) = db::settings_set_json(
        conn,
        CALC_CONFIG_KEY,
        &serde_json::Value::Object(merged_override),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(
        pass_threshold = effective.pass_threshold,
        scale_max = effective.scale_max,
        "calc config override updated"
    );
    ok(&req.id, json!({ "effective": effective }))
}

fn handle_calc_config_clear_override(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::settings_delete(conn, CALC_CONFIG_KEY) {
        Ok(cleared) => ok(
            &req.id,
            json!({ "cleared": cleared, "effective": GradingConfig::default() }),
        ),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calc.classify" => Some(handle_calc_classify(state, req)),
        "calc.config.get" => Some(handle_calc_config_get(state, req)),
        "calc.config.update" => Some(handle_calc_config_update(state, req)),
        "calc.config.clearOverride" => Some(handle_calc_config_clear_override(state, req)),
        _ => None,
    }
}
