use crate::calc::{self, CalcError, GradeSummary, GradingConfig, PERIOD_COUNT, PERIOD_KEYS};
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub const CALC_CONFIG_KEY: &str = "calc.config";

fn db_err(e: impl std::fmt::Display) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

fn db_write_err(e: impl std::fmt::Display) -> CalcError {
    CalcError::new("db_update_failed", e.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodObservation {
    #[serde(default)]
    pub academic: String,
    #[serde(default)]
    pub behavioral: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub id: Option<String>,
    pub enrollment_id: String,
    pub subject_id: String,
    pub exists: bool,
    pub bimestre1: f64,
    pub bimestre2: f64,
    pub bimestre3: f64,
    pub bimestre4: f64,
    pub fallas: i64,
    pub observations: Vec<PeriodObservation>,
    pub general_observation: String,
    pub indicators: Vec<Vec<String>>,
    pub updated_at: Option<String>,
}

impl GradeRecord {
    pub fn empty(enrollment_id: &str, subject_id: &str) -> Self {
        Self {
            id: None,
            enrollment_id: enrollment_id.to_string(),
            subject_id: subject_id.to_string(),
            exists: false,
            bimestre1: 0.0,
            bimestre2: 0.0,
            bimestre3: 0.0,
            bimestre4: 0.0,
            fallas: 0,
            observations: vec![PeriodObservation::default(); PERIOD_COUNT],
            general_observation: String::new(),
            indicators: vec![Vec::new(); PERIOD_COUNT],
            updated_at: None,
        }
    }

    pub fn scores(&self) -> [f64; PERIOD_COUNT] {
        [self.bimestre1, self.bimestre2, self.bimestre3, self.bimestre4]
    }

    pub fn set_score(&mut self, period: usize, value: f64) {
        match period {
            1 => self.bimestre1 = value,
            2 => self.bimestre2 = value,
            3 => self.bimestre3 = value,
            4 => self.bimestre4 = value,
            _ => {}
        }
    }

    /// Appends to a period's indicator list. Returns false (and changes
    /// nothing) once the period already holds the maximum.
    pub fn push_indicator(&mut self, period: usize, text: &str) -> bool {
        let Some(list) = period
            .checked_sub(1)
            .and_then(|i| self.indicators.get_mut(i))
        else {
            return false;
        };
        if list.len() >= calc::MAX_INDICATORS_PER_PERIOD {
            return false;
        }
        list.push(text.to_string());
        true
    }

    pub fn view(&self, cfg: &GradingConfig) -> Value {
        json!(GradeRecordView {
            record: self,
            summary: calc::summarize(&self.scores(), cfg),
        })
    }
}

#[derive(Serialize)]
struct GradeRecordView<'a> {
    #[serde(flatten)]
    record: &'a GradeRecord,
    #[serde(flatten)]
    summary: GradeSummary,
}

/// Effective thresholds for a workspace: the stored override merged over the
/// compiled defaults. A malformed override must not block grading.
pub fn load_grading_config(conn: &Connection) -> GradingConfig {
    let defaults = GradingConfig::default();
    let saved = match db::settings_get_json(conn, CALC_CONFIG_KEY) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "calc config unreadable; using defaults");
            return defaults;
        }
    };
    let Some(obj) = saved.as_ref().and_then(|v| v.as_object()) else {
        return defaults;
    };
    match calc::merge_config_patch(&defaults, obj) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(code = %e.code, message = %e.message, "ignoring stored calc config override");
            defaults
        }
    }
}

pub fn parse_active_period(params: &Value) -> Result<Option<usize>, CalcError> {
    match params.get("activePeriod") {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_u64() {
            Some(n) if (1..=PERIOD_COUNT as u64).contains(&n) => Ok(Some(n as usize)),
            _ => Err(CalcError::new("bad_params", "activePeriod must be one of 1, 2, 3, 4")
                .with_details(json!({ "activePeriod": v }))),
        },
    }
}

pub fn parse_period(params: &Value) -> Result<usize, CalcError> {
    match params.get("period").and_then(|v| v.as_u64()) {
        Some(n) if (1..=PERIOD_COUNT as u64).contains(&n) => Ok(n as usize),
        _ => Err(CalcError::new("bad_params", "period must be one of 1, 2, 3, 4")),
    }
}

/// Applies form values onto `record`. Score keys that are absent keep their
/// stored value; present keys go through the normalizer (so null clears).
/// With an active period, only that period may change.
pub fn apply_form(
    record: &mut GradeRecord,
    params: &Value,
    active_period: Option<usize>,
    cfg: &GradingConfig,
) -> Result<(), CalcError> {
    let stored = record.scores();
    let mut next = stored;
    for (i, key) in PERIOD_KEYS.iter().enumerate() {
        if let Some(raw) = params.get(*key) {
            next[i] = calc::normalize_score(raw);
        }
    }
    if let Some(active) = active_period {
        for i in 0..PERIOD_COUNT {
            if i + 1 != active && next[i] != stored[i] {
                return Err(CalcError::new(
                    "period_locked",
                    format!("period {} is not editable while period {} is active", i + 1, active),
                )
                .with_details(json!({ "period": i + 1, "activePeriod": active })));
            }
        }
    }
    // Only edited periods are range-checked; a stored score stays valid even
    // after the scale shrinks underneath it.
    let mut edited = [0.0; PERIOD_COUNT];
    for i in 0..PERIOD_COUNT {
        if next[i] != stored[i] {
            edited[i] = next[i];
        }
    }
    calc::validate_period_scores(&edited, cfg)?;
    for (i, v) in next.iter().enumerate() {
        record.set_score(i + 1, *v);
    }

    if params.get("fallas").is_some() {
        let fallas = calc::normalize_absences(params.get("fallas"));
        calc::validate_absences(fallas)?;
        record.fallas = fallas;
    }

    if let Some(raw) = params.get("observations") {
        let Some(items) = raw.as_array() else {
            return Err(CalcError::new(
                "bad_params",
                "observations must be an array of {academic, behavioral}",
            ));
        };
        if items.len() > PERIOD_COUNT {
            return Err(CalcError::new("bad_params", "observations may hold at most 4 periods"));
        }
        let mut obs = vec![PeriodObservation::default(); PERIOD_COUNT];
        for (i, item) in items.iter().enumerate() {
            obs[i] = serde_json::from_value(item.clone()).map_err(|e| {
                CalcError::new("bad_params", format!("observations[{}]: {}", i, e))
            })?;
        }
        record.observations = obs;
    }

    if let Some(raw) = params.get("generalObservation") {
        let Some(s) = raw.as_str() else {
            return Err(CalcError::new("bad_params", "generalObservation must be a string"));
        };
        record.general_observation = s.to_string();
    }

    if let Some(raw) = params.get("indicators") {
        let Some(periods) = raw.as_array() else {
            return Err(CalcError::new(
                "bad_params",
                "indicators must be an array of string arrays",
            ));
        };
        if periods.len() > PERIOD_COUNT {
            return Err(CalcError::new("bad_params", "indicators may hold at most 4 periods"));
        }
        let mut next_indicators = vec![Vec::new(); PERIOD_COUNT];
        for (i, list) in periods.iter().enumerate() {
            let Some(list) = list.as_array() else {
                return Err(CalcError::new(
                    "bad_params",
                    format!("indicators[{}] must be an array of strings", i),
                ));
            };
            for text in list.iter().filter_map(|v| v.as_str()) {
                let text = text.trim();
                if text.is_empty() || next_indicators[i].len() >= calc::MAX_INDICATORS_PER_PERIOD {
                    continue;
                }
                next_indicators[i].push(text.to_string());
            }
        }
        record.indicators = next_indicators;
    }
    Ok(())
}

pub fn require_enrollment(conn: &Connection, enrollment_id: &str) -> Result<(), CalcError> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM enrollments WHERE id = ?", [enrollment_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    match found {
        Some(_) => Ok(()),
        None => Err(CalcError::new("not_found", "enrollment not found")
            .with_details(json!({ "enrollmentId": enrollment_id }))),
    }
}

pub fn require_subject(conn: &Connection, subject_id: &str) -> Result<(), CalcError> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM subjects WHERE id = ?", [subject_id], |r| r.get(0))
        .optional()
        .map_err(db_err)?;
    match found {
        Some(_) => Ok(()),
        None => Err(CalcError::new("not_found", "subject not found")
            .with_details(json!({ "subjectId": subject_id }))),
    }
}

pub fn load_record(
    conn: &Connection,
    enrollment_id: &str,
    subject_id: &str,
) -> Result<GradeRecord, CalcError> {
    let row = conn
        .query_row(
            "SELECT id, bimestre1, bimestre2, bimestre3, bimestre4, fallas,
                    general_observation, updated_at
             FROM grade_records
             WHERE enrollment_id = ? AND subject_id = ?",
            (enrollment_id, subject_id),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    [
                        r.get::<_, f64>(1)?,
                        r.get::<_, f64>(2)?,
                        r.get::<_, f64>(3)?,
                        r.get::<_, f64>(4)?,
                    ],
                    r.get::<_, i64>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;

    let mut record = GradeRecord::empty(enrollment_id, subject_id);
    let Some((id, scores, fallas, general_observation, updated_at)) = row else {
        return Ok(record);
    };
    for (i, v) in scores.iter().enumerate() {
        record.set_score(i + 1, *v);
    }
    record.fallas = fallas;
    record.general_observation = general_observation;
    record.updated_at = updated_at;
    record.exists = true;

    let mut obs_stmt = conn
        .prepare(
            "SELECT period, academic, behavioral
             FROM grade_observations
             WHERE grade_record_id = ?
             ORDER BY period",
        )
        .map_err(db_err)?;
    let obs_rows = obs_stmt
        .query_map([&id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                PeriodObservation {
                    academic: r.get(1)?,
                    behavioral: r.get(2)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for (period, obs) in obs_rows {
        if let Some(slot) = usize::try_from(period - 1)
            .ok()
            .and_then(|i| record.observations.get_mut(i))
        {
            *slot = obs;
        }
    }

    let mut ind_stmt = conn
        .prepare(
            "SELECT period, text
             FROM grade_indicators
             WHERE grade_record_id = ?
             ORDER BY period, position",
        )
        .map_err(db_err)?;
    let ind_rows = ind_stmt
        .query_map([&id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for (period, text) in ind_rows {
        let _ = record.push_indicator(period as usize, &text);
    }

    record.id = Some(id);
    Ok(record)
}

/// Persists the record wholesale (last save wins) together with its derived
/// promedio and estado, then reloads it.
pub fn save_record(
    conn: &Connection,
    record: &GradeRecord,
    cfg: &GradingConfig,
) -> Result<GradeRecord, CalcError> {
    let summary = calc::summarize(&record.scores(), cfg);
    let now = chrono::Utc::now().to_rfc3339();
    let new_id = Uuid::new_v4().to_string();

    let tx = conn.unchecked_transaction().map_err(|e| {
        CalcError::new("db_tx_failed", e.to_string())
    })?;
    let insert_err = |e: rusqlite::Error, table: &str| {
        CalcError::new("db_insert_failed", e.to_string()).with_details(json!({ "table": table }))
    };

    tx.execute(
        "INSERT INTO grade_records(id, enrollment_id, subject_id, bimestre1, bimestre2, bimestre3, bimestre4,
                                   fallas, promedio, estado, general_observation, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(enrollment_id, subject_id) DO UPDATE SET
           bimestre1 = excluded.bimestre1,
           bimestre2 = excluded.bimestre2,
           bimestre3 = excluded.bimestre3,
           bimestre4 = excluded.bimestre4,
           fallas = excluded.fallas,
           promedio = excluded.promedio,
           estado = excluded.estado,
           general_observation = excluded.general_observation,
           updated_at = excluded.updated_at",
        rusqlite::params![
            new_id,
            record.enrollment_id,
            record.subject_id,
            record.bimestre1,
            record.bimestre2,
            record.bimestre3,
            record.bimestre4,
            record.fallas,
            summary.promedio,
            summary.estado.as_str(),
            record.general_observation,
            now,
        ],
    )
    .map_err(|e| insert_err(e, "grade_records"))?;

    let record_id: String = tx
        .query_row(
            "SELECT id FROM grade_records WHERE enrollment_id = ? AND subject_id = ?",
            (&record.enrollment_id, &record.subject_id),
            |r| r.get(0),
        )
        .map_err(db_err)?;

    tx.execute(
        "DELETE FROM grade_observations WHERE grade_record_id = ?",
        [&record_id],
    )
    .map_err(db_write_err)?;
    for (i, obs) in record.observations.iter().enumerate().take(PERIOD_COUNT) {
        if obs.academic.is_empty() && obs.behavioral.is_empty() {
            continue;
        }
        tx.execute(
            "INSERT INTO grade_observations(grade_record_id, period, academic, behavioral)
             VALUES(?, ?, ?, ?)",
            (&record_id, (i + 1) as i64, &obs.academic, &obs.behavioral),
        )
        .map_err(|e| insert_err(e, "grade_observations"))?;
    }

    tx.execute(
        "DELETE FROM grade_indicators WHERE grade_record_id = ?",
        [&record_id],
    )
    .map_err(db_write_err)?;
    for (i, list) in record.indicators.iter().enumerate().take(PERIOD_COUNT) {
        for (pos, text) in list.iter().enumerate().take(calc::MAX_INDICATORS_PER_PERIOD) {
            tx.execute(
                "INSERT INTO grade_indicators(grade_record_id, period, position, text)
                 VALUES(?, ?, ?, ?)",
                (&record_id, (i + 1) as i64, pos as i64, text),
            )
            .map_err(|e| insert_err(e, "grade_indicators"))?;
        }
    }

    tx.commit()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;

    load_record(conn, &record.enrollment_id, &record.subject_id)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRow {
    pub id: String,
    pub name: String,
    pub area: Option<String>,
    pub sort_order: i64,
}

pub fn list_subjects(conn: &Connection) -> Result<Vec<SubjectRow>, CalcError> {
    let mut stmt = conn
        .prepare("SELECT id, name, area, sort_order FROM subjects ORDER BY sort_order, name")
        .map_err(db_err)?;
    stmt.query_map([], |r| {
        Ok(SubjectRow {
            id: r.get(0)?,
            name: r.get(1)?,
            area: r.get(2)?,
            sort_order: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

/// One record per catalog subject; subjects never graded come back empty.
pub fn records_for_enrollment(
    conn: &Connection,
    enrollment_id: &str,
) -> Result<Vec<(SubjectRow, GradeRecord)>, CalcError> {
    let subjects = list_subjects(conn)?;
    let mut out = Vec::with_capacity(subjects.len());
    for s in subjects {
        let record = load_record(conn, enrollment_id, &s.id)?;
        out.push((s, record));
    }
    Ok(out)
}
