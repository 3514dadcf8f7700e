use crate::calc::{self, GradeStatus, GradingConfig, PerformanceTier};
use crate::gradebook::{self, GradeRecord};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Default)]
struct StatusCounts {
    pending: usize,
    approved: usize,
    failed: usize,
}

impl StatusCounts {
    fn add(&mut self, s: GradeStatus) {
        match s {
            GradeStatus::Pending => self.pending += 1,
            GradeStatus::Approved => self.approved += 1,
            GradeStatus::Failed => self.failed += 1,
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "Pendiente": self.pending,
            "Aprobado": self.approved,
            "Reprobado": self.failed,
        })
    }
}

/// Score columns plus derived values, shared by both report shapes.
fn score_columns(record: &GradeRecord, cfg: &GradingConfig) -> Map<String, Value> {
    let summary = calc::summarize(&record.scores(), cfg);
    let mut m = Map::new();
    m.insert("p1".into(), json!(record.bimestre1));
    m.insert("p2".into(), json!(record.bimestre2));
    m.insert("p3".into(), json!(record.bimestre3));
    m.insert("p4".into(), json!(record.bimestre4));
    m.insert("promedio".into(), json!(summary.promedio));
    m.insert("estado".into(), json!(summary.estado));
    m.insert("tier".into(), json!(summary.tier));
    m.insert("nc".into(), json!(summary.nc));
    m.insert("fallas".into(), json!(record.fallas));
    m
}

fn overall_block(avg: calc::PeriodAverage, cfg: &GradingConfig) -> Value {
    let tier = if avg.has_active() {
        Some(calc::classify_tier(avg.average, cfg).badge())
    } else {
        None
    };
    json!({
        "promedio": calc::round_off(avg.average, cfg.decimals),
        "estado": calc::classify_status(&avg, cfg),
        "tier": tier,
        "subjectCount": avg.active_count,
    })
}

fn handle_student_report_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let header = match conn
        .query_row(
            "SELECT e.student_id, s.last_name, s.first_name, s.document_id,
                    e.academic_year, e.grade_level, e.group_name, e.site
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.id = ?",
            [&enrollment_id],
            |r| {
                let last: String = r.get(1)?;
                let first: String = r.get(2)?;
                Ok(json!({
                    "student": {
                        "id": r.get::<_, String>(0)?,
                        "displayName": format!("{}, {}", last, first),
                        "documentId": r.get::<_, Option<String>>(3)?,
                    },
                    "enrollment": {
                        "id": &enrollment_id,
                        "academicYear": r.get::<_, i64>(4)?,
                        "gradeLevel": r.get::<_, Option<String>>(5)?,
                        "groupName": r.get::<_, Option<String>>(6)?,
                        "site": r.get::<_, Option<String>>(7)?,
                    }
                }))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "enrollment not found",
                Some(json!({ "enrollmentId": enrollment_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let cfg = gradebook::load_grading_config(conn);
    let rows = match gradebook::records_for_enrollment(conn, &enrollment_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let mut counts = StatusCounts::default();
    let mut total_fallas = 0_i64;
    let mut averages = Vec::with_capacity(rows.len());
    let mut subjects_out = Vec::with_capacity(rows.len());
    for (subject, record) in &rows {
        let avg = calc::period_average(&record.scores());
        counts.add(calc::classify_status(&avg, &cfg));
        total_fallas += record.fallas;
        averages.push(avg);

        let mut row = score_columns(record, &cfg);
        row.insert("subject".into(), json!(subject));
        row.insert("exists".into(), json!(record.exists));
        row.insert("observations".into(), json!(record.observations));
        row.insert(
            "generalObservation".into(),
            json!(record.general_observation),
        );
        row.insert("indicators".into(), json!(record.indicators));
        subjects_out.push(Value::Object(row));
    }

    ok(
        &req.id,
        json!({
            "student": header["student"],
            "enrollment": header["enrollment"],
            "gradingConfig": cfg,
            "tierLegend": calc::tier_ranges(&cfg),
            "subjects": subjects_out,
            "overall": overall_block(calc::overall_average(averages), &cfg),
            "totalFallas": total_fallas,
            "statusCounts": counts.to_json(),
        }),
    )
}

fn handle_subject_summary_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(academic_year) = req.params.get("academicYear").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "academicYear must be an integer", None);
    };
    let group_name = optional_str(req, "groupName");

    let subject = match conn
        .query_row(
            "SELECT id, name, area FROM subjects WHERE id = ?",
            [&subject_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "area": r.get::<_, Option<String>>(2)?,
                }))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "subject not found",
                Some(json!({ "subjectId": subject_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.student_id, s.last_name, s.first_name, e.group_name
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.academic_year = ?1 AND (?2 IS NULL OR e.group_name = ?2)
         ORDER BY s.last_name, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let enrollments = match stmt
        .query_map((academic_year, &group_name), |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                format!("{}, {}", last, first),
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let cfg = gradebook::load_grading_config(conn);
    let mut counts = StatusCounts::default();
    let mut tier_counts: BTreeMap<PerformanceTier, usize> =
        PerformanceTier::ALL.iter().map(|t| (*t, 0)).collect();
    let mut averages = Vec::with_capacity(enrollments.len());
    let mut rows_out = Vec::with_capacity(enrollments.len());

    for (enrollment_id, student_id, display_name, group) in &enrollments {
        let record = match gradebook::load_record(conn, enrollment_id, &subject_id) {
            Ok(v) => v,
            Err(e) => return calc_err(&req.id, e),
        };
        let avg = calc::period_average(&record.scores());
        counts.add(calc::classify_status(&avg, &cfg));
        if avg.has_active() {
            *tier_counts
                .entry(calc::classify_tier(avg.average, &cfg))
                .or_insert(0) += 1;
        }
        averages.push(avg);

        let mut row = score_columns(&record, &cfg);
        row.insert("enrollmentId".into(), json!(enrollment_id));
        row.insert("studentId".into(), json!(student_id));
        row.insert("displayName".into(), json!(display_name));
        row.insert("groupName".into(), json!(group));
        rows_out.push(Value::Object(row));
    }

    let tier_counts_out: Vec<Value> = tier_counts
        .iter()
        .map(|(t, n)| json!({ "label": t.label(), "color": t.color(), "count": n }))
        .collect();

    ok(
        &req.id,
        json!({
            "subject": subject,
            "academicYear": academic_year,
            "groupName": group_name,
            "gradingConfig": cfg,
            "tierLegend": calc::tier_ranges(&cfg),
            "rows": rows_out,
            "statusCounts": counts.to_json(),
            "tierCounts": tier_counts_out,
            "groupAverage": overall_block(calc::overall_average(averages), &cfg),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentReportModel" => Some(handle_student_report_model(state, req)),
        "reports.subjectSummaryModel" => Some(handle_subject_summary_model(state, req)),
        _ => None,
    }
}
