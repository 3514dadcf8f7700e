use serde::Serialize;
use serde_json::{Map, Value};

pub const PERIOD_COUNT: usize = 4;
pub const MAX_INDICATORS_PER_PERIOD: usize = 4;
pub const PERIOD_KEYS: [&str; PERIOD_COUNT] = ["bimestre1", "bimestre2", "bimestre3", "bimestre4"];

/// Shared grading thresholds. Every classifier and report model reads these;
/// nothing else in the crate hard-codes a boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingConfig {
    pub scale_max: f64,
    pub pass_threshold: f64,
    /// Lower bounds of Básico, Alto and Superior, ascending.
    pub tier_thresholds: [f64; 3],
    pub decimals: u32,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            scale_max: 5.0,
            pass_threshold: 3.0,
            tier_thresholds: [3.0, 4.0, 4.7],
            decimals: 2,
        }
    }
}

impl GradingConfig {
    pub fn validate(&self) -> Result<(), CalcError> {
        if !self.scale_max.is_finite() || self.scale_max <= 0.0 {
            return Err(CalcError::new("bad_params", "scaleMax must be > 0")
                .with_details(serde_json::json!({ "scaleMax": self.scale_max })));
        }
        if !self.pass_threshold.is_finite()
            || self.pass_threshold <= 0.0
            || self.pass_threshold > self.scale_max
        {
            return Err(CalcError::new(
                "bad_params",
                format!("passThreshold must be in (0, {}]", self.scale_max),
            )
            .with_details(serde_json::json!({ "passThreshold": self.pass_threshold })));
        }
        let t = self.tier_thresholds;
        let ascending = t[0] > 0.0 && t[0] < t[1] && t[1] < t[2] && t[2] <= self.scale_max;
        if !t.iter().all(|v| v.is_finite()) || !ascending {
            return Err(CalcError::new(
                "bad_params",
                format!(
                    "tierThresholds must be strictly ascending within (0, {}]",
                    self.scale_max
                ),
            )
            .with_details(serde_json::json!({ "tierThresholds": t })));
        }
        if self.decimals > 4 {
            return Err(CalcError::new("bad_params", "decimals must be in 0..=4")
                .with_details(serde_json::json!({ "decimals": self.decimals })));
        }
        Ok(())
    }

    /// Points needed across all periods to finish exactly at the pass threshold.
    pub fn passing_total(&self) -> f64 {
        self.pass_threshold * PERIOD_COUNT as f64
    }
}

/// Applies a camelCase patch over `base`. Unknown keys are rejected so a typo
/// never silently falls back to a default.
pub fn merge_config_patch(
    base: &GradingConfig,
    patch: &Map<String, Value>,
) -> Result<GradingConfig, CalcError> {
    let mut next = base.clone();
    for (k, v) in patch {
        match k.as_str() {
            "scaleMax" => next.scale_max = number_field(k, v)?,
            "passThreshold" => next.pass_threshold = number_field(k, v)?,
            "tierThresholds" => {
                let Some(items) = v.as_array() else {
                    return Err(CalcError::new(
                        "bad_params",
                        "tierThresholds must be an array of 3 numbers",
                    ));
                };
                if items.len() != 3 {
                    return Err(CalcError::new(
                        "bad_params",
                        "tierThresholds must be an array of 3 numbers",
                    )
                    .with_details(serde_json::json!({ "len": items.len() })));
                }
                for (i, item) in items.iter().enumerate() {
                    next.tier_thresholds[i] = number_field(k, item)?;
                }
            }
            "decimals" => {
                let Some(n) = v.as_u64() else {
                    return Err(CalcError::new("bad_params", "decimals must be an integer"));
                };
                next.decimals = u32::try_from(n).unwrap_or(u32::MAX);
            }
            _ => {
                return Err(CalcError::new(
                    "bad_params",
                    format!("unknown calc config field: {}", k),
                ))
            }
        }
    }
    next.validate()?;
    Ok(next)
}

fn number_field(key: &str, v: &Value) -> Result<f64, CalcError> {
    v.as_f64()
        .filter(|n| n.is_finite())
        .ok_or_else(|| CalcError::new("bad_params", format!("{} must be a number", key)))
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Coerces a form value into a score. Anything that is not a finite number
/// (or a string holding one) becomes 0.0, the "not entered" sentinel.
pub fn normalize_score(raw: &Value) -> f64 {
    let v = match raw {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => parse_score_text(s),
        _ => 0.0,
    };
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

pub fn parse_score_text(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        return 0.0;
    }
    // Spanish-locale inputs arrive as "3,5".
    t.replace(',', ".").parse::<f64>().unwrap_or(0.0)
}

/// Reads `bimestre1..bimestre4` from a params object; absent keys are unset.
pub fn normalize_period_inputs(params: &Value) -> [f64; PERIOD_COUNT] {
    let mut out = [0.0; PERIOD_COUNT];
    for (i, key) in PERIOD_KEYS.iter().enumerate() {
        out[i] = params.get(*key).map(normalize_score).unwrap_or(0.0);
    }
    out
}

/// Absence count. Fractions truncate, garbage is 0.
pub fn normalize_absences(raw: Option<&Value>) -> i64 {
    let Some(raw) = raw else {
        return 0;
    };
    if let Some(n) = raw.as_i64() {
        return n;
    }
    let f = normalize_score(raw);
    f.trunc() as i64
}

pub fn validate_period_scores(
    scores: &[f64; PERIOD_COUNT],
    cfg: &GradingConfig,
) -> Result<(), CalcError> {
    for (i, v) in scores.iter().enumerate() {
        if *v < 0.0 || *v > cfg.scale_max {
            return Err(CalcError::new(
                "bad_params",
                format!("{} must be within 0..={}", PERIOD_KEYS[i], cfg.scale_max),
            )
            .with_details(serde_json::json!({ "period": i + 1, "value": v })));
        }
    }
    Ok(())
}

pub fn validate_absences(fallas: i64) -> Result<(), CalcError> {
    if fallas < 0 {
        return Err(CalcError::new("bad_params", "fallas must be >= 0")
            .with_details(serde_json::json!({ "fallas": fallas })));
    }
    Ok(())
}

/// Half-up rounding: `Int(10^n * x + 0.5) / 10^n`.
pub fn round_off(x: f64, decimals: u32) -> f64 {
    let f = 10_f64.powi(decimals as i32);
    ((x * f) + 0.5).floor() / f
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodAverage {
    pub average: f64,
    pub sum: f64,
    pub active_count: usize,
}

impl PeriodAverage {
    pub fn has_active(&self) -> bool {
        self.active_count > 0
    }
}

pub fn period_average(scores: &[f64; PERIOD_COUNT]) -> PeriodAverage {
    let mut sum = 0.0_f64;
    let mut active_count = 0_usize;
    for v in scores.iter().copied().filter(|v| *v > 0.0) {
        sum += v;
        active_count += 1;
    }
    let average = if active_count > 0 {
        sum / (active_count as f64)
    } else {
        0.0
    };
    PeriodAverage {
        average,
        sum,
        active_count,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GradeStatus {
    #[serde(rename = "Pendiente")]
    Pending,
    #[serde(rename = "Aprobado")]
    Approved,
    #[serde(rename = "Reprobado")]
    Failed,
}

impl GradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GradeStatus::Pending => "Pendiente",
            GradeStatus::Approved => "Aprobado",
            GradeStatus::Failed => "Reprobado",
        }
    }
}

pub fn classify_status(avg: &PeriodAverage, cfg: &GradingConfig) -> GradeStatus {
    if !avg.has_active() {
        GradeStatus::Pending
    } else if avg.average >= cfg.pass_threshold {
        GradeStatus::Approved
    } else {
        GradeStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PerformanceTier {
    Bajo,
    Basico,
    Alto,
    Superior,
}

impl PerformanceTier {
    pub fn label(self) -> &'static str {
        match self {
            PerformanceTier::Bajo => "Bajo",
            PerformanceTier::Basico => "Básico",
            PerformanceTier::Alto => "Alto",
            PerformanceTier::Superior => "Superior",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            PerformanceTier::Bajo => "#dc2626",
            PerformanceTier::Basico => "#d97706",
            PerformanceTier::Alto => "#2563eb",
            PerformanceTier::Superior => "#16a34a",
        }
    }

    pub fn badge(self) -> TierBadge {
        TierBadge {
            label: self.label(),
            color: self.color(),
        }
    }

    pub const ALL: [PerformanceTier; 4] = [
        PerformanceTier::Bajo,
        PerformanceTier::Basico,
        PerformanceTier::Alto,
        PerformanceTier::Superior,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierBadge {
    pub label: &'static str,
    pub color: &'static str,
}

pub fn classify_tier(average: f64, cfg: &GradingConfig) -> PerformanceTier {
    let [basico, alto, superior] = cfg.tier_thresholds;
    if average >= superior {
        PerformanceTier::Superior
    } else if average >= alto {
        PerformanceTier::Alto
    } else if average >= basico {
        PerformanceTier::Basico
    } else {
        PerformanceTier::Bajo
    }
}

/// Legend for renderers. `min` is inclusive; `max` is exclusive except for
/// the top tier, which closes at the scale maximum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierRange {
    pub label: &'static str,
    pub color: &'static str,
    pub min: f64,
    pub max: f64,
}

pub fn tier_ranges(cfg: &GradingConfig) -> Vec<TierRange> {
    let [basico, alto, superior] = cfg.tier_thresholds;
    let bounds = [0.0, basico, alto, superior, cfg.scale_max];
    PerformanceTier::ALL
        .iter()
        .enumerate()
        .map(|(i, t)| TierRange {
            label: t.label(),
            color: t.color(),
            min: bounds[i],
            max: bounds[i + 1],
        })
        .collect()
}

/// NC: aggregate points still missing to reach the passing total. Callers
/// display it only when positive.
pub fn needed_credit(scores: &[f64; PERIOD_COUNT], cfg: &GradingConfig) -> f64 {
    cfg.passing_total() - period_average(scores).sum
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSummary {
    pub promedio: f64,
    pub estado: GradeStatus,
    pub active_periods: usize,
    /// None while pending; a tier for "no average yet" would read as Bajo.
    pub tier: Option<TierBadge>,
    pub nc: Option<f64>,
}

/// Full pipeline over already-normalized scores. The status and tier are
/// decided on the unrounded average; only the reported numbers are rounded.
pub fn summarize(scores: &[f64; PERIOD_COUNT], cfg: &GradingConfig) -> GradeSummary {
    let avg = period_average(scores);
    let estado = classify_status(&avg, cfg);
    let tier = if avg.has_active() {
        Some(classify_tier(avg.average, cfg).badge())
    } else {
        None
    };
    let nc = needed_credit(scores, cfg);
    GradeSummary {
        promedio: round_off(avg.average, cfg.decimals),
        estado,
        active_periods: avg.active_count,
        tier,
        nc: if nc > 0.0 {
            Some(round_off(nc, cfg.decimals))
        } else {
            None
        },
    }
}

/// Mean of the subject averages that have at least one active period.
pub fn overall_average<I>(subject_averages: I) -> PeriodAverage
where
    I: IntoIterator<Item = PeriodAverage>,
{
    let mut sum = 0.0_f64;
    let mut active_count = 0_usize;
    for a in subject_averages {
        if a.has_active() {
            sum += a.average;
            active_count += 1;
        }
    }
    PeriodAverage {
        average: if active_count > 0 {
            sum / active_count as f64
        } else {
            0.0
        },
        sum,
        active_count,
    }
}
