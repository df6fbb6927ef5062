use chrono::{Datelike, Duration as ChronoDuration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Soft-rule identifiers, in precedence order. The order is load-bearing:
/// tie-breaking compares contributions rule by rule down this list.
pub const RULES: [&str; 5] = [
    "continuity",
    "loadBalance",
    "studentBalance",
    "pairing",
    "gradeFit",
];

#[derive(Debug, Clone)]
pub struct Teacher {
    pub id: String,
    pub name: String,
    pub subjects: Vec<String>,
    pub grade_min: i64,
    pub grade_max: i64,
    pub cap_week_slots: i64,
    pub cap_students: i64,
    pub allow_pair: bool,
    pub active: bool,
    /// Assigned live slots in the ISO week containing the request date.
    pub current_week_slots: i64,
    /// Distinct students with live assignments.
    pub current_students: i64,
}

#[derive(Debug, Clone)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub grade: i64,
    pub one_on_one: bool,
    pub ng_teacher_ids: Vec<String>,
    pub active: bool,
}

/// The slot being filled. `date` stays a raw string so that request
/// validation is owned here rather than scattered across callers.
#[derive(Debug, Clone)]
pub struct SlotRequest {
    pub date: String,
    pub time_slot_id: String,
    pub subject: String,
    pub position: i64,
}

/// A student already seated at the request's (date, time slot), any teacher.
#[derive(Debug, Clone)]
pub struct SlotOccupant {
    pub teacher_id: String,
    pub student_id: String,
    pub grade: i64,
    pub subject: String,
    pub position: i64,
    pub one_on_one: bool,
}

#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub teacher_id: String,
    pub student_id: String,
    pub subject: String,
    pub date: NaiveDate,
}

/// Assignment snapshot covering the lookback window through the scheduling
/// horizon, as fetched by the caller. The engine never reads storage itself.
#[derive(Debug, Clone, Default)]
pub struct AssignmentHistory {
    pub records: Vec<HistoryRecord>,
}

impl AssignmentHistory {
    fn links(&self, teacher_id: &str, student_id: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.teacher_id == teacher_id && r.student_id == student_id)
    }

    fn links_in_week(&self, teacher_id: &str, student_id: &str, week_of: NaiveDate) -> bool {
        let key = iso_week_key(week_of);
        self.records.iter().any(|r| {
            r.teacher_id == teacher_id
                && r.student_id == student_id
                && iso_week_key(r.date) == key
        })
    }

    fn continuity(
        &self,
        teacher_id: &str,
        student_id: &str,
        subject: &str,
        since: NaiveDate,
    ) -> bool {
        self.records.iter().any(|r| {
            r.teacher_id == teacher_id
                && r.student_id == student_id
                && r.subject == subject
                && r.date >= since
        })
    }
}

fn iso_week_key(d: NaiveDate) -> (i32, u32) {
    let w = d.iso_week();
    (w.year(), w.week())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisqualifyReason {
    NgListed,
    WeekCapReached,
    StudentCapReached,
    SubjectNotOffered,
    GradeOutOfRange,
    PairingConflict,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Disqualified {
    pub teacher_id: String,
    pub reason: DisqualifyReason,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleScore {
    pub rule: &'static str,
    pub points: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredCandidate {
    pub teacher_id: String,
    pub teacher_name: String,
    pub total: f64,
    pub breakdown: Vec<RuleScore>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub ranked: Vec<ScoredCandidate>,
    pub disqualified: Vec<Disqualified>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineError {
    pub code: String,
    pub message: String,
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            code: "validation".to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: "not_found".to_string(),
            message: message.into(),
        }
    }
}

/// Rule weights and the continuity lookback window. Loaded from the
/// workspace settings store; missing or out-of-range entries fall back to
/// the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendConfig {
    pub continuity_weight: f64,
    pub load_balance_weight: f64,
    pub student_balance_weight: f64,
    pub pairing_weight: f64,
    pub grade_fit_weight: f64,
    pub lookback_days: i64,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            continuity_weight: 30.0,
            load_balance_weight: 20.0,
            student_balance_weight: 10.0,
            pairing_weight: 10.0,
            grade_fit_weight: 5.0,
            lookback_days: 90,
        }
    }
}

impl RecommendConfig {
    pub fn from_settings(raw: Option<&serde_json::Value>) -> Self {
        let defaults = Self::default();
        let Some(obj) = raw.and_then(|v| v.as_object()) else {
            return defaults;
        };
        let weight = |key: &str, fallback: f64| -> f64 {
            obj.get(key)
                .and_then(|v| v.as_f64())
                .filter(|w| w.is_finite() && *w >= 0.0)
                .unwrap_or(fallback)
        };
        let lookback_days = obj
            .get("lookbackDays")
            .and_then(|v| v.as_i64())
            .filter(|d| *d > 0)
            .unwrap_or(defaults.lookback_days);
        Self {
            continuity_weight: weight("continuityWeight", defaults.continuity_weight),
            load_balance_weight: weight("loadBalanceWeight", defaults.load_balance_weight),
            student_balance_weight: weight("studentBalanceWeight", defaults.student_balance_weight),
            pairing_weight: weight("pairingWeight", defaults.pairing_weight),
            grade_fit_weight: weight("gradeFitWeight", defaults.grade_fit_weight),
            lookback_days,
        }
    }
}

pub fn parse_request(request: &SlotRequest) -> Result<NaiveDate, EngineError> {
    if request.subject.trim().is_empty() {
        return Err(EngineError::validation("missing subject"));
    }
    if request.time_slot_id.trim().is_empty() {
        return Err(EngineError::validation("missing timeSlotId"));
    }
    if !(0..=1).contains(&request.position) {
        return Err(EngineError::validation("position must be 0 or 1"));
    }
    NaiveDate::parse_from_str(request.date.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::validation("date must be YYYY-MM-DD"))
}

fn disqualify(
    teacher: &Teacher,
    date: NaiveDate,
    request: &SlotRequest,
    student: &Student,
    occupancy: &[SlotOccupant],
    history: &AssignmentHistory,
) -> Option<DisqualifyReason> {
    if student.ng_teacher_ids.iter().any(|id| *id == teacher.id) {
        return Some(DisqualifyReason::NgListed);
    }

    // A student already seen with this teacher in the target week does not
    // count against the weekly cap (a move within the week, not new load).
    if teacher.current_week_slots >= teacher.cap_week_slots
        && !history.links_in_week(&teacher.id, &student.id, date)
    {
        return Some(DisqualifyReason::WeekCapReached);
    }

    // Same shape for the distinct-student cap: reassignment is exempt.
    if teacher.current_students >= teacher.cap_students
        && !history.links(&teacher.id, &student.id)
    {
        return Some(DisqualifyReason::StudentCapReached);
    }

    if !teacher.subjects.iter().any(|s| *s == request.subject) {
        return Some(DisqualifyReason::SubjectNotOffered);
    }
    if student.grade < teacher.grade_min || student.grade > teacher.grade_max {
        return Some(DisqualifyReason::GradeOutOfRange);
    }

    let seated: Vec<&SlotOccupant> = occupancy
        .iter()
        .filter(|o| o.teacher_id == teacher.id)
        .collect();
    if !seated.is_empty() {
        let full = seated.len() >= 2;
        let already_here = seated.iter().any(|o| o.student_id == student.id);
        let blocked = seated.iter().any(|o| o.one_on_one);
        if full || already_here || blocked || student.one_on_one || !teacher.allow_pair {
            return Some(DisqualifyReason::PairingConflict);
        }
    }

    None
}

/// Hard-constraint stage. Order of `eligible` is preserved from the input
/// roster; each exclusion carries the first failing reason.
pub fn filter_eligible<'a>(
    candidates: &'a [Teacher],
    date: NaiveDate,
    request: &SlotRequest,
    student: &Student,
    occupancy: &[SlotOccupant],
    history: &AssignmentHistory,
) -> (Vec<&'a Teacher>, Vec<Disqualified>) {
    let mut eligible = Vec::new();
    let mut disqualified = Vec::new();
    for teacher in candidates.iter().filter(|t| t.active) {
        match disqualify(teacher, date, request, student, occupancy, history) {
            None => eligible.push(teacher),
            Some(reason) => disqualified.push(Disqualified {
                teacher_id: teacher.id.clone(),
                reason,
            }),
        }
    }
    (eligible, disqualified)
}

fn ratio_bonus(current: i64, cap: i64, weight: f64) -> f64 {
    if cap <= 0 {
        return 0.0;
    }
    let ratio = (current as f64 / cap as f64).clamp(0.0, 1.0);
    weight * (1.0 - ratio)
}

fn score_one(
    teacher: &Teacher,
    date: NaiveDate,
    request: &SlotRequest,
    student: &Student,
    occupancy: &[SlotOccupant],
    history: &AssignmentHistory,
    config: &RecommendConfig,
) -> ScoredCandidate {
    let since = date - ChronoDuration::days(config.lookback_days);
    let continuity = if history.continuity(&teacher.id, &student.id, &request.subject, since) {
        config.continuity_weight
    } else {
        0.0
    };

    let load = ratio_bonus(
        teacher.current_week_slots,
        teacher.cap_week_slots,
        config.load_balance_weight,
    );
    let students = ratio_bonus(
        teacher.current_students,
        teacher.cap_students,
        config.student_balance_weight,
    );

    // Occupants reaching this stage already passed the hard pairing checks,
    // so any mismatch left here is grade/subject only.
    let seated: Vec<&SlotOccupant> = occupancy
        .iter()
        .filter(|o| o.teacher_id == teacher.id)
        .collect();
    let pairing = if seated.is_empty() {
        0.0
    } else if seated
        .iter()
        .all(|o| o.grade == student.grade && o.subject == request.subject)
    {
        config.pairing_weight
    } else {
        -config.pairing_weight
    };

    let grade_fit = if student.grade > teacher.grade_min && student.grade < teacher.grade_max {
        config.grade_fit_weight
    } else {
        0.0
    };

    let breakdown = vec![
        RuleScore {
            rule: RULES[0],
            points: continuity,
        },
        RuleScore {
            rule: RULES[1],
            points: load,
        },
        RuleScore {
            rule: RULES[2],
            points: students,
        },
        RuleScore {
            rule: RULES[3],
            points: pairing,
        },
        RuleScore {
            rule: RULES[4],
            points: grade_fit,
        },
    ];
    let total = breakdown.iter().map(|r| r.points).sum();
    ScoredCandidate {
        teacher_id: teacher.id.clone(),
        teacher_name: teacher.name.clone(),
        total,
        breakdown,
    }
}

fn cmp_ranked(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.total
        .partial_cmp(&a.total)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            for i in 0..RULES.len() {
                let ord = b.breakdown[i]
                    .points
                    .partial_cmp(&a.breakdown[i].points)
                    .unwrap_or(Ordering::Equal);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        })
        .then_with(|| a.teacher_id.cmp(&b.teacher_id))
}

/// Soft-constraint stage: weighted sum per rule, descending by total, ties
/// broken rule-by-rule in precedence order, then by teacher id ascending.
pub fn score_candidates(
    eligible: &[&Teacher],
    date: NaiveDate,
    request: &SlotRequest,
    student: &Student,
    occupancy: &[SlotOccupant],
    history: &AssignmentHistory,
    config: &RecommendConfig,
) -> Vec<ScoredCandidate> {
    let mut ranked: Vec<ScoredCandidate> = eligible
        .iter()
        .map(|t| score_one(t, date, request, student, occupancy, history, config))
        .collect();
    ranked.sort_by(cmp_ranked);
    ranked
}

/// Full run: validate, hard-filter, score. An empty roster or an inactive
/// student yields an empty recommendation, not an error.
pub fn recommend_teachers(
    request: &SlotRequest,
    student: &Student,
    roster: &[Teacher],
    occupancy: &[SlotOccupant],
    history: &AssignmentHistory,
    config: &RecommendConfig,
) -> Result<Recommendation, EngineError> {
    let date = parse_request(request)?;
    if roster.is_empty() || !student.active {
        return Ok(Recommendation::default());
    }
    let (eligible, disqualified) =
        filter_eligible(roster, date, request, student, occupancy, history);
    let ranked = score_candidates(&eligible, date, request, student, occupancy, history, config);
    Ok(Recommendation {
        ranked,
        disqualified,
    })
}
