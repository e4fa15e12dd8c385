use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

/// 2-decimal money rounding used everywhere a derived amount leaves the core.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Tolerance for comparing REAL-typed money columns.
pub const MONEY_EPSILON: f64 = 1e-6;

pub fn commission_amount(total: f64, rate_percent: f64) -> f64 {
    round2(total * rate_percent / 100.0)
}

/// Weekday index stored on schedule templates: 0 = Monday .. 6 = Sunday.
pub fn day_of_week_index(date: NaiveDate) -> u32 {
    date.weekday().num_days_from_monday()
}

pub fn day_of_week_label(index: u32) -> &'static str {
    match index {
        0 => "Mon",
        1 => "Tue",
        2 => "Wed",
        3 => "Thu",
        4 => "Fri",
        5 => "Sat",
        _ => "Sun",
    }
}

/// One occurrence row as loaded for payroll, joined with its template.
#[derive(Debug, Clone)]
pub struct OccurrenceRow {
    pub date: NaiveDate,
    pub subject: String,
    pub grade: String,
    pub assigned_teacher_id: String,
    pub is_present: bool,
    pub is_proxy: bool,
    pub substitute_teacher_id: Option<String>,
}

impl OccurrenceRow {
    /// Attribution rule: the occurrence pays the teacher who actually taught
    /// it. Unmarked rows are attributable to nobody.
    pub fn attributable_to(&self, teacher_id: &str) -> bool {
        if !self.is_present {
            return false;
        }
        if self.is_proxy {
            self.substitute_teacher_id.as_deref() == Some(teacher_id)
        } else {
            self.assigned_teacher_id == teacher_id
        }
    }

    /// Scheduled-for counts both roles; this is the attendance-rate
    /// denominator.
    pub fn scheduled_for(&self, teacher_id: &str) -> bool {
        self.assigned_teacher_id == teacher_id
            || self.substitute_teacher_id.as_deref() == Some(teacher_id)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayrollSummary {
    pub total_scheduled: i64,
    pub total_lectures: i64,
    pub regular_count: i64,
    pub substitute_count: i64,
    pub absence_count: i64,
    pub earnings: f64,
    pub attendance_rate: f64,
    pub by_subject: BTreeMap<String, i64>,
    pub by_grade: BTreeMap<String, i64>,
    pub by_day_of_week: BTreeMap<String, i64>,
}

/// Classifies a period's occurrences relative to one teacher and derives
/// earnings. Pure; safe to recompute on every request.
pub fn summarize_period(
    rows: &[OccurrenceRow],
    teacher_id: &str,
    pay_per_lecture: f64,
) -> PayrollSummary {
    let mut total_scheduled: i64 = 0;
    let mut regular_count: i64 = 0;
    let mut substitute_count: i64 = 0;
    let mut absence_count: i64 = 0;
    let mut by_subject: BTreeMap<String, i64> = BTreeMap::new();
    let mut by_grade: BTreeMap<String, i64> = BTreeMap::new();
    let mut by_day_of_week: BTreeMap<String, i64> = BTreeMap::new();

    for row in rows {
        if row.scheduled_for(teacher_id) {
            total_scheduled += 1;
        }

        if row.attributable_to(teacher_id) {
            if row.is_proxy {
                substitute_count += 1;
            } else {
                regular_count += 1;
            }
            *by_subject.entry(row.subject.clone()).or_insert(0) += 1;
            *by_grade.entry(row.grade.clone()).or_insert(0) += 1;
            let day = day_of_week_label(day_of_week_index(row.date));
            *by_day_of_week.entry(day.to_string()).or_insert(0) += 1;
        } else if row.is_present && row.is_proxy && row.assigned_teacher_id == teacher_id {
            // Someone else covered this teacher's lecture.
            absence_count += 1;
        }
    }

    let total_lectures = regular_count + substitute_count;
    let earnings = round2(total_lectures as f64 * pay_per_lecture);
    let attendance_rate = if total_scheduled > 0 {
        round2(100.0 * total_lectures as f64 / total_scheduled as f64)
    } else {
        0.0
    };

    PayrollSummary {
        total_scheduled,
        total_lectures,
        regular_count,
        substitute_count,
        absence_count,
        earnings,
        attendance_rate,
        by_subject,
        by_grade,
        by_day_of_week,
    }
}
