use crate::workflow::{days_between, Workflow};
use chrono::{DateTime, Duration, NaiveTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct GapPeriod {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_days: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeTiming {
    pub from: String,
    pub to: String,
    pub days: f64,
}

/// Every dated touchpoint of a workflow: activities plus stage entries, sorted.
pub fn activity_timeline(wf: &Workflow) -> Vec<DateTime<Utc>> {
    let mut times: Vec<DateTime<Utc>> = wf
        .activities
        .iter()
        .filter_map(|a| a.at)
        .chain(wf.stages.iter().filter_map(|s| s.entered_at))
        .collect();
    times.sort_unstable();
    times
}

/// Longest silence between consecutive timestamps (input need not be sorted).
pub fn largest_gap(times: &[DateTime<Utc>]) -> Option<GapPeriod> {
    if times.len() < 2 { return None; }
    let mut s = times.to_vec();
    s.sort_unstable();
    let mut best: Option<GapPeriod> = None;
    for w in s.windows(2) {
        let d = days_between(w[0], w[1]);
        if best.as_ref().map(|b| d > b.duration_days).unwrap_or(true) {
            best = Some(GapPeriod { start_time: w[0], end_time: w[1], duration_days: d });
        }
    }
    best
}

/// Stage a workflow was in at `t`: the last stage entered at or before it.
pub fn stage_at(wf: &Workflow, t: DateTime<Utc>) -> Option<&str> {
    wf.stages
        .iter()
        .filter(|s| s.entered_at.map(|e| e <= t).unwrap_or(false))
        .last()
        .map(|s| s.name.as_str())
}

/// Time spent on each consecutive stage transition of a workflow.
///
/// Uses the entry times of both stages when present, else the recorded
/// duration of the source stage. Transitions with neither are skipped.
pub fn edge_timings(wf: &Workflow) -> Vec<EdgeTiming> {
    let mut out = Vec::new();
    for w in wf.stages.windows(2) {
        let (a, b) = (&w[0], &w[1]);
        let days = match (a.entered_at, b.entered_at) {
            (Some(x), Some(y)) => Some(days_between(x, y).max(0.0)),
            _ => a.days(),
        };
        if let Some(days) = days {
            out.push(EdgeTiming {
                from: a.name.trim().to_ascii_lowercase(),
                to: b.name.trim().to_ascii_lowercase(),
                days,
            });
        }
    }
    out
}

pub fn floor_to_day(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Start of the next UTC calendar day strictly after `t`.
pub fn next_utc_midnight(t: DateTime<Utc>) -> DateTime<Utc> {
    floor_to_day(t) + Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn midnight_rollover() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 17, 45, 0).unwrap();
        assert_eq!(next_utc_midnight(t), Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap());
        let m = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(next_utc_midnight(m), Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());
    }
}
