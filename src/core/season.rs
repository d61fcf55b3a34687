use crate::types::{QueryWindow, S2Error, S2Result};
use chrono::{Datelike, NaiveDate};

/// One year's slice of a seasonal request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeasonWindow {
    pub year: i32,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Last calendar day of `month` in `year`
fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
}

/// Build a calendar date, pulling an overlong day back to the end of the month
fn adjusted_date(year: i32, month: u32, day: u32) -> S2Result<NaiveDate> {
    if !(1..=12).contains(&month) {
        return Err(S2Error::InvalidRange(format!(
            "invalid month {}: must be between 1 and 12",
            month
        )));
    }
    if day == 0 {
        return Err(S2Error::InvalidRange(format!("invalid day {}", day)));
    }
    let last = last_day_of_month(year, month)
        .ok_or_else(|| S2Error::InvalidRange(format!("year {} out of range", year)))?;
    let day = if day > last {
        log::warn!(
            "Adjusting invalid date {}-{:02}-{:02} -> {}-{:02}-{:02}",
            year, month, day, year, month, last
        );
        last
    } else {
        day
    };
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| S2Error::InvalidRange(format!("invalid date {}-{:02}-{:02}", year, month, day)))
}

/// Expand a seasonal span into one window per year.
///
/// Every year in `start_year..=end_year` gets the span from
/// `start_month/start_day` to `end_month/end_day`. Spans never wrap across
/// New Year: an end month/day before the start month/day is an error.
pub fn expand(
    start_year: i32,
    start_month: u32,
    start_day: u32,
    end_year: i32,
    end_month: u32,
    end_day: u32,
) -> S2Result<Vec<SeasonWindow>> {
    // Overlong days are pulled back first, so 02-30..02-29 is one day in February
    let overall_start = adjusted_date(start_year, start_month, start_day)?;
    let overall_end = adjusted_date(end_year, end_month, end_day)?;
    if overall_end < overall_start {
        return Err(S2Error::InvalidRange(format!(
            "end {} precedes start {}",
            overall_end, overall_start
        )));
    }

    let mut windows = Vec::with_capacity((end_year - start_year + 1) as usize);
    for year in start_year..=end_year {
        let start = adjusted_date(year, start_month, start_day)?.max(overall_start);
        let end = adjusted_date(year, end_month, end_day)?.min(overall_end);
        if end < start {
            return Err(S2Error::InvalidRange(format!(
                "window end {} is before window start {} in year {}",
                end, start, year
            )));
        }
        windows.push(SeasonWindow { year, start, end });
    }

    log::debug!(
        "Expanded {}..={} ({:02}-{:02} to {:02}-{:02}) into {} window(s)",
        start_year, end_year, start_month, start_day, end_month, end_day, windows.len()
    );
    Ok(windows)
}

/// Attach the product selection of `template` to every season window
pub fn query_windows(seasons: &[SeasonWindow], template: &QueryWindow) -> S2Result<Vec<QueryWindow>> {
    seasons
        .iter()
        .map(|s| {
            QueryWindow::new(
                s.start,
                s.end,
                template.collection_name.clone(),
                template.product_type.clone(),
                template.bands.iter().cloned(),
                template.target_resolution_m,
            )
        })
        .collect()
}

/// Sort windows and merge those that overlap or touch and select the same products
pub fn merge_windows(mut windows: Vec<QueryWindow>) -> Vec<QueryWindow> {
    windows.sort_by(|a, b| {
        (&a.collection_name, &a.product_type, a.target_resolution_m, &a.bands, a.start, a.end)
            .cmp(&(&b.collection_name, &b.product_type, b.target_resolution_m, &b.bands, b.start, b.end))
    });

    let mut merged: Vec<QueryWindow> = Vec::with_capacity(windows.len());
    for window in windows {
        if let Some(last) = merged.last_mut() {
            let touches = last
                .end
                .succ_opt()
                .map(|next| window.start <= next)
                .unwrap_or(true);
            if last.same_selection(&window) && touches {
                if window.end > last.end {
                    last.end = window.end;
                }
                continue;
            }
        }
        merged.push(window);
    }
    merged.sort_by_key(|w| (w.start, w.end));
    merged
}
