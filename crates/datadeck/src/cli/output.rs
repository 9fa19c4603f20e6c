//! Output formatting for CLI commands: tables, frames, timestamps.

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use datadeck_db::DataFrame;
use serde_json::{Map, Value};

/// Print a table with headers and rows
pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let header_cells: Vec<Cell> = headers
        .iter()
        .map(|h| Cell::new(h).fg(Color::Cyan))
        .collect();
    table.set_header(header_cells);

    for row in rows {
        table.add_row(row);
    }

    println!("{}", table);
}

/// Print the first `limit` rows of a frame, with a row count footer.
pub fn print_frame(frame: &DataFrame, limit: usize) {
    let names = frame.column_names();
    let headers: Vec<&str> = names.iter().map(String::as_str).collect();
    print_table(&headers, frame.head(limit).to_string_rows());
    println!("{}", row_footer(limit.min(frame.num_rows()), frame.num_rows()));
}

fn row_footer(shown: usize, total: usize) -> String {
    if shown < total {
        format!("({} of {} rows)", format_number(shown as i64), format_number(total as i64))
    } else {
        format!("({} row{})", format_number(total as i64), if total == 1 { "" } else { "s" })
    }
}

/// The first `limit` rows as JSON objects keyed by column name.
///
/// Values are rendered as text; nulls stay null.
pub fn frame_to_json(frame: &DataFrame, limit: usize) -> Value {
    let frame = frame.head(limit);
    let names = frame.column_names();
    let columns: Vec<Vec<Option<String>>> = names
        .iter()
        .map(|name| frame.column_as_strings(name).unwrap_or_default())
        .collect();

    let rows = (0..frame.num_rows())
        .map(|row| {
            let mut object = Map::new();
            for (name, values) in names.iter().zip(&columns) {
                let value = match values.get(row).cloned().flatten() {
                    Some(text) => Value::String(text),
                    None => Value::Null,
                };
                object.insert(name.clone(), value);
            }
            Value::Object(object)
        })
        .collect();
    Value::Array(rows)
}

/// "1,234,567"
pub fn format_number(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if n < 0 {
        format!("-{}", out)
    } else {
        out
    }
}

/// Relative time for recent timestamps, absolute date after a week.
pub fn format_timestamp(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(time) => format_since(time, Utc::now()),
        None => "never".to_string(),
    }
}

fn format_since(time: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - time).num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }
    let plural = |n: i64, unit: &str| format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" });
    match secs {
        0..=59 => plural(secs, "second"),
        60..=3599 => plural(secs / 60, "minute"),
        3600..=86_399 => plural(secs / 3600, "hour"),
        86_400..=604_799 => plural(secs / 86_400, "day"),
        _ => time.format("%Y-%m-%d %H:%M").to_string(),
    }
}
