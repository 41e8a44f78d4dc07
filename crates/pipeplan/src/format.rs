//! Schedule Formatting
//!
//! Human-readable table rendering plus CSV persistence for compute
//! schedules. The CSV layout is one row per rank with blank cells for idle
//! steps, so a schedule written out and read back is identical.
//!
//! @version 0.1.0

use std::fmt::Write as _;

use crate::action::{parse_slot, ComputeSchedule};
use crate::error::{Result, ScheduleError};

// =============================================================================
// Table Rendering
// =============================================================================

/// Renders a compute schedule as an aligned text table, one column per rank
/// and one row per timestep. Idle slots render as blank cells.
#[must_use]
pub fn format_pipeline_order(order: &ComputeSchedule) -> String {
    let num_steps = order.values().map(Vec::len).max().unwrap_or(0);
    let step_label_width = format!("Step {}:", num_steps.saturating_sub(1)).len();

    let mut cells: Vec<Vec<String>> = Vec::with_capacity(order.len());
    let mut widths: Vec<usize> = Vec::with_capacity(order.len());
    for (rank, row) in order {
        let header = format!("Rank {rank}");
        let mut column = vec![header.clone()];
        for t in 0..num_steps {
            let cell = match row.get(t).copied().flatten() {
                Some(action) => action.to_string(),
                None => String::new(),
            };
            column.push(cell);
        }
        let width = column.iter().map(String::len).max().unwrap_or(0);
        widths.push(width);
        cells.push(column);
    }

    let mut out = String::new();
    let _ = write!(out, "{:step_label_width$}", "");
    for (column, &width) in cells.iter().zip(&widths) {
        let _ = write!(out, " {:width$}", column[0]);
    }
    out.push('\n');
    for t in 0..num_steps {
        let label = format!("Step {t}:");
        let _ = write!(out, "{label:step_label_width$}");
        for (column, &width) in cells.iter().zip(&widths) {
            let _ = write!(out, " {:width$}", column[t + 1]);
        }
        out.push('\n');
    }
    out
}

// =============================================================================
// CSV Persistence
// =============================================================================

/// Serializes a compute schedule to CSV, one row per rank in rank order.
/// Idle slots become empty cells.
///
/// Rank ids are positional: row `i` of the output is the schedule's `i`-th
/// rank in key order, and [`from_csv`] reads row `i` back as rank `i`. The
/// built-in generators always produce ranks `0..group_size`, so the round
/// trip is identity for them; a schedule with gaps in its rank keys comes
/// back renumbered.
pub fn to_csv(order: &ComputeSchedule) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    for row in order.values() {
        let record: Vec<String> = row
            .iter()
            .map(|slot| slot.map_or_else(String::new, |action| action.to_string()))
            .collect();
        writer
            .write_record(&record)
            .map_err(|e| ScheduleError::Serialization(e.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| ScheduleError::Serialization(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ScheduleError::Serialization(e.to_string()))
}

/// Parses a compute schedule from CSV produced by [`to_csv`]. Row order
/// assigns ranks starting from zero (see the positional-rank contract on
/// [`to_csv`]); empty cells become idle slots.
pub fn from_csv(text: &str) -> Result<ComputeSchedule> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut order = ComputeSchedule::new();
    for (rank, record) in reader.records().enumerate() {
        let record = record.map_err(|e| ScheduleError::Serialization(e.to_string()))?;
        let row = record
            .iter()
            .map(parse_slot)
            .collect::<Result<Vec<_>>>()?;
        order.insert(rank, row);
    }
    Ok(order)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::config::{PipelineConfig, SchedulePolicy};
    use crate::generate::generate;

    fn parse_row(tokens: &[&str]) -> Vec<Option<Action>> {
        tokens.iter().map(|t| parse_slot(t).unwrap()).collect()
    }

    #[test]
    fn test_format_table_layout() {
        let order: ComputeSchedule = [
            (0, parse_row(&["0F0", "0F1", "   ", "0B0"])),
            (1, parse_row(&["   ", "1F0", "1B0"])),
        ]
        .into_iter()
        .collect();
        let table = format_pipeline_order(&order);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains("Rank 0"));
        assert!(lines[0].contains("Rank 1"));
        assert!(lines[1].starts_with("Step 0:"));
        assert!(lines[1].contains("0F0"));
        // Rank 1 idles at step 0 and step 3.
        assert!(!lines[1].contains("1F0"));
        assert!(lines[2].contains("1F0"));
        assert!(lines[4].contains("0B0"));
        assert!(!lines[4].contains('1'));
    }

    #[test]
    fn test_csv_round_trip_is_identical() {
        let config = PipelineConfig::new(2, 8, 4).unwrap();
        let order = generate(&config, SchedulePolicy::Interleaved1F1B).unwrap();
        let text = to_csv(&order).unwrap();
        let restored = from_csv(&text).unwrap();
        assert_eq!(order, restored);
        // Byte-identical on a second pass.
        assert_eq!(text, to_csv(&restored).unwrap());
    }

    #[test]
    fn test_csv_blank_cells_are_idle() {
        let order: ComputeSchedule = [
            (0, parse_row(&["0F0", "   ", "0B0"])),
            (1, parse_row(&["   ", "1F0"])),
        ]
        .into_iter()
        .collect();
        let text = to_csv(&order).unwrap();
        let restored = from_csv(&text).unwrap();
        assert_eq!(restored[&0][1], None);
        assert_eq!(restored[&1][0], None);
        assert_eq!(restored[&1][1], Some(Action::forward(1, 0)));
    }

    #[test]
    fn test_csv_ranks_are_positional() {
        // Rank keys are not stored in the file: rows are renumbered from
        // zero on read, per the documented contract.
        let order: ComputeSchedule = [
            (1, parse_row(&["1F0"])),
            (3, parse_row(&["3F0"])),
        ]
        .into_iter()
        .collect();
        let restored = from_csv(&to_csv(&order).unwrap()).unwrap();
        assert_eq!(restored.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(restored[&0], order[&1]);
        assert_eq!(restored[&1], order[&3]);
    }

    #[test]
    fn test_csv_rejects_garbage() {
        assert!(from_csv("0F0,XYZ\n").is_err());
    }
}
