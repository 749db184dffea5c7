//! Visual formatting of layer binding arrays.
//!
//! The profile's formatting grid lists key positions in visual order, row by
//! row; `-1` marks a spacer. Bindings are padded to the profile's key width
//! so columns line up. Without a grid, bindings go on a single line.

use crate::error::{Error, Result};
use crate::profile::{FormattingConfig, ROW_GAP};

/// Renders serialized bindings per the grid, one line per row, no trailing
/// whitespace on any line.
pub fn format_grid(cells: &[String], formatting: &FormattingConfig) -> Result<String> {
    let width = formatting.default_key_width.max(1);
    let mut lines = Vec::new();
    let mut placed = vec![false; cells.len()];

    for row in &formatting.rows {
        let mut line = String::new();
        for &slot in row {
            if slot == ROW_GAP {
                line.push_str(&" ".repeat(width + 1));
                continue;
            }
            let index = usize::try_from(slot).map_err(|_| {
                Error::Validation(format!("formatting grid position {slot} is negative"))
            })?;
            let cell = cells.get(index).ok_or_else(|| {
                Error::Validation(format!(
                    "formatting grid names position {index} but the layer has {} keys",
                    cells.len()
                ))
            })?;
            placed[index] = true;
            line.push_str(cell);
            if cell.len() < width {
                line.push_str(&" ".repeat(width - cell.len()));
            }
            line.push(' ');
        }
        lines.push(line.trim_end().to_string());
    }

    // Positions the grid does not cover go on a final line, in order.
    let leftovers: Vec<&String> = cells
        .iter()
        .enumerate()
        .filter(|(i, _)| !placed[*i])
        .map(|(_, c)| c)
        .collect();
    if !leftovers.is_empty() {
        if formatting.rows.is_empty() {
            // No grid at all: one line, single spaces.
            return Ok(leftovers
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(" "));
        }
        lines.push(
            leftovers
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_no_grid_single_line() {
        let formatting = FormattingConfig::default();
        let out = format_grid(&cells(&["&kp Q", "&trans"]), &formatting).unwrap();
        assert_eq!(out, "&kp Q &trans");
    }

    #[test]
    fn test_grid_rows_and_padding() {
        let formatting = FormattingConfig {
            rows: vec![vec![0, 1], vec![2, 3]],
            default_key_width: 10,
        };
        let out = format_grid(
            &cells(&["&kp Q", "&kp W", "&mo 1", "&trans"]),
            &formatting,
        )
        .unwrap();
        assert_eq!(out, "&kp Q      &kp W\n&mo 1      &trans");
    }

    #[test]
    fn test_gap_spacing() {
        let formatting = FormattingConfig {
            rows: vec![vec![0, ROW_GAP, 1]],
            default_key_width: 6,
        };
        let out = format_grid(&cells(&["&kp A", "&kp B"]), &formatting).unwrap();
        assert_eq!(out, "&kp A         &kp B");
    }

    #[test]
    fn test_no_trailing_whitespace() {
        let formatting = FormattingConfig {
            rows: vec![vec![0, ROW_GAP]],
            default_key_width: 8,
        };
        let out = format_grid(&cells(&["&kp A"]), &formatting).unwrap();
        for line in out.lines() {
            assert_eq!(line, line.trim_end());
        }
    }

    #[test]
    fn test_out_of_range_position_rejected() {
        let formatting = FormattingConfig {
            rows: vec![vec![0, 5]],
            default_key_width: 8,
        };
        assert!(format_grid(&cells(&["&kp A"]), &formatting).is_err());
    }

    #[test]
    fn test_uncovered_positions_appended() {
        let formatting = FormattingConfig {
            rows: vec![vec![0]],
            default_key_width: 4,
        };
        let out = format_grid(&cells(&["&kp A", "&kp B"]), &formatting).unwrap();
        assert_eq!(out, "&kp A\n&kp B");
    }
}
