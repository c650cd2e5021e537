//! Results output formatting (CSV).

use std::io::Write;

use crate::error::Result;
use crate::solver::{PackSolution, Series};

/// Write a pack solution as CSV, one row per completed step.
///
/// Per-cell series get one column per cell:
/// ```csv
/// Time [s],Pack current [A],Pack terminal voltage [V],Cell current [A][0],Cell current [A][1],...
/// 10,5,3.61,2.5,2.5
/// ```
pub fn write_csv<W: Write>(solution: &PackSolution, writer: &mut W) -> Result<()> {
    let keys = solution.keys();
    let series: Vec<Series<'_>> = keys.iter().filter_map(|k| solution.get(k)).collect();

    let mut header = Vec::new();
    for (key, s) in keys.iter().zip(&series) {
        match s {
            Series::Scalar(_) => header.push(key.to_string()),
            Series::PerCell(grid) => header.extend((0..grid.cols()).map(|c| format!("{key}[{c}]"))),
        }
    }
    writeln!(writer, "{}", header.join(","))?;

    for step in 0..solution.steps() {
        let mut row = Vec::with_capacity(header.len());
        for s in &series {
            match s {
                Series::Scalar(values) => row.push(values[step].to_string()),
                Series::PerCell(grid) => row.extend(grid.row(step).iter().map(f64::to_string)),
            }
        }
        writeln!(writer, "{}", row.join(","))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Grid;
    use crate::solver::Termination;
    use crate::stats::SolveStats;

    #[test]
    fn test_csv_layout() {
        let solution = PackSolution {
            time: vec![10.0, 20.0],
            pack_current: vec![5.0, 5.0],
            pack_terminal_voltage: vec![3.6, 3.5],
            cell_current: Grid::from_rows(&[vec![2.5, 2.5], vec![2.4, 2.6]]).unwrap(),
            variables: vec![(
                "Terminal voltage [V]".into(),
                Grid::from_rows(&[vec![3.7, 3.7], vec![3.6, 3.6]]).unwrap(),
            )],
            events: Vec::new(),
            termination: Termination::Completed,
            stats: SolveStats::default(),
        };
        let mut out = Vec::new();
        write_csv(&solution, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "Time [s],Pack current [A],Pack terminal voltage [V],\
             Cell current [A][0],Cell current [A][1],\
             Terminal voltage [V][0],Terminal voltage [V][1]"
        );
        assert_eq!(lines[2], "20,5,3.5,2.4,2.6,3.6,3.6");
    }
}
