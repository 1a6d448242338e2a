//! ASCII plotting for terminal output.
//!
//! Fixed-size character grids, optimized for quick visual checks in a terminal
//! and deterministic output (helpful for golden tests).
//!
//! PAV plot elements:
//! - calibrated LR per evaluated pair: `-` line
//! - post-hoc PAV LR of the same pairs: `o`
//!
//! The LR histogram is drawn as horizontal bars, one row per log10-LR bin.

use crate::eval::{HistogramBin, PavPoint};

/// Render the (score, log10 LR) curve of an evaluation.
pub fn render_pav_plot(curve: &[PavPoint], width: usize, height: usize) -> String {
    let width = width.max(10);
    let height = height.max(5);

    let line: Vec<(f64, f64)> = curve
        .iter()
        .map(|p| (p.score, p.lr.log10()))
        .filter(|&(x, y)| x.is_finite() && y.is_finite())
        .collect();
    let pav: Vec<(f64, f64)> = curve
        .iter()
        .filter_map(|p| Some((p.score, p.pav_lr?.log10())))
        .filter(|&(x, y)| x.is_finite() && y.is_finite())
        .collect();

    let (x_min, x_max) = span(line.iter().chain(&pav).map(|&(x, _)| x)).unwrap_or((0.0, 1.0));
    let (y_min, y_max) = span(line.iter().chain(&pav).map(|&(_, y)| y)).unwrap_or((-1.0, 1.0));
    let (y_min, y_max) = pad_range(y_min, y_max, 0.05);

    let mut grid = vec![vec![' '; width]; height];

    // Curve first so the PAV points overlay it.
    draw_curve(&mut grid, &line, (x_min, x_max), (y_min, y_max));
    for &(x, y) in &pav {
        let col = map_x(x, x_min, x_max, width);
        let row = map_y(y, y_min, y_max, height);
        grid[row][col] = 'o';
    }

    let mut out = String::new();
    out.push_str(&format!(
        "PAV: score=[{x_min:.3}, {x_max:.3}] | log10(LR)=[{y_min:.2}, {y_max:.2}]\n"
    ));
    for row in grid {
        out.push_str(&row.into_iter().collect::<String>());
        out.push('\n');
    }
    out
}

/// Render the log10-LR histogram as paired colocated/dislocated bars.
pub fn render_lr_histogram(bins: &[HistogramBin], width: usize) -> String {
    let max = bins
        .iter()
        .map(|b| b.colocated.max(b.dislocated))
        .max()
        .unwrap_or(0);
    if max == 0 {
        return "LR histogram: no labeled pairs\n".to_string();
    }
    let bar_width = (width.saturating_sub(40) / 2).max(4);
    let bar = |n: usize| "#".repeat(((n as f64 / max as f64) * bar_width as f64).round() as usize);

    let mut out = String::new();
    out.push_str(
        format!(
            "{:<16} {:<bar_width$} {:>6} | {:<bar_width$} {:>6}",
            "log10(LR)", "colocated", "", "dislocated", ""
        )
        .trim_end(),
    );
    out.push('\n');
    for b in bins {
        out.push_str(
            format!(
                "{:<16} {:<bar_width$} {:>6} | {:<bar_width$} {:>6}",
                format!("[{:.2}, {:.2})", b.log10_lower, b.log10_upper),
                bar(b.colocated),
                b.colocated,
                bar(b.dislocated),
                b.dislocated,
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

fn span(values: impl Iterator<Item = f64>) -> Option<(f64, f64)> {
    let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
    for v in values {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if !(lo.is_finite() && hi.is_finite()) {
        return None;
    }
    if hi > lo {
        Some((lo, hi))
    } else {
        Some((lo - 0.5, hi + 0.5))
    }
}

fn pad_range(min: f64, max: f64, frac: f64) -> (f64, f64) {
    let span = (max - min).abs();
    let pad = (span * frac).max(1e-12);
    (min - pad, max + pad)
}

fn map_x(x: f64, x_min: f64, x_max: f64, width: usize) -> usize {
    let width = width.max(2);
    let u = ((x - x_min) / (x_max - x_min)).clamp(0.0, 1.0);
    (u * (width as f64 - 1.0)).round() as usize
}

fn map_y(y: f64, y_min: f64, y_max: f64, height: usize) -> usize {
    let height = height.max(2);
    let u = ((y - y_min) / (y_max - y_min)).clamp(0.0, 1.0);
    // y_max is row 0
    (height as f64 - 1.0 - (u * (height as f64 - 1.0))).round() as usize
}

fn draw_curve(grid: &mut [Vec<char>], curve: &[(f64, f64)], (x_min, x_max): (f64, f64), (y_min, y_max): (f64, f64)) {
    let height = grid.len();
    let Some(width) = grid.first().map(Vec::len) else {
        return;
    };

    let mut prev = None;
    for &(x, y) in curve {
        let col = map_x(x, x_min, x_max, width);
        let row = map_y(y, y_min, y_max, height);
        match prev {
            Some((c0, r0)) => draw_line(grid, c0, r0, col, row, '-'),
            None => grid[row][col] = '-',
        }
        prev = Some((col, row));
    }
}

/// Integer line drawing (Bresenham).
fn draw_line(grid: &mut [Vec<char>], x0: usize, y0: usize, x1: usize, y1: usize, ch: char) {
    let mut x0 = x0 as isize;
    let mut y0 = y0 as isize;
    let x1 = x1 as isize;
    let y1 = y1 as isize;

    let dx = (x1 - x0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let dy = -(y1 - y0).abs();
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        if y0 >= 0
            && (y0 as usize) < grid.len()
            && x0 >= 0
            && (x0 as usize) < grid[0].len()
            && grid[y0 as usize][x0 as usize] == ' '
        {
            grid[y0 as usize][x0 as usize] = ch;
        }

        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}
