//! Rank correlation statistics
//!
//! Both statistics return `Ok(None)` when the correlation is undefined: fewer than
//! two entries, a NaN, or a vector whose entries are all tied.

use crate::error::{KolosalError, Result};

fn check_inputs(x: &[f64], y: &[f64]) -> Result<bool> {
    if x.len() != y.len() {
        return Err(KolosalError::ShapeError {
            expected: format!("{} losses", x.len()),
            actual: format!("{} losses", y.len()),
        });
    }
    Ok(x.len() >= 2 && !x.iter().chain(y).any(|v| v.is_nan()))
}

/// Kendall tau-b between two paired samples (ties in either vector are corrected for)
pub fn kendall_tau(x: &[f64], y: &[f64]) -> Result<Option<f64>> {
    if !check_inputs(x, y)? {
        return Ok(None);
    }

    let n = x.len();
    let mut concordant = 0i64;
    let mut discordant = 0i64;
    let mut ties_x = 0i64;
    let mut ties_y = 0i64;

    for i in 0..n {
        for j in (i + 1)..n {
            let tied_x = x[i] == x[j];
            let tied_y = y[i] == y[j];
            if tied_x {
                ties_x += 1;
            }
            if tied_y {
                ties_y += 1;
            }
            if tied_x || tied_y {
                continue;
            }
            // NaN is rejected up front, so both orderings exist
            if x[i].partial_cmp(&x[j]) == y[i].partial_cmp(&y[j]) {
                concordant += 1;
            } else {
                discordant += 1;
            }
        }
    }

    let pairs = (n * (n - 1) / 2) as i64;
    let denominator = (((pairs - ties_x) * (pairs - ties_y)) as f64).sqrt();
    if denominator == 0.0 {
        return Ok(None);
    }

    Ok(Some((concordant - discordant) as f64 / denominator))
}

/// Spearman rho: Pearson correlation of average ranks
pub fn spearman_rho(x: &[f64], y: &[f64]) -> Result<Option<f64>> {
    if !check_inputs(x, y)? {
        return Ok(None);
    }
    Ok(pearson(&average_ranks(x), &average_ranks(y)))
}

/// 1-based ranks; tied values share the mean of the ranks they span
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // positions start..end hold ranks start+1..=end
        let rank = (start + end + 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }
    ranks
}

fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}
