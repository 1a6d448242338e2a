//! Pool-adjacent-violators (PAV) isotonic regression.
//!
//! Given an ordered sequence of weighted observations we find the
//! non-decreasing step function minimizing the weighted squared error:
//!
//! ```text
//! minimize Σ w_i (y_i - f_i)^2   subject to   f_1 <= f_2 <= ... <= f_n
//! ```
//!
//! The solution is piecewise constant; each piece ("block") takes the weighted
//! mean of the observations it pools. We build it in a single left-to-right pass
//! with a stack of blocks, merging the top two whenever they violate the order.
//! A non-increasing fit is obtained by the caller by reversing the input.

/// A run of consecutive input positions sharing one fitted value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PavBlock {
    /// First input index covered by the block (inclusive).
    pub first: usize,
    /// Last input index covered by the block (inclusive).
    pub last: usize,
    pub sum: f64,
    pub weight: f64,
}

impl PavBlock {
    /// Fitted value of the block (weighted mean).
    pub fn mean(&self) -> f64 {
        self.sum / self.weight
    }
}

/// Run PAV on pre-aggregated observations.
///
/// `sums[i]` is the weighted sum of outcomes at position `i` and `weights[i]`
/// the total weight there (for binary outcomes: number of positives and number
/// of observations). Weights must be positive.
pub fn pool_adjacent_violators(sums: &[f64], weights: &[f64]) -> Vec<PavBlock> {
    debug_assert_eq!(sums.len(), weights.len());
    let mut stack: Vec<PavBlock> = Vec::with_capacity(sums.len());

    for (i, (&sum, &weight)) in sums.iter().zip(weights).enumerate() {
        stack.push(PavBlock {
            first: i,
            last: i,
            sum,
            weight,
        });

        while let [.., below, top] = stack.as_mut_slice() {
            // Stop unless below.mean > top.mean (cross-multiplied, weights are positive).
            if below.sum * top.weight <= top.sum * below.weight {
                break;
            }
            below.last = top.last;
            below.sum += top.sum;
            below.weight += top.weight;
            stack.pop();
        }
    }

    stack
}

/// Expand blocks to one fitted value per input position.
pub fn expand_blocks(blocks: &[PavBlock], len: usize) -> Vec<f64> {
    let mut out = vec![0.0; len];
    for b in blocks {
        let v = b.mean();
        for slot in &mut out[b.first..=b.last] {
            *slot = v;
        }
    }
    out
}
