//! Candidate ranking for multiple-choice selection

use anyhow::Result;

use crate::error::FusionError;

/// Loss assigned to candidates beyond an example's valid candidate count
pub const MASKED_CANDIDATE_LOSS: f32 = 9999.0;

/// Rank candidates per example by ascending loss
///
/// # Arguments
/// * `losses` - `losses[c][i]` is the loss of candidate `c` for example `i`
/// * `num_cand` - Optional number of valid candidates per example; later
///   candidates get [`MASKED_CANDIDATE_LOSS`]
///
/// # Returns
/// * Per example, candidate indices from best (lowest loss) to worst. Ties
///   keep candidate order.
pub fn rank_candidates(losses: &[Vec<f32>], num_cand: Option<&[usize]>) -> Result<Vec<Vec<usize>>> {
    let batch_size = losses.first().map(Vec::len).unwrap_or(0);
    for candidate in losses {
        FusionError::check_batch("candidate losses", batch_size, candidate.len())?;
    }
    if let Some(num_cand) = num_cand {
        FusionError::check_batch("candidate counts", batch_size, num_cand.len())?;
    }

    let mut rankings = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let mut scored: Vec<(usize, f32)> = losses
            .iter()
            .enumerate()
            .map(|(c, candidate)| {
                let masked = num_cand.map(|n| c >= n[i]).unwrap_or(false);
                (c, if masked { MASKED_CANDIDATE_LOSS } else { candidate[i] })
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        rankings.push(scored.into_iter().map(|(c, _)| c).collect());
    }
    Ok(rankings)
}
