//! Weight-proportional cryptographic sortition.
//!
//! A member holding `weight` units out of `total_weight` wins a number of
//! virtual seats drawn from Binomial(weight, expected / total_weight), with
//! the VRF value acting as the uniform random draw. Every participant that
//! knows the VRF value computes the same seat count, so the committee is
//! fixed without a voting round.

/// Errors from sortition parameters.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SortitionError {
    #[error("member weight must be at least 1")]
    ZeroWeight,
    #[error("total weight must be at least 1")]
    ZeroTotalWeight,
}

/// Map a VRF value onto [0, 1).
fn vrf_ratio(vrf_value: &crate::Hash) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&vrf_value[..8]);
    let draw = u64::from_be_bytes(bytes);
    // 2^64 as f64; the top 53 bits carry all the precision f64 has
    draw as f64 / 18_446_744_073_709_551_616.0
}

/// Number of seats won by a member (0 = not selected).
///
/// `expected_size` is the expected committee size across all members.
pub fn selected(
    expected_size: u64,
    weight: u64,
    total_weight: u64,
    vrf_value: &crate::Hash,
) -> Result<u64, SortitionError> {
    if weight == 0 {
        return Err(SortitionError::ZeroWeight);
    }
    if total_weight == 0 {
        return Err(SortitionError::ZeroTotalWeight);
    }
    if expected_size == 0 {
        return Ok(0);
    }
    if expected_size >= total_weight {
        return Ok(weight);
    }

    let p = expected_size as f64 / total_weight as f64;
    let ratio = vrf_ratio(vrf_value);

    // Walk the CDF in log space so large weights do not underflow.
    let log_odds = (p / (1.0 - p)).ln();
    let mut log_pmf = weight as f64 * (1.0 - p).ln();
    let mut cdf = 0.0f64;
    for j in 0..weight {
        cdf += log_pmf.exp();
        if ratio < cdf {
            return Ok(j);
        }
        log_pmf += ((weight - j) as f64 / (j + 1) as f64).ln() + log_odds;
    }
    Ok(weight)
}

/// Expected committee size for a given active jury count.
pub fn election_weight_value(total_jurors: u64) -> u64 {
    match total_jurors {
        0..=20 => 4,
        21..=50 => 7,
        51..=100 => 8,
        101..=200 => 15,
        201..=500 => 17,
        _ => 20,
    }
}
