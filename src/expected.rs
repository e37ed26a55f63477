/// Sum of `0, 1, ..., num_ranks * per_rank - 1`.
///
/// Halves whichever of `L` and `L - 1` is even before multiplying, so the product never needs
/// the extra bit `L * (L - 1)` would. Arithmetic wraps like the reduction does.
pub fn expected_sum(num_ranks: usize, per_rank: usize) -> u64 {
    let len = (num_ranks as u64).wrapping_mul(per_rank as u64);
    if len == 0 {
        return 0;
    }

    if len % 2 == 0 {
        (len / 2).wrapping_mul(len - 1)
    } else {
        len.wrapping_mul((len - 1) / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(len: u128) -> u128 {
        len * len.saturating_sub(1) / 2
    }

    #[test]
    fn small_ranges() {
        assert_eq!(expected_sum(1, 4), 6);
        assert_eq!(expected_sum(2, 4), 28);
        assert_eq!(expected_sum(3, 1), 3);
        assert_eq!(expected_sum(1, 1), 0);
    }

    #[test]
    fn empty_range_sums_to_zero() {
        assert_eq!(expected_sum(0, 4), 0);
        assert_eq!(expected_sum(4, 0), 0);
    }

    #[test]
    fn matches_wide_arithmetic_for_both_parities() {
        for ranks in 1..=8usize {
            for per_rank in [1usize, 2, 3, 7, 1_000, 125_001, 1_000_000] {
                let len = (ranks * per_rank) as u128;
                assert_eq!(
                    expected_sum(ranks, per_rank) as u128,
                    reference(len),
                    "ranks = {ranks}, per_rank = {per_rank}"
                );
            }
        }
    }

    #[test]
    fn no_overflow_near_the_top_of_u64() {
        // L * (L - 1) overflows u64 here, the halved product does not.
        let len = 6_000_000_000u64;
        assert_eq!(
            expected_sum(len as usize, 1) as u128,
            reference(len as u128)
        );
    }
}
