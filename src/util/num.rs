/// Round up `n` to the nearest multiple of `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * n.div_ceil(to)
}

/// Round up `n` to a multiple of `to`, or `None` if that overflows
pub fn checked_round_up(n: usize, to: usize) -> Option<usize> {
    n.div_ceil(to).checked_mul(to)
}
