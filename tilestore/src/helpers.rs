use num_traits::Num;
use std::fmt::Debug;

/// Make sure bounds are ordered correctly, eg right is to the right of left, top is above
/// bottom.
///
pub fn rearrange<N>(lower: N, upper: N) -> (N, N)
where
    N: Num + Debug + PartialOrd,
{
    if lower > upper {
        (upper, lower)
    } else {
        (lower, upper)
    }
}

/// Number of tiles of size `tile` needed to cover `extent` cells.
///
pub fn tiles_along(extent: usize, tile: usize) -> usize {
    if tile == 0 {
        0
    } else {
        extent.div_ceil(tile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rearrange() {
        assert_eq!(rearrange(3, 1), (1, 3));
        assert_eq!(rearrange(1, 3), (1, 3));
        assert_eq!(rearrange(2.5, 2.5), (2.5, 2.5));
    }

    #[test]
    fn test_tiles_along() {
        assert_eq!(tiles_along(1000, 22000), 1);
        assert_eq!(tiles_along(1000, 100), 10);
        assert_eq!(tiles_along(1001, 100), 11);
        assert_eq!(tiles_along(0, 100), 0);
        assert_eq!(tiles_along(10, 0), 0);
    }
}
