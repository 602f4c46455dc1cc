use ndarray::{s, Array2, ArrayView2};
use num_traits::NumCast;

use crate::{
    cell::Cell,
    errors::{Error, Result},
};

/// Reduces a source tile to half its resolution along each axis.
///
pub trait Downsampler: Send + Sync {
    /// Downsample `source` into a buffer of exactly `shape` cells.
    ///
    /// `shape` must be at most `ceil(rows / 2)` by `ceil(cols / 2)` of the source, so that every
    /// destination cell has at least one source cell.
    ///
    fn downsample<N: Cell>(&self, source: ArrayView2<N>, shape: [usize; 2]) -> Result<Array2<N>>;
}

/// 2x2 box filter: each destination cell is the average of the source block it covers.
///
/// Blocks clipped by the edge of the source average only the cells they have. Integer cells are
/// rounded to the nearest value.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct BoxFilter;

impl Downsampler for BoxFilter {
    fn downsample<N: Cell>(&self, source: ArrayView2<N>, shape: [usize; 2]) -> Result<Array2<N>> {
        let (rows, cols) = source.dim();
        let limit = [rows.div_ceil(2), cols.div_ceil(2)];
        if shape[0] > limit[0] || shape[1] > limit[1] {
            return Err(Error::ShapeMismatch {
                expected: limit,
                actual: shape,
            });
        }

        let average = |row: usize, col: usize| -> N {
            let block = source.slice(s![
                2 * row..(2 * row + 2).min(rows),
                2 * col..(2 * col + 2).min(cols)
            ]);
            if N::is_integer() {
                return integer_mean(block.iter());
            }

            let sum: f64 = block
                .iter()
                .map(|cell| cell.to_f64().unwrap_or(0.0))
                .sum();
            let mean = sum / block.len() as f64;

            <N as NumCast>::from(mean).unwrap_or_else(N::zero)
        };

        Ok(Array2::from_shape_fn((shape[0], shape[1]), |(row, col)| {
            average(row, col)
        }))
    }
}

/// Mean of integer cells, rounded half away from zero. Summed in i128 so 64 bit cells keep
/// every digit.
///
fn integer_mean<'a, N: Cell>(cells: impl Iterator<Item = &'a N>) -> N {
    let (sum, count) = cells.fold((0_i128, 0_i128), |(sum, count), cell| {
        (sum + cell.to_i128().unwrap_or(0), count + 1)
    });
    if count == 0 {
        return N::zero();
    }

    let half = count / 2;
    let mean = if sum >= 0 {
        (sum + half) / count
    } else {
        (sum - half) / count
    };

    <N as NumCast>::from(mean).unwrap_or_else(N::zero)
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::arr2;
    use paste::paste;

    #[test]
    fn test_even() -> Result<()> {
        let source = arr2(&[
            [1_u16, 3, 10, 10],
            [5, 7, 10, 11],
            [0, 0, 2, 2],
            [0, 1, 2, 2],
        ]);
        let cells = BoxFilter.downsample(source.view(), [2, 2])?;
        assert_eq!(cells, arr2(&[[4, 10], [0, 2]]));

        Ok(())
    }

    #[test]
    fn test_clipped_edges() -> Result<()> {
        let source = arr2(&[[1_i32, 3, 9], [5, 7, -9], [2, 4, 8]]);
        let cells = BoxFilter.downsample(source.view(), [2, 2])?;
        assert_eq!(cells, arr2(&[[4, 0], [3, 8]]));

        // Floor sized destination just drops the partial blocks
        let cells = BoxFilter.downsample(source.view(), [1, 1])?;
        assert_eq!(cells, arr2(&[[4]]));

        Ok(())
    }

    #[test]
    fn test_float_average() -> Result<()> {
        let source = arr2(&[[0.5_f32, 1.0], [0.0, 0.0]]);
        let cells = BoxFilter.downsample(source.view(), [1, 1])?;
        assert_eq!(cells, arr2(&[[0.375]]));

        Ok(())
    }

    #[test]
    fn test_integer_rounding() -> Result<()> {
        let source = arr2(&[[1_u8, 2], [2, 2]]);
        assert_eq!(BoxFilter.downsample(source.view(), [1, 1])?, arr2(&[[2]]));

        let source = arr2(&[[1_u8, 1], [1, 2]]);
        assert_eq!(BoxFilter.downsample(source.view(), [1, 1])?, arr2(&[[1]]));

        Ok(())
    }

    #[test]
    fn test_wide_integers() -> Result<()> {
        let big = 1_u64 << 60;
        let source = arr2(&[[big + 1, big + 1], [big + 3, big + 3]]);
        assert_eq!(BoxFilter.downsample(source.view(), [1, 1])?, arr2(&[[big + 2]]));

        let source = arr2(&[[u64::MAX, u64::MAX], [u64::MAX - 2, u64::MAX - 2]]);
        assert_eq!(
            BoxFilter.downsample(source.view(), [1, 1])?,
            arr2(&[[u64::MAX - 1]])
        );

        let source = arr2(&[[i64::MIN, i64::MIN + 1], [i64::MIN + 1, i64::MIN + 1]]);
        assert_eq!(
            BoxFilter.downsample(source.view(), [1, 1])?,
            arr2(&[[i64::MIN + 1]])
        );

        // Halves round away from zero
        let source = arr2(&[[-1_i64, -2]]);
        assert_eq!(BoxFilter.downsample(source.view(), [1, 1])?, arr2(&[[-2]]));

        Ok(())
    }

    #[test]
    fn test_too_big() {
        let source = Array2::<u16>::zeros((4, 5));
        let result = BoxFilter.downsample(source.view(), [3, 3]);
        assert!(matches!(
            result,
            Err(Error::ShapeMismatch {
                expected: [2, 3],
                actual: [3, 3]
            })
        ));
    }

    macro_rules! shape_tests {
        ($name:ident, $rows:expr, $cols:expr) => {
            paste! {
                #[test]
                fn [<test_shape_ $name>]() -> Result<()> {
                    let source = Array2::<u16>::from_elem(($rows, $cols), 3);
                    let shape = [$rows / 2, $cols / 2];
                    let cells = BoxFilter.downsample(source.view(), shape)?;
                    assert_eq!(cells.dim(), (shape[0], shape[1]));
                    assert!(cells.iter().all(|cell| *cell == 3));

                    Ok(())
                }
            }
        };
    }

    shape_tests!(square, 1000, 1000);
    shape_tests!(odd, 999, 13);
    shape_tests!(thin, 2, 301);
}
