use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Div, Index, Mul, Neg, Sub};

/// An n-dimensional integer vector in world units.
///
/// Used both for positions (ROI offsets) and for extents (ROI shapes, voxel
/// sizes). Arithmetic is element-wise; mixing coordinates of different rank is a
/// programming error and panics, the same way mismatched ndarray shapes do.
///
/// # Example
/// ```ignore
/// let voxel = Coordinate::new([4, 4]);
/// let shape = Coordinate::new([40, 20]);
/// assert_eq!(&shape / &voxel, Coordinate::new([10, 5]));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coordinate(Vec<i64>);

impl Coordinate {
    pub fn new(values: impl Into<Vec<i64>>) -> Self {
        Self(values.into())
    }

    /// Coordinate with every component set to `value`.
    pub fn splat(value: i64, dims: usize) -> Self {
        Self(vec![value; dims])
    }

    pub fn zeros(dims: usize) -> Self {
        Self::splat(0, dims)
    }

    pub fn ones(dims: usize) -> Self {
        Self::splat(1, dims)
    }

    pub fn dims(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.0.iter().copied()
    }

    /// Product of all components (number of elements for a shape).
    pub fn product(&self) -> i64 {
        self.0.iter().product()
    }

    pub fn is_multiple_of(&self, grid: &Coordinate) -> bool {
        self.zip_all(grid, |a, g| g != 0 && a.rem_euclid(g) == 0)
    }

    pub fn all_positive(&self) -> bool {
        self.0.iter().all(|&v| v > 0)
    }

    pub fn all_non_negative(&self) -> bool {
        self.0.iter().all(|&v| v >= 0)
    }

    /// Element-wise least common multiple.
    pub fn lcm(&self, other: &Coordinate) -> Coordinate {
        self.zip_map(other, |a, b| {
            let (a, b) = (a.abs(), b.abs());
            if a == 0 || b == 0 {
                0
            } else {
                a / gcd(a, b) * b
            }
        })
    }

    /// Element-wise minimum. Not `Ord::min`, which compares lexicographically.
    pub fn component_min(&self, other: &Coordinate) -> Coordinate {
        self.zip_map(other, i64::min)
    }

    /// Element-wise maximum.
    pub fn component_max(&self, other: &Coordinate) -> Coordinate {
        self.zip_map(other, i64::max)
    }

    /// Rounds each component down to the closest multiple of `grid`.
    pub fn round_down(&self, grid: &Coordinate) -> Coordinate {
        self.zip_map(grid, |a, g| a.div_euclid(g) * g)
    }

    /// Rounds each component up to the closest multiple of `grid`.
    pub fn round_up(&self, grid: &Coordinate) -> Coordinate {
        self.zip_map(grid, |a, g| -((-a).div_euclid(g)) * g)
    }

    /// Rounds each component to the nearest multiple of `grid`, ties upwards.
    pub fn round_nearest(&self, grid: &Coordinate) -> Coordinate {
        self.zip_map(grid, |a, g| (a + g / 2).div_euclid(g) * g)
    }

    pub(crate) fn zip_map(&self, other: &Coordinate, f: impl Fn(i64, i64) -> i64) -> Coordinate {
        self.check_rank(other);
        Coordinate(self.0.iter().zip(&other.0).map(|(&a, &b)| f(a, b)).collect())
    }

    pub(crate) fn zip_all(&self, other: &Coordinate, f: impl Fn(i64, i64) -> bool) -> bool {
        self.check_rank(other);
        self.0.iter().zip(&other.0).all(|(&a, &b)| f(a, b))
    }

    fn check_rank(&self, other: &Coordinate) {
        assert_eq!(
            self.dims(),
            other.dims(),
            "coordinate rank mismatch: {} vs {}",
            self,
            other
        );
    }
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl<const N: usize> From<[i64; N]> for Coordinate {
    fn from(values: [i64; N]) -> Self {
        Self(values.to_vec())
    }
}

impl From<Vec<i64>> for Coordinate {
    fn from(values: Vec<i64>) -> Self {
        Self(values)
    }
}

impl Index<usize> for Coordinate {
    type Output = i64;

    fn index(&self, axis: usize) -> &i64 {
        &self.0[axis]
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

macro_rules! elementwise_op {
    ($trait:ident, $method:ident, $op:tt) => {
        impl $trait<&Coordinate> for &Coordinate {
            type Output = Coordinate;

            fn $method(self, rhs: &Coordinate) -> Coordinate {
                self.zip_map(rhs, |a, b| a $op b)
            }
        }

        impl $trait<Coordinate> for Coordinate {
            type Output = Coordinate;

            fn $method(self, rhs: Coordinate) -> Coordinate {
                (&self).$method(&rhs)
            }
        }

        impl $trait<&Coordinate> for Coordinate {
            type Output = Coordinate;

            fn $method(self, rhs: &Coordinate) -> Coordinate {
                (&self).$method(rhs)
            }
        }
    };
}

elementwise_op!(Add, add, +);
elementwise_op!(Sub, sub, -);
elementwise_op!(Mul, mul, *);
elementwise_op!(Div, div, /);

impl Mul<i64> for &Coordinate {
    type Output = Coordinate;

    fn mul(self, rhs: i64) -> Coordinate {
        Coordinate(self.0.iter().map(|v| v * rhs).collect())
    }
}

impl Neg for &Coordinate {
    type Output = Coordinate;

    fn neg(self) -> Coordinate {
        Coordinate(self.0.iter().map(|v| -v).collect())
    }
}
