//! Approximate equality of `f32` results.
//!
//! Kernels may reorder reductions (rayon on the host, workgroups on the GPU),
//! so outputs are compared by how close they are rather than bit for bit.

/// Differences below this are [`ApproxEquality::Precise`].
pub const F32_MIN_ERROR: f32 = 1e-6;

/// Differences below this are [`ApproxEquality::Partial`].
pub const F32_AVG_ERROR: f32 = 1e-5;

/// Differences below this are [`ApproxEquality::Relative`].
pub const F32_MAX_ERROR: f32 = 1e-3;

/// How close two values are, best first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Very strong epsilon.
    Precise = 0,
    /// Good epsilon.
    Partial = 1,
    /// Acceptable epsilon.
    Relative = 2,
    /// Not equal.
    Scarce = 3,
}

/// Rates the distance between `self` and `rhs`.
pub trait RelativeEq<Rhs: ?Sized> {
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq<Self> for f32 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self == rhs {
            return ApproxEquality::Precise;
        }
        // scale the tolerance for large magnitudes
        let dif = (self - rhs).abs() / self.abs().max(rhs.abs()).max(1.0);
        if dif < F32_MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < F32_AVG_ERROR {
            ApproxEquality::Partial
        } else if dif < F32_MAX_ERROR {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

/// The worst rating over all pairs. Slices of different lengths are
/// [`ApproxEquality::Scarce`].
impl<T: RelativeEq<U>, U> RelativeEq<[U]> for [T] {
    fn approx_eq(&self, rhs: &[U]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut eq = ApproxEquality::Precise;
        for (t, u) in self.iter().zip(rhs) {
            eq = eq.max(t.approx_eq(u));
            if eq == ApproxEquality::Scarce {
                break;
            }
        }
        eq
    }
}

/// True when `a` and `b` are at least [`ApproxEquality::Relative`].
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) <= ApproxEquality::Relative
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratings() {
        assert_eq!(1.0f32.approx_eq(&1.0f32), ApproxEquality::Precise);
        assert_eq!(1.0f32.approx_eq(&1.000_002f32), ApproxEquality::Partial);
        assert_eq!(1.0f32.approx_eq(&1.0001f32), ApproxEquality::Relative);
        assert_eq!(1.0f32.approx_eq(&1.1f32), ApproxEquality::Scarce);
        assert!(approx_eq(&1000.0f32, &1000.01f32));
    }

    #[test]
    fn slices_take_the_worst() {
        let a = [1.0f32, 2.0, 3.0];
        assert!(approx_eq(&a[..], &[1.0f32, 2.0001, 3.0][..]));
        assert!(!approx_eq(&a[..], &[1.0f32, 2.0, 4.0][..]));
        assert!(!approx_eq(&a[..], &[1.0f32, 2.0][..]));
    }
}
