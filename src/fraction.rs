//! Rational frame-rate values.

use std::fmt;
use std::str::FromStr;

/// A rational number used to express frame rates.
///
/// `den == 0` represents positive infinity when `num != 0`; `0/0` and any
/// string that fails to parse both normalise to the invalid sentinel
/// `0/1`. Comparisons and equality are exact, via cross-multiplication,
/// never via floating point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Fraction {
    num: i64,
    den: i64,
}

impl Fraction {
    /// The invalid sentinel `0/1`.
    pub const INVALID: Fraction = Fraction { num: 0, den: 1 };

    /// Builds a fraction directly from a numerator and denominator.
    ///
    /// No normalisation is performed beyond what the type's invariants
    /// already document: `den == 0 && num != 0` means infinity.
    pub const fn new(num: i64, den: i64) -> Self {
        Fraction { num, den }
    }

    #[inline]
    pub const fn num(&self) -> i64 {
        self.num
    }

    #[inline]
    pub const fn den(&self) -> i64 {
        self.den
    }

    /// Parses `"N"` or `"N/D"`, rejecting any trailing characters after the
    /// numeric token on either side. Malformed input normalises to
    /// [`Fraction::INVALID`], never an error — this mirrors every other
    /// Preferences-adjacent read in this crate, which degrades to a
    /// default rather than panicking or propagating.
    pub fn parse(s: &str) -> Fraction {
        let s = s.trim();

        match s.split_once('/') {
            Some((num, den)) => {
                let (Ok(num), Ok(den)) = (parse_i64_strict(num.trim()), parse_i64_strict(den.trim())) else {
                    return Fraction::INVALID;
                };

                if den < 1 {
                    Fraction::INVALID
                } else {
                    Fraction { num, den }
                }
            }
            None => match parse_i64_strict(s) {
                Ok(num) => Fraction { num, den: 1 },
                Err(()) => Fraction::INVALID,
            },
        }
    }

    /// `true` if this fraction represents positive infinity (`den == 0`
    /// with a nonzero numerator).
    #[inline]
    pub const fn is_infinity(&self) -> bool {
        self.den == 0 && self.num != 0
    }

    /// `true` if this is the invalid sentinel `0/1` (or any other
    /// zero-numerator, nonzero-denominator fraction, which is equal to it
    /// in value).
    #[inline]
    pub fn is_valid(&self) -> bool {
        !(self.den == 0 && self.num == 0) && self.den != 0
    }

    /// The sign of the fraction: `-1`, `0`, or `1`.
    pub fn signum(&self) -> i64 {
        self.num.signum() * self.den.signum()
    }

    /// The value as a floating-point approximation. Infinite for
    /// [`is_infinity`](Self::is_infinity).
    pub fn value(&self) -> f64 {
        if self.den == 0 {
            if self.num > 0 {
                f64::INFINITY
            } else if self.num < 0 {
                f64::NEG_INFINITY
            } else {
                f64::NAN
            }
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

fn parse_i64_strict(s: &str) -> Result<i64, ()> {
    if s.is_empty() {
        return Err(());
    }
    s.parse::<i64>().map_err(|_| ())
}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fraction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Cross-multiply rather than compare `value()`, to stay exact for
        // ratios that don't round-trip through f64.
        let lhs = self.num as i128 * other.den as i128;
        let rhs = other.num as i128 * self.den as i128;
        lhs.cmp(&rhs)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for Fraction {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Fraction::parse(s))
    }
}

impl From<i64> for Fraction {
    fn from(num: i64) -> Self {
        Fraction { num, den: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let f = Fraction::parse("30000/1001");
        assert_eq!(f, Fraction::new(30000, 1001));
        assert_eq!(f.to_string(), "30000/1001");
        assert!((f.value() - 29.970_029_97).abs() < 1e-6);
    }

    #[test]
    fn garbage_is_invalid() {
        assert_eq!(Fraction::parse("abc"), Fraction::new(0, 1));
    }

    #[test]
    fn zero_denominator_normalises() {
        assert_eq!(Fraction::parse("3/0"), Fraction::INVALID);
        assert_eq!(Fraction::parse("3/-1"), Fraction::INVALID);
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        // The legacy `strtol`-style parser this type was distilled from
        // truncates at the first non-digit; this one does not.
        assert_eq!(Fraction::parse("30fps"), Fraction::INVALID);
        assert_eq!(Fraction::parse("30/1fps"), Fraction::INVALID);
    }

    #[test]
    fn infinity() {
        let f = Fraction::new(1, 0);
        assert!(f.is_infinity());
        assert_eq!(f.value(), f64::INFINITY);
    }
}
