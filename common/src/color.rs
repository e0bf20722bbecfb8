use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// A 3x3 linear colour transform, stored row-major.
///
/// Row `i` produces output channel `i` from the input `(r, g, b)`:
///
/// ```text
/// r' = r*m0 + g*m1 + b*m2
/// g' = r*m3 + g*m4 + b*m5
/// b' = r*m6 + g*m7 + b*m8
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatrix([f64; 9]);

impl ColorMatrix {
    pub const IDENTITY: Self = Self([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);

    pub const fn new(coefficients: [f64; 9]) -> Self {
        Self(coefficients)
    }

    /// Look up the matrix registered under `name`.
    pub fn for_name(name: &str) -> Result<Self, UnknownFilter> {
        name.parse::<Filter>().map(Filter::matrix)
    }

    pub fn coefficients(&self) -> &[f64; 9] {
        &self.0
    }

    /// Apply the matrix to one RGB triple. No clamping happens here; see
    /// [`to_channel`] for the write-back rule.
    #[inline]
    pub fn apply(&self, r: u8, g: u8, b: u8) -> [f64; 3] {
        let m = &self.0;
        let (r, g, b) = (f64::from(r), f64::from(g), f64::from(b));
        [
            r * m[0] + g * m[1] + b * m[2],
            r * m[3] + g * m[4] + b * m[5],
            r * m[6] + g * m[7] + b * m[8],
        ]
    }

    /// Sum of each row. Close to 1.0 for every registered filter, which keeps
    /// overall luminance roughly unchanged.
    pub fn row_sums(&self) -> [f64; 3] {
        let m = &self.0;
        [m[0] + m[1] + m[2], m[3] + m[4] + m[5], m[6] + m[7] + m[8]]
    }
}

/// Free-function form of [`ColorMatrix::apply`].
#[inline]
pub fn apply(matrix: &ColorMatrix, r: u8, g: u8, b: u8) -> [f64; 3] {
    matrix.apply(r, g, b)
}

/// Convert a transformed channel value back to a byte: clamp to 0..=255, then
/// round half to even.
///
/// Works in `f64` so exact ties such as `1*0.242 + 251*0.758 == 190.5` stay
/// ties; in `f32` the same sum rounds above the half.
#[inline]
pub fn to_channel(value: f64) -> u8 {
    // NaN falls through clamp and saturates to 0 in the cast.
    value.clamp(0.0, 255.0).round_ties_even() as u8
}

/// The registered colour-vision-deficiency simulations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    #[default]
    Normal,
    Protanopia,
    Deuteranopia,
    Tritanopia,
}

impl Filter {
    pub const ALL: [Filter; 4] = [
        Filter::Normal,
        Filter::Protanopia,
        Filter::Deuteranopia,
        Filter::Tritanopia,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Filter::Normal => "normal",
            Filter::Protanopia => "protanopia",
            Filter::Deuteranopia => "deuteranopia",
            Filter::Tritanopia => "tritanopia",
        }
    }

    pub fn matrix(self) -> ColorMatrix {
        match self {
            Filter::Normal => ColorMatrix::IDENTITY,
            Filter::Protanopia => {
                ColorMatrix::new([0.567, 0.433, 0.0, 0.558, 0.442, 0.0, 0.0, 0.242, 0.758])
            }
            Filter::Deuteranopia => {
                ColorMatrix::new([0.625, 0.375, 0.0, 0.7, 0.3, 0.0, 0.0, 0.3, 0.7])
            }
            Filter::Tritanopia => {
                ColorMatrix::new([0.95, 0.05, 0.0, 0.0, 0.433, 0.567, 0.0, 0.475, 0.525])
            }
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Filter {
    type Err = UnknownFilter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| UnknownFilter(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown filter '{0}', expected one of normal, protanopia, deuteranopia, tritanopia")]
pub struct UnknownFilter(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(filter: Filter, r: u8, g: u8, b: u8) -> [u8; 3] {
        let [r, g, b] = filter.matrix().apply(r, g, b);
        [to_channel(r), to_channel(g), to_channel(b)]
    }

    #[test]
    fn normal_is_exact_identity() {
        let m = Filter::Normal.matrix();
        for r in 0..=255u8 {
            for g in 0..=255u8 {
                for b in (0..=255u8).step_by(3) {
                    assert_eq!(
                        m.apply(r, g, b),
                        [f64::from(r), f64::from(g), f64::from(b)],
                        "identity broken at ({r}, {g}, {b})"
                    );
                }
            }
        }
    }

    #[test]
    fn outputs_stay_in_byte_range() {
        for filter in Filter::ALL {
            let m = filter.matrix();
            for r in (0..=255u8).step_by(5) {
                for g in (0..=255u8).step_by(5) {
                    for b in (0..=255u8).step_by(5) {
                        for v in m.apply(r, g, b) {
                            assert!(v >= 0.0, "{filter} produced {v} for ({r}, {g}, {b})");
                            assert!(v < 255.5, "{filter} produced {v} for ({r}, {g}, {b})");
                        }
                    }
                }
            }
            // Saturated white is the worst case for rows summing slightly above 1.0.
            assert_eq!(transform(filter, 255, 255, 255), [255, 255, 255]);
        }
    }

    #[test]
    fn apply_is_deterministic() {
        let m = Filter::Deuteranopia.matrix();
        assert_eq!(m.apply(12, 200, 99), m.apply(12, 200, 99));
        assert_eq!(apply(&m, 12, 200, 99), m.apply(12, 200, 99));
    }

    #[test]
    fn protanopia_worked_example_rounds_half_even() {
        let [r, g, b] = Filter::Protanopia.matrix().apply(200, 120, 80);
        assert!((r - 165.36).abs() < 1e-3, "r' = {r}");
        assert!((g - 164.64).abs() < 1e-3, "g' = {g}");
        assert!((b - 89.68).abs() < 1e-3, "b' = {b}");
        assert_eq!(transform(Filter::Protanopia, 200, 120, 80), [165, 165, 90]);
    }

    #[test]
    fn to_channel_clamps_and_rounds() {
        assert_eq!(to_channel(-3.2), 0);
        assert_eq!(to_channel(300.0), 255);
        assert_eq!(to_channel(254.5), 254);
        assert_eq!(to_channel(253.5), 254);
        assert_eq!(to_channel(10.49), 10);
        assert_eq!(to_channel(f64::NAN), 0);
    }

    #[test]
    fn matches_double_precision_evaluation_over_full_cube() {
        for filter in [Filter::Protanopia, Filter::Deuteranopia, Filter::Tritanopia] {
            let m = filter.matrix();
            let c: [f64; 9] = *m.coefficients();
            for r in 0..=255u8 {
                for g in 0..=255u8 {
                    for b in 0..=255u8 {
                        let (x, y, z) = (f64::from(r), f64::from(g), f64::from(b));
                        let expected = [
                            x * c[0] + y * c[1] + z * c[2],
                            x * c[3] + y * c[4] + z * c[5],
                            x * c[6] + y * c[7] + z * c[8],
                        ]
                        .map(|v| v.clamp(0.0, 255.0).round_ties_even() as u8);
                        assert_eq!(
                            transform(filter, r, g, b),
                            expected,
                            "{filter} at ({r}, {g}, {b})"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn half_way_blue_rounds_like_doubles() {
        // 1*0.242 + 251*0.758 is exactly 190.5 in f64; ties go to even.
        assert_eq!(transform(Filter::Protanopia, 0, 1, 251), [0, 0, 190]);
    }

    #[test]
    fn rows_sum_near_one() {
        for filter in Filter::ALL {
            for sum in filter.matrix().row_sums() {
                assert!((sum - 1.0).abs() < 1e-3, "{filter} row sum {sum}");
            }
        }
    }

    #[test]
    fn lookup_by_name() {
        for filter in Filter::ALL {
            assert_eq!(filter.name().parse::<Filter>(), Ok(filter));
            assert_eq!(ColorMatrix::for_name(filter.name()), Ok(filter.matrix()));
        }
        assert_eq!(
            ColorMatrix::for_name("sepia"),
            Err(UnknownFilter("sepia".into()))
        );
        assert!("Protanopia".parse::<Filter>().is_err());
    }
}
