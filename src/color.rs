//! Color profile of an image.
//!
//! A PNG can describe its color space four ways: an embedded ICC profile, an
//! sRGB marker, explicit chromaticities, or a bare gamma value. Decoding
//! collapses whatever is present into one [`ColorProfile`], picking the most
//! specific description; encoding writes the profile back as the matching
//! chunks.
//!
//! Gamma on [`ColorProfile`] is the display exponent (about 2.2 for typical
//! content). The file stores its reciprocal in fixed point (`45455` for
//! 0.45455); [`fixed_to_float`] and [`float_to_fixed`] convert.

use crate::marshal::ColorChunks;

/// CIE xy chromaticities of the white point and the three primaries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Chromaticities {
    pub white_x: f64,
    pub white_y: f64,
    pub red_x: f64,
    pub red_y: f64,
    pub green_x: f64,
    pub green_y: f64,
    pub blue_x: f64,
    pub blue_y: f64,
}

impl Chromaticities {
    /// BT.709 primaries with a D65 white point, as used by sRGB.
    pub const SRGB: Self = Self {
        white_x: 0.3127,
        white_y: 0.3290,
        red_x: 0.64,
        red_y: 0.33,
        green_x: 0.30,
        green_y: 0.60,
        blue_x: 0.15,
        blue_y: 0.06,
    };

    pub(crate) fn from_fixed(values: [i32; 8]) -> Self {
        let [white_x, white_y, red_x, red_y, green_x, green_y, blue_x, blue_y] = values.map(fixed_to_float);
        Self {
            white_x,
            white_y,
            red_x,
            red_y,
            green_x,
            green_y,
            blue_x,
            blue_y,
        }
    }

    pub(crate) fn to_fixed(self) -> [i32; 8] {
        [
            self.white_x,
            self.white_y,
            self.red_x,
            self.red_y,
            self.green_x,
            self.green_y,
            self.blue_x,
            self.blue_y,
        ]
        .map(float_to_fixed)
    }
}

/// How the pixel values of an image are to be interpreted.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub enum ColorProfile {
    /// Nothing was declared.
    #[default]
    None,
    /// sRGB, optionally with a pure power-law gamma instead of the sRGB curve.
    Srgb {
        gamma: Option<f64>,
    },
    /// Explicit primaries; `None` gamma means the standard sRGB curve.
    RgbPrimaries {
        primaries: Chromaticities,
        gamma: Option<f64>,
    },
    /// An embedded ICC profile.
    Icc {
        name: String,
        data: Vec<u8>,
    },
}

impl ColorProfile {
    /// Plain sRGB.
    pub const SRGB: Self = Self::Srgb { gamma: None };

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Pick one profile from the color chunks of a file.
    ///
    /// ICC wins over the sRGB marker, which wins over chromaticities, which
    /// win over a bare gamma. A gamma chunk also refines the sRGB and
    /// chromaticity cases.
    pub(crate) fn resolve(chunks: ColorChunks) -> Self {
        let gamma = chunks.gama.map(gamma_from_fixed);
        if let Some((name, data)) = chunks.icc {
            Self::Icc { name, data }
        } else if chunks.srgb {
            Self::Srgb { gamma }
        } else if let Some(values) = chunks.chrm {
            Self::RgbPrimaries {
                primaries: Chromaticities::from_fixed(values),
                gamma,
            }
        } else if gamma.is_some() {
            Self::Srgb { gamma }
        } else {
            Self::None
        }
    }
}

/// PNG fixed point (units of 1/100000) to float.
pub fn fixed_to_float(value: i32) -> f64 {
    f64::from(value) / 100_000.0
}

/// Float to PNG fixed point, rounded to the nearest unit.
pub fn float_to_fixed(value: f64) -> i32 {
    (value * 100_000.0).round() as i32
}

/// Display gamma from a stored gAMA value.
pub(crate) fn gamma_from_fixed(value: i32) -> f64 {
    1.0 / fixed_to_float(value)
}

/// Stored gAMA value for a display gamma.
pub(crate) fn gamma_to_fixed(gamma: f64) -> i32 {
    float_to_fixed(1.0 / gamma)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icc() -> Option<(String, Vec<u8>)> {
        Some(("ICC profile".to_owned(), vec![1, 2, 3]))
    }

    #[test]
    fn icc_wins_over_srgb() {
        let chunks = ColorChunks {
            icc: icc(),
            srgb: true,
            gama: Some(45455),
            ..ColorChunks::default()
        };
        assert!(matches!(ColorProfile::resolve(chunks), ColorProfile::Icc { name, .. } if name == "ICC profile"));
    }

    #[test]
    fn srgb_carries_declared_gamma() {
        let chunks = ColorChunks {
            srgb: true,
            gama: Some(50000),
            chrm: Some(Chromaticities::SRGB.to_fixed()),
            ..ColorChunks::default()
        };
        assert_eq!(ColorProfile::resolve(chunks), ColorProfile::Srgb { gamma: Some(2.0) });
    }

    #[test]
    fn chromaticities_alone_use_default_gamma() {
        let chunks = ColorChunks {
            chrm: Some(Chromaticities::SRGB.to_fixed()),
            ..ColorChunks::default()
        };
        assert_eq!(
            ColorProfile::resolve(chunks),
            ColorProfile::RgbPrimaries {
                primaries: Chromaticities::SRGB,
                gamma: None,
            }
        );
    }

    #[test]
    fn bare_gamma_is_srgb_with_gamma() {
        let chunks = ColorChunks {
            gama: Some(100_000),
            ..ColorChunks::default()
        };
        assert_eq!(ColorProfile::resolve(chunks), ColorProfile::Srgb { gamma: Some(1.0) });
        assert_eq!(ColorProfile::resolve(ColorChunks::default()), ColorProfile::None);
    }

    #[test]
    fn fixed_point_conversions() {
        assert_eq!(float_to_fixed(0.3127), 31270);
        assert_eq!(fixed_to_float(31270), 0.3127);
        assert_eq!(gamma_to_fixed(2.2), 45455);
        let gamma = gamma_from_fixed(45455);
        assert_eq!(gamma_to_fixed(gamma), 45455);
        assert_eq!(Chromaticities::from_fixed(Chromaticities::SRGB.to_fixed()), Chromaticities::SRGB);
    }
}
