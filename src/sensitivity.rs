use crate::error::MeasureError;
use serde::{Deserialize, Serialize};

/// One discrete setting on a lock-in's sensitivity scale.
///
/// `index` is the rung id the instrument reports for its `SEN` setting,
/// `full_scale` the maximum input magnitude (volts) that rung can represent
/// without saturating.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensitivityRung {
    pub index: u8,
    pub full_scale: f64,
}

/// Full-scale voltages for rungs 1..=27 of the 7270-style sensitivity scale,
/// 2 nV up to 1 V. Strictly increasing with rung index.
const FULL_SCALES: [f64; 27] = [
    2.0e-9, 5.0e-9, 10.0e-9, 20.0e-9, 50.0e-9, 100.0e-9, 200.0e-9, 500.0e-9,
    1.0e-6, 2.0e-6, 5.0e-6, 10.0e-6, 20.0e-6, 50.0e-6, 100.0e-6, 200.0e-6,
    500.0e-6, 1.0e-3, 2.0e-3, 5.0e-3, 10.0e-3, 20.0e-3, 50.0e-3, 100.0e-3,
    200.0e-3, 500.0e-3, 1.0,
];

pub const MIN_RUNG: u8 = 1;
pub const MAX_RUNG: u8 = 27;

/// Full-scale voltage for a rung index, `InvalidRung` outside 1..=27.
pub fn full_scale_of(index: u8) -> Result<f64, MeasureError> {
    if (MIN_RUNG..=MAX_RUNG).contains(&index) {
        Ok(FULL_SCALES[(index - 1) as usize])
    } else {
        Err(MeasureError::InvalidRung(index))
    }
}

/// Look up a whole rung by index.
pub fn rung(index: u8) -> Result<SensitivityRung, MeasureError> {
    full_scale_of(index).map(|full_scale| SensitivityRung { index, full_scale })
}

/// All rungs in ascending full-scale order.
pub fn rungs() -> impl Iterator<Item = SensitivityRung> {
    FULL_SCALES
        .iter()
        .enumerate()
        .map(|(i, &full_scale)| SensitivityRung {
            index: (i + 1) as u8,
            full_scale,
        })
}

pub fn smallest_rung() -> SensitivityRung {
    SensitivityRung {
        index: MIN_RUNG,
        full_scale: FULL_SCALES[0],
    }
}

pub fn largest_rung() -> SensitivityRung {
    SensitivityRung {
        index: MAX_RUNG,
        full_scale: FULL_SCALES[26],
    }
}
