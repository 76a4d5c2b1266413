//! Run-wide resolution bound: a device preset id or a `WIDTHxHEIGHT` literal.

use std::fmt;

use thiserror::Error;

use crate::config::DevicePreset;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("invalid device or custom resolution: {0:?}")]
    Unrecognized(String),
    #[error("resolution {0}x{1} has a zero dimension")]
    Zero(u32, u32),
    #[error("resolution {0}x{1} needs a buffer larger than the 32-bit guest address space")]
    TooLarge(u32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Result<Self, ResolutionError> {
        if width == 0 || height == 0 {
            return Err(ResolutionError::Zero(width, height));
        }
        let res = Self { width, height };
        if res.image_len().is_none() {
            return Err(ResolutionError::TooLarge(width, height));
        }
        Ok(res)
    }

    /// Size of one unfiltered scanline-prefixed RGB image: `((w * 3) + 1) * h`.
    pub fn image_len(&self) -> Option<u32> {
        self.width
            .checked_mul(3)
            .and_then(|row| row.checked_add(1))
            .and_then(|row| row.checked_mul(self.height))
    }

    /// True when declared dimensions fit inside this bound.
    pub fn admits(&self, width: u32, height: u32) -> bool {
        width <= self.width && height <= self.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Resolve a `--device` value against the preset table, falling back to `WxH`.
pub fn resolve(value: &str, presets: &[DevicePreset]) -> Result<Resolution, ResolutionError> {
    let trimmed = value.trim();
    let lowered = trimmed.to_ascii_lowercase();
    if let Some(preset) = presets
        .iter()
        .find(|preset| preset.ids.iter().any(|id| id.eq_ignore_ascii_case(&lowered)))
    {
        return Resolution::new(preset.width, preset.height);
    }

    let unrecognized = || ResolutionError::Unrecognized(value.to_string());
    let (width, height) = trimmed.split_once('x').ok_or_else(unrecognized)?;
    let dimension = |digits: &str| -> Result<u32, ResolutionError> {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(unrecognized());
        }
        digits.parse().map_err(|_| unrecognized())
    };
    let (width, height) = (dimension(width)?, dimension(height)?);
    Resolution::new(width, height)
}
