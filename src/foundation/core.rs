use std::{fmt, str::FromStr};

use crate::foundation::error::{FramesmithError, FramesmithResult};

/// Absolute 0-based frame index within an animation.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct FrameIndex(pub u64);

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output raster size in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> FramesmithResult<Self> {
        let size = Self { width, height };
        size.validate()?;
        Ok(size)
    }

    pub fn validate(self) -> FramesmithResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(FramesmithError::validation(
                "frameSize width/height must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Generation counter of the compiled animation module.
///
/// Every build outcome emitted by the watch loop carries the next version, so versions observed
/// by the supervisor are strictly increasing. All derived render state is stamped with the
/// version it was created under.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct BuildVersion(pub u64);

impl BuildVersion {
    pub const INITIAL: Self = Self(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifies one renderable unit in development mode.
///
/// The wire form is `"animation"` or `"frame/<index>"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetKey {
    Animation,
    Frame(FrameIndex),
}

impl AssetKey {
    /// File name of the artifact a render subprocess produces for this key under `version`.
    pub fn asset_file_name(self, version: BuildVersion) -> String {
        match self {
            Self::Animation => format!("{version}-animation.mp4"),
            Self::Frame(index) => format!("{version}-frame-{index}.png"),
        }
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Animation => f.write_str("animation"),
            Self::Frame(index) => write!(f, "frame/{index}"),
        }
    }
}

impl FromStr for AssetKey {
    type Err = FramesmithError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "animation" {
            return Ok(Self::Animation);
        }
        let Some(raw_index) = s.strip_prefix("frame/") else {
            return Err(FramesmithError::validation(format!(
                "invalid asset key '{s}' (expected 'animation' or 'frame/<index>')"
            )));
        };
        if raw_index.is_empty() || !raw_index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FramesmithError::validation(format!(
                "invalid frame index in asset key '{s}'"
            )));
        }
        let index = raw_index.parse::<u64>().map_err(|_| {
            FramesmithError::validation(format!("frame index out of range in asset key '{s}'"))
        })?;
        Ok(Self::Frame(FrameIndex(index)))
    }
}
