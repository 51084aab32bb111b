use std::{fmt, num::NonZeroU32, str::FromStr};

/// Pixel layout of a frame as it crosses the driver boundary.
///
/// # Example
/// ```rust
/// use argus_core::prelude::{PixelFormat, Resolution};
///
/// let res = Resolution::new(640, 480).unwrap();
/// assert_eq!(PixelFormat::Ycbcr420Sp.frame_len(res), Some(460_800));
/// assert_eq!(PixelFormat::Jpeg.frame_len(res), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar Y followed by interleaved CbCr, 4:2:0 subsampled.
    Ycbcr420Sp,
    /// Planar Y followed by interleaved CbCr, 4:2:2 subsampled.
    Ycbcr422Sp,
    /// Compressed output; frame length is not derivable from geometry.
    Jpeg,
}

impl PixelFormat {
    /// Unpadded byte length of one frame, `None` for compressed formats.
    pub const fn frame_len(self, res: Resolution) -> Option<usize> {
        let pixels = res.pixels();
        match self {
            PixelFormat::Ycbcr420Sp => Some(pixels * 3 / 2),
            PixelFormat::Ycbcr422Sp => Some(pixels * 2),
            PixelFormat::Jpeg => None,
        }
    }

    /// Canonical parameter-store spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Ycbcr420Sp => "yuv420sp",
            PixelFormat::Ycbcr422Sp => "yuv422sp",
            PixelFormat::Jpeg => "jpeg",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yuv420sp" => Ok(PixelFormat::Ycbcr420Sp),
            "yuv422sp" => Ok(PixelFormat::Ycbcr422Sp),
            "jpeg" => Ok(PixelFormat::Jpeg),
            other => Err(format!("unknown pixel format {other:?}")),
        }
    }
}

/// Resolution of a frame.
///
/// # Example
/// ```rust
/// use argus_core::prelude::Resolution;
///
/// let res = Resolution::new(640, 480).unwrap();
/// assert_eq!(res.width.get(), 640);
/// assert_eq!(res.to_string(), "640x480");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    /// Width in pixels (non-zero).
    pub width: NonZeroU32,
    /// Height in pixels (non-zero).
    pub height: NonZeroU32,
}

impl Resolution {
    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    /// Total pixel count.
    pub const fn pixels(self) -> usize {
        self.width.get() as usize * self.height.get() as usize
    }

    /// Width and height swapped.
    pub const fn transposed(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once('x')
            .ok_or_else(|| format!("expected WxH, got {s:?}"))?;
        let width: u32 = w.parse().map_err(|_| format!("bad width {w:?}"))?;
        let height: u32 = h.parse().map_err(|_| format!("bad height {h:?}"))?;
        Resolution::new(width, height).ok_or_else(|| "zero dimension".to_string())
    }
}

/// Preview frame-rate range in milli-fps, matching the parameter-store
/// encoding (`"5000,30000"` means 5 to 30 fps).
///
/// # Example
/// ```rust
/// use argus_core::prelude::FpsRange;
///
/// let range = FpsRange { min: 5_000, max: 30_000 };
/// assert!(range.is_ordered());
/// assert!(range.contains(15_000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FpsRange {
    pub min: i32,
    pub max: i32,
}

impl FpsRange {
    /// Both endpoints non-negative and min does not exceed max.
    pub const fn is_ordered(self) -> bool {
        self.min >= 0 && self.max >= 0 && self.min <= self.max
    }

    pub const fn contains(self, millifps: i32) -> bool {
        millifps >= self.min && millifps <= self.max
    }
}

impl fmt::Display for FpsRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.min, self.max)
    }
}

/// Quarter-turn rotation applied to encoded output or sink copies.
///
/// `from_degrees` folds the loose integer encoding used by clients into the
/// four representable turns: `-1` and non-multiples of 90 mean "none",
/// anything else is normalized into `[0, 270]`.
///
/// # Example
/// ```rust
/// use argus_core::prelude::Rotation;
///
/// assert_eq!(Rotation::from_degrees(-90), Rotation::Deg270);
/// assert_eq!(Rotation::from_degrees(450), Rotation::Deg90);
/// assert_eq!(Rotation::from_degrees(-1), Rotation::Deg0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(value: i32) -> Self {
        // -1 means "not specified"; any non-multiple of 90 is invalid and
        // also treated as no rotation.
        if value == -1 || value % 90 != 0 {
            return Rotation::Deg0;
        }
        let mut deg = value % 360;
        if deg < 0 {
            deg += 360;
        }
        match deg {
            90 => Rotation::Deg90,
            180 => Rotation::Deg180,
            270 => Rotation::Deg270,
            _ => Rotation::Deg0,
        }
    }

    pub const fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Whether applying this rotation swaps width and height.
    pub const fn is_transposed(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}deg", self.degrees())
    }
}

/// Which way a device points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Facing {
    Back,
    Front,
}

impl Facing {
    /// Front devices deliver mirrored coordinates.
    pub const fn is_mirrored(self) -> bool {
        matches!(self, Facing::Front)
    }
}

/// Sensor mounting aspect reported through the parameter store.
///
/// Portrait sensors need a rotation copy on the preview path, which in turn
/// costs one extra preview buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
}

#[cfg(feature = "serde")]
impl serde::Serialize for PixelFormat {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Prefer string encoding so decoding does not rely on `deserialize_any`.
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for PixelFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct PixelFormatVisitor;

        impl<'de> serde::de::Visitor<'de> for PixelFormatVisitor {
            type Value = PixelFormat;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a pixel format string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                PixelFormat::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(PixelFormatVisitor)
    }
}
