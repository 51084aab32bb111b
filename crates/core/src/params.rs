use std::{
    collections::BTreeMap,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use smallvec::SmallVec;
use thiserror::Error;

use crate::format::{Facing, FpsRange, Orientation, PixelFormat, Resolution, Rotation};

/// Well-known parameter-store keys.
pub mod keys {
    pub const PREVIEW_SIZE: &str = "preview-size";
    pub const PREVIEW_FRAME_RATE: &str = "preview-frame-rate";
    pub const PREVIEW_FPS_RANGE: &str = "preview-fps-range";
    pub const PREVIEW_FORMAT: &str = "preview-format";
    pub const PICTURE_SIZE: &str = "picture-size";
    pub const PICTURE_FORMAT: &str = "picture-format";
    pub const JPEG_QUALITY: &str = "jpeg-quality";
    pub const JPEG_THUMBNAIL_WIDTH: &str = "jpeg-thumbnail-width";
    pub const JPEG_THUMBNAIL_HEIGHT: &str = "jpeg-thumbnail-height";
    pub const JPEG_THUMBNAIL_QUALITY: &str = "jpeg-thumbnail-quality";
    pub const ROTATION: &str = "rotation";
    pub const SENSOR_ROTATION: &str = "sensorrotation";
    pub const SENSOR_ORIENTATION: &str = "sensororientation";
    pub const FOCUS_MODE: &str = "focus-mode";
    pub const FOCUS_AREAS: &str = "focus-areas";
    pub const FLASH_MODE: &str = "flash-mode";
    pub const WHITE_BALANCE: &str = "whitebalance";
    pub const EFFECT: &str = "effect";
    pub const SCENE_MODE: &str = "scene-mode";
    pub const ZOOM: &str = "zoom";
    pub const MAX_ZOOM: &str = "max-zoom";
    pub const BRIGHTNESS: &str = "brightness";
    pub const CONTRAST: &str = "contrast";
    pub const EXPOSURE_COMPENSATION: &str = "exposure-compensation";
    pub const ANTIBANDING: &str = "antibanding";
    pub const ISO: &str = "iso";
    pub const NIGHTSHOT_MODE: &str = "nightshot-mode";
    pub const LUMA_ADAPTATION: &str = "luma-adaptation";
    pub const FOCAL_LENGTH: &str = "focal-length";
    pub const GPS_LATITUDE: &str = "gps-latitude";
    pub const GPS_LONGITUDE: &str = "gps-longitude";
    pub const GPS_ALTITUDE: &str = "gps-altitude";
    pub const GPS_TIMESTAMP: &str = "gps-timestamp";
    pub const GPS_PROCESSING_METHOD: &str = "gps-processing-method";
    pub const RECORDING_HINT: &str = "recording-hint";

    pub const PREVIEW_SIZE_VALUES: &str = "preview-size-values";
    pub const PICTURE_SIZE_VALUES: &str = "picture-size-values";
    pub const PREVIEW_FPS_RANGE_VALUES: &str = "preview-fps-range-values";
    pub const FOCUS_MODE_VALUES: &str = "focus-mode-values";
    pub const FLASH_MODE_VALUES: &str = "flash-mode-values";
    pub const WHITE_BALANCE_VALUES: &str = "whitebalance-values";
    pub const EFFECT_VALUES: &str = "effect-values";
    pub const SCENE_MODE_VALUES: &str = "scene-mode-values";
    pub const ANTIBANDING_VALUES: &str = "antibanding-values";
}

/// Opaque driver-side value for a pushed control. The numbering matters
/// only to the driver; the tables below map store spellings onto it.
pub type ControlCode = i32;

const PREVIEW_MODE_SNAPSHOT: ControlCode = 0;

pub const WHITE_BALANCE_TABLE: &[(&str, ControlCode)] = &[
    ("auto", 0),
    ("incandescent", 1),
    ("fluorescent", 2),
    ("daylight", 3),
    ("cloudy-daylight", 4),
];

pub const EFFECT_TABLE: &[(&str, ControlCode)] =
    &[("none", 0), ("mono", 1), ("negative", 2), ("sepia", 3)];

pub const SCENE_MODE_TABLE: &[(&str, ControlCode)] =
    &[("auto", 0), ("night", 1), ("portrait", 2), ("landscape", 3)];

pub const ANTIBANDING_TABLE: &[(&str, ControlCode)] =
    &[("off", 0), ("50hz", 1), ("60hz", 2), ("auto", 3)];

pub const ISO_TABLE: &[(&str, ControlCode)] = &[("auto", 0), ("high", 1)];

/// Strict table: an unknown flash mode fails the whole snapshot.
pub const FLASH_MODE_TABLE: &[(&str, ControlCode)] =
    &[("off", 0), ("on", 1), ("torch", 2), ("auto", 3)];

/// Strict table: an unknown focus mode fails the whole snapshot.
pub const FOCUS_MODE_TABLE: &[(&str, ControlCode)] =
    &[("auto", 0), ("infinity", 1), ("macro", 2)];

const ANTIBANDING_50HZ: ControlCode = 1;

fn lookup_code(table: &[(&str, ControlCode)], value: Option<&str>) -> Option<ControlCode> {
    let value = value?;
    table
        .iter()
        .find_map(|(name, code)| (*name == value).then_some(*code))
}

fn lookup_or(table: &[(&str, ControlCode)], value: Option<&str>, default: ControlCode) -> ControlCode {
    lookup_code(table, value).unwrap_or(default)
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("missing required parameter {key}")]
    Missing { key: &'static str },
    #[error("malformed value {value:?} for {key}")]
    Malformed { key: &'static str, value: String },
    #[error("fps range {min},{max} is not ordered")]
    FpsRange { min: i32, max: i32 },
    #[error("{key} must be positive, got {width}x{height}")]
    NonPositiveSize {
        key: &'static str,
        width: i32,
        height: i32,
    },
    #[error("unsupported {key} value {value:?}")]
    UnsupportedMode { key: &'static str, value: String },
    #[error("zoom {requested} exceeds max-zoom {max}")]
    ZoomRange { requested: u32, max: u32 },
    #[error("focus areas {reason}: {value:?}")]
    FocusAreas {
        reason: &'static str,
        value: String,
    },
}

/// One autofocus window after conversion into sensor coordinates: origin
/// plus width and height, each span rounded up to a multiple of four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FocusZone {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Capture location attached to the encoded output.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GpsPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub timestamp: i64,
    pub process_method: Option<String>,
}

/// Key for one entry of the control push list the driver receives after a
/// successful snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ControlKey {
    PreviewMode,
    EncodeRotation,
    SensorRotation,
    AfMode,
    WhiteBalance,
    JpegQuality,
    Effect,
    SceneMode,
    Zoom,
    Brightness,
    Contrast,
    ExposureCompensation,
    Antibanding,
    Iso,
    FlashMode,
    NightshotMode,
    Orientation,
    LumaAdaptation,
    FocalLength,
}

// Sensor zone plane the hardware expects focus windows in.
const ZONE_PLANE_W: i32 = 480;
const ZONE_PLANE_H: i32 = 640;

const FOCUS_ZONE_MAX: usize = 5;

#[derive(Debug, Clone, Copy)]
struct ClientRect {
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    weight: i32,
}

fn parse_focus_areas(raw: &str) -> Result<SmallVec<[ClientRect; FOCUS_ZONE_MAX]>, ParamError> {
    let mut rects = SmallVec::new();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(rects);
    }
    let malformed = |reason| ParamError::FocusAreas {
        reason,
        value: raw.to_string(),
    };
    let mut rest = trimmed;
    while !rest.is_empty() {
        rest = rest.trim_start_matches(',').trim_start();
        let Some(open) = rest.find('(') else {
            return Err(malformed("expected opening parenthesis"));
        };
        let Some(close) = rest[open..].find(')') else {
            return Err(malformed("unterminated group"));
        };
        let inner = &rest[open + 1..open + close];
        let mut fields = inner.split(',').map(|f| f.trim().parse::<i32>());
        let mut next = || {
            fields
                .next()
                .and_then(Result::ok)
                .ok_or(malformed("expected five integers"))
        };
        let rect = ClientRect {
            left: next()?,
            top: next()?,
            right: next()?,
            bottom: next()?,
            weight: next()?,
        };
        if fields.next().is_some() {
            return Err(malformed("expected five integers"));
        }
        // Zero weight marks a placeholder zone, not a request.
        if rect.weight != 0 {
            if rects.len() == FOCUS_ZONE_MAX {
                return Err(malformed("more than five zones"));
            }
            rects.push(rect);
        }
        rest = rest[open + close + 1..].trim_start();
    }
    Ok(rects)
}

/// Map one client-space point (`[-1000, 1000]` on both axes) onto the
/// sensor zone plane for the given mount angle.
fn map_zone_point(x: i32, y: i32, mount: Rotation, mirrored: bool) -> (i32, i32) {
    let x = if mirrored { -x } else { x };
    match mount {
        Rotation::Deg0 => ((1000 + x) * ZONE_PLANE_W / 2000, (1000 + y) * ZONE_PLANE_H / 2000),
        Rotation::Deg90 => ((1000 - y) * ZONE_PLANE_W / 2000, (1000 + x) * ZONE_PLANE_H / 2000),
        Rotation::Deg180 => ((1000 - x) * ZONE_PLANE_W / 2000, (1000 - y) * ZONE_PLANE_H / 2000),
        Rotation::Deg270 => ((1000 + y) * ZONE_PLANE_W / 2000, (1000 - x) * ZONE_PLANE_H / 2000),
    }
}

fn convert_zones(
    rects: &[ClientRect],
    mount: Rotation,
    mirrored: bool,
) -> SmallVec<[FocusZone; FOCUS_ZONE_MAX]> {
    rects
        .iter()
        .map(|rect| {
            let (x1, y1) = map_zone_point(rect.left, rect.top, mount, mirrored);
            let (x2, y2) = map_zone_point(rect.right, rect.bottom, mount, mirrored);
            let (left, right) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
            let (top, bottom) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
            FocusZone {
                x: left,
                y: top,
                width: ((right - left + 3) >> 2) << 2,
                height: ((bottom - top + 3) >> 2) << 2,
            }
        })
        .collect()
}

/// String-keyed parameter store, the client-facing configuration surface.
///
/// Values stay strings until [`ParamStore::to_session_config`] validates
/// the whole store into a typed [`SessionConfig`] in one shot.
///
/// # Example
/// ```rust
/// use argus_core::prelude::*;
///
/// let mut store = ParamStore::defaults(Facing::Back);
/// store.set(keys::PREVIEW_SIZE, "352x288");
/// let config = store.to_session_config(Rotation::Deg90, false).unwrap();
/// assert_eq!(config.preview_size, Resolution::new(352, 288).unwrap());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamStore {
    map: BTreeMap<String, String>,
}

impl ParamStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The published default block for one device facing, capability lists
    /// included.
    pub fn defaults(facing: Facing) -> Self {
        let mut p = Self::empty();
        p.set(keys::PREVIEW_SIZE, "640x480");
        p.set(keys::PREVIEW_FRAME_RATE, "15");
        p.set(keys::PREVIEW_FPS_RANGE, "5000,30000");
        p.set(keys::PREVIEW_FPS_RANGE_VALUES, "(5000,30000)");
        p.set(keys::PREVIEW_FORMAT, "yuv420sp");
        p.set(keys::PICTURE_FORMAT, "jpeg");
        p.set(keys::JPEG_QUALITY, "100");
        p.set(keys::JPEG_THUMBNAIL_WIDTH, "320");
        p.set(keys::JPEG_THUMBNAIL_HEIGHT, "240");
        p.set(keys::JPEG_THUMBNAIL_QUALITY, "80");
        p.set(keys::FLASH_MODE, "off");
        p.set(keys::WHITE_BALANCE, "auto");
        p.set(keys::EFFECT, "none");
        p.set(keys::SCENE_MODE, "auto");
        p.set(keys::ANTIBANDING, "50hz");
        p.set(keys::ISO, "auto");
        p.set(keys::ZOOM, "0");
        p.set(keys::MAX_ZOOM, "8");
        p.set(keys::FOCAL_LENGTH, "3.75");
        p.set(
            keys::WHITE_BALANCE_VALUES,
            "auto,incandescent,fluorescent,daylight,cloudy-daylight",
        );
        p.set(keys::EFFECT_VALUES, "none,mono,negative,sepia");
        p.set(keys::SCENE_MODE_VALUES, "auto,night,portrait,landscape");
        p.set(keys::ANTIBANDING_VALUES, "off,50hz,60hz,auto");
        match facing {
            Facing::Back => {
                p.set(keys::PICTURE_SIZE, "2592x1944");
                p.set(
                    keys::PICTURE_SIZE_VALUES,
                    "2592x1944,2048x1536,1600x1200,1280x960,640x480",
                );
                p.set(
                    keys::PREVIEW_SIZE_VALUES,
                    "640x480,480x320,432x320,352x288,320x240,240x160,176x144",
                );
                p.set(keys::FOCUS_MODE, "auto");
                p.set(keys::FOCUS_MODE_VALUES, "auto,infinity,macro");
                p.set(keys::FLASH_MODE_VALUES, "off,on,torch,auto");
            }
            Facing::Front => {
                p.set(keys::PICTURE_SIZE, "640x480");
                p.set(keys::PICTURE_SIZE_VALUES, "640x480,320x240");
                p.set(keys::PREVIEW_SIZE_VALUES, "640x480,320x240,176x144");
                p.set(keys::FOCUS_MODE, "infinity");
                p.set(keys::FOCUS_MODE_VALUES, "infinity");
                p.set(keys::FLASH_MODE_VALUES, "off");
                p.set(keys::SENSOR_ORIENTATION, "1");
            }
        }
        p
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.map.insert(key.to_string(), value.into());
    }

    pub fn set_int(&mut self, key: &str, value: i32) {
        self.set(key, value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        self.get(key)?.trim().parse().ok()
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get(key)?.trim().parse().ok()
    }

    /// `"WxH"` pair, signed so validation can see negative requests.
    pub fn get_size(&self, key: &str) -> Option<(i32, i32)> {
        let (w, h) = self.get(key)?.split_once('x')?;
        Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `key=value` pairs joined with `;`, sorted by key.
    pub fn flatten(&self) -> String {
        let mut out = String::new();
        for (k, v) in self.iter() {
            if !out.is_empty() {
                out.push(';');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    fn fps_range(&self) -> Result<FpsRange, ParamError> {
        let raw = self.get(keys::PREVIEW_FPS_RANGE).ok_or(ParamError::Missing {
            key: keys::PREVIEW_FPS_RANGE,
        })?;
        let malformed = || ParamError::Malformed {
            key: keys::PREVIEW_FPS_RANGE,
            value: raw.to_string(),
        };
        // The range is split at the last comma.
        let (min, max) = raw.rsplit_once(',').ok_or_else(malformed)?;
        let range = FpsRange {
            min: min.trim().parse().map_err(|_| malformed())?,
            max: max.trim().parse().map_err(|_| malformed())?,
        };
        if !range.is_ordered() {
            return Err(ParamError::FpsRange {
                min: range.min,
                max: range.max,
            });
        }
        Ok(range)
    }

    /// Validate the whole store into a typed snapshot.
    ///
    /// All-or-nothing: any failure leaves the caller's active config
    /// untouched. Two classes of failure additionally write a safe default
    /// back into the store, matching what clients expect to read back: a
    /// negative preview size and an unknown flash or focus mode.
    ///
    /// `mount` and `mirrored` come from the device this store configures;
    /// they orient the focus-zone conversion.
    pub fn to_session_config(
        &mut self,
        mount: Rotation,
        mirrored: bool,
    ) -> Result<SessionConfig, ParamError> {
        // The fps range is checked before anything else.
        let fps = self.fps_range()?;

        let (pw, ph) = self.get_size(keys::PREVIEW_SIZE).ok_or(ParamError::Missing {
            key: keys::PREVIEW_SIZE,
        })?;
        if pw <= 0 || ph <= 0 {
            self.set(keys::PREVIEW_SIZE, "640x480");
            return Err(ParamError::NonPositiveSize {
                key: keys::PREVIEW_SIZE,
                width: pw,
                height: ph,
            });
        }
        let preview_size = Resolution::new(pw as u32 & !1, ph as u32 & !1)
            .ok_or(ParamError::NonPositiveSize {
                key: keys::PREVIEW_SIZE,
                width: pw,
                height: ph,
            })?;

        let (cw, ch) = self.get_size(keys::PICTURE_SIZE).ok_or(ParamError::Missing {
            key: keys::PICTURE_SIZE,
        })?;
        if cw <= 0 || ch <= 0 {
            return Err(ParamError::NonPositiveSize {
                key: keys::PICTURE_SIZE,
                width: cw,
                height: ch,
            });
        }
        let picture_size = Resolution::new(cw as u32 & !1, ch as u32 & !1)
            .ok_or(ParamError::NonPositiveSize {
                key: keys::PICTURE_SIZE,
                width: cw,
                height: ch,
            })?;

        let preview_format: PixelFormat = match self.get(keys::PREVIEW_FORMAT) {
            None => PixelFormat::Ycbcr420Sp,
            Some(raw) => raw.parse().map_err(|_| ParamError::UnsupportedMode {
                key: keys::PREVIEW_FORMAT,
                value: raw.to_string(),
            })?,
        };
        if preview_format == PixelFormat::Jpeg {
            return Err(ParamError::UnsupportedMode {
                key: keys::PREVIEW_FORMAT,
                value: preview_format.to_string(),
            });
        }
        if let Some(raw) = self.get(keys::PICTURE_FORMAT)
            && raw != PixelFormat::Jpeg.as_str()
        {
            return Err(ParamError::UnsupportedMode {
                key: keys::PICTURE_FORMAT,
                value: raw.to_string(),
            });
        }

        let encode_rotation = Rotation::from_degrees(self.get_int(keys::ROTATION).unwrap_or(-1));
        let sensor_rotation =
            Rotation::from_degrees(self.get_int(keys::SENSOR_ROTATION).unwrap_or(-1));
        let orientation = if self.get_int(keys::SENSOR_ORIENTATION) == Some(1) {
            Orientation::Portrait
        } else {
            Orientation::Landscape
        };

        let focus_zones = match self.get(keys::FOCUS_AREAS) {
            Some(raw) => {
                let rects = parse_focus_areas(raw)?;
                convert_zones(&rects, mount, mirrored)
            }
            None => SmallVec::new(),
        };

        let focus_mode = match lookup_code(FOCUS_MODE_TABLE, self.get(keys::FOCUS_MODE)) {
            Some(code) => code,
            None => {
                let value = self.get(keys::FOCUS_MODE).unwrap_or("").to_string();
                self.set(keys::FOCUS_MODE, "auto");
                return Err(ParamError::UnsupportedMode {
                    key: keys::FOCUS_MODE,
                    value,
                });
            }
        };
        let flash_mode = match lookup_code(FLASH_MODE_TABLE, self.get(keys::FLASH_MODE)) {
            Some(code) => code,
            None => {
                let value = self.get(keys::FLASH_MODE).unwrap_or("").to_string();
                self.set(keys::FLASH_MODE, "off");
                return Err(ParamError::UnsupportedMode {
                    key: keys::FLASH_MODE,
                    value,
                });
            }
        };

        let zoom = self.get_int(keys::ZOOM).unwrap_or(0).max(0) as u32;
        let max_zoom = self.get_int(keys::MAX_ZOOM).unwrap_or(8).max(0) as u32;
        if zoom > max_zoom {
            return Err(ParamError::ZoomRange {
                requested: zoom,
                max: max_zoom,
            });
        }

        let jpeg_quality = match self.get_int(keys::JPEG_QUALITY) {
            Some(q) if (1..=100).contains(&q) => q as u8,
            _ => 100,
        };
        let thumbnail_quality = match self.get_int(keys::JPEG_THUMBNAIL_QUALITY) {
            Some(q) if (1..=100).contains(&q) => q as u8,
            _ => 80,
        };
        let tw = self.get_int(keys::JPEG_THUMBNAIL_WIDTH).unwrap_or(0);
        let th = self.get_int(keys::JPEG_THUMBNAIL_HEIGHT).unwrap_or(0);
        let thumbnail_size = if tw > 0 && th > 0 {
            Resolution::new(tw as u32, th as u32)
        } else {
            None
        };

        Ok(SessionConfig {
            preview_size,
            picture_size,
            preview_format,
            picture_format: PixelFormat::Jpeg,
            fps,
            encode_rotation,
            sensor_rotation,
            orientation,
            jpeg_quality,
            thumbnail_size,
            thumbnail_quality,
            zoom_level: zoom,
            focus_zones,
            gps: self.gps_position(),
            white_balance: lookup_or(WHITE_BALANCE_TABLE, self.get(keys::WHITE_BALANCE), 0),
            effect: lookup_or(EFFECT_TABLE, self.get(keys::EFFECT), 0),
            scene_mode: lookup_or(SCENE_MODE_TABLE, self.get(keys::SCENE_MODE), 0),
            brightness: self.get_int(keys::BRIGHTNESS).unwrap_or(3),
            contrast: self.get_int(keys::CONTRAST).unwrap_or(3),
            exposure_compensation: self.get_int(keys::EXPOSURE_COMPENSATION).unwrap_or(0),
            antibanding: lookup_or(ANTIBANDING_TABLE, self.get(keys::ANTIBANDING), ANTIBANDING_50HZ),
            iso: lookup_or(ISO_TABLE, self.get(keys::ISO), 0),
            flash_mode,
            focus_mode,
            nightshot: self.get_int(keys::NIGHTSHOT_MODE).unwrap_or(0).max(0),
            luma_adaptation: self.get_int(keys::LUMA_ADAPTATION).unwrap_or(0).max(0),
            focal_length_um: (self.get_float(keys::FOCAL_LENGTH).unwrap_or(0.0) * 1000.0) as i32,
        })
    }

    /// A position is attached only when every numeric field is present and
    /// parses. The processing method rides along when set.
    fn gps_position(&self) -> Option<GpsPosition> {
        let latitude = self.get_float(keys::GPS_LATITUDE)?;
        let longitude = self.get_float(keys::GPS_LONGITUDE)?;
        let altitude = self.get_float(keys::GPS_ALTITUDE)?;
        let mut timestamp = self.get(keys::GPS_TIMESTAMP)?.trim().parse::<i64>().ok()?;
        if timestamp == 0 {
            timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
        }
        Some(GpsPosition {
            latitude,
            longitude,
            altitude,
            timestamp,
            process_method: self.get(keys::GPS_PROCESSING_METHOD).map(str::to_string),
        })
    }
}

impl fmt::Display for ParamStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flatten())
    }
}

/// The typed, validated snapshot a session runs with.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    pub preview_size: Resolution,
    pub picture_size: Resolution,
    pub preview_format: PixelFormat,
    pub picture_format: PixelFormat,
    pub fps: FpsRange,
    pub encode_rotation: Rotation,
    pub sensor_rotation: Rotation,
    pub orientation: Orientation,
    pub jpeg_quality: u8,
    pub thumbnail_size: Option<Resolution>,
    pub thumbnail_quality: u8,
    pub zoom_level: u32,
    pub focus_zones: SmallVec<[FocusZone; FOCUS_ZONE_MAX]>,
    pub gps: Option<GpsPosition>,
    pub white_balance: ControlCode,
    pub effect: ControlCode,
    pub scene_mode: ControlCode,
    pub brightness: ControlCode,
    pub contrast: ControlCode,
    pub exposure_compensation: ControlCode,
    pub antibanding: ControlCode,
    pub iso: ControlCode,
    pub flash_mode: ControlCode,
    pub focus_mode: ControlCode,
    pub nightshot: ControlCode,
    pub luma_adaptation: ControlCode,
    pub focal_length_um: ControlCode,
}

impl SessionConfig {
    /// Rotation applied when copying preview frames out to a sink.
    pub fn copy_rotation(&self) -> Rotation {
        if self.sensor_rotation != Rotation::Deg0 {
            self.sensor_rotation
        } else if self.orientation == Orientation::Portrait {
            Rotation::Deg90
        } else {
            Rotation::Deg0
        }
    }

    /// Rotating sessions keep one extra preview buffer in flight.
    pub fn needs_rotation_copy(&self) -> bool {
        self.copy_rotation() != Rotation::Deg0
    }

    pub fn preview_buffer_count(&self, base: usize) -> usize {
        base + usize::from(self.needs_rotation_copy())
    }

    /// The ordered control push list for the driver.
    pub fn control_pushes(&self) -> Vec<(ControlKey, ControlCode)> {
        vec![
            (ControlKey::PreviewMode, PREVIEW_MODE_SNAPSHOT),
            (
                ControlKey::EncodeRotation,
                self.encode_rotation.degrees() as i32,
            ),
            (
                ControlKey::SensorRotation,
                self.sensor_rotation.degrees() as i32,
            ),
            (ControlKey::AfMode, self.focus_mode),
            (ControlKey::WhiteBalance, self.white_balance),
            (ControlKey::JpegQuality, self.jpeg_quality as i32),
            (ControlKey::Effect, self.effect),
            (ControlKey::SceneMode, self.scene_mode),
            (ControlKey::Zoom, self.zoom_level as i32),
            (ControlKey::Brightness, self.brightness),
            (ControlKey::Contrast, self.contrast),
            (
                ControlKey::ExposureCompensation,
                self.exposure_compensation,
            ),
            (ControlKey::Antibanding, self.antibanding),
            (ControlKey::Iso, self.iso),
            (ControlKey::FlashMode, self.flash_mode),
            (ControlKey::NightshotMode, self.nightshot),
            (
                ControlKey::Orientation,
                i32::from(self.orientation == Orientation::Portrait),
            ),
            (ControlKey::LumaAdaptation, self.luma_adaptation),
            (ControlKey::FocalLength, self.focal_length_um),
        ]
    }
}
