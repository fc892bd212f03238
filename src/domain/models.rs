use serde::{Deserialize, Serialize};
use std::fmt;

/// Full-scale value that device pressure is normalized into.
pub const PRESSURE_OUTPUT_RANGE: u32 = 0x10000;

/// Protocol family negotiated with a tablet.
///
/// Resolved once during registration (or read back from the registry) and
/// passed explicitly to every operation that behaves differently per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolVariant {
    Spark,
    Slate,
    IntuosPro,
}

impl ProtocolVariant {
    /// Sensor width and height in device units
    pub fn sensor_size(&self) -> (u32, u32) {
        match self {
            Self::Spark | Self::Slate => (21600, 14800),
            Self::IntuosPro => (44800, 29600),
        }
    }

    /// Edge length of one device unit in micrometers
    pub fn point_size(&self) -> f64 {
        match self {
            Self::Spark | Self::Slate => 10.0,
            Self::IntuosPro => 5.0,
        }
    }

    /// Largest raw pressure value the pen reports
    pub fn pressure_max(&self) -> u32 {
        match self {
            Self::Spark => 1023,
            Self::Slate => 2047,
            Self::IntuosPro => 8191,
        }
    }

    /// Whether the device may stay quiet after a successful authenticate
    pub fn allows_silent_auth(&self) -> bool {
        matches!(self, Self::Spark)
    }

    /// Whether the device may skip acknowledging a delete
    pub fn allows_silent_delete(&self) -> bool {
        matches!(self, Self::Spark)
    }

    /// Canvas size in micrometers
    pub fn canvas_size(&self) -> (f64, f64) {
        let (w, h) = self.sensor_size();
        (w as f64 * self.point_size(), h as f64 * self.point_size())
    }

    /// Map a raw pressure reading onto `0..=PRESSURE_OUTPUT_RANGE`
    pub fn normalize_pressure(&self, raw: i32) -> u32 {
        let raw = raw.clamp(0, self.pressure_max() as i32) as u64;
        (raw * PRESSURE_OUTPUT_RANGE as u64 / self.pressure_max() as u64) as u32
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spark => write!(f, "spark"),
            Self::Slate => write!(f, "slate"),
            Self::IntuosPro => write!(f, "intuos-pro"),
        }
    }
}

/// The 6-byte credential a device issues trust to during registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceUuid(pub [u8; 6]);

impl DeviceUuid {
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Parse the 12 hex digit form used in configuration files
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 12 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Out-of-band metadata for the oldest file on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub stroke_count: u32,
    /// Unix seconds
    pub timestamp: i64,
}

/// One pen sample in micrometers with pressure in `0..=0x10000`.
///
/// Lost samples are kept as placeholders with non-finite coordinates so that
/// consumers can see the gap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub pressure: u32,
}

impl Point {
    pub fn lost() -> Self {
        Self {
            x: f64::NAN,
            y: f64::NAN,
            pressure: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Stroke {
    pub points: Vec<Point>,
    /// Absolute start time in Unix milliseconds, when the header carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pen_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pen_id: Option<u64>,
    pub new_layer: bool,
}

impl Stroke {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// False when the stroke holds nothing but lost-point placeholders
    pub fn has_valid_points(&self) -> bool {
        self.points.iter().any(Point::is_valid)
    }
}

/// One decoded note
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Drawing {
    /// Unix seconds
    pub timestamp: i64,
    /// Canvas width and height in micrometers, the same unit as the points.
    /// Renderers convert both to their output unit.
    pub dimensions: (f64, f64),
    pub strokes: Vec<Stroke>,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus(ConnectionStatus),
    LogMessage(StatusMessage),
    FileProgress { index: usize, total: usize },
    DrawingReady(Drawing),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Registering,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
