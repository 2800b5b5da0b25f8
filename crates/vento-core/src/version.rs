//! Firmware version codec.
//!
//! Parses version information out of vendor firmware filenames and defines
//! the ordering used for update eligibility. Filenames come in two shapes:
//!
//! - Modern: `C6_1_5_46_72_P1_1_1_5_48.mbin` (controller + panel versions)
//! - Legacy: `C6_1_3_28_38_20180428.mbin` (controller version + build date)

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Only this extension is eligible for automatic install.
pub const FIRMWARE_EXTENSION: &str = "mbin";

/// Oldest controller firmware whose bootloader accepts HTTP uploads.
/// Devices below this need a manual update first.
pub const MIN_SUPPORTED_VERSION: (u32, u32, u32) = (1, 3, 15);

static MODERN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(C6M?|C8)_(\d+)_(\d+)_(\d+)_(\d+)_P(\d+)_(\d+)_(\d+)_(\d+)_(\d+)\.([A-Za-z0-9]+)$")
        .expect("modern firmware filename pattern")
});

static LEGACY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(C6M?|C8)_(\d+)_(\d+)_(\d+)_(\d+)_(\d{8})\.([A-Za-z0-9]+)$")
        .expect("legacy firmware filename pattern")
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized firmware filename format: {0}")]
    UnrecognizedFormat(String),
}

/// Controller family. Devices of one family share firmware images and the
/// vendor download endpoint. The C6M model runs C6 firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerFamily {
    C6,
    C8,
}

impl ControllerFamily {
    /// Fixed vendor download URL for this family. The endpoint is a
    /// streaming GET; the filename only appears in the response headers.
    pub fn vendor_url(&self) -> &'static str {
        match self {
            ControllerFamily::C6 => {
                "http://www.komfovent.com/Update/Controllers/firmware.php?file=mbin"
            }
            ControllerFamily::C8 => {
                "http://www.komfovent.com/Update/Controllers/firmware.php?file=c8"
            }
        }
    }
}

impl fmt::Display for ControllerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerFamily::C6 => write!(f, "C6"),
            ControllerFamily::C8 => write!(f, "C8"),
        }
    }
}

impl FromStr for ControllerFamily {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // C6 and C6M share firmware
            "C6" | "C6M" | "c6" | "c6m" => Ok(ControllerFamily::C6),
            "C8" | "c8" => Ok(ControllerFamily::C8),
            other => Err(ParseError::UnrecognizedFormat(other.to_string())),
        }
    }
}

/// Controller firmware version: family tag plus four numeric fields.
///
/// Only `v4` (the "functional version") participates in update-eligibility
/// ordering. The family tag is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub family: ControllerFamily,
    pub v1: u32,
    pub v2: u32,
    pub v3: u32,
    pub v4: u32,
}

impl FirmwareVersion {
    pub fn new(family: ControllerFamily, v1: u32, v2: u32, v3: u32, v4: u32) -> Self {
        Self { family, v1, v2, v3, v4 }
    }

    /// The functional version, authoritative for update eligibility.
    pub fn functional(&self) -> u32 {
        self.v4
    }

    /// Dotted numeric form without the family tag, e.g. `1.5.46.72`.
    pub fn numeric(&self) -> String {
        format!("{}.{}.{}.{}", self.v1, self.v2, self.v3, self.v4)
    }

    /// Whether all four numeric fields match (family tag ignored).
    pub fn same_numbers(&self, other: &FirmwareVersion) -> bool {
        (self.v1, self.v2, self.v3, self.v4) == (other.v1, other.v2, other.v3, other.v4)
    }

    /// Whether the installed firmware is recent enough to accept uploads.
    pub fn supports_upload(&self) -> bool {
        (self.v1, self.v2, self.v3) >= MIN_SUPPORTED_VERSION
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.numeric())
    }
}

/// Panel firmware version carried by modern filenames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelVersion {
    pub panel: u32,
    pub v1: u32,
    pub v2: u32,
    pub v3: u32,
    pub v4: u32,
}

impl fmt::Display for PanelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{} {}.{}.{}.{}", self.panel, self.v1, self.v2, self.v3, self.v4)
    }
}

/// Result of parsing a vendor firmware filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFirmware {
    pub filename: String,
    pub controller: FirmwareVersion,
    /// Absent for legacy filenames.
    pub panel: Option<PanelVersion>,
    pub extension: String,
}

impl ParsedFirmware {
    /// Whether the file extension is on the automatic-install allow-list.
    pub fn extension_supported(&self) -> bool {
        self.extension == FIRMWARE_EXTENSION
    }
}

/// Compare two versions for update eligibility.
///
/// The product rule compares the functional version (v4) and nothing else:
/// a release that only bumps the panel firmware still increments v4, and a
/// full tuple comparison would miss it. Deliberately not a semver ordering.
pub fn cmp_functional(a: &FirmwareVersion, b: &FirmwareVersion) -> Ordering {
    a.functional().cmp(&b.functional())
}

/// Whether `available` is functionally newer than `installed`.
pub fn is_newer(installed: &FirmwareVersion, available: &FirmwareVersion) -> bool {
    cmp_functional(available, installed) == Ordering::Greater
}

/// Parse a vendor firmware filename, trying the modern grammar before the
/// legacy one. Vendor input is untrusted; malformed names are a typed error.
pub fn parse_filename(name: &str) -> Result<ParsedFirmware, ParseError> {
    if let Some(caps) = MODERN_PATTERN.captures(name) {
        let family: ControllerFamily = caps[1].parse()?;
        return Ok(ParsedFirmware {
            filename: name.to_string(),
            controller: FirmwareVersion::new(
                family,
                num(&caps[2]),
                num(&caps[3]),
                num(&caps[4]),
                num(&caps[5]),
            ),
            panel: Some(PanelVersion {
                panel: num(&caps[6]),
                v1: num(&caps[7]),
                v2: num(&caps[8]),
                v3: num(&caps[9]),
                v4: num(&caps[10]),
            }),
            extension: caps[11].to_ascii_lowercase(),
        });
    }

    if let Some(caps) = LEGACY_PATTERN.captures(name) {
        let family: ControllerFamily = caps[1].parse()?;
        return Ok(ParsedFirmware {
            filename: name.to_string(),
            controller: FirmwareVersion::new(
                family,
                num(&caps[2]),
                num(&caps[3]),
                num(&caps[4]),
                num(&caps[5]),
            ),
            panel: None,
            extension: caps[7].to_ascii_lowercase(),
        });
    }

    Err(ParseError::UnrecognizedFormat(name.to_string()))
}

fn num(s: &str) -> u32 {
    // Capture groups are \d+ so this cannot fail for sane field widths
    s.parse().unwrap_or(0)
}
