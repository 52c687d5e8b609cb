//! Output canvas selection: named presets or bounded custom sizes

use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

pub const MAX_CUSTOM_DIMENSION: u32 = 2000;
pub const DEFAULT_OUTPUT_FORMAT: OutputFormat = OutputFormat::PassportEu;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    PassportTr,
    PassportEu,
    VisaUs,
    IdCardTr,
    Custom,
}

impl OutputFormat {
    pub const PRESETS: [OutputFormat; 4] = [
        OutputFormat::PassportTr,
        OutputFormat::PassportEu,
        OutputFormat::VisaUs,
        OutputFormat::IdCardTr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::PassportTr => "passport_tr",
            OutputFormat::PassportEu => "passport_eu",
            OutputFormat::VisaUs => "visa_us",
            OutputFormat::IdCardTr => "id_card_tr",
            OutputFormat::Custom => "custom",
        }
    }

    /// Canvas size in pixels, `None` for `custom`
    pub fn preset_size(self) -> Option<(u32, u32)> {
        match self {
            OutputFormat::PassportTr => Some((591, 709)),
            OutputFormat::PassportEu => Some((413, 531)),
            OutputFormat::VisaUs => Some((600, 600)),
            OutputFormat::IdCardTr => Some((591, 709)),
            OutputFormat::Custom => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = OutputSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "passport_tr" => Ok(OutputFormat::PassportTr),
            "passport_eu" => Ok(OutputFormat::PassportEu),
            "visa_us" => Ok(OutputFormat::VisaUs),
            "id_card_tr" => Ok(OutputFormat::IdCardTr),
            "custom" => Ok(OutputFormat::Custom),
            other => Err(OutputSpecError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpecError {
    UnknownFormat(String),
    MissingDimension(&'static str),
    InvalidDimension { name: &'static str, value: String },
}

impl fmt::Display for OutputSpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSpecError::UnknownFormat(name) => {
                let known = OutputFormat::PRESETS
                    .iter()
                    .map(|p| p.as_str())
                    .chain(std::iter::once("custom"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "Unknown output_format '{name}'. Expected one of: {known}")
            }
            OutputSpecError::MissingDimension(name) => {
                write!(f, "{name} is required when output_format is 'custom'")
            }
            OutputSpecError::InvalidDimension { name, value } => write!(
                f,
                "{name} must be a whole number between 1 and {MAX_CUSTOM_DIMENSION}, got '{value}'"
            ),
        }
    }
}

impl Error for OutputSpecError {}

/// Target canvas for the final image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutputSpec {
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
}

impl OutputSpec {
    /// Resolve raw query values. Custom dimensions are only read for `custom`.
    pub fn resolve(
        output_format: Option<&str>,
        custom_width: Option<&str>,
        custom_height: Option<&str>,
    ) -> Result<Self, OutputSpecError> {
        let format = match output_format.map(str::trim) {
            None | Some("") => DEFAULT_OUTPUT_FORMAT,
            Some(name) => name.parse()?,
        };

        if let Some((width, height)) = format.preset_size() {
            return Ok(Self {
                format,
                width,
                height,
            });
        }

        let width = parse_dimension("custom_width", custom_width)?;
        let height = parse_dimension("custom_height", custom_height)?;
        Ok(Self {
            format,
            width,
            height,
        })
    }
}

impl Default for OutputSpec {
    fn default() -> Self {
        let (width, height) = DEFAULT_OUTPUT_FORMAT.preset_size().unwrap_or((413, 531));
        Self {
            format: DEFAULT_OUTPUT_FORMAT,
            width,
            height,
        }
    }
}

fn parse_dimension(name: &'static str, raw: Option<&str>) -> Result<u32, OutputSpecError> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Err(OutputSpecError::MissingDimension(name)),
        Some(raw) => raw,
    };

    match raw.parse::<u32>() {
        Ok(value) if (1..=MAX_CUSTOM_DIMENSION).contains(&value) => Ok(value),
        _ => Err(OutputSpecError::InvalidDimension {
            name,
            value: raw.to_string(),
        }),
    }
}

/// Preset listing entry for the formats endpoint
#[derive(Debug, Serialize)]
pub struct PresetInfo {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
}

pub fn preset_table() -> Vec<PresetInfo> {
    OutputFormat::PRESETS
        .iter()
        .filter_map(|format| {
            format.preset_size().map(|(width, height)| PresetInfo {
                name: format.as_str(),
                width,
                height,
            })
        })
        .collect()
}
