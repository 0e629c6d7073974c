use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

pub const SUPPORTED_VERSION: &str = "1.3.1";

static REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[Region ([0-9]*)\]$").expect("valid region pattern"));

#[derive(Debug)]
pub enum ParseError {
    FileNotFound(PathBuf),
    Io(std::io::Error),
    MalformedHeader { line: usize, content: String },
    UnsupportedVersion(String),
    MalformedMetadataLine { line: usize, content: String },
    MalformedDataLine { line: usize, content: String },
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::FileNotFound(path) => {
                write!(f, "Spectrum file not found: {}", path.display())
            }
            ParseError::Io(x) => write!(f, "Spectrum file had an IO error: {}", x),
            ParseError::MalformedHeader { line, content } => {
                write!(f, "Malformed header on line {}: '{}'", line, content)
            }
            ParseError::UnsupportedVersion(version) => write!(
                f,
                "Unsupported spectrum file version '{}' (only {} is supported)",
                version, SUPPORTED_VERSION
            ),
            ParseError::MalformedMetadataLine { line, content } => write!(
                f,
                "Metadata line {} is not a key=value pair: '{}'",
                line, content
            ),
            ParseError::MalformedDataLine { line, content } => write!(
                f,
                "Data line {} does not hold two numbers separated by two spaces: '{}'",
                line, content
            ),
        }
    }
}

impl From<std::io::Error> for ParseError {
    fn from(value: std::io::Error) -> Self {
        ParseError::Io(value)
    }
}

impl std::error::Error for ParseError {}

/// One scan of a multi-region file.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Region {
    pub name: String,
    pub metadata: BTreeMap<String, String>,
    /// (energy, intensity) in file order; the energy axis may descend.
    pub spectrum: Vec<[f64; 2]>,
}

impl Region {
    fn new(name: String) -> Self {
        Self {
            name,
            metadata: BTreeMap::new(),
            spectrum: Vec::new(),
        }
    }

    pub fn x(&self) -> Vec<f64> {
        self.spectrum.iter().map(|p| p[0]).collect()
    }

    pub fn y(&self) -> Vec<f64> {
        self.spectrum.iter().map(|p| p[1]).collect()
    }

    pub fn len(&self) -> usize {
        self.spectrum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectrum.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Metadata,
    Spectrum,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SpectrumFile {
    pub path: Option<PathBuf>,
    pub number_of_regions: usize,
    pub version: String,
    /// Regions in the order they appear in the file.
    pub regions: Vec<Region>,
}

impl SpectrumFile {
    pub fn open(path: &Path) -> Result<Self, ParseError> {
        if !path.is_file() {
            return Err(ParseError::FileNotFound(path.to_path_buf()));
        }
        log::info!("Reading spectrum file {}", path.display());
        let file = File::open(path)?;
        let mut parsed = Self::from_reader(BufReader::new(file))?;
        parsed.path = Some(path.to_path_buf());
        Ok(parsed)
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, ParseError> {
        let mut lines = reader.lines().enumerate();

        // The first line is the "[Info]" banner; its content is not used.
        next_line(&mut lines)?;

        let (number, content) = next_line(&mut lines)?.unwrap_or((2, String::new()));
        let number_of_regions = content
            .trim()
            .strip_prefix("NoOfRegions=")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or(ParseError::MalformedHeader {
                line: number,
                content: content.clone(),
            })?;

        let (number, content) = next_line(&mut lines)?.unwrap_or((3, String::new()));
        let version = content
            .trim()
            .strip_prefix("Version=")
            .ok_or(ParseError::MalformedHeader {
                line: number,
                content: content.clone(),
            })?
            .trim()
            .to_string();
        if version != SUPPORTED_VERSION {
            return Err(ParseError::UnsupportedVersion(version));
        }

        let mut regions: Vec<Region> = Vec::new();
        let mut section = Section::None;
        // section markers of the current region; other numbers are plain lines
        let mut info_markers = [String::new(), String::new()];
        let mut data_marker = String::new();

        for (index, line) in lines {
            let number = index + 1;
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(caps) = REGION_RE.captures(line) {
                let id = &caps[1];
                regions.push(Region::new(format!("Region {}", id)));
                info_markers = [
                    format!("[Info {}]", id),
                    format!("[Run Mode Information {}]", id),
                ];
                data_marker = format!("[Data {}]", id);
                section = Section::Metadata;
                continue;
            }
            let Some(region) = regions.last_mut() else {
                continue;
            };

            if info_markers.iter().any(|m| m == line) {
                section = Section::Metadata;
                continue;
            }
            if line == data_marker {
                section = Section::Spectrum;
                continue;
            }

            match section {
                Section::None => {}
                Section::Metadata => {
                    let (key, value) =
                        line.split_once('=')
                            .ok_or_else(|| ParseError::MalformedMetadataLine {
                                line: number,
                                content: line.to_string(),
                            })?;
                    region.metadata.insert(key.to_string(), value.to_string());
                }
                Section::Spectrum => {
                    let point = parse_data_line(line).ok_or_else(|| {
                        ParseError::MalformedDataLine {
                            line: number,
                            content: line.to_string(),
                        }
                    })?;
                    region.spectrum.push(point);
                }
            }
        }

        if regions.len() != number_of_regions {
            log::warn!(
                "Header announces {} regions but {} were found",
                number_of_regions,
                regions.len()
            );
        }
        for region in &regions {
            log::debug!("{}: {} samples", region.name, region.len());
        }

        Ok(Self {
            path: None,
            number_of_regions,
            version,
            regions,
        })
    }

    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn region_names(&self) -> Vec<&str> {
        self.regions.iter().map(|r| r.name.as_str()).collect()
    }

    /// Region name to metadata, in file order.
    pub fn metadata(&self) -> Vec<(&str, &BTreeMap<String, String>)> {
        self.regions
            .iter()
            .map(|r| (r.name.as_str(), &r.metadata))
            .collect()
    }
}

/// Convenience wrapper around [`SpectrumFile::open`].
pub fn read_file(path: impl AsRef<Path>) -> Result<SpectrumFile, ParseError> {
    SpectrumFile::open(path.as_ref())
}

fn parse_data_line(line: &str) -> Option<[f64; 2]> {
    let mut fields = line.split("  ");
    let energy = fields.next()?.parse::<f64>().ok()?;
    let intensity = fields.next()?.parse::<f64>().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some([energy, intensity])
}

/// Next header line with its 1-based line number.
fn next_line<I>(lines: &mut I) -> Result<Option<(usize, String)>, ParseError>
where
    I: Iterator<Item = (usize, std::io::Result<String>)>,
{
    match lines.next() {
        Some((index, line)) => Ok(Some((index + 1, line?))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TWO_REGIONS: &str = "[Info]
NoOfRegions=2
Version=1.3.1

[Region 1]
Region Name=C 1s
[Info 1]
Region Name=C 1s
Pass Energy=20
Excitation Energy=1486.6
[Run Mode Information 1]
Name=Normal=Fixed
[Data 1]
0  1
1  5
2  10
3  5
4  1

[Region 2]
[Info 2]
Lens Mode=Transmission
[Data 2]
85.5  120.25
85.4  118.5
";

    fn parse(text: &str) -> Result<SpectrumFile, ParseError> {
        SpectrumFile::from_reader(Cursor::new(text))
    }

    #[test]
    fn reads_regions_in_file_order() {
        let file = parse(TWO_REGIONS).unwrap();
        assert_eq!(file.number_of_regions, 2);
        assert_eq!(file.version, "1.3.1");
        assert_eq!(file.region_names(), vec!["Region 1", "Region 2"]);

        let region = file.region("Region 1").unwrap();
        assert_eq!(
            region.spectrum,
            vec![[0.0, 1.0], [1.0, 5.0], [2.0, 10.0], [3.0, 5.0], [4.0, 1.0]]
        );
        assert_eq!(region.metadata["Pass Energy"], "20");
        // split on the first '=' only
        assert_eq!(region.metadata["Name"], "Normal=Fixed");
        // the key under the region header repeats the one under [Info 1]
        assert_eq!(region.metadata.len(), 4);

        let region = file.region("Region 2").unwrap();
        assert_eq!(region.x(), vec![85.5, 85.4]);
        assert_eq!(region.y(), vec![120.25, 118.5]);
    }

    #[test]
    fn rejects_other_versions() {
        let text = TWO_REGIONS.replace("Version=1.3.1", "Version=1.2.0");
        match parse(&text) {
            Err(ParseError::UnsupportedVersion(v)) => assert_eq!(v, "1.2.0"),
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn data_lines_need_two_spaces() {
        let text = TWO_REGIONS.replace("2  10", "2 10");
        match parse(&text) {
            Err(ParseError::MalformedDataLine { line, content }) => {
                assert_eq!(line, 16);
                assert_eq!(content, "2 10");
            }
            other => panic!("expected MalformedDataLine, got {other:?}"),
        }

        let text = TWO_REGIONS.replace("2  10", "2  10  7");
        assert!(matches!(
            parse(&text),
            Err(ParseError::MalformedDataLine { .. })
        ));
    }

    #[test]
    fn metadata_lines_need_an_equals_sign() {
        let text = TWO_REGIONS.replace("Pass Energy=20", "Pass Energy 20");
        assert!(matches!(
            parse(&text),
            Err(ParseError::MalformedMetadataLine { line: 9, .. })
        ));
    }

    #[test]
    fn region_count_must_be_numeric() {
        let text = TWO_REGIONS.replace("NoOfRegions=2", "NoOfRegions=two");
        assert!(matches!(
            parse(&text),
            Err(ParseError::MalformedHeader { line: 2, .. })
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let path = std::env::temp_dir().join("xpsfit-does-not-exist.txt");
        match read_file(&path) {
            Err(ParseError::FileNotFound(p)) => assert_eq!(p, path),
            other => panic!("expected FileNotFound, got {other:?}"),
        }
    }

    #[test]
    fn parsing_is_idempotent() {
        let path = std::env::temp_dir().join(format!("xpsfit-reader-{}.txt", std::process::id()));
        std::fs::write(&path, TWO_REGIONS).unwrap();
        let first = read_file(&path).unwrap();
        let second = read_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn region_header_opens_metadata() {
        let text = "[Info]
NoOfRegions=1
Version=1.3.1
[Region 3]
Acquisition Date=2024-05-01
[Data 3]
1  2
";
        let file = parse(text).unwrap();
        let region = file.region("Region 3").unwrap();
        assert_eq!(region.metadata["Acquisition Date"], "2024-05-01");
        assert_eq!(region.spectrum, vec![[1.0, 2.0]]);
    }

    #[test]
    fn markers_of_other_regions_are_plain_lines() {
        let info = "[Info]
NoOfRegions=1
Version=1.3.1
[Region 1]
[Info 7]
Pass Energy=20
";
        assert!(matches!(
            parse(info),
            Err(ParseError::MalformedMetadataLine { line: 5, .. })
        ));

        let data = "[Info]
NoOfRegions=1
Version=1.3.1
[Region 1]
[Info 1]
Pass Energy=20
[Data 9]
1  2
";
        assert!(matches!(
            parse(data),
            Err(ParseError::MalformedMetadataLine { line: 7, .. })
        ));

        let spectrum = "[Info]
NoOfRegions=1
Version=1.3.1
[Region 1]
[Data 1]
1  2
[Data 2]
";
        assert!(matches!(
            parse(spectrum),
            Err(ParseError::MalformedDataLine { line: 7, .. })
        ));
    }
}
