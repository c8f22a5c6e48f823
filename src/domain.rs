use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use flate2::read::MultiGzDecoder;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

/// Token inserted into output names when more than one region is requested.
pub const MULTI_REGION_TOKEN: &str = "multi_region";

/// Suffixes treated as a single extension when naming extracted output.
const COMPOUND_SUFFIXES: &[&str] = &[".vcf.gz.tbi", ".vcf.gz", ".bam.bai", ".cram.crai"];

const INDEX_SUFFIXES: &[&str] = &[".bai", ".crai", ".tbi", ".csi"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenomicRegion {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

impl GenomicRegion {
    pub fn new(chrom: impl Into<String>, start: u64, end: u64) -> Result<Self, KiraError> {
        let chrom = chrom.into();
        if chrom.is_empty() || start == 0 || start > end {
            return Err(KiraError::InvalidRegion(format!("{chrom}:{start}-{end}")));
        }
        Ok(Self { chrom, start, end })
    }
}

impl fmt::Display for GenomicRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
    }
}

impl FromStr for GenomicRegion {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        static REGION_RE: OnceLock<Regex> = OnceLock::new();
        let re = REGION_RE.get_or_init(|| Regex::new(r"^([^\s:]+):(\d+)-(\d+)$").unwrap());
        let trimmed = value.trim();
        let caps = re
            .captures(trimmed)
            .ok_or_else(|| KiraError::InvalidRegion(value.to_string()))?;
        let start = caps[2]
            .parse::<u64>()
            .map_err(|_| KiraError::InvalidRegion(value.to_string()))?;
        let end = caps[3]
            .parse::<u64>()
            .map_err(|_| KiraError::InvalidRegion(value.to_string()))?;
        Self::new(&caps[1], start, end)
    }
}

/// Ordered regions of one request. Empty means the whole file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionSet(Vec<GenomicRegion>);

impl RegionSet {
    pub fn new(regions: Vec<GenomicRegion>) -> Self {
        Self(regions)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GenomicRegion> {
        self.0.iter()
    }

    pub fn labels(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }

    /// Parses `chr1:100-200,chr2:5-10`. An empty string yields no regions.
    pub fn parse_range(value: &str) -> Result<Self, KiraError> {
        let regions = value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(regions))
    }

    pub fn from_bed(path: &Path) -> Result<Self, KiraError> {
        let file = File::open(path).map_err(|err| KiraError::InvalidBed {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let gzipped = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("gz"))
            .unwrap_or(false);
        let reader: Box<dyn Read> = if gzipped {
            Box::new(MultiGzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Self::parse_bed(path, BufReader::new(reader))
    }

    /// BED intervals are 0-based half-open; regions are 1-based inclusive.
    pub fn parse_bed<R: BufRead>(path: &Path, reader: R) -> Result<Self, KiraError> {
        let invalid = |line_no: usize, message: String| KiraError::InvalidBed {
            path: path.to_path_buf(),
            message: format!("line {line_no}: {message}"),
        };

        let mut regions = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(|err| invalid(line_no, err.to_string()))?;
            let trimmed = line.trim();
            if trimmed.is_empty()
                || trimmed.starts_with('#')
                || trimmed.starts_with("track")
                || trimmed.starts_with("browser")
            {
                continue;
            }
            let mut fields = trimmed.split_whitespace();
            let (Some(chrom), Some(start), Some(end)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(invalid(line_no, "expected chrom, start and end".to_string()));
            };
            let start = start
                .parse::<u64>()
                .map_err(|_| invalid(line_no, format!("invalid start {start}")))?;
            let end = end
                .parse::<u64>()
                .map_err(|_| invalid(line_no, format!("invalid end {end}")))?;
            let start = start
                .checked_add(1)
                .ok_or_else(|| invalid(line_no, format!("start out of range {start}")))?;
            let region = GenomicRegion::new(chrom, start, end)
                .map_err(|err| invalid(line_no, err.to_string()))?;
            regions.push(region);
        }
        Ok(Self(regions))
    }

    /// `range` takes precedence over `bed` when both are given.
    pub fn from_sources(range: Option<&str>, bed: Option<&Path>) -> Result<Self, KiraError> {
        match (range, bed) {
            (Some(range), _) => Self::parse_range(range),
            (None, Some(bed)) => Self::from_bed(bed),
            (None, None) => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Bam,
    Cram,
    Vcf,
    Other,
}

impl FileKind {
    pub fn from_file_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".bam") {
            FileKind::Bam
        } else if lower.ends_with(".cram") {
            FileKind::Cram
        } else if lower.ends_with(".vcf.gz") {
            FileKind::Vcf
        } else {
            FileKind::Other
        }
    }

    pub fn index_extension(&self) -> Option<&'static str> {
        match self {
            FileKind::Bam => Some("bai"),
            FileKind::Cram => Some("crai"),
            FileKind::Vcf => Some("tbi"),
            FileKind::Other => None,
        }
    }

    pub fn is_alignment(&self) -> bool {
        matches!(self, FileKind::Bam | FileKind::Cram)
    }

    pub fn is_variant(&self) -> bool {
        matches!(self, FileKind::Vcf)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Bam => write!(f, "bam"),
            FileKind::Cram => write!(f, "cram"),
            FileKind::Vcf => write!(f, "vcf"),
            FileKind::Other => write!(f, "other"),
        }
    }
}

/// Local index name for `file_name`, e.g. `a.bam` -> `a.bam.bai`.
pub fn index_file_name(file_name: &str) -> Option<String> {
    FileKind::from_file_name(file_name)
        .index_extension()
        .map(|ext| format!("{file_name}.{ext}"))
}

pub fn is_index_file(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    INDEX_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// Names accepted as the remote index of `file_name`, preferred first.
pub fn index_candidates(file_name: &str) -> Vec<String> {
    let kind = FileKind::from_file_name(file_name);
    let Some(ext) = kind.index_extension() else {
        return Vec::new();
    };
    let mut names = vec![format!("{file_name}.{ext}")];
    if kind.is_alignment() {
        if let Some((stem, _)) = file_name.rsplit_once('.') {
            names.push(format!("{stem}.{ext}"));
        }
    }
    names.push(format!("{file_name}.csi"));
    names
}

/// Empty filter accepts everything; entries match as file suffixes.
pub fn matches_filetypes(file_name: &str, filetypes: &[String]) -> bool {
    if filetypes.is_empty() {
        return true;
    }
    let lower = file_name.to_ascii_lowercase();
    filetypes.iter().any(|filetype| {
        let wanted = filetype.trim().trim_start_matches('.').to_ascii_lowercase();
        !wanted.is_empty() && lower.ends_with(&format!(".{wanted}"))
    })
}

pub fn derive_output_name<S: AsRef<str>>(original: &str, regions: &[S]) -> String {
    let token = match regions {
        [] => return original.to_string(),
        [single] if single.as_ref().trim().is_empty() => return original.to_string(),
        [single] => single.as_ref().trim().replace([':', '-'], "_"),
        _ => MULTI_REGION_TOKEN.to_string(),
    };
    let (stem, suffix) = split_primary_extension(original);
    format!("{stem}.{token}{suffix}")
}

fn split_primary_extension(name: &str) -> (&str, &str) {
    let lower = name.to_ascii_lowercase();
    for suffix in COMPOUND_SUFFIXES {
        if lower.len() > suffix.len() && lower.ends_with(suffix) {
            return name.split_at(name.len() - suffix.len());
        }
    }
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}
