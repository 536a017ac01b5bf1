use std::path::PathBuf;

use postergeo::RoadPrecision;

/// Poster geodata CLI (argument schema only)
#[derive(clap::Parser, Debug)]
#[command(name = "postergeo", version, about)]
pub struct Cli {
    /// Increase output verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Extent to fetch, as lon_min,lat_min,lon_max,lat_max (degrees).
    /// Derived from the track when omitted.
    #[arg(long, value_name = "LON,LAT,LON,LAT", allow_hyphen_values = true)]
    pub bounds: Option<String>,

    /// Track coordinates, one "lon,lat" pair per line
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub track: Option<PathBuf>,

    /// Cache directory (entries are valid forever; delete to refresh)
    #[arg(long, default_value = "postergeo-cache", value_hint = clap::ValueHint::DirPath)]
    pub cache_dir: PathBuf,

    /// Road detail tier
    #[arg(long, value_enum, default_value = "medium")]
    pub road_precision: Precision,

    /// Overpass endpoint override
    #[arg(long)]
    pub endpoint: Option<String>,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
pub enum Precision {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl From<Precision> for RoadPrecision {
    fn from(p: Precision) -> Self {
        match p {
            Precision::Low => RoadPrecision::Low,
            Precision::Medium => RoadPrecision::Medium,
            Precision::High => RoadPrecision::High,
            Precision::VeryHigh => RoadPrecision::VeryHigh,
        }
    }
}
