use std::fs;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use postergeo::{
    Bounds, GeoCache, PolygonAlpha, QueryBatcher, RoadCategory, ScatterPoint, Track,
    prepare_forests, prepare_pois, prepare_rivers, prepare_roads, process_forests, process_pois,
    process_rivers, process_roads,
};

mod cli;
use cli::Cli;

#[derive(Serialize)]
struct Summary {
    roads: Vec<(RoadCategory, usize)>,
    water_layers: Vec<LayerSummary>,
    forest_polygons: usize,
    farmland_polygons: usize,
    pois: Vec<ScatterPoint>,
}

#[derive(Serialize)]
struct LayerSummary {
    polygons: usize,
    alpha: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "postergeo=info",
        1 => "postergeo=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let track = cli.track.as_deref().map(load_track).transpose()?;
    let bounds = match (&cli.bounds, &track) {
        (Some(spec), _) => parse_bounds(spec)?,
        (None, Some(track)) => track.bounds().with_relative_margin(0.1),
        (None, None) => bail!("either --bounds or --track is required"),
    };

    let cache = GeoCache::new(&cli.cache_dir);
    let mut batch = match &cli.endpoint {
        Some(endpoint) => QueryBatcher::with_endpoint(endpoint),
        None => QueryBatcher::new(),
    };

    let precision = cli.road_precision.into();
    let downloaded = prepare_roads(&mut batch, &cache, &bounds, precision)?;
    prepare_rivers(&mut batch, &cache, &bounds)?;
    prepare_forests(&mut batch, &cache, &bounds)?;
    if let Some(track) = &track {
        prepare_pois(&mut batch, &cache, track)?;
    }

    batch.launch()?;

    let roads = process_roads(&mut batch, &cache, &bounds, &downloaded, precision)?;
    let water = process_rivers(&mut batch, &cache, &bounds)?;
    let cover = process_forests(&mut batch, &cache, &bounds)?;
    let pois = match &track {
        Some(track) => process_pois(&mut batch, &cache, track)?,
        None => Vec::new(),
    };

    let summary = Summary {
        roads: roads.iter().map(|(category, ways)| (*category, ways.len())).collect(),
        water_layers: water
            .iter()
            .map(|PolygonAlpha { polygons, alpha }| LayerSummary {
                polygons: polygons.exteriors.len(),
                alpha: *alpha,
            })
            .collect(),
        forest_polygons: cover.forests.exteriors.len(),
        farmland_polygons: cover.farmland.exteriors.len(),
        pois,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn parse_bounds(spec: &str) -> Result<Bounds> {
    let parts: Vec<f64> = spec
        .split(',')
        .map(|part| part.trim().parse().with_context(|| format!("bad coordinate {part:?}")))
        .collect::<Result<_>>()?;
    let [lon_min, lat_min, lon_max, lat_max] = parts[..] else {
        bail!("--bounds wants lon_min,lat_min,lon_max,lat_max");
    };
    if lon_min > lon_max || lat_min > lat_max {
        bail!("--bounds corners are inverted");
    }
    Ok(Bounds::new(lon_min, lon_max, lat_min, lat_max))
}

fn load_track(path: &std::path::Path) -> Result<Track> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut lonlat = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((lon, lat)) = line.split_once(',') else {
            bail!("{}:{}: expected lon,lat", path.display(), lineno + 1);
        };
        lonlat.push((
            lon.trim().parse().with_context(|| format!("line {}", lineno + 1))?,
            lat.trim().parse().with_context(|| format!("line {}", lineno + 1))?,
        ));
    }
    if lonlat.is_empty() {
        bail!("no coordinates in {}", path.display());
    }
    Ok(Track::new(lonlat))
}
