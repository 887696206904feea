//! Web Mercator (slippy map) tile arithmetic.

use std::f64::consts::PI;

use crate::models::{Bounds, LayerType, TileKey, MAX_MERCATOR_LAT};

/// Highest zoom level a tile key can address.
pub const MAX_ZOOM: u8 = 22;

fn max_index(zoom: u8) -> u32 {
    ((1u64 << zoom) - 1) as u32
}

/// Tile column containing `lon` at `zoom`.
pub fn lon_to_tile_x(lon: f64, zoom: u8) -> u32 {
    let n = (1u64 << zoom) as f64;
    let x = ((lon + 180.0) / 360.0 * n).floor();
    x.clamp(0.0, max_index(zoom) as f64) as u32
}

/// Tile row containing `lat` at `zoom`. Latitudes beyond the Mercator limit are clamped.
pub fn lat_to_tile_y(lat: f64, zoom: u8) -> u32 {
    let n = (1u64 << zoom) as f64;
    let lat_rad = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n).floor();
    y.clamp(0.0, max_index(zoom) as f64) as u32
}

/// Inclusive tile index ranges covering `bounds` at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TileRange {
    pub fn for_bounds(bounds: &Bounds, zoom: u8) -> Self {
        let west = lon_to_tile_x(bounds.south_west.lon, zoom);
        let east = lon_to_tile_x(bounds.north_east.lon, zoom);
        // Tile rows grow southwards.
        let north = lat_to_tile_y(bounds.north_east.lat, zoom);
        let south = lat_to_tile_y(bounds.south_west.lat, zoom);

        Self {
            zoom,
            min_x: west.min(east),
            max_x: west.max(east),
            min_y: north.min(south),
            max_y: north.max(south),
        }
    }

    pub fn tile_count(&self) -> u64 {
        (self.max_x - self.min_x + 1) as u64 * (self.max_y - self.min_y + 1) as u64
    }

    /// Keys in the range, generated on demand.
    pub fn keys(self, layer: LayerType) -> impl Iterator<Item = TileKey> {
        let Self {
            zoom,
            min_x,
            max_x,
            min_y,
            max_y,
        } = self;
        (min_x..=max_x)
            .flat_map(move |x| (min_y..=max_y).map(move |y| TileKey::new(zoom, x, y, layer)))
    }
}

/// One tile range per zoom level covering `bounds`.
pub fn ranges_for_bounds(bounds: &Bounds, zoom_levels: &[u8]) -> Vec<TileRange> {
    zoom_levels
        .iter()
        .map(|&zoom| TileRange::for_bounds(bounds, zoom))
        .collect()
}

/// Number of tiles covering `bounds` over the given zoom levels.
pub fn tile_count(bounds: &Bounds, zoom_levels: &[u8]) -> u64 {
    ranges_for_bounds(bounds, zoom_levels)
        .iter()
        .map(TileRange::tile_count)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Coordinate;

    #[test]
    fn test_known_tile_coordinates() {
        // Lusaka at zoom 10
        assert_eq!(lon_to_tile_x(28.2833, 10), 592);
        assert_eq!(lat_to_tile_y(-15.4167, 10), 556);

        assert_eq!(lon_to_tile_x(-180.0, 3), 0);
        assert_eq!(lon_to_tile_x(180.0, 3), 7);
        assert_eq!(lat_to_tile_y(0.0, 1), 1);
        assert_eq!(lon_to_tile_x(0.0, 0), 0);
        assert_eq!(lat_to_tile_y(45.0, 0), 0);
    }

    #[test]
    fn test_polar_latitudes_are_clamped() {
        assert_eq!(lat_to_tile_y(90.0, 4), 0);
        assert_eq!(lat_to_tile_y(-90.0, 4), 15);
    }

    #[test]
    fn test_range_is_cartesian_product() {
        let bounds = Bounds::from_corners(
            Coordinate::new(-15.45, 28.25),
            Coordinate::new(-15.38, 28.34),
        )
        .unwrap();

        let range = TileRange::for_bounds(&bounds, 12);
        let keys: Vec<_> = range.keys(LayerType::Street).collect();

        assert_eq!(keys.len() as u64, range.tile_count());
        assert!(range.min_y <= range.max_y);
        assert!(keys
            .iter()
            .all(|k| (range.min_x..=range.max_x).contains(&k.x)
                && (range.min_y..=range.max_y).contains(&k.y)));
    }

    #[test]
    fn test_tile_count_sums_zoom_levels() {
        // Corners inside tiles (0,0) and (1,1) at zoom 1, spanning a 2x2 block.
        let bounds =
            Bounds::from_corners(Coordinate::new(-10.0, -10.0), Coordinate::new(10.0, 10.0))
                .unwrap();

        assert_eq!(tile_count(&bounds, &[1]), 4);
        assert_eq!(tile_count(&bounds, &[0, 1]), 5);
        let keys: Vec<_> = ranges_for_bounds(&bounds, &[0, 1])
            .into_iter()
            .flat_map(|range| range.keys(LayerType::Terrain))
            .collect();
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn test_world_count_at_high_zoom_is_computed_without_enumerating() {
        let world =
            Bounds::from_corners(Coordinate::new(-85.0, -180.0), Coordinate::new(85.0, 180.0))
                .unwrap();

        let count = tile_count(&world, &[18]);
        assert!(count > 60_000_000_000);

        let mut keys = TileRange::for_bounds(&world, 18).keys(LayerType::Street);
        assert_eq!(
            keys.next().map(|k| (k.x, k.y)),
            Some((0, lat_to_tile_y(85.0, 18)))
        );
    }
}
