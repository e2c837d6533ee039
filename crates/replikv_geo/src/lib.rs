//! Geohash encoding and great-circle distance helpers.
//!
//! Coordinates are quantized into a 52-bit word (26 bits per axis) with
//! latitude bits on even positions and longitude bits on odd positions, so
//! numerically close hashes tend to be spatially close. The integer hash uses
//! the Web Mercator latitude bounds; the base-32 text form re-encodes the cell
//! centre against the full [-90, 90] range so it matches standard geohash
//! strings.

use thiserror::Error;

/// Bits per axis at full precision.
pub const GEO_STEP_MAX: u8 = 26;
/// Latitude bounds supported by the integer encoding.
pub const GEO_LAT_MIN: f64 = -85.051_128_78;
pub const GEO_LAT_MAX: f64 = 85.051_128_78;
pub const GEO_LONG_MIN: f64 = -180.0;
pub const GEO_LONG_MAX: f64 = 180.0;
/// Earth radius used by the haversine distance, in meters.
pub const EARTH_RADIUS_IN_METERS: f64 = 6_372_797.560_856;
/// Half the Mercator projection width, in meters.
pub const MERCATOR_MAX: f64 = 20_037_726.37;

const BASE32_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";
const BASE32_LEN: usize = 11;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeoError {
    #[error("invalid longitude,latitude pair {longitude},{latitude}")]
    OutOfRange { longitude: f64, latitude: f64 },
    #[error("unsupported unit provided. please use m, km, ft, mi")]
    UnknownUnit(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoPoint {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoRange {
    pub min: f64,
    pub max: f64,
}

impl GeoRange {
    const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

const MERCATOR_LAT: GeoRange = GeoRange::new(GEO_LAT_MIN, GEO_LAT_MAX);
const STANDARD_LAT: GeoRange = GeoRange::new(-90.0, 90.0);
const LONG: GeoRange = GeoRange::new(GEO_LONG_MIN, GEO_LONG_MAX);

/// Interleaved hash bits at a given precision.
///
/// `step` is the number of bits per axis, so `bits` uses `2 * step` bits.
/// A zero value (bits 0, step 0) marks an excluded neighbour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GeoHashBits {
    pub bits: u64,
    pub step: u8,
}

impl GeoHashBits {
    pub fn is_zero(&self) -> bool {
        self.bits == 0 && self.step == 0
    }

    /// Half-open score interval `[min, max)` covered by this cell once it is
    /// widened to full precision.
    pub fn score_range(&self) -> (u64, u64) {
        let shift = u32::from(GEO_STEP_MAX) * 2 - u32::from(self.step) * 2;
        (self.bits << shift, (self.bits + 1) << shift)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoArea {
    pub hash: GeoHashBits,
    pub longitude: GeoRange,
    pub latitude: GeoRange,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeoNeighbors {
    pub north: GeoHashBits,
    pub east: GeoHashBits,
    pub west: GeoHashBits,
    pub south: GeoHashBits,
    pub north_east: GeoHashBits,
    pub south_east: GeoHashBits,
    pub north_west: GeoHashBits,
    pub south_west: GeoHashBits,
}

/// Distance units accepted by geo commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistanceUnit {
    Meters,
    Kilometers,
    Feet,
    Miles,
}

impl DistanceUnit {
    pub fn parse(raw: &str) -> Result<Self, GeoError> {
        match raw.to_ascii_lowercase().as_str() {
            "m" => Ok(Self::Meters),
            "km" => Ok(Self::Kilometers),
            "ft" => Ok(Self::Feet),
            "mi" => Ok(Self::Miles),
            _ => Err(GeoError::UnknownUnit(raw.to_string())),
        }
    }

    /// Meters per unit.
    pub fn factor(self) -> f64 {
        match self {
            Self::Meters => 1.0,
            Self::Kilometers => 1000.0,
            Self::Feet => 0.3048,
            Self::Miles => 1609.34,
        }
    }
}

/// Encode a coordinate at full precision, returning the 52-bit hash and its
/// 11-character base-32 rendering.
pub fn encode(longitude: f64, latitude: f64) -> Result<(u64, String), GeoError> {
    let hash = encode_wgs84(longitude, latitude, GEO_STEP_MAX)?;
    Ok((hash.bits, hash_to_base32(hash.bits)))
}

/// Encode a coordinate with the Mercator latitude bounds at `step` bits per axis.
pub fn encode_wgs84(longitude: f64, latitude: f64, step: u8) -> Result<GeoHashBits, GeoError> {
    encode_with_ranges(LONG, MERCATOR_LAT, longitude, latitude, step)
}

fn encode_with_ranges(
    long_range: GeoRange,
    lat_range: GeoRange,
    longitude: f64,
    latitude: f64,
    step: u8,
) -> Result<GeoHashBits, GeoError> {
    if !(long_range.min..=long_range.max).contains(&longitude)
        || !(lat_range.min..=lat_range.max).contains(&latitude)
        || step == 0
        || step > 32
    {
        return Err(GeoError::OutOfRange {
            longitude,
            latitude,
        });
    }

    let cells = (1u64 << step) as f64;
    let max_cell = (1u64 << step) - 1;
    let lat_offset = (latitude - lat_range.min) / (lat_range.max - lat_range.min);
    let long_offset = (longitude - long_range.min) / (long_range.max - long_range.min);
    // The upper bound itself would land one cell past the grid.
    let lat_cell = ((lat_offset * cells) as u64).min(max_cell) as u32;
    let long_cell = ((long_offset * cells) as u64).min(max_cell) as u32;

    Ok(GeoHashBits {
        bits: interleave64(lat_cell, long_cell),
        step,
    })
}

/// Decode a hash into the cell it covers.
pub fn decode(hash: GeoHashBits) -> GeoArea {
    decode_with_ranges(LONG, MERCATOR_LAT, hash)
}

fn decode_with_ranges(long_range: GeoRange, lat_range: GeoRange, hash: GeoHashBits) -> GeoArea {
    let (lat_cell, long_cell) = deinterleave64(hash.bits);
    let cells = (1u64 << hash.step) as f64;
    let lat_scale = lat_range.max - lat_range.min;
    let long_scale = long_range.max - long_range.min;

    GeoArea {
        hash,
        latitude: GeoRange {
            min: lat_range.min + (f64::from(lat_cell) / cells) * lat_scale,
            max: lat_range.min + ((f64::from(lat_cell) + 1.0) / cells) * lat_scale,
        },
        longitude: GeoRange {
            min: long_range.min + (f64::from(long_cell) / cells) * long_scale,
            max: long_range.min + ((f64::from(long_cell) + 1.0) / cells) * long_scale,
        },
    }
}

/// Centre of the full-precision cell addressed by `hash`.
pub fn decode_to_point(hash: u64) -> GeoPoint {
    area_center(&decode(GeoHashBits {
        bits: hash,
        step: GEO_STEP_MAX,
    }))
}

fn area_center(area: &GeoArea) -> GeoPoint {
    let longitude = ((area.longitude.min + area.longitude.max) / 2.0).clamp(GEO_LONG_MIN, GEO_LONG_MAX);
    let latitude = ((area.latitude.min + area.latitude.max) / 2.0).clamp(GEO_LAT_MIN, GEO_LAT_MAX);
    GeoPoint {
        longitude,
        latitude,
    }
}

/// Render a stored hash as an 11-character geohash string.
pub fn hash_to_base32(hash: u64) -> String {
    let center = decode_to_point(hash);
    // The centre always lies inside the standard ranges.
    let bits = encode_with_ranges(
        LONG,
        STANDARD_LAT,
        center.longitude,
        center.latitude,
        GEO_STEP_MAX,
    )
    .map(|h| h.bits)
    .unwrap_or_default();

    let mut out = String::with_capacity(BASE32_LEN);
    for i in 0..BASE32_LEN {
        // 52 bits fill 10 symbols and two bits of the eleventh, which is
        // rendered as zero padding.
        let idx = if i == BASE32_LEN - 1 {
            0
        } else {
            (bits >> (52 - (i + 1) * 5)) & 0x1f
        };
        out.push(BASE32_ALPHABET[idx as usize] as char);
    }
    out
}

/// Great-circle distance in meters between two points.
pub fn distance(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let lat1r = lat1.to_radians();
    let lat2r = lat2.to_radians();
    let u = ((lat2r - lat1r) / 2.0).sin();
    let v = ((lon2 - lon1).to_radians() / 2.0).sin();
    2.0 * EARTH_RADIUS_IN_METERS * (u * u + lat1r.cos() * lat2r.cos() * v * v).sqrt().asin()
}

pub fn point_distance(a: GeoPoint, b: GeoPoint) -> f64 {
    distance(a.longitude, a.latitude, b.longitude, b.latitude)
}

/// Coarsest precision whose cells still cover `radius_meters` around `latitude`.
pub fn estimate_steps_by_radius(radius_meters: f64, latitude: f64) -> u8 {
    if radius_meters == 0.0 {
        return GEO_STEP_MAX;
    }
    let mut range = radius_meters;
    let mut step: i32 = 1;
    while range < MERCATOR_MAX {
        range *= 2.0;
        step += 1;
    }
    // Search the 8 neighbours too, so one cell can be smaller than the radius.
    step -= 2;

    // Cells shrink in longitude near the poles.
    if !(-66.0..=66.0).contains(&latitude) {
        step -= 1;
        if !(-80.0..=80.0).contains(&latitude) {
            step -= 1;
        }
    }
    step.clamp(1, i32::from(GEO_STEP_MAX)) as u8
}

/// Bounding box `[min_lon, min_lat, max_lon, max_lat]` around a point.
pub fn bounding_box(longitude: f64, latitude: f64, radius_meters: f64) -> [f64; 4] {
    let lon_r = longitude.to_radians();
    let lat_r = latitude.to_radians();
    let lon_delta = radius_meters / EARTH_RADIUS_IN_METERS / lat_r.cos();
    let lat_delta = radius_meters / EARTH_RADIUS_IN_METERS;
    [
        (lon_r - lon_delta).to_degrees(),
        (lat_r - lat_delta).to_degrees(),
        (lon_r + lon_delta).to_degrees(),
        (lat_r + lat_delta).to_degrees(),
    ]
}

fn move_x(hash: &mut GeoHashBits, direction: i8) {
    if direction == 0 {
        return;
    }
    let shift = 64 - u32::from(hash.step) * 2;
    let mut x = hash.bits & 0xaaaa_aaaa_aaaa_aaaa;
    let y = hash.bits & 0x5555_5555_5555_5555;
    let zz = 0x5555_5555_5555_5555u64 >> shift;
    if direction > 0 {
        x = x.wrapping_add(zz + 1);
    } else {
        x |= zz;
        x = x.wrapping_sub(zz + 1);
    }
    x &= 0xaaaa_aaaa_aaaa_aaaau64 >> shift;
    hash.bits = x | y;
}

fn move_y(hash: &mut GeoHashBits, direction: i8) {
    if direction == 0 {
        return;
    }
    let shift = 64 - u32::from(hash.step) * 2;
    let x = hash.bits & 0xaaaa_aaaa_aaaa_aaaa;
    let mut y = hash.bits & 0x5555_5555_5555_5555;
    let zz = 0xaaaa_aaaa_aaaa_aaaau64 >> shift;
    if direction > 0 {
        y = y.wrapping_add(zz + 1);
    } else {
        y |= zz;
        y = y.wrapping_sub(zz + 1);
    }
    y &= 0x5555_5555_5555_5555u64 >> shift;
    hash.bits = x | y;
}

fn shifted(hash: GeoHashBits, dx: i8, dy: i8) -> GeoHashBits {
    let mut out = hash;
    move_x(&mut out, dx);
    move_y(&mut out, dy);
    out
}

/// The eight cells surrounding `hash` at the same precision.
pub fn neighbors(hash: GeoHashBits) -> GeoNeighbors {
    GeoNeighbors {
        east: shifted(hash, 1, 0),
        west: shifted(hash, -1, 0),
        south: shifted(hash, 0, -1),
        north: shifted(hash, 0, 1),
        north_west: shifted(hash, -1, 1),
        south_west: shifted(hash, -1, -1),
        north_east: shifted(hash, 1, 1),
        south_east: shifted(hash, 1, -1),
    }
}

/// Cells to scan for members within `radius_meters` of a point: the centre
/// cell followed by the neighbours that can still intersect the radius.
pub fn radius_areas(
    longitude: f64,
    latitude: f64,
    radius_meters: f64,
) -> Result<Vec<GeoHashBits>, GeoError> {
    let [min_lon, min_lat, max_lon, max_lat] = bounding_box(longitude, latitude, radius_meters);
    let mut steps = estimate_steps_by_radius(radius_meters, latitude);
    let mut hash = encode_wgs84(longitude, latitude, steps)?;
    let mut around = neighbors(hash);

    // If the radius reaches past a neighbour cell the scan would miss points,
    // so fall back one step when that happens.
    let north = decode(around.north);
    let south = decode(around.south);
    let east = decode(around.east);
    let west = decode(around.west);
    let reaches_past = distance(longitude, latitude, longitude, north.latitude.max) < radius_meters
        || distance(longitude, latitude, longitude, south.latitude.min) < radius_meters
        || distance(longitude, latitude, east.longitude.max, latitude) < radius_meters
        || distance(longitude, latitude, west.longitude.min, latitude) < radius_meters;
    if steps > 1 && reaches_past {
        steps -= 1;
        hash = encode_wgs84(longitude, latitude, steps)?;
        around = neighbors(hash);
    }

    let area = decode(hash);
    if steps >= 2 {
        let zero = GeoHashBits::default();
        if area.latitude.min < min_lat {
            around.south = zero;
            around.south_west = zero;
            around.south_east = zero;
        }
        if area.latitude.max > max_lat {
            around.north = zero;
            around.north_east = zero;
            around.north_west = zero;
        }
        if area.longitude.min < min_lon {
            around.west = zero;
            around.south_west = zero;
            around.north_west = zero;
        }
        if area.longitude.max > max_lon {
            around.east = zero;
            around.south_east = zero;
            around.north_east = zero;
        }
    }

    let candidates = [
        hash,
        around.north,
        around.south,
        around.east,
        around.west,
        around.north_east,
        around.north_west,
        around.south_east,
        around.south_west,
    ];
    let mut out: Vec<GeoHashBits> = Vec::with_capacity(candidates.len());
    for cell in candidates {
        // At coarse steps the grid wraps and neighbours can repeat.
        if cell.is_zero() || out.contains(&cell) {
            continue;
        }
        out.push(cell);
    }
    Ok(out)
}

fn spread(value: u32) -> u64 {
    let mut x = u64::from(value);
    x = (x | (x << 16)) & 0x0000_ffff_0000_ffff;
    x = (x | (x << 8)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    (x | (x << 1)) & 0x5555_5555_5555_5555
}

fn squash(value: u64) -> u32 {
    let mut x = value & 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x >> 4)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x >> 8)) & 0x0000_ffff_0000_ffff;
    x = (x | (x >> 16)) & 0x0000_0000_ffff_ffff;
    x as u32
}

/// Latitude bits land on even positions, longitude bits on odd positions.
fn interleave64(lat_cell: u32, long_cell: u32) -> u64 {
    spread(lat_cell) | (spread(long_cell) << 1)
}

fn deinterleave64(bits: u64) -> (u32, u32) {
    (squash(bits), squash(bits >> 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Place {
        name: &'static str,
        lon: f64,
        lat: f64,
        hash: u64,
        base32: &'static str,
    }

    const PLACES: &[Place] = &[
        Place { name: "Tian An Men Square", lon: 116.39763057232, lat: 39.905637761392, hash: 4069885364411786, base32: "wx4g08w5jm0" },
        Place { name: "The Great Wall", lon: 116.02002181113, lat: 40.359759768836, hash: 4069895257856587, base32: "wx4t8570wk0" },
        Place { name: "The Palace Museum", lon: 116.39715582132, lat: 39.916345328893, hash: 4069885548623625, base32: "wx4g0dtcd60" },
        Place { name: "The Summer Palace", lon: 116.27552270889, lat: 39.999886103047, hash: 4069880322548821, base32: "wx4etcv20p0" },
        Place { name: "Great Hall of the people", lon: 116.3939423, lat: 39.9050003, hash: 4069885362257819, base32: "wx4g087rrr0" },
        Place { name: "Terracotta Warriors and Horses", lon: 109.274127, lat: 34.384972, hash: 4040142446455543, base32: "wqjewedfzx0" },
        Place { name: "West Lake", lon: 120.094491, lat: 30.150197, hash: 4054121678641499, base32: "wtm7sbdjsk0" },
        Place { name: "Hainan ends of the earth", lon: 109.205175, lat: 18.173128, hash: 3974157332439237, base32: "w7jxmh2f1h0" },
        Place { name: "Pearl of the Orient", lon: 121.49491, lat: 31.24169, hash: 4054803515096369, base32: "wtw3sxmuh80" },
        Place { name: "Buckingham Palace", lon: -0.83279, lat: 51.30387, hash: 2163507521029941, base32: "gcp7v59ddw0" },
        Place { name: "Taj Mahal", lon: 78.23188, lat: 27.102839, hash: 3631332645702463, base32: "tszdhjytqz0" },
        Place { name: "Sydney Opera House", lon: 151.12541, lat: -33.512513, hash: 3252040564825549, base32: "r653qgnpmq0" },
        Place { name: "Pyramids", lon: 31.8506, lat: 29.584341, hash: 3491552924055853, base32: "stq8kc8vkb0" },
        Place { name: "Statue of Liberty", lon: -74.24038, lat: 40.412148, hash: 1791816099668153, base32: "dr5jysgccf0" },
        Place { name: "Mount Everest", lon: 86.9221941736, lat: 27.9782502279, hash: 3639839274149119, base32: "tuvz1vqc1g0" },
    ];

    #[test]
    fn encode_matches_known_hashes() {
        for place in PLACES {
            let (hash, base32) = encode(place.lon, place.lat).expect("encode");
            assert_eq!(hash, place.hash, "hash of {}", place.name);
            assert_eq!(base32, place.base32, "base32 of {}", place.name);
        }
    }

    #[test]
    fn encode_is_deterministic() {
        let first = encode(116.39763057232, 39.905637761392).expect("encode");
        for _ in 0..16 {
            assert_eq!(encode(116.39763057232, 39.905637761392).expect("encode"), first);
        }
    }

    #[test]
    fn base32_derives_from_hash_bits() {
        for place in PLACES {
            assert_eq!(hash_to_base32(place.hash), place.base32);
        }
    }

    #[test]
    fn decode_round_trips_within_quantization() {
        for place in PLACES {
            let point = decode_to_point(place.hash);
            assert!((point.longitude - place.lon).abs() < 0.0001, "{}", place.name);
            assert!((point.latitude - place.lat).abs() < 0.0001, "{}", place.name);
        }
    }

    #[test]
    fn distance_between_decoded_points() {
        let tian = decode_to_point(4069885364411786);
        let wall = decode_to_point(4069895257856587);
        let hall = decode_to_point(4069885362257819);
        let museum = decode_to_point(4069885548623625);
        assert!((point_distance(tian, wall) - 59853.4742).abs() < 0.5);
        assert!((point_distance(tian, hall) - 322.7538).abs() < 0.5);
        assert!((point_distance(tian, museum) - 1191.8406).abs() < 0.5);
        assert!((point_distance(tian, wall) / 1000.0 - 59.8534742).abs() < 0.0005);
    }

    #[test]
    fn distance_is_symmetric_and_bounded() {
        let d = distance(0.0, 0.0, 180.0, 0.0);
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_IN_METERS).abs() < 0.5);
        assert_eq!(distance(10.0, 20.0, 30.0, 40.0), distance(30.0, 40.0, 10.0, 20.0));
        assert_eq!(distance(10.0, 20.0, 10.0, 20.0), 0.0);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(encode(181.0, 0.0).is_err());
        assert!(encode(0.0, 86.0).is_err());
        assert!(encode(-180.0, -85.05112878).is_ok());
    }

    #[test]
    fn neighbours_are_adjacent_cells() {
        let hash = encode_wgs84(116.39763057232, 39.905637761392, 10).expect("encode");
        let area = decode(hash);
        let around = neighbors(hash);
        let north = decode(around.north);
        let east = decode(around.east);
        assert!((north.latitude.min - area.latitude.max).abs() < 1e-9);
        assert!((east.longitude.min - area.longitude.max).abs() < 1e-9);
        assert_eq!(decode(around.south).latitude.max, area.latitude.min);
        assert_eq!(decode(around.west).longitude.max, area.longitude.min);
    }

    #[test]
    fn radius_cells_cover_nearby_points() {
        let center = decode_to_point(4069885364411786);
        let cells = radius_areas(center.longitude, center.latitude, 88282.0).expect("areas");
        assert!(!cells.is_empty());
        for place in &PLACES[..5] {
            let covered = cells.iter().any(|cell| {
                let (min, max) = cell.score_range();
                place.hash >= min && place.hash < max
            });
            assert!(covered, "{} should fall in a scanned cell", place.name);
        }
    }

    #[test]
    fn units_parse_case_insensitively() {
        assert_eq!(DistanceUnit::parse("KM").expect("unit"), DistanceUnit::Kilometers);
        assert_eq!(DistanceUnit::parse("mi").expect("unit").factor(), 1609.34);
        assert!(DistanceUnit::parse("yd").is_err());
    }
}
