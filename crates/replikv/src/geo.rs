//! Geo commands on top of the sorted-set layout.
//!
//! A geo key stores each member twice: `member -> score` and an empty
//! `(score, member)` entry, where the score is the member's 52-bit geohash.
//! Radius queries scan the score ranges of the cells around the centre and
//! then filter by true distance.

use replikv_geo::{DistanceUnit, GeoPoint};

use crate::codec;
use crate::command::{Command, HandlerCtx, Reply};
use crate::engine::{Partition, WriteBatch};
use crate::error::KvError;

fn member_score(
    ctx: &HandlerCtx<'_>,
    pk: &[u8],
    member: &[u8],
    batch: &WriteBatch,
) -> Result<Option<u64>, KvError> {
    let key = codec::encode_zset_member_key(pk, member);
    match ctx.store.get_in(batch, Partition::Data, &key)? {
        Some(raw) => {
            let bytes: [u8; 8] = raw
                .as_slice()
                .try_into()
                .map_err(|_| KvError::Decode("corrupt geo score".to_string()))?;
            Ok(Some(u64::from_be_bytes(bytes)))
        }
        None => Ok(None),
    }
}

fn format_coord(value: f64) -> Reply {
    Reply::bulk(value.to_string())
}

fn format_distance(meters: f64, unit: DistanceUnit) -> Reply {
    Reply::bulk(format!("{:.4}", meters / unit.factor()))
}

pub fn geoadd(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    if (cmd.args.len() - 1) % 3 != 0 {
        return Err(KvError::wrong_args(&cmd.name));
    }
    let pk = cmd.pk();
    // Validate every triple before touching the batch.
    let mut members = Vec::with_capacity((cmd.args.len() - 1) / 3);
    for base in (1..cmd.args.len()).step_by(3) {
        let longitude = cmd.arg_f64(base)?;
        let latitude = cmd.arg_f64(base + 1)?;
        let (score, _) = replikv_geo::encode(longitude, latitude)?;
        members.push((score, &cmd.args[base + 2]));
    }

    let mut added = 0;
    for (score, member) in members {
        match member_score(ctx, pk, member, batch)? {
            Some(old) if old == score => continue,
            Some(old) => {
                batch.delete(Partition::Data, codec::encode_zset_score_key(pk, old, member));
            }
            None => added += 1,
        }
        batch.put(
            Partition::Data,
            codec::encode_zset_member_key(pk, member),
            score.to_be_bytes().to_vec(),
        );
        batch.put(Partition::Data, codec::encode_zset_score_key(pk, score, member), Vec::new());
    }
    Ok(Reply::Int(added))
}

pub fn geohash(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let pk = cmd.pk();
    let mut out = Vec::with_capacity(cmd.args.len().saturating_sub(1));
    for member in &cmd.args[1..] {
        out.push(match member_score(ctx, pk, member, batch)? {
            Some(score) => Reply::bulk(replikv_geo::hash_to_base32(score)),
            None => Reply::Nil,
        });
    }
    Ok(Reply::Array(out))
}

pub fn geopos(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let pk = cmd.pk();
    let mut out = Vec::with_capacity(cmd.args.len().saturating_sub(1));
    for member in &cmd.args[1..] {
        out.push(match member_score(ctx, pk, member, batch)? {
            Some(score) => {
                let point = replikv_geo::decode_to_point(score);
                Reply::Array(vec![format_coord(point.longitude), format_coord(point.latitude)])
            }
            None => Reply::Nil,
        });
    }
    Ok(Reply::Array(out))
}

pub fn geodist(ctx: &HandlerCtx<'_>, cmd: &Command, batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let unit = match cmd.args.len() {
        3 => DistanceUnit::Meters,
        4 => DistanceUnit::parse(cmd.arg_str(3)?)?,
        _ => return Err(KvError::wrong_args(&cmd.name)),
    };
    let pk = cmd.pk();
    let (Some(a), Some(b)) = (
        member_score(ctx, pk, &cmd.args[1], batch)?,
        member_score(ctx, pk, &cmd.args[2], batch)?,
    ) else {
        return Ok(Reply::Nil);
    };
    let meters = replikv_geo::point_distance(
        replikv_geo::decode_to_point(a),
        replikv_geo::decode_to_point(b),
    );
    Ok(format_distance(meters, unit))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SortOrder {
    Unsorted,
    Asc,
    Desc,
}

#[derive(Debug)]
struct RadiusOptions {
    with_coord: bool,
    with_dist: bool,
    with_hash: bool,
    count: Option<usize>,
    sort: SortOrder,
}

impl RadiusOptions {
    fn parse(cmd: &Command, start: usize) -> Result<Self, KvError> {
        let mut opts = RadiusOptions {
            with_coord: false,
            with_dist: false,
            with_hash: false,
            count: None,
            sort: SortOrder::Unsorted,
        };
        let mut idx = start;
        while idx < cmd.args.len() {
            let arg = cmd.arg_str(idx)?.to_ascii_lowercase();
            match arg.as_str() {
                "withcoord" => opts.with_coord = true,
                "withdist" => opts.with_dist = true,
                "withhash" => opts.with_hash = true,
                "asc" => opts.sort = SortOrder::Asc,
                "desc" => opts.sort = SortOrder::Desc,
                "count" => {
                    idx += 1;
                    let count = cmd.arg_i64(idx)?;
                    if count <= 0 {
                        return Err(KvError::InvalidCommand("COUNT must be > 0".to_string()));
                    }
                    opts.count = Some(count as usize);
                }
                other => {
                    return Err(KvError::InvalidCommand(format!("syntax error near '{other}'")));
                }
            }
            idx += 1;
        }
        // Truncating an unsorted result would pick arbitrary members.
        if opts.count.is_some() && opts.sort == SortOrder::Unsorted {
            opts.sort = SortOrder::Asc;
        }
        Ok(opts)
    }
}

struct Hit {
    member: Vec<u8>,
    score: u64,
    distance: f64,
    point: GeoPoint,
}

fn radius_search(
    ctx: &HandlerCtx<'_>,
    pk: &[u8],
    center: GeoPoint,
    radius_meters: f64,
) -> Result<Vec<Hit>, KvError> {
    let prefix = codec::zset_score_prefix(pk);
    let mut hits = Vec::new();
    for cell in replikv_geo::radius_areas(center.longitude, center.latitude, radius_meters)? {
        let (min, max) = cell.score_range();
        let mut start = prefix.clone();
        start.extend_from_slice(&min.to_be_bytes());
        let mut end = prefix.clone();
        end.extend_from_slice(&max.to_be_bytes());
        ctx.store.scan(Partition::Data, &start, Some(&end), false, |key, _| {
            let (score, member) = codec::decode_zset_score_key(key)?;
            let point = replikv_geo::decode_to_point(score);
            let distance = replikv_geo::point_distance(center, point);
            if distance <= radius_meters {
                hits.push(Hit {
                    member,
                    score,
                    distance,
                    point,
                });
            }
            Ok(true)
        })?;
    }
    Ok(hits)
}

fn radius_reply(mut hits: Vec<Hit>, unit: DistanceUnit, opts: &RadiusOptions) -> Reply {
    match opts.sort {
        SortOrder::Asc => hits.sort_by(|a, b| a.distance.total_cmp(&b.distance)),
        SortOrder::Desc => hits.sort_by(|a, b| b.distance.total_cmp(&a.distance)),
        SortOrder::Unsorted => {}
    }
    if let Some(count) = opts.count {
        hits.truncate(count);
    }
    let plain = !(opts.with_coord || opts.with_dist || opts.with_hash);
    let items = hits
        .into_iter()
        .map(|hit| {
            if plain {
                return Reply::Bulk(hit.member);
            }
            let mut item = vec![Reply::Bulk(hit.member)];
            if opts.with_dist {
                item.push(format_distance(hit.distance, unit));
            }
            if opts.with_hash {
                item.push(Reply::bulk(hit.score.to_string()));
            }
            if opts.with_coord {
                item.push(Reply::Array(vec![
                    format_coord(hit.point.longitude),
                    format_coord(hit.point.latitude),
                ]));
            }
            Reply::Array(item)
        })
        .collect();
    Reply::Array(items)
}

/// `GEORADIUS key longitude latitude radius unit [options]`
pub fn georadius(ctx: &HandlerCtx<'_>, cmd: &Command, _batch: &mut WriteBatch) -> Result<Reply, KvError> {
    let longitude = cmd.arg_f64(1)?;
    let latitude = cmd.arg_f64(2)?;
    // Reject centres that cannot be hashed before scanning anything.
    replikv_geo::encode(longitude, latitude)?;
    let radius = cmd.arg_f64(3)?;
    let unit = DistanceUnit::parse(cmd.arg_str(4)?)?;
    if radius < 0.0 {
        return Err(KvError::InvalidCommand("radius cannot be negative".to_string()));
    }
    let opts = RadiusOptions::parse(cmd, 5)?;
    let hits = radius_search(ctx, cmd.pk(), GeoPoint::new(longitude, latitude), radius * unit.factor())?;
    Ok(radius_reply(hits, unit, &opts))
}

/// `GEORADIUSBYMEMBER key member radius unit [options]`
pub fn georadiusbymember(
    ctx: &HandlerCtx<'_>,
    cmd: &Command,
    batch: &mut WriteBatch,
) -> Result<Reply, KvError> {
    let radius = cmd.arg_f64(2)?;
    let unit = DistanceUnit::parse(cmd.arg_str(3)?)?;
    if radius < 0.0 {
        return Err(KvError::InvalidCommand("radius cannot be negative".to_string()));
    }
    let opts = RadiusOptions::parse(cmd, 4)?;
    let Some(score) = member_score(ctx, cmd.pk(), &cmd.args[1], batch)? else {
        return Err(KvError::InvalidCommand(
            "could not decode requested zset member".to_string(),
        ));
    };
    let center = replikv_geo::decode_to_point(score);
    let hits = radius_search(ctx, cmd.pk(), center, radius * unit.factor())?;
    Ok(radius_reply(hits, unit, &opts))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::command::CommandRouter;
    use crate::engine::KvStore;
    use crate::index::IndexManager;

    const BEIJING: &[(&str, &str, &str)] = &[
        ("116.39763057232", "39.905637761392", "Tian An Men Square"),
        ("116.02002181113", "40.359759768836", "The Great Wall"),
        ("116.39715582132", "39.916345328893", "The Palace Museum"),
        ("116.27552270889", "39.999886103047", "The Summer Palace"),
        ("116.3939423", "39.9050003", "Great Hall of the people"),
    ];

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<KvStore>,
        indexes: IndexManager,
        router: CommandRouter,
    }

    impl Fixture {
        fn with_beijing() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let store = Arc::new(KvStore::open(dir.path().join("ns")).expect("open"));
            let indexes = IndexManager::new(store.clone());
            let fx = Self {
                _dir: dir,
                store,
                indexes,
                router: CommandRouter::new(),
            };
            let mut args = vec!["geoadd", "places:beijing"];
            for &(lon, lat, name) in BEIJING {
                args.extend_from_slice(&[lon, lat, name]);
            }
            assert_eq!(fx.run(&args).expect("geoadd"), Reply::Int(5));
            fx
        }

        fn run(&self, parts: &[&str]) -> Result<Reply, KvError> {
            let cmd = Command::new(parts[0], parts[1..].iter().map(|p| p.as_bytes().to_vec()).collect());
            let ctx = HandlerCtx {
                store: &self.store,
                indexes: &self.indexes,
            };
            let mut batch = WriteBatch::new();
            let reply = self.router.dispatch(&ctx, &cmd, &mut batch)?;
            self.store.commit(batch)?;
            Ok(reply)
        }
    }

    fn text(reply: &Reply) -> String {
        match reply {
            Reply::Bulk(v) => String::from_utf8_lossy(v).to_string(),
            other => panic!("expected bulk, got {other:?}"),
        }
    }

    fn names(reply: Reply) -> Vec<String> {
        match reply {
            Reply::Array(items) => items
                .iter()
                .map(|item| match item {
                    Reply::Array(parts) => text(&parts[0]),
                    other => text(other),
                })
                .collect(),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn geoadd_counts_only_new_members() {
        let fx = Fixture::with_beijing();
        let again = fx
            .run(&["geoadd", "places:beijing", "116.0", "40.0", "The Great Wall", "1", "1", "new"])
            .expect("geoadd");
        assert_eq!(again, Reply::Int(1));
        let pos = fx.run(&["geopos", "places:beijing", "The Great Wall"]).expect("geopos");
        let Reply::Array(items) = pos else { panic!("array") };
        let Reply::Array(coords) = &items[0] else { panic!("coords") };
        let lon: f64 = text(&coords[0]).parse().expect("lon");
        assert!((lon - 116.0).abs() < 1e-5);

        // The moved member must no longer be found at its old location.
        let near_wall = fx
            .run(&["georadius", "places:beijing", "116.02002181113", "40.359759768836", "1", "km"])
            .expect("georadius");
        assert_eq!(names(near_wall), Vec::<String>::new());
    }

    #[test]
    fn geoadd_rejects_bad_coordinates_atomically() {
        let fx = Fixture::with_beijing();
        let err = fx
            .run(&["geoadd", "places:beijing", "1", "1", "ok", "200", "10", "bad"])
            .expect_err("out of range");
        assert!(matches!(err, KvError::InvalidCommand(_)));
        let pos = fx.run(&["geopos", "places:beijing", "ok"]).expect("geopos");
        assert_eq!(pos, Reply::Array(vec![Reply::Nil]));
    }

    #[test]
    fn geohash_and_geodist() {
        let fx = Fixture::with_beijing();
        let hashes = fx
            .run(&["geohash", "places:beijing", "Tian An Men Square", "missing"])
            .expect("geohash");
        assert_eq!(hashes, Reply::Array(vec![Reply::bulk("wx4g08w5jm0"), Reply::Nil]));

        let meters = fx
            .run(&["geodist", "places:beijing", "Tian An Men Square", "Great Hall of the people"])
            .expect("geodist");
        let meters: f64 = text(&meters).parse().expect("float");
        assert!((meters - 322.7538).abs() < 0.01, "{meters}");

        let km = fx
            .run(&["geodist", "places:beijing", "Tian An Men Square", "The Great Wall", "km"])
            .expect("geodist km");
        let km: f64 = text(&km).parse().expect("float");
        assert!((km - 59.8535).abs() < 0.01, "{km}");

        let missing = fx
            .run(&["geodist", "places:beijing", "Tian An Men Square", "missing"])
            .expect("geodist");
        assert_eq!(missing, Reply::Nil);
        assert!(fx
            .run(&["geodist", "places:beijing", "a", "b", "parsecs"])
            .is_err());
    }

    #[test]
    fn georadiusbymember_sorts_and_limits() {
        let fx = Fixture::with_beijing();
        let asc = fx
            .run(&[
                "georadiusbymember",
                "places:beijing",
                "Tian An Men Square",
                "88282",
                "m",
                "WITHDIST",
                "ASC",
            ])
            .expect("asc");
        let Reply::Array(items) = &asc else { panic!("array") };
        let expected = [
            ("Tian An Men Square", 0.0),
            ("Great Hall of the people", 322.7538),
            ("The Palace Museum", 1191.84),
            ("The Summer Palace", 14774.67),
            ("The Great Wall", 59853.47),
        ];
        assert_eq!(items.len(), expected.len());
        for (item, (name, dist)) in items.iter().zip(expected) {
            let Reply::Array(parts) = item else { panic!("item") };
            assert_eq!(text(&parts[0]), name);
            let got: f64 = text(&parts[1]).parse().expect("dist");
            assert!((got - dist).abs() < 0.5, "{name}: {got}");
        }

        let desc = fx
            .run(&["georadiusbymember", "places:beijing", "Tian An Men Square", "88282", "m", "DESC"])
            .expect("desc");
        let mut reversed = names(asc);
        reversed.reverse();
        assert_eq!(names(desc), reversed);

        let top = fx
            .run(&[
                "georadiusbymember",
                "places:beijing",
                "Tian An Men Square",
                "88282",
                "m",
                "WITHDIST",
                "ASC",
                "COUNT",
                "3",
            ])
            .expect("count");
        let Reply::Array(items) = &top else { panic!("array") };
        let expected = [
            ("Tian An Men Square", 0.0),
            ("Great Hall of the people", 322.7538),
            ("The Palace Museum", 1191.8406),
        ];
        assert_eq!(items.len(), expected.len());
        for (item, (name, dist)) in items.iter().zip(expected) {
            let Reply::Array(parts) = item else { panic!("item") };
            assert_eq!(text(&parts[0]), name);
            let got: f64 = text(&parts[1]).parse().expect("dist");
            assert!((got - dist).abs() < 0.01, "{name}: {got}");
        }
    }

    #[test]
    fn georadius_with_hash_and_coord() {
        let fx = Fixture::with_beijing();
        let reply = fx
            .run(&[
                "georadius",
                "places:beijing",
                "116.39763057232",
                "39.905637761392",
                "1",
                "km",
                "WITHHASH",
                "WITHCOORD",
                "ASC",
            ])
            .expect("georadius");
        let Reply::Array(items) = reply else { panic!("array") };
        assert_eq!(items.len(), 2);
        let Reply::Array(first) = &items[0] else { panic!("item") };
        assert_eq!(text(&first[0]), "Tian An Men Square");
        assert_eq!(text(&first[1]), "4069885364411786");
        let Reply::Array(coords) = &first[2] else { panic!("coords") };
        let lat: f64 = text(&coords[1]).parse().expect("lat");
        assert!((lat - 39.905637761392).abs() < 1e-5);

        let missing = fx
            .run(&["georadiusbymember", "places:beijing", "nope", "1", "km"])
            .expect_err("unknown member");
        assert!(matches!(missing, KvError::InvalidCommand(_)));
    }
}
