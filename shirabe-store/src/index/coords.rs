use shirabe_core::search_param::{split_escaped, unescape};
use shirabe_core::{Result, SearchError};

use super::IndexTable;
use crate::sql::{BinaryOp, Condition, SearchQueryBuilder, TableRef};

pub const COORDS_TABLE: &str = "hfj_spidx_coords";

const KM_PER_DEGREE: f64 = 111.0;
const KM_PER_MILE: f64 = 1.609_344;

/// `near=latitude|longitude|distance|units`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub distance_km: f64,
}

impl NearQuery {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<String> = split_escaped(raw, '|').iter().map(|p| unescape(p)).collect();
        let invalid = || {
            SearchError::invalid(format!(
                "Invalid position format '{raw}'. Required format is 'latitude|longitude' or 'latitude|longitude|distance|units'"
            ))
        };
        let number = |idx: usize| -> Result<Option<f64>> {
            match parts.get(idx).map(|p| p.trim()).filter(|p| !p.is_empty()) {
                Some(p) => p.parse().map(Some).map_err(|_| invalid()),
                None => Ok(None),
            }
        };
        let latitude = number(0)?.ok_or_else(invalid)?;
        let longitude = number(1)?.ok_or_else(invalid)?;
        let distance = number(2)?.unwrap_or(0.0);
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) || distance < 0.0 {
            return Err(invalid());
        }
        let distance_km = match parts.get(3).map(|u| u.trim()) {
            None | Some("") | Some("km") => distance,
            Some("mi") | Some("[mi_us]") => distance * KM_PER_MILE,
            Some(other) => {
                return Err(SearchError::invalid(format!(
                    "Invalid distance units \"{other}\" for near parameter; use km or mi"
                )));
            }
        };
        Ok(Self {
            latitude,
            longitude,
            distance_km,
        })
    }
}

pub struct CoordsIndex {
    table: TableRef,
}

impl IndexTable for CoordsIndex {
    const TABLE_NAME: &'static str = COORDS_TABLE;

    fn table(&self) -> TableRef {
        self.table
    }
}

impl CoordsIndex {
    pub fn new(table: TableRef) -> Self {
        Self { table }
    }

    /// Bounding box around the point; zero distance means an exact match
    pub fn near_predicate(&self, sql: &mut SearchQueryBuilder, near: &NearQuery) -> Condition {
        let latitude = self.table.column("sp_latitude");
        let longitude = self.table.column("sp_longitude");
        if near.distance_km == 0.0 {
            let lat = sql.bind(near.latitude);
            let lon = sql.bind(near.longitude);
            return Condition::And(vec![Condition::eq(latitude, lat), Condition::eq(longitude, lon)]);
        }
        let lat_delta = near.distance_km / KM_PER_DEGREE;
        let lon_delta = near.distance_km / (KM_PER_DEGREE * near.latitude.to_radians().cos().abs().max(1e-6));
        let mut compare = |column, op, bound: f64| {
            let placeholder = sql.bind(bound);
            Condition::compare(column, op, placeholder)
        };
        Condition::And(vec![
            compare(latitude, BinaryOp::Ge, near.latitude - lat_delta),
            compare(latitude, BinaryOp::Le, near.latitude + lat_delta),
            compare(longitude, BinaryOp::Ge, near.longitude - lon_delta),
            compare(longitude, BinaryOp::Le, near.longitude + lon_delta),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_near() {
        let near = NearQuery::parse("42.25|-83.69|10|mi").unwrap();
        assert_eq!(near.latitude, 42.25);
        assert!((near.distance_km - 16.09344).abs() < 1e-9);
        assert_eq!(NearQuery::parse("1|2").unwrap().distance_km, 0.0);
    }

    #[test]
    fn test_parse_near_rejects_bad_values() {
        assert!(NearQuery::parse("abc").is_err());
        assert!(NearQuery::parse("91|0").is_err());
        assert!(NearQuery::parse("1|2|5|parsec").is_err());
    }
}
