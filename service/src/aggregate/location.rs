//! Geographic distribution of nodes.

use super::source::LocationRecord;
use super::{AggregationUnit, MetricKind, MetricPayload, UnitContext};
use crate::cache_set::CacheSetId;
use crate::window::Window;
use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRow {
    pub continent: String,
    pub country: String,
    pub city: String,
    pub ip: String,
    pub isp: String,
    pub lat: String,
    pub lon: String,
    pub node_count: u64,
}

/// Vantage point id inside a continent; unknown continents
/// are looked up from North America.
fn vantage_for_continent(continent: &str) -> &'static str {
    match continent {
        "Europe" => "eu",
        "Asia" => "sg",
        _ => "na",
    }
}

/// Group continent → country → city → ip → isp.
///
/// An ip looked up from several vantage points keeps only the lookups made
/// from inside its own continent, when there are any.
pub fn aggregate_locations(records: &[LocationRecord]) -> Vec<LocationRow> {
    let mut by_ip: BTreeMap<(&str, &str, &str, &str), Vec<&LocationRecord>> = BTreeMap::new();
    for record in records {
        by_ip
            .entry((
                record.continent.as_str(),
                record.country.as_str(),
                record.city.as_str(),
                record.ip.as_str(),
            ))
            .or_default()
            .push(record);
    }

    let mut rows = Vec::new();
    for ((continent, country, city, ip), lookups) in by_ip {
        let local = vantage_for_continent(continent);
        let has_local = lookups.iter().any(|lookup| lookup.ran_from == local);
        let lookups: Vec<&LocationRecord> = if has_local {
            lookups
                .into_iter()
                .filter(|lookup| lookup.ran_from == local)
                .collect()
        } else {
            lookups
        };

        let mut by_isp: BTreeMap<&str, Vec<&LocationRecord>> = BTreeMap::new();
        for lookup in lookups {
            by_isp.entry(lookup.isp.as_str()).or_default().push(lookup);
        }
        for (isp, group) in by_isp {
            let first = group[0];
            rows.push(LocationRow {
                continent: continent.to_string(),
                country: country.to_string(),
                city: city.to_string(),
                ip: ip.to_string(),
                isp: isp.to_string(),
                lat: first.lat.clone(),
                lon: first.lon.clone(),
                node_count: group.len() as u64,
            });
        }
    }
    rows
}

pub struct LocationUnit {
    ctx: UnitContext,
}

impl LocationUnit {
    pub fn new(ctx: UnitContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl AggregationUnit for LocationUnit {
    fn kind(&self) -> MetricKind {
        MetricKind::Location
    }

    async fn compute_and_persist(&self, cache_set: CacheSetId, window: Window) -> Result<bool> {
        let started = Instant::now();
        let members = self.ctx.members(cache_set, window)?;
        let records = self.ctx.source.locations(&members).await?;
        let rows = aggregate_locations(&records);
        Ok(self
            .ctx
            .persist(cache_set, window, MetricPayload::Location(rows), started)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::fixture;
    use crate::test_utils::temp_dir;

    fn lookup(address: &str, continent: &str, ip: &str, isp: &str, ran_from: &str) -> LocationRecord {
        LocationRecord {
            address: address.to_string(),
            ip: ip.to_string(),
            continent: continent.to_string(),
            country: "DE".to_string(),
            city: "Berlin".to_string(),
            isp: isp.to_string(),
            lat: format!("{ran_from}-lat"),
            lon: "13.4".to_string(),
            ran_from: ran_from.to_string(),
        }
    }

    #[test]
    fn local_vantage_lookups_win() {
        let rows = aggregate_locations(&[
            lookup("a", "Europe", "10.0.0.1", "hetzner", "eu"),
            lookup("a", "Europe", "10.0.0.1", "hetzner", "na"),
            lookup("b", "Europe", "10.0.0.1", "hetzner", "eu"),
        ]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].node_count, 2);
        assert_eq!(rows[0].lat, "eu-lat");
    }

    #[tokio::test]
    async fn unit_groups_member_lookups() {
        let dir = temp_dir("location-unit");
        let fx = fixture(&["a"], &dir);
        fx.source.push_locations([
            lookup("a", "Asia", "10.0.0.3", "linode", "sg"),
            lookup("z", "Asia", "10.0.0.4", "linode", "sg"),
        ]);
        let unit = LocationUnit::new(fx.ctx.clone());
        let window = Window::starting_at(850, 50);

        assert!(unit.compute_and_persist(fx.cache_set, window).await.unwrap());
        let stored = fx
            .ctx
            .results
            .get(MetricKind::Location, fx.cache_set, 50, window)
            .expect("stored");
        let MetricPayload::Location(rows) = stored.payload else {
            panic!("unexpected payload {:?}", stored.payload);
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ip, "10.0.0.3");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn remote_lookups_kept_without_local_ones() {
        let rows = aggregate_locations(&[
            lookup("a", "Oceania", "10.0.0.2", "aws", "sg"),
            lookup("b", "Oceania", "10.0.0.2", "ovh", "eu"),
        ]);
        let isps: Vec<(&str, u64)> = rows
            .iter()
            .map(|row| (row.isp.as_str(), row.node_count))
            .collect();
        assert_eq!(isps, vec![("aws", 1), ("ovh", 1)]);
    }
}
