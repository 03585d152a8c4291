//! Shared-zone arbitration
//!
//! Several zone loops may drive the same physical fan zone. Each cycle their
//! wishes are collected into a [`DemandTable`] and the arbiter turns them into
//! at most one `set_level` per physical zone:
//!
//! - among demands whose zone is at or above its own `min_temp`, the highest level wins;
//! - if no zone is that warm, the lowest level of all demands wins.
//!
//! Ties go to the demand recorded first.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};
use zf_error::{Result, ZonefanError};

/// Anything that can set the level of a physical zone
pub trait FanLevelControl {
    fn set_level(&self, zone: u8, level: u8) -> Result<()>;
}

/// One controller's wish for a physical zone in the current cycle
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneDemand {
    pub controller_name: String,
    pub desired_level: u8,
    pub desired_temperature: f64,
    pub is_above_threshold: bool,
}

/// Demands of one scheduler cycle, keyed by physical zone id.
///
/// Built fresh every cycle and consumed by [`SharedZoneArbiter::resolve`].
#[derive(Debug, Clone, Default)]
pub struct DemandTable {
    demands: BTreeMap<u8, Vec<ZoneDemand>>,
}

impl DemandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a demand; insertion order is the tie-break order
    pub fn record(&mut self, zone: u8, demand: ZoneDemand) {
        self.demands.entry(zone).or_default().push(demand);
    }

    pub fn is_empty(&self) -> bool {
        self.demands.values().all(Vec::is_empty)
    }

    pub fn get(&self, zone: u8) -> &[ZoneDemand] {
        self.demands.get(&zone).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn zones(&self) -> impl Iterator<Item = u8> + '_ {
        self.demands.keys().copied()
    }
}

/// Pick the winning demand, or `None` when there are no demands
pub fn select_demand(demands: &[ZoneDemand]) -> Option<&ZoneDemand> {
    let mut hot: Option<&ZoneDemand> = None;
    let mut lowest: Option<&ZoneDemand> = None;

    for demand in demands {
        if demand.is_above_threshold
            && hot.map_or(true, |h| demand.desired_level > h.desired_level)
        {
            hot = Some(demand);
        }
        if lowest.map_or(true, |l| demand.desired_level < l.desired_level) {
            lowest = Some(demand);
        }
    }

    hot.or(lowest)
}

/// Tracks the level applied to every shared physical zone
#[derive(Debug, Clone, Default)]
pub struct SharedZoneArbiter {
    applied: BTreeMap<u8, u8>,
}

impl SharedZoneArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve one cycle of demands.
    ///
    /// Every zone in the table is attempted even if an earlier one fails; the
    /// first error is returned after all zones were processed. Returns the
    /// `(zone, level)` pairs that were sent.
    pub fn resolve(
        &mut self,
        table: DemandTable,
        control: &dyn FanLevelControl,
    ) -> Result<Vec<(u8, u8)>> {
        let mut sent = Vec::new();
        let mut first_error: Option<ZonefanError> = None;

        for (zone, demands) in &table.demands {
            let Some(selected) = select_demand(demands) else {
                continue;
            };
            debug!(
                "IPMI zone {}: {} demand(s), selected {} at {}%",
                zone,
                demands.len(),
                selected.controller_name,
                selected.desired_level
            );
            if self.applied.get(zone) == Some(&selected.desired_level) {
                continue;
            }

            match control.set_level(*zone, selected.desired_level) {
                Ok(()) => {
                    self.applied.insert(*zone, selected.desired_level);
                    info!(
                        "IPMI zone {}: new fan level > {}%/{:.1}C ({})",
                        zone, selected.desired_level, selected.desired_temperature, selected.controller_name
                    );
                    sent.push((*zone, selected.desired_level));
                }
                Err(e) => {
                    warn!("IPMI zone {}: could not apply {}%: {}", zone, selected.desired_level, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }

    /// Level currently applied to `zone` by arbitration, if any
    pub fn applied_level(&self, zone: u8) -> Option<u8> {
        self.applied.get(&zone).copied()
    }

    /// Forget the applied level of `zone`, e.g. after someone else wrote it
    pub fn invalidate(&mut self, zone: u8) {
        self.applied.remove(&zone);
    }
}
