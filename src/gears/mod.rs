//! Gear selection
//!
//! Speed banding over three boundaries (1<->2, 2<->3, 3<->4) with a
//! hysteresis margin on both sides of each boundary. Inside the margin the
//! engaged gear is kept, which is what stops hunting when speed hovers near a
//! boundary. Heavy throttle pushes every boundary up (kickdown).
//!
//! Park, Reverse and Neutral are driven by the shift lever only; the forward
//! ladder is automatic while the lever is in Drive.

use tracing::debug;

use crate::config::{ConfigError, GearsConfig};
use crate::types::{GearState, SensorSnapshot, ShiftLever};

/// Number of forward-gear boundaries
pub const BOUNDARY_COUNT: usize = 3;

/// A validated shift table
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftTable {
    profile: String,
    boundaries: [f64; BOUNDARY_COUNT],
    hysteresis: f64,
    kickdown_throttle: f64,
    kickdown_offset: f64,
}

impl ShiftTable {
    /// Build the active profile's table, rejecting tables that cannot band
    /// speed unambiguously.
    pub fn from_config(config: &GearsConfig) -> Result<Self, ConfigError> {
        let profile = config.active_profile()?;
        let name = config.profile.clone();
        let b = profile.boundaries_kmh;
        let m = profile.hysteresis_kmh;

        for &value in &b {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidBoundary { profile: name, value });
            }
        }
        for pair in b.windows(2) {
            if pair[1] <= pair[0] {
                return Err(ConfigError::NonMonotonicBands {
                    profile: name,
                    lower: pair[0],
                    upper: pair[1],
                });
            }
        }
        if !m.is_finite() || m < 0.0 {
            return Err(ConfigError::InvalidHysteresis { profile: name, value: m });
        }
        for pair in b.windows(2) {
            if pair[0] + m >= pair[1] - m {
                return Err(ConfigError::OverlappingHysteresis {
                    profile: name,
                    lower: pair[0],
                    upper: pair[1],
                });
            }
        }

        let kt = config.kickdown_throttle;
        if !(kt.is_finite() && kt > 0.0 && kt < 1.0) {
            return Err(ConfigError::InvalidKickdown(format!(
                "kickdown_throttle {kt} must be strictly between 0 and 1"
            )));
        }
        let offset = config.kickdown_offset_kmh;
        if !(offset.is_finite() && offset >= 0.0) {
            return Err(ConfigError::InvalidKickdown(format!(
                "kickdown_offset_kmh {offset} must be finite and non-negative"
            )));
        }

        Ok(Self {
            profile: name,
            boundaries: b,
            hysteresis: m,
            kickdown_throttle: kt,
            kickdown_offset: offset,
        })
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn boundaries(&self) -> [f64; BOUNDARY_COUNT] {
        self.boundaries
    }

    pub fn hysteresis(&self) -> f64 {
        self.hysteresis
    }

    /// Boundaries after the throttle bias. The shift is uniform so ordering holds.
    pub fn effective_boundaries(&self, throttle: f64) -> [f64; BOUNDARY_COUNT] {
        let shift = if throttle > self.kickdown_throttle {
            self.kickdown_offset * ((throttle - self.kickdown_throttle) / (1.0 - self.kickdown_throttle))
        } else {
            0.0
        };
        self.boundaries.map(|b| b + shift)
    }

    /// Lowest gear the speed has clearly passed: counts boundaries exceeded by
    /// more than the margin.
    fn up_band(&self, speed: f64, throttle: f64) -> u8 {
        let m = self.hysteresis;
        1 + self
            .effective_boundaries(throttle)
            .iter()
            .filter(|&&b| speed > b + m)
            .count() as u8
    }

    /// Highest gear the speed still supports: counts boundaries not yet
    /// undercut by more than the margin.
    fn down_band(&self, speed: f64, throttle: f64) -> u8 {
        let m = self.hysteresis;
        1 + self
            .effective_boundaries(throttle)
            .iter()
            .filter(|&&b| speed >= b - m)
            .count() as u8
    }
}

/// Deterministic gear state machine over a [`ShiftTable`]
#[derive(Debug, Clone)]
pub struct GearSelector {
    table: ShiftTable,
}

impl GearSelector {
    pub fn new(table: ShiftTable) -> Self {
        Self { table }
    }

    pub fn from_config(config: &GearsConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(ShiftTable::from_config(config)?))
    }

    pub fn table(&self) -> &ShiftTable {
        &self.table
    }

    /// Forward-ladder arbitration.
    ///
    /// Park, Reverse and Neutral are returned unchanged; only the lever moves
    /// the transmission out of them (see [`GearSelector::next`]).
    pub fn select(&self, current: GearState, speed_kmh: f64, throttle: f64) -> GearState {
        let Some(g) = current.forward_number() else {
            return current;
        };
        let up = self.table.up_band(speed_kmh, throttle);
        let down = self.table.down_band(speed_kmh, throttle);
        let target = if g < up {
            up
        } else if g > down {
            down
        } else {
            g
        };
        GearState::from_forward_number(target).unwrap_or(current)
    }

    /// Full transition for one snapshot, lever first
    pub fn next(&self, current: GearState, snapshot: &SensorSnapshot) -> GearState {
        let next = match snapshot.lever() {
            ShiftLever::Park => GearState::Park,
            ShiftLever::Reverse => GearState::Reverse,
            ShiftLever::Neutral => GearState::Neutral,
            ShiftLever::Drive if !current.is_forward() => {
                let band = self.table.up_band(snapshot.speed_kmh(), snapshot.throttle());
                GearState::from_forward_number(band).unwrap_or(GearState::Gear1)
            }
            ShiftLever::Drive => self.select(current, snapshot.speed_kmh(), snapshot.throttle()),
        };
        if next != current {
            debug!(
                from = %current,
                to = %next,
                speed = snapshot.speed_kmh(),
                throttle = snapshot.throttle(),
                lever = %snapshot.lever(),
                "gear transition"
            );
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShiftProfileConfig;
    use std::time::Duration;

    fn selector() -> GearSelector {
        GearSelector::from_config(&GearsConfig::default()).unwrap()
    }

    fn snapshot(speed: f64, throttle: f64, lever: ShiftLever) -> SensorSnapshot {
        SensorSnapshot::new(throttle, speed, 2000.0, 90.0, 80.0, Duration::ZERO)
            .unwrap()
            .with_lever(lever)
    }

    #[test]
    fn test_low_speed_stays_in_first() {
        assert_eq!(selector().select(GearState::Gear1, 10.0, 0.2), GearState::Gear1);
    }

    #[test]
    fn test_clear_upshift_from_second() {
        assert_eq!(selector().select(GearState::Gear2, 50.0, 0.1), GearState::Gear3);
    }

    #[test]
    fn test_hysteresis_retains_gear_near_boundary() {
        let s = selector();
        // 1<->2 boundary is 17.5 with a 2.5 margin
        for speed in [15.0, 16.0, 17.5, 19.0, 20.0] {
            assert_eq!(s.select(GearState::Gear1, speed, 0.1), GearState::Gear1, "speed {speed}");
            assert_eq!(s.select(GearState::Gear2, speed, 0.1), GearState::Gear2, "speed {speed}");
        }
        assert_eq!(s.select(GearState::Gear1, 20.1, 0.1), GearState::Gear2);
        assert_eq!(s.select(GearState::Gear2, 14.9, 0.1), GearState::Gear1);
    }

    #[test]
    fn test_hovering_speed_does_not_hunt() {
        let s = selector();
        let mut gear = GearState::Gear2;
        for speed in [36.0, 38.5, 35.5, 39.9, 37.5, 36.1] {
            gear = s.select(gear, speed, 0.2);
            assert_eq!(gear, GearState::Gear2);
        }
        gear = s.select(gear, 40.5, 0.2);
        assert_eq!(gear, GearState::Gear3);
        for speed in [39.0, 35.0, 37.5] {
            gear = s.select(gear, speed, 0.2);
            assert_eq!(gear, GearState::Gear3);
        }
    }

    #[test]
    fn test_jumps_multiple_gears() {
        let s = selector();
        assert_eq!(s.select(GearState::Gear1, 90.0, 0.2), GearState::Gear4);
        assert_eq!(s.select(GearState::Gear4, 5.0, 0.0), GearState::Gear1);
    }

    #[test]
    fn test_select_is_deterministic() {
        let s = selector();
        for speed in (0..140).map(|v| v as f64 * 0.75) {
            for gear in [GearState::Gear1, GearState::Gear2, GearState::Gear3, GearState::Gear4] {
                let first = s.select(gear, speed, 0.5);
                assert_eq!(s.select(gear, speed, 0.5), first);
            }
        }
    }

    #[test]
    fn test_select_leaves_non_forward_states() {
        let s = selector();
        for state in [GearState::Park, GearState::Reverse, GearState::Neutral] {
            assert_eq!(s.select(state, 80.0, 0.5), state);
        }
    }

    #[test]
    fn test_kickdown_delays_upshift() {
        let s = selector();
        // Light throttle: 43 km/h clears 37.5 + 2.5
        assert_eq!(s.select(GearState::Gear2, 43.0, 0.5), GearState::Gear3);
        // Full throttle raises every boundary by the full 15 km/h offset
        assert_eq!(s.select(GearState::Gear2, 43.0, 1.0), GearState::Gear2);
        assert_eq!(s.table().effective_boundaries(1.0), [32.5, 52.5, 77.5]);
        assert_eq!(s.table().effective_boundaries(0.8), [17.5, 37.5, 62.5]);
    }

    #[test]
    fn test_kickdown_forces_downshift() {
        let s = selector();
        assert_eq!(s.select(GearState::Gear3, 45.0, 0.3), GearState::Gear3);
        // With the 2<->3 boundary at 52.5, 45 km/h is below its window
        assert_eq!(s.select(GearState::Gear3, 45.0, 1.0), GearState::Gear2);
    }

    #[test]
    fn test_lever_drives_non_forward_states() {
        let s = selector();
        assert_eq!(s.next(GearState::Gear3, &snapshot(40.0, 0.2, ShiftLever::Neutral)), GearState::Neutral);
        assert_eq!(s.next(GearState::Gear1, &snapshot(0.0, 0.0, ShiftLever::Park)), GearState::Park);
        assert_eq!(s.next(GearState::Park, &snapshot(0.0, 0.0, ShiftLever::Reverse)), GearState::Reverse);
        assert_eq!(s.next(GearState::Park, &snapshot(0.0, 0.1, ShiftLever::Drive)), GearState::Gear1);
        // Rolling in neutral then selecting drive picks the band for the speed
        assert_eq!(s.next(GearState::Neutral, &snapshot(45.0, 0.1, ShiftLever::Drive)), GearState::Gear3);
        assert_eq!(s.next(GearState::Gear2, &snapshot(50.0, 0.1, ShiftLever::Drive)), GearState::Gear3);
    }

    #[test]
    fn test_sport_profile_holds_gears_longer() {
        let config = GearsConfig {
            profile: "sport".into(),
            ..GearsConfig::default()
        };
        let sport = GearSelector::from_config(&config).unwrap();
        assert_eq!(sport.table().profile(), "sport");
        assert_eq!(sport.select(GearState::Gear2, 43.0, 0.2), GearState::Gear2);
        assert_eq!(selector().select(GearState::Gear2, 43.0, 0.2), GearState::Gear3);
    }

    fn with_profile(boundaries_kmh: [f64; 3], hysteresis_kmh: f64) -> GearsConfig {
        let mut config = GearsConfig::default();
        config
            .profiles
            .insert("normal".into(), ShiftProfileConfig { boundaries_kmh, hysteresis_kmh });
        config
    }

    #[test]
    fn test_invalid_tables_rejected() {
        assert!(matches!(
            ShiftTable::from_config(&with_profile([20.0, 20.0, 60.0], 1.0)),
            Err(ConfigError::NonMonotonicBands { .. })
        ));
        assert!(matches!(
            ShiftTable::from_config(&with_profile([-1.0, 20.0, 60.0], 1.0)),
            Err(ConfigError::InvalidBoundary { .. })
        ));
        assert!(matches!(
            ShiftTable::from_config(&with_profile([f64::NAN, 20.0, 60.0], 1.0)),
            Err(ConfigError::InvalidBoundary { .. })
        ));
        assert!(matches!(
            ShiftTable::from_config(&with_profile([10.0, 20.0, 60.0], -0.5)),
            Err(ConfigError::InvalidHysteresis { .. })
        ));
        assert!(matches!(
            ShiftTable::from_config(&with_profile([10.0, 20.0, 60.0], 5.0)),
            Err(ConfigError::OverlappingHysteresis { .. })
        ));
        ShiftTable::from_config(&with_profile([10.0, 20.0, 60.0], 4.9)).unwrap();
    }

    #[test]
    fn test_invalid_kickdown_rejected() {
        let config = GearsConfig {
            kickdown_throttle: 1.0,
            ..GearsConfig::default()
        };
        assert!(matches!(ShiftTable::from_config(&config), Err(ConfigError::InvalidKickdown(_))));
        let config = GearsConfig {
            kickdown_offset_kmh: f64::INFINITY,
            ..GearsConfig::default()
        };
        assert!(matches!(ShiftTable::from_config(&config), Err(ConfigError::InvalidKickdown(_))));
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let config = GearsConfig {
            profile: "eco".into(),
            ..GearsConfig::default()
        };
        assert!(matches!(GearSelector::from_config(&config), Err(ConfigError::UnknownProfile { .. })));
    }
}
