//! Rule evaluation for a single (vehicle, geofence) pair
//!
//! Given the previous pair state and the result of the current containment
//! test, decide the transition, update the state and append the resulting
//! events. Direction filtering happens only at emission time and never
//! changes what is tracked.

use crate::{Geofence, GeofenceEvent, LocationSample, PairState};

/// Transition of a pair caused by one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// outside → inside
    Entered,
    /// inside → outside
    Exited,
    /// inside → inside
    Stayed,
    /// outside → outside
    Outside,
}

impl Transition {
    #[inline]
    pub fn between(was_inside: bool, is_inside: bool) -> Self {
        match (was_inside, is_inside) {
            (false, true) => Transition::Entered,
            (true, false) => Transition::Exited,
            (true, true) => Transition::Stayed,
            (false, false) => Transition::Outside,
        }
    }
}

/// Seconds between two epoch-millisecond timestamps
#[inline]
pub(crate) fn elapsed_seconds(since: i64, now: i64) -> f64 {
    now.saturating_sub(since) as f64 / 1000.0
}

/// Apply one containment result to `pair` and collect the events it produces
pub(crate) fn apply(
    fence: &Geofence,
    pair: &mut PairState,
    inside: bool,
    sample: &LocationSample,
    events: &mut Vec<GeofenceEvent>,
) -> Transition {
    let rules = fence.rules();
    let now = sample.timestamp;
    let transition = Transition::between(pair.inside, inside);

    match transition {
        Transition::Entered => {
            pair.enter(now);
            tracing::debug!(vehicle = %sample.vehicle_id, fence = fence.id(), at = now, "enter");
            if rules.direction.allows_enter() {
                events.push(GeofenceEvent::Enter {
                    vehicle_id: sample.vehicle_id.clone(),
                    geofence_id: fence.id().to_string(),
                    at: now,
                });
            }
        }
        Transition::Exited => {
            let dwell_seconds = pair.entered_at.map(|since| elapsed_seconds(since, now));
            pair.reset();
            tracing::debug!(vehicle = %sample.vehicle_id, fence = fence.id(), at = now, "exit");
            if rules.direction.allows_exit() {
                events.push(GeofenceEvent::Exit {
                    vehicle_id: sample.vehicle_id.clone(),
                    geofence_id: fence.id().to_string(),
                    at: now,
                    dwell_seconds,
                });
            }
        }
        Transition::Stayed => {
            if let (Some(threshold), Some(since), false) =
                (rules.dwell_seconds, pair.entered_at, pair.dwell_reported)
            {
                let elapsed = elapsed_seconds(since, now);
                if elapsed >= threshold {
                    pair.dwell_reported = true;
                    events.push(GeofenceEvent::Dwell {
                        vehicle_id: sample.vehicle_id.clone(),
                        geofence_id: fence.id().to_string(),
                        at: now,
                        dwell_seconds: elapsed,
                    });
                }
            }

            let over_limit = rules
                .speed_limit
                .zip(sample.speed_kph)
                .filter(|(limit, speed)| speed > limit);
            if let Some((limit, speed)) = over_limit {
                events.push(GeofenceEvent::Speed {
                    vehicle_id: sample.vehicle_id.clone(),
                    geofence_id: fence.id().to_string(),
                    at: now,
                    speed,
                    limit,
                });
            }
        }
        Transition::Outside => {}
    }

    transition
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Direction, RuleSet};

    fn fence(rules: RuleSet) -> Geofence {
        Geofence::circle("f", 0.0, 0.0, 100.0).with_rules(rules)
    }

    fn sample(at: i64, speed: Option<f64>) -> LocationSample {
        LocationSample {
            vehicle_id: "v".into(),
            lat: 0.0,
            lng: 0.0,
            speed_kph: speed,
            timestamp: at,
        }
    }

    #[test]
    fn test_transition_table() {
        assert_eq!(Transition::between(false, true), Transition::Entered);
        assert_eq!(Transition::between(true, false), Transition::Exited);
        assert_eq!(Transition::between(true, true), Transition::Stayed);
        assert_eq!(Transition::between(false, false), Transition::Outside);
    }

    #[test]
    fn test_elapsed_seconds() {
        assert_eq!(elapsed_seconds(0, 60_000), 60.0);
        assert_eq!(elapsed_seconds(1_000, 1_500), 0.5);
    }

    #[test]
    fn test_enter_then_exit() {
        let fence = fence(RuleSet::default());
        let mut pair = PairState::default();
        let mut events = Vec::new();

        assert_eq!(
            apply(&fence, &mut pair, true, &sample(1_000, None), &mut events),
            Transition::Entered
        );
        assert_eq!(pair.entered_at, Some(1_000));

        assert_eq!(
            apply(&fence, &mut pair, false, &sample(31_000, None), &mut events),
            Transition::Exited
        );
        assert_eq!(pair, PairState::default());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].type_name(), "GEOFENCE_ENTER");
        assert_eq!(events[1].dwell_seconds(), Some(30.0));
    }

    #[test]
    fn test_exit_without_entry_time() {
        let fence = fence(RuleSet::default());
        let mut pair = PairState {
            inside: true,
            entered_at: None,
            dwell_reported: false,
        };
        let mut events = Vec::new();
        apply(&fence, &mut pair, false, &sample(5, None), &mut events);
        assert!(matches!(
            events[0],
            GeofenceEvent::Exit {
                dwell_seconds: None,
                ..
            }
        ));
    }

    #[test]
    fn test_outside_is_silent() {
        let fence = fence(RuleSet {
            speed_limit: Some(10.0),
            ..Default::default()
        });
        let mut pair = PairState::default();
        let mut events = Vec::new();
        let t = apply(&fence, &mut pair, false, &sample(0, Some(99.0)), &mut events);
        assert_eq!(t, Transition::Outside);
        assert!(events.is_empty());
        assert_eq!(pair, PairState::default());
    }

    #[test]
    fn test_dwell_latches() {
        let fence = fence(RuleSet {
            dwell_seconds: Some(30.0),
            ..Default::default()
        });
        let mut pair = PairState::default();
        let mut events = Vec::new();

        apply(&fence, &mut pair, true, &sample(0, None), &mut events);
        apply(&fence, &mut pair, true, &sample(20_000, None), &mut events);
        assert_eq!(events.len(), 1);

        apply(&fence, &mut pair, true, &sample(30_000, None), &mut events);
        assert!(pair.dwell_reported);
        assert_eq!(events[1].dwell_seconds(), Some(30.0));

        apply(&fence, &mut pair, true, &sample(90_000, None), &mut events);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_speed_needs_a_speed() {
        let fence = fence(RuleSet {
            speed_limit: Some(50.0),
            ..Default::default()
        });
        let mut pair = PairState::default();
        pair.enter(0);
        let mut events = Vec::new();

        apply(&fence, &mut pair, true, &sample(1, None), &mut events);
        apply(&fence, &mut pair, true, &sample(2, Some(50.0)), &mut events);
        assert!(events.is_empty());

        apply(&fence, &mut pair, true, &sample(3, Some(50.1)), &mut events);
        assert!(matches!(
            events[0],
            GeofenceEvent::Speed { speed, limit, .. } if speed == 50.1 && limit == 50.0
        ));
    }

    #[test]
    fn test_direction_only_gates_emission() {
        let fence = fence(RuleSet {
            direction: Direction::Enter,
            dwell_seconds: Some(0.0),
            ..Default::default()
        });
        let mut pair = PairState::default();
        let mut events = Vec::new();

        apply(&fence, &mut pair, true, &sample(0, None), &mut events);
        apply(&fence, &mut pair, true, &sample(1_000, None), &mut events);
        apply(&fence, &mut pair, false, &sample(2_000, None), &mut events);

        let kinds: Vec<&str> = events.iter().map(|e| e.type_name()).collect();
        assert_eq!(kinds, vec!["GEOFENCE_ENTER", "GEOFENCE_DWELL"]);
        // The suppressed exit still resets the pair
        assert_eq!(pair, PairState::default());
    }
}
