//! # Trajectory Analytics
//!
//! Single-pass reducers over trackpoints grouped by activity and ordered by time.
//!
//! Every reducer implements [`ActivityReducer`]. A [`GroupedRun`] feeds it a
//! stream of `(activity, trackpoint)` pairs and calls `begin_activity` /
//! `end_activity` at each activity boundary, so per-activity state never leaks
//! from one activity into the next. The stream must already be grouped by
//! activity and sorted by time; [`sort_grouped`] does that for pooled input,
//! and [`TrajectoryStore::for_each_trackpoint`] delivers it that way.
//!
//! | Reducer | Output |
//! |---------|--------|
//! | [`DistanceReducer`] | Total great-circle distance in km |
//! | [`AltitudeGainReducer`] | Top users by cumulative altitude gain |
//! | [`TemporalAnomalyReducer`] | Invalid (gapped) activity count per user |
//! | [`RegionMembershipReducer`] | Users with an activity inside a region |
//!
//! ## Example
//!
//! ```rust
//! use geolife_tracks::analytics::{reduce_points, DistanceReducer};
//!
//! let total_km = reduce_points(DistanceReducer::new(), Vec::new());
//! assert_eq!(total_km, 0.0);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Duration;
use log::info;
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::config::AnalyticsConfig;
use crate::error::Result;
use crate::geo_utils::{haversine_km, RegionBox};
use crate::store::{ActivityFilter, ActivityKey, TrajectoryStore};
use crate::Trackpoint;

// ============================================================================
// Driver
// ============================================================================

/// A reducer over one activity at a time.
pub trait ActivityReducer {
    type Output;

    /// Start a new activity. Any per-activity state must be reset here.
    fn begin_activity(&mut self, key: &ActivityKey);

    fn push(&mut self, point: &Trackpoint);

    /// Whether further points of the current activity can still change the result.
    fn wants_more(&self) -> bool {
        true
    }

    fn end_activity(&mut self);

    fn finish(self) -> Self::Output;
}

/// Feeds a grouped, time-ordered stream into a reducer.
pub struct GroupedRun<R> {
    reducer: R,
    current: Option<i64>,
    activities: usize,
    points: usize,
}

impl<R: ActivityReducer> GroupedRun<R> {
    pub fn new(reducer: R) -> Self {
        Self {
            reducer,
            current: None,
            activities: 0,
            points: 0,
        }
    }

    pub fn feed(&mut self, key: &ActivityKey, point: &Trackpoint) {
        if self.current != Some(key.activity_id) {
            if self.current.is_some() {
                self.reducer.end_activity();
            }
            self.reducer.begin_activity(key);
            self.current = Some(key.activity_id);
            self.activities += 1;
        }
        self.points += 1;
        if self.reducer.wants_more() {
            self.reducer.push(point);
        }
    }

    pub fn activities(&self) -> usize {
        self.activities
    }

    pub fn points(&self) -> usize {
        self.points
    }

    pub fn finish(mut self) -> R::Output {
        if self.current.is_some() {
            self.reducer.end_activity();
        }
        self.reducer.finish()
    }
}

/// Run a reducer over an in-memory stream that is already grouped and ordered.
pub fn reduce_points<R, I>(reducer: R, points: I) -> R::Output
where
    R: ActivityReducer,
    I: IntoIterator<Item = (ActivityKey, Trackpoint)>,
{
    let mut run = GroupedRun::new(reducer);
    for (key, point) in points {
        run.feed(&key, &point);
    }
    run.finish()
}

/// Run a reducer over the store's trackpoints of the activities matching `filter`.
pub fn reduce_store<R, S>(store: &S, filter: &ActivityFilter, reducer: R) -> Result<R::Output>
where
    R: ActivityReducer,
    S: TrajectoryStore + ?Sized,
{
    let mut run = GroupedRun::new(reducer);
    store.for_each_trackpoint(filter, &mut |key, point| {
        run.feed(key, point);
        Ok(())
    })?;
    info!(
        "[Analytics] Reduced {} trackpoints over {} activities",
        run.points(),
        run.activities()
    );
    Ok(run.finish())
}

/// Stable sort of a pooled stream by (activity, timestamp).
///
/// Points with equal timestamps keep their relative order.
pub fn sort_grouped(points: &mut [(ActivityKey, Trackpoint)]) {
    points.sort_by_key(|(key, point)| (key.activity_id, point.date_time));
}

// ============================================================================
// Distance
// ============================================================================

/// Sums great-circle distance between consecutive points within each activity.
#[derive(Debug, Default)]
pub struct DistanceReducer {
    total_km: f64,
    prev: Option<Trackpoint>,
}

impl DistanceReducer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActivityReducer for DistanceReducer {
    type Output = f64;

    fn begin_activity(&mut self, _key: &ActivityKey) {
        self.prev = None;
    }

    fn push(&mut self, point: &Trackpoint) {
        if let Some(prev) = &self.prev {
            self.total_km += haversine_km(prev, point);
        }
        self.prev = Some(*point);
    }

    fn end_activity(&mut self) {
        self.prev = None;
    }

    fn finish(self) -> f64 {
        self.total_km
    }
}

/// Total distance in km travelled in the activities matching `filter`.
pub fn total_distance_km<S>(store: &S, filter: &ActivityFilter) -> Result<f64>
where
    S: TrajectoryStore + ?Sized,
{
    reduce_store(store, filter, DistanceReducer::new())
}

// ============================================================================
// Altitude gain
// ============================================================================

/// A user's cumulative altitude gain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAltitudeGain {
    pub user_id: String,
    pub gain_feet: i64,
    /// `round(gain_feet * 0.3048)`
    pub gain_meters: i64,
}

/// Thresholds for the altitude-gain computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AltitudeRules {
    pub min_altitude: i32,
    pub max_altitude: i32,
    pub max_step: i32,
}

impl AltitudeRules {
    pub fn from_config(config: &AnalyticsConfig) -> Self {
        Self {
            min_altitude: config.min_altitude,
            max_altitude: config.max_altitude,
            max_step: config.max_altitude_step,
        }
    }

    #[inline]
    pub fn in_range(&self, altitude: i32) -> bool {
        altitude >= self.min_altitude && altitude <= self.max_altitude
    }

    /// Gain contributed by moving from `prev` to `next`.
    #[inline]
    pub fn step_gain(&self, prev: i32, next: i32) -> i64 {
        let diff = next as i64 - prev as i64;
        if diff > 0 && diff < self.max_step as i64 {
            diff
        } else {
            0
        }
    }

    /// Gain of one activity's altitude sequence, ignoring out-of-range values.
    pub fn activity_gain(&self, points: &[Trackpoint]) -> i64 {
        let mut prev: Option<i32> = None;
        let mut gain = 0;
        for altitude in points.iter().map(|p| p.altitude).filter(|a| self.in_range(*a)) {
            if let Some(p) = prev {
                gain += self.step_gain(p, altitude);
            }
            prev = Some(altitude);
        }
        gain
    }
}

impl Default for AltitudeRules {
    fn default() -> Self {
        Self::from_config(&AnalyticsConfig::default())
    }
}

/// Accumulates per-user altitude gain and ranks the top users.
#[derive(Debug)]
pub struct AltitudeGainReducer {
    rules: AltitudeRules,
    top_n: usize,
    feet_to_meters: f64,
    totals: HashMap<String, i64>,
    current_user: Option<String>,
    prev_altitude: Option<i32>,
    activity_gain: i64,
}

impl AltitudeGainReducer {
    pub fn new(config: &AnalyticsConfig) -> Self {
        Self {
            rules: AltitudeRules::from_config(config),
            top_n: config.top_n,
            feet_to_meters: config.feet_to_meters,
            totals: HashMap::new(),
            current_user: None,
            prev_altitude: None,
            activity_gain: 0,
        }
    }
}

impl ActivityReducer for AltitudeGainReducer {
    type Output = Vec<UserAltitudeGain>;

    fn begin_activity(&mut self, key: &ActivityKey) {
        self.current_user = Some(key.user_id.clone());
        self.prev_altitude = None;
        self.activity_gain = 0;
    }

    fn push(&mut self, point: &Trackpoint) {
        if !self.rules.in_range(point.altitude) {
            return;
        }
        if let Some(prev) = self.prev_altitude {
            self.activity_gain += self.rules.step_gain(prev, point.altitude);
        }
        self.prev_altitude = Some(point.altitude);
    }

    fn end_activity(&mut self) {
        if self.activity_gain > 0 {
            if let Some(user) = self.current_user.take() {
                *self.totals.entry(user).or_insert(0) += self.activity_gain;
            }
        }
        self.current_user = None;
        self.activity_gain = 0;
    }

    fn finish(self) -> Self::Output {
        rank_gains(self.totals, self.top_n, self.feet_to_meters)
    }
}

/// Top `top_n` users by gain, descending; ties ordered by user id.
pub fn rank_gains(
    totals: HashMap<String, i64>,
    top_n: usize,
    feet_to_meters: f64,
) -> Vec<UserAltitudeGain> {
    let mut ranked: Vec<(String, i64)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(top_n);
    ranked
        .into_iter()
        .map(|(user_id, gain_feet)| UserAltitudeGain {
            user_id,
            gain_feet,
            gain_meters: (gain_feet as f64 * feet_to_meters).round() as i64,
        })
        .collect()
}

/// Top users by altitude gain across all stored activities.
pub fn top_altitude_gain<S>(store: &S, config: &AnalyticsConfig) -> Result<Vec<UserAltitudeGain>>
where
    S: TrajectoryStore + ?Sized,
{
    reduce_store(store, &ActivityFilter::all(), AltitudeGainReducer::new(config))
}

// ============================================================================
// Temporal anomalies
// ============================================================================

/// Counts, per user, the activities containing a gap of at least `max_gap`
/// between consecutive points.
#[derive(Debug)]
pub struct TemporalAnomalyReducer {
    max_gap: Duration,
    counts: BTreeMap<String, usize>,
    current_user: Option<String>,
    prev_time: Option<chrono::NaiveDateTime>,
    invalid: bool,
}

impl TemporalAnomalyReducer {
    pub fn new(max_gap: Duration) -> Self {
        Self {
            max_gap,
            counts: BTreeMap::new(),
            current_user: None,
            prev_time: None,
            invalid: false,
        }
    }
}

impl ActivityReducer for TemporalAnomalyReducer {
    type Output = BTreeMap<String, usize>;

    fn begin_activity(&mut self, key: &ActivityKey) {
        self.current_user = Some(key.user_id.clone());
        self.prev_time = None;
        self.invalid = false;
    }

    fn push(&mut self, point: &Trackpoint) {
        if let Some(prev) = self.prev_time {
            if point.date_time - prev >= self.max_gap {
                self.invalid = true;
            }
        }
        self.prev_time = Some(point.date_time);
    }

    fn wants_more(&self) -> bool {
        !self.invalid
    }

    fn end_activity(&mut self) {
        if self.invalid {
            if let Some(user) = self.current_user.take() {
                *self.counts.entry(user).or_insert(0) += 1;
            }
        }
        self.invalid = false;
    }

    fn finish(self) -> Self::Output {
        self.counts
    }
}

/// Invalid activity count per user over the whole store.
pub fn invalid_activities_per_user<S>(
    store: &S,
    config: &AnalyticsConfig,
) -> Result<BTreeMap<String, usize>>
where
    S: TrajectoryStore + ?Sized,
{
    reduce_store(
        store,
        &ActivityFilter::all(),
        TemporalAnomalyReducer::new(config.max_gap()?),
    )
}

// ============================================================================
// Region membership
// ============================================================================

/// Collects users with at least one activity having a point inside a region.
#[derive(Debug)]
pub struct RegionMembershipReducer {
    region: RegionBox,
    users: BTreeSet<String>,
    current_user: Option<String>,
    matched: bool,
}

impl RegionMembershipReducer {
    pub fn new(region: RegionBox) -> Self {
        Self {
            region,
            users: BTreeSet::new(),
            current_user: None,
            matched: false,
        }
    }
}

impl ActivityReducer for RegionMembershipReducer {
    type Output = BTreeSet<String>;

    fn begin_activity(&mut self, key: &ActivityKey) {
        self.matched = self.users.contains(&key.user_id);
        self.current_user = Some(key.user_id.clone());
    }

    fn push(&mut self, point: &Trackpoint) {
        if self.region.contains(point.lat, point.lon) {
            self.matched = true;
            if let Some(user) = self.current_user.take() {
                self.users.insert(user);
            }
        }
    }

    // A user already known to have visited gains nothing from more points
    fn wants_more(&self) -> bool {
        !self.matched
    }

    fn end_activity(&mut self) {
        self.current_user = None;
        self.matched = false;
    }

    fn finish(self) -> Self::Output {
        self.users
    }
}

/// Users who recorded at least one point inside `region`.
pub fn users_in_region<S>(store: &S, region: RegionBox) -> Result<BTreeSet<String>>
where
    S: TrajectoryStore + ?Sized,
{
    reduce_store(store, &ActivityFilter::all(), RegionMembershipReducer::new(region))
}

// ============================================================================
// Parallel per-activity reduction
// ============================================================================

/// One activity's points, for reductions over in-memory activity groups.
#[derive(Debug, Clone)]
pub struct ActivityTrack {
    pub key: ActivityKey,
    pub points: Vec<Trackpoint>,
}

/// Total distance over independent activity groups, summed in parallel.
#[cfg(feature = "parallel")]
pub fn distance_km_parallel(tracks: &[ActivityTrack]) -> f64 {
    tracks
        .par_iter()
        .map(|t| crate::geo_utils::track_length_km(&t.points))
        .sum()
}

/// Altitude-gain ranking over independent activity groups.
///
/// Each activity's gain is computed in parallel; positive gains are then
/// merged per user, which gives the same result as [`AltitudeGainReducer`].
#[cfg(feature = "parallel")]
pub fn altitude_gain_parallel(
    tracks: &[ActivityTrack],
    config: &AnalyticsConfig,
) -> Vec<UserAltitudeGain> {
    let rules = AltitudeRules::from_config(config);
    let totals = tracks
        .par_iter()
        .map(|t| (t.key.user_id.as_str(), rules.activity_gain(&t.points)))
        .filter(|(_, gain)| *gain > 0)
        .fold(HashMap::new, |mut acc: HashMap<String, i64>, (user, gain)| {
            *acc.entry(user.to_string()).or_insert(0) += gain;
            acc
        })
        .reduce(HashMap::new, |mut a, b| {
            for (user, gain) in b {
                *a.entry(user).or_insert(0) += gain;
            }
            a
        });
    rank_gains(totals, config.top_n, config.feet_to_meters)
}
