//! Fixed geometry of the localization problem.
//!
//! The world is the set of anchors ranged against by the tag and the bounding volume a tag
//! can physically occupy. The horizontal extent is the axis-aligned box spanned by the anchor
//! coordinates. Anchors are usually mounted at similar heights, so the vertical extent is taken
//! from a configured z-range when one is given and from the anchor heights otherwise.
//!
//! Inside the bounds, an optional [`OccupancyGrid`] marks horizontal cells the tag cannot
//! occupy (walls, furniture). A position is *free* when it is in bounds and not in a blocked
//! cell.
//!
//! All functions here are pure over the configuration data; the only randomness is injected
//! through the `rng` argument of [`World::random_free_position`].

use std::collections::{BTreeMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::Position;
use crate::error::ConfigError;

/// Opaque short anchor identifier, e.g. the last four hex digits of the device id.
pub type AnchorId = String;

/// Upper bound on rejection draws in [`World::random_free_position`].
const MAX_REJECTION_ATTEMPTS: usize = 1_000;

/// A fixed-position UWB device the tag ranges against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: AnchorId,
    pub position: Position,
}
impl Anchor {
    pub fn new(id: impl Into<AnchorId>, x: f64, y: f64, z: f64) -> Anchor {
        Anchor {
            id: id.into(),
            position: Position::new(x, y, z),
        }
    }
}

/// Whether ranges are compared in the horizontal plane or in full 3D.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum DistanceMode {
    /// Euclidean distance over x and y only.
    Planar,
    /// Euclidean distance over x, y and z.
    #[default]
    Spatial,
}

/// Axis-aligned bounding volume of valid tag positions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min: Position,
    pub max: Position,
}
impl Bounds {
    /// Inclusive containment test on all three axes.
    pub fn contains(&self, p: &Position) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }
    pub fn center(&self) -> Position {
        (self.min + self.max) * 0.5
    }
    pub fn extent(&self) -> Position {
        self.max - self.min
    }
    /// Length of the box diagonal.
    pub fn diagonal(&self) -> f64 {
        self.extent().norm()
    }
}

/// Horizontal occupancy map laid over the world bounds.
///
/// Rows are stored top first: row 0 covers the largest y, as the map is drawn. Column 0 and the
/// last row start at the lower corner of the bounds. Points outside the grid are not blocked.
#[derive(Clone, Debug, PartialEq)]
pub struct OccupancyGrid {
    cell_size: f64,
    columns: usize,
    rows: usize,
    blocked: Vec<bool>,
}

impl OccupancyGrid {
    /// Parse a text map, one string per row: `.` is free, `#` is blocked.
    ///
    /// # Errors
    /// [`ConfigError`] for a non-positive cell size, an empty or ragged map, or an unknown cell
    /// character.
    pub fn from_rows<S: AsRef<str>>(
        cell_size: f64,
        rows: &[S],
    ) -> Result<OccupancyGrid, ConfigError> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(ConfigError::InvalidCellSize(cell_size));
        }
        let columns = rows.first().map_or(0, |r| r.as_ref().chars().count());
        if columns == 0 {
            return Err(ConfigError::EmptyOccupancyGrid);
        }
        let mut blocked = Vec::with_capacity(columns * rows.len());
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.chars().count() != columns {
                return Err(ConfigError::RaggedOccupancyGrid(i));
            }
            for c in row.chars() {
                match c {
                    '.' => blocked.push(false),
                    '#' => blocked.push(true),
                    other => return Err(ConfigError::InvalidOccupancyCell(other)),
                }
            }
        }
        Ok(OccupancyGrid {
            cell_size,
            columns,
            rows: rows.len(),
            blocked,
        })
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// `(columns, rows)`.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.columns, self.rows)
    }

    /// Cell holding the horizontal offset `(dx, dy)` from the grid origin, as `(column, row)`.
    fn cell(&self, dx: f64, dy: f64) -> Option<(usize, usize)> {
        if !(dx >= 0.0 && dy >= 0.0) {
            return None;
        }
        let column = (dx / self.cell_size).floor() as usize;
        let from_bottom = (dy / self.cell_size).floor() as usize;
        (column < self.columns && from_bottom < self.rows)
            .then(|| (column, self.rows - 1 - from_bottom))
    }

    /// Whether the offset `(dx, dy)` from the grid origin lies in a blocked cell.
    pub fn is_blocked(&self, dx: f64, dy: f64) -> bool {
        self.cell(dx, dy)
            .is_some_and(|(column, row)| self.blocked[row * self.columns + column])
    }

    /// Offset of the lower corner of the first free cell overlapping an `extent_x` by
    /// `extent_y` area, searched bottom row first.
    fn first_free_corner(&self, extent_x: f64, extent_y: f64) -> Option<(f64, f64)> {
        (0..self.rows)
            .flat_map(|from_bottom| (0..self.columns).map(move |column| (column, from_bottom)))
            .map(|(column, from_bottom)| {
                (column as f64 * self.cell_size, from_bottom as f64 * self.cell_size)
            })
            .find(|&(dx, dy)| dx <= extent_x && dy <= extent_y && !self.is_blocked(dx, dy))
    }

    /// Whether the grid spans at least `extent_x` by `extent_y`.
    fn covers(&self, extent_x: f64, extent_y: f64) -> bool {
        self.columns as f64 * self.cell_size > extent_x
            && self.rows as f64 * self.cell_size > extent_y
    }
}

/// Anchor set plus the feasible volume derived from it.
#[derive(Clone, Debug)]
pub struct World {
    anchors: Vec<Anchor>,
    bounds: Bounds,
    distance_mode: DistanceMode,
    occupancy: Option<OccupancyGrid>,
}

impl World {
    /// Build the world model from the configured anchors.
    ///
    /// # Arguments
    /// * `anchors` - Anchor identifiers and positions. Must be non-empty with unique identifiers.
    /// * `z_range` - Optional `(min, max)` height range of the tag. When `None` the anchor
    ///   heights bound the volume.
    /// * `distance_mode` - 2D or 3D distance.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for an empty or malformed anchor set, or an inverted z-range.
    pub fn new(
        anchors: Vec<Anchor>,
        z_range: Option<(f64, f64)>,
        distance_mode: DistanceMode,
    ) -> Result<World, ConfigError> {
        if anchors.is_empty() {
            return Err(ConfigError::NoAnchors);
        }
        let mut seen = HashSet::with_capacity(anchors.len());
        for anchor in &anchors {
            if !seen.insert(anchor.id.as_str()) {
                return Err(ConfigError::DuplicateAnchor(anchor.id.clone()));
            }
            if !anchor.position.iter().all(|c| c.is_finite()) {
                return Err(ConfigError::NonFiniteAnchor(anchor.id.clone()));
            }
        }
        let mut min = anchors[0].position;
        let mut max = anchors[0].position;
        for anchor in &anchors[1..] {
            min = min.inf(&anchor.position);
            max = max.sup(&anchor.position);
        }
        if let Some((z_min, z_max)) = z_range {
            if !(z_min.is_finite() && z_max.is_finite()) || z_min > z_max {
                return Err(ConfigError::InvalidZRange(z_min, z_max));
            }
            min.z = z_min;
            max.z = z_max;
        }
        Ok(World {
            anchors,
            bounds: Bounds { min, max },
            distance_mode,
            occupancy: None,
        })
    }

    /// Lay an occupancy grid over the world, its origin at the lower corner of the bounds.
    ///
    /// # Errors
    /// [`ConfigError::NoFreeSpace`] when the grid blocks the whole horizontal extent.
    pub fn with_occupancy(mut self, grid: OccupancyGrid) -> Result<World, ConfigError> {
        let extent = self.bounds.extent();
        if grid.covers(extent.x, extent.y) && grid.first_free_corner(extent.x, extent.y).is_none() {
            return Err(ConfigError::NoFreeSpace);
        }
        self.occupancy = Some(grid);
        Ok(self)
    }

    pub fn occupancy(&self) -> Option<&OccupancyGrid> {
        self.occupancy.as_ref()
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    /// Look up an anchor by identifier.
    pub fn anchor(&self, id: &str) -> Option<&Anchor> {
        self.anchors.iter().find(|a| a.id == id)
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn distance_mode(&self) -> DistanceMode {
        self.distance_mode
    }

    /// Euclidean distance, 2D or 3D depending on the configured [`DistanceMode`].
    pub fn distance(&self, a: &Position, b: &Position) -> f64 {
        match self.distance_mode {
            DistanceMode::Planar => ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt(),
            DistanceMode::Spatial => (a - b).norm(),
        }
    }

    pub fn is_in_bounds(&self, p: &Position) -> bool {
        self.bounds.contains(p)
    }

    /// Whether a tag could be at `p`: in bounds and outside every blocked cell.
    pub fn is_free(&self, p: &Position) -> bool {
        self.is_in_bounds(p)
            && self.occupancy.as_ref().is_none_or(|grid| {
                !grid.is_blocked(p.x - self.bounds.min.x, p.y - self.bounds.min.y)
            })
    }

    /// Uniform draw inside the bounding volume.
    pub fn random_position<R: Rng + ?Sized>(&self, rng: &mut R) -> Position {
        let Bounds { min, max } = self.bounds;
        Position::new(
            rng.random_range(min.x..=max.x),
            rng.random_range(min.y..=max.y),
            rng.random_range(min.z..=max.z),
        )
    }

    /// Uniform draw of a free position, by rejection. Callable any number of times.
    ///
    /// When every draw lands in a blocked cell the lower corner of the first free cell is
    /// returned instead.
    pub fn random_free_position<R: Rng + ?Sized>(&self, rng: &mut R) -> Position {
        for _ in 0..MAX_REJECTION_ATTEMPTS {
            let p = self.random_position(rng);
            if self.is_free(&p) {
                return p;
            }
        }
        let Bounds { min, .. } = self.bounds;
        let extent = self.bounds.extent();
        let center = self.bounds.center();
        self.occupancy
            .as_ref()
            .and_then(|grid| grid.first_free_corner(extent.x, extent.y))
            .map_or(center, |(dx, dy)| Position::new(min.x + dx, min.y + dy, center.z))
    }

    /// Exact distance from `p` to every anchor, keyed by anchor identifier.
    pub fn distances_to_all_anchors(&self, p: &Position) -> BTreeMap<AnchorId, f64> {
        self.anchors
            .iter()
            .map(|a| (a.id.clone(), self.distance(p, &a.position)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn square_world(z_range: Option<(f64, f64)>) -> World {
        World::new(
            vec![
                Anchor::new("A0", 0.0, 0.0, 0.0),
                Anchor::new("A1", 1000.0, 0.0, 0.0),
                Anchor::new("A2", 1000.0, 1000.0, 0.0),
                Anchor::new("A3", 0.0, 1000.0, 0.0),
            ],
            z_range,
            DistanceMode::Spatial,
        )
        .unwrap()
    }

    #[test]
    fn bounds_follow_anchors_and_z_range() {
        let world = square_world(Some((30.0, 150.0)));
        let bounds = world.bounds();
        assert_eq!(bounds.min, Position::new(0.0, 0.0, 30.0));
        assert_eq!(bounds.max, Position::new(1000.0, 1000.0, 150.0));

        let flat = square_world(None);
        assert_eq!(flat.bounds().min.z, 0.0);
        assert_eq!(flat.bounds().max.z, 0.0);
    }

    #[test]
    fn empty_anchor_set_is_rejected() {
        let result = World::new(vec![], None, DistanceMode::Spatial);
        assert_eq!(result.unwrap_err(), ConfigError::NoAnchors);
    }

    #[test]
    fn duplicate_anchor_is_rejected() {
        let result = World::new(
            vec![Anchor::new("A", 0.0, 0.0, 0.0), Anchor::new("A", 1.0, 0.0, 0.0)],
            None,
            DistanceMode::Spatial,
        );
        assert_eq!(result.unwrap_err(), ConfigError::DuplicateAnchor("A".into()));
    }

    #[test]
    fn inverted_z_range_is_rejected() {
        let result = World::new(
            vec![Anchor::new("A", 0.0, 0.0, 0.0)],
            Some((10.0, 5.0)),
            DistanceMode::Spatial,
        );
        assert!(matches!(result, Err(ConfigError::InvalidZRange(_, _))));
    }

    #[test]
    fn non_finite_anchor_is_rejected() {
        let result = World::new(
            vec![Anchor::new("A", f64::NAN, 0.0, 0.0)],
            None,
            DistanceMode::Spatial,
        );
        assert!(matches!(result, Err(ConfigError::NonFiniteAnchor(_))));
    }

    #[test]
    fn distance_modes() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 12.0);
        assert_approx_eq!(square_world(None).distance(&a, &b), 13.0, 1e-12);

        let planar = World::new(
            vec![Anchor::new("A", 0.0, 0.0, 0.0)],
            None,
            DistanceMode::Planar,
        )
        .unwrap();
        assert_approx_eq!(planar.distance(&a, &b), 5.0, 1e-12);
    }

    #[test]
    fn out_of_z_range_is_not_in_bounds() {
        let world = square_world(Some((30.0, 150.0)));
        assert!(world.is_in_bounds(&Position::new(500.0, 500.0, 100.0)));
        assert!(!world.is_in_bounds(&Position::new(500.0, 500.0, 151.0)));
        assert!(!world.is_in_bounds(&Position::new(500.0, 500.0, 29.0)));
        assert!(!world.is_in_bounds(&Position::new(-1.0, 500.0, 100.0)));
    }

    #[test]
    fn random_free_positions_stay_in_bounds() {
        let world = square_world(Some((30.0, 150.0)));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5_000 {
            let p = world.random_free_position(&mut rng);
            assert!(world.is_in_bounds(&p), "{p:?} escaped the bounds");
        }
    }

    #[test]
    fn distances_to_every_anchor() {
        let world = square_world(None);
        let p = Position::new(900.0, 100.0, 0.0);
        let all = world.distances_to_all_anchors(&p);
        assert_eq!(all.len(), 4);
        assert_approx_eq!(all["A0"], (900.0f64.powi(2) + 100.0f64.powi(2)).sqrt(), 1e-9);
        assert_approx_eq!(all["A1"], (2.0f64 * 100.0 * 100.0).sqrt(), 1e-9);
    }

    // 1000 x 1000 square split into 250-unit cells; the left half is blocked.
    fn half_blocked_world() -> World {
        let grid = OccupancyGrid::from_rows(250.0, &["##..", "##..", "##..", "##.."]).unwrap();
        square_world(Some((30.0, 150.0))).with_occupancy(grid).unwrap()
    }

    #[test]
    fn blocked_cells_are_not_free() {
        let world = half_blocked_world();
        let blocked = Position::new(100.0, 900.0, 100.0);
        let open = Position::new(900.0, 100.0, 100.0);
        assert!(world.is_in_bounds(&blocked));
        assert!(!world.is_free(&blocked));
        assert!(world.is_free(&open));
        // out of bounds stays infeasible even over a free cell
        assert!(!world.is_free(&Position::new(900.0, 100.0, 200.0)));
    }

    #[test]
    fn rows_are_read_top_first() {
        let grid = OccupancyGrid::from_rows(10.0, &["#.", ".."]).unwrap();
        assert_eq!(grid.dimensions(), (2, 2));
        assert!(grid.is_blocked(5.0, 15.0));
        assert!(!grid.is_blocked(5.0, 5.0));
        assert!(!grid.is_blocked(15.0, 15.0));
        assert!(!grid.is_blocked(-1.0, 15.0));
        assert!(!grid.is_blocked(5.0, 25.0));
    }

    #[test]
    fn random_free_positions_avoid_blocked_cells() {
        let world = half_blocked_world();
        let mut rng = StdRng::seed_from_u64(9);
        let mut rejected = 0;
        for _ in 0..5_000 {
            if !world.is_free(&world.random_position(&mut rng)) {
                rejected += 1;
            }
            let p = world.random_free_position(&mut rng);
            assert!(world.is_free(&p), "{p:?} is blocked");
            assert!(p.x >= 500.0);
        }
        assert!(rejected > 1_000, "only {rejected} draws rejected");
    }

    #[test]
    fn sliver_of_free_space_is_found() {
        let grid = OccupancyGrid::from_rows(100.0, &["##########"; 9]).unwrap();
        let mut rows = vec!["##########"; 9];
        rows.push("#########.");
        let sliver = OccupancyGrid::from_rows(100.0, rows.as_slice()).unwrap();
        let world = square_world(None).with_occupancy(sliver).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..10 {
            assert!(world.is_free(&world.random_free_position(&mut rng)));
        }
        // nine blocked rows leave the top of the square uncovered
        assert!(square_world(None).with_occupancy(grid).is_ok());
    }

    #[test]
    fn fully_blocked_grid_is_rejected() {
        let grid = OccupancyGrid::from_rows(500.0, &["###", "###", "###"]).unwrap();
        assert_eq!(
            square_world(None).with_occupancy(grid).unwrap_err(),
            ConfigError::NoFreeSpace
        );
    }

    #[test]
    fn malformed_grids_are_rejected() {
        assert_eq!(
            OccupancyGrid::from_rows(0.0, &[".."]).unwrap_err(),
            ConfigError::InvalidCellSize(0.0)
        );
        assert_eq!(
            OccupancyGrid::from_rows::<&str>(1.0, &[]).unwrap_err(),
            ConfigError::EmptyOccupancyGrid
        );
        assert_eq!(
            OccupancyGrid::from_rows(1.0, &["..", "."]).unwrap_err(),
            ConfigError::RaggedOccupancyGrid(1)
        );
        assert_eq!(
            OccupancyGrid::from_rows(1.0, &[".x"]).unwrap_err(),
            ConfigError::InvalidOccupancyCell('x')
        );
    }
}
