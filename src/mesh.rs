//! Kamlet mesh topology.
//!
//! The synchronization network connects each kamlet directly to up to 8
//! neighbors (4 cardinal + 4 diagonal). Each direction doubles as the name
//! of the aggregation region that reports through it: a message arriving
//! from the north-east link carries the partial result for the entire
//! north-east quadrant, a message from the north link carries the result
//! for the column segment north of this node, and so on.

/// The eight sync-network directions.
///
/// Coordinates grow east (x) and south (y); row 0 is the northernmost row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    North = 0,
    South = 1,
    East = 2,
    West = 3,
    NorthEast = 4,
    NorthWest = 5,
    SouthEast = 6,
    SouthWest = 7,
}

/// All directions, in index order.
pub const ALL_DIRECTIONS: [Direction; 8] = [
    Direction::North,
    Direction::South,
    Direction::East,
    Direction::West,
    Direction::NorthEast,
    Direction::NorthWest,
    Direction::SouthEast,
    Direction::SouthWest,
];

impl Direction {
    /// (dx, dy) offset of the neighbor in this direction.
    pub fn delta(self) -> (i8, i8) {
        match self {
            Direction::North => (0, -1),
            Direction::South => (0, 1),
            Direction::East => (1, 0),
            Direction::West => (-1, 0),
            Direction::NorthEast => (1, -1),
            Direction::NorthWest => (-1, -1),
            Direction::SouthEast => (1, 1),
            Direction::SouthWest => (-1, 1),
        }
    }

    /// The diametrically opposite direction.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
            Direction::NorthEast => Direction::SouthWest,
            Direction::NorthWest => Direction::SouthEast,
            Direction::SouthEast => Direction::NorthWest,
            Direction::SouthWest => Direction::NorthEast,
        }
    }

    /// True for the four diagonal directions.
    pub fn is_diagonal(self) -> bool {
        matches!(
            self,
            Direction::NorthEast | Direction::NorthWest | Direction::SouthEast | Direction::SouthWest
        )
    }

    /// Regions that must be synced before a value may be forwarded in this
    /// direction.
    ///
    /// A cardinal forward carries the opposite column/row segment; a
    /// diagonal forward carries the opposite quadrant plus the two adjacent
    /// cardinal segments. Waiting on exactly these regions produces the
    /// corner-to-corner wavefront that sweeps partial minimums across the
    /// mesh without any global coordination.
    pub fn prerequisites(self) -> &'static [Direction] {
        match self {
            Direction::North => &[Direction::South],
            Direction::South => &[Direction::North],
            Direction::East => &[Direction::West],
            Direction::West => &[Direction::East],
            Direction::NorthEast => &[Direction::SouthWest, Direction::South, Direction::West],
            Direction::NorthWest => &[Direction::SouthEast, Direction::South, Direction::East],
            Direction::SouthEast => &[Direction::NorthWest, Direction::North, Direction::West],
            Direction::SouthWest => &[Direction::NorthEast, Direction::North, Direction::East],
        }
    }

    /// Array index for per-direction state tables.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Rectangular kamlet grid dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshTopology {
    pub cols: u8,
    pub rows: u8,
}

impl MeshTopology {
    pub fn new(cols: u8, rows: u8) -> Self {
        debug_assert!(cols > 0 && rows > 0);
        Self { cols, rows }
    }

    /// Total node count.
    pub fn len(&self) -> usize {
        self.cols as usize * self.rows as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, x: i16, y: i16) -> bool {
        x >= 0 && y >= 0 && x < self.cols as i16 && y < self.rows as i16
    }

    /// Coordinates of the neighbor of (x, y) in `dir`, if it exists.
    pub fn neighbor(&self, x: u8, y: u8, dir: Direction) -> Option<(u8, u8)> {
        let (dx, dy) = dir.delta();
        let nx = x as i16 + dx as i16;
        let ny = y as i16 + dy as i16;
        if self.contains(nx, ny) {
            Some((nx as u8, ny as u8))
        } else {
            None
        }
    }

    /// Whether a neighbor exists in `dir`.
    ///
    /// For this rectangular grid a neighbor exists exactly when the
    /// corresponding aggregation region is non-empty, so this predicate is
    /// also the "region exists" test.
    pub fn has_neighbor(&self, x: u8, y: u8, dir: Direction) -> bool {
        self.neighbor(x, y, dir).is_some()
    }

    /// Flat index for storing per-node state: `x * rows + y`.
    pub fn index(&self, x: u8, y: u8) -> usize {
        x as usize * self.rows as usize + y as usize
    }

    /// Inverse of [`MeshTopology::index`].
    pub fn coords(&self, index: usize) -> (u8, u8) {
        ((index / self.rows as usize) as u8, (index % self.rows as usize) as u8)
    }
}
