//! Pixel bounding boxes for detected regions.

/// Inclusive pixel bounds of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AABB {
    pub min_row: usize,
    pub min_col: usize,
    pub max_row: usize,
    pub max_col: usize,
}

impl AABB {
    /// An empty box; the first [`AABB::expand_to_include`] makes it valid.
    pub fn new() -> Self {
        Self {
            min_row: usize::MAX,
            min_col: usize::MAX,
            max_row: 0,
            max_col: 0,
        }
    }

    pub fn from_coords(min_row: usize, min_col: usize, max_row: usize, max_col: usize) -> Self {
        Self {
            min_row,
            min_col,
            max_row,
            max_col,
        }
    }

    pub fn expand_to_include(&mut self, row: usize, col: usize) {
        self.min_row = self.min_row.min(row);
        self.min_col = self.min_col.min(col);
        self.max_row = self.max_row.max(row);
        self.max_col = self.max_col.max(col);
    }
}

impl Default for AABB {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand() {
        let mut bbox = AABB::new();
        bbox.expand_to_include(5, 7);
        assert_eq!(bbox, AABB::from_coords(5, 7, 5, 7));

        bbox.expand_to_include(2, 9);
        assert_eq!(bbox, AABB::from_coords(2, 7, 5, 9));
    }
}
