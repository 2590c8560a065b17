use thiserror::Error;

/// Errors raised while constructing or validating a compartment layout.
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("mask length {got} does not match {width}x{height} grid")]
    MaskSizeMismatch {
        width: usize,
        height: usize,
        got: usize,
    },

    #[error("compartment '{id}' contains no cells")]
    EmptyCompartment { id: String },

    #[error("neighbour array '{axis}' has length {got}, expected {expected}")]
    NeighbourLengthMismatch {
        axis: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("cell {cell} has out-of-range {axis} neighbour {neighbour} (n_cells = {n_cells})")]
    NeighbourOutOfRange {
        cell: usize,
        axis: &'static str,
        neighbour: usize,
        n_cells: usize,
    },

    #[error("cell point array has length {got}, expected {expected} or 0")]
    CellPointLengthMismatch { got: usize, expected: usize },
}

/// Spatial layout of one compartment: an unordered set of grid cells with
/// precomputed 6-neighbour stencils.
///
/// Cells are plain indices into the compartment's flat cell array; a cell at
/// a no-flux boundary stores its own index as the neighbour on that side,
/// which makes the discrete Laplacian zero-flux there with no special-casing.
/// Two-dimensional layouts set both z neighbours to the cell itself, so the
/// 6-point stencil degenerates to the 4-point one.
#[derive(Debug, Clone, PartialEq)]
pub struct CompartmentLayout {
    pub id: String,
    pub up_x: Vec<usize>,
    pub dn_x: Vec<usize>,
    pub up_y: Vec<usize>,
    pub dn_y: Vec<usize>,
    pub up_z: Vec<usize>,
    pub dn_z: Vec<usize>,
    /// Per-cell pixel coordinates, used only for diagnostic images.
    /// May be empty if no diagnostics are wanted.
    pub cell_points: Vec<(u32, u32)>,
}

impl CompartmentLayout {
    /// Builds a 2-d layout from a row-major boolean pixel mask.
    ///
    /// Cells are created for every `true` pixel, in row-major order.
    /// Neighbours outside the mask (or outside the rectangle) become
    /// self-references, i.e. zero-flux boundaries.
    pub fn from_mask(
        id: impl Into<String>,
        width: usize,
        height: usize,
        mask: &[bool],
    ) -> Result<Self, LayoutError> {
        let id = id.into();
        if mask.len() != width * height {
            return Err(LayoutError::MaskSizeMismatch {
                width,
                height,
                got: mask.len(),
            });
        }

        // pixel index -> cell index
        let mut cell_of_pixel = vec![usize::MAX; mask.len()];
        let mut cell_points = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let p = y * width + x;
                if mask[p] {
                    cell_of_pixel[p] = cell_points.len();
                    cell_points.push((x as u32, y as u32));
                }
            }
        }
        let n_cells = cell_points.len();
        if n_cells == 0 {
            return Err(LayoutError::EmptyCompartment { id });
        }

        let neighbour = |cell: usize, dx: isize, dy: isize| -> usize {
            let (x, y) = cell_points[cell];
            let (nx, ny) = (x as isize + dx, y as isize + dy);
            if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
                return cell;
            }
            let p = ny as usize * width + nx as usize;
            if mask[p] {
                cell_of_pixel[p]
            } else {
                cell
            }
        };

        let mut up_x = Vec::with_capacity(n_cells);
        let mut dn_x = Vec::with_capacity(n_cells);
        let mut up_y = Vec::with_capacity(n_cells);
        let mut dn_y = Vec::with_capacity(n_cells);
        for cell in 0..n_cells {
            up_x.push(neighbour(cell, 1, 0));
            dn_x.push(neighbour(cell, -1, 0));
            up_y.push(neighbour(cell, 0, 1));
            dn_y.push(neighbour(cell, 0, -1));
        }
        let up_z: Vec<usize> = (0..n_cells).collect();
        let dn_z = up_z.clone();

        Ok(CompartmentLayout {
            id,
            up_x,
            dn_x,
            up_y,
            dn_y,
            up_z,
            dn_z,
            cell_points,
        })
    }

    /// Builds a full `width` x `height` rectangle with zero-flux borders.
    pub fn rectangle(
        id: impl Into<String>,
        width: usize,
        height: usize,
    ) -> Result<Self, LayoutError> {
        let mask = vec![true; width * height];
        Self::from_mask(id, width, height, &mask)
    }

    pub fn n_cells(&self) -> usize {
        self.up_x.len()
    }

    /// Checks internal consistency: all six neighbour arrays have one entry
    /// per cell and every neighbour index is in range.
    pub fn validate(&self) -> Result<(), LayoutError> {
        let n_cells = self.n_cells();
        if n_cells == 0 {
            return Err(LayoutError::EmptyCompartment {
                id: self.id.clone(),
            });
        }
        let axes: [(&'static str, &[usize]); 6] = [
            ("up_x", &self.up_x),
            ("dn_x", &self.dn_x),
            ("up_y", &self.up_y),
            ("dn_y", &self.dn_y),
            ("up_z", &self.up_z),
            ("dn_z", &self.dn_z),
        ];
        for (axis, indices) in axes {
            if indices.len() != n_cells {
                return Err(LayoutError::NeighbourLengthMismatch {
                    axis,
                    got: indices.len(),
                    expected: n_cells,
                });
            }
            for (cell, &neighbour) in indices.iter().enumerate() {
                if neighbour >= n_cells {
                    return Err(LayoutError::NeighbourOutOfRange {
                        cell,
                        axis,
                        neighbour,
                        n_cells,
                    });
                }
            }
        }
        if !self.cell_points.is_empty() && self.cell_points.len() != n_cells {
            return Err(LayoutError::CellPointLengthMismatch {
                got: self.cell_points.len(),
                expected: n_cells,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangle_stencil_has_self_references_at_borders() {
        let layout = CompartmentLayout::rectangle("c", 3, 2).unwrap();
        assert_eq!(layout.n_cells(), 6);
        // cell 0 is (0,0): left and down are boundaries
        assert_eq!(layout.dn_x[0], 0);
        assert_eq!(layout.dn_y[0], 0);
        assert_eq!(layout.up_x[0], 1);
        assert_eq!(layout.up_y[0], 3);
        // cell 5 is (2,1): right and up are boundaries
        assert_eq!(layout.up_x[5], 5);
        assert_eq!(layout.up_y[5], 5);
        assert_eq!(layout.dn_x[5], 4);
        assert_eq!(layout.dn_y[5], 2);
        // z neighbours are always self in 2-d
        assert_eq!(layout.up_z, vec![0, 1, 2, 3, 4, 5]);
        layout.validate().unwrap();
    }

    #[test]
    fn mask_holes_become_zero_flux_boundaries() {
        // 3x1 strip with the middle pixel missing
        let mask = [true, false, true];
        let layout = CompartmentLayout::from_mask("c", 3, 1, &mask).unwrap();
        assert_eq!(layout.n_cells(), 2);
        // both cells are isolated in x
        assert_eq!(layout.up_x[0], 0);
        assert_eq!(layout.dn_x[1], 1);
        assert_eq!(layout.cell_points, vec![(0, 0), (2, 0)]);
    }

    #[test]
    fn empty_mask_is_rejected() {
        let mask = [false, false];
        let err = CompartmentLayout::from_mask("c", 2, 1, &mask).unwrap_err();
        assert!(matches!(err, LayoutError::EmptyCompartment { .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_neighbour() {
        let mut layout = CompartmentLayout::rectangle("c", 2, 2).unwrap();
        layout.up_x[1] = 17;
        let err = layout.validate().unwrap_err();
        assert!(matches!(err, LayoutError::NeighbourOutOfRange { .. }));
    }
}
