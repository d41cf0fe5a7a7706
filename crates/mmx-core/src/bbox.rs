use serde::{Deserialize, Serialize};

use crate::errors::{MmxError, Result};
use crate::presence::PresencePoints;

/// Axis-aligned extent in the spatial reference `epsg`.
///
/// A single point yields a zero-area box (`ulx == lrx`, `uly == lry`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub ulx: f64,
    pub uly: f64,
    pub lrx: f64,
    pub lry: f64,
    pub epsg: i32,
}

impl BoundingBox {
    /// Points are taken as-is; the caller guarantees they share `epsg`.
    pub fn from_points(points: &[(f64, f64)], epsg: i32) -> Result<Self> {
        let (first, rest) = points
            .split_first()
            .ok_or_else(|| MmxError::invalid_input("a bounding box needs at least one point"))?;
        let mut bbox = BoundingBox {
            ulx: first.0,
            uly: first.1,
            lrx: first.0,
            lry: first.1,
            epsg,
        };
        for (idx, &(x, y)) in points.iter().enumerate() {
            if !x.is_finite() || !y.is_finite() {
                return Err(MmxError::invalid_input(format!(
                    "point {} has a non-finite coordinate ({}, {})",
                    idx, x, y
                )));
            }
        }
        for &(x, y) in rest {
            bbox.ulx = bbox.ulx.min(x);
            bbox.lrx = bbox.lrx.max(x);
            bbox.uly = bbox.uly.max(y);
            bbox.lry = bbox.lry.min(y);
        }
        Ok(bbox)
    }

    pub fn from_presence(points: &PresencePoints) -> Result<Self> {
        Self::from_points(&points.points, points.epsg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encloses_all_points() {
        let pts = vec![(10.0, 20.0), (-3.5, 4.0), (7.0, 31.25), (2.0, -1.0)];
        let bbox = BoundingBox::from_points(&pts, 4326).expect("bbox");
        assert_eq!(bbox.ulx, -3.5);
        assert_eq!(bbox.lrx, 10.0);
        assert_eq!(bbox.uly, 31.25);
        assert_eq!(bbox.lry, -1.0);
        assert_eq!(bbox.epsg, 4326);
        for (x, y) in pts {
            assert!(bbox.ulx <= x && x <= bbox.lrx);
            assert!(bbox.lry <= y && y <= bbox.uly);
        }
    }

    #[test]
    fn single_point_is_zero_area() {
        let bbox = BoundingBox::from_points(&[(306099.6, 4802508.4)], 26912).expect("bbox");
        assert_eq!(bbox.ulx, bbox.lrx);
        assert_eq!(bbox.uly, bbox.lry);
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = BoundingBox::from_points(&[], 4326).expect_err("empty must fail");
        assert!(matches!(err, MmxError::InvalidInput(_)), "{}", err);
    }

    #[test]
    fn non_finite_coordinates_are_rejected() {
        let err = BoundingBox::from_points(&[(0.0, 0.0), (f64::NAN, 1.0)], 4326)
            .expect_err("nan must fail");
        assert!(matches!(err, MmxError::InvalidInput(_)));
    }

    #[test]
    fn ordering_holds_for_many_shapes() {
        let shapes: Vec<Vec<(f64, f64)>> = vec![
            vec![(1.0, 1.0), (1.0, 1.0)],
            vec![(-180.0, -90.0), (180.0, 90.0)],
            vec![(5.0, -2.0), (4.0, -3.0), (6.0, -1.0)],
        ];
        for pts in shapes {
            let bbox = BoundingBox::from_points(&pts, 4326).expect("bbox");
            assert!(bbox.ulx <= bbox.lrx);
            assert!(bbox.uly >= bbox.lry);
        }
    }
}
