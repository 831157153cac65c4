//! Planar primitives for lines and zones.
//!
//! Coordinates are whatever the configuration uses (normalized in practice);
//! nothing here assumes a unit square.

use serde::{Deserialize, Serialize};

use crate::frame::Bbox;

const EPS: f64 = 1e-12;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Point { x, y }
    }
}

/// `(a - o) x (b - o)`.
pub fn cross(o: Point, a: Point, b: Point) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn sign(value: f64) -> i8 {
    if value > EPS {
        1
    } else if value < -EPS {
        -1
    } else {
        0
    }
}

fn on_segment(p: Point, q: Point, r: Point) -> bool {
    q.x <= p.x.max(r.x) + EPS
        && q.x >= p.x.min(r.x) - EPS
        && q.y <= p.y.max(r.y) + EPS
        && q.y >= p.y.min(r.y) - EPS
}

/// Closed-segment intersection; touching endpoints and collinear overlap count.
pub fn segments_intersect(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let d1 = sign(cross(q1, q2, p1));
    let d2 = sign(cross(q1, q2, p2));
    let d3 = sign(cross(p1, p2, q1));
    let d4 = sign(cross(p1, p2, q2));

    if d1 * d2 < 0 && d3 * d4 < 0 {
        return true;
    }
    (d1 == 0 && on_segment(q1, p1, q2))
        || (d2 == 0 && on_segment(q1, p2, q2))
        || (d3 == 0 && on_segment(p1, q1, p2))
        || (d4 == 0 && on_segment(p1, q2, p2))
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub start: Point,
    pub end: Point,
}

impl Segment {
    pub fn new(start: Point, end: Point) -> Option<Self> {
        if start.distance(&end) <= EPS {
            return None;
        }
        Some(Self { start, end })
    }

    /// Signed side of `p`: +1 left of start->end, -1 right, 0 on the line.
    pub fn side(&self, p: Point) -> i8 {
        sign(cross(self.start, self.end, p))
    }

    pub fn crossed_by(&self, from: Point, to: Point) -> bool {
        segments_intersect(from, to, self.start, self.end)
    }
}

/// Axis-aligned zone given by two corners.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoxZone {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoxZone {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Interval overlap on both axes. Any overlap counts, not only full containment.
    pub fn overlaps(&self, bbox: &Bbox) -> bool {
        bbox.l <= self.x2
            && bbox.right() >= self.x1
            && bbox.t <= self.y2
            && bbox.bottom() >= self.y1
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Polygon {
    points: Vec<Point>,
}

impl Polygon {
    /// Validate a configured polygon: at least three vertices, non-zero area and
    /// no self-intersection. The closing vertex may be repeated.
    pub fn new(mut points: Vec<Point>) -> Result<Self, String> {
        if points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        if points.len() < 3 {
            return Err(format!("polygon has {} vertices, need at least 3", points.len()));
        }
        let area = signed_area(&points);
        if area.abs() <= EPS {
            return Err("polygon has zero area".to_string());
        }
        let n = points.len();
        for i in 0..n {
            let (a1, a2) = (points[i], points[(i + 1) % n]);
            for j in (i + 1)..n {
                let adjacent = j == i + 1 || (i == 0 && j == n - 1);
                if adjacent {
                    continue;
                }
                let (b1, b2) = (points[j], points[(j + 1) % n]);
                if segments_intersect(a1, a2, b1, b2) {
                    return Err(format!("polygon edges {} and {} intersect", i, j));
                }
            }
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.points.len();
        (0..n).map(move |i| (self.points[i], self.points[(i + 1) % n]))
    }

    /// Even-odd ray casting.
    pub fn contains(&self, p: Point) -> bool {
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > p.y) != (b.y > p.y) {
                let x_at = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if p.x < x_at {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// The bbox is treated as a quadrilateral; any shared area or touching edge counts.
    pub fn intersects_bbox(&self, bbox: &Bbox) -> bool {
        let quad: Vec<Point> = bbox.corners().iter().map(|c| Point::from(*c)).collect();
        for (a1, a2) in self.edges() {
            for i in 0..quad.len() {
                if segments_intersect(a1, a2, quad[i], quad[(i + 1) % quad.len()]) {
                    return true;
                }
            }
        }
        if quad.iter().any(|corner| self.contains(*corner)) {
            return true;
        }
        let bx = BoxZone::new(bbox.l, bbox.t, bbox.right(), bbox.bottom());
        self.points
            .iter()
            .any(|p| p.x >= bx.x1 && p.x <= bx.x2 && p.y >= bx.y1 && p.y <= bx.y2)
    }
}

fn signed_area(points: &[Point]) -> f64 {
    let n = points.len();
    (0..n)
        .map(|i| {
            let (a, b) = (points[i], points[(i + 1) % n]);
            a.x * b.y - b.x * a.y
        })
        .sum::<f64>()
        / 2.0
}

#[derive(Clone, Debug, PartialEq)]
pub enum ZoneShape {
    Box(BoxZone),
    Polygon(Polygon),
}

impl ZoneShape {
    pub fn overlaps(&self, bbox: &Bbox) -> bool {
        match self {
            ZoneShape::Box(zone) => zone.overlaps(bbox),
            ZoneShape::Polygon(polygon) => polygon.intersects_bbox(bbox),
        }
    }
}
